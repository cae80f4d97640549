//! Clock abstraction
//!
//! The MAC engine sees time as a wrapping 32-bit tick counter and a single
//! one-shot alarm. This module handles:
//! - Wrap-safe tick arithmetic
//! - Conversion between ticks and wall-clock units
//! - Clock error margins for receive windows
//! - Interrupt-to-task event handoff (see [`events`])

/// Interrupt handoff queues
pub mod events;

pub use events::{Event, EventChannel, EventReceiver, RadioIrqSender, TimerSender};

/// Default tick rate of the platform timer in Hz
pub const TICKS_PER_SECOND: u32 = 32_768;

/// Point on the monotonic tick timeline.
///
/// The counter wraps at 2^32; comparisons are only meaningful for points
/// less than 2^31 ticks apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Tick(pub u32);

impl Tick {
    /// Tick `ticks` after this one
    pub fn wrapping_add(self, ticks: u32) -> Tick {
        Tick(self.0.wrapping_add(ticks))
    }

    /// Tick `ticks` before this one
    pub fn wrapping_sub(self, ticks: u32) -> Tick {
        Tick(self.0.wrapping_sub(ticks))
    }

    /// Ticks elapsed since `earlier`
    pub fn ticks_since(self, earlier: Tick) -> u32 {
        self.0.wrapping_sub(earlier.0)
    }

    /// Whether this tick lies strictly before `other`
    pub fn is_before(self, other: Tick) -> bool {
        (self.0.wrapping_sub(other.0) as i32) < 0
    }

    /// Whether this tick is `other` or later
    pub fn is_at_or_after(self, other: Tick) -> bool {
        !self.is_before(other)
    }
}

/// Identifies one arming of the alarm.
///
/// An alarm event carrying a token other than the one most recently armed is
/// stale and must be ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TimerToken(pub u16);

impl TimerToken {
    /// Token for the next arming
    pub fn next(self) -> TimerToken {
        TimerToken(self.0.wrapping_add(1))
    }
}

/// Platform clock
pub trait Clock {
    /// Current tick
    fn now(&self) -> Tick;

    /// Arm the one-shot alarm, replacing any armed one.
    ///
    /// When it fires the platform posts [`Event::Timer`] with `token`.
    fn schedule_at(&mut self, at: Tick, token: TimerToken);

    /// Disarm the alarm if it has not fired yet
    fn cancel(&mut self);
}

/// Converts between ticks and time at a given tick rate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TickRate {
    ticks_per_second: u32,
}

impl TickRate {
    /// Tick rate in Hz
    pub const fn new(ticks_per_second: u32) -> Self {
        Self { ticks_per_second }
    }

    /// Ticks in `ms` milliseconds
    pub fn ms_to_ticks(&self, ms: u32) -> u32 {
        (u64::from(ms) * u64::from(self.ticks_per_second) / 1_000) as u32
    }

    /// Ticks covering `us` microseconds, rounded up
    pub fn us_to_ticks(&self, us: u32) -> u32 {
        let ticks = u64::from(us) * u64::from(self.ticks_per_second);
        ticks.div_ceil(1_000_000) as u32
    }

    /// Whole ticks within `us` microseconds, rounded down
    pub fn us_to_ticks_floor(&self, us: u32) -> u32 {
        (u64::from(us) * u64::from(self.ticks_per_second) / 1_000_000) as u32
    }

    /// Microseconds in `ticks`
    pub fn ticks_to_us(&self, ticks: u32) -> u32 {
        (u64::from(ticks) * 1_000_000 / u64::from(self.ticks_per_second)) as u32
    }
}

impl Default for TickRate {
    fn default() -> Self {
        Self::new(TICKS_PER_SECOND)
    }
}

/// Tolerated clock error.
///
/// Receive windows are widened by a margin proportional to the time elapsed
/// since the last synchronization point (the end of the uplink).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ClockError {
    ppm: u32,
}

impl ClockError {
    /// Error bound in parts per million
    pub const fn from_ppm(ppm: u32) -> Self {
        Self { ppm }
    }

    /// Error bound in parts per million
    pub fn ppm(&self) -> u32 {
        self.ppm
    }

    /// Drift in microseconds after `elapsed_us`, rounded up.
    ///
    /// The window opens this much early and stays open this much longer.
    pub fn slack_us(&self, elapsed_us: u32) -> u32 {
        (u64::from(elapsed_us) * u64::from(self.ppm)).div_ceil(1_000_000) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_comparisons_survive_wrap() {
        let before = Tick(u32::MAX - 10);
        let after = before.wrapping_add(20);
        assert_eq!(after, Tick(9));
        assert!(before.is_before(after));
        assert!(after.is_at_or_after(before));
        assert_eq!(after.ticks_since(before), 20);
    }

    #[test]
    fn slack_is_proportional_to_elapsed_time() {
        let error = ClockError::from_ppm(10);
        assert_eq!(error.slack_us(1_000_000), 10);
        assert_eq!(error.slack_us(5_000_000), 50);
        // Any non-zero interval gets at least a microsecond.
        assert_eq!(error.slack_us(1), 1);
        assert_eq!(ClockError::from_ppm(0).slack_us(1_000_000), 0);
    }

    #[test]
    fn tick_conversions() {
        let rate = TickRate::default();
        assert_eq!(rate.ms_to_ticks(1_000), 32_768);
        assert_eq!(rate.us_to_ticks(10), 1);
        assert_eq!(rate.us_to_ticks_floor(10), 0);
        assert_eq!(rate.ticks_to_us(32_768), 1_000_000);
    }
}
