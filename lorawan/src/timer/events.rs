//! Interrupt handoff
//!
//! The radio DIO line and the platform alarm both fire in interrupt context.
//! Each gets its own single-producer/single-consumer queue; the MAC task is
//! the only consumer and drains both in chronological order.
//!
//! ```ignore
//! static mut CHANNEL: EventChannel = EventChannel::new();
//! let (radio_irq, alarm, mut events) = unsafe { CHANNEL.split() };
//! // move `radio_irq` into the DIO1 handler, `alarm` into the timer handler
//! loop {
//!     match device.process(&mut events) { /* ... */ }
//! }
//! ```

use heapless::spsc::{Consumer, Producer, Queue};

use super::{Tick, TimerToken};

/// Queue depth per interrupt source (one slot is kept free by the queue)
const DEPTH: usize = 4;

/// Event raised in interrupt context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Event {
    /// Radio interrupt line asserted; status must be read from the radio
    RadioIrq {
        /// Tick at which the interrupt fired
        at: Tick,
    },
    /// Alarm armed through [`super::Clock::schedule_at`] fired
    Timer {
        /// Token the alarm was armed with
        token: TimerToken,
        /// Tick at which the alarm fired
        at: Tick,
    },
}

impl Event {
    /// Tick at which the event was raised
    pub fn at(&self) -> Tick {
        match self {
            Event::RadioIrq { at } | Event::Timer { at, .. } => *at,
        }
    }
}

/// Backing storage for the two handoff queues
pub struct EventChannel {
    radio: Queue<Tick, DEPTH>,
    timer: Queue<(TimerToken, Tick), DEPTH>,
}

impl EventChannel {
    /// Create empty queues
    pub const fn new() -> Self {
        Self {
            radio: Queue::new(),
            timer: Queue::new(),
        }
    }

    /// Split into the two interrupt-side senders and the task-side receiver
    pub fn split(&mut self) -> (RadioIrqSender<'_>, TimerSender<'_>, EventReceiver<'_>) {
        let (radio_tx, radio_rx) = self.radio.split();
        let (timer_tx, timer_rx) = self.timer.split();
        (
            RadioIrqSender { queue: radio_tx },
            TimerSender { queue: timer_tx },
            EventReceiver {
                radio: radio_rx,
                timer: timer_rx,
            },
        )
    }
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// Producer side owned by the radio interrupt handler
pub struct RadioIrqSender<'a> {
    queue: Producer<'a, Tick, DEPTH>,
}

impl RadioIrqSender<'_> {
    /// Record a radio interrupt; returns the event if the queue is full
    pub fn notify(&mut self, at: Tick) -> Result<(), Event> {
        self.queue.enqueue(at).map_err(|at| Event::RadioIrq { at })
    }
}

/// Producer side owned by the alarm interrupt handler
pub struct TimerSender<'a> {
    queue: Producer<'a, (TimerToken, Tick), DEPTH>,
}

impl TimerSender<'_> {
    /// Record an alarm expiry; returns the event if the queue is full
    pub fn fire(&mut self, token: TimerToken, at: Tick) -> Result<(), Event> {
        self.queue
            .enqueue((token, at))
            .map_err(|(token, at)| Event::Timer { token, at })
    }
}

/// Consumer side owned by the MAC task
pub struct EventReceiver<'a> {
    radio: Consumer<'a, Tick, DEPTH>,
    timer: Consumer<'a, (TimerToken, Tick), DEPTH>,
}

impl EventReceiver<'_> {
    /// Take the oldest pending event across both sources
    pub fn next(&mut self) -> Option<Event> {
        let radio_at = self.radio.peek().copied();
        let timer_at = self.timer.peek().map(|(_, at)| *at);

        let take_radio = match (radio_at, timer_at) {
            (None, None) => return None,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            // Ties go to the radio: a completed operation outranks an alarm
            // that was armed to bound it.
            (Some(radio), Some(timer)) => !timer.is_before(radio),
        };

        if take_radio {
            self.radio.dequeue().map(|at| Event::RadioIrq { at })
        } else {
            self.timer
                .dequeue()
                .map(|(token, at)| Event::Timer { token, at })
        }
    }

    /// Whether any event is waiting
    pub fn is_empty(&self) -> bool {
        self.radio.peek().is_none() && self.timer.peek().is_none()
    }
}
