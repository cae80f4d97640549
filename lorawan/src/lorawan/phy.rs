//! PHY layer
//!
//! Radio access for the MAC layer plus the timing arithmetic around it:
//! time on air and receive-window placement under clock drift.

use super::region::{Channel, DataRate};
use crate::config::MacConfig;
use crate::radio::traits::{ModulationParams, Radio, RadioEvent, RxConfig, TxConfig};
use crate::timer::{ClockError, Tick, TickRate};

/// LoRaWAN preamble length in symbols
const PREAMBLE_SYMBOLS: u32 = 8;

/// Join-accept window delays; data windows follow the session RX1 delay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TimingParams {
    /// Join accept delay 1 in seconds
    pub join_accept_delay1: u32,
    /// Join accept delay 2 in seconds
    pub join_accept_delay2: u32,
}

impl Default for TimingParams {
    fn default() -> Self {
        Self {
            join_accept_delay1: 5,
            join_accept_delay2: 6,
        }
    }
}

/// PHY layer configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PhyConfig {
    /// Timing parameters
    pub timing: TimingParams,
    /// Platform tick rate
    pub tick_rate: TickRate,
    /// Tolerated clock error
    pub clock_error: ClockError,
    /// Radio wake-up lead time in microseconds
    pub wakeup_us: u32,
    /// Preamble symbols a window must be able to catch
    pub min_symbols: u16,
    /// Highest conducted power the radio supports, in dBm
    pub max_tx_power: i8,
}

impl Default for PhyConfig {
    fn default() -> Self {
        Self::from(&MacConfig::default())
    }
}

impl From<&MacConfig> for PhyConfig {
    fn from(config: &MacConfig) -> Self {
        Self {
            timing: TimingParams::default(),
            tick_rate: TickRate::new(config.ticks_per_second),
            clock_error: ClockError::from_ppm(config.clock_error_ppm),
            wakeup_us: config.radio_wakeup_us,
            min_symbols: config.rx_min_symbols,
            max_tx_power: config.max_tx_power_dbm,
        }
    }
}

/// Placement of one receive window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RxWindow {
    /// Tick at which the radio must be started
    pub open_at: Tick,
    /// How long the radio listens, from `open_at`
    pub timeout_us: u32,
    /// Symbols to search for a preamble before giving up
    pub symbol_timeout: u16,
}

/// LoRa time on air in microseconds (explicit header, CRC on, 8 preamble symbols)
pub fn time_on_air_us(modulation: &ModulationParams, payload_len: usize) -> u32 {
    let sf = i64::from(modulation.spreading_factor);
    let de = i64::from(modulation.low_data_rate_optimize());
    let cr = i64::from(modulation.coding_rate);
    let tsym = u64::from(modulation.symbol_time_us());

    let numerator = 8 * payload_len as i64 - 4 * sf + 28 + 16;
    let denominator = 4 * (sf - 2 * de);
    let extra = if numerator > 0 && denominator > 0 {
        (numerator + denominator - 1) / denominator * cr
    } else {
        0
    };
    let payload_symbols = 8 + extra as u64;

    // Preamble plus 4.25 symbols of sync word, counted in quarter symbols.
    let quarters = (u64::from(PREAMBLE_SYMBOLS) * 4 + 17) + payload_symbols * 4;
    (quarters * tsym / 4) as u32
}

/// Place a receive window `delay_ms` after the end of the uplink.
///
/// The window opens early by the worst-case drift accumulated over the
/// delay plus the radio wake-up time, and stays open long enough to catch
/// `min_symbols` of preamble even if the gateway is late by the same drift.
pub fn rx_window(config: &PhyConfig, tx_end: Tick, delay_ms: u32, data_rate: &DataRate) -> RxWindow {
    let delay_us = delay_ms.saturating_mul(1_000);
    let drift_us = config.clock_error.slack_us(delay_us);
    let tsym = data_rate.modulation().symbol_time_us().max(1);

    let lead_us = drift_us + config.wakeup_us;
    let open_at = tx_end.wrapping_add(config.tick_rate.us_to_ticks_floor(delay_us.saturating_sub(lead_us)));

    // One tick of rounding on the opening edge.
    let quantum_us = config.tick_rate.ticks_to_us(1) + 1;
    let timeout_us = config.wakeup_us + 2 * drift_us + u32::from(config.min_symbols) * tsym + quantum_us;

    let drift_symbols = (2 * drift_us + quantum_us).div_ceil(tsym);
    let symbol_timeout = u32::from(config.min_symbols) + drift_symbols;

    RxWindow {
        open_at,
        timeout_us,
        symbol_timeout: symbol_timeout.min(u32::from(u16::MAX)) as u16,
    }
}

/// PHY layer
pub struct PhyLayer<R: Radio> {
    /// Radio driver
    pub radio: R,
    /// Configuration
    pub config: PhyConfig,
}

impl<R: Radio> PhyLayer<R> {
    /// Create new PHY layer
    pub fn new(radio: R, config: PhyConfig) -> Self {
        Self { radio, config }
    }

    /// Initialize radio
    pub fn init(&mut self) -> Result<(), R::Error> {
        self.radio.init()
    }

    /// Configure radio for transmission at `eirp_dbm`, clamped to the radio's range
    pub fn configure_tx(&mut self, channel: &Channel, data_rate: &DataRate, eirp_dbm: i8) -> Result<(), R::Error> {
        let config = TxConfig {
            frequency: channel.frequency,
            power: eirp_dbm.min(self.config.max_tx_power),
            modulation: data_rate.modulation(),
        };
        self.radio.configure_tx(config)
    }

    /// Configure radio for a receive window
    pub fn configure_rx(&mut self, frequency: u32, data_rate: &DataRate, window: &RxWindow) -> Result<(), R::Error> {
        let config = RxConfig {
            frequency,
            modulation: data_rate.modulation(),
            timeout_us: window.timeout_us,
            symbol_timeout: window.symbol_timeout,
        };
        self.radio.configure_rx(config)
    }

    /// Start transmitting
    pub fn transmit(&mut self, data: &[u8]) -> Result<(), R::Error> {
        self.radio.transmit(data)
    }

    /// Open the configured receive window
    pub fn receive(&mut self) -> Result<(), R::Error> {
        self.radio.receive()
    }

    /// Collect the outcome of the running operation
    pub fn poll(&mut self, buffer: &mut [u8]) -> nb::Result<RadioEvent, R::Error> {
        self.radio.poll_event(buffer)
    }

    /// Put the radio into standby
    pub fn standby(&mut self) -> Result<(), R::Error> {
        self.radio.standby()
    }

    /// Put the radio to sleep
    pub fn sleep(&mut self) -> Result<(), R::Error> {
        self.radio.sleep()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dr(sf: u8, bw: u32) -> DataRate {
        DataRate {
            index: 0,
            spreading_factor: sf,
            bandwidth: bw,
        }
    }

    #[test]
    fn time_on_air_matches_reference_values() {
        // 20 bytes at SF7/125: 55.25 symbols of 1.024 ms
        assert_eq!(time_on_air_us(&ModulationParams::lora(7, 125_000), 20), 56_576);
        // Join request at SF10/125
        assert_eq!(time_on_air_us(&ModulationParams::lora(10, 125_000), 23), 370_688);
        // SF12/125 uses low data rate optimisation
        let sf12 = ModulationParams::lora(12, 125_000);
        assert!(sf12.low_data_rate_optimize());
        assert_eq!(time_on_air_us(&sf12, 12), 1_155_072);
    }

    #[test]
    fn window_opens_early_by_drift_and_wakeup() {
        let config = PhyConfig {
            wakeup_us: 5_000,
            ..PhyConfig::default()
        };
        let tx_end = Tick(100_000);
        let window = rx_window(&config, tx_end, 1_000, &dr(10, 500_000));

        // 1 s at 10 ppm is 10 us of drift: open 5.01 ms early.
        let expected = tx_end.wrapping_add(config.tick_rate.us_to_ticks_floor(1_000_000 - 5_010));
        assert_eq!(window.open_at, expected);
        assert!(window.open_at.is_before(tx_end.wrapping_add(32_768)));

        // SF10/500 symbols are 2048 us: six of them plus margins.
        assert!(window.timeout_us >= 5_000 + 20 + 6 * 2_048);
        assert!(window.timeout_us < 5_000 + 20 + 7 * 2_048);
        assert_eq!(window.symbol_timeout, 7);
    }

    #[test]
    fn longer_delays_get_wider_windows() {
        let config = PhyConfig::default();
        let rx1 = rx_window(&config, Tick(0), 1_000, &dr(12, 500_000));
        let join = rx_window(&config, Tick(0), 5_000, &dr(12, 500_000));
        assert!(join.timeout_us > rx1.timeout_us);
        assert!(join.timeout_us - rx1.timeout_us >= 2 * 40);
    }
}
