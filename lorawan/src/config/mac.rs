use crate::timer::TICKS_PER_SECOND;

/// MAC engine tuning.
///
/// `Default` mirrors the node's deployment profile: 32768 Hz ticks, a
/// crystal good to 10 ppm, SX1262 TCXO needing 5 ms to settle, three join
/// attempts and five retransmissions for confirmed uplinks.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MacConfig {
    /// Clock tick rate in Hz
    pub ticks_per_second: u32,
    /// Worst-case clock error in parts per million
    pub clock_error_ppm: u32,
    /// Radio wake-up lead time (TCXO start-up) in microseconds
    pub radio_wakeup_us: u32,
    /// Minimum number of preamble symbols a receive window must cover
    pub rx_min_symbols: u16,
    /// Join attempts before giving up
    pub max_join_attempts: u8,
    /// Back-off after the first failed join attempt, in milliseconds
    pub join_backoff_ms: u32,
    /// Upper bound for the join back-off, in milliseconds
    pub join_backoff_max_ms: u32,
    /// Retransmissions of an unacknowledged confirmed uplink
    pub max_retries: u8,
    /// Whether the network may drive data rate and power
    pub adr_enabled: bool,
    /// Sub-band enabled at start-up, `None` keeps all channels enabled
    pub sub_band: Option<u8>,
    /// Highest conducted power the radio can produce, in dBm
    pub max_tx_power_dbm: i8,
    /// Battery level reported in DevStatusAns (0 external, 1-254, 255 unknown)
    pub battery_level: u8,
    /// First DevNonce used when no persisted value exists
    pub dev_nonce: u16,
}

impl Default for MacConfig {
    fn default() -> Self {
        Self {
            ticks_per_second: TICKS_PER_SECOND,
            clock_error_ppm: 10,
            radio_wakeup_us: 5_000,
            rx_min_symbols: 6,
            max_join_attempts: 3,
            join_backoff_ms: 2_000,
            join_backoff_max_ms: 60_000,
            max_retries: 5,
            adr_enabled: true,
            sub_band: Some(2),
            max_tx_power_dbm: 22,
            battery_level: 255,
            dev_nonce: 0,
        }
    }
}

impl MacConfig {
    /// Set the tolerated clock error
    pub fn with_clock_error_ppm(mut self, ppm: u32) -> Self {
        self.clock_error_ppm = ppm;
        self
    }

    /// Set the number of join attempts
    pub fn with_max_join_attempts(mut self, attempts: u8) -> Self {
        self.max_join_attempts = attempts.max(1);
        self
    }

    /// Set the number of confirmed-uplink retransmissions
    pub fn with_max_retries(mut self, retries: u8) -> Self {
        self.max_retries = retries;
        self
    }

    /// Enable or disable ADR
    pub fn with_adr(mut self, enabled: bool) -> Self {
        self.adr_enabled = enabled;
        self
    }

    /// Restrict the plan to one sub-band (`None` for all channels)
    pub fn with_sub_band(mut self, sub_band: Option<u8>) -> Self {
        self.sub_band = sub_band;
        self
    }

    /// Set the join back-off base and cap
    pub fn with_join_backoff(mut self, base_ms: u32, max_ms: u32) -> Self {
        self.join_backoff_ms = base_ms;
        self.join_backoff_max_ms = max_ms.max(base_ms);
        self
    }

    /// Set the battery level reported to the network
    pub fn with_battery_level(mut self, level: u8) -> Self {
        self.battery_level = level;
        self
    }

    /// Back-off before join attempt `attempt + 1`, in milliseconds
    pub fn join_backoff_for(&self, attempt: u8) -> u32 {
        let shift = u32::from(attempt.saturating_sub(1)).min(16);
        self.join_backoff_ms
            .saturating_mul(1 << shift)
            .min(self.join_backoff_max_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_backoff_doubles_until_capped() {
        let config = MacConfig::default().with_join_backoff(1_000, 5_000);
        assert_eq!(config.join_backoff_for(1), 1_000);
        assert_eq!(config.join_backoff_for(2), 2_000);
        assert_eq!(config.join_backoff_for(3), 4_000);
        assert_eq!(config.join_backoff_for(4), 5_000);
        assert_eq!(config.join_backoff_for(200), 5_000);
    }
}
