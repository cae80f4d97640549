//! Regional parameters
//!
//! A channel plan owns everything that differs between regions:
//! - Channel frequencies and the enabled-channel mask
//! - Data rate table and payload limits
//! - Receive window frequencies and data rates
//! - TX power table and dwell-time rules
//!
//! The MAC layer is generic over [`ChannelPlan`]; [`Au915`] is the only plan
//! shipped.

/// Australia 915-928 MHz
pub mod au915;

pub use au915::Au915;

use super::commands::LinkAdrReq;
use super::frame::CfList;
use crate::radio::ModulationParams;
use crate::timer::Tick;

/// Number of channels a [`ChannelMask`] can address
pub const MAX_CHANNELS: usize = 80;

/// LoRa data rate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DataRate {
    /// Index in the regional table
    pub index: u8,
    /// Spreading factor
    pub spreading_factor: u8,
    /// Bandwidth in Hz
    pub bandwidth: u32,
}

impl DataRate {
    /// Radio modulation for this data rate
    pub fn modulation(&self) -> ModulationParams {
        ModulationParams::lora(self.spreading_factor, self.bandwidth)
    }
}

/// Uplink channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Channel {
    /// Channel index in the plan
    pub index: u8,
    /// Channel frequency in Hz
    pub frequency: u32,
    /// Minimum data rate index
    pub min_dr: u8,
    /// Maximum data rate index
    pub max_dr: u8,
}

impl Channel {
    /// Whether the channel can carry `dr`
    pub fn supports(&self, dr: u8) -> bool {
        (self.min_dr..=self.max_dr).contains(&dr)
    }
}

/// Enabled-channel bitmap, 16 channels per block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChannelMask([u16; 5]);

impl ChannelMask {
    /// Mask from raw 16-channel blocks
    pub const fn from_blocks(blocks: [u16; 5]) -> Self {
        Self(blocks)
    }

    /// Raw 16-channel blocks
    pub fn blocks(&self) -> [u16; 5] {
        self.0
    }

    /// Mask with the first `count` channels enabled
    pub fn first(count: usize) -> Self {
        let mut mask = Self::default();
        (0..count.min(MAX_CHANNELS)).for_each(|ch| mask.set(ch, true));
        mask
    }

    /// Whether channel `ch` is enabled
    pub fn is_enabled(&self, ch: usize) -> bool {
        ch < MAX_CHANNELS && self.0[ch / 16] & (1 << (ch % 16)) != 0
    }

    /// Enable or disable channel `ch`
    pub fn set(&mut self, ch: usize, enabled: bool) {
        if ch >= MAX_CHANNELS {
            return;
        }
        if enabled {
            self.0[ch / 16] |= 1 << (ch % 16);
        } else {
            self.0[ch / 16] &= !(1 << (ch % 16));
        }
    }

    /// Replace block `block` (channels `16 * block ..`)
    pub fn set_block(&mut self, block: usize, bits: u16) {
        if let Some(b) = self.0.get_mut(block) {
            *b = bits;
        }
    }

    /// Number of enabled channels
    pub fn count(&self) -> usize {
        self.0.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Whether no channel is enabled
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Channels enabled in both masks
    pub fn intersect(&self, other: &ChannelMask) -> ChannelMask {
        let mut out = *self;
        out.0.iter_mut().zip(other.0.iter()).for_each(|(a, b)| *a &= b);
        out
    }

    /// Channels enabled in `self` but not in `other`
    pub fn without(&self, other: &ChannelMask) -> ChannelMask {
        let mut out = *self;
        out.0.iter_mut().zip(other.0.iter()).for_each(|(a, b)| *a &= !b);
        out
    }

    /// Index of the `n`-th enabled channel
    pub fn nth_enabled(&self, n: usize) -> Option<usize> {
        (0..MAX_CHANNELS).filter(|ch| self.is_enabled(*ch)).nth(n)
    }
}

/// Channel plan error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PlanError {
    /// Every enabled channel is restricted (dwell window) or none supports the data rate
    NoChannelAvailable,
    /// A LinkADRReq block would leave no channel enabled; nothing was applied
    InvalidAdrCommand(AdrStatus),
}

/// Acknowledgement bits of a LinkADRAns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AdrStatus {
    /// TX power accepted
    pub power_ack: bool,
    /// Data rate accepted
    pub data_rate_ack: bool,
    /// Channel mask accepted
    pub channel_mask_ack: bool,
}

impl AdrStatus {
    /// Whether all three parts were accepted
    pub fn accepted(&self) -> bool {
        self.power_ack && self.data_rate_ack && self.channel_mask_ack
    }
}

/// Result of applying a LinkADRReq block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LinkAdrOutcome {
    /// Answer bits
    pub status: AdrStatus,
    /// New data rate, `None` to keep the current one
    pub data_rate: Option<u8>,
    /// New TX power index, `None` to keep the current one
    pub tx_power: Option<u8>,
    /// New transmissions per uplink, `None` to keep the current value
    pub nb_trans: Option<u8>,
}

/// Acknowledgement bits of an RXParamSetupAns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RxParamStatus {
    /// RX1 data rate offset accepted
    pub rx1_dr_offset_ack: bool,
    /// RX2 data rate accepted
    pub rx2_data_rate_ack: bool,
    /// RX2 frequency accepted
    pub channel_ack: bool,
}

/// Regional channel plan
pub trait ChannelPlan {
    /// Data rate parameters, `None` for unsupported indices
    fn data_rate(&self, index: u8) -> Option<DataRate>;

    /// Data rate used after join
    fn default_data_rate(&self) -> u8;

    /// Next lower uplink data rate, `None` at the floor
    fn lower_data_rate(&self, dr: u8) -> Option<u8>;

    /// Maximum MACPayload at `dr`, `None` when the data rate is unusable
    fn max_payload(&self, dr: u8) -> Option<usize>;

    /// Longest permitted single transmission, `None` without dwell limit
    fn max_airtime_us(&self) -> Option<u32>;

    /// EIRP for TX power index `index`, `None` when out of range
    fn tx_power_dbm(&self, index: u8) -> Option<i8>;

    /// Pick an uplink channel for `dr`
    fn select_uplink_channel(&mut self, dr: u8, now: Tick) -> Result<Channel, PlanError>;

    /// Pick a channel and data rate for the next join request
    fn select_join_channel(&mut self, now: Tick) -> Result<(Channel, DataRate), PlanError>;

    /// Account for a transmission that started at `now`
    fn record_transmission(&mut self, channel: &Channel, airtime_us: u32, now: Tick);

    /// Ticks until some enabled channel able to carry `dr` leaves its dwell
    /// window, `None` when no enabled channel supports `dr` at all
    fn time_until_available(&self, dr: u8, now: Tick) -> Option<u32>;

    /// RX1 frequency for an uplink on `channel`
    fn rx1_frequency(&self, channel: &Channel) -> u32;

    /// RX1 data rate for an uplink at `uplink_dr`
    fn rx1_data_rate(&self, uplink_dr: u8, offset: u8) -> u8;

    /// Default RX2 frequency and data rate
    fn rx2_default(&self) -> (u32, u8);

    /// Apply a contiguous block of LinkADRReq commands atomically
    fn apply_adr(&mut self, requests: &[LinkAdrReq]) -> Result<LinkAdrOutcome, PlanError>;

    /// Check RXParamSetupReq values
    fn validate_rx_params(&self, rx1_dr_offset: u8, rx2_data_rate: u8, frequency: u32) -> RxParamStatus;

    /// Apply TxParamSetupReq values
    fn set_tx_params(&mut self, uplink_dwell: bool, max_eirp_dbm: i8);

    /// Apply the CFList of a join accept
    fn apply_cf_list(&mut self, cf_list: &CfList);

    /// Enabled channels
    fn channel_mask(&self) -> ChannelMask;

    /// Restore a previously saved mask; an empty mask is rejected
    fn set_channel_mask(&mut self, mask: ChannelMask) -> Result<(), PlanError>;

    /// Enable every channel of the plan
    fn enable_all_channels(&mut self);

    /// Enable only the channels of sub-band `sub_band`
    fn enable_sub_band(&mut self, sub_band: u8) -> Result<(), PlanError>;
}
