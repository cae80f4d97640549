//! AU915-928 channel plan
//!
//! 64 × 125 kHz uplink channels (DR0-DR5), 8 × 500 kHz uplink channels (DR6)
//! and 8 downlink channels at 500 kHz (DR8-DR13). Uplink dwell time is on
//! by default: a transmission may not exceed 400 ms, and a channel stays
//! unused for 20 s after each transmission on it.

use super::{
    AdrStatus, Channel, ChannelMask, ChannelPlan, DataRate, LinkAdrOutcome, PlanError,
    RxParamStatus,
};
use crate::lorawan::commands::LinkAdrReq;
use crate::lorawan::frame::CfList;
use crate::timer::{Tick, TickRate};

/// Uplink channels (64 narrow + 8 wide)
pub const NUM_CHANNELS: usize = 72;

/// First 125 kHz uplink channel
pub const UPLINK_125_BASE: u32 = 915_200_000;
/// 125 kHz channel spacing
pub const UPLINK_125_STEP: u32 = 200_000;
/// First 500 kHz uplink channel
pub const UPLINK_500_BASE: u32 = 915_900_000;
/// 500 kHz channel spacing
pub const UPLINK_500_STEP: u32 = 1_600_000;
/// First downlink channel
pub const DOWNLINK_BASE: u32 = 923_300_000;
/// Downlink channel spacing
pub const DOWNLINK_STEP: u32 = 600_000;

/// Default RX2 frequency
pub const RX2_FREQUENCY: u32 = 923_300_000;
/// Default RX2 data rate
pub const RX2_DATA_RATE: u8 = 8;

/// Longest single transmission with dwell time on
pub const MAX_DWELL_US: u32 = 400_000;
/// Per-channel quiet period after a transmission
pub const DWELL_WINDOW_MS: u32 = 20_000;

/// Default maximum EIRP in dBm
pub const DEFAULT_MAX_EIRP: i8 = 30;

/// Highest TX power index
const MAX_TX_POWER_INDEX: u8 = 14;

/// Join requests on narrow channels use this data rate
const JOIN_DR_125: u8 = 2;
/// Join requests on wide channels use this data rate
const JOIN_DR_500: u8 = 6;

/// (SF, BW) per data rate; DR7 is LR-FHSS and not supported
const DATA_RATES: [Option<(u8, u32)>; 14] = [
    Some((12, 125_000)),
    Some((11, 125_000)),
    Some((10, 125_000)),
    Some((9, 125_000)),
    Some((8, 125_000)),
    Some((7, 125_000)),
    Some((8, 500_000)),
    None,
    Some((12, 500_000)),
    Some((11, 500_000)),
    Some((10, 500_000)),
    Some((9, 500_000)),
    Some((8, 500_000)),
    Some((7, 500_000)),
];

/// Maximum MACPayload per data rate with uplink dwell time on (0 = unusable)
const MAX_PAYLOAD_DWELL: [usize; 14] = [0, 0, 19, 61, 133, 250, 250, 0, 61, 137, 250, 250, 250, 250];

/// Maximum MACPayload per data rate with dwell time off
const MAX_PAYLOAD_NO_DWELL: [usize; 14] = [59, 59, 59, 123, 250, 250, 250, 0, 61, 137, 250, 250, 250, 250];

/// AU915 channel plan state
#[derive(Debug, Clone)]
pub struct Au915 {
    mask: ChannelMask,
    used: ChannelMask,
    last_tx: [Option<Tick>; NUM_CHANNELS],
    rng: u32,
    join_wide: bool,
    uplink_dwell: bool,
    max_eirp: i8,
    dwell_window: u32,
}

impl Au915 {
    /// Plan with every channel enabled; `seed` drives channel hopping
    pub fn new(seed: u32) -> Self {
        Self {
            mask: ChannelMask::first(NUM_CHANNELS),
            used: ChannelMask::default(),
            last_tx: [None; NUM_CHANNELS],
            rng: if seed == 0 { 0x2545_F491 } else { seed },
            join_wide: false,
            uplink_dwell: true,
            max_eirp: DEFAULT_MAX_EIRP,
            dwell_window: TickRate::default().ms_to_ticks(DWELL_WINDOW_MS),
        }
    }

    /// Use a platform clock running at `rate`
    pub fn with_tick_rate(mut self, rate: TickRate) -> Self {
        self.dwell_window = rate.ms_to_ticks(DWELL_WINDOW_MS);
        self
    }

    /// Uplink channel `index`
    pub fn channel(index: usize) -> Option<Channel> {
        match index {
            0..=63 => Some(Channel {
                index: index as u8,
                frequency: UPLINK_125_BASE + UPLINK_125_STEP * index as u32,
                min_dr: 0,
                max_dr: 5,
            }),
            64..=71 => Some(Channel {
                index: index as u8,
                frequency: UPLINK_500_BASE + UPLINK_500_STEP * (index as u32 - 64),
                min_dr: 6,
                max_dr: 6,
            }),
            _ => None,
        }
    }

    /// Whether uplink dwell time limits apply
    pub fn uplink_dwell(&self) -> bool {
        self.uplink_dwell
    }

    fn next_random(&mut self) -> u32 {
        // xorshift32
        let mut x = self.rng;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.rng = x;
        x
    }

    fn in_dwell(&self, ch: usize, now: Tick) -> bool {
        self.uplink_dwell
            && self.last_tx[ch].map_or(false, |at| now.ticks_since(at) < self.dwell_window)
    }

    /// Enabled channels able to carry `dr` right now
    fn available(&self, dr: u8, now: Tick) -> ChannelMask {
        let mut out = ChannelMask::default();
        for ch in 0..NUM_CHANNELS {
            let supports = Self::channel(ch).map_or(false, |c| c.supports(dr));
            if supports && self.mask.is_enabled(ch) && !self.in_dwell(ch, now) {
                out.set(ch, true);
            }
        }
        out
    }

    fn pick(&mut self, from: &ChannelMask) -> Option<Channel> {
        let count = from.count();
        if count == 0 {
            return None;
        }
        let n = self.next_random() as usize % count;
        from.nth_enabled(n).and_then(Self::channel)
    }

    fn dr_supported_by(mask: &ChannelMask, dr: u8) -> bool {
        (0..NUM_CHANNELS)
            .filter(|ch| mask.is_enabled(*ch))
            .filter_map(Self::channel)
            .any(|c| c.supports(dr))
    }

    fn set_narrow(mask: &mut ChannelMask, enabled: bool) {
        let bits = if enabled { 0xFFFF } else { 0 };
        (0..4).for_each(|block| mask.set_block(block, bits));
    }
}

impl Default for Au915 {
    fn default() -> Self {
        Self::new(1)
    }
}

impl ChannelPlan for Au915 {
    fn data_rate(&self, index: u8) -> Option<DataRate> {
        let (spreading_factor, bandwidth) = (*DATA_RATES.get(usize::from(index))?)?;
        Some(DataRate {
            index,
            spreading_factor,
            bandwidth,
        })
    }

    fn default_data_rate(&self) -> u8 {
        JOIN_DR_125
    }

    fn lower_data_rate(&self, dr: u8) -> Option<u8> {
        let floor = if self.uplink_dwell { 2 } else { 0 };
        (dr > floor && dr <= 6).then(|| dr - 1)
    }

    fn max_payload(&self, dr: u8) -> Option<usize> {
        let table = if self.uplink_dwell {
            &MAX_PAYLOAD_DWELL
        } else {
            &MAX_PAYLOAD_NO_DWELL
        };
        table.get(usize::from(dr)).copied().filter(|len| *len > 0)
    }

    fn max_airtime_us(&self) -> Option<u32> {
        self.uplink_dwell.then_some(MAX_DWELL_US)
    }

    fn tx_power_dbm(&self, index: u8) -> Option<i8> {
        (index <= MAX_TX_POWER_INDEX).then(|| self.max_eirp - 2 * index as i8)
    }

    fn select_uplink_channel(&mut self, dr: u8, now: Tick) -> Result<Channel, PlanError> {
        let candidates = self.available(dr, now);
        if candidates.is_empty() {
            debug!("au915: no channel for DR{} ({} enabled)", dr, self.mask.count());
            return Err(PlanError::NoChannelAvailable);
        }

        let mut fresh = candidates.without(&self.used);
        if fresh.is_empty() {
            trace!("au915: hopping cycle complete");
            self.used = ChannelMask::default();
            fresh = candidates;
        }

        let channel = self.pick(&fresh).ok_or(PlanError::NoChannelAvailable)?;
        self.used.set(usize::from(channel.index), true);
        Ok(channel)
    }

    fn select_join_channel(&mut self, now: Tick) -> Result<(Channel, DataRate), PlanError> {
        let order = if self.join_wide {
            [JOIN_DR_500, JOIN_DR_125]
        } else {
            [JOIN_DR_125, JOIN_DR_500]
        };
        self.join_wide = !self.join_wide;

        for dr in order {
            let candidates = self.available(dr, now);
            if let (Some(channel), Some(rate)) = (self.pick(&candidates), self.data_rate(dr)) {
                return Ok((channel, rate));
            }
        }
        Err(PlanError::NoChannelAvailable)
    }

    fn record_transmission(&mut self, channel: &Channel, airtime_us: u32, now: Tick) {
        trace!("au915: ch{} busy for {} us", channel.index, airtime_us);
        if let Some(slot) = self.last_tx.get_mut(usize::from(channel.index)) {
            *slot = Some(now);
        }
    }

    fn time_until_available(&self, dr: u8, now: Tick) -> Option<u32> {
        (0..NUM_CHANNELS)
            .filter(|ch| self.mask.is_enabled(*ch))
            .filter(|ch| Self::channel(*ch).map_or(false, |c| c.supports(dr)))
            .map(|ch| match self.last_tx[ch] {
                Some(at) if self.uplink_dwell => self.dwell_window.saturating_sub(now.ticks_since(at)),
                _ => 0,
            })
            .min()
    }

    fn rx1_frequency(&self, channel: &Channel) -> u32 {
        DOWNLINK_BASE + DOWNLINK_STEP * (u32::from(channel.index) % 8)
    }

    fn rx1_data_rate(&self, uplink_dr: u8, offset: u8) -> u8 {
        (i16::from(uplink_dr) + 8 - i16::from(offset)).clamp(8, 13) as u8
    }

    fn rx2_default(&self) -> (u32, u8) {
        (RX2_FREQUENCY, RX2_DATA_RATE)
    }

    fn apply_adr(&mut self, requests: &[LinkAdrReq]) -> Result<LinkAdrOutcome, PlanError> {
        let mut mask = self.mask;
        let mut cntl_ok = true;

        for req in requests {
            match req.ch_mask_cntl {
                0..=3 => mask.set_block(usize::from(req.ch_mask_cntl), req.ch_mask),
                4 => mask.set_block(4, req.ch_mask & 0x00FF),
                5 => {
                    for sub_band in 0..8 {
                        let on = req.ch_mask & (1 << sub_band) != 0;
                        (sub_band * 8..sub_band * 8 + 8).for_each(|ch| mask.set(ch, on));
                        mask.set(64 + sub_band, on);
                    }
                }
                6 | 7 => {
                    Self::set_narrow(&mut mask, req.ch_mask_cntl == 6);
                    mask.set_block(4, req.ch_mask & 0x00FF);
                }
                _ => cntl_ok = false,
            }
        }

        let last = match requests.last() {
            Some(last) => *last,
            None => {
                return Ok(LinkAdrOutcome {
                    status: AdrStatus {
                        power_ack: true,
                        data_rate_ack: true,
                        channel_mask_ack: true,
                    },
                    data_rate: None,
                    tx_power: None,
                    nb_trans: None,
                })
            }
        };

        let data_rate = (last.data_rate != 0x0F).then_some(last.data_rate);
        let tx_power = (last.tx_power != 0x0F).then_some(last.tx_power);
        let nb_trans = (last.nb_trans != 0).then_some(last.nb_trans);

        let status = AdrStatus {
            power_ack: tx_power.map_or(true, |p| p <= MAX_TX_POWER_INDEX),
            data_rate_ack: data_rate.map_or(true, |dr| {
                dr <= 6
                    && self.max_payload(dr).is_some()
                    && (mask.is_empty() || Self::dr_supported_by(&mask, dr))
            }),
            channel_mask_ack: cntl_ok && !mask.is_empty(),
        };

        if mask.is_empty() {
            warn!("au915: LinkADRReq would disable every channel, rejected");
            return Err(PlanError::InvalidAdrCommand(status));
        }

        if !status.accepted() {
            debug!(
                "au915: LinkADRReq refused (power {} dr {} mask {})",
                status.power_ack, status.data_rate_ack, status.channel_mask_ack
            );
            return Ok(LinkAdrOutcome {
                status,
                data_rate: None,
                tx_power: None,
                nb_trans: None,
            });
        }

        self.mask = mask;
        self.used = self.used.intersect(&mask);
        debug!("au915: {} channels enabled", mask.count());
        Ok(LinkAdrOutcome {
            status,
            data_rate,
            tx_power,
            nb_trans,
        })
    }

    fn validate_rx_params(&self, rx1_dr_offset: u8, rx2_data_rate: u8, frequency: u32) -> RxParamStatus {
        RxParamStatus {
            rx1_dr_offset_ack: rx1_dr_offset <= 5,
            rx2_data_rate_ack: (8..=13).contains(&rx2_data_rate),
            channel_ack: (915_000_000..=928_000_000).contains(&frequency),
        }
    }

    fn set_tx_params(&mut self, uplink_dwell: bool, max_eirp_dbm: i8) {
        self.uplink_dwell = uplink_dwell;
        self.max_eirp = max_eirp_dbm;
    }

    fn apply_cf_list(&mut self, cf_list: &CfList) {
        match cf_list {
            CfList::ChannelMask(blocks) => {
                let mut mask = ChannelMask::from_blocks(*blocks);
                mask.set_block(4, blocks[4] & 0x00FF);
                if mask.is_empty() {
                    warn!("au915: empty CFList channel mask ignored");
                } else {
                    self.mask = mask;
                    self.used = ChannelMask::default();
                }
            }
            CfList::Frequencies(_) => {
                warn!("au915: frequency CFList not applicable, ignored");
            }
        }
    }

    fn channel_mask(&self) -> ChannelMask {
        self.mask
    }

    fn set_channel_mask(&mut self, mask: ChannelMask) -> Result<(), PlanError> {
        let mask = mask.intersect(&ChannelMask::first(NUM_CHANNELS));
        if mask.is_empty() {
            return Err(PlanError::NoChannelAvailable);
        }
        self.mask = mask;
        self.used = ChannelMask::default();
        Ok(())
    }

    fn enable_all_channels(&mut self) {
        self.mask = ChannelMask::first(NUM_CHANNELS);
    }

    /// Sub-bands are numbered 1-8 as network operators do (TTN uses 2)
    fn enable_sub_band(&mut self, sub_band: u8) -> Result<(), PlanError> {
        if !(1..=8).contains(&sub_band) {
            return Err(PlanError::NoChannelAvailable);
        }
        let index = usize::from(sub_band - 1);
        let mut mask = ChannelMask::default();
        (index * 8..index * 8 + 8).for_each(|ch| mask.set(ch, true));
        mask.set(64 + index, true);
        self.mask = mask;
        self.used = ChannelMask::default();
        info!("au915: sub-band {} enabled", sub_band);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: u32 = 20 * 32_768;

    fn adr(ch_mask_cntl: u8, ch_mask: u16) -> LinkAdrReq {
        LinkAdrReq {
            data_rate: 0x0F,
            tx_power: 0x0F,
            ch_mask,
            ch_mask_cntl,
            nb_trans: 0,
        }
    }

    #[test]
    fn channel_frequencies() {
        assert_eq!(Au915::channel(0).unwrap().frequency, 915_200_000);
        assert_eq!(Au915::channel(63).unwrap().frequency, 927_800_000);
        assert_eq!(Au915::channel(64).unwrap().frequency, 915_900_000);
        assert_eq!(Au915::channel(71).unwrap().frequency, 927_100_000);
        assert!(Au915::channel(72).is_none());
    }

    #[test]
    fn receive_window_parameters() {
        let plan = Au915::new(1);
        let ch10 = Au915::channel(10).unwrap();
        assert_eq!(plan.rx1_frequency(&ch10), 924_500_000);
        assert_eq!(plan.rx1_frequency(&Au915::channel(65).unwrap()), 923_900_000);
        assert_eq!(plan.rx1_data_rate(2, 0), 10);
        assert_eq!(plan.rx1_data_rate(5, 5), 8);
        assert_eq!(plan.rx1_data_rate(0, 3), 8);
        assert_eq!(plan.rx1_data_rate(6, 0), 13);
        assert_eq!(plan.rx2_default(), (923_300_000, 8));
    }

    #[test]
    fn payload_limits_follow_dwell_time() {
        let mut plan = Au915::new(1);
        assert_eq!(plan.max_payload(0), None);
        assert_eq!(plan.max_payload(2), Some(19));
        assert_eq!(plan.max_payload(4), Some(133));
        assert_eq!(plan.max_payload(7), None);
        assert_eq!(plan.max_payload(9), Some(137));
        assert_eq!(plan.max_airtime_us(), Some(400_000));

        plan.set_tx_params(false, 30);
        assert_eq!(plan.max_payload(0), Some(59));
        assert_eq!(plan.max_payload(3), Some(123));
        assert_eq!(plan.max_airtime_us(), None);
    }

    #[test]
    fn data_rates_and_power() {
        let plan = Au915::new(1);
        let dr6 = plan.data_rate(6).unwrap();
        assert_eq!((dr6.spreading_factor, dr6.bandwidth), (8, 500_000));
        assert!(plan.data_rate(7).is_none());
        assert_eq!(plan.data_rate(8).unwrap().spreading_factor, 12);
        assert!(plan.data_rate(14).is_none());

        assert_eq!(plan.tx_power_dbm(0), Some(30));
        assert_eq!(plan.tx_power_dbm(5), Some(20));
        assert_eq!(plan.tx_power_dbm(15), None);

        assert_eq!(plan.lower_data_rate(6), Some(5));
        assert_eq!(plan.lower_data_rate(2), None);
    }

    #[test]
    fn hopping_exhausts_then_cycles_the_sub_band() {
        let mut plan = Au915::new(0xC0FF_EE11);
        plan.enable_sub_band(2).unwrap();

        let mut now = Tick(1_000);
        for _cycle in 0..3 {
            let mut seen = ChannelMask::default();
            for _ in 0..8 {
                let ch = plan.select_uplink_channel(2, now).unwrap();
                assert!((8..16).contains(&ch.index));
                assert!(!seen.is_enabled(usize::from(ch.index)));
                seen.set(usize::from(ch.index), true);
                plan.record_transmission(&ch, 200_000, now);
                now = now.wrapping_add(WINDOW + 1);
            }
            assert_eq!(seen.count(), 8);
        }
    }

    #[test]
    fn channels_in_dwell_window_are_skipped() {
        let mut plan = Au915::new(7);
        plan.enable_sub_band(2).unwrap();

        let start = Tick(u32::MAX - 100);
        let mut busy = ChannelMask::default();
        for i in 0..8u32 {
            let now = start.wrapping_add(i * 1_000);
            let ch = plan.select_uplink_channel(3, now).unwrap();
            assert!(!busy.is_enabled(usize::from(ch.index)));
            busy.set(usize::from(ch.index), true);
            plan.record_transmission(&ch, 100_000, now);
        }

        let later = start.wrapping_add(8_000);
        assert_eq!(
            plan.select_uplink_channel(3, later),
            Err(PlanError::NoChannelAvailable)
        );
        assert_eq!(plan.time_until_available(3, later), Some(WINDOW - 8_000));

        // The first channel comes back once its window has passed.
        let free = start.wrapping_add(WINDOW);
        assert!(plan.select_uplink_channel(3, free).is_ok());

        plan.set_tx_params(false, DEFAULT_MAX_EIRP);
        assert!(plan.select_uplink_channel(3, later).is_ok());
        assert_eq!(plan.time_until_available(3, later), Some(0));
    }

    #[test]
    fn join_alternates_narrow_and_wide() {
        let mut plan = Au915::new(3);
        plan.enable_sub_band(2).unwrap();

        let (ch, dr) = plan.select_join_channel(Tick(0)).unwrap();
        assert_eq!(dr.index, 2);
        assert!((8..16).contains(&ch.index));

        let (ch, dr) = plan.select_join_channel(Tick(0)).unwrap();
        assert_eq!(dr.index, 6);
        assert_eq!(ch.index, 65);
    }

    #[test]
    fn adr_disabling_everything_is_rejected() {
        let mut plan = Au915::new(1);
        plan.enable_sub_band(2).unwrap();
        let before = plan.channel_mask();

        let result = plan.apply_adr(&[adr(7, 0x0000)]);
        assert!(matches!(
            result,
            Err(PlanError::InvalidAdrCommand(AdrStatus {
                channel_mask_ack: false,
                ..
            }))
        ));
        assert_eq!(plan.channel_mask(), before);
    }

    #[test]
    fn adr_block_is_applied_as_a_whole() {
        let mut plan = Au915::new(1);

        // All off, then re-enable channels 8-15: only the end result counts.
        let mut second = adr(0, 0xFF00);
        second.data_rate = 3;
        second.tx_power = 2;
        second.nb_trans = 2;
        let outcome = plan.apply_adr(&[adr(7, 0x0000), second]).unwrap();

        assert!(outcome.status.accepted());
        assert_eq!(outcome.data_rate, Some(3));
        assert_eq!(outcome.tx_power, Some(2));
        assert_eq!(outcome.nb_trans, Some(2));
        assert_eq!(plan.channel_mask().count(), 8);
        assert!(plan.channel_mask().is_enabled(8));
        assert!(!plan.channel_mask().is_enabled(64));
    }

    #[test]
    fn adr_sub_band_mask() {
        let mut plan = Au915::new(1);
        let outcome = plan.apply_adr(&[adr(5, 0b0000_0010)]).unwrap();
        assert!(outcome.status.accepted());
        let mask = plan.channel_mask();
        assert_eq!(mask.count(), 9);
        assert!(mask.is_enabled(15));
        assert!(mask.is_enabled(65));
        assert!(!mask.is_enabled(16));
    }

    #[test]
    fn adr_unsupported_data_rate_leaves_state_unchanged() {
        let mut plan = Au915::new(1);
        let mut req = adr(6, 0x0000);
        req.data_rate = 7;
        let before = plan.channel_mask();

        let outcome = plan.apply_adr(&[req]).unwrap();
        assert!(!outcome.status.data_rate_ack);
        assert!(outcome.status.channel_mask_ack);
        assert_eq!(outcome.data_rate, None);
        assert_eq!(plan.channel_mask(), before);

        // DR6 needs a wide channel, and cntl 6 with an empty mask has none.
        req.data_rate = 6;
        let outcome = plan.apply_adr(&[req]).unwrap();
        assert!(!outcome.status.data_rate_ack);
    }

    #[test]
    fn cf_list_mask_replaces_channels() {
        let mut plan = Au915::new(1);
        plan.apply_cf_list(&CfList::ChannelMask([0xFF00, 0, 0, 0, 0x0002]));
        assert_eq!(plan.channel_mask().count(), 9);
        assert!(plan.channel_mask().is_enabled(65));
    }
}
