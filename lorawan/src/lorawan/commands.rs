//! MAC commands
//!
//! Commands travel in FOpts or as the FRMPayload of port 0. A request and
//! its answer share one command identifier, so parsing needs the direction.

use heapless::Vec;

use super::region::{AdrStatus, RxParamStatus};
use crate::crypto::Direction;

/// MAC command identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum CommandIdentifier {
    /// LinkCheckReq / LinkCheckAns
    LinkCheck = 0x02,
    /// LinkADRReq / LinkADRAns
    LinkADR = 0x03,
    /// DutyCycleReq / DutyCycleAns
    DutyCycle = 0x04,
    /// RXParamSetupReq / RXParamSetupAns
    RXParamSetup = 0x05,
    /// DevStatusReq / DevStatusAns
    DevStatus = 0x06,
    /// NewChannelReq / NewChannelAns
    NewChannel = 0x07,
    /// RXTimingSetupReq / RXTimingSetupAns
    RXTimingSetup = 0x08,
    /// TxParamSetupReq / TxParamSetupAns
    TxParamSetup = 0x09,
    /// DlChannelReq / DlChannelAns
    DlChannel = 0x0A,
}

/// MaxEIRP values (dBm) addressed by TxParamSetupReq
pub const MAX_EIRP_TABLE: [i8; 16] = [8, 10, 12, 13, 14, 16, 18, 20, 21, 24, 26, 27, 29, 30, 33, 36];

/// LinkADRReq fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LinkAdrReq {
    /// Data rate (0xF keeps the current one)
    pub data_rate: u8,
    /// TX power index (0xF keeps the current one)
    pub tx_power: u8,
    /// Channel mask
    pub ch_mask: u16,
    /// Channel mask control
    pub ch_mask_cntl: u8,
    /// Number of transmissions (0 keeps the current value)
    pub nb_trans: u8,
}

/// MAC command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MacCommand {
    /// Link check request
    LinkCheckReq,
    /// Link check answer
    LinkCheckAns {
        /// Link margin in dB above the demodulation floor
        margin: u8,
        /// Number of gateways that received the request
        gateway_count: u8,
    },
    /// Link ADR request
    LinkADRReq(LinkAdrReq),
    /// Link ADR answer
    LinkADRAns(AdrStatus),
    /// Duty cycle request
    DutyCycleReq {
        /// Aggregated duty cycle limit, 1 / 2^n
        max_duty_cycle: u8,
    },
    /// Duty cycle answer
    DutyCycleAns,
    /// RX parameter setup request
    RXParamSetupReq {
        /// RX1 data rate offset
        rx1_dr_offset: u8,
        /// RX2 data rate
        rx2_data_rate: u8,
        /// RX2 frequency in Hz
        frequency: u32,
    },
    /// RX parameter setup answer
    RXParamSetupAns(RxParamStatus),
    /// Device status request
    DevStatusReq,
    /// Device status answer
    DevStatusAns {
        /// Battery level (0 = external power, 1-254 = level, 255 = unknown)
        battery: u8,
        /// SNR of the last downlink in dB, -32..=31
        margin: i8,
    },
    /// New channel request
    NewChannelReq {
        /// Channel index
        ch_index: u8,
        /// Frequency in Hz
        frequency: u32,
        /// Maximum data rate
        max_dr: u8,
        /// Minimum data rate
        min_dr: u8,
    },
    /// New channel answer
    NewChannelAns {
        /// Channel frequency OK
        channel_freq_ok: bool,
        /// Data rate range OK
        data_rate_ok: bool,
    },
    /// RX timing setup request
    RXTimingSetupReq {
        /// RX1 delay in seconds (0 means 1)
        delay: u8,
    },
    /// RX timing setup answer
    RXTimingSetupAns,
    /// TX parameter setup request
    TxParamSetupReq {
        /// Downlink dwell time limit
        downlink_dwell_time: bool,
        /// Uplink dwell time limit
        uplink_dwell_time: bool,
        /// Index into [`MAX_EIRP_TABLE`]
        max_eirp: u8,
    },
    /// TX parameter setup answer
    TxParamSetupAns,
    /// Downlink channel request
    DlChannelReq {
        /// Channel index
        ch_index: u8,
        /// Frequency in Hz
        frequency: u32,
    },
    /// Downlink channel answer
    DlChannelAns {
        /// Channel frequency OK
        channel_freq_ok: bool,
        /// Uplink frequency exists
        uplink_freq_exists: bool,
    },
}

/// MAC command parse error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommandError {
    /// Unknown command identifier
    Unknown(u8),
    /// Command shorter than its fixed length
    Truncated(u8),
}

fn freq(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]) * 100
}

fn freq_bytes(frequency: u32) -> [u8; 3] {
    let [a, b, c, _] = (frequency / 100).to_le_bytes();
    [a, b, c]
}

fn bit(value: bool, shift: u8) -> u8 {
    u8::from(value) << shift
}

impl MacCommand {
    /// Payload length following `cid` when travelling in direction `dir`
    pub fn payload_len(dir: Direction, cid: u8) -> Option<usize> {
        let len = match (dir, cid) {
            (Direction::Down, 0x02) => 2,
            (Direction::Down, 0x03) => 4,
            (Direction::Down, 0x04) => 1,
            (Direction::Down, 0x05) => 4,
            (Direction::Down, 0x06) => 0,
            (Direction::Down, 0x07) => 5,
            (Direction::Down, 0x08) => 1,
            (Direction::Down, 0x09) => 1,
            (Direction::Down, 0x0A) => 4,
            (Direction::Up, 0x02) => 0,
            (Direction::Up, 0x03) => 1,
            (Direction::Up, 0x04) => 0,
            (Direction::Up, 0x05) => 1,
            (Direction::Up, 0x06) => 2,
            (Direction::Up, 0x07) => 1,
            (Direction::Up, 0x08) => 0,
            (Direction::Up, 0x09) => 0,
            (Direction::Up, 0x0A) => 1,
            _ => return None,
        };
        Some(len)
    }

    /// Parse MAC command from its identifier and exactly-sized payload
    pub fn from_bytes(dir: Direction, cid: u8, payload: &[u8]) -> Option<Self> {
        if Self::payload_len(dir, cid)? != payload.len() {
            return None;
        }
        let p = payload;
        let command = match (dir, cid) {
            (Direction::Down, 0x02) => MacCommand::LinkCheckAns {
                margin: p[0],
                gateway_count: p[1],
            },
            (Direction::Down, 0x03) => MacCommand::LinkADRReq(LinkAdrReq {
                data_rate: p[0] >> 4,
                tx_power: p[0] & 0x0F,
                ch_mask: u16::from_le_bytes([p[1], p[2]]),
                ch_mask_cntl: (p[3] >> 4) & 0x07,
                nb_trans: p[3] & 0x0F,
            }),
            (Direction::Down, 0x04) => MacCommand::DutyCycleReq {
                max_duty_cycle: p[0] & 0x0F,
            },
            (Direction::Down, 0x05) => MacCommand::RXParamSetupReq {
                rx1_dr_offset: (p[0] >> 4) & 0x07,
                rx2_data_rate: p[0] & 0x0F,
                frequency: freq(&p[1..4]),
            },
            (Direction::Down, 0x06) => MacCommand::DevStatusReq,
            (Direction::Down, 0x07) => MacCommand::NewChannelReq {
                ch_index: p[0],
                frequency: freq(&p[1..4]),
                max_dr: p[4] >> 4,
                min_dr: p[4] & 0x0F,
            },
            (Direction::Down, 0x08) => MacCommand::RXTimingSetupReq { delay: p[0] & 0x0F },
            (Direction::Down, 0x09) => MacCommand::TxParamSetupReq {
                downlink_dwell_time: (p[0] & 0x20) != 0,
                uplink_dwell_time: (p[0] & 0x10) != 0,
                max_eirp: p[0] & 0x0F,
            },
            (Direction::Down, 0x0A) => MacCommand::DlChannelReq {
                ch_index: p[0],
                frequency: freq(&p[1..4]),
            },
            (Direction::Up, 0x02) => MacCommand::LinkCheckReq,
            (Direction::Up, 0x03) => MacCommand::LinkADRAns(AdrStatus {
                power_ack: (p[0] & 0x04) != 0,
                data_rate_ack: (p[0] & 0x02) != 0,
                channel_mask_ack: (p[0] & 0x01) != 0,
            }),
            (Direction::Up, 0x04) => MacCommand::DutyCycleAns,
            (Direction::Up, 0x05) => MacCommand::RXParamSetupAns(RxParamStatus {
                rx1_dr_offset_ack: (p[0] & 0x04) != 0,
                rx2_data_rate_ack: (p[0] & 0x02) != 0,
                channel_ack: (p[0] & 0x01) != 0,
            }),
            (Direction::Up, 0x06) => MacCommand::DevStatusAns {
                battery: p[0],
                // 6-bit two's complement
                margin: ((p[1] << 2) as i8) >> 2,
            },
            (Direction::Up, 0x07) => MacCommand::NewChannelAns {
                channel_freq_ok: (p[0] & 0x01) != 0,
                data_rate_ok: (p[0] & 0x02) != 0,
            },
            (Direction::Up, 0x08) => MacCommand::RXTimingSetupAns,
            (Direction::Up, 0x09) => MacCommand::TxParamSetupAns,
            (Direction::Up, 0x0A) => MacCommand::DlChannelAns {
                channel_freq_ok: (p[0] & 0x01) != 0,
                uplink_freq_exists: (p[0] & 0x02) != 0,
            },
            _ => return None,
        };
        Some(command)
    }

    /// Command identifier
    pub fn cid(&self) -> CommandIdentifier {
        match self {
            MacCommand::LinkCheckReq | MacCommand::LinkCheckAns { .. } => CommandIdentifier::LinkCheck,
            MacCommand::LinkADRReq(_) | MacCommand::LinkADRAns(_) => CommandIdentifier::LinkADR,
            MacCommand::DutyCycleReq { .. } | MacCommand::DutyCycleAns => CommandIdentifier::DutyCycle,
            MacCommand::RXParamSetupReq { .. } | MacCommand::RXParamSetupAns(_) => {
                CommandIdentifier::RXParamSetup
            }
            MacCommand::DevStatusReq | MacCommand::DevStatusAns { .. } => CommandIdentifier::DevStatus,
            MacCommand::NewChannelReq { .. } | MacCommand::NewChannelAns { .. } => {
                CommandIdentifier::NewChannel
            }
            MacCommand::RXTimingSetupReq { .. } | MacCommand::RXTimingSetupAns => {
                CommandIdentifier::RXTimingSetup
            }
            MacCommand::TxParamSetupReq { .. } | MacCommand::TxParamSetupAns => {
                CommandIdentifier::TxParamSetup
            }
            MacCommand::DlChannelReq { .. } | MacCommand::DlChannelAns { .. } => CommandIdentifier::DlChannel,
        }
    }

    /// Encoded length in bytes, identifier included
    pub fn encoded_len(&self) -> usize {
        1 + self.payload().1
    }

    /// Payload bytes (at most five) and their count
    fn payload(&self) -> ([u8; 5], usize) {
        let mut out = [0u8; 5];
        let mut put = |bytes: &[u8]| {
            out[..bytes.len()].copy_from_slice(bytes);
            bytes.len()
        };

        let len = match *self {
            MacCommand::LinkCheckReq
            | MacCommand::DutyCycleAns
            | MacCommand::DevStatusReq
            | MacCommand::RXTimingSetupAns
            | MacCommand::TxParamSetupAns => 0,
            MacCommand::LinkCheckAns {
                margin,
                gateway_count,
            } => put(&[margin, gateway_count]),
            MacCommand::LinkADRReq(req) => {
                let [lo, hi] = req.ch_mask.to_le_bytes();
                put(&[
                    (req.data_rate << 4) | (req.tx_power & 0x0F),
                    lo,
                    hi,
                    ((req.ch_mask_cntl & 0x07) << 4) | (req.nb_trans & 0x0F),
                ])
            }
            MacCommand::LinkADRAns(status) => put(&[bit(status.power_ack, 2)
                | bit(status.data_rate_ack, 1)
                | bit(status.channel_mask_ack, 0)]),
            MacCommand::DutyCycleReq { max_duty_cycle } => put(&[max_duty_cycle & 0x0F]),
            MacCommand::RXParamSetupReq {
                rx1_dr_offset,
                rx2_data_rate,
                frequency,
            } => {
                let [a, b, c] = freq_bytes(frequency);
                put(&[((rx1_dr_offset & 0x07) << 4) | (rx2_data_rate & 0x0F), a, b, c])
            }
            MacCommand::RXParamSetupAns(status) => put(&[bit(status.rx1_dr_offset_ack, 2)
                | bit(status.rx2_data_rate_ack, 1)
                | bit(status.channel_ack, 0)]),
            MacCommand::DevStatusAns { battery, margin } => {
                put(&[battery, (margin.clamp(-32, 31) as u8) & 0x3F])
            }
            MacCommand::NewChannelReq {
                ch_index,
                frequency,
                max_dr,
                min_dr,
            } => {
                let [a, b, c] = freq_bytes(frequency);
                put(&[ch_index, a, b, c, (max_dr << 4) | (min_dr & 0x0F)])
            }
            MacCommand::NewChannelAns {
                channel_freq_ok,
                data_rate_ok,
            } => put(&[bit(data_rate_ok, 1) | bit(channel_freq_ok, 0)]),
            MacCommand::RXTimingSetupReq { delay } => put(&[delay & 0x0F]),
            MacCommand::TxParamSetupReq {
                downlink_dwell_time,
                uplink_dwell_time,
                max_eirp,
            } => put(&[bit(downlink_dwell_time, 5) | bit(uplink_dwell_time, 4) | (max_eirp & 0x0F)]),
            MacCommand::DlChannelReq { ch_index, frequency } => {
                let [a, b, c] = freq_bytes(frequency);
                put(&[ch_index, a, b, c])
            }
            MacCommand::DlChannelAns {
                channel_freq_ok,
                uplink_freq_exists,
            } => put(&[bit(uplink_freq_exists, 1) | bit(channel_freq_ok, 0)]),
        };
        (out, len)
    }

    /// Append identifier and payload to `out`; fails without writing if it
    /// does not fit
    pub fn encode<const N: usize>(&self, out: &mut Vec<u8, N>) -> Result<(), ()> {
        let (payload, len) = self.payload();
        if out.capacity() - out.len() < 1 + len {
            return Err(());
        }
        out.push(self.cid() as u8).map_err(|_| ())?;
        out.extend_from_slice(&payload[..len])
    }
}

/// Iterator over the commands of a FOpts field or port 0 payload.
///
/// Parsing stops at the first malformed or unknown command; the error is
/// yielded once.
pub struct Commands<'a> {
    dir: Direction,
    bytes: &'a [u8],
    done: bool,
}

/// Parse a command block travelling in direction `dir`
pub fn parse(dir: Direction, bytes: &[u8]) -> Commands<'_> {
    Commands {
        dir,
        bytes,
        done: false,
    }
}

impl Iterator for Commands<'_> {
    type Item = Result<MacCommand, CommandError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let (&cid, rest) = self.bytes.split_first()?;

        let result = match MacCommand::payload_len(self.dir, cid) {
            None => Err(CommandError::Unknown(cid)),
            Some(len) if len > rest.len() => Err(CommandError::Truncated(cid)),
            Some(len) => {
                self.bytes = &rest[len..];
                MacCommand::from_bytes(self.dir, cid, &rest[..len]).ok_or(CommandError::Unknown(cid))
            }
        };

        if result.is_err() {
            self.done = true;
        }
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_downlink_block() {
        // LinkADRReq DR3 power 2, mask 0xFF00 cntl 0 nbTrans 1; DevStatusReq; RXTimingSetupReq 3
        let bytes = [0x03, 0x32, 0x00, 0xFF, 0x01, 0x06, 0x08, 0x03];
        let mut commands = parse(Direction::Down, &bytes);

        assert_eq!(
            commands.next(),
            Some(Ok(MacCommand::LinkADRReq(LinkAdrReq {
                data_rate: 3,
                tx_power: 2,
                ch_mask: 0xFF00,
                ch_mask_cntl: 0,
                nb_trans: 1,
            })))
        );
        assert_eq!(commands.next(), Some(Ok(MacCommand::DevStatusReq)));
        assert_eq!(commands.next(), Some(Ok(MacCommand::RXTimingSetupReq { delay: 3 })));
        assert_eq!(commands.next(), None);
    }

    #[test]
    fn stops_at_unknown_or_truncated_commands() {
        let mut commands = parse(Direction::Down, &[0x06, 0x7F, 0x06]);
        assert_eq!(commands.next(), Some(Ok(MacCommand::DevStatusReq)));
        assert_eq!(commands.next(), Some(Err(CommandError::Unknown(0x7F))));
        assert_eq!(commands.next(), None);

        let mut commands = parse(Direction::Down, &[0x03, 0x32, 0x00]);
        assert_eq!(commands.next(), Some(Err(CommandError::Truncated(0x03))));
        assert_eq!(commands.next(), None);
    }

    #[test]
    fn rx_param_setup_frequency_is_in_100_hz_steps() {
        let command = MacCommand::from_bytes(Direction::Down, 0x05, &[0x28, 0x68, 0xE2, 0x8C]).unwrap();
        assert_eq!(
            command,
            MacCommand::RXParamSetupReq {
                rx1_dr_offset: 2,
                rx2_data_rate: 8,
                frequency: 923_300_000,
            }
        );

        let mut out: Vec<u8, 16> = Vec::new();
        command.encode(&mut out).unwrap();
        assert_eq!(&out[..], &[0x05, 0x28, 0x68, 0xE2, 0x8C]);
    }

    #[test]
    fn answers_encode_status_bits() {
        let mut out: Vec<u8, 16> = Vec::new();
        MacCommand::LinkADRAns(AdrStatus {
            power_ack: true,
            data_rate_ack: false,
            channel_mask_ack: true,
        })
        .encode(&mut out)
        .unwrap();
        MacCommand::DevStatusAns {
            battery: 200,
            margin: -5,
        }
        .encode(&mut out)
        .unwrap();
        MacCommand::RXTimingSetupAns.encode(&mut out).unwrap();
        assert_eq!(&out[..], &[0x03, 0x05, 0x06, 200, 0x3B, 0x08]);

        let parsed: Vec<MacCommand, 4> = parse(Direction::Up, &out).filter_map(Result::ok).collect();
        assert_eq!(
            parsed[1],
            MacCommand::DevStatusAns {
                battery: 200,
                margin: -5
            }
        );
    }

    #[test]
    fn encode_refuses_to_overflow() {
        let mut out: Vec<u8, 4> = Vec::new();
        out.extend_from_slice(&[0, 0]).unwrap();
        let req = MacCommand::DevStatusAns {
            battery: 1,
            margin: 0,
        };
        assert_eq!(req.encode(&mut out), Err(()));
        assert_eq!(out.len(), 2);
        assert_eq!(req.encoded_len(), 3);
    }
}
