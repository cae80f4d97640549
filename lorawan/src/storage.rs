//! Session persistence
//!
//! A joined session outlives a reset only if it is written somewhere. The
//! MAC engine serializes the session into a fixed 80-byte record and hands it
//! to a [`SessionStore`]; where the bytes end up (flash page, EEPROM, FRAM,
//! a file on a host) is the store's business.
//!
//! The record is also written without a session, so that the next DevNonce
//! survives a reset between join attempts. The session fields are zero then.
//!
//! Record layout (multi-byte fields little-endian):
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0  | 1  | format version |
//! | 1  | 4  | DevAddr |
//! | 5  | 16 | NwkSKey |
//! | 21 | 16 | AppSKey |
//! | 37 | 4  | FCntUp |
//! | 41 | 4  | FCntDown |
//! | 45 | 1  | flags (bit 0: FCntDown valid, bit 1: session valid) |
//! | 46 | 4  | NetID |
//! | 50 | 1  | RX1 delay |
//! | 51 | 1  | RX1 DR offset |
//! | 52 | 4  | RX2 frequency |
//! | 56 | 1  | RX2 data rate |
//! | 57 | 1  | data rate |
//! | 58 | 1  | TX power index |
//! | 59 | 1  | NbTrans |
//! | 60 | 2  | next DevNonce |
//! | 62 | 10 | channel mask |
//! | 72 | 6  | reserved |
//! | 78 | 2  | CRC-16 over bytes 0..78 |

use crate::config::device::{AESKey, DevAddr};
use crate::config::{Session, SessionKeys};
use crate::lorawan::region::ChannelMask;

/// Size of a persisted session record
pub const PERSISTED_SIZE: usize = 80;

/// Record format version
pub const FORMAT_VERSION: u8 = 2;

const CRC_OFFSET: usize = PERSISTED_SIZE - 2;
const FLAG_FCNT_DOWN_VALID: u8 = 0x01;
const FLAG_SESSION_VALID: u8 = 0x02;

/// Backing storage for the session record
pub trait SessionStore {
    /// Storage error type
    type Error;

    /// Read the stored record into `buf`.
    ///
    /// Returns `false` when nothing has been stored yet.
    fn load(&mut self, buf: &mut [u8; PERSISTED_SIZE]) -> Result<bool, Self::Error>;

    /// Replace the stored record
    fn save(&mut self, record: &[u8; PERSISTED_SIZE]) -> Result<(), Self::Error>;
}

/// Store that keeps nothing; every boot starts unjoined
#[derive(Debug, Clone, Copy, Default)]
pub struct VolatileStore;

impl SessionStore for VolatileStore {
    type Error = core::convert::Infallible;

    fn load(&mut self, _buf: &mut [u8; PERSISTED_SIZE]) -> Result<bool, Self::Error> {
        Ok(false)
    }

    fn save(&mut self, _record: &[u8; PERSISTED_SIZE]) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// State restored after a reset
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PersistedSession {
    /// Session at the time of saving, `None` before the first join
    pub session: Option<Session>,
    /// DevNonce for the next join request
    pub dev_nonce: u16,
    /// Enabled channels
    pub channel_mask: ChannelMask,
}

impl PersistedSession {
    /// Serialize into a record
    pub fn to_bytes(&self) -> [u8; PERSISTED_SIZE] {
        let mut out = [0u8; PERSISTED_SIZE];
        out[0] = FORMAT_VERSION;
        out[60..62].copy_from_slice(&self.dev_nonce.to_le_bytes());
        for (i, block) in self.channel_mask.blocks().iter().enumerate() {
            out[62 + 2 * i..64 + 2 * i].copy_from_slice(&block.to_le_bytes());
        }

        if let Some(s) = &self.session {
            out[1..5].copy_from_slice(s.dev_addr.as_bytes());
            out[5..21].copy_from_slice(s.keys.nwk_skey.as_bytes());
            out[21..37].copy_from_slice(s.keys.app_skey.as_bytes());
            out[37..41].copy_from_slice(&s.fcnt_up.to_le_bytes());
            out[41..45].copy_from_slice(&s.fcnt_down.unwrap_or(0).to_le_bytes());
            out[45] = FLAG_SESSION_VALID;
            if s.fcnt_down.is_some() {
                out[45] |= FLAG_FCNT_DOWN_VALID;
            }
            out[46..50].copy_from_slice(&s.net_id.to_le_bytes());
            out[50] = s.rx1_delay;
            out[51] = s.rx1_dr_offset;
            out[52..56].copy_from_slice(&s.rx2_frequency.to_le_bytes());
            out[56] = s.rx2_data_rate;
            out[57] = s.data_rate;
            out[58] = s.tx_power;
            out[59] = s.nb_trans;
        }

        let crc = crc16(&out[..CRC_OFFSET]);
        out[CRC_OFFSET..].copy_from_slice(&crc.to_le_bytes());
        out
    }

    /// Parse a record, `None` when the checksum or version does not match
    pub fn from_bytes(record: &[u8; PERSISTED_SIZE]) -> Option<Self> {
        let crc = u16::from_le_bytes([record[CRC_OFFSET], record[CRC_OFFSET + 1]]);
        if crc16(&record[..CRC_OFFSET]) != crc {
            return None;
        }
        if record[0] != FORMAT_VERSION {
            return None;
        }

        let u32_at = |at: usize| u32::from_le_bytes([record[at], record[at + 1], record[at + 2], record[at + 3]]);
        let u16_at = |at: usize| u16::from_le_bytes([record[at], record[at + 1]]);
        let key_at = |at: usize| {
            let mut key = [0u8; 16];
            key.copy_from_slice(&record[at..at + 16]);
            AESKey::new(key)
        };

        let session = (record[45] & FLAG_SESSION_VALID != 0).then(|| Session {
            dev_addr: DevAddr::new([record[1], record[2], record[3], record[4]]),
            keys: SessionKeys {
                nwk_skey: key_at(5),
                app_skey: key_at(21),
            },
            net_id: u32_at(46),
            fcnt_up: u32_at(37),
            fcnt_down: (record[45] & FLAG_FCNT_DOWN_VALID != 0).then(|| u32_at(41)),
            rx1_delay: record[50],
            rx1_dr_offset: record[51],
            rx2_frequency: u32_at(52),
            rx2_data_rate: record[56],
            data_rate: record[57],
            tx_power: record[58],
            nb_trans: record[59],
            adr_ack_cnt: 0,
        });

        let mut blocks = [0u16; 5];
        for (i, block) in blocks.iter_mut().enumerate() {
            *block = u16_at(62 + 2 * i);
        }

        Some(Self {
            session,
            dev_nonce: u16_at(60),
            channel_mask: ChannelMask::from_blocks(blocks),
        })
    }
}

/// CRC-16/CCITT (reflected, initial value 0xFFFF)
fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0xFFFF, |crc, byte| crc_ccitt_update(crc, *byte))
}

fn crc_ccitt_update(crc: u16, byte: u8) -> u16 {
    let mut d = u16::from(byte) ^ (crc & 0x00FF);
    d ^= d << 4;
    d &= 0x00FF;
    ((d << 8) | (crc >> 8)) ^ (d >> 4) ^ (d << 3)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PersistedSession {
        let keys = SessionKeys {
            nwk_skey: AESKey::new([0x11; 16]),
            app_skey: AESKey::new([0x22; 16]),
        };
        let mut session = Session::new(DevAddr::from_u32(0x2601_1BDA), keys, 923_300_000, 8, 2);
        session.net_id = 0x13;
        session.fcnt_up = 70_000;
        session.fcnt_down = Some(12);
        session.rx1_delay = 5;
        session.nb_trans = 2;
        PersistedSession {
            session: Some(session),
            dev_nonce: 0x0102,
            channel_mask: ChannelMask::from_blocks([0, 0xFF00, 0, 0, 0x0002]),
        }
    }

    #[test]
    fn crc_check_value() {
        assert_eq!(crc16(b"123456789"), 0x6F91);
    }

    #[test]
    fn record_survives_round_trip() {
        let saved = sample();
        let record = saved.to_bytes();
        assert_eq!(record[0], FORMAT_VERSION);
        assert_eq!(&record[1..5], &[0xDA, 0x1B, 0x01, 0x26]);
        assert_eq!(PersistedSession::from_bytes(&record), Some(saved));
    }

    #[test]
    fn missing_downlink_counter_is_preserved() {
        let mut saved = sample();
        if let Some(session) = saved.session.as_mut() {
            session.fcnt_down = None;
        }
        let restored = PersistedSession::from_bytes(&saved.to_bytes()).and_then(|r| r.session);
        assert_eq!(restored.map(|s| s.fcnt_down), Some(None));
    }

    #[test]
    fn nonce_is_kept_without_a_session() {
        let saved = PersistedSession {
            session: None,
            dev_nonce: 7,
            channel_mask: ChannelMask::from_blocks([0, 0xFF00, 0, 0, 0x0002]),
        };
        let record = saved.to_bytes();
        assert_eq!(record[45], 0);
        assert!(record[1..60].iter().all(|b| *b == 0));
        assert_eq!(PersistedSession::from_bytes(&record), Some(saved));
    }

    #[test]
    fn corrupted_record_is_rejected() {
        let mut record = sample().to_bytes();
        record[40] ^= 0x01;
        assert_eq!(PersistedSession::from_bytes(&record), None);
    }

    #[test]
    fn foreign_version_is_rejected() {
        let mut record = sample().to_bytes();
        record[0] = FORMAT_VERSION + 1;
        let crc = crc16(&record[..CRC_OFFSET]);
        record[CRC_OFFSET..].copy_from_slice(&crc.to_le_bytes());
        assert_eq!(PersistedSession::from_bytes(&record), None);
    }

    #[test]
    fn blank_flash_is_rejected() {
        assert_eq!(PersistedSession::from_bytes(&[0xFF; PERSISTED_SIZE]), None);
    }
}
