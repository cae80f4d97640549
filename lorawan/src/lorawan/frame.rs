//! Frame codec
//!
//! Builds and parses LoRaWAN 1.0 PHY payloads:
//! - Data frames (MHDR | FHDR | FPort | FRMPayload | MIC) in both directions
//! - Join request and join accept
//!
//! Decoding never panics on network input; every malformed frame maps to a
//! [`CodecError`].

use heapless::Vec;

use crate::config::device::{AESKey, DevAddr, SessionKeys, EUI64};
use crate::crypto::{self, Direction, MIC_SIZE};

/// Maximum PHY payload the radio can carry
pub const MAX_FRAME_SIZE: usize = 255;

/// Maximum FRMPayload size
pub const MAX_PAYLOAD_SIZE: usize = 242;

/// Maximum FOpts length
pub const MAX_FOPTS_LEN: usize = 15;

/// Largest backwards jump of the 16-bit downlink counter still treated as a
/// replay; anything larger means the counter rolled over its low half.
pub const MAX_FCNT_GAP: u32 = 16_384;

/// MHDR (1) + FHDR without options (7)
const DATA_HEADER_LEN: usize = 8;

/// Join request length including MIC
pub const JOIN_REQUEST_LEN: usize = 23;

/// Join accept lengths (without and with CFList)
const JOIN_ACCEPT_LEN: usize = 17;
const JOIN_ACCEPT_CFLIST_LEN: usize = 33;

/// MAC header types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum MType {
    /// Join request
    JoinRequest = 0x00,
    /// Join accept
    JoinAccept = 0x20,
    /// Unconfirmed data uplink
    UnconfirmedDataUp = 0x40,
    /// Unconfirmed data downlink
    UnconfirmedDataDown = 0x60,
    /// Confirmed data uplink
    ConfirmedDataUp = 0x80,
    /// Confirmed data downlink
    ConfirmedDataDown = 0xA0,
    /// Rejoin request (LoRaWAN 1.1)
    RejoinRequest = 0xC0,
    /// Proprietary
    Proprietary = 0xE0,
}

impl MType {
    /// Decode the MHDR; only LoRaWAN R1 (major 0) is accepted
    pub fn from_mhdr(mhdr: u8) -> Option<Self> {
        if mhdr & 0x03 != 0 {
            return None;
        }
        Some(match mhdr & 0xE0 {
            0x00 => MType::JoinRequest,
            0x20 => MType::JoinAccept,
            0x40 => MType::UnconfirmedDataUp,
            0x60 => MType::UnconfirmedDataDown,
            0x80 => MType::ConfirmedDataUp,
            0xA0 => MType::ConfirmedDataDown,
            0xC0 => MType::RejoinRequest,
            _ => MType::Proprietary,
        })
    }

    /// Direction of a data frame type, `None` for other types
    pub fn direction(self) -> Option<Direction> {
        match self {
            MType::UnconfirmedDataUp | MType::ConfirmedDataUp => Some(Direction::Up),
            MType::UnconfirmedDataDown | MType::ConfirmedDataDown => Some(Direction::Down),
            _ => None,
        }
    }

    /// Whether the frame requests an acknowledgement
    pub fn is_confirmed(self) -> bool {
        matches!(self, MType::ConfirmedDataUp | MType::ConfirmedDataDown)
    }
}

/// Frame header flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FCtrl {
    /// ADR enabled
    pub adr: bool,
    /// ADR acknowledgement request (uplink only)
    pub adr_ack_req: bool,
    /// Acknowledges the last confirmed frame
    pub ack: bool,
    /// More data pending (downlink only)
    pub f_pending: bool,
    /// FOpts length
    pub f_opts_len: u8,
}

impl FCtrl {
    /// Encode to the FCtrl byte
    pub fn to_byte(&self) -> u8 {
        let mut byte = self.f_opts_len & 0x0F;
        if self.adr {
            byte |= 0x80;
        }
        if self.adr_ack_req {
            byte |= 0x40;
        }
        if self.ack {
            byte |= 0x20;
        }
        if self.f_pending {
            byte |= 0x10;
        }
        byte
    }

    /// Decode from the FCtrl byte
    pub fn from_byte(byte: u8) -> Self {
        Self {
            adr: (byte & 0x80) != 0,
            adr_ack_req: (byte & 0x40) != 0,
            ack: (byte & 0x20) != 0,
            f_pending: (byte & 0x10) != 0,
            f_opts_len: byte & 0x0F,
        }
    }
}

/// Frame header
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FHDR {
    /// Device address
    pub dev_addr: DevAddr,
    /// Frame control
    pub f_ctrl: FCtrl,
    /// Low 16 bits of the frame counter
    pub f_cnt: u16,
    /// Piggy-backed MAC commands
    pub f_opts: Vec<u8, MAX_FOPTS_LEN>,
}

/// Codec error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CodecError {
    /// Message integrity check failed
    InvalidMic,
    /// Frame counter not above the last accepted one
    ReplayedCounter,
    /// Truncated, oversized or unexpected frame
    InvalidFrame,
    /// Frame addressed to another device
    AddressMismatch,
}

/// Encoded PHY payload, ready for the radio
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame(Vec<u8, MAX_FRAME_SIZE>);

impl Frame {
    /// Frame bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Frame length in bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the frame is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn push(buf: &mut Vec<u8, MAX_FRAME_SIZE>, bytes: &[u8]) -> Result<(), CodecError> {
    buf.extend_from_slice(bytes).map_err(|_| CodecError::InvalidFrame)
}

/// Data frame to encode
#[derive(Debug, Clone, Copy)]
pub struct DataFrame<'a> {
    /// Message type, selects the direction
    pub mtype: MType,
    /// Frame control flags; `f_opts_len` is filled in from `f_opts`
    pub f_ctrl: FCtrl,
    /// Full 32-bit frame counter
    pub fcnt: u32,
    /// MAC commands carried in FOpts
    pub f_opts: &'a [u8],
    /// Port, `None` for a frame without FRMPayload
    pub f_port: Option<u8>,
    /// Clear-text FRMPayload
    pub payload: &'a [u8],
}

impl DataFrame<'_> {
    /// Encrypt and sign the frame
    ///
    /// Port 0 payloads are MAC commands and use the network session key.
    pub fn encode(&self, dev_addr: DevAddr, keys: &SessionKeys) -> Result<Frame, CodecError> {
        let dir = self.mtype.direction().ok_or(CodecError::InvalidFrame)?;
        if self.f_opts.len() > MAX_FOPTS_LEN
            || self.payload.len() > MAX_PAYLOAD_SIZE
            || (self.f_port.is_none() && !self.payload.is_empty())
            || (self.f_port == Some(0) && !self.f_opts.is_empty())
        {
            return Err(CodecError::InvalidFrame);
        }

        let f_ctrl = FCtrl {
            f_opts_len: self.f_opts.len() as u8,
            ..self.f_ctrl
        };

        let mut buf = Vec::new();
        push(&mut buf, &[self.mtype as u8])?;
        push(&mut buf, dev_addr.as_bytes())?;
        push(&mut buf, &[f_ctrl.to_byte()])?;
        push(&mut buf, &(self.fcnt as u16).to_le_bytes())?;
        push(&mut buf, self.f_opts)?;

        if let Some(port) = self.f_port {
            push(&mut buf, &[port])?;
            let start = buf.len();
            push(&mut buf, self.payload)?;
            let key = if port == 0 { &keys.nwk_skey } else { &keys.app_skey };
            crypto::encrypt_payload(key, dev_addr, self.fcnt, dir, &mut buf[start..]);
        }

        let mic = crypto::compute_mic(&keys.nwk_skey, &buf, dev_addr, self.fcnt, dir);
        push(&mut buf, &mic)?;
        Ok(Frame(buf))
    }
}

/// Authenticated, decrypted data frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    /// Message type
    pub mtype: MType,
    /// Frame header
    pub fhdr: FHDR,
    /// Frame counter extended to 32 bits
    pub fcnt: u32,
    /// Port, `None` when the frame carries no FRMPayload
    pub f_port: Option<u8>,
    /// Decrypted FRMPayload
    pub payload: Vec<u8, MAX_PAYLOAD_SIZE>,
}

/// Extend a 16-bit wire counter to 32 bits relative to the last accepted one.
///
/// Returns `None` when the counter does not advance.
pub fn extend_fcnt(last: Option<u32>, wire: u16) -> Option<u32> {
    let last = match last {
        None => return Some(u32::from(wire)),
        Some(last) => last,
    };

    let mut fcnt = (last & 0xFFFF_0000) | u32::from(wire);
    if fcnt <= last {
        if last - fcnt <= MAX_FCNT_GAP {
            return None;
        }
        fcnt = fcnt.checked_add(0x1_0000)?;
    }
    Some(fcnt)
}

/// Parse, check and decrypt a data frame.
///
/// Checks run in this order: structure, direction, address, counter, MIC.
/// A replayed counter is reported even when the MIC would also fail.
///
/// # Arguments
/// * `bytes` - Received PHY payload
/// * `dir` - Expected direction
/// * `dev_addr` - Own device address
/// * `keys` - Session keys
/// * `last_fcnt` - Last accepted counter in this direction
pub fn decode_data(
    bytes: &[u8],
    dir: Direction,
    dev_addr: DevAddr,
    keys: &SessionKeys,
    last_fcnt: Option<u32>,
) -> Result<DecodedFrame, CodecError> {
    if bytes.len() < DATA_HEADER_LEN + MIC_SIZE || bytes.len() > MAX_FRAME_SIZE {
        return Err(CodecError::InvalidFrame);
    }

    let mtype = MType::from_mhdr(bytes[0]).ok_or(CodecError::InvalidFrame)?;
    if mtype.direction() != Some(dir) {
        return Err(CodecError::InvalidFrame);
    }

    let addr = DevAddr::new([bytes[1], bytes[2], bytes[3], bytes[4]]);
    if addr != dev_addr {
        return Err(CodecError::AddressMismatch);
    }

    let f_ctrl = FCtrl::from_byte(bytes[5]);
    let f_cnt = u16::from_le_bytes([bytes[6], bytes[7]]);
    let opts_end = DATA_HEADER_LEN + usize::from(f_ctrl.f_opts_len);
    let mic_start = bytes.len() - MIC_SIZE;
    if opts_end > mic_start {
        return Err(CodecError::InvalidFrame);
    }

    let fcnt = extend_fcnt(last_fcnt, f_cnt).ok_or(CodecError::ReplayedCounter)?;

    let mic = crypto::compute_mic(&keys.nwk_skey, &bytes[..mic_start], dev_addr, fcnt, dir);
    if mic[..] != bytes[mic_start..] {
        return Err(CodecError::InvalidMic);
    }

    let mut f_opts = Vec::new();
    f_opts
        .extend_from_slice(&bytes[DATA_HEADER_LEN..opts_end])
        .map_err(|_| CodecError::InvalidFrame)?;

    let (f_port, payload) = if opts_end < mic_start {
        let port = bytes[opts_end];
        if port == 0 && !f_opts.is_empty() {
            return Err(CodecError::InvalidFrame);
        }
        let mut payload: Vec<u8, MAX_PAYLOAD_SIZE> = Vec::new();
        payload
            .extend_from_slice(&bytes[opts_end + 1..mic_start])
            .map_err(|_| CodecError::InvalidFrame)?;
        let key = if port == 0 { &keys.nwk_skey } else { &keys.app_skey };
        crypto::encrypt_payload(key, dev_addr, fcnt, dir, &mut payload);
        (Some(port), payload)
    } else {
        (None, Vec::new())
    };

    Ok(DecodedFrame {
        mtype,
        fhdr: FHDR {
            dev_addr: addr,
            f_ctrl,
            f_cnt,
            f_opts,
        },
        fcnt,
        f_port,
        payload,
    })
}

/// Join request fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct JoinRequest {
    /// Application EUI (JoinEUI)
    pub app_eui: EUI64,
    /// Device EUI
    pub dev_eui: EUI64,
    /// Nonce, never reused with the same AppKey
    pub dev_nonce: u16,
}

impl JoinRequest {
    /// Build the signed join request
    pub fn encode(&self, app_key: &AESKey) -> Frame {
        let mut bytes = [0u8; JOIN_REQUEST_LEN];
        bytes[0] = MType::JoinRequest as u8;
        bytes[1..9].copy_from_slice(&self.app_eui);
        bytes[9..17].copy_from_slice(&self.dev_eui);
        bytes[17..19].copy_from_slice(&self.dev_nonce.to_le_bytes());
        let mic = crypto::compute_join_request_mic(app_key, &bytes[..19]);
        bytes[19..].copy_from_slice(&mic);

        let mut buf = Vec::new();
        // 23 bytes always fit.
        let _ = buf.extend_from_slice(&bytes);
        Frame(buf)
    }

    /// Parse and verify a join request, as a network server does
    pub fn decode(bytes: &[u8], app_key: &AESKey) -> Result<Self, CodecError> {
        if bytes.len() != JOIN_REQUEST_LEN || MType::from_mhdr(bytes[0]) != Some(MType::JoinRequest) {
            return Err(CodecError::InvalidFrame);
        }
        if crypto::compute_join_request_mic(app_key, &bytes[..19])[..] != bytes[19..] {
            return Err(CodecError::InvalidMic);
        }

        let mut app_eui = [0u8; 8];
        let mut dev_eui = [0u8; 8];
        app_eui.copy_from_slice(&bytes[1..9]);
        dev_eui.copy_from_slice(&bytes[9..17]);
        Ok(Self {
            app_eui,
            dev_eui,
            dev_nonce: u16::from_le_bytes([bytes[17], bytes[18]]),
        })
    }
}

/// Optional channel list appended to a join accept
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CfList {
    /// Type 0: five extra channel frequencies in Hz
    Frequencies([u32; 5]),
    /// Type 1: channel mask blocks of 16 channels each
    ChannelMask([u16; 5]),
}

impl CfList {
    fn from_bytes(bytes: &[u8; 16]) -> Option<Self> {
        match bytes[15] {
            0 => {
                let mut freqs = [0u32; 5];
                for (i, f) in freqs.iter_mut().enumerate() {
                    let b = &bytes[i * 3..i * 3 + 3];
                    *f = u32::from_le_bytes([b[0], b[1], b[2], 0]) * 100;
                }
                Some(CfList::Frequencies(freqs))
            }
            1 => {
                let mut masks = [0u16; 5];
                for (i, m) in masks.iter_mut().enumerate() {
                    *m = u16::from_le_bytes([bytes[i * 2], bytes[i * 2 + 1]]);
                }
                Some(CfList::ChannelMask(masks))
            }
            _ => None,
        }
    }

    fn to_bytes(&self) -> [u8; 16] {
        let mut bytes = [0u8; 16];
        match self {
            CfList::Frequencies(freqs) => {
                for (i, f) in freqs.iter().enumerate() {
                    bytes[i * 3..i * 3 + 3].copy_from_slice(&(f / 100).to_le_bytes()[..3]);
                }
            }
            CfList::ChannelMask(masks) => {
                for (i, m) in masks.iter().enumerate() {
                    bytes[i * 2..i * 2 + 2].copy_from_slice(&m.to_le_bytes());
                }
                bytes[15] = 1;
            }
        }
        bytes
    }
}

/// Join accept fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct JoinAccept {
    /// Server nonce
    pub app_nonce: [u8; 3],
    /// Network identifier
    pub net_id: [u8; 3],
    /// Assigned device address
    pub dev_addr: DevAddr,
    /// RX1 data rate offset
    pub rx1_dr_offset: u8,
    /// RX2 data rate
    pub rx2_data_rate: u8,
    /// RX1 delay in seconds (1-15)
    pub rx_delay: u8,
    /// Optional channel list
    pub cf_list: Option<CfList>,
}

impl JoinAccept {
    /// NetID as a number
    pub fn net_id_u32(&self) -> u32 {
        u32::from_le_bytes([self.net_id[0], self.net_id[1], self.net_id[2], 0])
    }

    /// Decrypt and verify a received join accept.
    ///
    /// An unknown CFList type is ignored rather than rejecting the accept.
    pub fn decode(bytes: &[u8], app_key: &AESKey) -> Result<Self, CodecError> {
        let len = bytes.len();
        if (len != JOIN_ACCEPT_LEN && len != JOIN_ACCEPT_CFLIST_LEN)
            || MType::from_mhdr(bytes[0]) != Some(MType::JoinAccept)
        {
            return Err(CodecError::InvalidFrame);
        }

        let mut plain = [0u8; JOIN_ACCEPT_CFLIST_LEN];
        plain[..len].copy_from_slice(bytes);
        crypto::decrypt_join_accept(app_key, &mut plain[1..len]);

        let mic_start = len - MIC_SIZE;
        if crypto::compute_join_accept_mic(app_key, &plain[..mic_start])[..] != plain[mic_start..len] {
            return Err(CodecError::InvalidMic);
        }

        let p = &plain[1..mic_start];
        let cf_list = if p.len() == 28 {
            let mut raw = [0u8; 16];
            raw.copy_from_slice(&p[12..28]);
            CfList::from_bytes(&raw)
        } else {
            None
        };

        Ok(Self {
            app_nonce: [p[0], p[1], p[2]],
            net_id: [p[3], p[4], p[5]],
            dev_addr: DevAddr::new([p[6], p[7], p[8], p[9]]),
            rx1_dr_offset: (p[10] >> 4) & 0x07,
            rx2_data_rate: p[10] & 0x0F,
            rx_delay: match p[11] & 0x0F {
                0 => 1,
                d => d,
            },
            cf_list,
        })
    }

    /// Sign and encrypt, as a network server does
    pub fn encode(&self, app_key: &AESKey) -> Frame {
        let mut plain = [0u8; JOIN_ACCEPT_CFLIST_LEN];
        plain[0] = MType::JoinAccept as u8;
        plain[1..4].copy_from_slice(&self.app_nonce);
        plain[4..7].copy_from_slice(&self.net_id);
        plain[7..11].copy_from_slice(self.dev_addr.as_bytes());
        plain[11] = ((self.rx1_dr_offset & 0x07) << 4) | (self.rx2_data_rate & 0x0F);
        plain[12] = self.rx_delay & 0x0F;

        let mut len = 13;
        if let Some(cf_list) = &self.cf_list {
            plain[13..29].copy_from_slice(&cf_list.to_bytes());
            len = 29;
        }
        let mic = crypto::compute_join_accept_mic(app_key, &plain[..len]);
        plain[len..len + MIC_SIZE].copy_from_slice(&mic);
        len += MIC_SIZE;

        crypto::encrypt_join_accept(app_key, &mut plain[1..len]);
        let mut buf = Vec::new();
        let _ = buf.extend_from_slice(&plain[..len]);
        Frame(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> SessionKeys {
        SessionKeys {
            nwk_skey: AESKey::new([0x11; 16]),
            app_skey: AESKey::new([0x22; 16]),
        }
    }

    const ADDR: DevAddr = DevAddr::from_u32(0x2601_1BDA);

    fn downlink(fcnt: u32, payload: &[u8]) -> Frame {
        DataFrame {
            mtype: MType::UnconfirmedDataDown,
            f_ctrl: FCtrl::default(),
            fcnt,
            f_opts: &[],
            f_port: Some(10),
            payload,
        }
        .encode(ADDR, &keys())
        .unwrap()
    }

    #[test]
    fn fctrl_bits() {
        let f_ctrl = FCtrl {
            adr: true,
            ack: true,
            f_opts_len: 3,
            ..FCtrl::default()
        };
        assert_eq!(f_ctrl.to_byte(), 0xA3);
        assert_eq!(FCtrl::from_byte(0xA3), f_ctrl);
    }

    #[test]
    fn uplink_layout() {
        let frame = DataFrame {
            mtype: MType::ConfirmedDataUp,
            f_ctrl: FCtrl {
                adr: true,
                ..FCtrl::default()
            },
            fcnt: 0x0001_0203,
            f_opts: &[0x02],
            f_port: Some(1),
            payload: b"hi",
        }
        .encode(ADDR, &keys())
        .unwrap();

        let b = frame.as_bytes();
        assert_eq!(b.len(), 1 + 7 + 1 + 1 + 2 + 4);
        assert_eq!(b[0], 0x80);
        assert_eq!(&b[1..5], &[0xDA, 0x1B, 0x01, 0x26]);
        assert_eq!(b[5], 0x81);
        assert_eq!(&b[6..8], &[0x03, 0x02]);
        assert_eq!(b[8], 0x02);
        assert_eq!(b[9], 1);
    }

    #[test]
    fn decode_restores_payload_and_counter() {
        let frame = downlink(42, b"set-interval=300");
        let decoded = decode_data(frame.as_bytes(), Direction::Down, ADDR, &keys(), Some(41)).unwrap();
        assert_eq!(decoded.fcnt, 42);
        assert_eq!(decoded.f_port, Some(10));
        assert_eq!(&decoded.payload[..], b"set-interval=300");
    }

    #[test]
    fn any_bit_flip_breaks_the_mic() {
        let frame = downlink(5, b"abc");
        let bytes = frame.as_bytes();
        // Ciphertext starts after MHDR, FHDR and FPort.
        for i in 9..bytes.len() {
            for bit in 0..8 {
                let mut copy: Vec<u8, MAX_FRAME_SIZE> = Vec::from_slice(bytes).unwrap();
                copy[i] ^= 1 << bit;
                assert_eq!(
                    decode_data(&copy, Direction::Down, ADDR, &keys(), None),
                    Err(CodecError::InvalidMic)
                );
            }
        }
    }

    #[test]
    fn replay_is_reported_before_mic() {
        let frame = downlink(7, b"x");
        assert_eq!(
            decode_data(frame.as_bytes(), Direction::Down, ADDR, &keys(), Some(7)),
            Err(CodecError::ReplayedCounter)
        );

        let mut forged: Vec<u8, MAX_FRAME_SIZE> = Vec::from_slice(frame.as_bytes()).unwrap();
        let last = forged.len() - 1;
        forged[last] ^= 0xFF;
        assert_eq!(
            decode_data(&forged, Direction::Down, ADDR, &keys(), Some(9)),
            Err(CodecError::ReplayedCounter)
        );
    }

    #[test]
    fn foreign_address_and_wrong_direction_are_rejected() {
        let frame = downlink(1, b"x");
        assert_eq!(
            decode_data(frame.as_bytes(), Direction::Down, DevAddr::from_u32(1), &keys(), None),
            Err(CodecError::AddressMismatch)
        );
        assert_eq!(
            decode_data(frame.as_bytes(), Direction::Up, ADDR, &keys(), None),
            Err(CodecError::InvalidFrame)
        );
        assert_eq!(
            decode_data(&frame.as_bytes()[..10], Direction::Down, ADDR, &keys(), None),
            Err(CodecError::InvalidFrame)
        );
    }

    #[test]
    fn counter_extension() {
        assert_eq!(extend_fcnt(None, 0), Some(0));
        assert_eq!(extend_fcnt(Some(10), 11), Some(11));
        assert_eq!(extend_fcnt(Some(10), 10), None);
        assert_eq!(extend_fcnt(Some(10), 3), None);
        assert_eq!(extend_fcnt(Some(0xFFF0), 0x0002), Some(0x1_0002));
        assert_eq!(extend_fcnt(Some(0x1_0005), 0x0009), Some(0x1_0009));
    }

    #[test]
    fn join_accept_with_channel_mask() {
        let app_key = AESKey::new([0x5A; 16]);
        let accept = JoinAccept {
            app_nonce: [1, 2, 3],
            net_id: [0x13, 0, 0],
            dev_addr: ADDR,
            rx1_dr_offset: 0,
            rx2_data_rate: 8,
            rx_delay: 1,
            cf_list: Some(CfList::ChannelMask([0, 0xFF00, 0, 0, 0x0002])),
        };
        let frame = accept.encode(&app_key);
        assert_eq!(frame.len(), 33);
        assert_eq!(JoinAccept::decode(frame.as_bytes(), &app_key), Ok(accept));

        let mut tampered: Vec<u8, MAX_FRAME_SIZE> = Vec::from_slice(frame.as_bytes()).unwrap();
        tampered[5] ^= 0x01;
        assert_eq!(
            JoinAccept::decode(&tampered, &app_key),
            Err(CodecError::InvalidMic)
        );
    }

    #[test]
    fn join_request_round_trip() {
        let app_key = AESKey::new([0x5A; 16]);
        let request = JoinRequest {
            app_eui: [1; 8],
            dev_eui: [2; 8],
            dev_nonce: 0x0102,
        };
        let frame = request.encode(&app_key);
        assert_eq!(frame.as_bytes()[17..19], [0x02, 0x01]);
        assert_eq!(JoinRequest::decode(frame.as_bytes(), &app_key), Ok(request));
        assert_eq!(
            JoinRequest::decode(frame.as_bytes(), &AESKey::new([0; 16])),
            Err(CodecError::InvalidMic)
        );
    }
}
