//! LoRaWAN cryptographic operations
//!
//! This module provides cryptographic functions for LoRaWAN 1.0 security:
//! - Message Integrity Code (MIC) computation (AES-CMAC)
//! - FRMPayload encryption/decryption
//! - Join accept decryption and MIC
//! - Session key derivation

use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use cmac::{Cmac, Mac};

use crate::config::device::{AESKey, DevAddr, SessionKeys};

/// MIC size in bytes
pub const MIC_SIZE: usize = 4;

/// Block size for AES-128
const BLOCK_SIZE: usize = 16;

/// Direction identifiers for cryptographic operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Direction {
    /// Uplink (device to network)
    Up = 0,
    /// Downlink (network to device)
    Down = 1,
}

fn cipher(key: &AESKey) -> Aes128 {
    Aes128::new(key.as_bytes().into())
}

/// AES-CMAC over the concatenation of `parts`, truncated to the MIC size
fn cmac(key: &AESKey, parts: &[&[u8]]) -> [u8; MIC_SIZE] {
    let mut mac = <Cmac<Aes128> as KeyInit>::new(key.as_bytes().into());
    for part in parts {
        mac.update(part);
    }
    let full = mac.finalize().into_bytes();

    let mut mic = [0u8; MIC_SIZE];
    mic.copy_from_slice(&full[..MIC_SIZE]);
    mic
}

/// Block layout shared by the MIC (B0) and the keystream (Ai) blocks
fn frame_block(tag: u8, dir: Direction, dev_addr: DevAddr, fcnt: u32, last: u8) -> [u8; BLOCK_SIZE] {
    let mut block = [0u8; BLOCK_SIZE];
    block[0] = tag;
    block[5] = dir as u8;
    block[6..10].copy_from_slice(dev_addr.as_bytes());
    block[10..14].copy_from_slice(&fcnt.to_le_bytes());
    block[15] = last;
    block
}

/// Compute Message Integrity Code (MIC) for a LoRaWAN data message
///
/// # Arguments
/// * `key` - Network session key
/// * `data` - MHDR through the end of FRMPayload
/// * `dev_addr` - Device address
/// * `fcnt` - Full 32-bit frame counter
/// * `dir` - Message direction
pub fn compute_mic(
    key: &AESKey,
    data: &[u8],
    dev_addr: DevAddr,
    fcnt: u32,
    dir: Direction,
) -> [u8; MIC_SIZE] {
    let b0 = frame_block(0x49, dir, dev_addr, fcnt, data.len() as u8);
    cmac(key, &[&b0, data])
}

/// Encrypt or decrypt FRMPayload in place
///
/// The keystream is the same in both directions, so applying this twice
/// restores the input.
///
/// # Arguments
/// * `key` - AppSKey for application ports, NwkSKey for port 0
/// * `dev_addr` - Device address
/// * `fcnt` - Full 32-bit frame counter
/// * `dir` - Message direction
/// * `payload` - Data to encrypt/decrypt
pub fn encrypt_payload(key: &AESKey, dev_addr: DevAddr, fcnt: u32, dir: Direction, payload: &mut [u8]) {
    let cipher = cipher(key);

    for (i, chunk) in payload.chunks_mut(BLOCK_SIZE).enumerate() {
        let mut s = frame_block(0x01, dir, dev_addr, fcnt, (i + 1) as u8);
        cipher.encrypt_block(aes::Block::from_mut_slice(&mut s));
        chunk.iter_mut().zip(s.iter()).for_each(|(b, k)| *b ^= k);
    }
}

/// Compute the MIC of a join request (MHDR through DevNonce)
pub fn compute_join_request_mic(key: &AESKey, data: &[u8]) -> [u8; MIC_SIZE] {
    cmac(key, &[data])
}

/// Compute the MIC of a decrypted join accept (MHDR through CFList)
pub fn compute_join_accept_mic(key: &AESKey, data: &[u8]) -> [u8; MIC_SIZE] {
    cmac(key, &[data])
}

/// Decrypt a join accept in place (everything after MHDR, MIC included).
///
/// The network encrypts with AES decrypt, so the device decrypts with AES
/// encrypt. Trailing bytes that do not fill a block are left untouched; the
/// frame codec rejects such lengths before calling this.
pub fn decrypt_join_accept(key: &AESKey, data: &mut [u8]) {
    let cipher = cipher(key);
    for block in data.chunks_exact_mut(BLOCK_SIZE) {
        cipher.encrypt_block(aes::Block::from_mut_slice(block));
    }
}

/// Encrypt a join accept in place, as a network server does
pub fn encrypt_join_accept(key: &AESKey, data: &mut [u8]) {
    let cipher = cipher(key);
    for block in data.chunks_exact_mut(BLOCK_SIZE) {
        cipher.decrypt_block(aes::Block::from_mut_slice(block));
    }
}

/// Derive network and application session keys from join accept
///
/// # Arguments
/// * `app_key` - Application key
/// * `app_nonce` - Application nonce from join accept
/// * `net_id` - Network ID from join accept
/// * `dev_nonce` - Device nonce from join request
pub fn derive_session_keys(
    app_key: &AESKey,
    app_nonce: &[u8; 3],
    net_id: &[u8; 3],
    dev_nonce: u16,
) -> SessionKeys {
    let cipher = cipher(app_key);

    let derive = |tag: u8| {
        let mut block = [0u8; BLOCK_SIZE];
        block[0] = tag;
        block[1..4].copy_from_slice(app_nonce);
        block[4..7].copy_from_slice(net_id);
        block[7..9].copy_from_slice(&dev_nonce.to_le_bytes());
        cipher.encrypt_block(aes::Block::from_mut_slice(&mut block));
        AESKey::new(block)
    };

    SessionKeys {
        nwk_skey: derive(0x01),
        app_skey: derive(0x02),
    }
}
