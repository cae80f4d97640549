//! Device and network configuration
//!
//! This module contains types for configuring LoRaWAN devices and the MAC
//! engine. It includes:
//! - Device identity and root keys (DevEUI, AppEUI, AppKey)
//! - Session state created by activation
//! - MAC timing, retry and ADR tuning

/// Device configuration and session state
pub mod device;

/// MAC engine tuning
pub mod mac;

pub use device::{DeviceConfig, Session, SessionKeys};
pub use mac::MacConfig;
