//! LoRaWAN protocol implementation
//!
//! This module contains the core LoRaWAN protocol implementation, including:
//! - Frame encoding, decoding and authentication
//! - MAC state machine and command handling
//! - PHY timing (time on air, receive windows)
//! - Regional channel plans

/// MAC command handling
pub mod commands;

/// Frame codec
pub mod frame;

/// MAC layer implementation
pub mod mac;

/// PHY layer operations
pub mod phy;

/// Regional parameters and configurations
pub mod region;

pub use mac::{Downlink, MacError, MacLayer, Response, State, Warning};
pub use phy::{PhyConfig, PhyLayer, TimingParams};
