//! Class A LoRaWAN MAC engine for AU915 sensor nodes
//!
//! This crate drives a LoRa transceiver as a LoRaWAN 1.0.x Class A end
//! device. It handles OTAA join, uplink scheduling, receive-window timing
//! under clock drift and AU915 channel hopping with dwell-time limits.
//!
//! # Features
//! - OTAA and ABP activation
//! - Confirmed and unconfirmed uplinks with retransmission
//! - ADR and the LoRaWAN 1.0 MAC commands
//! - AU915 channel plan behind the [`ChannelPlan`](lorawan::region::ChannelPlan) trait
//! - Interrupt-driven: no blocking waits, one SPSC event queue per interrupt source
//! - Session persistence through a byte-level [`SessionStore`](storage::SessionStore)
//! - SX1261/SX1262 driver (feature `sx126x`)
//! - Logging through `defmt` or `log`
//!
//! # Example
//! ```ignore
//! use lorawan::{
//!     config::{device::AESKey, DeviceConfig, MacConfig},
//!     device::LoRaWANDevice,
//!     lorawan::{region::Au915, Response},
//!     storage::VolatileStore,
//!     timer::EventChannel,
//! };
//!
//! let config = DeviceConfig::new_otaa(dev_eui, app_eui, AESKey::new(app_key));
//! let mut device = LoRaWANDevice::new(
//!     radio,
//!     clock,
//!     Au915::new(seed),
//!     VolatileStore,
//!     config,
//!     MacConfig::default(),
//! )?;
//!
//! // `radio_irq` goes to the DIO1 handler, `alarm` to the timer handler
//! let (radio_irq, alarm, mut events) = channel.split();
//!
//! device.join()?;
//! loop {
//!     match device.process(&mut events) {
//!         Ok(Response::JoinSuccess) => {
//!             device.send(1, b"hello", false)?;
//!         }
//!         Ok(_) => {}
//!         Err(nb::Error::WouldBlock) => wait_for_interrupt(),
//!         Err(nb::Error::Other(e)) => handle(e),
//!     }
//! }
//! ```

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![warn(missing_docs)]

#[macro_use]
mod fmt;

/// Device and network configuration
pub mod config;

/// Cryptographic functions
pub mod crypto;

/// High-level device interface
pub mod device;

/// LoRaWAN protocol implementation
pub mod lorawan;

/// Radio hardware abstraction layer
pub mod radio;

/// Session persistence
pub mod storage;

/// Clock abstraction and interrupt handoff
pub mod timer;
