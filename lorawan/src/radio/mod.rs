//! Radio hardware abstraction layer

/// Radio driver contract
pub mod traits;

/// Semtech SX1261/SX1262 driver
#[cfg(feature = "sx126x")]
pub mod sx126x;

pub use traits::{ModulationParams, Radio, RadioEvent, RxConfig, TxConfig};
#[cfg(feature = "sx126x")]
pub use sx126x::SX126x;
