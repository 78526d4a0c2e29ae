#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Fitwire
//!
//! Wire codecs and session management for Bluetooth Low Energy fitness
//! equipment: rowers, bikes, ellipticals and treadmills.
//!
//! The equipment in the wild speaks several incompatible byte protocols.
//! This crate negotiates which one a connected device uses, decodes its
//! notifications into one [`NormalizedTelemetry`] record and encodes
//! resistance and incline commands back into the device's own format.
//!
//! ## Protocols
//!
//! - **V2**: service-indexed packets behind a 3-byte unlock gate. Rowers
//!   report stroke intervals, which run through a drag model.
//! - **V1**: fixed-offset frames starting with `0xAB`, with device fault
//!   codes embedded in the telemetry.
//! - **HuanTong**: a vendor variant of V1 with an init command and a
//!   one-second heartbeat.
//! - **FTMS**: the standard Fitness Machine Service.
//!
//! Devices that only report cadence get speed, distance, power and calories
//! from an interval estimator.
//!
//! ## Quick Start
//!
//! ```no_run
//! use fitwire::{FitnessDevice, SessionEvent, SessionSettings};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (device, mut events) = FitnessDevice::new(SessionSettings::default());
//!
//!     // Scan for "Mobi"/"MB" devices and negotiate a protocol
//!     let protocol = device.scan_and_connect().await?;
//!     println!("connected using {protocol}");
//!
//!     device.set_resistance(12).await?;
//!
//!     while let Some(event) = events.recv().await {
//!         if let SessionEvent::Telemetry(update) = event {
//!             println!("{update:?}");
//!         }
//!     }
//!     Ok(())
//! }
//! ```

/// Bluetooth Low Energy transport backed by btleplug
pub mod ble;
/// Workout duration clock
pub mod clock;
/// Session driver tying transport, protocol and estimator together
pub mod device;
/// Error types and handling
pub mod error;
/// Cadence-only metrics estimation
pub mod estimator;
/// Structured log, error and telemetry events
pub mod events;
/// Protocol negotiation
pub mod negotiator;
/// Wire protocols
pub mod protocol;
/// Connection state machine
pub mod session;
/// Transport abstraction
pub mod transport;
/// Type definitions and data structures
pub mod types;

// Re-export the main types for convenient usage
pub use device::FitnessDevice;
pub use error::{FitwireError, Result};
pub use negotiator::Negotiator;
pub use protocol::{Decoded, Protocol, ProtocolHandle};
pub use transport::{Notification, Transport};
pub use types::{
    ConnectionParams, ConnectionStatus, DeviceFault, DeviceIdentity, DragProfile, EquipmentType,
    EstimatorConfig, NormalizedTelemetry, ProtocolKind, SessionEvent, SessionSettings, UserProfile,
};

use uuid::Uuid;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Low 96 bits of the Bluetooth base UUID `0000xxxx-0000-1000-8000-00805F9B34FB`
pub const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

/// Expand a 16- or 32-bit assigned number against the Bluetooth base UUID
#[must_use]
pub const fn bluetooth_uuid(short: u32) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | BLUETOOTH_BASE_UUID)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bluetooth_uuid() {
        assert_eq!(
            bluetooth_uuid(0x1826).to_string(),
            "00001826-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            bluetooth_uuid(0x1234_5678).to_string(),
            "12345678-0000-1000-8000-00805f9b34fb"
        );
    }
}
