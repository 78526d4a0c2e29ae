use thiserror::Error;

use crate::types::{DeviceFault, ProtocolKind};

/// Errors that can occur while talking to fitness equipment
#[derive(Error, Debug)]
pub enum FitwireError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// No compatible device was found, or the scan was cancelled
    #[error("Discovery failed: {0}")]
    DiscoveryFailed(String),

    /// The device advertised none of the supported protocol services
    #[error("Unsupported device: none of the advertised services match a known protocol")]
    UnsupportedDevice,

    /// A candidate protocol's handshake failed
    #[error("{protocol} handshake failed: {reason}")]
    HandshakeFailed {
        /// Protocol whose handshake failed
        protocol: ProtocolKind,
        /// What went wrong
        reason: String,
    },

    /// Every candidate protocol was tried and none connected
    #[error("All protocols failed, last error: {last}")]
    AllProtocolsFailed {
        /// Error reported by the last candidate tried
        last: Box<FitwireError>,
    },

    /// The device reported a fault code in its telemetry
    #[error("Device fault: {0}")]
    DeviceFault(DeviceFault),

    /// A resistance/incline write was rejected by the transport
    #[error("Command write failed ({protocol}): {reason} [payload {payload:02X?}]")]
    CommandWriteFailed {
        /// Protocol that encoded the command
        protocol: ProtocolKind,
        /// Raw command bytes
        payload: Vec<u8>,
        /// Transport error description
        reason: String,
    },

    /// The active protocol cannot perform this operation
    #[error("{protocol} does not support {operation}")]
    Unsupported {
        /// Active protocol
        protocol: ProtocolKind,
        /// Operation that was requested
        operation: &'static str,
    },

    /// No protocol is active
    #[error("Device disconnected")]
    Disconnected,

    /// Operation not allowed in the current session state
    #[error("Invalid session state: {state}")]
    InvalidState {
        /// Description of the rejected transition
        state: String,
    },

    /// Invalid command parameters
    #[error("Invalid command parameters: {0}")]
    InvalidParameters(String),

    /// Transport operation timed out
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// Transport level failure not covered by a more specific variant
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Result type for fitwire operations
pub type Result<T> = std::result::Result<T, FitwireError>;

impl FitwireError {
    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_) | Self::Disconnected | Self::DiscoveryFailed(_) | Self::Timeout { .. }
        )
    }

    /// Check if the caller can simply retry the operation
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::CommandWriteFailed { .. }
                | Self::DeviceFault(_)
                | Self::HandshakeFailed { .. }
                | Self::Timeout { .. }
                | Self::InvalidParameters(_)
        )
    }

    /// Check if this error moves the session into the error state
    #[must_use]
    pub const fn is_fatal_to_session(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedDevice | Self::AllProtocolsFailed { .. }
        )
    }

    pub(crate) fn handshake(protocol: ProtocolKind, reason: impl Into<String>) -> Self {
        Self::HandshakeFailed {
            protocol,
            reason: reason.into(),
        }
    }
}
