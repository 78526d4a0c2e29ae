use serde::{Deserialize, Serialize};

use crate::{
    error::{FitwireError, Result},
    types::{ConnectionStatus, DeviceIdentity, ProtocolKind},
};

/// Connection state of one session
///
/// The status field is the only guard against overlapping scans and
/// connects: [`ConnectionSession::transition`] rejects every move not in
/// the table below with [`FitwireError::InvalidState`].
///
/// | from | to |
/// |---|---|
/// | Disconnected | Scanning, Connecting |
/// | Scanning | Connecting, Disconnected |
/// | Connecting | Connected, Disconnected |
/// | Connected | Disconnected |
/// | Error | Disconnected |
/// | any | Error |
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSession {
    /// Current status
    pub status: ConnectionStatus,
    /// Protocol adopted by the last successful negotiation
    pub active_protocol: Option<ProtocolKind>,
    /// Description of the last connection-level failure
    pub last_error: Option<String>,
    /// Device remembered for quick reconnect
    pub last_device: Option<DeviceIdentity>,
    /// Device currently being connected or connected
    pub device: Option<DeviceIdentity>,
}

impl ConnectionSession {
    /// Fresh disconnected session
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `from -> to` is an allowed move
    #[must_use]
    pub const fn is_allowed(from: ConnectionStatus, to: ConnectionStatus) -> bool {
        use ConnectionStatus::{Connected, Connecting, Disconnected, Error, Scanning};
        matches!(
            (from, to),
            (Disconnected, Scanning | Connecting)
                | (Scanning, Connecting | Disconnected)
                | (Connecting, Connected | Disconnected)
                | (Connected | Error, Disconnected)
                | (_, Error)
        )
    }

    /// Move to `to`
    ///
    /// # Errors
    ///
    /// Returns [`FitwireError::InvalidState`] if the move is not allowed.
    pub fn transition(&mut self, to: ConnectionStatus) -> Result<()> {
        if !Self::is_allowed(self.status, to) {
            return Err(FitwireError::InvalidState {
                state: format!("cannot go from {} to {to}", self.status),
            });
        }
        self.status = to;
        Ok(())
    }

    fn ensure_idle(&self, operation: &str) -> Result<()> {
        match self.status {
            ConnectionStatus::Scanning | ConnectionStatus::Connecting | ConnectionStatus::Connected => {
                Err(FitwireError::InvalidState {
                    state: format!("{operation} while {}", self.status),
                })
            }
            ConnectionStatus::Disconnected | ConnectionStatus::Error => Ok(()),
        }
    }

    /// Enter `Scanning`
    ///
    /// A session in `Error` is first returned to `Disconnected`.
    ///
    /// # Errors
    ///
    /// Returns [`FitwireError::InvalidState`] while scanning, connecting or
    /// connected.
    pub fn begin_scan(&mut self) -> Result<()> {
        self.ensure_idle("scan")?;
        if self.status == ConnectionStatus::Error {
            self.transition(ConnectionStatus::Disconnected)?;
        }
        self.transition(ConnectionStatus::Scanning)
    }

    /// Enter `Connecting` for a device
    ///
    /// Allowed straight from `Disconnected` (quick reconnect) or after a
    /// scan found the device.
    ///
    /// # Errors
    ///
    /// Returns [`FitwireError::InvalidState`] while connecting or connected.
    pub fn begin_connect(&mut self, device: DeviceIdentity) -> Result<()> {
        if self.status != ConnectionStatus::Scanning {
            self.ensure_idle("connect")?;
            if self.status == ConnectionStatus::Error {
                self.transition(ConnectionStatus::Disconnected)?;
            }
        }
        self.transition(ConnectionStatus::Connecting)?;
        self.device = Some(device);
        Ok(())
    }

    /// Negotiation succeeded
    ///
    /// # Errors
    ///
    /// Returns [`FitwireError::InvalidState`] unless connecting.
    pub fn mark_connected(&mut self, protocol: ProtocolKind) -> Result<()> {
        self.transition(ConnectionStatus::Connected)?;
        self.active_protocol = Some(protocol);
        self.last_error = None;
        self.last_device.clone_from(&self.device);
        Ok(())
    }

    /// Connection-level failure; always allowed
    pub fn fail(&mut self, error: &FitwireError) {
        self.status = ConnectionStatus::Error;
        self.active_protocol = None;
        self.device = None;
        self.last_error = Some(error.to_string());
    }

    /// Back to `Disconnected`; a no-op when already there
    pub fn mark_disconnected(&mut self) {
        if self.status != ConnectionStatus::Disconnected {
            self.status = ConnectionStatus::Disconnected;
        }
        self.active_protocol = None;
        self.device = None;
    }

    /// Forget the remembered device
    pub fn forget_device(&mut self) {
        self.last_device = None;
    }
}
