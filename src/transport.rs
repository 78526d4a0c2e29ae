use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    error::Result,
    types::{ConnectionParams, DeviceIdentity},
};

/// One notification or indication delivered by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Characteristic the value arrived on
    pub characteristic: Uuid,
    /// Raw bytes
    pub value: Vec<u8>,
}

impl Notification {
    /// Create a notification
    #[must_use]
    pub fn new(characteristic: Uuid, value: impl Into<Vec<u8>>) -> Self {
        Self {
            characteristic,
            value: value.into(),
        }
    }
}

/// Stream of notifications from every subscribed characteristic
pub type NotificationStream = BoxStream<'static, Notification>;

/// An already-connected link to a piece of equipment
///
/// Protocols only talk to the device through this trait, so the codec and
/// session logic run the same against a real BLE peripheral and against the
/// in-memory transport used by the tests.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Identity of the connected device
    fn identity(&self) -> &DeviceIdentity;

    /// Service identifiers exposed by the device, as reported by the platform
    async fn services(&self) -> Result<Vec<String>>;

    /// Whether the device exposes a characteristic
    fn has_characteristic(&self, characteristic: Uuid) -> bool;

    /// Enable notifications or indications on a characteristic
    async fn subscribe(&self, characteristic: Uuid) -> Result<()>;

    /// Disable notifications or indications on a characteristic
    async fn unsubscribe(&self, characteristic: Uuid) -> Result<()>;

    /// Write a value to a characteristic
    async fn write(&self, characteristic: Uuid, payload: &[u8], with_response: bool) -> Result<()>;

    /// Stream of incoming notifications; ends when the link drops
    async fn notifications(&self) -> Result<NotificationStream>;

    /// Whether the link is still up
    async fn is_connected(&self) -> bool;

    /// Tear the link down
    async fn disconnect(&self) -> Result<()>;
}

/// Finds devices and opens transports to them
#[async_trait]
pub trait Connector: Send + Sync {
    /// Scan for compatible devices, best signal first
    async fn scan(&self, params: &ConnectionParams) -> Result<Vec<DeviceIdentity>>;

    /// Connect to a device found by a scan or remembered from an earlier session
    async fn connect(
        &self,
        identity: &DeviceIdentity,
        params: &ConnectionParams,
    ) -> Result<Arc<dyn Transport>>;
}
