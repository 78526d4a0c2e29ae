//! Wire protocols spoken by supported equipment
//!
//! Each family lives in its own module and exposes the same operations:
//! a handshake producing a [`ProtocolHandle`], a decoder turning one
//! notification into a [`Decoded`] value, and encoders for resistance and
//! incline commands. [`Protocol`] is the closed set of families and
//! dispatches by `match`.

/// Standard Fitness Machine Service
pub mod ftms;
/// HuanTong vendor variant of the V1 framing
pub mod huantong;
/// Stroke-interval analysis for rowers
pub mod rowing;
/// Fixed-offset framed protocol
pub mod v1;
/// Service-indexed protocol with an unlock gate
pub mod v2;

use bytes::Bytes;
use std::sync::Arc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::{
    error::{FitwireError, Result},
    events::EventSink,
    transport::{Notification, Transport},
    types::{DeviceFault, NormalizedTelemetry, ProtocolKind, SessionSettings},
};

pub use ftms::{ControlResponse, ControlResult, FtmsProtocol};
pub use huantong::HuanTongProtocol;
pub use rowing::RowingAnalysis;
pub use v1::V1Protocol;
pub use v2::V2Protocol;

/// Result of decoding one notification
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// Partial telemetry update; empty when the frame was too short or unknown
    Telemetry(NormalizedTelemetry),
    /// Fault code reported by the device
    Fault(DeviceFault),
    /// Asynchronous control point response
    ControlResponse(ControlResponse),
}

impl Decoded {
    /// Empty update, used for frames that cannot be decoded
    #[must_use]
    pub fn skipped() -> Self {
        Self::Telemetry(NormalizedTelemetry::default())
    }
}

/// Per-connection resources acquired by a successful handshake
///
/// Owned by exactly one protocol instance. [`ProtocolHandle::release`]
/// unsubscribes every characteristic and stops background tasks; it is
/// idempotent.
pub struct ProtocolHandle {
    kind: ProtocolKind,
    transport: Arc<dyn Transport>,
    service: Uuid,
    control: Uuid,
    subscriptions: Vec<Uuid>,
    heartbeat: Option<JoinHandle<()>>,
    released: bool,
}

impl ProtocolHandle {
    pub(crate) fn new(
        kind: ProtocolKind,
        transport: Arc<dyn Transport>,
        service: Uuid,
        control: Uuid,
    ) -> Self {
        Self {
            kind,
            transport,
            service,
            control,
            subscriptions: Vec::new(),
            heartbeat: None,
            released: false,
        }
    }

    /// Protocol that owns this handle
    #[must_use]
    pub const fn kind(&self) -> ProtocolKind {
        self.kind
    }

    /// Transport the handle writes through
    #[must_use]
    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport)
    }

    /// Primary service of the protocol
    #[must_use]
    pub const fn service(&self) -> Uuid {
        self.service
    }

    /// Characteristic receiving resistance/incline commands
    #[must_use]
    pub const fn control_characteristic(&self) -> Uuid {
        self.control
    }

    /// Characteristics currently subscribed
    #[must_use]
    pub fn subscriptions(&self) -> &[Uuid] {
        &self.subscriptions
    }

    /// Whether [`ProtocolHandle::release`] already ran
    #[must_use]
    pub const fn is_released(&self) -> bool {
        self.released
    }

    pub(crate) fn require(&self, characteristic: Uuid, role: &str) -> Result<()> {
        if self.transport.has_characteristic(characteristic) {
            Ok(())
        } else {
            Err(FitwireError::handshake(
                self.kind,
                format!("{role} characteristic {characteristic} not found"),
            ))
        }
    }

    pub(crate) async fn subscribe(&mut self, characteristic: Uuid) -> Result<()> {
        self.transport
            .subscribe(characteristic)
            .await
            .map_err(|e| FitwireError::handshake(self.kind, format!("subscribe {characteristic}: {e}")))?;
        self.subscriptions.push(characteristic);
        Ok(())
    }

    pub(crate) fn set_heartbeat(&mut self, task: JoinHandle<()>) {
        if let Some(previous) = self.heartbeat.replace(task) {
            previous.abort();
        }
    }

    /// Stop background tasks and unsubscribe every characteristic
    pub async fn release(&mut self, events: &EventSink) {
        if let Some(task) = self.heartbeat.take() {
            task.abort();
        }
        for characteristic in self.subscriptions.drain(..) {
            if let Err(e) = self.transport.unsubscribe(characteristic).await {
                events.debug(format!("Unsubscribe {characteristic} failed: {e}"));
            }
        }
        if !self.released {
            events.debug(format!("{} handle released", self.kind));
        }
        self.released = true;
    }
}

impl Drop for ProtocolHandle {
    fn drop(&mut self) {
        if let Some(task) = self.heartbeat.take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for ProtocolHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolHandle")
            .field("kind", &self.kind)
            .field("service", &self.service)
            .field("control", &self.control)
            .field("subscriptions", &self.subscriptions)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

/// One protocol family with its per-connection decoding state
#[derive(Debug)]
pub enum Protocol {
    /// Service-indexed packets with an unlock gate
    V2(V2Protocol),
    /// Fixed-offset framed protocol
    V1(V1Protocol),
    /// HuanTong vendor variant
    HuanTong(HuanTongProtocol),
    /// Fitness Machine Service
    Ftms(FtmsProtocol),
}

impl Protocol {
    /// Fresh decoder for a protocol kind
    #[must_use]
    pub fn new(kind: ProtocolKind, settings: &SessionSettings) -> Self {
        match kind {
            ProtocolKind::V2 => Self::V2(V2Protocol::new(settings)),
            ProtocolKind::V1 => Self::V1(V1Protocol::new()),
            ProtocolKind::HuanTong => Self::HuanTong(HuanTongProtocol::new(settings.user)),
            ProtocolKind::Ftms => Self::Ftms(FtmsProtocol::new()),
        }
    }

    /// Kind of this protocol
    #[must_use]
    pub const fn kind(&self) -> ProtocolKind {
        match self {
            Self::V2(_) => ProtocolKind::V2,
            Self::V1(_) => ProtocolKind::V1,
            Self::HuanTong(_) => ProtocolKind::HuanTong,
            Self::Ftms(_) => ProtocolKind::Ftms,
        }
    }

    /// Service that must be advertised for this protocol to be a candidate
    #[must_use]
    pub const fn service_uuid(kind: ProtocolKind) -> Uuid {
        match kind {
            ProtocolKind::V2 => v2::SERVICE_UUID,
            ProtocolKind::V1 => v1::SERVICE_UUID,
            ProtocolKind::HuanTong => huantong::SERVICE_UUID,
            ProtocolKind::Ftms => ftms::SERVICE_UUID,
        }
    }

    /// Run the family-specific handshake
    ///
    /// On failure every partially acquired resource is released before the
    /// error is returned.
    ///
    /// # Errors
    ///
    /// Returns [`FitwireError::HandshakeFailed`] when a required
    /// characteristic is missing or a handshake write is rejected.
    pub async fn connect(
        &mut self,
        transport: Arc<dyn Transport>,
        events: &EventSink,
    ) -> Result<ProtocolHandle> {
        let kind = self.kind();
        let mut handle = ProtocolHandle::new(
            kind,
            transport,
            Self::service_uuid(kind),
            match self {
                Self::V2(_) => v2::CONTROL_UUID,
                Self::V1(_) => v1::WRITE_UUID,
                Self::HuanTong(_) => huantong::WRITE_UUID,
                Self::Ftms(_) => ftms::CONTROL_POINT_UUID,
            },
        );

        let result = match self {
            Self::V2(p) => p.handshake(&mut handle, events).await,
            Self::V1(p) => p.handshake(&mut handle, events).await,
            Self::HuanTong(p) => p.handshake(&mut handle, events).await,
            Self::Ftms(p) => p.handshake(&mut handle, events).await,
        };

        match result {
            Ok(()) => Ok(handle),
            Err(e) => {
                handle.release(events).await;
                Err(e)
            }
        }
    }

    /// Decode one notification
    pub fn decode(&mut self, notification: &Notification) -> Decoded {
        match self {
            Self::V2(p) => p.decode(notification),
            Self::V1(p) => p.decode(&notification.value),
            Self::HuanTong(p) => p.decode(&notification.value),
            Self::Ftms(p) => p.decode(notification),
        }
    }

    /// Encode a set-resistance command
    ///
    /// # Errors
    ///
    /// Returns [`FitwireError::InvalidParameters`] if the level cannot be
    /// represented on the wire.
    pub fn encode_set_resistance(&mut self, level: i32) -> Result<Bytes> {
        match self {
            Self::V2(_) => v2::encode_set_resistance(level),
            Self::V1(p) => p.encode_set_resistance(level),
            Self::HuanTong(p) => p.encode_set_resistance(level),
            Self::Ftms(_) => Ok(ftms::encode_set_resistance(level)),
        }
    }

    /// Encode a set-incline command, in percent
    ///
    /// # Errors
    ///
    /// Returns [`FitwireError::Unsupported`] for families without incline
    /// control.
    pub fn encode_set_incline(&self, percent: f64) -> Result<Bytes> {
        match self {
            Self::Ftms(_) => ftms::encode_set_incline(percent),
            other => Err(FitwireError::Unsupported {
                protocol: other.kind(),
                operation: "incline",
            }),
        }
    }

    /// Release the handle; safe to call more than once
    pub async fn disconnect(&mut self, handle: &mut ProtocolHandle, events: &EventSink) {
        handle.release(events).await;
    }

    /// Forget accumulated stroke state after a workout reset
    pub fn reset(&mut self) {
        if let Self::V2(p) = self {
            p.reset();
        }
    }
}

pub(crate) fn clamp_level(level: i32, min: i32, max: i32) -> i32 {
    level.clamp(min, max)
}

pub(crate) fn level_byte(kind: ProtocolKind, level: i32) -> Result<u8> {
    u8::try_from(level).map_err(|_| {
        FitwireError::InvalidParameters(format!("{kind} resistance level {level} out of range 0-255"))
    })
}
