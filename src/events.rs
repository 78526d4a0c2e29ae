use std::time::SystemTime;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::types::{
    ConnectionStatus, DeviceFault, DeviceIdentity, ErrorEvent, EventContext, LogEvent, LogLevel,
    NormalizedTelemetry, ProtocolKind, SessionEvent,
};

/// Render a payload the way it appears in logs: `AB 03 00 ...`
#[must_use]
pub fn hex_dump(payload: &[u8]) -> String {
    payload
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Sending half of a session's event channel
///
/// Every log call is written to `tracing` and mirrored onto the channel so a
/// host UI can show it. A dropped receiver is not an error; events are then
/// only traced.
#[derive(Debug, Clone)]
pub struct EventSink {
    sender: mpsc::UnboundedSender<SessionEvent>,
    context: EventContext,
}

impl EventSink {
    /// Create a sink and the receiver for its events
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                sender,
                context: EventContext::default(),
            },
            receiver,
        )
    }

    /// Copy of this sink tagging every event with a protocol and device
    #[must_use]
    pub fn scoped(&self, protocol: Option<ProtocolKind>, device: Option<DeviceIdentity>) -> Self {
        Self {
            sender: self.sender.clone(),
            context: EventContext {
                protocol,
                device,
                payload: None,
            },
        }
    }

    /// Context attached to events from this sink
    #[must_use]
    pub const fn context(&self) -> &EventContext {
        &self.context
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.sender.send(event);
    }

    /// Log a message with an optional raw payload
    pub fn log(&self, level: LogLevel, message: impl Into<String>, payload: Option<&[u8]>) {
        let message = message.into();
        let payload = payload.map(hex_dump);
        let protocol = self.context.protocol;

        match level {
            LogLevel::Debug => debug!(?protocol, payload = ?payload, "{message}"),
            LogLevel::Info => info!(?protocol, payload = ?payload, "{message}"),
            LogLevel::Warn => warn!(?protocol, payload = ?payload, "{message}"),
            LogLevel::Error => error!(?protocol, payload = ?payload, "{message}"),
        }

        self.emit(SessionEvent::Log(LogEvent {
            level,
            message,
            context: EventContext {
                payload,
                ..self.context.clone()
            },
            timestamp: SystemTime::now(),
        }));
    }

    /// Log at debug level
    pub fn debug(&self, message: impl Into<String>) {
        self.log(LogLevel::Debug, message, None);
    }

    /// Log at info level
    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message, None);
    }

    /// Log at warn level
    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message, None);
    }

    /// Log at error level
    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message, None);
    }

    /// Raise a user-visible error, also logged at error level
    pub fn raise(&self, message: impl Into<String>, fault: Option<DeviceFault>, payload: Option<&[u8]>) {
        let message = message.into();
        self.log(LogLevel::Error, message.clone(), payload);
        self.emit(SessionEvent::Error(ErrorEvent {
            message,
            fault,
            context: EventContext {
                payload: payload.map(hex_dump),
                ..self.context.clone()
            },
        }));
    }

    /// Publish a telemetry update
    pub fn telemetry(&self, update: NormalizedTelemetry) {
        self.emit(SessionEvent::Telemetry(update));
    }

    /// Publish a status change
    pub fn status(&self, status: ConnectionStatus) {
        info!("Connection status: {status}");
        self.emit(SessionEvent::StatusChanged(status));
    }
}
