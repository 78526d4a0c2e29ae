use std::{fmt, sync::Arc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    bluetooth_uuid,
    error::{FitwireError, Result},
    events::EventSink,
    protocol::{Protocol, ProtocolHandle},
    transport::Transport,
    types::{ProtocolKind, SessionSettings},
};

/// Canonical form of a service identifier as reported by a platform
///
/// Accepts 16-bit (`"1826"`) and 32-bit (`"0000fff0"`) assigned numbers,
/// which are expanded against the Bluetooth base UUID, and full UUIDs in
/// any case, optionally braced. Returns `None` for anything else.
#[must_use]
pub fn normalize_uuid(raw: &str) -> Option<Uuid> {
    let trimmed = raw.trim().trim_start_matches('{').trim_end_matches('}');
    let short = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    if matches!(short.len(), 4 | 8) && short.chars().all(|c| c.is_ascii_hexdigit()) {
        return u32::from_str_radix(short, 16).ok().map(bluetooth_uuid);
    }
    Uuid::parse_str(trimmed).ok()
}

/// Where a negotiation currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NegotiationState {
    /// Nothing attempted yet
    #[default]
    Idle,
    /// Reading the device's services
    Discovering,
    /// Running a candidate's handshake
    TryingProtocol {
        /// Position in the candidate list
        index: usize,
        /// Candidate being tried
        kind: ProtocolKind,
    },
    /// A protocol was adopted
    Connected(ProtocolKind),
    /// No candidate connected
    AllFailed,
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Discovering => write!(f, "discovering"),
            Self::TryingProtocol { index, kind } => write!(f, "trying {kind} (candidate {index})"),
            Self::Connected(kind) => write!(f, "connected ({kind})"),
            Self::AllFailed => write!(f, "all protocols failed"),
        }
    }
}

/// Decides which protocol a connected device speaks
///
/// Candidates are the protocols whose primary service the device advertises,
/// tried in [`ProtocolKind::PRIORITY`] order. A candidate whose handshake
/// fails is torn down before the next is tried.
#[derive(Debug)]
pub struct Negotiator {
    settings: SessionSettings,
    state: NegotiationState,
}

impl Negotiator {
    /// Negotiator building protocols for these settings
    #[must_use]
    pub const fn new(settings: SessionSettings) -> Self {
        Self {
            settings,
            state: NegotiationState::Idle,
        }
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> NegotiationState {
        self.state
    }

    /// Protocols whose service appears among `advertised`, in priority order
    #[must_use]
    pub fn candidates<S: AsRef<str>>(advertised: &[S]) -> Vec<ProtocolKind> {
        let services: Vec<Uuid> = advertised
            .iter()
            .filter_map(|raw| normalize_uuid(raw.as_ref()))
            .collect();

        ProtocolKind::PRIORITY
            .into_iter()
            .filter(|kind| services.contains(&Protocol::service_uuid(*kind)))
            .collect()
    }

    /// Try every candidate until one handshake succeeds
    ///
    /// # Errors
    ///
    /// - [`FitwireError::DiscoveryFailed`] if the services cannot be read
    /// - [`FitwireError::UnsupportedDevice`] if no known service is advertised
    /// - [`FitwireError::AllProtocolsFailed`] carrying the last handshake error
    pub async fn negotiate(
        &mut self,
        transport: Arc<dyn Transport>,
        events: &EventSink,
    ) -> Result<(Protocol, ProtocolHandle)> {
        self.state = NegotiationState::Discovering;
        let identity = transport.identity().clone();

        let advertised = match transport.services().await {
            Ok(services) => services,
            Err(e) => {
                self.state = NegotiationState::AllFailed;
                return Err(FitwireError::DiscoveryFailed(format!(
                    "reading services of {identity}: {e}"
                )));
            }
        };
        info!("Services of {}: {:?}", identity, advertised);

        let candidates = Self::candidates(&advertised);
        if candidates.is_empty() {
            self.state = NegotiationState::AllFailed;
            events.warn(format!("No known protocol among services {advertised:?}"));
            return Err(FitwireError::UnsupportedDevice);
        }
        events.info(format!(
            "Protocol candidates: {}",
            candidates
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        ));

        let mut last_error = None;
        for (index, kind) in candidates.into_iter().enumerate() {
            self.state = NegotiationState::TryingProtocol { index, kind };
            let scoped = events.scoped(Some(kind), Some(identity.clone()));
            let mut protocol = Protocol::new(kind, &self.settings);

            match protocol.connect(Arc::clone(&transport), &scoped).await {
                Ok(handle) => {
                    self.state = NegotiationState::Connected(kind);
                    scoped.info(format!("Adopted {kind} protocol"));
                    return Ok((protocol, handle));
                }
                Err(e) => {
                    warn!("{} handshake failed: {}", kind, e);
                    scoped.warn(format!("{kind} handshake failed: {e}"));
                    last_error = Some(e);
                }
            }
        }

        self.state = NegotiationState::AllFailed;
        Err(FitwireError::AllProtocolsFailed {
            last: Box::new(last_error.unwrap_or(FitwireError::UnsupportedDevice)),
        })
    }
}
