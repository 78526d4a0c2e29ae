use crate::{
    ble::BleManager,
    clock::{WorkoutClock, TICK_INTERVAL},
    error::{FitwireError, Result},
    estimator::IntervalEstimator,
    events::EventSink,
    negotiator::Negotiator,
    protocol::{ControlResult, Decoded, Protocol, ProtocolHandle},
    session::ConnectionSession,
    transport::{Connector, Notification, NotificationStream, Transport},
    types::{
        ConnectionStatus, DeviceIdentity, LogLevel, NormalizedTelemetry, ProtocolKind,
        SessionEvent, SessionSettings,
    },
};
use bytes::Bytes;
use futures::StreamExt;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc::UnboundedReceiver, Mutex, RwLock},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Protocol state of the live link
struct ActiveLink {
    protocol: Protocol,
    handle: ProtocolHandle,
    events: EventSink,
}

/// Everything that is reset together with the workout
struct Workout {
    telemetry: NormalizedTelemetry,
    estimator: IntervalEstimator,
    clock: WorkoutClock,
    /// Set once the live link reports speed, distance, power or calories itself
    direct_metrics: bool,
}

impl Workout {
    fn new(settings: &SessionSettings) -> Self {
        Self {
            telemetry: NormalizedTelemetry::default(),
            estimator: IntervalEstimator::new(settings.estimator),
            clock: WorkoutClock::new(),
            direct_metrics: false,
        }
    }
}

#[derive(Default)]
struct Tasks {
    pump: Option<JoinHandle<()>>,
    ticker: Option<JoinHandle<()>>,
}

/// A resistance or incline command ready to be written
struct Command {
    label: &'static str,
    kind: ProtocolKind,
    payload: Bytes,
    transport: Arc<dyn Transport>,
    characteristic: Uuid,
    events: EventSink,
}

/// Session with one piece of fitness equipment
///
/// `FitnessDevice` owns the whole connection lifecycle: scanning, connecting,
/// negotiating the wire protocol, decoding notifications into merged
/// telemetry, estimating missing metrics, keeping the workout clock and
/// encoding resistance and incline commands. Everything the session
/// observes is published on the event channel returned by the constructor.
///
/// The handle is cheap to clone; every clone drives the same session.
///
/// # Examples
///
/// ```no_run
/// use fitwire::{FitnessDevice, SessionEvent, SessionSettings};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let (device, mut events) = FitnessDevice::new(SessionSettings::default());
///
///     let protocol = device.scan_and_connect().await?;
///     println!("Connected using {protocol}");
///
///     device.set_resistance(8).await?;
///
///     while let Some(event) = events.recv().await {
///         if let SessionEvent::Telemetry(update) = event {
///             println!("{update:?}");
///         }
///     }
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct FitnessDevice {
    settings: Arc<SessionSettings>,
    events: EventSink,
    connector: Arc<Mutex<Option<Arc<dyn Connector>>>>,
    session: Arc<RwLock<ConnectionSession>>,
    active: Arc<Mutex<Option<ActiveLink>>>,
    workout: Arc<Mutex<Workout>>,
    tasks: Arc<Mutex<Tasks>>,
}

impl FitnessDevice {
    /// Create a session using the platform's Bluetooth adapter
    ///
    /// The adapter is opened lazily on the first scan or reconnect.
    #[must_use]
    pub fn new(settings: SessionSettings) -> (Self, UnboundedReceiver<SessionEvent>) {
        Self::build(settings, None)
    }

    /// Create a session that finds and opens devices through `connector`
    #[must_use]
    pub fn with_connector(
        settings: SessionSettings,
        connector: Arc<dyn Connector>,
    ) -> (Self, UnboundedReceiver<SessionEvent>) {
        Self::build(settings, Some(connector))
    }

    fn build(
        settings: SessionSettings,
        connector: Option<Arc<dyn Connector>>,
    ) -> (Self, UnboundedReceiver<SessionEvent>) {
        let (events, receiver) = EventSink::channel();
        let device = Self {
            workout: Arc::new(Mutex::new(Workout::new(&settings))),
            settings: Arc::new(settings),
            events,
            connector: Arc::new(Mutex::new(connector)),
            session: Arc::new(RwLock::new(ConnectionSession::new())),
            active: Arc::new(Mutex::new(None)),
            tasks: Arc::new(Mutex::new(Tasks::default())),
        };
        (device, receiver)
    }

    /// Settings the session was created with
    #[must_use]
    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Current connection status
    pub async fn status(&self) -> ConnectionStatus {
        self.session.read().await.status
    }

    /// Snapshot of the connection session
    pub async fn session(&self) -> ConnectionSession {
        self.session.read().await.clone()
    }

    /// Protocol of the live link, if connected
    pub async fn active_protocol(&self) -> Option<ProtocolKind> {
        self.session.read().await.active_protocol
    }

    /// Merged telemetry of the current workout
    pub async fn telemetry(&self) -> NormalizedTelemetry {
        self.workout.lock().await.telemetry.clone()
    }

    /// Forget the device remembered for quick reconnect
    pub async fn forget_device(&self) {
        self.session.write().await.forget_device();
    }

    async fn connector(&self) -> Result<Arc<dyn Connector>> {
        let mut slot = self.connector.lock().await;
        if let Some(connector) = slot.as_ref() {
            return Ok(Arc::clone(connector));
        }
        let manager: Arc<dyn Connector> = Arc::new(BleManager::new().await?);
        *slot = Some(Arc::clone(&manager));
        Ok(manager)
    }

    /// Apply a session change and publish the status if it moved
    async fn update_session(
        &self,
        change: impl FnOnce(&mut ConnectionSession) -> Result<()>,
    ) -> Result<()> {
        let mut session = self.session.write().await;
        let before = session.status;
        let result = change(&mut session);
        let after = session.status;
        drop(session);

        if before != after {
            self.events.status(after);
        }
        result
    }

    /// Scan, connect to the strongest compatible device and negotiate
    ///
    /// # Errors
    ///
    /// - [`FitwireError::InvalidState`] if a scan or connect is in progress,
    ///   or a device is connected
    /// - [`FitwireError::DiscoveryFailed`] if nothing compatible was found;
    ///   the session returns to `Disconnected`
    /// - connection and negotiation errors, which leave the session in `Error`
    pub async fn scan_and_connect(&self) -> Result<ProtocolKind> {
        self.update_session(ConnectionSession::begin_scan).await?;
        self.events.info(format!(
            "Scanning for devices named {:?}",
            self.settings.connection.name_prefixes
        ));

        let scanned = async {
            let connector = self.connector().await?;
            let found = connector.scan(&self.settings.connection).await?;
            Ok::<_, FitwireError>((connector, found))
        }
        .await;

        let (connector, identity) = match scanned {
            Ok((connector, found)) => {
                if let Some(identity) = found.into_iter().next() {
                    (connector, identity)
                } else {
                    self.abandon_scan().await;
                    let err = FitwireError::DiscoveryFailed("no compatible device found".to_string());
                    self.events.warn(err.to_string());
                    return Err(err);
                }
            }
            Err(e) => {
                self.abandon_scan().await;
                self.events.error(format!("Scan failed: {e}"));
                return Err(e);
            }
        };

        self.connect_to(connector, identity).await
    }

    async fn abandon_scan(&self) {
        let _ = self
            .update_session(|session| {
                session.mark_disconnected();
                Ok(())
            })
            .await;
    }

    /// Reconnect to the remembered device without scanning
    ///
    /// Falls back to [`FitnessDevice::scan_and_connect`] when no device is
    /// remembered or the remembered one cannot be reached or negotiated.
    ///
    /// # Errors
    ///
    /// Returns [`FitwireError::InvalidState`] while busy or connected, or the
    /// error of the fallback scan.
    pub async fn quick_reconnect(&self) -> Result<ProtocolKind> {
        let remembered = self.session.read().await.last_device.clone();
        let Some(identity) = remembered else {
            self.events.info("No remembered device, scanning");
            return self.scan_and_connect().await;
        };

        self.events.info(format!("Reconnecting to {identity}"));
        let connector = self.connector().await?;
        match self.connect_to(connector, identity).await {
            Err(e @ FitwireError::InvalidState { .. }) => Err(e),
            Err(e) => {
                self.events.warn(format!("Quick reconnect failed ({e}), scanning"));
                self.scan_and_connect().await
            }
            ok => ok,
        }
    }

    /// Negotiate over a link the host opened itself
    ///
    /// # Errors
    ///
    /// Returns [`FitwireError::InvalidState`] while busy or connected, or the
    /// negotiation error, which leaves the session in `Error`.
    pub async fn attach(&self, transport: Arc<dyn Transport>) -> Result<ProtocolKind> {
        let identity = transport.identity().clone();
        self.update_session(|session| session.begin_connect(identity))
            .await?;
        self.establish(transport).await
    }

    async fn connect_to(
        &self,
        connector: Arc<dyn Connector>,
        identity: DeviceIdentity,
    ) -> Result<ProtocolKind> {
        self.update_session(|session| session.begin_connect(identity.clone()))
            .await?;

        match connector.connect(&identity, &self.settings.connection).await {
            Ok(transport) => self.establish(transport).await,
            Err(e) => {
                self.fail(&e, &identity, None).await;
                Err(e)
            }
        }
    }

    /// Connection-level failure: session to `Error`, link dropped
    async fn fail(
        &self,
        error: &FitwireError,
        identity: &DeviceIdentity,
        transport: Option<&Arc<dyn Transport>>,
    ) {
        let _ = self
            .update_session(|session| {
                session.fail(error);
                Ok(())
            })
            .await;
        self.events
            .scoped(None, Some(identity.clone()))
            .raise(format!("{identity}: {error}"), None, None);

        if let Some(transport) = transport {
            if let Err(e) = transport.disconnect().await {
                warn!("Dropping failed link: {}", e);
            }
        }
    }

    async fn establish(&self, transport: Arc<dyn Transport>) -> Result<ProtocolKind> {
        let identity = transport.identity().clone();

        // Taken before negotiating so nothing sent after a subscribe is lost
        let stream = match transport.notifications().await {
            Ok(stream) => stream,
            Err(e) => {
                self.fail(&e, &identity, Some(&transport)).await;
                return Err(e);
            }
        };

        let mut negotiator = Negotiator::new((*self.settings).clone());
        let (protocol, handle) = match negotiator
            .negotiate(Arc::clone(&transport), &self.events)
            .await
        {
            Ok(adopted) => adopted,
            Err(e) => {
                self.fail(&e, &identity, Some(&transport)).await;
                return Err(e);
            }
        };

        let kind = protocol.kind();
        let events = self.events.scoped(Some(kind), Some(identity.clone()));
        {
            let mut workout = self.workout.lock().await;
            workout.estimator.stop();
            workout.clock.stop(Instant::now().into_std());
            workout.direct_metrics = false;
        }
        *self.active.lock().await = Some(ActiveLink {
            protocol,
            handle,
            events: events.clone(),
        });

        if let Err(e) = self
            .update_session(|session| session.mark_connected(kind))
            .await
        {
            let _ = self.teardown(true).await;
            return Err(e);
        }

        self.start_tasks(stream).await;
        events.info(format!("Connected to {identity} using {kind}"));
        Ok(kind)
    }

    async fn start_tasks(&self, stream: NotificationStream) {
        // Held while spawning so a pump that ends at once waits for the handles
        let mut tasks = self.tasks.lock().await;
        stop_tasks(&mut tasks, true);

        let pump_device = self.clone();
        let pump = tokio::spawn(async move {
            let mut stream = stream;
            while let Some(notification) = stream.next().await {
                pump_device.handle_notification(notification).await;
            }
            pump_device.link_lost().await;
        });

        let tick_device = self.clone();
        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                tick_device.tick().await;
            }
        });

        *tasks = Tasks {
            pump: Some(pump),
            ticker: Some(ticker),
        };
    }

    async fn handle_notification(&self, notification: Notification) {
        let (decoded, kind, events) = {
            let mut active = self.active.lock().await;
            let Some(link) = active.as_mut() else {
                debug!("Dropping notification from {} after teardown", notification.characteristic);
                return;
            };
            (
                link.protocol.decode(&notification),
                link.protocol.kind(),
                link.events.clone(),
            )
        };

        match decoded {
            Decoded::Telemetry(update) if update.is_empty() => {
                events.log(
                    LogLevel::Debug,
                    format!("Skipped notification on {}", notification.characteristic),
                    Some(&notification.value),
                );
            }
            Decoded::Telemetry(update) => self.apply(update, kind).await,
            Decoded::Fault(fault) => {
                events.raise(
                    FitwireError::DeviceFault(fault).to_string(),
                    Some(fault),
                    Some(&notification.value),
                );
            }
            Decoded::ControlResponse(response) => {
                let level = if response.result == ControlResult::Success {
                    LogLevel::Debug
                } else {
                    LogLevel::Warn
                };
                events.log(
                    level,
                    format!(
                        "Control point answered 0x{:02X}: {}",
                        response.request_opcode, response.result
                    ),
                    Some(&notification.value),
                );
            }
        }
    }

    /// Merge an update, fill in estimated metrics and drive the clock
    async fn apply(&self, mut update: NormalizedTelemetry, kind: ProtocolKind) {
        let connected = self.status().await == ConnectionStatus::Connected;
        let now = Instant::now().into_std();

        let mut workout = self.workout.lock().await;
        workout.telemetry.merge(&update);
        workout.direct_metrics |= update.has_direct_metrics();

        if kind.needs_estimation(self.settings.equipment) && !workout.direct_metrics {
            if let Some(cadence) = update.cadence() {
                let resistance = workout.telemetry.resistance.unwrap_or(0.0);
                if let Some(estimate) = workout.estimator.sample(cadence, resistance, now) {
                    workout.telemetry.merge(&estimate);
                    update.merge(&estimate);
                }
            }
        }

        let active = workout.telemetry.has_activity();
        workout.clock.observe(connected, active, now);
        drop(workout);

        self.events.telemetry(update);
    }

    async fn tick(&self) {
        let now = Instant::now().into_std();
        let duration = {
            let mut workout = self.workout.lock().await;
            let duration = workout.clock.tick(now);
            if duration.is_some() {
                workout.telemetry.duration = duration;
            }
            duration
        };

        if let Some(duration) = duration {
            self.events.telemetry(NormalizedTelemetry {
                duration: Some(duration),
                ..Default::default()
            });
        }
    }

    /// Ask the equipment for a resistance level
    ///
    /// Levels are clamped or range-checked by the active protocol. A failed
    /// write is logged and returned but never changes the connection status.
    ///
    /// # Errors
    ///
    /// - [`FitwireError::Disconnected`] if no protocol is active
    /// - [`FitwireError::InvalidParameters`] if the level cannot be encoded
    /// - [`FitwireError::CommandWriteFailed`] if the write fails or times out
    pub async fn set_resistance(&self, level: i32) -> Result<()> {
        let command = {
            let mut active = self.active.lock().await;
            let link = active.as_mut().ok_or(FitwireError::Disconnected)?;
            let payload = link.protocol.encode_set_resistance(level)?;
            command_for(link, "Set resistance", payload)
        };
        self.send(command).await
    }

    /// Ask the equipment for an incline, percent
    ///
    /// # Errors
    ///
    /// - [`FitwireError::Disconnected`] if no protocol is active
    /// - [`FitwireError::Unsupported`] unless the active protocol is FTMS
    /// - [`FitwireError::InvalidParameters`] if the value cannot be encoded
    /// - [`FitwireError::CommandWriteFailed`] if the write fails or times out
    pub async fn set_incline(&self, percent: f64) -> Result<()> {
        let command = {
            let active = self.active.lock().await;
            let link = active.as_ref().ok_or(FitwireError::Disconnected)?;
            let payload = link.protocol.encode_set_incline(percent)?;
            command_for(link, "Set incline", payload)
        };
        self.send(command).await
    }

    async fn send(&self, command: Command) -> Result<()> {
        let Command {
            label,
            kind,
            payload,
            transport,
            characteristic,
            events,
        } = command;
        let timeout_ms = self.settings.connection.command_timeout_ms;
        let with_response = kind == ProtocolKind::Ftms;

        let outcome = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            transport.write(characteristic, &payload, with_response),
        )
        .await
        .unwrap_or(Err(FitwireError::Timeout { timeout_ms }));

        match outcome {
            Ok(()) => {
                events.log(LogLevel::Info, format!("{label} sent"), Some(&payload));
                Ok(())
            }
            Err(e) => {
                let err = FitwireError::CommandWriteFailed {
                    protocol: kind,
                    payload: payload.to_vec(),
                    reason: e.to_string(),
                };
                events.log(LogLevel::Warn, err.to_string(), Some(&payload));
                Err(err)
            }
        }
    }

    /// Zero the workout: duration, distance, calories and stroke count
    ///
    /// The link and the negotiated protocol are left untouched.
    pub async fn reset_workout(&self) {
        if let Some(link) = self.active.lock().await.as_mut() {
            link.protocol.reset();
        }

        let zeroed = NormalizedTelemetry {
            duration: Some(0),
            distance: Some(0.0),
            calories: Some(0.0),
            stroke_count: Some(0),
            ..Default::default()
        };
        {
            let mut workout = self.workout.lock().await;
            workout.clock.reset();
            workout.estimator.reset();
            workout.telemetry = zeroed.clone();
        }

        self.events.info("Workout reset");
        self.events.telemetry(zeroed);
    }

    /// Disconnect from the device
    ///
    /// Unsubscribes every characteristic, stops the background tasks and
    /// drops the link. Calling it again, or while not connected, is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the transport's error if the link could not be dropped. The
    /// session is `Disconnected` either way.
    pub async fn disconnect(&self) -> Result<()> {
        info!("Disconnecting from device");
        self.teardown(true).await
    }

    async fn link_lost(&self) {
        if self.active.lock().await.is_some() {
            self.events.warn("Link lost");
        }
        let _ = self.teardown(false).await;
    }

    async fn teardown(&self, explicit: bool) -> Result<()> {
        stop_tasks(&mut *self.tasks.lock().await, explicit);

        let link = self.active.lock().await.take();
        let mut result = Ok(());
        if let Some(ActiveLink {
            mut protocol,
            mut handle,
            events,
        }) = link
        {
            protocol.disconnect(&mut handle, &events).await;
            if explicit {
                if let Err(e) = handle.transport().disconnect().await {
                    events.warn(format!("Disconnect failed: {e}"));
                    result = Err(e);
                }
            }
        }

        {
            let mut workout = self.workout.lock().await;
            workout.clock.stop(Instant::now().into_std());
            workout.estimator.stop();
        }

        self.update_session(|session| {
            session.mark_disconnected();
            Ok(())
        })
        .await?;
        result
    }
}

fn command_for(link: &ActiveLink, label: &'static str, payload: Bytes) -> Command {
    Command {
        label,
        kind: link.protocol.kind(),
        payload,
        transport: link.handle.transport(),
        characteristic: link.handle.control_characteristic(),
        events: link.events.clone(),
    }
}

/// Abort the ticker, and the pump unless it is the caller
fn stop_tasks(tasks: &mut Tasks, abort_pump: bool) {
    if let Some(ticker) = tasks.ticker.take() {
        ticker.abort();
    }
    if let Some(pump) = tasks.pump.take() {
        if abort_pump {
            pump.abort();
        }
    }
}
