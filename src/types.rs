use serde::{Deserialize, Serialize};
use std::{fmt, time::SystemTime};

/// Wire protocol spoken by a connected device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolKind {
    /// Service-indexed packets behind an unlock gate
    V2,
    /// Fixed-offset framed protocol
    V1,
    /// Vendor variant of the V1 framing with an init command and heartbeat
    HuanTong,
    /// Standard Bluetooth Fitness Machine Service
    Ftms,
}

impl ProtocolKind {
    /// Negotiation order, highest priority first
    pub const PRIORITY: [Self; 4] = [Self::V2, Self::V1, Self::HuanTong, Self::Ftms];

    /// Whether links of this kind can be cadence-only and need estimated metrics
    #[must_use]
    pub const fn needs_estimation(self, equipment: EquipmentType) -> bool {
        match self {
            Self::V2 => !matches!(equipment, EquipmentType::Rower),
            Self::HuanTong => true,
            Self::V1 | Self::Ftms => false,
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V2 => write!(f, "V2"),
            Self::V1 => write!(f, "V1"),
            Self::HuanTong => write!(f, "HuanTong"),
            Self::Ftms => write!(f, "FTMS"),
        }
    }
}

/// Kind of equipment on the other end of the link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EquipmentType {
    /// Rowing machine
    Rower,
    /// Exercise bike
    Bike,
    /// Elliptical / cross trainer
    Elliptical,
    /// Treadmill
    Treadmill,
    /// Not known yet
    #[default]
    Unknown,
}

/// Drag profile of a rower's resistance mechanism
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DragProfile {
    /// Water tank
    #[default]
    Water,
    /// Magnetic brake
    Magnet,
    /// Air fan
    Wind,
}

/// Connection status of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionStatus {
    /// No link
    #[default]
    Disconnected,
    /// Looking for devices
    Scanning,
    /// Link is being established and the protocol negotiated
    Connecting,
    /// Protocol negotiated, telemetry flowing
    Connected,
    /// Connection-level failure
    Error,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Scanning => write!(f, "scanning"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Identity of a physical device, remembered for quick reconnect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Stable transport identifier (BLE address or platform id)
    pub id: String,
    /// Advertised local name
    pub name: Option<String>,
    /// Signal strength at discovery time
    pub rssi: Option<i16>,
}

impl DeviceIdentity {
    /// Create a new identity
    #[must_use]
    pub fn new(id: impl Into<String>, name: Option<String>) -> Self {
        Self {
            id: id.into(),
            name,
            rssi: None,
        }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{name} ({})", self.id),
            None => write!(f, "{}", self.id),
        }
    }
}

/// Fault code reported by the device inside a telemetry frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFault {
    /// Raw fault code
    pub code: u8,
}

impl DeviceFault {
    /// Wrap a raw fault code
    #[must_use]
    pub const fn new(code: u8) -> Self {
        Self { code }
    }

    /// Human-readable message
    #[must_use]
    pub fn message(&self) -> String {
        match self.code {
            1..=18 => format!("device fault code {}", self.code),
            19 => "retract/extend in progress, stay clear".to_string(),
            20 => "retract/extend in progress, do not obstruct deck".to_string(),
            21 => "do not stand on deck during retract/extend".to_string(),
            22 => "mileage high, add lubricant".to_string(),
            code => format!("unknown code {code}"),
        }
    }

    /// Message as shown by the vendor's zh-CN firmware tables
    #[must_use]
    pub fn localized_message(&self) -> String {
        match self.code {
            1..=18 => format!("设备故障代码 {}", self.code),
            19 => "跑步机收起/展开中，请远离".to_string(),
            20 => "跑步机收起/展开中，请勿阻碍跑台".to_string(),
            21 => "跑步机收起/展开中，请勿站在跑台上".to_string(),
            22 => "跑步机里程过高，请添加润滑油".to_string(),
            code => format!("未知代码 {code}"),
        }
    }
}

impl fmt::Display for DeviceFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message())
    }
}

/// Canonical metrics record shared by every protocol
///
/// Every field is optional: a decoder only fills what it can derive from one
/// notification. Values are always in physical units, never raw scaled
/// integers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizedTelemetry {
    /// Elapsed time reported by the device, seconds
    pub time: Option<u32>,
    /// Workout duration tracked by the session clock, seconds
    pub duration: Option<u32>,
    /// Distance, meters
    pub distance: Option<f64>,
    /// Speed, km/h
    pub speed: Option<f64>,
    /// Revolutions per minute
    pub rpm: Option<f64>,
    /// Strokes or steps per minute
    pub spm: Option<f64>,
    /// Energy, kcal
    pub calories: Option<f64>,
    /// Heart rate, bpm
    pub heart_rate: Option<u16>,
    /// Power, watts
    pub power: Option<f64>,
    /// Resistance level
    pub resistance: Option<f64>,
    /// Incline, percent
    pub incline: Option<f64>,
    /// Total strokes or steps
    pub stroke_count: Option<u32>,
}

impl NormalizedTelemetry {
    /// True when no field is set
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Overlay every field present in `update` onto `self`
    pub fn merge(&mut self, update: &Self) {
        macro_rules! overlay {
            ($($field:ident),*) => {
                $(if update.$field.is_some() {
                    self.$field = update.$field;
                })*
            };
        }
        overlay!(
            time,
            duration,
            distance,
            speed,
            rpm,
            spm,
            calories,
            heart_rate,
            power,
            resistance,
            incline,
            stroke_count
        );
    }

    /// Whether the record shows the user is currently moving
    #[must_use]
    pub fn has_activity(&self) -> bool {
        self.speed.is_some_and(|s| s > 0.5)
            || self.spm.is_some_and(|s| s > 0.0)
            || self.rpm.is_some_and(|r| r > 0.0)
    }

    /// Cadence used by the estimator: rpm, or spm when rpm is absent or zero
    #[must_use]
    pub fn cadence(&self) -> Option<f64> {
        match (self.rpm, self.spm) {
            (Some(rpm), _) if rpm > 0.0 => Some(rpm),
            (_, Some(spm)) => Some(spm),
            (rpm, None) => rpm,
        }
    }

    /// Whether the update carries speed, distance, power or calories from the device
    #[must_use]
    pub const fn has_direct_metrics(&self) -> bool {
        self.speed.is_some() || self.distance.is_some() || self.power.is_some() || self.calories.is_some()
    }
}

/// Log severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    /// Verbose diagnostics
    Debug,
    /// Normal lifecycle messages
    Info,
    /// Recoverable problems
    Warn,
    /// Failures
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Debug => write!(f, "debug"),
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Diagnostic context attached to log and error events
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventContext {
    /// Active protocol, if any
    pub protocol: Option<ProtocolKind>,
    /// Device the event relates to
    pub device: Option<DeviceIdentity>,
    /// Raw payload involved, rendered as hex
    pub payload: Option<String>,
}

/// Structured log line for host applications
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    /// Severity
    pub level: LogLevel,
    /// Message
    pub message: String,
    /// Diagnostic context
    pub context: EventContext,
    /// When the event was produced
    pub timestamp: SystemTime,
}

/// User-visible error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    /// Error description
    pub message: String,
    /// Device fault, when the error came from a decoded fault code
    pub fault: Option<DeviceFault>,
    /// Diagnostic context
    pub context: EventContext,
}

/// Event emitted by a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionEvent {
    /// Partial telemetry update
    Telemetry(NormalizedTelemetry),
    /// Log line
    Log(LogEvent),
    /// User-visible error
    Error(ErrorEvent),
    /// Connection status changed
    StatusChanged(ConnectionStatus),
}

/// Connection parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionParams {
    /// Scan duration in milliseconds
    pub scan_timeout_ms: u64,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Upper bound for one command write, milliseconds
    pub command_timeout_ms: u64,
    /// Advertised name prefixes accepted during scanning
    pub name_prefixes: Vec<String>,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            scan_timeout_ms: 10_000,
            connect_timeout_ms: 30_000,
            command_timeout_ms: 5_000,
            name_prefixes: vec!["Mobi".to_string(), "MB".to_string()],
        }
    }
}

/// User data used by the physical models
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    /// Body weight in kilograms
    pub weight_kg: f64,
    /// Age in years
    pub age: u8,
}

impl Default for UserProfile {
    fn default() -> Self {
        Self {
            weight_kg: 70.0,
            age: 30,
        }
    }
}

/// Tuning of the cadence-only estimator
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EstimatorConfig {
    /// Samples closer together than this are ignored, seconds
    pub min_delta_secs: f64,
    /// Samples further apart than this are treated as a gap, seconds
    pub max_delta_secs: f64,
    /// Distance covered per stride/revolution, meters
    pub stride_length_m: f64,
    /// Watts per (cadence x resistance)
    pub power_constant: f64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            min_delta_secs: 0.5,
            max_delta_secs: 5.0,
            stride_length_m: 0.55,
            power_constant: 1.0,
        }
    }
}

/// Everything a session needs to know about the user and equipment
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Kind of equipment connected
    pub equipment: EquipmentType,
    /// User data
    pub user: UserProfile,
    /// Rower drag profile
    pub drag_profile: DragProfile,
    /// Estimator tuning
    pub estimator: EstimatorConfig,
    /// Connection parameters
    pub connection: ConnectionParams,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_is_last_write_wins_per_field() {
        let mut state = NormalizedTelemetry {
            speed: Some(10.0),
            resistance: Some(8.0),
            ..Default::default()
        };
        let update = NormalizedTelemetry {
            speed: Some(12.5),
            rpm: Some(60.0),
            ..Default::default()
        };

        state.merge(&update);

        assert_eq!(state.speed, Some(12.5));
        assert_eq!(state.rpm, Some(60.0));
        assert_eq!(state.resistance, Some(8.0));
        assert_eq!(state.distance, None);
    }

    #[test]
    fn test_empty_and_activity() {
        assert!(NormalizedTelemetry::default().is_empty());

        let idle = NormalizedTelemetry {
            speed: Some(0.3),
            rpm: Some(0.0),
            ..Default::default()
        };
        assert!(!idle.is_empty());
        assert!(!idle.has_activity());

        let rowing = NormalizedTelemetry {
            spm: Some(24.0),
            ..Default::default()
        };
        assert!(rowing.has_activity());
    }

    #[test]
    fn test_cadence_prefers_rpm() {
        let both = NormalizedTelemetry {
            rpm: Some(55.0),
            spm: Some(30.0),
            ..Default::default()
        };
        assert_eq!(both.cadence(), Some(55.0));

        let zero_rpm = NormalizedTelemetry {
            rpm: Some(0.0),
            spm: Some(30.0),
            ..Default::default()
        };
        assert_eq!(zero_rpm.cadence(), Some(30.0));

        let stopped = NormalizedTelemetry {
            rpm: Some(0.0),
            ..Default::default()
        };
        assert_eq!(stopped.cadence(), Some(0.0));
        assert_eq!(NormalizedTelemetry::default().cadence(), None);
    }

    #[test]
    fn test_fault_messages() {
        assert_eq!(DeviceFault::new(7).message(), "device fault code 7");
        assert_eq!(
            DeviceFault::new(19).message(),
            "retract/extend in progress, stay clear"
        );
        assert_eq!(
            DeviceFault::new(20).localized_message(),
            "跑步机收起/展开中，请勿阻碍跑台"
        );
        assert_eq!(DeviceFault::new(22).message(), "mileage high, add lubricant");
        assert_eq!(DeviceFault::new(0).message(), "unknown code 0");
        assert_eq!(DeviceFault::new(99).message(), "unknown code 99");
    }

    #[test]
    fn test_estimation_applies_to_cadence_only_protocols() {
        assert!(ProtocolKind::V2.needs_estimation(EquipmentType::Elliptical));
        assert!(!ProtocolKind::V2.needs_estimation(EquipmentType::Rower));
        assert!(ProtocolKind::HuanTong.needs_estimation(EquipmentType::Bike));
        assert!(!ProtocolKind::Ftms.needs_estimation(EquipmentType::Bike));
        assert!(!ProtocolKind::V1.needs_estimation(EquipmentType::Treadmill));

        let cadence_only = NormalizedTelemetry {
            rpm: Some(60.0),
            resistance: Some(4.0),
            ..Default::default()
        };
        assert!(!cadence_only.has_direct_metrics());
        let aggregate = NormalizedTelemetry {
            distance: Some(2500.0),
            ..cadence_only.clone()
        };
        assert!(aggregate.has_direct_metrics());
    }

    #[test]
    fn test_settings_defaults() {
        let settings = SessionSettings::default();
        assert_eq!(settings.equipment, EquipmentType::Unknown);
        assert!((settings.user.weight_kg - 70.0).abs() < f64::EPSILON);
        assert!((settings.estimator.min_delta_secs - 0.5).abs() < f64::EPSILON);
        assert!((settings.estimator.max_delta_secs - 5.0).abs() < f64::EPSILON);
        assert_eq!(settings.connection.name_prefixes, vec!["Mobi", "MB"]);
    }
}
