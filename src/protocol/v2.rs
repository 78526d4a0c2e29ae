use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

use super::{level_byte, rowing::RowingAnalysis, Decoded, ProtocolHandle};
use crate::{
    bluetooth_uuid,
    error::{FitwireError, Result},
    events::EventSink,
    transport::Notification,
    types::{EquipmentType, LogLevel, NormalizedTelemetry, ProtocolKind, SessionSettings},
};

/// Primary service
pub const SERVICE_UUID: Uuid = bluetooth_uuid(0xAE00);
/// Unlock gate, written once during the handshake
pub const UNLOCK_UUID: Uuid = bluetooth_uuid(0xAE01);
/// Command writes
pub const CONTROL_UUID: Uuid = bluetooth_uuid(0xAE02);
/// Stroke/revolution interval notifications
pub const INTERVAL_UUID: Uuid = bluetooth_uuid(0xAE03);
/// Gear (resistance) notifications
pub const GEAR_UUID: Uuid = bluetooth_uuid(0xAE04);
/// Aggregate telemetry notifications
pub const AGGREGATE_UUID: Uuid = bluetooth_uuid(0xAE05);

/// Literal written to the unlock characteristic
pub const UNLOCK_COMMAND: [u8; 3] = [0x4D, 0x42, 0x01];
/// Minimum length of an aggregate packet
pub const MIN_AGGREGATE_LEN: usize = 11;

const RESISTANCE_OPCODE: u8 = 0x02;
const RESISTANCE_SUBCODE: u8 = 0x01;

/// Build a resistance command
///
/// # Errors
///
/// Returns [`FitwireError::InvalidParameters`] outside 0-255.
pub fn encode_set_resistance(level: i32) -> Result<Bytes> {
    let level = level_byte(ProtocolKind::V2, level)?;
    let mut buf = BytesMut::with_capacity(3);
    buf.put_u8(RESISTANCE_OPCODE);
    buf.put_u8(RESISTANCE_SUBCODE);
    buf.put_u8(level);
    Ok(buf.freeze())
}

/// Cadence from an interval in milliseconds; zero when the machine stopped
#[must_use]
pub fn interval_to_rpm(interval_ms: u16) -> f64 {
    if interval_ms == 0 {
        0.0
    } else {
        60_000.0 / f64::from(interval_ms)
    }
}

/// Parse an aggregate packet; `None` when shorter than [`MIN_AGGREGATE_LEN`]
#[must_use]
pub fn parse_aggregate(value: &[u8]) -> Option<NormalizedTelemetry> {
    if value.len() < MIN_AGGREGATE_LEN {
        return None;
    }
    let mut buf = value;
    let resistance = f64::from(buf.get_u8());
    let time = u32::from(buf.get_u16());
    let distance = f64::from(buf.get_u16()) * 100.0;
    let calories = f64::from(buf.get_u16());
    let speed = f64::from(buf.get_u16()) / 10.0;
    let cadence = f64::from(buf.get_u16());

    Some(NormalizedTelemetry {
        time: Some(time),
        distance: Some(distance),
        speed: Some(speed),
        rpm: Some(cadence),
        calories: Some(calories),
        resistance: Some(resistance),
        ..Default::default()
    })
}

/// V2 decoder; rowers route intervals through the stroke engine
#[derive(Debug)]
pub struct V2Protocol {
    equipment: EquipmentType,
    rowing: RowingAnalysis,
}

impl V2Protocol {
    /// Fresh decoder for the configured equipment
    #[must_use]
    pub fn new(settings: &SessionSettings) -> Self {
        Self {
            equipment: settings.equipment,
            rowing: RowingAnalysis::new(settings.drag_profile, settings.user),
        }
    }

    /// Stroke engine used for rowers
    #[must_use]
    pub const fn rowing(&self) -> &RowingAnalysis {
        &self.rowing
    }

    pub(crate) fn reset(&mut self) {
        self.rowing.reset();
    }

    pub(crate) async fn handshake(&self, handle: &mut ProtocolHandle, events: &EventSink) -> Result<()> {
        handle.require(UNLOCK_UUID, "unlock")?;
        handle.require(CONTROL_UUID, "control")?;
        handle.require(INTERVAL_UUID, "interval")?;

        handle
            .transport()
            .write(UNLOCK_UUID, &UNLOCK_COMMAND, true)
            .await
            .map_err(|e| FitwireError::handshake(ProtocolKind::V2, format!("unlock rejected: {e}")))?;
        events.log(LogLevel::Info, "V2 unlocked", Some(&UNLOCK_COMMAND));

        handle.subscribe(INTERVAL_UUID).await?;
        for optional in [GEAR_UUID, AGGREGATE_UUID] {
            if handle.transport().has_characteristic(optional) {
                handle.subscribe(optional).await?;
            } else {
                events.debug(format!("V2 optional characteristic {optional} not present"));
            }
        }
        Ok(())
    }

    pub(crate) fn decode(&mut self, notification: &Notification) -> Decoded {
        let value = notification.value.as_slice();
        match notification.characteristic {
            c if c == INTERVAL_UUID => {
                let [hi, lo, ..] = value else {
                    return Decoded::skipped();
                };
                let interval = u16::from_be_bytes([*hi, *lo]);
                if self.equipment == EquipmentType::Rower {
                    Decoded::Telemetry(self.rowing.append(f64::from(interval)))
                } else {
                    Decoded::Telemetry(NormalizedTelemetry {
                        rpm: Some(interval_to_rpm(interval)),
                        ..Default::default()
                    })
                }
            }
            c if c == GEAR_UUID => match value.first() {
                Some(level) => Decoded::Telemetry(NormalizedTelemetry {
                    resistance: Some(f64::from(*level)),
                    ..Default::default()
                }),
                None => Decoded::skipped(),
            },
            c if c == AGGREGATE_UUID => parse_aggregate(value).map_or_else(Decoded::skipped, Decoded::Telemetry),
            _ => Decoded::skipped(),
        }
    }
}
