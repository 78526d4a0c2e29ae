//! Fitness Machine Service
//!
//! Telemetry comes from the Cross Trainer Data (0x2ACE) and Indoor Bike Data
//! (0x2AD2) characteristics. Both start with a little-endian flags field
//! telling which optional fields follow, in a fixed order. Commands go
//! through the Fitness Machine Control Point (0x2AD9), whose indications are
//! decoded as [`ControlResponse`] values.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use uuid::Uuid;

use super::{clamp_level, Decoded, ProtocolHandle};
use crate::{
    bluetooth_uuid,
    error::{FitwireError, Result},
    events::EventSink,
    transport::Notification,
    types::{NormalizedTelemetry, ProtocolKind},
};

/// Fitness Machine Service (0x1826)
pub const SERVICE_UUID: Uuid = bluetooth_uuid(0x1826);
/// Fitness Machine Control Point (0x2AD9)
pub const CONTROL_POINT_UUID: Uuid = bluetooth_uuid(0x2AD9);
/// Cross Trainer Data (0x2ACE)
pub const CROSS_TRAINER_DATA_UUID: Uuid = bluetooth_uuid(0x2ACE);
/// Indoor Bike Data (0x2AD2)
pub const INDOOR_BIKE_DATA_UUID: Uuid = bluetooth_uuid(0x2AD2);

/// Lowest resistance level sent to the machine
pub const MIN_RESISTANCE: i32 = 10;
/// Highest resistance level sent to the machine
pub const MAX_RESISTANCE: i32 = 24;

/// Control point opcodes
pub mod opcode {
    /// Take control of the machine
    pub const REQUEST_CONTROL: u8 = 0x00;
    /// Set target inclination, 0.1 % units
    pub const SET_TARGET_INCLINATION: u8 = 0x03;
    /// Set target resistance level
    pub const SET_TARGET_RESISTANCE: u8 = 0x04;
    /// Prefix of every control point indication
    pub const RESPONSE_CODE: u8 = 0x80;
}

/// Result code of a control point indication
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlResult {
    /// Command accepted
    Success,
    /// Opcode not supported by the machine
    Unsupported,
    /// Parameter out of range
    InvalidParameter,
    /// Any other failure code
    Failed(u8),
}

impl From<u8> for ControlResult {
    fn from(code: u8) -> Self {
        match code {
            0x01 => Self::Success,
            0x02 => Self::Unsupported,
            0x03 => Self::InvalidParameter,
            other => Self::Failed(other),
        }
    }
}

impl fmt::Display for ControlResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Unsupported => write!(f, "opcode not supported"),
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::Failed(code) => write!(f, "failed (0x{code:02X})"),
        }
    }
}

/// Control point indication `[0x80, request opcode, result]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlResponse {
    /// Opcode of the request being answered
    pub request_opcode: u8,
    /// Outcome
    pub result: ControlResult,
}

impl ControlResponse {
    /// Parse an indication; `None` if it is not a response
    #[must_use]
    pub fn parse(value: &[u8]) -> Option<Self> {
        match value {
            [opcode::RESPONSE_CODE, request_opcode, result, ..] => Some(Self {
                request_opcode: *request_opcode,
                result: ControlResult::from(*result),
            }),
            _ => None,
        }
    }
}

/// Request-control command
#[must_use]
pub fn encode_request_control() -> Bytes {
    Bytes::from_static(&[opcode::REQUEST_CONTROL])
}

/// Set-resistance command, level clamped to the machine's range
#[must_use]
#[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
pub fn encode_set_resistance(level: i32) -> Bytes {
    let clamped = clamp_level(level, MIN_RESISTANCE, MAX_RESISTANCE) as u16;
    let mut buf = BytesMut::with_capacity(3);
    buf.put_u8(opcode::SET_TARGET_RESISTANCE);
    buf.put_u16_le(clamped);
    buf.freeze()
}

/// Set-incline command, percent with 0.1 % resolution
///
/// # Errors
///
/// Returns [`FitwireError::InvalidParameters`] if the value does not fit the
/// signed 16-bit field.
#[allow(clippy::cast_possible_truncation)]
pub fn encode_set_incline(percent: f64) -> Result<Bytes> {
    let raw = (percent * 10.0).round();
    if !raw.is_finite() || raw < f64::from(i16::MIN) || raw > f64::from(i16::MAX) {
        return Err(FitwireError::InvalidParameters(format!(
            "incline {percent}% out of range"
        )));
    }
    let mut buf = BytesMut::with_capacity(3);
    buf.put_u8(opcode::SET_TARGET_INCLINATION);
    buf.put_i16_le(raw as i16);
    Ok(buf.freeze())
}

/// Bounds-checked little-endian reader over a flags-driven record
struct FieldReader<'a> {
    buf: &'a [u8],
}

impl<'a> FieldReader<'a> {
    const fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn u8(&mut self) -> Option<u8> {
        (self.buf.remaining() >= 1).then(|| self.buf.get_u8())
    }

    fn u16(&mut self) -> Option<u16> {
        (self.buf.remaining() >= 2).then(|| self.buf.get_u16_le())
    }

    fn i16(&mut self) -> Option<i16> {
        (self.buf.remaining() >= 2).then(|| self.buf.get_i16_le())
    }

    fn u24(&mut self) -> Option<u32> {
        (self.buf.remaining() >= 3).then(|| {
            let low = u32::from(self.buf.get_u16_le());
            low | (u32::from(self.buf.get_u8()) << 16)
        })
    }

    fn skip(&mut self, len: usize) -> Option<()> {
        (self.buf.remaining() >= len).then(|| self.buf.advance(len))
    }
}

fn flag(flags: u32, bit: u32) -> bool {
    flags & (1 << bit) != 0
}

/// Parse a Cross Trainer Data record (24-bit flags)
///
/// A record truncated in the middle of a field yields the fields decoded
/// before it.
#[must_use]
pub fn parse_cross_trainer_data(value: &[u8]) -> NormalizedTelemetry {
    let mut out = NormalizedTelemetry::default();
    let mut reader = FieldReader::new(value);
    let Some(flags) = reader.u24() else {
        return out;
    };
    let _ = read_cross_trainer_fields(flags, &mut reader, &mut out);
    out
}

fn read_cross_trainer_fields(
    flags: u32,
    reader: &mut FieldReader<'_>,
    out: &mut NormalizedTelemetry,
) -> Option<()> {
    // Bit 0 is "more data": instantaneous speed is present when it is clear
    if !flag(flags, 0) {
        out.speed = Some(f64::from(reader.u16()?) / 100.0);
    }
    if flag(flags, 1) {
        reader.skip(2)?; // average speed
    }
    if flag(flags, 2) {
        out.distance = Some(f64::from(reader.u24()?));
    }
    if flag(flags, 3) {
        out.spm = Some(f64::from(reader.u16()?));
        reader.skip(2)?; // average step rate
    }
    if flag(flags, 4) {
        out.stroke_count = Some(u32::from(reader.u16()?));
    }
    if flag(flags, 5) {
        reader.skip(4)?; // positive and negative elevation gain
    }
    if flag(flags, 6) {
        out.incline = Some(f64::from(reader.i16()?) / 10.0);
        reader.skip(2)?; // ramp angle
    }
    if flag(flags, 7) {
        out.resistance = Some(f64::from(reader.i16()?));
    }
    if flag(flags, 8) {
        out.power = Some(f64::from(reader.i16()?));
    }
    if flag(flags, 9) {
        reader.skip(2)?; // average power
    }
    if flag(flags, 10) {
        out.calories = Some(f64::from(reader.u16()?));
        reader.skip(3)?; // energy per hour, per minute
    }
    if flag(flags, 11) {
        out.heart_rate = Some(u16::from(reader.u8()?));
    }
    if flag(flags, 12) {
        reader.skip(1)?; // metabolic equivalent
    }
    if flag(flags, 13) {
        out.time = Some(u32::from(reader.u16()?));
    }
    Some(())
}

/// Parse an Indoor Bike Data record (16-bit flags)
#[must_use]
pub fn parse_indoor_bike_data(value: &[u8]) -> NormalizedTelemetry {
    let mut out = NormalizedTelemetry::default();
    let mut reader = FieldReader::new(value);
    let Some(flags) = reader.u16() else {
        return out;
    };
    let _ = read_indoor_bike_fields(u32::from(flags), &mut reader, &mut out);
    out
}

fn read_indoor_bike_fields(
    flags: u32,
    reader: &mut FieldReader<'_>,
    out: &mut NormalizedTelemetry,
) -> Option<()> {
    if !flag(flags, 0) {
        out.speed = Some(f64::from(reader.u16()?) / 100.0);
    }
    if flag(flags, 1) {
        reader.skip(2)?;
    }
    if flag(flags, 2) {
        out.rpm = Some(f64::from(reader.u16()?) / 2.0);
    }
    if flag(flags, 3) {
        reader.skip(2)?;
    }
    if flag(flags, 4) {
        out.distance = Some(f64::from(reader.u24()?));
    }
    if flag(flags, 5) {
        out.resistance = Some(f64::from(reader.i16()?));
    }
    if flag(flags, 6) {
        out.power = Some(f64::from(reader.i16()?));
    }
    if flag(flags, 7) {
        reader.skip(2)?;
    }
    if flag(flags, 8) {
        out.calories = Some(f64::from(reader.u16()?));
        reader.skip(3)?;
    }
    if flag(flags, 9) {
        out.heart_rate = Some(u16::from(reader.u8()?));
    }
    if flag(flags, 10) {
        reader.skip(1)?;
    }
    if flag(flags, 11) {
        out.time = Some(u32::from(reader.u16()?));
    }
    Some(())
}

/// FTMS decoder
///
/// Machines often omit the resistance field or report zero between
/// changes; the last non-zero level is repeated in that case.
#[derive(Debug, Default)]
pub struct FtmsProtocol {
    last_resistance: Option<f64>,
}

impl FtmsProtocol {
    /// Fresh decoder
    #[must_use]
    pub const fn new() -> Self {
        Self {
            last_resistance: None,
        }
    }

    pub(crate) async fn handshake(&self, handle: &mut ProtocolHandle, events: &EventSink) -> Result<()> {
        handle.require(CONTROL_POINT_UUID, "control point")?;

        let transport = handle.transport();
        let data: Vec<Uuid> = [CROSS_TRAINER_DATA_UUID, INDOOR_BIKE_DATA_UUID]
            .into_iter()
            .filter(|uuid| transport.has_characteristic(*uuid))
            .collect();
        if data.is_empty() {
            return Err(FitwireError::handshake(
                ProtocolKind::Ftms,
                "no cross trainer or indoor bike data characteristic",
            ));
        }
        for characteristic in data {
            handle.subscribe(characteristic).await?;
        }
        handle.subscribe(CONTROL_POINT_UUID).await?;

        transport
            .write(CONTROL_POINT_UUID, &encode_request_control(), true)
            .await
            .map_err(|e| FitwireError::handshake(ProtocolKind::Ftms, format!("request control: {e}")))?;
        events.info("FTMS control requested");
        Ok(())
    }

    pub(crate) fn decode(&mut self, notification: &Notification) -> Decoded {
        let value = notification.value.as_slice();
        let mut update = match notification.characteristic {
            c if c == CONTROL_POINT_UUID => {
                return ControlResponse::parse(value)
                    .map_or_else(Decoded::skipped, Decoded::ControlResponse);
            }
            c if c == CROSS_TRAINER_DATA_UUID => parse_cross_trainer_data(value),
            c if c == INDOOR_BIKE_DATA_UUID => parse_indoor_bike_data(value),
            _ => return Decoded::skipped(),
        };
        if update.is_empty() {
            return Decoded::Telemetry(update);
        }

        match update.resistance {
            Some(level) if level != 0.0 => self.last_resistance = Some(level),
            _ => update.resistance = self.last_resistance,
        }
        Decoded::Telemetry(update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{protocol::Protocol, transport::mock::MockTransport, types::SessionSettings};
    use std::sync::Arc;
    use tokio_test::{assert_err, assert_ok};

    fn cross_trainer(flags: u32, fields: &[u8]) -> Notification {
        let mut value = flags.to_le_bytes()[..3].to_vec();
        value.extend_from_slice(fields);
        Notification::new(CROSS_TRAINER_DATA_UUID, value)
    }

    fn telemetry(decoded: Decoded) -> NormalizedTelemetry {
        match decoded {
            Decoded::Telemetry(update) => update,
            other => panic!("expected telemetry, got {other:?}"),
        }
    }

    #[test]
    fn test_speed_only_record() {
        let update = parse_cross_trainer_data(&[0x00, 0x00, 0x00, 0xFA, 0x00]);
        assert_eq!(update.speed, Some(2.5));
        assert_eq!(update.distance, None);
        assert_eq!(update.power, None);
        assert_eq!(update.heart_rate, None);
        assert_eq!(update.resistance, None);
    }

    #[test]
    fn test_cross_trainer_fields_in_order() {
        // speed, distance, step rate, resistance, power, energy, heart rate, elapsed
        let flags = (1 << 2) | (1 << 3) | (1 << 7) | (1 << 8) | (1 << 10) | (1 << 11) | (1 << 13);
        let fields = [
            0xE8, 0x03, // 10.00 km/h
            0x10, 0x27, 0x00, // 10000 m
            0x3C, 0x00, 0x3A, 0x00, // 60 spm, avg 58
            0x0C, 0x00, // resistance 12
            0x96, 0x00, // 150 W
            0x2D, 0x00, 0x00, 0x00, 0x00, // 45 kcal
            0x8C, // 140 bpm
            0x58, 0x02, // 600 s
        ];
        let update = parse_cross_trainer_data(&cross_trainer(flags, &fields).value);

        assert_eq!(update.speed, Some(10.0));
        assert_eq!(update.distance, Some(10_000.0));
        assert_eq!(update.spm, Some(60.0));
        assert_eq!(update.resistance, Some(12.0));
        assert_eq!(update.power, Some(150.0));
        assert_eq!(update.calories, Some(45.0));
        assert_eq!(update.heart_rate, Some(140));
        assert_eq!(update.time, Some(600));
        assert_eq!(update.incline, None);
    }

    #[test]
    fn test_more_data_bit_skips_speed() {
        // more data + incline
        let flags = 1 | (1 << 6);
        let update = parse_cross_trainer_data(&cross_trainer(flags, &[0xEC, 0xFF, 0x00, 0x00]).value);
        assert_eq!(update.speed, None);
        assert_eq!(update.incline, Some(-2.0));
    }

    #[test]
    fn test_truncated_record_keeps_leading_fields() {
        let flags = 1 << 8;
        // speed present, power truncated
        let update = parse_cross_trainer_data(&cross_trainer(flags, &[0x64, 0x00, 0x96]).value);
        assert_eq!(update.speed, Some(1.0));
        assert_eq!(update.power, None);

        assert!(parse_cross_trainer_data(&[0x00, 0x00]).is_empty());
    }

    #[test]
    fn test_indoor_bike_cadence_resolution() {
        // speed, cadence, power
        let flags: u16 = (1 << 2) | (1 << 6);
        let mut value = flags.to_le_bytes().to_vec();
        value.extend_from_slice(&[0xC4, 0x09, 0xB5, 0x00, 0xC8, 0x00]);
        let update = parse_indoor_bike_data(&value);

        assert_eq!(update.speed, Some(25.0));
        assert_eq!(update.rpm, Some(90.5));
        assert_eq!(update.power, Some(200.0));
    }

    #[test]
    fn test_resistance_is_sticky() {
        let mut ftms = FtmsProtocol::new();
        let with_resistance = 1 << 7;

        let first = telemetry(ftms.decode(&cross_trainer(with_resistance, &[0x00, 0x00, 0x0C, 0x00])));
        let omitted = telemetry(ftms.decode(&cross_trainer(0, &[0x00, 0x00])));
        let zero = telemetry(ftms.decode(&cross_trainer(with_resistance, &[0x00, 0x00, 0x00, 0x00])));

        assert_eq!(first.resistance, Some(12.0));
        assert_eq!(omitted.resistance, Some(12.0));
        assert_eq!(zero.resistance, Some(12.0));
    }

    #[test]
    fn test_resistance_absent_before_first_level() {
        let mut ftms = FtmsProtocol::new();
        let update = telemetry(ftms.decode(&cross_trainer(0, &[0x64, 0x00])));
        assert_eq!(update.resistance, None);
    }

    #[test]
    fn test_control_point_responses() {
        let mut ftms = FtmsProtocol::new();
        let decoded = ftms.decode(&Notification::new(CONTROL_POINT_UUID, vec![0x80, 0x04, 0x01]));
        assert_eq!(
            decoded,
            Decoded::ControlResponse(ControlResponse {
                request_opcode: opcode::SET_TARGET_RESISTANCE,
                result: ControlResult::Success,
            })
        );

        assert_eq!(ControlResult::from(0x03), ControlResult::InvalidParameter);
        assert_eq!(ControlResult::from(0x04), ControlResult::Failed(0x04));
        assert_eq!(
            ftms.decode(&Notification::new(CONTROL_POINT_UUID, vec![0x80, 0x04])),
            Decoded::skipped()
        );
    }

    #[test]
    fn test_resistance_command_clamps() {
        assert_eq!(&encode_set_resistance(15)[..], &[0x04, 0x0F, 0x00]);
        assert_eq!(&encode_set_resistance(3)[..], &[0x04, 0x0A, 0x00]);
        assert_eq!(&encode_set_resistance(40)[..], &[0x04, 0x18, 0x00]);
    }

    #[test]
    fn test_incline_command() {
        assert_eq!(&assert_ok!(encode_set_incline(-1.5))[..], &[0x03, 0xF1, 0xFF]);
        assert_eq!(&assert_ok!(encode_set_incline(12.0))[..], &[0x03, 0x78, 0x00]);
        assert_err!(encode_set_incline(5000.0));
        assert_err!(encode_set_incline(f64::NAN));
    }

    #[tokio::test]
    async fn test_handshake_requests_control() {
        let (events, _rx) = EventSink::channel();
        let mock = MockTransport::new(&["1826"], &[CONTROL_POINT_UUID, CROSS_TRAINER_DATA_UUID]);
        let mut protocol = Protocol::new(ProtocolKind::Ftms, &SessionSettings::default());
        let handle = assert_ok!(protocol.connect(Arc::new(mock.clone()), &events).await);

        assert_eq!(mock.writes_to(CONTROL_POINT_UUID), vec![vec![0x00]]);
        assert_eq!(handle.subscriptions(), &[CROSS_TRAINER_DATA_UUID, CONTROL_POINT_UUID]);
    }

    #[tokio::test]
    async fn test_handshake_without_data_characteristic_fails() {
        let (events, _rx) = EventSink::channel();
        let mock = MockTransport::new(&["1826"], &[CONTROL_POINT_UUID]);
        let mut protocol = Protocol::new(ProtocolKind::Ftms, &SessionSettings::default());
        assert_err!(protocol.connect(Arc::new(mock), &events).await);
    }
}
