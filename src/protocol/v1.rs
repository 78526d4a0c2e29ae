use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

use super::{level_byte, Decoded, ProtocolHandle};
use crate::{
    bluetooth_uuid,
    error::Result,
    events::EventSink,
    types::{DeviceFault, NormalizedTelemetry, ProtocolKind},
};

/// Primary service
pub const SERVICE_UUID: Uuid = bluetooth_uuid(0xFFE0);
/// Telemetry notifications
pub const NOTIFY_UUID: Uuid = bluetooth_uuid(0xFFE1);
/// Command writes
pub const WRITE_UUID: Uuid = bluetooth_uuid(0xFFE2);

/// First byte of every frame
pub const FRAME_HEADER: u8 = 0xAB;
/// Frames shorter than this carry no telemetry
pub const MIN_FRAME_LEN: usize = 14;
/// Byte 7 value marking an error frame
pub const ERROR_SENTINEL: u8 = 0xEE;
/// Byte 2 value for the rowing variant
pub const DEVICE_TYPE_ROWER: u8 = 0x02;
/// Frame kind of a resistance command
pub const KIND_SET_RESISTANCE: u8 = 0x03;

// Raw resistance above this is on the fine x4 scale
const MAX_COARSE_RESISTANCE: u8 = 24;

/// Offsets of the fields in a telemetry frame
mod offset {
    pub const DEVICE_TYPE: usize = 2;
    pub const CONTEXT_A: usize = 3;
    pub const CONTEXT_B: usize = 4;
    pub const RESISTANCE: usize = 5;
    pub const CONTEXT_C: usize = 6;
    pub const ERROR_FLAG: usize = 7;
    pub const ERROR_CODE: usize = 8;
    pub const TIME: usize = 9;
}

/// Decoded V1 frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Regular telemetry frame
    Telemetry(NormalizedTelemetry),
    /// Error frame carrying a fault code
    Fault(DeviceFault),
}

/// Parse one V1 frame
///
/// Returns `None` for frames shorter than [`MIN_FRAME_LEN`]. The calories and
/// speed tails are only read when present.
#[must_use]
pub fn parse_frame(frame: &[u8]) -> Option<Frame> {
    if frame.len() < MIN_FRAME_LEN {
        return None;
    }
    if frame[offset::ERROR_FLAG] == ERROR_SENTINEL {
        return Some(Frame::Fault(DeviceFault::new(frame[offset::ERROR_CODE])));
    }

    let raw_resistance = frame[offset::RESISTANCE];
    let resistance = if frame[offset::DEVICE_TYPE] == DEVICE_TYPE_ROWER
        || raw_resistance > MAX_COARSE_RESISTANCE
    {
        f64::from(raw_resistance) / 4.0
    } else {
        f64::from(raw_resistance)
    };

    let mut buf = &frame[offset::TIME..];
    let time = u32::from(buf.get_u16());
    let distance = f64::from(buf.get_u16()) * 100.0;
    let rpm = f64::from(buf.get_u8());

    let calories = (buf.remaining() >= 2).then(|| f64::from(buf.get_u16()));
    let speed = (buf.remaining() >= 2).then(|| f64::from(buf.get_u16()) / 10.0);

    Some(Frame::Telemetry(NormalizedTelemetry {
        time: Some(time),
        distance: Some(distance),
        rpm: Some(rpm),
        calories,
        speed,
        resistance: Some(resistance),
        ..Default::default()
    }))
}

/// Build a resistance command, echoing the context bytes of `last_frame`
#[must_use]
pub fn resistance_command(last_frame: Option<&[u8]>, level: u8) -> Bytes {
    let context = |index: usize| {
        last_frame
            .and_then(|frame| frame.get(index))
            .copied()
            .unwrap_or(0)
    };

    let mut buf = BytesMut::with_capacity(7);
    buf.put_u8(FRAME_HEADER);
    buf.put_u8(KIND_SET_RESISTANCE);
    buf.put_u8(0x00);
    buf.put_u8(context(offset::CONTEXT_A));
    buf.put_u8(context(offset::CONTEXT_B));
    buf.put_u8(level);
    buf.put_u8(context(offset::CONTEXT_C));
    buf.freeze()
}

/// V1 decoder, caching the last frame for command context
#[derive(Debug, Default)]
pub struct V1Protocol {
    last_frame: Option<Vec<u8>>,
}

impl V1Protocol {
    /// Fresh decoder
    #[must_use]
    pub const fn new() -> Self {
        Self { last_frame: None }
    }

    /// Last frame long enough to decode
    #[must_use]
    pub fn last_frame(&self) -> Option<&[u8]> {
        self.last_frame.as_deref()
    }

    pub(crate) async fn handshake(&self, handle: &mut ProtocolHandle, events: &EventSink) -> Result<()> {
        handle.require(NOTIFY_UUID, "notify")?;
        handle.require(WRITE_UUID, "write")?;
        handle.subscribe(NOTIFY_UUID).await?;
        events.info("V1 notifications enabled");
        Ok(())
    }

    pub(crate) fn decode(&mut self, value: &[u8]) -> Decoded {
        match parse_frame(value) {
            Some(frame) => {
                self.last_frame = Some(value.to_vec());
                match frame {
                    Frame::Telemetry(update) => Decoded::Telemetry(update),
                    Frame::Fault(fault) => Decoded::Fault(fault),
                }
            }
            None => Decoded::skipped(),
        }
    }

    pub(crate) fn encode_set_resistance(&self, level: i32) -> Result<Bytes> {
        let level = level_byte(ProtocolKind::V1, level)?;
        Ok(resistance_command(self.last_frame(), level))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    fn frame() -> Vec<u8> {
        vec![
            0xAB, 0x01, 0x01, // header, kind, bike
            0x11, 0x22, // context
            0x08, // resistance
            0x33, // context
            0x00, 0x00, // no error
            0x00, 0x78, // 120 s
            0x00, 0x0F, // 1.5 km
            0x50, // 80 rpm
            0x00, 0x2A, // 42 kcal
            0x00, 0xC8, // 20.0 km/h
        ]
    }

    #[test]
    fn test_parse_full_frame() {
        let Some(Frame::Telemetry(update)) = parse_frame(&frame()) else {
            panic!("expected telemetry");
        };
        assert_eq!(update.time, Some(120));
        assert_eq!(update.distance, Some(1500.0));
        assert_eq!(update.rpm, Some(80.0));
        assert_eq!(update.calories, Some(42.0));
        assert_eq!(update.speed, Some(20.0));
        assert_eq!(update.resistance, Some(8.0));
    }

    #[test]
    fn test_optional_tail_absent() {
        let short = &frame()[..MIN_FRAME_LEN];
        let Some(Frame::Telemetry(update)) = parse_frame(short) else {
            panic!("expected telemetry");
        };
        assert_eq!(update.rpm, Some(80.0));
        assert_eq!(update.calories, None);
        assert_eq!(update.speed, None);

        // calories present, speed absent
        let Some(Frame::Telemetry(update)) = parse_frame(&frame()[..16]) else {
            panic!("expected telemetry");
        };
        assert_eq!(update.calories, Some(42.0));
        assert_eq!(update.speed, None);
    }

    #[test]
    fn test_short_frame_is_skipped() {
        let mut v1 = V1Protocol::new();
        assert_eq!(v1.decode(&frame()[..13]), Decoded::skipped());
        assert_eq!(v1.decode(&[]), Decoded::skipped());
        assert!(v1.last_frame().is_none());
    }

    #[test]
    fn test_resistance_scaling() {
        let mut rower = frame();
        rower[2] = DEVICE_TYPE_ROWER;
        rower[5] = 32;
        let Some(Frame::Telemetry(update)) = parse_frame(&rower) else {
            panic!("expected telemetry");
        };
        assert_eq!(update.resistance, Some(8.0));

        let mut fine = frame();
        fine[5] = 40;
        let Some(Frame::Telemetry(update)) = parse_frame(&fine) else {
            panic!("expected telemetry");
        };
        assert_eq!(update.resistance, Some(10.0));

        let mut coarse = frame();
        coarse[5] = 24;
        let Some(Frame::Telemetry(update)) = parse_frame(&coarse) else {
            panic!("expected telemetry");
        };
        assert_eq!(update.resistance, Some(24.0));
    }

    #[test]
    fn test_error_frame_yields_fault_only() {
        let mut error = frame();
        error[7] = ERROR_SENTINEL;
        error[8] = 20;

        let mut v1 = V1Protocol::new();
        let Decoded::Fault(fault) = v1.decode(&error) else {
            panic!("expected fault");
        };
        assert_eq!(fault.code, 20);
        assert_eq!(fault.message(), "retract/extend in progress, do not obstruct deck");
    }

    #[test]
    fn test_command_echoes_context_bytes() {
        let mut v1 = V1Protocol::new();
        assert_eq!(
            &assert_ok!(v1.encode_set_resistance(5))[..],
            &[0xAB, 0x03, 0x00, 0x00, 0x00, 0x05, 0x00]
        );

        v1.decode(&frame());
        assert_eq!(
            &assert_ok!(v1.encode_set_resistance(12))[..],
            &[0xAB, 0x03, 0x00, 0x11, 0x22, 0x0C, 0x33]
        );
    }

    #[test]
    fn test_command_level_out_of_range() {
        let v1 = V1Protocol::new();
        assert_err!(v1.encode_set_resistance(-1));
        assert_err!(v1.encode_set_resistance(256));
    }
}
