use bytes::{BufMut, Bytes, BytesMut};
use std::{
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use super::{level_byte, v1, Decoded, ProtocolHandle};
use crate::{
    bluetooth_uuid,
    error::{FitwireError, Result},
    events::{hex_dump, EventSink},
    transport::Transport,
    types::{LogLevel, NormalizedTelemetry, ProtocolKind, UserProfile},
};

/// Primary service
pub const SERVICE_UUID: Uuid = bluetooth_uuid(0xFFF0);
/// Telemetry notifications
pub const NOTIFY_UUID: Uuid = bluetooth_uuid(0xFFF1);
/// Command writes
pub const WRITE_UUID: Uuid = bluetooth_uuid(0xFFF2);

/// Heartbeat period
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
/// Length of the short cadence frame
pub const CADENCE_FRAME_LEN: usize = 12;
/// Level the heartbeat repeats until the first resistance command
pub const INITIAL_LEVEL: u8 = 1;

const INIT_OPCODE: u8 = 0x40;
const HEARTBEAT_OPCODE: u8 = 0x20;
const HEARTBEAT_SUBCODE: u8 = 0xC1;
const POUNDS_PER_KG: f64 = 2.204_622_6;

fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

/// Init command carrying the user's age and weight
///
/// The age byte is the firmware's lb-scaled value, `round(age * 2.2046226)`.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn init_command(user: UserProfile) -> Bytes {
    let age = (f64::from(user.age) * POUNDS_PER_KG).round().clamp(0.0, 255.0) as u8;
    let weight = user.weight_kg.round().clamp(0.0, 255.0) as u8;

    let mut buf = BytesMut::with_capacity(5);
    buf.put_u8(INIT_OPCODE);
    buf.put_u8(0x00);
    buf.put_u8(age);
    buf.put_u8(weight);
    let sum = checksum(&buf);
    buf.put_u8(sum);
    buf.freeze()
}

/// Heartbeat frame; also the set-resistance command
#[must_use]
pub fn heartbeat_command(level: u8) -> Bytes {
    let mut buf = BytesMut::with_capacity(5);
    buf.put_u8(HEARTBEAT_OPCODE);
    buf.put_u8(HEARTBEAT_SUBCODE);
    buf.put_u8(level);
    buf.put_u8(0x00);
    let sum = checksum(&buf);
    buf.put_u8(sum);
    buf.freeze()
}

/// HuanTong decoder
///
/// Long frames use the V1 layout. 12-byte frames only carry cadence.
#[derive(Debug)]
pub struct HuanTongProtocol {
    user: UserProfile,
    level: Arc<AtomicU8>,
    v1: v1::V1Protocol,
}

impl HuanTongProtocol {
    /// Fresh decoder for a user
    #[must_use]
    pub fn new(user: UserProfile) -> Self {
        Self {
            user,
            level: Arc::new(AtomicU8::new(INITIAL_LEVEL)),
            v1: v1::V1Protocol::new(),
        }
    }

    /// Resistance level repeated by the heartbeat
    #[must_use]
    pub fn level(&self) -> u8 {
        self.level.load(Ordering::Relaxed)
    }

    pub(crate) async fn handshake(&mut self, handle: &mut ProtocolHandle, events: &EventSink) -> Result<()> {
        handle.require(NOTIFY_UUID, "notify")?;
        handle.require(WRITE_UUID, "write")?;
        handle.subscribe(NOTIFY_UUID).await?;

        let init = init_command(self.user);
        handle
            .transport()
            .write(WRITE_UUID, &init, false)
            .await
            .map_err(|e| FitwireError::handshake(ProtocolKind::HuanTong, format!("init command: {e}")))?;
        events.log(LogLevel::Info, "HuanTong init sent", Some(&init));

        handle.set_heartbeat(tokio::spawn(heartbeat_loop(
            handle.transport(),
            Arc::clone(&self.level),
            events.clone(),
        )));
        Ok(())
    }

    pub(crate) fn decode(&mut self, value: &[u8]) -> Decoded {
        if value.len() == CADENCE_FRAME_LEN {
            return Decoded::Telemetry(parse_cadence_frame(value));
        }
        self.v1.decode(value)
    }

    pub(crate) fn encode_set_resistance(&self, level: i32) -> Result<Bytes> {
        let level = level_byte(ProtocolKind::HuanTong, level)?;
        self.level.store(level, Ordering::Relaxed);
        Ok(heartbeat_command(level))
    }
}

/// Parse a 12-byte cadence frame; zero rpm while byte 1 is clear
#[must_use]
pub fn parse_cadence_frame(frame: &[u8]) -> NormalizedTelemetry {
    let rpm = match frame {
        [_, flag, hi, lo, ..] if *flag != 0 => u16::from_be_bytes([*hi, *lo]),
        _ => 0,
    };
    NormalizedTelemetry {
        rpm: Some(f64::from(rpm)),
        ..Default::default()
    }
}

async fn heartbeat_loop(transport: Arc<dyn Transport>, level: Arc<AtomicU8>, events: EventSink) {
    let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        if !transport.is_connected().await {
            events.debug("HuanTong heartbeat stopped, link down");
            break;
        }
        let frame = heartbeat_command(level.load(Ordering::Relaxed));
        if let Err(e) = transport.write(WRITE_UUID, &frame, false).await {
            events.warn(format!("HuanTong heartbeat {} failed: {e}", hex_dump(&frame)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{protocol::Protocol, transport::mock::MockTransport, types::SessionSettings};
    use tokio_test::assert_ok;

    #[test]
    fn test_init_command() {
        let user = UserProfile {
            weight_kg: 70.0,
            age: 30,
        };
        // 30 * 2.2046226 = 66.14
        assert_eq!(&init_command(user)[..], &[0x40, 0x00, 66, 70, (0x40 + 66 + 70) as u8]);
    }

    #[test]
    fn test_heartbeat_checksum_wraps() {
        assert_eq!(&heartbeat_command(0)[..], &[0x20, 0xC1, 0x00, 0x00, 0xE1]);
        // 0x20 + 0xC1 + 0x40 = 0x121
        assert_eq!(&heartbeat_command(0x40)[..], &[0x20, 0xC1, 0x40, 0x00, 0x21]);
    }

    #[test]
    fn test_cadence_frame() {
        let mut frame = [0u8; CADENCE_FRAME_LEN];
        frame[1] = 0x01;
        frame[2] = 0x00;
        frame[3] = 0x4B;
        let mut protocol = HuanTongProtocol::new(UserProfile::default());
        let Decoded::Telemetry(update) = protocol.decode(&frame) else {
            panic!("expected telemetry");
        };
        assert_eq!(update.rpm, Some(75.0));

        frame[1] = 0x00;
        assert_eq!(parse_cadence_frame(&frame).rpm, Some(0.0));
    }

    #[test]
    fn test_long_frames_use_v1_layout() {
        let mut frame = vec![0u8; v1::MIN_FRAME_LEN];
        frame[0] = v1::FRAME_HEADER;
        frame[7] = v1::ERROR_SENTINEL;
        frame[8] = 22;
        let mut protocol = HuanTongProtocol::new(UserProfile::default());
        assert!(matches!(protocol.decode(&frame), Decoded::Fault(f) if f.code == 22));
    }

    #[test]
    fn test_set_resistance_updates_heartbeat() {
        let protocol = HuanTongProtocol::new(UserProfile::default());
        assert_eq!(protocol.level(), INITIAL_LEVEL);
        let frame = assert_ok!(protocol.encode_set_resistance(9));
        assert_eq!(&frame[..], &heartbeat_command(9)[..]);
        assert_eq!(protocol.level(), 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_sends_init_and_heartbeats() {
        let (events, _rx) = EventSink::channel();
        let mock = MockTransport::new(&["fff0"], &[NOTIFY_UUID, WRITE_UUID]);
        let settings = SessionSettings::default();
        let mut protocol = Protocol::new(ProtocolKind::HuanTong, &settings);

        let mut handle = assert_ok!(protocol.connect(Arc::new(mock.clone()), &events).await);
        assert_ok!(protocol.encode_set_resistance(6));

        tokio::time::sleep(Duration::from_millis(2500)).await;

        let writes = mock.writes_to(WRITE_UUID);
        assert_eq!(writes[0], init_command(settings.user).to_vec());
        assert!(writes.len() >= 3, "writes: {writes:02X?}");
        assert!(writes[1..].iter().all(|w| *w == heartbeat_command(6).to_vec()));

        protocol.disconnect(&mut handle, &events).await;
        let sent = mock.writes_to(WRITE_UUID).len();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(mock.writes_to(WRITE_UUID).len(), sent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_starts_at_level_one() {
        let (events, _rx) = EventSink::channel();
        let mock = MockTransport::new(&["fff0"], &[NOTIFY_UUID, WRITE_UUID]);
        let mut protocol = Protocol::new(ProtocolKind::HuanTong, &SessionSettings::default());

        let mut handle = assert_ok!(protocol.connect(Arc::new(mock.clone()), &events).await);
        tokio::time::sleep(Duration::from_millis(1500)).await;

        let writes = mock.writes_to(WRITE_UUID);
        assert!(writes.len() >= 2, "writes: {writes:02X?}");
        assert!(writes[1..].iter().all(|w| *w == [0x20, 0xC1, 0x01, 0x00, 0xE2]));

        protocol.disconnect(&mut handle, &events).await;
    }
}
