use fitwire::{
    ConnectionStatus, EquipmentType, FitnessDevice, Result, SessionEvent, SessionSettings,
};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("🚣 Fitwire Live Session Example");

    let settings = SessionSettings {
        equipment: EquipmentType::Rower,
        ..Default::default()
    };
    let (device, mut events) = FitnessDevice::new(settings);

    // Reuses the last device when there is one, otherwise scans
    let protocol = match device.quick_reconnect().await {
        Ok(protocol) => {
            info!("✅ Connected using {}", protocol);
            protocol
        }
        Err(e) => {
            error!("❌ Failed to connect: {}", e);
            return Err(e);
        }
    };

    if let Err(e) = device.set_resistance(8).await {
        warn!("⚠️  Could not set resistance on {}: {}", protocol, e);
    }

    info!("📊 Streaming telemetry for two minutes...");
    let streaming = timeout(Duration::from_secs(120), async {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Telemetry(update) => {
                    let merged = device.telemetry().await;
                    println!(
                        "⏱ {:>4}s  🚀 {:5.1} km/h  🔁 {:5.1} spm  ⚡ {:4.0} W  📏 {:6.0} m  🔥 {:4.0} kcal",
                        merged.duration.unwrap_or(0),
                        merged.speed.unwrap_or(0.0),
                        merged.spm.or(merged.rpm).unwrap_or(0.0),
                        merged.power.unwrap_or(0.0),
                        merged.distance.unwrap_or(0.0),
                        merged.calories.unwrap_or(0.0),
                    );
                    if update.stroke_count.is_some_and(|n| n > 0 && n % 50 == 0) {
                        info!("🎯 {} strokes", merged.stroke_count.unwrap_or(0));
                    }
                }
                SessionEvent::Error(err) => warn!("⚠️  {}", err.message),
                SessionEvent::StatusChanged(ConnectionStatus::Disconnected) => {
                    warn!("❌ Device disconnected");
                    break;
                }
                SessionEvent::StatusChanged(status) => info!("🔗 Status: {}", status),
                SessionEvent::Log(_) => {}
            }
        }
    })
    .await;

    if streaming.is_err() {
        info!("⏹ Session time is up");
    }

    // Disconnect
    info!("🔌 Disconnecting...");
    if let Err(e) = device.disconnect().await {
        error!("❌ Failed to disconnect: {}", e);
    } else {
        info!("✅ Disconnected successfully");
    }

    Ok(())
}
