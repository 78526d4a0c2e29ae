use async_trait::async_trait;
use btleplug::{
    api::{
        Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
    },
    platform::{Adapter, Manager, Peripheral},
};
use futures::stream::StreamExt;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{sync::Mutex, time::timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{FitwireError, Result},
    events::hex_dump,
    transport::{Connector, Notification, NotificationStream, Transport},
    types::{ConnectionParams, DeviceIdentity},
};

/// Whether an advertised name starts with one of the accepted prefixes
#[must_use]
pub fn matches_name_prefix(name: Option<&str>, prefixes: &[String]) -> bool {
    name.is_some_and(|name| prefixes.iter().any(|prefix| name.starts_with(prefix.as_str())))
}

/// BLE manager for fitness equipment
///
/// Peripherals seen during scans are cached by platform id so a remembered
/// device can be reconnected without scanning again.
pub struct BleManager {
    manager: Manager,
    peripherals: Arc<Mutex<HashMap<String, Peripheral>>>,
}

impl BleManager {
    /// Create a new BLE manager
    ///
    /// # Errors
    ///
    /// Returns [`FitwireError::Ble`] if the Bluetooth stack cannot be initialized.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;

        Ok(Self {
            manager,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    async fn central(&self) -> Result<Adapter> {
        self.manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| FitwireError::DiscoveryFailed("no Bluetooth adapter available".to_string()))
    }

    /// Scan for devices whose name matches `params.name_prefixes`
    ///
    /// Results are sorted by signal strength, strongest first.
    ///
    /// # Errors
    ///
    /// Returns [`FitwireError::DiscoveryFailed`] if no adapter is available,
    /// or [`FitwireError::Ble`] for other Bluetooth errors.
    pub async fn scan_for_devices(&self, params: &ConnectionParams) -> Result<Vec<DeviceIdentity>> {
        info!("Starting scan for {:?} devices...", params.name_prefixes);

        let central = self.central().await?;
        central.start_scan(ScanFilter::default()).await?;
        tokio::time::sleep(Duration::from_millis(params.scan_timeout_ms)).await;
        central.stop_scan().await?;

        let mut devices = Vec::new();
        for peripheral in central.peripherals().await? {
            let Ok(Some(properties)) = peripheral.properties().await else {
                continue;
            };
            if !matches_name_prefix(properties.local_name.as_deref(), &params.name_prefixes) {
                continue;
            }

            let identity = DeviceIdentity {
                id: peripheral.id().to_string(),
                name: properties.local_name.clone(),
                rssi: properties.rssi,
            };
            info!("Found device: {}", identity);
            self.peripherals
                .lock()
                .await
                .insert(identity.id.clone(), peripheral);
            devices.push(identity);
        }

        devices.sort_by_key(|d| std::cmp::Reverse(d.rssi.unwrap_or(i16::MIN)));
        info!("Scan completed. Found {} device(s)", devices.len());
        Ok(devices)
    }

    /// Peripheral for a device seen earlier, from the cache or the adapter
    async fn known_peripheral(&self, central: &Adapter, identity: &DeviceIdentity) -> Result<Peripheral> {
        if let Some(peripheral) = self.peripherals.lock().await.get(&identity.id) {
            return Ok(peripheral.clone());
        }
        central
            .peripherals()
            .await?
            .into_iter()
            .find(|p| p.id().to_string() == identity.id)
            .ok_or_else(|| FitwireError::DiscoveryFailed(format!("{identity} is not known to the adapter")))
    }

    /// Connect to a device and discover its services
    ///
    /// # Errors
    ///
    /// Returns [`FitwireError::DiscoveryFailed`] if the device is unknown,
    /// [`FitwireError::Timeout`] if the connection times out, or
    /// [`FitwireError::Ble`] if connecting or service discovery fails.
    pub async fn connect_to_device(
        &self,
        identity: &DeviceIdentity,
        params: &ConnectionParams,
    ) -> Result<BleTransport> {
        info!("Connecting to device: {}", identity);

        let central = self.central().await?;
        let peripheral = self.known_peripheral(&central, identity).await?;

        if !peripheral.is_connected().await? {
            timeout(Duration::from_millis(params.connect_timeout_ms), peripheral.connect())
                .await
                .map_err(|_| FitwireError::Timeout {
                    timeout_ms: params.connect_timeout_ms,
                })??;
        }
        peripheral.discover_services().await?;

        let characteristics: HashMap<Uuid, Characteristic> = peripheral
            .characteristics()
            .into_iter()
            .map(|c| (c.uuid, c))
            .collect();
        let services = peripheral
            .services()
            .iter()
            .map(|s| s.uuid.to_string())
            .collect();
        debug!("{} exposes {} characteristics", identity, characteristics.len());

        info!("Successfully connected to {}", identity);
        Ok(BleTransport {
            identity: identity.clone(),
            central,
            peripheral,
            services,
            characteristics,
        })
    }
}

#[async_trait]
impl Connector for BleManager {
    async fn scan(&self, params: &ConnectionParams) -> Result<Vec<DeviceIdentity>> {
        self.scan_for_devices(params).await
    }

    async fn connect(
        &self,
        identity: &DeviceIdentity,
        params: &ConnectionParams,
    ) -> Result<Arc<dyn Transport>> {
        Ok(Arc::new(self.connect_to_device(identity, params).await?))
    }
}

/// Active BLE link to a device
pub struct BleTransport {
    identity: DeviceIdentity,
    central: Adapter,
    peripheral: Peripheral,
    services: Vec<String>,
    characteristics: HashMap<Uuid, Characteristic>,
}

impl BleTransport {
    fn characteristic(&self, uuid: Uuid) -> Result<&Characteristic> {
        self.characteristics
            .get(&uuid)
            .ok_or_else(|| FitwireError::Transport(format!("characteristic {uuid} not found")))
    }
}

#[async_trait]
impl Transport for BleTransport {
    fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    async fn services(&self) -> Result<Vec<String>> {
        Ok(self.services.clone())
    }

    fn has_characteristic(&self, characteristic: Uuid) -> bool {
        self.characteristics.contains_key(&characteristic)
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<()> {
        let characteristic = self.characteristic(characteristic)?;
        self.peripheral.subscribe(characteristic).await?;
        debug!("Subscribed to {}", characteristic.uuid);
        Ok(())
    }

    async fn unsubscribe(&self, characteristic: Uuid) -> Result<()> {
        let characteristic = self.characteristic(characteristic)?;
        self.peripheral.unsubscribe(characteristic).await?;
        Ok(())
    }

    async fn write(&self, characteristic: Uuid, payload: &[u8], with_response: bool) -> Result<()> {
        let characteristic = self.characteristic(characteristic)?;
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        debug!("Writing {} to {}", hex_dump(payload), characteristic.uuid);

        self.peripheral
            .write(characteristic, payload, write_type)
            .await
            .map_err(|e| FitwireError::Transport(format!("write to {}: {e}", characteristic.uuid)))
    }

    async fn notifications(&self) -> Result<NotificationStream> {
        let notifications = self.peripheral.notifications().await?;

        // Not every platform ends the notification stream on link loss, so
        // also watch the adapter for a disconnect of this peripheral.
        let mut events = self.central.events().await?;
        let id = self.peripheral.id();
        let disconnected = async move {
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(gone) = event {
                    if gone == id {
                        warn!("Peripheral {} disconnected", gone);
                        break;
                    }
                }
            }
        };

        Ok(notifications
            .map(|n| Notification::new(n.uuid, n.value))
            .take_until(Box::pin(disconnected))
            .boxed())
    }

    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    async fn disconnect(&self) -> Result<()> {
        self.peripheral.disconnect().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_prefix_matching() {
        let prefixes = ConnectionParams::default().name_prefixes;
        assert!(matches_name_prefix(Some("Mobi-R2"), &prefixes));
        assert!(matches_name_prefix(Some("MB_Bike"), &prefixes));
        assert!(!matches_name_prefix(Some("mobi-r2"), &prefixes));
        assert!(!matches_name_prefix(Some("Polar H10"), &prefixes));
        assert!(!matches_name_prefix(None, &prefixes));
        assert!(!matches_name_prefix(Some("Mobi"), &[]));
    }
}
