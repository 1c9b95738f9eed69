//! Radio transport abstraction for cross-platform support
//!
//! The mesh only needs a narrow slice of a BLE stack: scan for peers that
//! advertise the marketplace service, connect, subscribe to notifications,
//! and read or write one of two fixed characteristics. [`RadioTransport`]
//! captures that slice; [`BtleplugTransport`] implements it on top of
//! btleplug and [`crate::loopback`] provides an in-process stand-in.

use crate::error::{MeshError, MeshResult};
use async_trait::async_trait;
use uuid::Uuid;

/// Transport-level device identifier
pub type DeviceId = String;

/// Service every interoperating device advertises
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x6e40_0001_b5a3_f393_e0a9_e50e_24dc_ca9e);

/// Characteristic carrying serialized envelopes
pub const MESSAGE_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x6e40_0002_b5a3_f393_e0a9_e50e_24dc_ca9e);

/// Characteristic exposing the device's [`DeviceInfo`]
pub const DEVICE_INFO_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x6e40_0003_b5a3_f393_e0a9_e50e_24dc_ca9e);

/// A peer seen during a scan
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredPeer {
    pub id: DeviceId,
    pub name: Option<String>,
    pub services: Vec<Uuid>,
    pub rssi: Option<i16>,
}

impl DiscoveredPeer {
    /// Whether the peer advertises `service`
    pub fn advertises(&self, service: &Uuid) -> bool {
        self.services.iter().any(|s| s == service)
    }
}

/// Contents of the device-info characteristic
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub device_id: String,
    pub name: String,
}

/// Events pushed by the transport into the mesh
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Bytes received on `characteristic` from `peer`
    Data {
        peer: DeviceId,
        characteristic: Uuid,
        bytes: Vec<u8>,
    },
    /// The link to `peer` went away
    Disconnected { peer: DeviceId },
}

/// Trait for platform-agnostic radio operations
#[async_trait]
pub trait RadioTransport: Send + Sync {
    /// Power up the radio and register the sink for inbound events
    ///
    /// Fails with [`MeshError::TransportUnavailable`] when the platform
    /// cannot provide radio access.
    async fn start(&self, events: tokio::sync::mpsc::Sender<TransportEvent>) -> MeshResult<()>;

    /// Publish this device's info on the device-info characteristic
    async fn set_device_info(&self, info: DeviceInfo) -> MeshResult<()>;

    /// Start scanning for peers advertising `service`
    async fn start_scan(
        &self,
        service: Uuid,
        discovered: tokio::sync::mpsc::Sender<DiscoveredPeer>,
    ) -> MeshResult<()>;

    /// Stop an active scan
    async fn stop_scan(&self) -> MeshResult<()>;

    /// Connect to a device
    async fn connect(&self, peer: &DeviceId) -> MeshResult<()>;

    /// Route notifications for `characteristic` on `peer` into the event sink
    async fn subscribe(&self, peer: &DeviceId, service: Uuid, characteristic: Uuid)
        -> MeshResult<()>;

    /// Write a characteristic value on a connected device
    async fn write(
        &self,
        peer: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
        data: &[u8],
    ) -> MeshResult<()>;

    /// Read a characteristic value from a connected device
    async fn read(&self, peer: &DeviceId, service: Uuid, characteristic: Uuid)
        -> MeshResult<Vec<u8>>;

    /// Disconnect from a device
    async fn disconnect(&self, peer: &DeviceId) -> MeshResult<()>;
}

use btleplug::api::{
    CharPropFlags, Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use dashmap::DashMap;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Maximum number of retry attempts for a connection
const MAX_RETRIES: u32 = 5;

/// Maximum number of retry attempts for a characteristic write
const WRITE_RETRIES: u32 = 3;

/// How often discovered peripherals are polled while scanning
const DISCOVERY_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Radio transport implemented with btleplug (central role only)
pub struct BtleplugTransport {
    adapter: Arc<RwLock<Option<Adapter>>>,

    /// Connected peripherals mapped by address
    peripherals: Arc<DashMap<DeviceId, Peripheral>>,

    events: Arc<RwLock<Option<mpsc::Sender<TransportEvent>>>>,

    scan_task: Mutex<Option<JoinHandle<()>>>,

    notification_tasks: Arc<DashMap<DeviceId, JoinHandle<()>>>,

    device_info: RwLock<Option<DeviceInfo>>,
}

impl BtleplugTransport {
    pub fn new() -> Self {
        Self {
            adapter: Arc::new(RwLock::new(None)),
            peripherals: Arc::new(DashMap::new()),
            events: Arc::new(RwLock::new(None)),
            scan_task: Mutex::new(None),
            notification_tasks: Arc::new(DashMap::new()),
            device_info: RwLock::new(None),
        }
    }

    /// Create the btleplug manager and pick the first adapter
    async fn ensure_adapter(&self) -> MeshResult<Adapter> {
        let mut adapter_lock = self.adapter.write().await;

        if let Some(adapter) = adapter_lock.as_ref() {
            return Ok(adapter.clone());
        }

        debug!("Creating BLE manager and adapter");

        let manager = Manager::new().await.map_err(|e| {
            MeshError::TransportUnavailable(format!("Failed to create BLE manager: {}", e))
        })?;

        let adapters = manager.adapters().await.map_err(|e| {
            MeshError::TransportUnavailable(format!("Failed to get adapters: {}", e))
        })?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or_else(|| MeshError::TransportUnavailable("No BLE adapter found".to_string()))?;

        info!("BLE adapter initialized: {:?}", adapter.adapter_info().await);
        *adapter_lock = Some(adapter.clone());
        Ok(adapter)
    }

    fn get_peripheral(&self, peer: &DeviceId) -> MeshResult<Peripheral> {
        self.peripherals
            .get(peer)
            .map(|p| p.clone())
            .ok_or_else(|| MeshError::DeviceNotFound(peer.to_string()))
    }

    fn find_characteristic(
        peripheral: &Peripheral,
        service: Uuid,
        characteristic: Uuid,
    ) -> MeshResult<Characteristic> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic && c.service_uuid == service)
            .ok_or(MeshError::CharacteristicNotFound(characteristic))
    }

    async fn event_sink(&self) -> MeshResult<mpsc::Sender<TransportEvent>> {
        self.events
            .read()
            .await
            .clone()
            .ok_or_else(|| MeshError::AdapterError("Transport not started".to_string()))
    }
}

impl Default for BtleplugTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RadioTransport for BtleplugTransport {
    async fn start(&self, events: mpsc::Sender<TransportEvent>) -> MeshResult<()> {
        info!("Starting BLE transport (central mode)");
        self.ensure_adapter().await?;
        *self.events.write().await = Some(events);
        Ok(())
    }

    async fn set_device_info(&self, info: DeviceInfo) -> MeshResult<()> {
        // btleplug has no GATT server role; peers that can read us run
        // a platform peripheral stack that serves this value.
        debug!("Device info set to {:?}", info);
        *self.device_info.write().await = Some(info);
        Ok(())
    }

    async fn start_scan(
        &self,
        service: Uuid,
        discovered: mpsc::Sender<DiscoveredPeer>,
    ) -> MeshResult<()> {
        let adapter = self.ensure_adapter().await?;

        adapter
            .start_scan(ScanFilter {
                services: vec![service],
            })
            .await
            .map_err(|e| MeshError::AdapterError(format!("Failed to start scanning: {}", e)))?;

        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(DISCOVERY_POLL_INTERVAL).await;

                let peripherals = match adapter.peripherals().await {
                    Ok(peripherals) => peripherals,
                    Err(e) => {
                        warn!("Failed to list peripherals: {}", e);
                        continue;
                    }
                };

                for peripheral in peripherals {
                    let properties = match peripheral.properties().await {
                        Ok(Some(properties)) => properties,
                        Ok(None) => continue,
                        Err(e) => {
                            debug!("Failed to read peripheral properties: {}", e);
                            continue;
                        }
                    };

                    let peer = DiscoveredPeer {
                        id: peripheral.address().to_string(),
                        name: properties.local_name,
                        services: properties.services,
                        rssi: properties.rssi,
                    };

                    if discovered.send(peer).await.is_err() {
                        // Scan consumer went away
                        return;
                    }
                }
            }
        });

        if let Some(previous) = self.scan_task.lock().await.replace(handle) {
            previous.abort();
        }

        info!("BLE scanning started");
        Ok(())
    }

    async fn stop_scan(&self) -> MeshResult<()> {
        if let Some(handle) = self.scan_task.lock().await.take() {
            handle.abort();
        }

        if let Some(adapter) = self.adapter.read().await.as_ref() {
            adapter
                .stop_scan()
                .await
                .map_err(|e| MeshError::AdapterError(format!("Failed to stop scanning: {}", e)))?;
        }

        debug!("BLE scanning stopped");
        Ok(())
    }

    async fn connect(&self, peer: &DeviceId) -> MeshResult<()> {
        info!("Connecting to device: {}", peer);

        let adapter = self.ensure_adapter().await?;

        let peripheral = adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|p| p.address().to_string() == *peer)
            .ok_or_else(|| MeshError::DeviceNotFound(peer.to_string()))?;

        let mut retries = 0;
        loop {
            match peripheral.connect().await {
                Ok(_) => {
                    peripheral.discover_services().await.map_err(|e| {
                        MeshError::ConnectionFailed(format!("Service discovery failed: {}", e))
                    })?;

                    self.peripherals.insert(peer.clone(), peripheral.clone());
                    info!("Successfully connected to device: {}", peer);
                    return Ok(());
                }
                Err(e) => {
                    retries += 1;
                    if retries >= MAX_RETRIES {
                        error!("Failed to connect after {} retries: {}", MAX_RETRIES, e);
                        return Err(MeshError::ConnectionFailed(format!(
                            "Failed to connect after {} retries: {}",
                            MAX_RETRIES, e
                        )));
                    }

                    warn!("Connection attempt {} failed, retrying: {}", retries, e);

                    // Exponential backoff: 100ms, 200ms, 400ms, 800ms
                    let delay = Duration::from_millis(100 * (1 << (retries - 1)));
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn subscribe(
        &self,
        peer: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
    ) -> MeshResult<()> {
        let peripheral = self.get_peripheral(peer)?;
        let target = Self::find_characteristic(&peripheral, service, characteristic)?;

        peripheral.subscribe(&target).await.map_err(|e| {
            MeshError::ConnectionFailed(format!("Subscribe to {} failed: {}", characteristic, e))
        })?;

        let mut notifications = peripheral.notifications().await?;
        let events = self.event_sink().await?;
        let peer_id = peer.clone();

        let handle = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                let event = TransportEvent::Data {
                    peer: peer_id.clone(),
                    characteristic: notification.uuid,
                    bytes: notification.value,
                };
                if events.send(event).await.is_err() {
                    return;
                }
            }

            debug!("Notification stream for {} ended", peer_id);
            if events
                .send(TransportEvent::Disconnected { peer: peer_id })
                .await
                .is_err()
            {
                debug!("Event sink closed before disconnect could be reported");
            }
        });

        if let Some(previous) = self.notification_tasks.insert(peer.clone(), handle) {
            previous.abort();
        }

        debug!("Subscribed to {} on {}", characteristic, peer);
        Ok(())
    }

    async fn write(
        &self,
        peer: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
        data: &[u8],
    ) -> MeshResult<()> {
        debug!("Writing {} bytes to device: {}", data.len(), peer);

        let peripheral = self.get_peripheral(peer)?;

        let is_connected = peripheral
            .is_connected()
            .await
            .map_err(|e| MeshError::ConnectionFailed(format!("Connection check failed: {}", e)))?;

        if !is_connected {
            return Err(MeshError::ConnectionFailed(format!(
                "Device {} is not connected",
                peer
            )));
        }

        let target = Self::find_characteristic(&peripheral, service, characteristic)?;
        let write_type = if target.properties.contains(CharPropFlags::WRITE) {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };

        let mut retries = 0;
        loop {
            match peripheral.write(&target, data, write_type).await {
                Ok(_) => return Ok(()),
                Err(e) => {
                    retries += 1;
                    if retries >= WRITE_RETRIES {
                        error!("Failed to write after {} retries: {}", WRITE_RETRIES, e);
                        return Err(MeshError::TransmissionFailed(format!(
                            "Failed to write after {} retries: {}",
                            WRITE_RETRIES, e
                        )));
                    }

                    warn!("Write attempt {} failed, retrying: {}", retries, e);
                    tokio::time::sleep(Duration::from_millis(250)).await;
                }
            }
        }
    }

    async fn read(
        &self,
        peer: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
    ) -> MeshResult<Vec<u8>> {
        let peripheral = self.get_peripheral(peer)?;
        let target = Self::find_characteristic(&peripheral, service, characteristic)?;

        let value = peripheral.read(&target).await?;
        debug!("Read {} bytes from {} on {}", value.len(), characteristic, peer);
        Ok(value)
    }

    async fn disconnect(&self, peer: &DeviceId) -> MeshResult<()> {
        info!("Disconnecting from device: {}", peer);

        if let Some((_, handle)) = self.notification_tasks.remove(peer) {
            handle.abort();
        }

        let peripheral = self.get_peripheral(peer)?;
        self.peripherals.remove(peer);

        peripheral
            .disconnect()
            .await
            .map_err(|e| MeshError::ConnectionFailed(format!("Disconnect failed: {}", e)))?;

        info!("Successfully disconnected from device: {}", peer);
        Ok(())
    }
}
