// BLE collaborators backed by btleplug
//
// One adapter serves all three roles the core needs: advertisement scanner,
// proxy bearer (Mesh Proxy service, Data In / Data Out characteristics) and
// per-device GATT link for direct control.

use crate::config::BleConfig;
use async_trait::async_trait;
use btleplug::api::{
    BDAddr, Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    PeripheralProperties, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use meshlight_core::proxy::{BearerError, BearerEvent, BearerLink};
use meshlight_core::scan::{sig_uuid, ScanError, MESH_PROVISIONING_SERVICE, MESH_PROXY_SERVICE};
use meshlight_core::transport::{CharacteristicInfo, GattError};
use meshlight_core::{AdvertisementRecord, AdvertisementScanner, GattLink, HardwareAddress, ProxyBearer};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Mesh Proxy Data In (client writes)
pub const PROXY_DATA_IN: u16 = 0x2ADD;
/// Mesh Proxy Data Out (proxy notifies)
pub const PROXY_DATA_OUT: u16 = 0x2ADE;

struct ProxyLink {
    address: HardwareAddress,
    peripheral: Peripheral,
    data_in: Characteristic,
    pump: JoinHandle<()>,
}

struct BleInner {
    adapter: Option<Adapter>,
    settings: BleConfig,
    seen: Mutex<HashMap<HardwareAddress, AdvertisementRecord>>,
    scan_task: Mutex<Option<JoinHandle<()>>>,
    proxy: tokio::sync::Mutex<Option<ProxyLink>>,
    gatt: tokio::sync::Mutex<HashMap<HardwareAddress, Peripheral>>,
}

/// The host's first Bluetooth adapter
#[derive(Clone)]
pub struct BleLink {
    inner: Arc<BleInner>,
}

impl BleLink {
    /// Open the first adapter. A host without one still yields a link that
    /// reports itself unavailable.
    pub async fn open(settings: BleConfig) -> Self {
        let adapter = match first_adapter().await {
            Ok(adapter) => {
                info!("Using Bluetooth adapter");
                Some(adapter)
            }
            Err(e) => {
                warn!("No Bluetooth adapter: {}", e);
                None
            }
        };
        Self {
            inner: Arc::new(BleInner {
                adapter,
                settings,
                seen: Mutex::new(HashMap::new()),
                scan_task: Mutex::new(None),
                proxy: tokio::sync::Mutex::new(None),
                gatt: tokio::sync::Mutex::new(HashMap::new()),
            }),
        }
    }

    fn adapter(&self) -> Option<&Adapter> {
        self.inner.adapter.as_ref()
    }

    async fn find_peripheral(&self, address: HardwareAddress) -> Result<Peripheral, String> {
        let adapter = self.adapter().ok_or_else(|| "no adapter".to_string())?;
        let peripherals = adapter.peripherals().await.map_err(|e| e.to_string())?;
        peripherals
            .into_iter()
            .find(|p| hardware_address(p.address()) == address)
            .ok_or_else(|| format!("{} not seen by the adapter", address))
    }
}

async fn first_adapter() -> Result<Adapter, btleplug::Error> {
    let manager = Manager::new().await?;
    manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| btleplug::Error::Other("no adapters".into()))
}

fn hardware_address(address: BDAddr) -> HardwareAddress {
    HardwareAddress::new(address.into_inner())
}

/// Convert btleplug's view of an advertiser into the core's record
pub fn record_from_properties(properties: &PeripheralProperties) -> AdvertisementRecord {
    let mut record =
        AdvertisementRecord::new(hardware_address(properties.address), properties.rssi.unwrap_or(i16::MIN));
    record.local_name = properties.local_name.clone();
    record.service_uuids = properties.services.clone();
    record.service_data = properties.service_data.clone();
    record.manufacturer_data = properties.manufacturer_data.clone();
    record
}

fn mesh_services() -> Vec<Uuid> {
    vec![
        sig_uuid(MESH_PROXY_SERVICE),
        sig_uuid(MESH_PROVISIONING_SERVICE),
    ]
}

fn characteristic(peripheral: &Peripheral, uuid: Uuid) -> Option<Characteristic> {
    peripheral.characteristics().into_iter().find(|c| c.uuid == uuid)
}

// ============================================================================
// SCANNER
// ============================================================================

#[async_trait]
impl AdvertisementScanner for BleLink {
    async fn start(&self) -> Result<(), ScanError> {
        let adapter = self
            .adapter()
            .ok_or_else(|| ScanError::Unavailable("no Bluetooth adapter".into()))?
            .clone();
        if self.inner.scan_task.lock().is_some() {
            return Ok(());
        }

        let mut events = adapter
            .events()
            .await
            .map_err(|e| ScanError::Failed(e.to_string()))?;
        let services = if self.inner.settings.mesh_only {
            mesh_services()
        } else {
            Vec::new()
        };
        adapter
            .start_scan(ScanFilter { services })
            .await
            .map_err(|e| ScanError::Failed(e.to_string()))?;
        debug!("BLE scan started");

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    _ => continue,
                };
                let peripheral = match adapter.peripheral(&id).await {
                    Ok(peripheral) => peripheral,
                    Err(_) => continue,
                };
                if let Ok(Some(properties)) = peripheral.properties().await {
                    let mut record = record_from_properties(&properties);
                    record.last_seen = Some(tokio::time::Instant::now());
                    inner.seen.lock().insert(record.address, record);
                }
            }
        });
        *self.inner.scan_task.lock() = Some(task);
        Ok(())
    }

    async fn stop(&self) -> Result<(), ScanError> {
        let task = self.inner.scan_task.lock().take();
        if let Some(task) = task {
            task.abort();
        }
        if let Some(adapter) = self.adapter() {
            adapter
                .stop_scan()
                .await
                .map_err(|e| ScanError::Failed(e.to_string()))?;
            debug!("BLE scan stopped");
        }
        Ok(())
    }

    fn is_scanning(&self) -> bool {
        self.inner.scan_task.lock().is_some()
    }

    fn discovered(&self) -> Vec<AdvertisementRecord> {
        let mut records: Vec<_> = self.inner.seen.lock().values().cloned().collect();
        records.sort_by(|a, b| b.rssi.cmp(&a.rssi));
        records
    }
}

// ============================================================================
// PROXY BEARER
// ============================================================================

#[async_trait]
impl ProxyBearer for BleLink {
    fn is_available(&self) -> bool {
        self.adapter().is_some()
    }

    async fn open(
        &self,
        address: HardwareAddress,
        timeout: Duration,
    ) -> Result<BearerLink, BearerError> {
        let adapter = self.adapter().ok_or(BearerError::Unavailable)?.clone();
        let peripheral = self
            .find_peripheral(address)
            .await
            .map_err(|_| BearerError::DeviceNotFound(address))?;

        tokio::time::timeout(timeout, peripheral.connect())
            .await
            .map_err(|_| BearerError::Timeout)?
            .map_err(|e| BearerError::ConnectFailed(e.to_string()))?;
        peripheral
            .discover_services()
            .await
            .map_err(|e| BearerError::ConnectFailed(e.to_string()))?;

        let data_in = characteristic(&peripheral, sig_uuid(PROXY_DATA_IN));
        let data_out = characteristic(&peripheral, sig_uuid(PROXY_DATA_OUT));
        let (data_in, data_out) = match (data_in, data_out) {
            (Some(data_in), Some(data_out)) => (data_in, data_out),
            _ => {
                let _ = peripheral.disconnect().await;
                return Err(BearerError::ServiceMissing(address));
            }
        };
        peripheral
            .subscribe(&data_out)
            .await
            .map_err(|e| BearerError::ConnectFailed(e.to_string()))?;

        let mut notifications = peripheral
            .notifications()
            .await
            .map_err(|e| BearerError::ConnectFailed(e.to_string()))?;
        let mut central = adapter
            .events()
            .await
            .map_err(|e| BearerError::ConnectFailed(e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let id = peripheral.id();
        let out_uuid = data_out.uuid;
        let pump = tokio::spawn(async move {
            let reason = loop {
                tokio::select! {
                    notification = notifications.next() => match notification {
                        Some(n) if n.uuid == out_uuid => {
                            if tx.send(BearerEvent::Frame(n.value)).is_err() {
                                return;
                            }
                        }
                        Some(_) => {}
                        None => break "notification stream ended".to_string(),
                    },
                    event = central.next() => match event {
                        Some(CentralEvent::DeviceDisconnected(gone)) if gone == id => {
                            break "peripheral disconnected".to_string();
                        }
                        Some(_) => {}
                        None => break "adapter event stream ended".to_string(),
                    },
                }
            };
            let _ = tx.send(BearerEvent::Disconnected { reason });
        });

        info!("Proxy bearer open to {}", address);
        *self.inner.proxy.lock().await = Some(ProxyLink {
            address,
            peripheral,
            data_in,
            pump,
        });
        Ok(BearerLink {
            max_transfer_size: self.inner.settings.transfer_size,
            events: rx,
        })
    }

    async fn write(&self, frame: &[u8]) -> Result<(), BearerError> {
        let proxy = self.inner.proxy.lock().await;
        let link = proxy.as_ref().ok_or(BearerError::NotConnected)?;
        link.peripheral
            .write(&link.data_in, frame, WriteType::WithoutResponse)
            .await
            .map_err(|e| BearerError::WriteFailed(e.to_string()))
    }

    async fn close(&self) {
        let link = self.inner.proxy.lock().await.take();
        if let Some(link) = link {
            link.pump.abort();
            if let Err(e) = link.peripheral.disconnect().await {
                debug!("Disconnect from {} failed: {}", link.address, e);
            }
            debug!("Proxy bearer to {} closed", link.address);
        }
    }
}

// ============================================================================
// GATT LINK
// ============================================================================

impl BleLink {
    async fn connected(&self, device: HardwareAddress) -> Result<Peripheral, GattError> {
        self.inner
            .gatt
            .lock()
            .await
            .get(&device)
            .cloned()
            .ok_or_else(|| GattError::ConnectFailed(device, "not connected".into()))
    }
}

#[async_trait]
impl GattLink for BleLink {
    fn is_available(&self) -> bool {
        self.adapter().is_some()
    }

    async fn connect(&self, device: HardwareAddress) -> Result<(), GattError> {
        if self.adapter().is_none() {
            return Err(GattError::Unavailable);
        }
        let peripheral = self
            .find_peripheral(device)
            .await
            .map_err(|e| GattError::ConnectFailed(device, e))?;
        peripheral
            .connect()
            .await
            .map_err(|e| GattError::ConnectFailed(device, e.to_string()))?;
        self.inner.gatt.lock().await.insert(device, peripheral);
        Ok(())
    }

    async fn discover(&self, device: HardwareAddress) -> Result<Vec<CharacteristicInfo>, GattError> {
        let peripheral = self.connected(device).await?;
        peripheral
            .discover_services()
            .await
            .map_err(|e| GattError::DiscoveryFailed(e.to_string()))?;

        let mesh = mesh_services();
        Ok(peripheral
            .characteristics()
            .into_iter()
            .filter(|c| !mesh.contains(&c.service_uuid))
            .map(|c| CharacteristicInfo {
                uuid: c.uuid,
                readable: c.properties.contains(CharPropFlags::READ),
                writable: c
                    .properties
                    .intersects(CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE),
            })
            .collect())
    }

    async fn read(&self, device: HardwareAddress, uuid: Uuid) -> Result<Vec<u8>, GattError> {
        let peripheral = self.connected(device).await?;
        let target = characteristic(&peripheral, uuid)
            .ok_or_else(|| GattError::ReadFailed(format!("{} not found", uuid)))?;
        peripheral
            .read(&target)
            .await
            .map_err(|e| GattError::ReadFailed(e.to_string()))
    }

    async fn write(
        &self,
        device: HardwareAddress,
        uuid: Uuid,
        value: Vec<u8>,
    ) -> Result<(), GattError> {
        let peripheral = self.connected(device).await?;
        let target = characteristic(&peripheral, uuid)
            .ok_or_else(|| GattError::WriteFailed(format!("{} not found", uuid)))?;
        let kind = if target.properties.contains(CharPropFlags::WRITE) {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        peripheral
            .write(&target, &value, kind)
            .await
            .map_err(|e| GattError::WriteFailed(e.to_string()))
    }

    async fn disconnect(&self, device: HardwareAddress) {
        let peripheral = self.inner.gatt.lock().await.remove(&device);
        if let Some(peripheral) = peripheral {
            if let Err(e) = peripheral.disconnect().await {
                debug!("GATT disconnect from {} failed: {}", device, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_from_properties() {
        let mut properties = PeripheralProperties::default();
        properties.address = BDAddr::from([0xD4, 0x12, 0x00, 0x00, 0x01, 0x23]);
        properties.rssi = Some(-61);
        properties.local_name = Some("Porch".to_string());
        properties.services = vec![sig_uuid(MESH_PROXY_SERVICE)];

        let record = record_from_properties(&properties);
        assert_eq!(record.address.to_string(), "D4:12:00:00:01:23");
        assert_eq!(record.address.unicast(), 0x0123);
        assert_eq!(record.rssi, -61);
        assert!(record.is_proxy_capable());
        assert_eq!(record.local_name.as_deref(), Some("Porch"));
    }

    #[test]
    fn test_proxy_characteristics_are_sig_ids() {
        assert_eq!(
            sig_uuid(PROXY_DATA_IN).to_string(),
            "00002add-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            sig_uuid(PROXY_DATA_OUT).to_string(),
            "00002ade-0000-1000-8000-00805f9b34fb"
        );
    }
}
