//! Direct GATT control
//!
//! Fallback path used only while the proxy bearer is unavailable. Each device
//! is driven on its own: connect, discover characteristics, pick the on/off
//! characteristic and read-modify-write it. Groups are expanded to their
//! known members and walked one device at a time.

use crate::address::{format_address, is_group, HardwareAddress};
use crate::config::FallbackSettings;
use crate::events::StatusEvent;
use crate::message::OnOffMessage;
use crate::model::DeviceRegistry;
use crate::transport::abstraction::{
    Availability, OutboundMessage, Transport, TransportError, TransportKind,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Errors for GATT operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GattError {
    #[error("GATT unavailable")]
    Unavailable,
    #[error("Connect to {0} failed: {1}")]
    ConnectFailed(HardwareAddress, String),
    #[error("Service discovery failed: {0}")]
    DiscoveryFailed(String),
    #[error("No usable on/off characteristic")]
    NoControlCharacteristic,
    #[error("Characteristic {0} is read-only")]
    ReadOnly(Uuid),
    #[error("Read failed: {0}")]
    ReadFailed(String),
    #[error("Write failed: {0}")]
    WriteFailed(String),
}

/// One discovered characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicInfo {
    pub uuid: Uuid,
    pub readable: bool,
    pub writable: bool,
}

/// Per-device GATT access provided by the platform
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GattLink: Send + Sync {
    fn is_available(&self) -> bool;

    async fn connect(&self, device: HardwareAddress) -> Result<(), GattError>;

    async fn discover(&self, device: HardwareAddress) -> Result<Vec<CharacteristicInfo>, GattError>;

    async fn read(&self, device: HardwareAddress, characteristic: Uuid) -> Result<Vec<u8>, GattError>;

    async fn write(
        &self,
        device: HardwareAddress,
        characteristic: Uuid,
        value: Vec<u8>,
    ) -> Result<(), GattError>;

    async fn disconnect(&self, device: HardwareAddress);
}

/// Pick the characteristic carrying on/off state: the vendor one if known,
/// else the first writable, else the first readable.
pub fn choose_characteristic(
    characteristics: &[CharacteristicInfo],
    vendor: Option<Uuid>,
) -> Option<CharacteristicInfo> {
    vendor
        .and_then(|v| characteristics.iter().find(|c| c.uuid == v))
        .or_else(|| characteristics.iter().find(|c| c.writable))
        .or_else(|| characteristics.iter().find(|c| c.readable))
        .copied()
}

/// Fallback transport over [`GattLink`]
pub struct GattFallbackController {
    link: Arc<dyn GattLink>,
    registry: DeviceRegistry,
    settings: FallbackSettings,
}

impl GattFallbackController {
    pub fn new(link: Arc<dyn GattLink>, registry: DeviceRegistry, settings: FallbackSettings) -> Self {
        Self {
            link,
            registry,
            settings,
        }
    }

    fn targets(&self, destination: u16) -> Vec<(u16, HardwareAddress)> {
        let devices = if is_group(destination) {
            self.registry.members_of(destination)
        } else {
            self.registry.devices_with_unicast(destination)
        };
        devices
            .into_iter()
            .filter_map(|d| d.hardware.map(|hw| (d.unicast, hw)))
            .collect()
    }

    /// Drive one device. Returns the state it ended up in.
    pub async fn control_device(
        &self,
        device: HardwareAddress,
        desired: Option<bool>,
    ) -> Result<bool, GattError> {
        self.link.connect(device).await?;
        let result = self.read_modify_write(device, desired).await;
        self.link.disconnect(device).await;
        result
    }

    async fn read_modify_write(
        &self,
        device: HardwareAddress,
        desired: Option<bool>,
    ) -> Result<bool, GattError> {
        let characteristics = self.link.discover(device).await?;
        let target = choose_characteristic(&characteristics, self.settings.vendor_characteristic)
            .ok_or(GattError::NoControlCharacteristic)?;

        let mut value = if target.readable {
            self.link.read(device, target.uuid).await?
        } else {
            Vec::new()
        };
        let current = value.first().map(|b| *b != 0).unwrap_or(false);

        let on = match desired {
            None => return Ok(current),
            Some(on) => on,
        };
        if !target.writable {
            return Err(GattError::ReadOnly(target.uuid));
        }
        match value.first_mut() {
            Some(first) => *first = on as u8,
            None => value.push(on as u8),
        }
        self.link.write(device, target.uuid, value).await?;
        Ok(on)
    }
}

#[async_trait]
impl Transport for GattFallbackController {
    fn kind(&self) -> TransportKind {
        TransportKind::GattFallback
    }

    fn availability(&self) -> Availability {
        if self.link.is_available() {
            Availability::Ready
        } else {
            Availability::Unavailable
        }
    }

    async fn deliver(&self, outbound: &OutboundMessage) -> Result<Vec<StatusEvent>, TransportError> {
        if !self.link.is_available() {
            return Err(TransportError::Unavailable("GATT".into()));
        }
        let desired = match outbound.message {
            OnOffMessage::Set { on, .. } => Some(on),
            OnOffMessage::Get => None,
            OnOffMessage::Status { .. } => {
                return Err(TransportError::Encoding("status is not sendable".into()))
            }
        };

        let targets = self.targets(outbound.destination);
        if targets.is_empty() {
            return Err(TransportError::SendFailed(format!(
                "no known devices behind {}",
                format_address(outbound.destination)
            )));
        }
        info!(
            "Direct GATT control of {} device(s) for {}",
            targets.len(),
            format_address(outbound.destination)
        );

        let delay = Duration::from_millis(self.settings.inter_device_delay_ms);
        let mut statuses = Vec::with_capacity(targets.len());
        for (index, (unicast, hardware)) in targets.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(delay).await;
            }
            match self.control_device(*hardware, desired).await {
                Ok(state) => {
                    debug!("{} now {}", hardware, if state { "on" } else { "off" });
                    statuses.push(StatusEvent::new(*unicast, state, None));
                }
                Err(e) => warn!("Direct control of {} failed: {}", hardware, e),
            }
        }

        if statuses.is_empty() {
            return Err(TransportError::SendFailed(
                "no device accepted direct control".into(),
            ));
        }
        Ok(statuses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::AdvertisementRecord;
    use mockall::predicate::eq;

    const VENDOR: Uuid = Uuid::from_u128(0x0000_FFF1_0000_1000_8000_0080_5F9B_34FB);
    const OTHER: Uuid = Uuid::from_u128(0x0000_2A19_0000_1000_8000_0080_5F9B_34FB);

    fn hw(last: u8) -> HardwareAddress {
        HardwareAddress::new([0xAA, 0, 0, 0, 0, last])
    }

    fn set(destination: u16, on: bool) -> OutboundMessage {
        OutboundMessage {
            source: 0x0001,
            destination,
            seq: 1,
            ttl: 5,
            message: OnOffMessage::Set {
                on,
                tid: 0,
                acknowledged: true,
            },
        }
    }

    #[test]
    fn test_characteristic_preference() {
        let readable = CharacteristicInfo {
            uuid: OTHER,
            readable: true,
            writable: false,
        };
        let writable = CharacteristicInfo {
            uuid: Uuid::from_u128(7),
            readable: false,
            writable: true,
        };
        let vendor = CharacteristicInfo {
            uuid: VENDOR,
            readable: true,
            writable: true,
        };

        let all = [readable, writable, vendor];
        assert_eq!(choose_characteristic(&all, Some(VENDOR)), Some(vendor));
        assert_eq!(choose_characteristic(&all, None), Some(writable));
        assert_eq!(choose_characteristic(&[readable], Some(VENDOR)), Some(readable));
        assert_eq!(choose_characteristic(&[], None), None);
    }

    #[tokio::test]
    async fn test_read_modify_write() {
        let mut link = MockGattLink::new();
        link.expect_is_available().return_const(true);
        link.expect_connect().with(eq(hw(0x10))).times(1).returning(|_| Ok(()));
        link.expect_discover().returning(|_| {
            Ok(vec![CharacteristicInfo {
                uuid: VENDOR,
                readable: true,
                writable: true,
            }])
        });
        link.expect_read()
            .with(eq(hw(0x10)), eq(VENDOR))
            .returning(|_, _| Ok(vec![0x00, 0x7F]));
        link.expect_write()
            .with(eq(hw(0x10)), eq(VENDOR), eq(vec![0x01, 0x7F]))
            .times(1)
            .returning(|_, _, _| Ok(()));
        link.expect_disconnect().times(1).returning(|_| ());

        let registry = DeviceRegistry::new();
        registry.upsert_advertisement(&AdvertisementRecord::new(hw(0x10), -50));
        let controller = GattFallbackController::new(
            Arc::new(link),
            registry,
            FallbackSettings {
                vendor_characteristic: Some(VENDOR),
                inter_device_delay_ms: 0,
            },
        );

        let statuses = controller.deliver(&set(0x0010, true)).await.expect("deliver");
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].source, 0x0010);
        assert!(statuses[0].state);
    }

    #[tokio::test]
    async fn test_unavailable_link() {
        let mut link = MockGattLink::new();
        link.expect_is_available().return_const(false);
        let controller = GattFallbackController::new(
            Arc::new(link),
            DeviceRegistry::new(),
            FallbackSettings::default(),
        );
        assert_eq!(controller.availability(), Availability::Unavailable);
        assert!(controller
            .deliver(&set(0x0010, true))
            .await
            .unwrap_err()
            .is_unavailable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_group_walks_members_and_tolerates_failures() {
        let mut link = MockGattLink::new();
        link.expect_is_available().return_const(true);
        link.expect_connect().returning(|device| {
            if device == hw(0x11) {
                Err(GattError::ConnectFailed(device, "133".into()))
            } else {
                Ok(())
            }
        });
        link.expect_discover().returning(|_| {
            Ok(vec![CharacteristicInfo {
                uuid: OTHER,
                readable: false,
                writable: true,
            }])
        });
        link.expect_write().times(2).returning(|_, _, _| Ok(()));
        link.expect_disconnect().times(2).returning(|_| ());

        let registry = DeviceRegistry::new();
        for last in [0x10, 0x11, 0x12] {
            let unicast = registry.upsert_advertisement(&AdvertisementRecord::new(hw(last), -50));
            registry.assign_group(unicast, 0xC001);
        }
        let controller =
            GattFallbackController::new(Arc::new(link), registry, FallbackSettings::default());

        let statuses = controller.deliver(&set(0xC001, false)).await.expect("deliver");
        let sources: Vec<u16> = statuses.iter().map(|s| s.source).collect();
        assert_eq!(sources, vec![0x0010, 0x0012]);
        assert!(statuses.iter().all(|s| !s.state));
    }

    #[tokio::test]
    async fn test_read_only_characteristic_answers_gets() {
        let mut link = MockGattLink::new();
        link.expect_is_available().return_const(true);
        link.expect_connect().returning(|_| Ok(()));
        link.expect_discover().returning(|_| {
            Ok(vec![CharacteristicInfo {
                uuid: OTHER,
                readable: true,
                writable: false,
            }])
        });
        link.expect_read().returning(|_, _| Ok(vec![0x01]));
        link.expect_disconnect().returning(|_| ());

        let controller = GattFallbackController::new(
            Arc::new(link),
            DeviceRegistry::new(),
            FallbackSettings::default(),
        );
        assert!(controller.control_device(hw(0x10), None).await.unwrap());
        assert_eq!(
            controller.control_device(hw(0x10), Some(false)).await,
            Err(GattError::ReadOnly(OTHER))
        );
    }
}
