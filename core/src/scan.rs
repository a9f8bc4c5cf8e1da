//! Advertisement scanning collaborator
//!
//! The scanner itself lives in platform code. The core only needs to start
//! and stop it (it contends with the proxy bearer) and read what it found.
//! Filtering for "is this a mesh device" is the scanner's job.

use crate::address::HardwareAddress;
use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

/// Mesh Provisioning service
pub const MESH_PROVISIONING_SERVICE: u16 = 0x1827;

/// Mesh Proxy service
pub const MESH_PROXY_SERVICE: u16 = 0x1828;

/// Battery service
pub const BATTERY_SERVICE: u16 = 0x180F;

/// Expand a 16-bit SIG identifier onto the Bluetooth base UUID
pub const fn sig_uuid(short: u16) -> Uuid {
    Uuid::from_u128(0x0000_0000_0000_1000_8000_0080_5F9B_34FB | ((short as u128) << 96))
}

/// Errors for scanner operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    #[error("Scanner unavailable: {0}")]
    Unavailable(String),
    #[error("Scanner failed: {0}")]
    Failed(String),
}

/// One advertising device as last seen by the scanner
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AdvertisementRecord {
    pub address: HardwareAddress,
    /// RSSI in dBm
    pub rssi: i16,
    pub service_uuids: Vec<Uuid>,
    pub service_data: HashMap<Uuid, Vec<u8>>,
    /// Manufacturer payloads keyed by company identifier
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    pub local_name: Option<String>,
    /// When the scanner last heard this device; `None` if it does not track it
    pub last_seen: Option<Instant>,
}

impl AdvertisementRecord {
    pub fn new(address: HardwareAddress, rssi: i16) -> Self {
        Self {
            address,
            rssi,
            ..Self::default()
        }
    }

    /// Mesh Proxy service in the advertised services or service data
    pub fn is_proxy_capable(&self) -> bool {
        let proxy = sig_uuid(MESH_PROXY_SERVICE);
        self.service_uuids.contains(&proxy) || self.service_data.contains_key(&proxy)
    }

    /// Battery level advertised as Battery Service data, 0-100
    pub fn battery_hint(&self) -> Option<u8> {
        self.service_data
            .get(&sig_uuid(BATTERY_SERVICE))
            .and_then(|data| data.first().copied())
            .filter(|level| *level <= 100)
    }
}

/// Platform advertisement scanner
#[async_trait]
pub trait AdvertisementScanner: Send + Sync {
    async fn start(&self) -> Result<(), ScanError>;

    async fn stop(&self) -> Result<(), ScanError>;

    fn is_scanning(&self) -> bool;

    /// Everything seen since the scanner was created, with `last_seen` set
    /// when the scanner tracks it
    fn discovered(&self) -> Vec<AdvertisementRecord>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sig_uuid_expansion() {
        assert_eq!(
            sig_uuid(MESH_PROXY_SERVICE).to_string(),
            "00001828-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_proxy_capability() {
        let mut record = AdvertisementRecord::new(HardwareAddress::new([1, 2, 3, 4, 5, 6]), -60);
        assert!(!record.is_proxy_capable());

        record
            .service_data
            .insert(sig_uuid(MESH_PROXY_SERVICE), vec![0x00, 0x11]);
        assert!(record.is_proxy_capable());
    }

    #[test]
    fn test_battery_hint() {
        let mut record = AdvertisementRecord::new(HardwareAddress::new([1, 2, 3, 4, 5, 6]), -60);
        assert_eq!(record.battery_hint(), None);

        record.service_data.insert(sig_uuid(BATTERY_SERVICE), vec![87]);
        assert_eq!(record.battery_hint(), Some(87));

        record.service_data.insert(sig_uuid(BATTERY_SERVICE), vec![250]);
        assert_eq!(record.battery_hint(), None);
    }
}
