// Device records: one per physical node, identified by hardware address when advertised

use crate::address::HardwareAddress;
use serde::Serialize;
use tokio::time::Instant;

/// Bearer-level connection status of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    Absent,
    Connecting,
    Connected,
    Ready,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Device {
    /// Derived from the hardware address when first seen; never recomputed
    pub unicast: u16,
    /// Unknown for devices only heard through the mesh
    pub hardware: Option<HardwareAddress>,
    pub name: Option<String>,
    pub group: Option<u16>,
    pub state: Option<bool>,
    pub battery: Option<u8>,
    pub rssi: Option<i16>,
    pub proxy_capable: bool,
    pub link: LinkStatus,
    #[serde(skip)]
    pub last_seen: Option<Instant>,
    /// Scanner time of the newest advertisement merged into this record
    #[serde(skip)]
    pub last_advertised: Option<Instant>,
}

impl Device {
    /// Device first seen through an advertisement
    pub fn from_hardware(hardware: HardwareAddress) -> Self {
        Self {
            unicast: hardware.unicast(),
            hardware: Some(hardware),
            ..Self::from_unicast(hardware.unicast())
        }
    }

    /// Device first heard through a status message
    pub fn from_unicast(unicast: u16) -> Self {
        Self {
            unicast,
            hardware: None,
            name: None,
            group: None,
            state: None,
            battery: None,
            rssi: None,
            proxy_capable: false,
            link: LinkStatus::Absent,
            last_seen: None,
            last_advertised: None,
        }
    }

    pub fn display_name(&self) -> String {
        match (&self.name, &self.hardware) {
            (Some(name), _) => name.clone(),
            (None, Some(hw)) => hw.to_string(),
            (None, None) => format!("node 0x{:04X}", self.unicast),
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Some(Instant::now());
    }
}
