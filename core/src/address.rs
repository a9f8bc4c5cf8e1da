//! Mesh addressing
//!
//! Hardware (bearer) addresses, unicast derivation and the group address
//! range. A device's unicast address is a pure function of its hardware
//! address: the last two octets, masked into the unicast range.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Unassigned address
pub const UNASSIGNED_ADDRESS: u16 = 0x0000;

/// Lowest valid unicast address
pub const UNICAST_MIN: u16 = 0x0001;

/// Highest valid unicast address
pub const UNICAST_MAX: u16 = 0x7FFF;

/// Lowest address of the group range
pub const GROUP_MIN: u16 = 0xC000;

/// Highest address of the group range (fixed group addresses start above it)
pub const GROUP_MAX: u16 = 0xFEFF;

/// The "Default" group every device may subscribe to
pub const DEFAULT_GROUP: u16 = 0xC000;

/// Errors produced while parsing addresses
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("Invalid hardware address: {0}")]
    InvalidHardwareAddress(String),
    #[error("Invalid mesh address: {0}")]
    InvalidMeshAddress(String),
}

/// Six-octet bearer address of a physical device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HardwareAddress([u8; 6]);

impl HardwareAddress {
    /// Wrap raw octets (most significant first)
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// Raw octets
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Unicast address derived from this hardware address
    pub fn unicast(&self) -> u16 {
        derive_unicast(self)
    }
}

impl fmt::Display for HardwareAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl FromStr for HardwareAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(|c| c == ':' || c == '-').collect();
        if parts.len() != 6 {
            return Err(AddressError::InvalidHardwareAddress(s.to_string()));
        }
        let mut octets = [0u8; 6];
        for (slot, part) in octets.iter_mut().zip(parts) {
            if part.len() != 2 {
                return Err(AddressError::InvalidHardwareAddress(s.to_string()));
            }
            *slot = u8::from_str_radix(part, 16)
                .map_err(|_| AddressError::InvalidHardwareAddress(s.to_string()))?;
        }
        Ok(Self(octets))
    }
}

impl Serialize for HardwareAddress {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for HardwareAddress {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Derive the unicast address of a device from its hardware address.
///
/// `((hi << 8) | lo) & 0x7FFF` over the last two octets; `0` maps to `1`.
pub fn derive_unicast(address: &HardwareAddress) -> u16 {
    let o = address.octets();
    let unicast = ((u16::from(o[4]) << 8) | u16::from(o[5])) & UNICAST_MAX;
    if unicast == UNASSIGNED_ADDRESS {
        UNICAST_MIN
    } else {
        unicast
    }
}

/// True for addresses in `0x0001..=0x7FFF`
pub fn is_unicast(address: u16) -> bool {
    (UNICAST_MIN..=UNICAST_MAX).contains(&address)
}

/// True for addresses in `0xC000..=0xFEFF`
pub fn is_group(address: u16) -> bool {
    (GROUP_MIN..=GROUP_MAX).contains(&address)
}

/// Parse a user supplied mesh address: `default`, `0xC001`, `C001` or decimal
/// prefixed with `#`.
pub fn parse_mesh_address(input: &str) -> Result<u16, AddressError> {
    let s = input.trim();
    if s.eq_ignore_ascii_case("default") {
        return Ok(DEFAULT_GROUP);
    }
    let parsed = if let Some(dec) = s.strip_prefix('#') {
        dec.parse::<u16>().ok()
    } else {
        let hex = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);
        u16::from_str_radix(hex, 16).ok()
    };
    match parsed {
        Some(addr) if is_unicast(addr) || is_group(addr) => Ok(addr),
        _ => Err(AddressError::InvalidMeshAddress(input.to_string())),
    }
}

/// Format a mesh address the way logs and the CLI show it
pub fn format_address(address: u16) -> String {
    if address == DEFAULT_GROUP {
        "0xC000 (Default)".to_string()
    } else {
        format!("0x{:04X}", address)
    }
}
