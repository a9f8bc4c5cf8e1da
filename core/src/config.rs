//! Mesh core configuration
//!
//! Timing, retry and identity settings for the proxy engine:
//! - Local identity address and network id (sequence persistence key)
//! - Proxy connection timeouts and retry backoff
//! - Sequence persistence throttle and startup watermark
//! - Replay-repair heuristic thresholds
//! - Discovery phase durations
//! - GATT fallback and trigger completion policy

use crate::address::{is_unicast, HardwareAddress};
use crate::status::CompletionPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Errors that can occur during configuration validation
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Local identity address is not configured")]
    MissingIdentity,

    #[error("Local identity 0x{0:04X} is not a unicast address")]
    InvalidIdentity(u16),

    #[error("Network id must not be empty")]
    MissingNetworkId,

    #[error("Key material is missing: {0}")]
    MissingKeyMaterial(&'static str),

    #[error("Invalid key material: {0}")]
    InvalidKeyMaterial(String),

    #[error("Invalid setting {field}: {reason}")]
    InvalidSetting { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidSetting {
        field,
        reason: reason.into(),
    }
}

// ============================================================================
// KEY MATERIAL
// ============================================================================

/// Network and application keys used by the network codec
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    /// Network key, hex encoded (16 bytes)
    pub net_key: Option<String>,
    /// Application key bound to the lighting models, hex encoded (16 bytes)
    pub app_key: Option<String>,
    /// Current IV index
    pub iv_index: u32,
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("net_key", &self.net_key.as_ref().map(|_| "<redacted>"))
            .field("app_key", &self.app_key.as_ref().map(|_| "<redacted>"))
            .field("iv_index", &self.iv_index)
            .finish()
    }
}

impl Default for KeyMaterial {
    fn default() -> Self {
        Self {
            net_key: None,
            app_key: None,
            iv_index: 0,
        }
    }
}

impl KeyMaterial {
    /// Build from raw keys
    pub fn new(net_key: [u8; 16], app_key: [u8; 16], iv_index: u32) -> Self {
        Self {
            net_key: Some(hex::encode(net_key)),
            app_key: Some(hex::encode(app_key)),
            iv_index,
        }
    }

    /// Decoded network key
    pub fn net_key_bytes(&self) -> Result<[u8; 16], ConfigError> {
        decode_key(self.net_key.as_deref(), "network key")
    }

    /// Decoded application key
    pub fn app_key_bytes(&self) -> Result<[u8; 16], ConfigError> {
        decode_key(self.app_key.as_deref(), "application key")
    }

    /// Both keys present and well formed
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.net_key_bytes()?;
        self.app_key_bytes()?;
        Ok(())
    }
}

fn decode_key(value: Option<&str>, name: &'static str) -> Result<[u8; 16], ConfigError> {
    let value = value.ok_or(ConfigError::MissingKeyMaterial(name))?;
    let mut bytes = hex::decode(value.trim())
        .map_err(|e| ConfigError::InvalidKeyMaterial(format!("{}: {}", name, e)))?;
    if bytes.len() != 16 {
        let len = bytes.len();
        bytes.zeroize();
        return Err(ConfigError::InvalidKeyMaterial(format!(
            "{}: expected 16 bytes, got {}",
            name, len
        )));
    }
    let mut key = [0u8; 16];
    key.copy_from_slice(&bytes);
    bytes.zeroize();
    Ok(key)
}

// ============================================================================
// SECTIONS
// ============================================================================

/// Upper bound on proxy connect retries
pub const MAX_CONNECT_RETRIES: u32 = 10;

/// Proxy bearer connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProxySettings {
    /// Timeout for a single bearer open attempt
    pub connect_timeout_ms: u64,
    /// Number of retries after the first failed attempt
    pub connect_retries: u32,
    /// Linear backoff step between attempts (attempt n waits n * step)
    pub retry_backoff_ms: u64,
    /// Smallest transfer size the segmenter accepts from a bearer
    pub min_transfer_size: usize,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 8_000,
            connect_retries: 2,
            retry_backoff_ms: 750,
            min_transfer_size: 23,
        }
    }
}

impl ProxySettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Sequence counter persistence settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SequenceSettings {
    /// Minimum interval between durable writes of the counter
    pub persist_interval_ms: u64,
    /// Startup high watermark applied with `ensure_minimum`
    pub startup_watermark: u32,
    /// Upper bound (exclusive) of the random jitter added to the watermark
    pub watermark_jitter: u32,
}

impl Default for SequenceSettings {
    fn default() -> Self {
        Self {
            persist_interval_ms: 750,
            startup_watermark: 3_000_000,
            watermark_jitter: 10_000,
        }
    }
}

impl SequenceSettings {
    pub fn persist_interval(&self) -> Duration {
        Duration::from_millis(self.persist_interval_ms)
    }
}

/// Outbound message settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RouterSettings {
    /// Inbound PDUs identical to one sent within this window are echo
    pub echo_window_ms: u64,
    /// How long an acknowledged unicast operation waits for its status
    pub ack_timeout_ms: u64,
    /// Default TTL for access messages
    pub default_ttl: u8,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            echo_window_ms: 2_000,
            ack_timeout_ms: 3_000,
            default_ttl: 5,
        }
    }
}

impl RouterSettings {
    pub fn echo_window(&self) -> Duration {
        Duration::from_millis(self.echo_window_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

/// Replay-repair heuristic thresholds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepairSettings {
    /// Inbound traffic must have been seen within this window
    pub inbound_recency_ms: u64,
    /// No decryption failure may have been seen within this window
    pub decrypt_quiet_ms: u64,
    /// Repairs allowed per pending operation
    pub max_repairs: u32,
    /// Minimum time between two repairs
    pub cooldown_ms: u64,
    /// Counter bump for the first, second, ... repair
    pub steps: Vec<u32>,
}

impl Default for RepairSettings {
    fn default() -> Self {
        Self {
            inbound_recency_ms: 10_000,
            decrypt_quiet_ms: 30_000,
            max_repairs: 2,
            cooldown_ms: 5_000,
            steps: vec![50_000, 500_000],
        }
    }
}

impl RepairSettings {
    pub fn inbound_recency(&self) -> Duration {
        Duration::from_millis(self.inbound_recency_ms)
    }

    pub fn decrypt_quiet(&self) -> Duration {
        Duration::from_millis(self.decrypt_quiet_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    /// Step for the given zero-based repair attempt; the last step repeats
    /// doubled so later attempts always jump further.
    pub fn step_for(&self, attempt: u32) -> u32 {
        match self.steps.get(attempt as usize) {
            Some(step) => *step,
            None => {
                let last = self.steps.last().copied().unwrap_or(50_000);
                let extra = attempt as usize + 1 - self.steps.len().max(1);
                last.saturating_mul(2u32.saturating_pow(extra as u32))
            }
        }
    }
}

/// Discovery phase durations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiscoverySettings {
    /// Default overall budget for startup discovery
    pub budget_ms: u64,
    /// Longest wait for a first advertisement
    pub scan_for_any_ms: u64,
    /// Extra scanning once something has been found
    pub extra_scan_ms: u64,
    /// Rescan burst after the proxy link is up
    pub burst_rescan_ms: u64,
    /// Listening window per discovered group
    pub group_window_ms: u64,
    /// Short rescan before every group after the first
    pub inter_group_rescan_ms: u64,
    /// Poll interval while waiting for advertisements
    pub poll_interval_ms: u64,
    /// Spacing between group gets of a status refresh
    pub refresh_spacing_ms: u64,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            budget_ms: 20_000,
            scan_for_any_ms: 6_000,
            extra_scan_ms: 1_500,
            burst_rescan_ms: 2_000,
            group_window_ms: 2_500,
            inter_group_rescan_ms: 800,
            poll_interval_ms: 250,
            refresh_spacing_ms: 120,
        }
    }
}

impl DiscoverySettings {
    pub fn budget(&self) -> Duration {
        Duration::from_millis(self.budget_ms)
    }
}

/// Direct GATT control settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FallbackSettings {
    /// Vendor characteristic carrying the on/off byte
    pub vendor_characteristic: Option<Uuid>,
    /// Delay between devices when iterating a group
    pub inter_device_delay_ms: u64,
}

impl Default for FallbackSettings {
    fn default() -> Self {
        Self {
            vendor_characteristic: None,
            inter_device_delay_ms: 150,
        }
    }
}

/// Defaults for user triggered actions
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TriggerSettings {
    /// Completion policy for the monitor window of a trigger
    pub completion_policy: CompletionPolicy,
    /// Monitor window length
    pub timeout_ms: u64,
}

impl Default for TriggerSettings {
    fn default() -> Self {
        Self {
            completion_policy: CompletionPolicy::AnyStatus,
            timeout_ms: 4_000,
        }
    }
}

// ============================================================================
// ROOT
// ============================================================================

/// Root configuration of a mesh session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Local identity (provisioner) unicast address
    pub identity: Option<u16>,
    /// Network identifier used to key persisted state
    pub network_id: String,
    /// Network and application keys
    #[serde(default)]
    pub keys: KeyMaterial,
    /// Preferred proxy device, tried before advertisement based selection
    #[serde(default)]
    pub preferred_proxy: Option<HardwareAddress>,
    /// Additional group addresses always kept in the proxy filter
    #[serde(default)]
    pub groups: Vec<u16>,
    #[serde(default)]
    pub proxy: ProxySettings,
    #[serde(default)]
    pub sequence: SequenceSettings,
    #[serde(default)]
    pub router: RouterSettings,
    #[serde(default)]
    pub repair: RepairSettings,
    #[serde(default)]
    pub discovery: DiscoverySettings,
    #[serde(default)]
    pub fallback: FallbackSettings,
    #[serde(default)]
    pub trigger: TriggerSettings,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            identity: None,
            network_id: "default".to_string(),
            keys: KeyMaterial::default(),
            preferred_proxy: None,
            groups: Vec::new(),
            proxy: ProxySettings::default(),
            sequence: SequenceSettings::default(),
            router: RouterSettings::default(),
            repair: RepairSettings::default(),
            discovery: DiscoverySettings::default(),
            fallback: FallbackSettings::default(),
            trigger: TriggerSettings::default(),
        }
    }
}

impl MeshConfig {
    /// Configuration with an identity and keys, all other settings default
    pub fn with_identity(identity: u16, keys: KeyMaterial) -> Self {
        Self {
            identity: Some(identity),
            keys,
            ..Self::default()
        }
    }

    /// Validated local identity
    pub fn identity(&self) -> Result<u16, ConfigError> {
        let identity = self.identity.ok_or(ConfigError::MissingIdentity)?;
        if !is_unicast(identity) {
            return Err(ConfigError::InvalidIdentity(identity));
        }
        Ok(identity)
    }

    /// Validate the whole configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.identity()?;
        if self.network_id.trim().is_empty() {
            return Err(ConfigError::MissingNetworkId);
        }
        self.keys.validate()?;
        if self.proxy.connect_timeout_ms == 0 {
            return Err(invalid("proxy.connect_timeout_ms", "must be > 0"));
        }
        if self.proxy.connect_retries > MAX_CONNECT_RETRIES {
            return Err(invalid(
                "proxy.connect_retries",
                format!("must be <= {}", MAX_CONNECT_RETRIES),
            ));
        }
        if self.proxy.min_transfer_size < 5 {
            return Err(invalid("proxy.min_transfer_size", "must be >= 5"));
        }
        if self.repair.steps.iter().any(|s| *s == 0) {
            return Err(invalid("repair.steps", "steps must be > 0"));
        }
        if self.router.default_ttl > 0x7F {
            return Err(invalid("router.default_ttl", "must be <= 127"));
        }
        if self.discovery.poll_interval_ms == 0 {
            return Err(invalid("discovery.poll_interval_ms", "must be > 0"));
        }
        if let Some(bad) = self
            .groups
            .iter()
            .find(|g| !crate::address::is_group(**g))
        {
            return Err(invalid("groups", format!("0x{:04X} is not a group address", bad)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> KeyMaterial {
        KeyMaterial::new([0x11; 16], [0x22; 16], 0)
    }

    #[test]
    fn test_default_config_requires_identity() {
        let config = MeshConfig::default();
        assert_eq!(config.validate(), Err(ConfigError::MissingIdentity));
    }

    #[test]
    fn test_identity_must_be_unicast() {
        let config = MeshConfig::with_identity(0xC000, keys());
        assert_eq!(config.validate(), Err(ConfigError::InvalidIdentity(0xC000)));
    }

    #[test]
    fn test_missing_keys_rejected() {
        let config = MeshConfig::with_identity(0x7F00, KeyMaterial::default());
        assert_eq!(
            config.validate(),
            Err(ConfigError::MissingKeyMaterial("network key"))
        );
    }

    #[test]
    fn test_short_key_rejected() {
        let mut material = keys();
        material.app_key = Some("0011".to_string());
        assert!(matches!(
            material.validate(),
            Err(ConfigError::InvalidKeyMaterial(_))
        ));
    }

    #[test]
    fn test_valid_config() {
        let config = MeshConfig::with_identity(0x7F00, keys());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_groups_must_be_group_addresses() {
        let mut config = MeshConfig::with_identity(0x7F00, keys());
        config.groups = vec![0xC001, 0x0010];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidSetting { field: "groups", .. })
        ));
    }

    #[test]
    fn test_connect_retries_are_bounded() {
        let mut config = MeshConfig::with_identity(0x7F00, keys());
        config.proxy.connect_retries = MAX_CONNECT_RETRIES;
        assert!(config.validate().is_ok());

        config.proxy.connect_retries = u32::MAX;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidSetting {
                field: "proxy.connect_retries",
                ..
            })
        ));
    }

    #[test]
    fn test_repair_steps_increase() {
        let settings = RepairSettings::default();
        assert_eq!(settings.step_for(0), 50_000);
        assert_eq!(settings.step_for(1), 500_000);
        assert_eq!(settings.step_for(2), 1_000_000);
        assert!(settings.step_for(3) > settings.step_for(2));
    }

    #[test]
    fn test_config_json_defaults_fill_in() {
        let json = r#"{"identity": 32512, "network_id": "home"}"#;
        let config: MeshConfig = serde_json::from_str(json).expect("parse");
        assert_eq!(config.identity, Some(0x7F00));
        assert_eq!(config.sequence.persist_interval_ms, 750);
        assert_eq!(config.router.echo_window_ms, 2_000);
    }

    #[test]
    fn test_key_material_debug_redacts() {
        let debug = format!("{:?}", keys());
        assert!(!debug.contains("1111"));
        assert!(debug.contains("redacted"));
    }
}
