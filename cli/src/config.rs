// Configuration management for the meshlight CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/meshlight/config.json
// - Linux: ~/.config/meshlight/config.json
// - Windows: %APPDATA%\meshlight\config.json

use anyhow::{Context, Result};
use meshlight_core::address::{is_unicast, parse_mesh_address};
use meshlight_core::{CompletionPolicy, HardwareAddress, MeshConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Mesh session settings handed to the core
    pub mesh: MeshConfig,

    /// Sequence state directory; defaults to the data directory
    #[serde(default)]
    pub storage_path: Option<String>,

    /// Adapter settings for BLE mode
    #[serde(default)]
    pub ble: BleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BleConfig {
    /// Transfer size assumed for proxy links
    pub transfer_size: usize,

    /// Only report advertisements carrying mesh services
    pub mesh_only: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mesh: MeshConfig {
                identity: Some(0x0001),
                ..MeshConfig::default()
            },
            storage_path: None,
            ble: BleConfig::default(),
        }
    }
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            transfer_size: 23,
            mesh_only: true,
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("meshlight");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the data directory path (cross-platform)
    pub fn data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to determine data directory")?
            .join("meshlight");

        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        Ok(data_dir)
    }

    /// Default config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Where sequence state lives
    pub fn storage_dir(&self) -> Result<PathBuf> {
        match &self.storage_path {
            Some(path) => Ok(PathBuf::from(path)),
            None => Ok(Self::data_dir()?.join("sequence")),
        }
    }

    /// Load config from `path`, or create the default file if it does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            Ok(config)
        }
    }

    /// Save config to `path`
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Set a config value
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let mesh = &mut self.mesh;
        match key {
            "identity" => {
                let identity = parse_mesh_address(value).context("Invalid unicast address")?;
                if !is_unicast(identity) {
                    anyhow::bail!("0x{:04X} is not a unicast address", identity);
                }
                mesh.identity = Some(identity);
            }
            "network_id" => mesh.network_id = value.to_string(),
            "net_key" => mesh.keys.net_key = optional(value),
            "app_key" => mesh.keys.app_key = optional(value),
            "iv_index" => {
                mesh.keys.iv_index = value.parse().context("Invalid IV index")?;
            }
            "preferred_proxy" => {
                mesh.preferred_proxy = match optional(value) {
                    Some(value) => Some(
                        value
                            .parse::<HardwareAddress>()
                            .context("Invalid hardware address")?,
                    ),
                    None => None,
                };
            }
            "groups" => {
                mesh.groups = value
                    .split(',')
                    .map(str::trim)
                    .filter(|g| !g.is_empty())
                    .map(|g| parse_mesh_address(g).with_context(|| format!("Invalid group {}", g)))
                    .collect::<Result<_>>()?;
            }
            "storage_path" => self.storage_path = optional(value),
            "transfer_size" => {
                self.ble.transfer_size = value.parse().context("Invalid number")?;
            }
            "mesh_only" => {
                self.ble.mesh_only = value.parse().context("Invalid boolean value")?;
            }
            "connect_timeout_ms" => {
                mesh.proxy.connect_timeout_ms = value.parse().context("Invalid number")?;
            }
            "discovery_budget_ms" => {
                mesh.discovery.budget_ms = value.parse().context("Invalid number")?;
            }
            "trigger_timeout_ms" => {
                mesh.trigger.timeout_ms = value.parse().context("Invalid number")?;
            }
            "completion_policy" => {
                mesh.trigger.completion_policy = parse_policy(value)?;
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        Ok(())
    }

    /// List all config values, keys redacted
    pub fn list(&self) -> Vec<(String, String)> {
        let mesh = &self.mesh;
        let redacted = |key: &Option<String>| match key {
            Some(_) => "(set)".to_string(),
            None => "(missing)".to_string(),
        };
        vec![
            (
                "identity".to_string(),
                mesh.identity
                    .map(|a| format!("0x{:04X}", a))
                    .unwrap_or_else(|| "(missing)".to_string()),
            ),
            ("network_id".to_string(), mesh.network_id.clone()),
            ("net_key".to_string(), redacted(&mesh.keys.net_key)),
            ("app_key".to_string(), redacted(&mesh.keys.app_key)),
            ("iv_index".to_string(), mesh.keys.iv_index.to_string()),
            (
                "preferred_proxy".to_string(),
                mesh.preferred_proxy
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| "(auto)".to_string()),
            ),
            (
                "groups".to_string(),
                mesh.groups
                    .iter()
                    .map(|g| format!("0x{:04X}", g))
                    .collect::<Vec<_>>()
                    .join(","),
            ),
            (
                "storage_path".to_string(),
                self.storage_path
                    .clone()
                    .unwrap_or_else(|| "(auto)".to_string()),
            ),
            ("transfer_size".to_string(), self.ble.transfer_size.to_string()),
            ("mesh_only".to_string(), self.ble.mesh_only.to_string()),
            (
                "connect_timeout_ms".to_string(),
                mesh.proxy.connect_timeout_ms.to_string(),
            ),
            (
                "discovery_budget_ms".to_string(),
                mesh.discovery.budget_ms.to_string(),
            ),
            (
                "trigger_timeout_ms".to_string(),
                mesh.trigger.timeout_ms.to_string(),
            ),
            (
                "completion_policy".to_string(),
                policy_name(mesh.trigger.completion_policy).to_string(),
            ),
        ]
    }
}

fn optional(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

pub fn parse_policy(value: &str) -> Result<CompletionPolicy> {
    match value {
        "any" | "any_status" => Ok(CompletionPolicy::AnyStatus),
        "on-then-off" | "on_then_off" => Ok(CompletionPolicy::OnThenOff),
        other => anyhow::bail!("Unknown completion policy: {}", other),
    }
}

pub fn policy_name(policy: CompletionPolicy) -> &'static str {
    match policy {
        CompletionPolicy::AnyStatus => "any",
        CompletionPolicy::OnThenOff => "on-then-off",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.mesh.identity, Some(0x0001));
        assert_eq!(config.ble.transfer_size, 23);
        assert!(config.storage_path.is_none());
    }

    #[test]
    fn test_config_roundtrip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = Config::load(&path).unwrap();
        assert!(path.exists());
        config.set("net_key", "00112233445566778899aabbccddeeff").unwrap();
        config.set("groups", "0xC001, C002").unwrap();
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.mesh.groups, vec![0xC001, 0xC002]);
        assert_eq!(
            loaded.mesh.keys.net_key.as_deref(),
            Some("00112233445566778899aabbccddeeff")
        );
    }

    #[test]
    fn test_set_rejects_bad_values() {
        let mut config = Config::default();
        assert!(config.set("identity", "0xC000").is_err());
        assert!(config.set("iv_index", "many").is_err());
        assert!(config.set("completion_policy", "sometimes").is_err());
        assert!(config.set("listen_port", "80").is_err());
    }

    #[test]
    fn test_list_redacts_keys() {
        let mut config = Config::default();
        config.set("app_key", "ffeeddccbbaa99887766554433221100").unwrap();
        let listed = config.list();
        let app_key = listed.iter().find(|(k, _)| k == "app_key").unwrap();
        assert_eq!(app_key.1, "(set)");
        assert!(!listed.iter().any(|(_, v)| v.contains("ffeedd")));
    }
}
