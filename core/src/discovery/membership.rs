//! Group membership from the mesh configuration database

use crate::address::{is_group, DEFAULT_GROUP};
use crate::model::DeviceRegistry;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DatabaseError {
    #[error("Database unavailable: {0}")]
    Unavailable(String),
    #[error("Database malformed: {0}")]
    Malformed(String),
    #[error("Database I/O: {0}")]
    Io(String),
}

/// One node's model subscriptions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSubscriptions {
    pub unicast_address: u16,
    #[serde(default)]
    pub subscriptions: Vec<u16>,
}

/// Mesh configuration database reachable through the proxy
#[async_trait]
pub trait MeshDatabase: Send + Sync {
    async fn node_subscriptions(&self) -> Result<Vec<NodeSubscriptions>, DatabaseError>;
}

/// Database backed by a fixed list, usually loaded from JSON
#[derive(Debug, Clone, Default)]
pub struct StaticDatabase {
    nodes: Vec<NodeSubscriptions>,
}

impl StaticDatabase {
    pub fn new(nodes: Vec<NodeSubscriptions>) -> Self {
        Self { nodes }
    }

    pub fn from_json(json: &str) -> Result<Self, DatabaseError> {
        let nodes = serde_json::from_str(json).map_err(|e| DatabaseError::Malformed(e.to_string()))?;
        Ok(Self { nodes })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        let json = std::fs::read_to_string(path.as_ref())
            .map_err(|e| DatabaseError::Io(format!("{}: {}", path.as_ref().display(), e)))?;
        Self::from_json(&json)
    }

    pub fn nodes(&self) -> &[NodeSubscriptions] {
        &self.nodes
    }
}

#[async_trait]
impl MeshDatabase for StaticDatabase {
    async fn node_subscriptions(&self) -> Result<Vec<NodeSubscriptions>, DatabaseError> {
        Ok(self.nodes.clone())
    }
}

/// What a membership sync changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MembershipSync {
    pub groups_created: usize,
    pub devices_assigned: usize,
    pub memberships_confirmed: usize,
}

/// Apply database subscriptions to the registry.
///
/// Every valid group subscription creates the group and confirms the node.
/// A node without a group is assigned to the default group when subscribed
/// to it, else to its first valid group.
pub fn sync_membership(registry: &DeviceRegistry, nodes: &[NodeSubscriptions]) -> MembershipSync {
    let mut sync = MembershipSync::default();

    for node in nodes {
        let groups: Vec<u16> = node
            .subscriptions
            .iter()
            .copied()
            .filter(|a| is_group(*a))
            .collect();
        if groups.len() != node.subscriptions.len() {
            debug!(
                "Node 0x{:04X}: ignoring {} non-group subscription(s)",
                node.unicast_address,
                node.subscriptions.len() - groups.len()
            );
        }
        if groups.is_empty() {
            continue;
        }

        for group in &groups {
            if registry.ensure_group(*group) {
                sync.groups_created += 1;
            }
        }

        let unassigned = registry
            .device(node.unicast_address)
            .map_or(true, |d| d.group.is_none());
        if unassigned {
            let chosen = if groups.contains(&DEFAULT_GROUP) {
                DEFAULT_GROUP
            } else {
                groups[0]
            };
            registry.assign_group(node.unicast_address, chosen);
            sync.devices_assigned += 1;
        }

        for group in &groups {
            if registry.confirm_member(*group, node.unicast_address) {
                sync.memberships_confirmed += 1;
            }
        }
    }

    info!(
        "Membership sync: {} group(s) created, {} device(s) assigned, {} membership(s) confirmed",
        sync.groups_created, sync.devices_assigned, sync.memberships_confirmed
    );
    sync
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(unicast: u16, subscriptions: &[u16]) -> NodeSubscriptions {
        NodeSubscriptions {
            unicast_address: unicast,
            subscriptions: subscriptions.to_vec(),
        }
    }

    #[test]
    fn test_default_group_assignment() {
        let registry = DeviceRegistry::new();
        let sync = sync_membership(&registry, &[node(0x0010, &[0xC000])]);

        assert_eq!(registry.device(0x0010).unwrap().group, Some(0xC000));
        assert_eq!(registry.confirmed_members(0xC000), vec![0x0010]);
        assert_eq!(sync.groups_created, 1);
        assert_eq!(sync.devices_assigned, 1);
    }

    #[test]
    fn test_default_preferred_over_first() {
        let registry = DeviceRegistry::new();
        sync_membership(&registry, &[node(0x0011, &[0xC002, 0xC000])]);
        assert_eq!(registry.device(0x0011).unwrap().group, Some(0xC000));
        assert_eq!(registry.confirmed_members(0xC002), vec![0x0011]);
    }

    #[test]
    fn test_first_valid_group_without_default() {
        let registry = DeviceRegistry::new();
        sync_membership(&registry, &[node(0x0012, &[0x0005, 0xFFFF, 0xC003, 0xC004])]);
        assert_eq!(registry.device(0x0012).unwrap().group, Some(0xC003));
        assert_eq!(registry.group_ids(), vec![0xC003, 0xC004]);
    }

    #[test]
    fn test_existing_assignment_kept() {
        let registry = DeviceRegistry::new();
        registry.assign_group(0x0013, 0xC005);
        sync_membership(&registry, &[node(0x0013, &[0xC000])]);
        assert_eq!(registry.device(0x0013).unwrap().group, Some(0xC005));
        assert_eq!(registry.confirmed_members(0xC000), vec![0x0013]);
    }

    #[test]
    fn test_static_database_json() {
        let db = StaticDatabase::from_json(
            r#"[{"unicastAddress": 16, "subscriptions": [49152]}, {"unicastAddress": 17}]"#,
        )
        .expect("parse");
        assert_eq!(db.nodes().len(), 2);
        assert_eq!(db.nodes()[0].subscriptions, vec![0xC000]);
        assert!(db.nodes()[1].subscriptions.is_empty());

        assert!(matches!(
            StaticDatabase::from_json("{"),
            Err(DatabaseError::Malformed(_))
        ));
    }
}
