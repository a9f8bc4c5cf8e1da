// Discovery module: startup and on-demand discovery of proxies and group
// membership

pub mod membership;
pub mod orchestrator;

pub use membership::{
    sync_membership, DatabaseError, MembershipSync, MeshDatabase, NodeSubscriptions,
    StaticDatabase,
};
pub use orchestrator::{
    select_candidate, DiscoveryOrchestrator, DiscoveryParts, DiscoveryReport, GroupReport,
};

/// Phases of startup discovery, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DiscoveryPhase {
    Idle,
    ScanningForAny,
    BriefExtraScan,
    StopScanning,
    ConnectProxy,
    SyncMembershipFromDatabase,
    BurstRescan,
    PerGroupDiscovery,
    Done,
}

impl std::fmt::Display for DiscoveryPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DiscoveryPhase::Idle => "idle",
            DiscoveryPhase::ScanningForAny => "scanning for any device",
            DiscoveryPhase::BriefExtraScan => "brief extra scan",
            DiscoveryPhase::StopScanning => "stop scanning",
            DiscoveryPhase::ConnectProxy => "connect proxy",
            DiscoveryPhase::SyncMembershipFromDatabase => "sync membership",
            DiscoveryPhase::BurstRescan => "burst rescan",
            DiscoveryPhase::PerGroupDiscovery => "per-group discovery",
            DiscoveryPhase::Done => "done",
        };
        f.write_str(name)
    }
}
