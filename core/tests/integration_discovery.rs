//! Discovery integration tests
//!
//! Startup and on-demand discovery against the simulated mesh, including
//! budget enforcement and the single-flight guards.
//!
//! Run with: cargo test --test integration_discovery

use meshlight_core::discovery::GroupReport;
use meshlight_core::model::LinkStatus;
use meshlight_core::proxy::SessionState;
use meshlight_core::simulator::{Scenario, ScenarioNode, SimulatedMesh};
use meshlight_core::{
    CoreEvent, DiscoveryPhase, HardwareAddress, KeyMaterial, MeshConfig, MeshCore, MeshError,
};
use std::time::Duration;
use tokio::time::Instant;

fn keys() -> KeyMaterial {
    KeyMaterial::new([0x5A; 16], [0xA5; 16], 0)
}

fn hw(last: u8) -> HardwareAddress {
    HardwareAddress::new([0xD4, 0x12, 0x00, 0x00, 0x00, last])
}

fn scenario() -> Scenario {
    Scenario {
        nodes: vec![
            ScenarioNode::new(hw(0x10)).subscribed(&[0xC000]),
            ScenarioNode::new(hw(0x11)).subscribed(&[0xC000, 0xC001]),
            ScenarioNode::new(hw(0x12)).subscribed(&[0xC001]),
        ],
        ..Scenario::default()
    }
}

fn build(mesh: &SimulatedMesh) -> MeshCore {
    MeshCore::builder(MeshConfig::with_identity(0x0001, keys()))
        .simulated(mesh)
        .build()
        .expect("Failed to build core")
}

#[tokio::test(start_paused = true)]
async fn test_groups_confirmed_by_status_windows() {
    let mesh = SimulatedMesh::new(scenario(), &keys()).expect("mesh");
    let core = build(&mesh);

    let report = core.run_startup_discovery(None).await.expect("discovery");
    assert_eq!(
        report.groups,
        vec![
            GroupReport {
                group: 0xC000,
                responders: vec![0x0010, 0x0011],
            },
            GroupReport {
                group: 0xC001,
                responders: vec![0x0011, 0x0012],
            },
        ]
    );
    assert_eq!(report.responders(), 3);

    let registry = core.registry();
    assert_eq!(registry.confirmed_members(0xC000), vec![0x0010, 0x0011]);
    assert_eq!(registry.confirmed_members(0xC001), vec![0x0011, 0x0012]);
    assert_eq!(registry.device(0x0011).expect("device").group, Some(0xC000));
    assert_eq!(registry.device(0x0012).expect("device").group, Some(0xC001));
    assert_eq!(registry.active_discovery_group(), None);
}

#[tokio::test(start_paused = true)]
async fn test_phases_published_in_order() {
    let mesh = SimulatedMesh::new(scenario(), &keys()).expect("mesh");
    let core = build(&mesh);
    let mut events = core.subscribe();

    core.run_startup_discovery(None).await.expect("discovery");

    let mut phases = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let CoreEvent::DiscoveryPhase(phase) = event {
            phases.push(phase);
        }
    }
    assert_eq!(
        phases,
        vec![
            DiscoveryPhase::ScanningForAny,
            DiscoveryPhase::BriefExtraScan,
            DiscoveryPhase::StopScanning,
            DiscoveryPhase::ConnectProxy,
            DiscoveryPhase::SyncMembershipFromDatabase,
            DiscoveryPhase::BurstRescan,
            DiscoveryPhase::PerGroupDiscovery,
            DiscoveryPhase::Done,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_budget_is_enforced() {
    let mesh = SimulatedMesh::new(scenario(), &keys()).expect("mesh");
    let core = build(&mesh);

    let started = Instant::now();
    let report = core
        .run_startup_discovery(Some(Duration::from_secs(1)))
        .await
        .expect("discovery");

    assert!(report.deadline_hit);
    assert!(started.elapsed() <= Duration::from_millis(1_100), "took {:?}", started.elapsed());
    assert_eq!(report.proxy, None);
    assert!(report.groups.is_empty());
    // The run still finishes and marks discovery as done
    assert_eq!(report.phase, DiscoveryPhase::Done);
    assert!(core.discovery_completed());
}

#[tokio::test(start_paused = true)]
async fn test_nothing_advertising() {
    let mut scenario = scenario();
    for node in &mut scenario.nodes {
        node.hidden = true;
    }
    let mesh = SimulatedMesh::new(scenario, &keys()).expect("mesh");
    let core = build(&mesh);

    let started = Instant::now();
    let report = core
        .run_startup_discovery(Some(Duration::from_secs(10)))
        .await
        .expect("discovery");
    assert_eq!(report.devices_found, 0);
    assert_eq!(report.proxy, None);
    assert!(!report.deadline_hit);
    assert_eq!(mesh.connect_attempts(), 0);
    assert!(report.elapsed >= Duration::from_secs(6));
    assert!(started.elapsed() <= Duration::from_secs(10), "took {:?}", started.elapsed());
    assert!(core.discovery_completed());
}

#[tokio::test(start_paused = true)]
async fn test_slow_proxy_connect_is_abandoned_at_deadline() {
    let scenario = Scenario {
        connect_delay_ms: 5_000,
        ..scenario()
    };
    let mesh = SimulatedMesh::new(scenario, &keys()).expect("mesh");
    let core = build(&mesh);

    let started = Instant::now();
    let report = core
        .run_startup_discovery(Some(Duration::from_secs(4)))
        .await
        .expect("discovery");
    assert!(report.deadline_hit);
    assert_eq!(report.proxy, None);
    assert!(started.elapsed() <= Duration::from_millis(4_100), "took {:?}", started.elapsed());
    assert!(mesh.connect_attempts() >= 1);

    // Nothing finishes the abandoned attempt later on
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(core.session().state(), SessionState::Disconnected);
    assert_eq!(mesh.connected_proxy(), None);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_startup_runs_are_rejected() {
    let mesh = SimulatedMesh::new(scenario(), &keys()).expect("mesh");
    let core = build(&mesh);

    let (first, second) = tokio::join!(
        core.run_startup_discovery(None),
        core.run_startup_discovery(None)
    );
    let results = [first, second];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(MeshError::AlreadyRunning))));
}

#[tokio::test(start_paused = true)]
async fn test_on_demand_discovery_skips_blind_scan() {
    let mesh = SimulatedMesh::new(scenario(), &keys()).expect("mesh");
    let core = build(&mesh);
    core.run_startup_discovery(None).await.expect("startup");
    let mut events = core.subscribe();

    let report = core.discover_groups().await.expect("on demand");
    assert_eq!(report.groups.len(), 2);
    assert_eq!(report.proxy, Some(hw(0x10)));

    let mut phases = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let CoreEvent::DiscoveryPhase(phase) = event {
            phases.push(phase);
        }
    }
    assert!(!phases.contains(&DiscoveryPhase::ScanningForAny));
    assert!(phases.contains(&DiscoveryPhase::PerGroupDiscovery));
    assert_eq!(mesh.connect_attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_database_outage_still_queries_default_group() {
    let mut scenario = scenario();
    scenario.database_available = false;
    let mesh = SimulatedMesh::new(scenario, &keys()).expect("mesh");
    let core = build(&mesh);

    let report = core.run_startup_discovery(None).await.expect("discovery");
    assert_eq!(report.groups.len(), 1);
    assert_eq!(report.groups[0].group, 0xC000);
    assert_eq!(report.groups[0].responders, vec![0x0010, 0x0011]);
    assert!(core.registry().confirmed_members(0xC001).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_refresh_statuses_sends_one_get_per_group() {
    let mesh = SimulatedMesh::new(scenario(), &keys()).expect("mesh");
    let core = build(&mesh);

    // Nothing to refresh through before a proxy is up
    assert_eq!(core.refresh_statuses().await.expect("refresh"), 0);

    core.run_startup_discovery(None).await.expect("discovery");
    let before = mesh.client_pdus();
    assert_eq!(core.refresh_statuses().await.expect("refresh"), 2);
    assert_eq!(mesh.client_pdus(), before + 2);
}

#[tokio::test(start_paused = true)]
async fn test_rescan_marks_quiet_devices_absent() {
    let mesh = SimulatedMesh::new(scenario(), &keys()).expect("mesh");
    let core = build(&mesh);
    core.run_startup_discovery(None).await.expect("startup");
    let registry = core.registry();
    assert_eq!(registry.device(0x0012).expect("device").link, LinkStatus::Connected);

    mesh.set_hidden(0x0012, true);
    let report = core.discover_groups().await.expect("on demand");

    // Still a confirmed member, but no longer advertising
    assert_eq!(registry.confirmed_members(0xC001), vec![0x0011, 0x0012]);
    assert_eq!(registry.device(0x0012).expect("device").link, LinkStatus::Absent);
    assert_eq!(registry.device(0x0011).expect("device").link, LinkStatus::Connected);
    assert_eq!(registry.device(0x0010).expect("device").link, LinkStatus::Ready);
    assert_eq!(registry.len(), 3);
    assert_eq!(report.proxy, Some(hw(0x10)));
}
