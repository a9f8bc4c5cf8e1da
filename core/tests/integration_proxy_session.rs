//! Proxy session integration tests
//!
//! Full core against the simulated mesh: connect, accept-list setup,
//! set/status round trips, triggers, link loss and reconnect.
//!
//! Run with: cargo test --test integration_proxy_session

use meshlight_core::message::Delivery;
use meshlight_core::simulator::{Scenario, ScenarioNode, SimulatedMesh};
use meshlight_core::transport::TransportKind;
use meshlight_core::{
    CompletionPolicy, CoreEvent, DiscoveryPhase, HardwareAddress, KeyMaterial, MeshConfig,
    MeshCore, TriggerOptions, TriggerOutcome,
};
use std::time::Duration;
use tokio::sync::broadcast;

fn keys() -> KeyMaterial {
    KeyMaterial::new([0x5A; 16], [0xA5; 16], 0)
}

fn hw(last: u8) -> HardwareAddress {
    HardwareAddress::new([0xD4, 0x12, 0x00, 0x00, 0x00, last])
}

fn lighting_scenario() -> Scenario {
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

async fn wait_for_status(events: &mut broadcast::Receiver<CoreEvent>, source: u16) -> bool {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(CoreEvent::Status(status)) if status.source == source => return status.state,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(2), wait)
        .await
        .expect("No status in time")
}

#[tokio::test(start_paused = true)]
async fn test_startup_discovery_connects_and_filters() {
    let mesh = SimulatedMesh::new(lighting_scenario(), &keys()).expect("mesh");
    let core = build(&mesh);

    let report = core
        .run_startup_discovery(Some(Duration::from_secs(20)))
        .await
        .expect("discovery");

    assert_eq!(report.phase, DiscoveryPhase::Done);
    assert!(!report.deadline_hit);
    assert_eq!(report.devices_found, 3);
    assert_eq!(report.proxy, Some(hw(0x10)));
    assert!(core.session().is_ready());
    assert!(core.discovery_completed());

    // Identity, default group and every group from the database
    assert_eq!(mesh.accept_list(), vec![0x0001, 0xC000, 0xC001]);
    assert!(core.filter().is_configured().await);
    assert_eq!(mesh.connect_attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_set_state_round_trip() {
    let mesh = SimulatedMesh::new(lighting_scenario(), &keys()).expect("mesh");
    let core = build(&mesh);
    core.run_startup_discovery(None).await.expect("discovery");

    let mut events = core.subscribe();
    let delivery = core.set_state(0x0012, true, None).await.expect("set");
    assert_eq!(delivery, Delivery::Sent(TransportKind::Proxy));

    assert!(wait_for_status(&mut events, 0x0012).await);
    assert_eq!(mesh.node_state(0x0012), Some(true));

    tokio::time::sleep(Duration::from_millis(50)).await;
    let device = core.registry().device(0x0012).expect("device");
    assert_eq!(device.state, Some(true));
    assert_eq!(core.router().pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_group_set_is_unacknowledged_by_default() {
    let mesh = SimulatedMesh::new(lighting_scenario(), &keys()).expect("mesh");
    let core = build(&mesh);
    core.run_startup_discovery(None).await.expect("discovery");

    let before = mesh.client_pdus();
    let delivery = core.set_state(0xC001, true, None).await.expect("set");
    assert!(delivery.is_sent());
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(mesh.client_pdus(), before + 1);
    assert_eq!(mesh.node_state(0x0011), Some(true));
    assert_eq!(mesh.node_state(0x0012), Some(true));
    assert_eq!(mesh.node_state(0x0010), Some(false));
    assert_eq!(core.router().pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_link_loss_then_reconnect_on_send() {
    let mesh = SimulatedMesh::new(lighting_scenario(), &keys()).expect("mesh");
    let core = build(&mesh);
    core.run_startup_discovery(None).await.expect("discovery");
    let mut events = core.subscribe();

    mesh.drop_link("supervision timeout");
    let lost = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            if let Ok(CoreEvent::ProxyFailed { reason }) = events.recv().await {
                return reason;
            }
        }
    })
    .await
    .expect("No link loss event");
    assert_eq!(lost, "supervision timeout");
    assert!(!core.session().is_ready());
    assert!(!core.filter().is_configured().await);

    let delivery = core.set_state(0x0010, true, None).await.expect("set");
    assert_eq!(delivery, Delivery::Sent(TransportKind::Proxy));
    assert_eq!(mesh.connect_attempts(), 2);
    assert!(mesh.accept_list().contains(&0x0001));
    assert!(wait_for_status(&mut events, 0x0010).await);
}

#[tokio::test(start_paused = true)]
async fn test_refused_connects_are_retried() {
    let mut scenario = lighting_scenario();
    scenario.refuse_connects = 2;
    let mesh = SimulatedMesh::new(scenario, &keys()).expect("mesh");
    let core = build(&mesh);

    let report = core.run_startup_discovery(None).await.expect("discovery");
    assert_eq!(report.proxy, Some(hw(0x10)));
    assert_eq!(mesh.connect_attempts(), 3);
    assert!(core.session().is_ready());
}

#[tokio::test(start_paused = true)]
async fn test_proxy_echo_is_not_reported() {
    let mesh = SimulatedMesh::new(lighting_scenario(), &keys()).expect("mesh");
    mesh.set_echo(true);
    let core = build(&mesh);
    core.run_startup_discovery(None).await.expect("discovery");

    let mut events = core.subscribe();
    core.get_state(0x0010).await.expect("get");
    let state = wait_for_status(&mut events, 0x0010).await;
    assert!(!state);

    tokio::time::sleep(Duration::from_millis(500)).await;
    while let Ok(event) = events.try_recv() {
        if let CoreEvent::Status(status) = event {
            assert_ne!(status.source, 0x0001, "own traffic surfaced as a status");
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_flushes_and_disconnects() {
    let mesh = SimulatedMesh::new(lighting_scenario(), &keys()).expect("mesh");
    let core = build(&mesh);
    core.run_startup_discovery(None).await.expect("discovery");
    core.set_state(0x0010, true, None).await.expect("set");

    core.shutdown().await.expect("shutdown");
    assert!(!core.session().is_ready());
    assert_eq!(core.sequence().persisted(), core.sequence().current());
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(mesh.connected_proxy(), None);
}

fn momentary_scenario() -> Scenario {
    let switch = |last: u8, groups: &[u16]| {
        let mut node = ScenarioNode::new(hw(last)).subscribed(groups);
        node.momentary_ms = Some(500);
        node
    };
    Scenario {
        nodes: vec![
            switch(0x10, &[0xC000]),
            switch(0x11, &[0xC000]),
            ScenarioNode::new(hw(0x12)).subscribed(&[0xC001]),
        ],
        ..Scenario::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_trigger_waits_for_momentary_release() {
    let mesh = SimulatedMesh::new(momentary_scenario(), &keys()).expect("mesh");
    let core = build(&mesh);
    core.run_startup_discovery(None).await.expect("discovery");

    let options = TriggerOptions {
        timeout: None,
        policy: Some(CompletionPolicy::OnThenOff),
    };
    let outcome = core.trigger(0x0010, true, options).await.expect("trigger");
    assert_eq!(outcome, TriggerOutcome::Success { responders: 1 });
    assert_eq!(mesh.node_state(0x0010), Some(false));
}

#[tokio::test(start_paused = true)]
async fn test_group_trigger_counts_confirmed_members() {
    let mesh = SimulatedMesh::new(momentary_scenario(), &keys()).expect("mesh");
    let core = build(&mesh);
    core.run_startup_discovery(None).await.expect("discovery");
    assert_eq!(core.registry().confirmed_members(0xC000), vec![0x0010, 0x0011]);

    // Group sets are unacknowledged; only the self-release statuses come back
    let outcome = core
        .trigger(0xC000, true, TriggerOptions::default())
        .await
        .expect("trigger");
    assert_eq!(outcome, TriggerOutcome::Success { responders: 2 });
}

#[tokio::test(start_paused = true)]
async fn test_newer_trigger_supersedes_older() {
    let mesh = SimulatedMesh::new(momentary_scenario(), &keys()).expect("mesh");
    let core = build(&mesh);
    core.run_startup_discovery(None).await.expect("discovery");

    let (older, newer) = tokio::join!(
        core.trigger(0xC001, true, TriggerOptions::default()),
        async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            core.trigger(0x0012, false, TriggerOptions::default()).await
        }
    );
    assert_eq!(
        older.expect("older trigger"),
        TriggerOutcome::Partial {
            responders: 0,
            expected: 1,
        }
    );
    assert_eq!(
        newer.expect("newer trigger"),
        TriggerOutcome::Success { responders: 1 }
    );
    assert_eq!(mesh.node_state(0x0012), Some(false));
}

#[tokio::test(start_paused = true)]
async fn test_trigger_aborts_on_link_loss() {
    let mesh = SimulatedMesh::new(momentary_scenario(), &keys()).expect("mesh");
    let core = build(&mesh);
    core.run_startup_discovery(None).await.expect("discovery");

    let started = tokio::time::Instant::now();
    let (outcome, _) = tokio::join!(
        core.trigger(0xC001, true, TriggerOptions::default()),
        async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            mesh.drop_link("peer went away");
        }
    );
    assert_eq!(
        outcome.expect("trigger"),
        TriggerOutcome::Partial {
            responders: 0,
            expected: 1,
        }
    );
    assert!(started.elapsed() < Duration::from_secs(1));
}
