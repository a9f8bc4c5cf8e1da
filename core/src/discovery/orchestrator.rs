//! Discovery orchestrator
//!
//! Startup discovery runs the phases
//! `ScanningForAny → BriefExtraScan → StopScanning → ConnectProxy →
//! SyncMembershipFromDatabase → BurstRescan → PerGroupDiscovery → Done`
//! under one overall deadline. Every phase checks the deadline before it
//! starts; past it, the run stops and reports what it reached.
//!
//! Startup discovery, on-demand discovery and status refreshes each have
//! their own in-progress flag; a second call while one runs is a no-op.

use crate::address::{format_address, HardwareAddress, DEFAULT_GROUP};
use crate::config::{DiscoverySettings, ProxySettings};
use crate::discovery::membership::{sync_membership, MeshDatabase};
use crate::discovery::DiscoveryPhase;
use crate::events::{CoreEvent, EventBus};
use crate::message::MessageRouter;
use crate::model::{DeviceRegistry, LinkStatus};
use crate::proxy::{FilterManager, ProxySession};
use crate::scan::{AdvertisementRecord, AdvertisementScanner};
use crate::status::{StatusWindows, WindowRequest};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Choose the proxy candidate: the preferred device if configured, else the
/// first proxy-capable advertiser, else the first advertiser.
pub fn select_candidate(
    records: &[AdvertisementRecord],
    preferred: Option<HardwareAddress>,
) -> Option<HardwareAddress> {
    preferred
        .or_else(|| {
            records
                .iter()
                .find(|r| r.is_proxy_capable())
                .map(|r| r.address)
        })
        .or_else(|| records.first().map(|r| r.address))
}

/// Responders of one group window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupReport {
    pub group: u16,
    pub responders: Vec<u16>,
}

/// What a discovery run reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryReport {
    /// Last phase entered
    pub phase: DiscoveryPhase,
    pub devices_found: usize,
    pub proxy: Option<HardwareAddress>,
    pub groups: Vec<GroupReport>,
    /// The run stopped because the budget ran out
    pub deadline_hit: bool,
    pub elapsed: Duration,
}

impl DiscoveryReport {
    fn new() -> Self {
        Self {
            phase: DiscoveryPhase::Idle,
            devices_found: 0,
            proxy: None,
            groups: Vec::new(),
            deadline_hit: false,
            elapsed: Duration::ZERO,
        }
    }

    /// Devices that answered any group window
    pub fn responders(&self) -> usize {
        let mut all: Vec<u16> = self
            .groups
            .iter()
            .flat_map(|g| g.responders.iter().copied())
            .collect();
        all.sort_unstable();
        all.dedup();
        all.len()
    }
}

/// Clears an in-progress flag when dropped
struct FlagGuard<'a>(&'a AtomicBool);

impl<'a> FlagGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Collaborators of the orchestrator
pub struct DiscoveryParts {
    pub settings: DiscoverySettings,
    pub proxy: ProxySettings,
    pub preferred_proxy: Option<HardwareAddress>,
    /// Groups always kept in the filter and discovered
    pub groups: Vec<u16>,
    pub scanner: Arc<dyn AdvertisementScanner>,
    pub database: Arc<dyn MeshDatabase>,
    pub session: ProxySession,
    pub filter: FilterManager,
    pub router: MessageRouter,
    pub registry: DeviceRegistry,
    pub windows: StatusWindows,
    pub events: EventBus,
}

/// Discovery workflow for one mesh session
pub struct DiscoveryOrchestrator {
    parts: DiscoveryParts,
    startup_running: AtomicBool,
    on_demand_running: AtomicBool,
    refresh_running: AtomicBool,
    discovery_completed: AtomicBool,
}

impl DiscoveryOrchestrator {
    pub fn new(parts: DiscoveryParts) -> Self {
        Self {
            parts,
            startup_running: AtomicBool::new(false),
            on_demand_running: AtomicBool::new(false),
            refresh_running: AtomicBool::new(false),
            discovery_completed: AtomicBool::new(false),
        }
    }

    /// A startup run has finished at least once
    pub fn discovery_completed(&self) -> bool {
        self.discovery_completed.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.startup_running.load(Ordering::SeqCst) || self.on_demand_running.load(Ordering::SeqCst)
    }

    /// Full startup discovery within `budget`. `None` when a run is already
    /// in progress.
    pub async fn run_startup_discovery(&self, budget: Duration) -> Option<DiscoveryReport> {
        let _guard = match FlagGuard::acquire(&self.startup_running) {
            Some(guard) => guard,
            None => {
                debug!("Startup discovery already running");
                return None;
            }
        };
        let started = Instant::now();
        let deadline = started + budget;
        let mut report = DiscoveryReport::new();
        info!("Startup discovery (budget {:?})", budget);

        self.startup_phases(deadline, &mut report).await;
        let _ = self.parts.scanner.stop().await;
        self.parts.registry.end_group_discovery();

        self.enter(DiscoveryPhase::Done, &mut report);
        report.elapsed = started.elapsed();
        self.discovery_completed.store(true, Ordering::SeqCst);
        info!(
            "Startup discovery finished in {:?}: {} device(s), {} responder(s){}",
            report.elapsed,
            report.devices_found,
            report.responders(),
            if report.deadline_hit { ", budget exhausted" } else { "" }
        );
        Some(report)
    }

    /// User-triggered discovery: membership sync and per-group windows,
    /// without the initial scan-and-wait.
    pub async fn discover_groups(&self) -> Option<DiscoveryReport> {
        let _guard = match FlagGuard::acquire(&self.on_demand_running) {
            Some(guard) => guard,
            None => {
                debug!("On-demand discovery already running");
                return None;
            }
        };
        let started = Instant::now();
        let deadline = started + self.parts.settings.budget();
        let mut report = DiscoveryReport::new();
        report.devices_found = self.parts.registry.len();

        if self.ensure_proxy(deadline, &mut report).await {
            if self.enter_checked(DiscoveryPhase::SyncMembershipFromDatabase, deadline, &mut report) {
                self.sync_from_database(deadline).await;
            }
            if self.enter_checked(DiscoveryPhase::PerGroupDiscovery, deadline, &mut report) {
                self.per_group_discovery(deadline, &mut report).await;
            }
        }
        self.parts.registry.end_group_discovery();
        self.enter(DiscoveryPhase::Done, &mut report);
        report.elapsed = started.elapsed();
        Some(report)
    }

    /// Issue one group get per known group. Returns the number sent, `None`
    /// when a refresh is already running.
    pub async fn refresh_statuses(&self) -> Option<usize> {
        let _guard = match FlagGuard::acquire(&self.refresh_running) {
            Some(guard) => guard,
            None => {
                debug!("Status refresh already running");
                return None;
            }
        };
        if !self.parts.session.is_ready() {
            debug!("Status refresh skipped: proxy not ready");
            return Some(0);
        }

        let spacing = Duration::from_millis(self.parts.settings.refresh_spacing_ms);
        let mut sent = 0;
        for (i, group) in self.discovery_groups().into_iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(spacing).await;
            }
            match self.parts.router.get_state(group).await {
                Ok(delivery) if delivery.is_sent() => sent += 1,
                Ok(delivery) => debug!("Refresh of {} not sent: {:?}", format_address(group), delivery),
                Err(e) => {
                    warn!("Status refresh aborted: {}", e);
                    break;
                }
            }
        }
        Some(sent)
    }

    // ------------------------------------------------------------------
    // Phases
    // ------------------------------------------------------------------

    async fn startup_phases(&self, deadline: Instant, report: &mut DiscoveryReport) {
        let settings = &self.parts.settings;

        if !self.enter_checked(DiscoveryPhase::ScanningForAny, deadline, report) {
            return;
        }
        if let Err(e) = self.parts.scanner.start().await {
            warn!("Scanner failed to start: {}", e);
        }
        let scan_until = earlier(Instant::now() + Duration::from_millis(settings.scan_for_any_ms), deadline);
        let poll = Duration::from_millis(settings.poll_interval_ms);
        while self.collect_advertisements(report) == 0 && Instant::now() < scan_until {
            tokio::time::sleep(poll.min(scan_until.saturating_duration_since(Instant::now()))).await;
        }

        if report.devices_found > 0 {
            if !self.enter_checked(DiscoveryPhase::BriefExtraScan, deadline, report) {
                return;
            }
            self.sleep_bounded(Duration::from_millis(settings.extra_scan_ms), deadline)
                .await;
            self.collect_advertisements(report);
        }

        if !self.enter_checked(DiscoveryPhase::StopScanning, deadline, report) {
            return;
        }
        if let Err(e) = self.parts.scanner.stop().await {
            warn!("Scanner failed to stop: {}", e);
        }

        if !self.ensure_proxy(deadline, report).await {
            return;
        }

        if !self.enter_checked(DiscoveryPhase::SyncMembershipFromDatabase, deadline, report) {
            return;
        }
        self.sync_from_database(deadline).await;

        if !self.enter_checked(DiscoveryPhase::BurstRescan, deadline, report) {
            return;
        }
        self.rescan_burst(Duration::from_millis(settings.burst_rescan_ms), deadline, report)
            .await;

        if !self.enter_checked(DiscoveryPhase::PerGroupDiscovery, deadline, report) {
            return;
        }
        self.per_group_discovery(deadline, report).await;
    }

    /// Connect a proxy unless one is already up; configures the filter
    async fn ensure_proxy(&self, deadline: Instant, report: &mut DiscoveryReport) -> bool {
        if let Some(address) = self.parts.session.connected_address() {
            if self.parts.session.is_ready() {
                report.proxy = Some(address);
                if !self.parts.filter.ensure_configured().await {
                    warn!("Proxy filter could not be reapplied");
                }
                return true;
            }
        }
        if !self.enter_checked(DiscoveryPhase::ConnectProxy, deadline, report) {
            return false;
        }
        match self.connect_candidate(deadline).await {
            Some(address) => {
                report.proxy = Some(address);
                true
            }
            None => {
                if Instant::now() >= deadline {
                    report.deadline_hit = true;
                }
                false
            }
        }
    }

    /// Connect a proxy for outbound traffic outside of a discovery run.
    /// Leaves the link alone while discovery is managing it.
    pub async fn ensure_connected(&self) -> bool {
        if self.parts.session.is_ready() {
            return true;
        }
        if self.is_running() {
            debug!("Discovery in progress, not connecting on demand");
            return false;
        }
        let proxy = &self.parts.proxy;
        let retries = proxy.connect_retries;
        let backoff_steps = retries.saturating_mul(retries.saturating_add(1)) / 2;
        let budget = proxy
            .connect_timeout()
            .saturating_mul(retries.saturating_add(1))
            .saturating_add(proxy.retry_backoff().saturating_mul(backoff_steps));
        let now = Instant::now();
        let deadline = now
            .checked_add(budget)
            .unwrap_or_else(|| now + Duration::from_secs(86_400));
        self.connect_candidate(deadline).await.is_some()
    }

    /// Pick a candidate, connect it and apply the initial filter
    async fn connect_candidate(&self, deadline: Instant) -> Option<HardwareAddress> {
        let records = self.parts.scanner.discovered();
        let candidate = match select_candidate(&records, self.parts.preferred_proxy)
            .or_else(|| self.registry_candidate())
        {
            Some(candidate) => candidate,
            None => {
                info!("No proxy candidate found");
                return None;
            }
        };

        if self.parts.scanner.is_scanning() {
            if let Err(e) = self.parts.scanner.stop().await {
                warn!("Scanner failed to stop before connecting: {}", e);
            }
        }

        let proxy = &self.parts.proxy;
        self.parts.registry.set_link(&candidate, LinkStatus::Connecting);
        let connected = self
            .parts
            .session
            .connect_before(candidate, proxy.connect_timeout(), proxy.connect_retries, deadline)
            .await;

        if !connected {
            warn!("Proxy {} could not be connected", candidate);
            self.parts.registry.set_link(&candidate, LinkStatus::Absent);
            return None;
        }
        self.parts.registry.set_link(&candidate, LinkStatus::Ready);

        let groups = self.filter_groups();
        if !self.parts.filter.configure(&groups, true).await {
            warn!("Initial proxy filter could not be applied");
        }
        Some(candidate)
    }

    fn registry_candidate(&self) -> Option<HardwareAddress> {
        let devices = self.parts.registry.devices();
        devices
            .iter()
            .find(|d| d.proxy_capable && d.hardware.is_some())
            .or_else(|| devices.iter().find(|d| d.hardware.is_some()))
            .and_then(|d| d.hardware)
    }

    async fn sync_from_database(&self, deadline: Instant) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, self.parts.database.node_subscriptions()).await {
            Ok(Ok(nodes)) => {
                sync_membership(&self.parts.registry, &nodes);
                let groups = self.filter_groups();
                if !self.parts.filter.configure(&groups, true).await {
                    warn!("Proxy filter update after membership sync failed");
                }
            }
            Ok(Err(e)) => warn!("Membership database unavailable: {}", e),
            Err(_) => warn!("Membership database query ran past the deadline"),
        }
    }

    /// Scan for `length`, then mark devices that stayed quiet as absent
    async fn rescan_burst(&self, length: Duration, deadline: Instant, report: &mut DiscoveryReport) {
        let started = Instant::now();
        if let Err(e) = self.parts.scanner.start().await {
            debug!("Rescan burst skipped: {}", e);
            return;
        }
        self.sleep_bounded(length, deadline).await;
        self.collect_advertisements(report);
        if let Err(e) = self.parts.scanner.stop().await {
            warn!("Scanner failed to stop after burst: {}", e);
        }

        let records = self.parts.scanner.discovered();
        if records.iter().any(|r| r.last_seen.is_none()) {
            return;
        }
        let seen: Vec<HardwareAddress> = records
            .iter()
            .filter(|r| r.last_seen.map_or(false, |heard| heard >= started))
            .map(|r| r.address)
            .collect();
        self.parts.registry.mark_absent_except(&seen);
    }

    async fn per_group_discovery(&self, deadline: Instant, report: &mut DiscoveryReport) {
        let groups = self.discovery_groups();
        let window = Duration::from_millis(self.parts.settings.group_window_ms);
        let rescan = Duration::from_millis(self.parts.settings.inter_group_rescan_ms);

        for (i, group) in groups.iter().copied().enumerate() {
            if Instant::now() >= deadline {
                report.deadline_hit = true;
                info!("Discovery budget exhausted before group {}", format_address(group));
                return;
            }
            if i > 0 && groups.len() > 1 {
                self.rescan_burst(rescan, deadline, report).await;
            }

            let length = window.min(deadline.saturating_duration_since(Instant::now()));
            if length.is_zero() {
                report.deadline_hit = true;
                return;
            }
            self.parts
                .registry
                .begin_group_discovery(group, Instant::now() + length);
            self.parts.filter.include(&[group]).await;

            let pending = self.parts.windows.open(WindowRequest::new(Vec::new(), length));
            match self.parts.router.get_state(group).await {
                Ok(delivery) if delivery.is_sent() => {}
                Ok(delivery) => {
                    debug!("Group get for {} not sent: {:?}", format_address(group), delivery)
                }
                Err(e) => {
                    warn!("Group discovery aborted: {}", e);
                    self.parts.registry.end_group_discovery();
                    return;
                }
            }
            let outcome = pending.resolve().await;
            self.parts.registry.end_group_discovery();

            let mut responders: Vec<u16> = outcome.responded.into_iter().collect();
            responders.sort_unstable();
            for unicast in &responders {
                self.parts.registry.confirm_member(group, *unicast);
            }
            info!(
                "Group {}: {} responder(s)",
                format_address(group),
                responders.len()
            );
            report.groups.push(GroupReport { group, responders });
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    /// Default group first, then every known or configured group
    fn discovery_groups(&self) -> Vec<u16> {
        let mut groups = self.filter_groups();
        groups.retain(|g| *g != DEFAULT_GROUP);
        groups.sort_unstable();
        groups.dedup();
        groups.insert(0, DEFAULT_GROUP);
        groups
    }

    fn filter_groups(&self) -> Vec<u16> {
        let mut groups = self.parts.registry.group_ids();
        groups.extend(self.parts.groups.iter().copied());
        groups.sort_unstable();
        groups.dedup();
        groups
    }

    fn collect_advertisements(&self, report: &mut DiscoveryReport) -> usize {
        let records = self.parts.scanner.discovered();
        for record in &records {
            self.parts.registry.upsert_advertisement(record);
        }
        report.devices_found = report.devices_found.max(records.len());
        records.len()
    }

    async fn sleep_bounded(&self, length: Duration, deadline: Instant) {
        tokio::time::sleep_until(earlier(Instant::now() + length, deadline)).await;
    }

    fn enter(&self, phase: DiscoveryPhase, report: &mut DiscoveryReport) {
        debug!("Discovery phase: {}", phase);
        report.phase = phase;
        self.parts.events.publish(CoreEvent::DiscoveryPhase(phase));
    }

    /// Enter `phase` unless the deadline has passed
    fn enter_checked(
        &self,
        phase: DiscoveryPhase,
        deadline: Instant,
        report: &mut DiscoveryReport,
    ) -> bool {
        if Instant::now() >= deadline {
            info!("Discovery budget exhausted before {}", phase);
            report.deadline_hit = true;
            return false;
        }
        self.enter(phase, report);
        true
    }
}

fn earlier(a: Instant, b: Instant) -> Instant {
    if a < b {
        a
    } else {
        b
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::{sig_uuid, MESH_PROXY_SERVICE};

    fn record(last: u8, proxy: bool) -> AdvertisementRecord {
        let mut r = AdvertisementRecord::new(HardwareAddress::new([1, 2, 3, 4, 0, last]), -60);
        if proxy {
            r.service_uuids.push(sig_uuid(MESH_PROXY_SERVICE));
        }
        r
    }

    #[test]
    fn test_candidate_prefers_proxy_capable() {
        let records = vec![record(1, false), record(2, true), record(3, true)];
        assert_eq!(select_candidate(&records, None), Some(records[1].address));
    }

    #[test]
    fn test_candidate_falls_back_to_first() {
        let records = vec![record(1, false), record(2, false)];
        assert_eq!(select_candidate(&records, None), Some(records[0].address));
        assert_eq!(select_candidate(&[], None), None);
    }

    #[test]
    fn test_preferred_proxy_wins() {
        let preferred = HardwareAddress::new([9; 6]);
        assert_eq!(
            select_candidate(&[record(2, true)], Some(preferred)),
            Some(preferred)
        );
    }

    #[test]
    fn test_flag_guard_is_single_flight() {
        let flag = AtomicBool::new(false);
        let guard = FlagGuard::acquire(&flag).expect("first");
        assert!(FlagGuard::acquire(&flag).is_none());
        drop(guard);
        assert!(FlagGuard::acquire(&flag).is_some());
    }
}
