// Meshlight Core: proxy-side engine for BLE mesh lighting
//
// One process, one local identity, one proxy link at a time. Everything a
// lighting app needs between "user taps a switch" and "lamps report back"
// lives here; the radio itself is behind platform traits.

pub mod address;
pub mod config;
pub mod discovery;
pub mod events;
pub mod message;
pub mod model;
pub mod proxy;
pub mod scan;
pub mod sequence;
pub mod simulator;
pub mod status;
pub mod store;
pub mod transport;

use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use address::{HardwareAddress, DEFAULT_GROUP};
pub use config::{ConfigError, KeyMaterial, MeshConfig};
pub use discovery::{DiscoveryOrchestrator, DiscoveryPhase, DiscoveryReport, MeshDatabase};
pub use events::{CoreEvent, EventBus, MeshDelegate, StatusEvent};
pub use message::{ClearCodec, Delivery, MeshCodec, MessageRouter};
pub use model::{Device, DeviceRegistry, Group};
pub use proxy::{FilterManager, ProxyBearer, ProxySession};
pub use scan::{AdvertisementRecord, AdvertisementScanner};
pub use sequence::SequenceAuthority;
pub use simulator::{Scenario, SimulatedMesh};
pub use status::{CompletionPolicy, StatusWindows, WindowRequest};
pub use store::{MemoryStorage, SledStorage, StorageBackend};
pub use transport::{GattFallbackController, GattLink, ProxyTransport};

use discovery::{DiscoveryParts, StaticDatabase};
use message::RouterParts;
use message::EchoFilter;
use sequence::{LinkHealth, ReplayRepair, SequenceError};
use transport::Transport;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MeshError {
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Missing collaborator: {0}")]
    MissingCollaborator(&'static str),
    #[error("Already running")]
    AlreadyRunning,
}

impl From<ConfigError> for MeshError {
    fn from(err: ConfigError) -> Self {
        MeshError::Configuration(err.to_string())
    }
}

impl From<SequenceError> for MeshError {
    fn from(err: SequenceError) -> Self {
        MeshError::Storage(err.to_string())
    }
}

impl From<store::StorageError> for MeshError {
    fn from(err: store::StorageError) -> Self {
        MeshError::Storage(err.to_string())
    }
}

impl From<message::CodecError> for MeshError {
    fn from(err: message::CodecError) -> Self {
        MeshError::Configuration(err.to_string())
    }
}

// ============================================================================
// TRIGGER
// ============================================================================

/// Result of a user-triggered action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// Every expected device completed
    Success { responders: usize },
    /// The window ended with only some devices completed. `expected` is zero
    /// when the targets were unknown.
    Partial { responders: usize, expected: usize },
    /// Nothing could carry the message
    TransportUnavailable,
}

impl TriggerOutcome {
    pub fn responders(&self) -> usize {
        match self {
            TriggerOutcome::Success { responders } | TriggerOutcome::Partial { responders, .. } => {
                *responders
            }
            TriggerOutcome::TransportUnavailable => 0,
        }
    }
}

/// Overrides for one trigger
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriggerOptions {
    pub timeout: Option<Duration>,
    pub policy: Option<CompletionPolicy>,
}

// ============================================================================
// BUILDER
// ============================================================================

/// Assembles a [`MeshCore`] from configuration and platform collaborators
pub struct MeshCoreBuilder {
    config: MeshConfig,
    bearer: Option<Arc<dyn ProxyBearer>>,
    scanner: Option<Arc<dyn AdvertisementScanner>>,
    database: Option<Arc<dyn MeshDatabase>>,
    gatt: Option<Arc<dyn GattLink>>,
    codec: Option<Arc<dyn MeshCodec>>,
    storage: Option<Arc<dyn StorageBackend>>,
    events: EventBus,
}

impl MeshCoreBuilder {
    pub fn new(config: MeshConfig) -> Self {
        Self {
            config,
            bearer: None,
            scanner: None,
            database: None,
            gatt: None,
            codec: None,
            storage: None,
            events: EventBus::default(),
        }
    }

    pub fn bearer(mut self, bearer: Arc<dyn ProxyBearer>) -> Self {
        self.bearer = Some(bearer);
        self
    }

    pub fn scanner(mut self, scanner: Arc<dyn AdvertisementScanner>) -> Self {
        self.scanner = Some(scanner);
        self
    }

    pub fn database(mut self, database: Arc<dyn MeshDatabase>) -> Self {
        self.database = Some(database);
        self
    }

    /// Enables direct GATT control while the proxy bearer is unavailable
    pub fn gatt(mut self, gatt: Arc<dyn GattLink>) -> Self {
        self.gatt = Some(gatt);
        self
    }

    pub fn codec(mut self, codec: Arc<dyn MeshCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    pub fn storage(mut self, storage: Arc<dyn StorageBackend>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Persist sequence state in a sled database at `path`
    pub fn storage_path(self, path: impl AsRef<Path>) -> Result<Self, MeshError> {
        let storage = SledStorage::open(path)?;
        Ok(self.storage(Arc::new(storage)))
    }

    pub fn events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Every simulated collaborator at once
    pub fn simulated(self, mesh: &SimulatedMesh) -> Self {
        self.bearer(Arc::new(mesh.clone()))
            .scanner(Arc::new(mesh.clone()))
            .database(Arc::new(mesh.clone()))
            .gatt(Arc::new(mesh.clone()))
    }

    /// Validate the configuration and wire everything up. Must be called
    /// inside a Tokio runtime.
    pub fn build(self) -> Result<MeshCore, MeshError> {
        let config = self.config;
        config.validate()?;
        let identity = config.identity()?;
        let bearer = self.bearer.ok_or(MeshError::MissingCollaborator("proxy bearer"))?;
        let scanner = self
            .scanner
            .ok_or(MeshError::MissingCollaborator("advertisement scanner"))?;
        let database = self
            .database
            .unwrap_or_else(|| Arc::new(StaticDatabase::default()));
        let codec = match self.codec {
            Some(codec) => codec,
            None => Arc::new(ClearCodec::new(&config.keys)?) as Arc<dyn MeshCodec>,
        };
        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(MemoryStorage::new()));
        let events = self.events;

        let sequence = SequenceAuthority::load(
            storage,
            &config.network_id,
            identity,
            config.sequence.persist_interval(),
        )?;
        let start = sequence.apply_startup_watermark(
            config.sequence.startup_watermark,
            config.sequence.watermark_jitter,
        );
        info!(
            "Mesh core for 0x{:04X} on '{}', sequence starts at {}",
            identity, config.network_id, start
        );

        let link_health = Arc::new(LinkHealth::new());
        let echo = Arc::new(EchoFilter::new(config.router.echo_window()));
        let registry = DeviceRegistry::new();
        let windows = StatusWindows::new(events.clone());

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let session = ProxySession::new(
            bearer,
            config.proxy.clone(),
            events.clone(),
            Arc::clone(&link_health),
            inbound_tx,
        );
        let filter = FilterManager::new(
            session.clone(),
            Arc::clone(&codec),
            sequence.clone(),
            identity,
            events.clone(),
        );

        let primary: Arc<dyn Transport> = Arc::new(ProxyTransport::new(
            session.clone(),
            filter.clone(),
            Arc::clone(&codec),
            Arc::clone(&echo),
        ));
        let fallback = self.gatt.map(|link| {
            Arc::new(GattFallbackController::new(
                link,
                registry.clone(),
                config.fallback.clone(),
            )) as Arc<dyn Transport>
        });

        let router = MessageRouter::new(RouterParts {
            identity,
            settings: config.router.clone(),
            sequence: sequence.clone(),
            codec,
            primary,
            fallback,
            filter: Some(filter.clone()),
            echo,
            link_health,
            repair: ReplayRepair::new(config.repair.clone()),
            events: events.clone(),
        });

        let discovery = Arc::new(DiscoveryOrchestrator::new(DiscoveryParts {
            settings: config.discovery.clone(),
            proxy: config.proxy.clone(),
            preferred_proxy: config.preferred_proxy,
            groups: config.groups.clone(),
            scanner,
            database,
            session: session.clone(),
            filter: filter.clone(),
            router: router.clone(),
            registry: registry.clone(),
            windows: windows.clone(),
            events: events.clone(),
        }));

        let tasks = vec![
            spawn_inbound_pump(inbound_rx, router.clone()),
            spawn_model_pump(
                events.subscribe(),
                registry.clone(),
                filter.clone(),
                sequence.clone(),
                session.clone(),
            ),
        ];

        Ok(MeshCore {
            config,
            events,
            registry,
            sequence,
            session,
            filter,
            router,
            windows,
            discovery,
            tasks: Arc::new(Mutex::new(tasks)),
        })
    }
}

fn spawn_inbound_pump(
    mut inbound: mpsc::UnboundedReceiver<proxy::ProxyPdu>,
    router: MessageRouter,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(pdu) = inbound.recv().await {
            router.handle_inbound(pdu).await;
        }
        debug!("Inbound pump finished");
    })
}

/// Keeps the device model and per-session state in step with core events
fn spawn_model_pump(
    mut events: broadcast::Receiver<CoreEvent>,
    registry: DeviceRegistry,
    filter: FilterManager,
    sequence: SequenceAuthority,
    session: ProxySession,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut proxy: Option<HardwareAddress> = None;
        loop {
            match events.recv().await {
                Ok(CoreEvent::Status(status)) => registry.apply_status(&status),
                Ok(CoreEvent::ProxyReady { address }) => {
                    proxy = Some(address);
                    registry.set_link(&address, model::LinkStatus::Ready);
                }
                Ok(CoreEvent::ProxyFailed { .. }) | Ok(CoreEvent::ProxyDisconnected) => {
                    if session.is_ready() {
                        continue;
                    }
                    if let Some(address) = proxy.take() {
                        registry.set_link(&address, model::LinkStatus::Absent);
                    }
                    filter.reset().await;
                    if let Err(e) = sequence.flush() {
                        warn!("Sequence flush after link loss failed: {}", e);
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Model pump lagged by {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

// ============================================================================
// CORE
// ============================================================================

/// One mesh session: proxy link, routing, discovery and device model
#[derive(Clone)]
pub struct MeshCore {
    config: MeshConfig,
    events: EventBus,
    registry: DeviceRegistry,
    sequence: SequenceAuthority,
    session: ProxySession,
    filter: FilterManager,
    router: MessageRouter,
    windows: StatusWindows,
    discovery: Arc<DiscoveryOrchestrator>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl MeshCore {
    pub fn builder(config: MeshConfig) -> MeshCoreBuilder {
        MeshCoreBuilder::new(config)
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn identity(&self) -> u16 {
        self.router.identity()
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn session(&self) -> &ProxySession {
        &self.session
    }

    pub fn filter(&self) -> &FilterManager {
        &self.filter
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    pub fn sequence(&self) -> &SequenceAuthority {
        &self.sequence
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Forward events to a callback object
    pub fn set_delegate(&self, delegate: Arc<dyn MeshDelegate>) {
        let handle = events::spawn_delegate_bridge(&self.events, delegate);
        self.tasks.lock().push(handle);
    }

    // ------------------------------------------------------------------------
    // CONTROL
    // ------------------------------------------------------------------------

    pub async fn set_state(
        &self,
        destination: u16,
        on: bool,
        acknowledged: Option<bool>,
    ) -> Result<Delivery, MeshError> {
        self.connect_if_needed().await;
        self.router.set_state(destination, on, acknowledged).await
    }

    pub async fn get_state(&self, destination: u16) -> Result<Delivery, MeshError> {
        self.connect_if_needed().await;
        self.router.get_state(destination).await
    }

    /// Switch `destination` and watch for the devices to report back.
    ///
    /// The exclusive status window opens before the message leaves, so early
    /// statuses are never missed, and a newer trigger supersedes this one.
    pub async fn trigger(
        &self,
        destination: u16,
        on: bool,
        options: TriggerOptions,
    ) -> Result<TriggerOutcome, MeshError> {
        let targets = self.expected_responders(destination);
        let timeout = options
            .timeout
            .unwrap_or_else(|| Duration::from_millis(self.config.trigger.timeout_ms));
        let policy = options
            .policy
            .unwrap_or(self.config.trigger.completion_policy);
        let expected = targets.len();

        self.connect_if_needed().await;
        let pending = self.windows.open(
            WindowRequest::new(targets, timeout)
                .policy(policy)
                .exclusive()
                .abort_on_link_loss(),
        );
        let delivery = self.router.set_state(destination, on, None).await?;
        if !delivery.is_sent() {
            info!(
                "Trigger of {} not delivered: {:?}",
                address::format_address(destination),
                delivery
            );
            return Ok(TriggerOutcome::TransportUnavailable);
        }

        let outcome = pending.resolve().await;
        let responders = outcome.responded.len();
        debug!(
            "Trigger of {} ended {:?} with {} responder(s)",
            address::format_address(destination),
            outcome.ended,
            responders
        );
        if outcome.completed_all && expected > 0 {
            Ok(TriggerOutcome::Success { responders })
        } else {
            Ok(TriggerOutcome::Partial {
                responders,
                expected,
            })
        }
    }

    fn expected_responders(&self, destination: u16) -> Vec<u16> {
        if address::is_group(destination) {
            let mut members = self.registry.confirmed_members(destination);
            if members.is_empty() {
                members = self
                    .registry
                    .members_of(destination)
                    .into_iter()
                    .map(|d| d.unicast)
                    .collect();
                members.dedup();
            }
            members
        } else {
            vec![destination]
        }
    }

    async fn connect_if_needed(&self) {
        if self.session.is_ready() || !self.session.bearer_available() {
            return;
        }
        if !self.discovery.ensure_connected().await {
            debug!("No proxy link for outbound traffic");
        }
    }

    // ------------------------------------------------------------------------
    // DISCOVERY
    // ------------------------------------------------------------------------

    /// Startup discovery within `budget` (configured budget if `None`)
    pub async fn run_startup_discovery(
        &self,
        budget: Option<Duration>,
    ) -> Result<DiscoveryReport, MeshError> {
        let budget = budget.unwrap_or_else(|| self.config.discovery.budget());
        self.discovery
            .run_startup_discovery(budget)
            .await
            .ok_or(MeshError::AlreadyRunning)
    }

    pub async fn discover_groups(&self) -> Result<DiscoveryReport, MeshError> {
        self.discovery
            .discover_groups()
            .await
            .ok_or(MeshError::AlreadyRunning)
    }

    pub async fn refresh_statuses(&self) -> Result<usize, MeshError> {
        self.discovery
            .refresh_statuses()
            .await
            .ok_or(MeshError::AlreadyRunning)
    }

    pub fn discovery_completed(&self) -> bool {
        self.discovery.discovery_completed()
    }

    // ------------------------------------------------------------------------
    // LIFECYCLE
    // ------------------------------------------------------------------------

    /// Flush sequence state, close the proxy link and stop background tasks
    pub async fn shutdown(&self) -> Result<(), MeshError> {
        info!("Mesh core shutting down");
        self.session.disconnect().await;
        self.filter.reset().await;
        let flushed = self.sequence.flush();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        flushed?;
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
