//! Core event channel
//!
//! Everything the core reports outward flows through one typed broadcast
//! channel. Status windows, the device model and the surrounding application
//! all subscribe to the same feed.

use crate::address::HardwareAddress;
use crate::discovery::DiscoveryPhase;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Default capacity of the broadcast channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// An on/off status report from a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusEvent {
    /// Unicast address of the reporting element
    pub source: u16,
    /// Present on/off state
    pub state: bool,
    /// Target state while a transition is in progress
    pub target_state: Option<bool>,
    /// Arrival time
    pub at: Instant,
}

impl StatusEvent {
    pub fn new(source: u16, state: bool, target_state: Option<bool>) -> Self {
        Self {
            source,
            state,
            target_state,
            at: Instant::now(),
        }
    }
}

/// Events published by the core
#[derive(Debug, Clone)]
pub enum CoreEvent {
    /// A device reported its on/off state
    Status(StatusEvent),
    /// The proxy link is up and usable
    ProxyReady { address: HardwareAddress },
    /// The proxy link failed or dropped without being asked to
    ProxyFailed { reason: String },
    /// The proxy link was closed on request
    ProxyDisconnected,
    /// A new accept list was written to the proxy
    FilterApplied { addresses: Vec<u16> },
    /// Discovery entered a phase
    DiscoveryPhase(DiscoveryPhase),
    /// Sends are going through direct GATT control
    FallbackEngaged,
}

/// Sender side of the core event channel
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_CHANNEL_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event; having no subscribers is not an error
    pub fn publish(&self, event: CoreEvent) {
        if self.sender.send(event).is_err() {
            debug!("Core event dropped: no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.sender.subscribe()
    }
}

/// Callback interface for the surrounding application
pub trait MeshDelegate: Send + Sync {
    /// A device reported its state
    fn on_device_status(&self, unicast_address: u16, state: bool, target_state: Option<bool>);
    /// The proxy link is ready for traffic
    fn on_proxy_ready(&self);
    /// The proxy link failed
    fn on_proxy_failed(&self);
}

/// Forward the event channel to a single delegate until the channel closes
pub fn spawn_delegate_bridge(bus: &EventBus, delegate: Arc<dyn MeshDelegate>) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(CoreEvent::Status(ev)) => {
                    delegate.on_device_status(ev.source, ev.state, ev.target_state)
                }
                Ok(CoreEvent::ProxyReady { .. }) => delegate.on_proxy_ready(),
                Ok(CoreEvent::ProxyFailed { .. }) => delegate.on_proxy_failed(),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!("Delegate bridge lagged by {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
