//! Proxy session
//!
//! Owns the single bridge connection to a proxy node. Outbound PDUs are
//! segmented to the negotiated transfer size; inbound frames are reassembled
//! and handed to the router through an unbounded channel.
//!
//! State machine: `Disconnected -> Connecting -> Ready -> Disconnected`.
//! Reconnection is always the caller's decision.

use crate::address::HardwareAddress;
use crate::config::ProxySettings;
use crate::events::{CoreEvent, EventBus};
use crate::proxy::bearer::{BearerError, BearerEvent, BearerLink, ProxyBearer};
use crate::proxy::pdu::{segment, ProxyPdu, ProxyPduType, Reassembler, SarError};
use crate::sequence::LinkHealth;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Ready,
}

/// Errors from session sends
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session is not ready")]
    NotReady,
    #[error("Segmentation failed: {0}")]
    Sar(#[from] SarError),
    #[error("Bearer error: {0}")]
    Bearer(#[from] BearerError),
}

#[derive(Debug, Clone, Copy)]
struct LinkInfo {
    address: HardwareAddress,
    max_transfer_size: usize,
}

struct SessionInner {
    bearer: Arc<dyn ProxyBearer>,
    settings: ProxySettings,
    events: EventBus,
    link_health: Arc<LinkHealth>,
    inbound: mpsc::UnboundedSender<ProxyPdu>,
    state: Mutex<SessionState>,
    link: Mutex<Option<LinkInfo>>,
    generation: AtomicU64,
    connect_gate: Arc<tokio::sync::Mutex<()>>,
    write_gate: tokio::sync::Mutex<()>,
    reader: Mutex<Option<JoinHandle<()>>>,
    frames_sent: AtomicU64,
}

impl SessionInner {
    fn set_state(&self, state: SessionState) {
        let mut current = self.state.lock();
        if *current != state {
            debug!("Proxy session {:?} -> {:?}", *current, state);
            *current = state;
        }
    }

    /// Tear down after the bearer dropped on its own. Ignored when the link
    /// generation has already moved on.
    fn handle_link_loss(&self, generation: u64, reason: String) {
        if self
            .generation
            .compare_exchange(
                generation,
                generation + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            debug!("Stale link loss notification ignored");
            return;
        }
        *self.link.lock() = None;
        self.set_state(SessionState::Disconnected);
        warn!("Proxy link lost: {}", reason);
        self.events.publish(CoreEvent::ProxyFailed { reason });
    }
}

/// Returns the session to `Disconnected` and closes the bearer when a
/// connect future is dropped mid-attempt.
/// The connect gate stays held until that close has run.
struct ConnectGuard {
    inner: Option<Arc<SessionInner>>,
    gate: Option<OwnedMutexGuard<()>>,
}

impl ConnectGuard {
    fn arm(inner: &Arc<SessionInner>, gate: OwnedMutexGuard<()>) -> Self {
        Self {
            inner: Some(Arc::clone(inner)),
            gate: Some(gate),
        }
    }

    fn disarm(&mut self) {
        self.inner = None;
    }
}

impl Drop for ConnectGuard {
    fn drop(&mut self) {
        let (Some(inner), Some(gate)) = (self.inner.take(), self.gate.take()) else {
            return;
        };
        warn!("Proxy connect abandoned, closing bearer");
        inner.set_state(SessionState::Disconnected);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                inner.bearer.close().await;
                drop(gate);
            });
        }
    }
}

/// The single bridge connection into the mesh
#[derive(Clone)]
pub struct ProxySession {
    inner: Arc<SessionInner>,
}

impl ProxySession {
    /// Create a disconnected session. Reassembled inbound PDUs are sent to
    /// `inbound`.
    pub fn new(
        bearer: Arc<dyn ProxyBearer>,
        settings: ProxySettings,
        events: EventBus,
        link_health: Arc<LinkHealth>,
        inbound: mpsc::UnboundedSender<ProxyPdu>,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                bearer,
                settings,
                events,
                link_health,
                inbound,
                state: Mutex::new(SessionState::Disconnected),
                link: Mutex::new(None),
                generation: AtomicU64::new(0),
                connect_gate: Arc::new(tokio::sync::Mutex::new(())),
                write_gate: tokio::sync::Mutex::new(()),
                reader: Mutex::new(None),
                frames_sent: AtomicU64::new(0),
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.lock()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    /// Bumped on every connect and every disconnect; anything configured
    /// against an older generation is stale.
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// True when the host bearer can be used at all
    pub fn bearer_available(&self) -> bool {
        self.inner.bearer.is_available()
    }

    pub fn connected_address(&self) -> Option<HardwareAddress> {
        self.inner.link.lock().map(|l| l.address)
    }

    pub fn max_transfer_size(&self) -> Option<usize> {
        self.inner.link.lock().map(|l| l.max_transfer_size)
    }

    /// Frames written since the session was created
    pub fn frames_sent(&self) -> u64 {
        self.inner.frames_sent.load(Ordering::Relaxed)
    }

    /// Connect to `address`, retrying with linear backoff.
    ///
    /// Returns false on ordinary failure; only one attempt is ever in
    /// flight, concurrent callers wait for it.
    pub async fn connect(&self, address: HardwareAddress, timeout: Duration, retries: u32) -> bool {
        self.connect_inner(address, timeout, retries, None).await
    }

    /// Like [`connect`](Self::connect), but every attempt and backoff is
    /// capped so the call returns by `deadline`.
    pub async fn connect_before(
        &self,
        address: HardwareAddress,
        timeout: Duration,
        retries: u32,
        deadline: Instant,
    ) -> bool {
        self.connect_inner(address, timeout, retries, Some(deadline))
            .await
    }

    async fn connect_inner(
        &self,
        address: HardwareAddress,
        timeout: Duration,
        retries: u32,
        deadline: Option<Instant>,
    ) -> bool {
        let gate = Arc::clone(&self.inner.connect_gate).lock_owned().await;

        if let Some(current) = self.connected_address() {
            if current == address && self.is_ready() {
                debug!("Proxy {} already connected", address);
                return true;
            }
            self.disconnect().await;
        }

        if !self.inner.bearer.is_available() {
            warn!("Proxy bearer unavailable, not connecting to {}", address);
            self.inner.events.publish(CoreEvent::ProxyFailed {
                reason: BearerError::Unavailable.to_string(),
            });
            return false;
        }

        self.inner.set_state(SessionState::Connecting);
        let mut guard = ConnectGuard::arm(&self.inner, gate);
        let remaining = |now: Instant| match deadline {
            Some(deadline) => deadline.saturating_duration_since(now),
            None => Duration::MAX,
        };
        let mut last_error = String::from("no attempt made");

        for attempt in 0..=retries {
            if attempt > 0 {
                let backoff = self.inner.settings.retry_backoff() * attempt;
                if backoff >= remaining(Instant::now()) {
                    last_error = "connect deadline reached".to_string();
                    break;
                }
                debug!("Proxy connect retry {} in {:?}", attempt, backoff);
                tokio::time::sleep(backoff).await;
            }

            let attempt_timeout = timeout.min(remaining(Instant::now()));
            if attempt_timeout.is_zero() {
                last_error = "connect deadline reached".to_string();
                break;
            }
            match tokio::time::timeout(attempt_timeout, self.inner.bearer.open(address, attempt_timeout))
                .await
            {
                Ok(Ok(link)) => {
                    if link.max_transfer_size < self.inner.settings.min_transfer_size {
                        last_error = format!(
                            "transfer size {} below minimum {}",
                            link.max_transfer_size, self.inner.settings.min_transfer_size
                        );
                        warn!("Proxy {} rejected: {}", address, last_error);
                        self.inner.bearer.close().await;
                        continue;
                    }
                    guard.disarm();
                    self.activate(address, link);
                    return true;
                }
                Ok(Err(e)) => {
                    warn!("Proxy connect attempt {} to {} failed: {}", attempt + 1, address, e);
                    last_error = e.to_string();
                    if e == BearerError::Unavailable {
                        break;
                    }
                }
                Err(_) => {
                    warn!("Proxy connect attempt {} to {} timed out", attempt + 1, address);
                    last_error = BearerError::Timeout.to_string();
                    self.inner.bearer.close().await;
                }
            }
        }

        guard.disarm();
        self.inner.set_state(SessionState::Disconnected);
        self.inner.events.publish(CoreEvent::ProxyFailed { reason: last_error });
        false
    }

    fn activate(&self, address: HardwareAddress, link: BearerLink) {
        let BearerLink {
            max_transfer_size,
            events,
        } = link;
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.link_health.reset();
        *self.inner.link.lock() = Some(LinkInfo {
            address,
            max_transfer_size,
        });
        self.inner.set_state(SessionState::Ready);

        let reader = tokio::spawn(Self::read_loop(
            Arc::clone(&self.inner),
            events,
            generation,
        ));
        if let Some(previous) = self.inner.reader.lock().replace(reader) {
            previous.abort();
        }

        info!(
            "Proxy {} ready (transfer size {})",
            address, max_transfer_size
        );
        self.inner.events.publish(CoreEvent::ProxyReady { address });
    }

    async fn read_loop(
        inner: Arc<SessionInner>,
        mut events: mpsc::UnboundedReceiver<BearerEvent>,
        generation: u64,
    ) {
        let mut reassembler = Reassembler::new();
        let reason = loop {
            match events.recv().await {
                Some(BearerEvent::Frame(frame)) => {
                    inner.link_health.note_inbound();
                    match reassembler.push(&frame) {
                        Ok(Some(pdu)) => {
                            if inner.inbound.send(pdu).is_err() {
                                debug!("Inbound consumer gone, dropping PDU");
                            }
                        }
                        Ok(None) => {}
                        Err(e) => warn!("Proxy protocol error, partial PDU discarded: {}", e),
                    }
                }
                Some(BearerEvent::Disconnected { reason }) => break reason,
                None => break "bearer event stream closed".to_string(),
            }
        };
        inner.handle_link_loss(generation, reason);
    }

    /// Send a PDU; frames of one PDU are written back to back.
    pub async fn try_send(&self, pdu_type: ProxyPduType, payload: &[u8]) -> Result<(), SessionError> {
        let max_transfer_size = match (self.state(), self.max_transfer_size()) {
            (SessionState::Ready, Some(size)) => size,
            _ => return Err(SessionError::NotReady),
        };
        let frames = segment(pdu_type, payload, max_transfer_size)?;

        let _gate = self.inner.write_gate.lock().await;
        for frame in &frames {
            self.inner.bearer.write(frame).await?;
            self.inner.frames_sent.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Send a PDU, absorbing failures into a boolean
    pub async fn send(&self, pdu_type: ProxyPduType, payload: &[u8]) -> bool {
        match self.try_send(pdu_type, payload).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Proxy send of {} bytes failed: {}", payload.len(), e);
                false
            }
        }
    }

    /// Release the bearer. Invalidates anything configured on this link.
    pub async fn disconnect(&self) {
        if let Some(reader) = self.inner.reader.lock().take() {
            reader.abort();
        }
        let was_connected = self.inner.link.lock().take().is_some();
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        if was_connected {
            self.inner.bearer.close().await;
            info!("Proxy disconnected");
            self.inner.events.publish(CoreEvent::ProxyDisconnected);
        }
        self.inner.set_state(SessionState::Disconnected);
    }
}
