//! Proxy filter management
//!
//! Keeps the proxy's accept list equal to the addresses we care about. The
//! applied set is tied to a session generation, so any disconnect leaves the
//! filter unconfigured and the next send reconfigures it.

use crate::address::{format_address, DEFAULT_GROUP};
use crate::events::{CoreEvent, EventBus};
use crate::message::{FilterType, MeshCodec, ProxyConfigMessage};
use crate::proxy::pdu::ProxyPduType;
use crate::proxy::session::ProxySession;
use crate::sequence::SequenceAuthority;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Last state written to the proxy
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterState {
    pub applied: HashSet<u16>,
    pub configured: bool,
    /// Session generation the filter was applied on
    pub generation: u64,
    /// List size reported by the last Filter Status
    pub last_list_size: Option<u16>,
}

#[derive(Debug, Clone, Default)]
struct Interest {
    addresses: HashSet<u16>,
    include_default: bool,
}

struct FilterInner {
    session: ProxySession,
    codec: Arc<dyn MeshCodec>,
    sequence: SequenceAuthority,
    identity: u16,
    events: EventBus,
    state: tokio::sync::Mutex<FilterState>,
    interest: parking_lot::Mutex<Interest>,
    writes: AtomicU64,
}

/// Accept-list manager for the proxy session
#[derive(Clone)]
pub struct FilterManager {
    inner: Arc<FilterInner>,
}

impl FilterManager {
    pub fn new(
        session: ProxySession,
        codec: Arc<dyn MeshCodec>,
        sequence: SequenceAuthority,
        identity: u16,
        events: EventBus,
    ) -> Self {
        Self {
            inner: Arc::new(FilterInner {
                session,
                codec,
                sequence,
                identity,
                events,
                state: tokio::sync::Mutex::new(FilterState::default()),
                interest: parking_lot::Mutex::new(Interest {
                    addresses: HashSet::new(),
                    include_default: true,
                }),
                writes: AtomicU64::new(0),
            }),
        }
    }

    /// Accept list for the given interest: identity, optional default group,
    /// then `addresses`.
    pub fn desired_set(&self, addresses: &[u16], include_default: bool) -> HashSet<u16> {
        let mut desired: HashSet<u16> = addresses.iter().copied().collect();
        desired.insert(self.inner.identity);
        if include_default {
            desired.insert(DEFAULT_GROUP);
        }
        desired
    }

    /// Configuration messages written since creation
    pub fn writes(&self) -> u64 {
        self.inner.writes.load(Ordering::Relaxed)
    }

    /// Snapshot of the filter state
    pub async fn state(&self) -> FilterState {
        self.inner.state.lock().await.clone()
    }

    /// True when the applied list belongs to the live session
    pub async fn is_configured(&self) -> bool {
        let state = self.inner.state.lock().await;
        state.configured
            && state.generation == self.inner.session.generation()
            && self.inner.session.is_ready()
    }

    /// Bring the proxy's accept list to `{identity} ∪ default? ∪ addresses`.
    ///
    /// A no-op when the same set is already applied on the live session.
    /// Returns false if any write fails; the filter is then unconfigured.
    pub async fn configure(&self, addresses: &[u16], include_default: bool) -> bool {
        {
            let mut interest = self.inner.interest.lock();
            interest.addresses = addresses.iter().copied().collect();
            interest.include_default = include_default;
        }
        let desired = self.desired_set(addresses, include_default);

        let mut state = self.inner.state.lock().await;
        let generation = self.inner.session.generation();
        if state.configured && state.generation == generation && state.applied == desired {
            debug!("Proxy filter unchanged ({} addresses)", desired.len());
            return true;
        }

        if !self.inner.session.is_ready() {
            debug!("Proxy filter not applied: session not ready");
            state.configured = false;
            return false;
        }

        state.configured = false;
        let mut ordered: Vec<u16> = desired.iter().copied().collect();
        ordered.sort_unstable();

        if !self
            .write(ProxyConfigMessage::SetFilterType(FilterType::AcceptList))
            .await
        {
            return false;
        }
        // One address per message; some firmware rejects multi-address lists.
        for address in &ordered {
            self.inner.codec.ensure_node_record(*address);
            if !self
                .write(ProxyConfigMessage::AddAddresses(vec![*address]))
                .await
            {
                return false;
            }
        }

        state.applied = desired;
        state.configured = true;
        state.generation = generation;
        info!(
            "Proxy filter applied: [{}]",
            ordered
                .iter()
                .map(|a| format_address(*a))
                .collect::<Vec<_>>()
                .join(", ")
        );
        self.inner.events.publish(CoreEvent::FilterApplied { addresses: ordered });
        true
    }

    /// Re-apply the last requested interest if the session changed under it
    pub async fn ensure_configured(&self) -> bool {
        if self.is_configured().await {
            return true;
        }
        let interest = self.inner.interest.lock().clone();
        let addresses: Vec<u16> = interest.addresses.into_iter().collect();
        self.configure(&addresses, interest.include_default).await
    }

    /// Add addresses to the current interest and apply
    pub async fn include(&self, addresses: &[u16]) -> bool {
        let (mut merged, include_default) = {
            let interest = self.inner.interest.lock();
            (interest.addresses.clone(), interest.include_default)
        };
        merged.extend(addresses.iter().copied());
        let merged: Vec<u16> = merged.into_iter().collect();
        self.configure(&merged, include_default).await
    }

    /// Forget the applied list; the next configure always writes
    pub async fn reset(&self) {
        let mut state = self.inner.state.lock().await;
        if state.configured {
            debug!("Proxy filter reset");
        }
        state.configured = false;
        state.applied.clear();
        state.last_list_size = None;
    }

    /// Record a Filter Status from the proxy
    pub async fn record_status(&self, filter_type: FilterType, list_size: u16) {
        let mut state = self.inner.state.lock().await;
        debug!(
            "Proxy filter status: {:?}, {} entries (applied {})",
            filter_type,
            list_size,
            state.applied.len()
        );
        state.last_list_size = Some(list_size);
    }

    async fn write(&self, message: ProxyConfigMessage) -> bool {
        let seq = self.inner.sequence.reserve_next("proxy-config");
        let pdu = match self.inner.codec.encode_proxy_config(
            seq,
            self.inner.identity,
            &message.encode(),
        ) {
            Ok(pdu) => pdu,
            Err(e) => {
                warn!("Failed to encode {:?}: {}", message, e);
                return false;
            }
        };
        self.inner.writes.fetch_add(1, Ordering::Relaxed);
        self.inner
            .session
            .send(ProxyPduType::ProxyConfiguration, &pdu)
            .await
    }
}
