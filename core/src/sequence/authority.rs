//! Replay-protected sequence counter
//!
//! One monotonic 24-bit counter per local identity. The in-memory value is
//! authoritative; durable writes are debounced to bound I/O. A startup high
//! watermark guarantees a fresh process never reuses a value a remote node
//! has already seen, even when the last debounced write was lost.

use crate::store::{StorageBackend, StorageError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Largest sequence number representable in a network PDU
pub const SEQ_MAX: u32 = 0x00FF_FFFF;

/// Errors from the sequence authority
#[derive(Error, Debug, Clone)]
pub enum SequenceError {
    #[error("Sequence storage error: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug)]
struct CounterState {
    /// Last reserved value (0 before the first reservation)
    current: u32,
    /// Value most recently written to storage
    persisted: u32,
    last_persist: Option<Instant>,
    flush_scheduled: bool,
}

struct AuthorityInner {
    key: Vec<u8>,
    storage: Arc<dyn StorageBackend>,
    persist_interval: Duration,
    state: Mutex<CounterState>,
}

impl AuthorityInner {
    fn write(&self, state: &mut CounterState, now: Instant) {
        if state.persisted == state.current && state.last_persist.is_some() {
            return;
        }
        match self.storage.put(&self.key, &state.current.to_be_bytes()) {
            Ok(()) => {
                state.persisted = state.current;
                state.last_persist = Some(now);
                trace!("Sequence persisted at {}", state.current);
            }
            Err(e) => warn!("Sequence persist failed (in-memory value kept): {}", e),
        }
    }

    fn flush_pending(&self) {
        let mut state = self.state.lock();
        state.flush_scheduled = false;
        let now = Instant::now();
        self.write(&mut state, now);
    }
}

/// Monotonic per-identity message counter
#[derive(Clone)]
pub struct SequenceAuthority {
    inner: Arc<AuthorityInner>,
}

impl SequenceAuthority {
    /// Storage key for a (network, identity) pair
    pub fn storage_key(network_id: &str, identity: u16) -> Vec<u8> {
        format!("seq/{}/{:04x}", network_id, identity).into_bytes()
    }

    /// Load the counter for `identity` on `network_id`, starting at zero when
    /// nothing was persisted yet.
    pub fn load(
        storage: Arc<dyn StorageBackend>,
        network_id: &str,
        identity: u16,
        persist_interval: Duration,
    ) -> Result<Self, SequenceError> {
        let key = Self::storage_key(network_id, identity);
        let current = match storage.get(&key)? {
            Some(bytes) => {
                let raw: [u8; 4] = bytes.as_slice().try_into().map_err(|_| {
                    StorageError::Corrupt(String::from_utf8_lossy(&key).into_owned())
                })?;
                u32::from_be_bytes(raw).min(SEQ_MAX)
            }
            None => 0,
        };
        debug!(
            "Sequence for identity 0x{:04X} on '{}' loaded at {}",
            identity, network_id, current
        );

        Ok(Self {
            inner: Arc::new(AuthorityInner {
                key,
                storage,
                persist_interval,
                state: Mutex::new(CounterState {
                    current,
                    persisted: current,
                    last_persist: None,
                    flush_scheduled: false,
                }),
            }),
        })
    }

    /// Last reserved value
    pub fn current(&self) -> u32 {
        self.inner.state.lock().current
    }

    /// Value most recently written to durable storage
    pub fn persisted(&self) -> u32 {
        self.inner.state.lock().persisted
    }

    /// Reserve the next sequence number.
    ///
    /// Wraps from `SEQ_MAX` back to 1. Durable writes happen at most once per
    /// persist interval; a deferred write is scheduled on the runtime when a
    /// reservation lands inside the quiet period.
    pub fn reserve_next(&self, reason: &str) -> u32 {
        let now = Instant::now();
        let mut state = self.inner.state.lock();
        state.current = if state.current >= SEQ_MAX {
            warn!("Sequence space exhausted, wrapping to 1");
            1
        } else {
            state.current + 1
        };
        let value = state.current;
        trace!("Sequence {} reserved for {}", value, reason);

        let elapsed = state.last_persist.map(|t| now.saturating_duration_since(t));
        match elapsed {
            Some(elapsed) if elapsed < self.inner.persist_interval => {
                if !state.flush_scheduled {
                    if let Ok(handle) = tokio::runtime::Handle::try_current() {
                        state.flush_scheduled = true;
                        let inner = Arc::clone(&self.inner);
                        let wait = self.inner.persist_interval - elapsed;
                        handle.spawn(async move {
                            tokio::time::sleep(wait).await;
                            inner.flush_pending();
                        });
                    }
                }
            }
            _ => self.inner.write(&mut state, now),
        }
        value
    }

    /// Raise the counter to `value` if it is currently lower. Written through
    /// immediately.
    pub fn ensure_minimum(&self, value: u32) -> u32 {
        let value = value.min(SEQ_MAX);
        let mut state = self.inner.state.lock();
        if state.current < value {
            debug!("Sequence raised from {} to {}", state.current, value);
            state.current = value;
            self.inner.write(&mut state, Instant::now());
        }
        state.current
    }

    /// Jump the counter forward by `step`; used by replay repair
    pub fn bump(&self, step: u32) -> u32 {
        let target = self.current().saturating_add(step);
        self.ensure_minimum(target)
    }

    /// Apply the startup watermark plus a random jitter below `jitter`
    pub fn apply_startup_watermark(&self, watermark: u32, jitter: u32) -> u32 {
        let extra = if jitter > 0 {
            rand::random::<u32>() % jitter
        } else {
            0
        };
        self.ensure_minimum(watermark.saturating_add(extra))
    }

    /// Write any pending value now
    pub fn flush(&self) -> Result<(), SequenceError> {
        self.inner.flush_pending();
        self.inner.storage.flush()?;
        Ok(())
    }
}

impl std::fmt::Debug for SequenceAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("SequenceAuthority")
            .field("current", &state.current)
            .field("persisted", &state.persisted)
            .finish()
    }
}
