//! Status windows
//!
//! A window listens to the core event channel for a bounded time and
//! resolves once every target satisfies the completion policy, or when the
//! timeout fires. Partial responders are always reported.
//!
//! Exclusive windows supersede each other: opening one resolves the previous
//! exclusive window immediately with whatever it had collected.

use crate::events::{CoreEvent, EventBus};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace};

/// When a target counts as done
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionPolicy {
    /// Any status from the target
    #[default]
    AnyStatus,
    /// The target reported ON and later OFF (momentary devices)
    OnThenOff,
}

/// Parameters of one window
#[derive(Debug, Clone)]
pub struct WindowRequest {
    /// Sources to wait for; empty means "anyone", resolved only by timeout
    pub targets: HashSet<u16>,
    pub timeout: Duration,
    pub policy: CompletionPolicy,
    pub exclusive: bool,
    /// Resolve early when the proxy link fails
    pub abort_on_link_loss: bool,
}

impl WindowRequest {
    pub fn new(targets: impl IntoIterator<Item = u16>, timeout: Duration) -> Self {
        Self {
            targets: targets.into_iter().collect(),
            timeout,
            policy: CompletionPolicy::AnyStatus,
            exclusive: false,
            abort_on_link_loss: false,
        }
    }

    pub fn policy(mut self, policy: CompletionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn abort_on_link_loss(mut self) -> Self {
        self.abort_on_link_loss = true;
        self
    }
}

/// Why a window ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowEnd {
    Completed,
    TimedOut,
    /// Replaced by a newer exclusive window
    Superseded,
    LinkLost,
}

/// Result of a window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowOutcome {
    pub responded: HashSet<u16>,
    pub completed_all: bool,
    pub ended: WindowEnd,
}

#[derive(Debug, Default)]
struct TargetProgress {
    seen: bool,
    saw_on: bool,
    done: bool,
}

/// Tracks policy satisfaction per target
#[derive(Debug)]
struct PolicyTracker {
    policy: CompletionPolicy,
    open: bool,
    progress: HashMap<u16, TargetProgress>,
}

impl PolicyTracker {
    fn new(policy: CompletionPolicy, targets: &HashSet<u16>) -> Self {
        Self {
            policy,
            open: targets.is_empty(),
            progress: targets
                .iter()
                .map(|t| (*t, TargetProgress::default()))
                .collect(),
        }
    }

    fn observe(&mut self, source: u16, state: bool) {
        let progress = if self.open {
            self.progress.entry(source).or_default()
        } else {
            match self.progress.get_mut(&source) {
                Some(p) => p,
                None => return,
            }
        };
        progress.seen = true;
        match self.policy {
            CompletionPolicy::AnyStatus => progress.done = true,
            CompletionPolicy::OnThenOff => {
                if state {
                    progress.saw_on = true;
                } else if progress.saw_on {
                    progress.done = true;
                }
            }
        }
    }

    fn all_done(&self) -> bool {
        !self.open && self.progress.values().all(|p| p.done)
    }

    fn outcome(&self, ended: WindowEnd) -> WindowOutcome {
        WindowOutcome {
            responded: self
                .progress
                .iter()
                .filter(|(_, p)| p.seen)
                .map(|(t, _)| *t)
                .collect(),
            completed_all: self.all_done(),
            ended,
        }
    }
}

type ExclusiveSlot = Arc<Mutex<Option<(u64, oneshot::Sender<()>)>>>;

/// Factory for status windows sharing one exclusive slot
#[derive(Clone)]
pub struct StatusWindows {
    events: EventBus,
    exclusive: ExclusiveSlot,
    next_id: Arc<AtomicU64>,
}

impl StatusWindows {
    pub fn new(events: EventBus) -> Self {
        Self {
            events,
            exclusive: Arc::new(Mutex::new(None)),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Start listening now. An exclusive request first resolves the current
    /// exclusive window.
    pub fn open(&self, request: WindowRequest) -> PendingWindow {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = if request.exclusive {
            let (tx, rx) = oneshot::channel();
            if let Some((previous, cancel)) = self.exclusive.lock().replace((id, tx)) {
                debug!("Status window {} superseded by {}", previous, id);
                let _ = cancel.send(());
            }
            Some(rx)
        } else {
            None
        };

        PendingWindow {
            id,
            events: self.events.subscribe(),
            cancel,
            deadline: Instant::now() + request.timeout,
            request,
            slot: Arc::clone(&self.exclusive),
        }
    }

    /// Open a window and wait for it
    pub async fn await_status(&self, request: WindowRequest) -> WindowOutcome {
        self.open(request).resolve().await
    }
}

/// A window that is already listening
pub struct PendingWindow {
    id: u64,
    events: broadcast::Receiver<CoreEvent>,
    cancel: Option<oneshot::Receiver<()>>,
    deadline: Instant,
    request: WindowRequest,
    slot: ExclusiveSlot,
}

impl PendingWindow {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait until the window resolves
    pub async fn resolve(mut self) -> WindowOutcome {
        let mut tracker = PolicyTracker::new(self.request.policy, &self.request.targets);

        let cancel = self.cancel.take();
        let superseded = async move {
            match cancel {
                Some(rx) => {
                    if rx.await.is_err() {
                        std::future::pending::<()>().await;
                    }
                }
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(superseded);
        let timer = tokio::time::sleep_until(self.deadline);
        tokio::pin!(timer);
        let mut closed = false;

        let ended = loop {
            tokio::select! {
                biased;
                _ = &mut superseded => break WindowEnd::Superseded,
                _ = &mut timer => break WindowEnd::TimedOut,
                event = self.events.recv(), if !closed => match event {
                    Ok(CoreEvent::Status(status)) => {
                        tracker.observe(status.source, status.state);
                        if tracker.all_done() {
                            break WindowEnd::Completed;
                        }
                    }
                    Ok(CoreEvent::ProxyFailed { .. }) if self.request.abort_on_link_loss => {
                        break WindowEnd::LinkLost;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!("Status window {} lagged by {} events", self.id, n);
                    }
                    Err(broadcast::error::RecvError::Closed) => closed = true,
                },
            }
        };

        if self.request.exclusive {
            let mut slot = self.slot.lock();
            if slot.as_ref().map(|(id, _)| *id) == Some(self.id) {
                *slot = None;
            }
        }

        let outcome = tracker.outcome(ended);
        trace!(
            "Status window {} ended {:?}: {} responded, complete={}",
            self.id,
            ended,
            outcome.responded.len(),
            outcome.completed_all
        );
        outcome
    }
}
