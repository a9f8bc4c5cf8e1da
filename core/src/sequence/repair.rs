//! Replay-repair heuristic
//!
//! A replay rejection is never reported by the remote node; it shows up as an
//! acknowledged operation that silently fails while the link is otherwise
//! healthy. Repair jumps the sequence counter forward and resubmits once.

use crate::config::RepairSettings;
use parking_lot::Mutex;
use tokio::time::Instant;

/// What an outstanding unicast operation asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingRequest {
    /// Acknowledged set; `tid` is reused when the operation is resubmitted
    Set { on: bool, tid: u8 },
    /// State query
    Get,
}

/// An acknowledged unicast operation awaiting its status
#[derive(Debug, Clone)]
pub struct PendingUnicastOp {
    /// Monotonic id distinguishing resubmissions of different operations
    pub id: u64,
    pub destination: u16,
    pub request: PendingRequest,
    pub created_at: Instant,
    /// Repairs already attempted for this operation
    pub attempts: u32,
}

/// Inbound-side observations about the proxy link
#[derive(Debug, Default)]
pub struct LinkHealth {
    last_inbound: Mutex<Option<Instant>>,
    last_decrypt_failure: Mutex<Option<Instant>>,
}

impl LinkHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn note_inbound(&self) {
        *self.last_inbound.lock() = Some(Instant::now());
    }

    pub fn note_decrypt_failure(&self) {
        *self.last_decrypt_failure.lock() = Some(Instant::now());
    }

    pub fn last_inbound(&self) -> Option<Instant> {
        *self.last_inbound.lock()
    }

    pub fn last_decrypt_failure(&self) -> Option<Instant> {
        *self.last_decrypt_failure.lock()
    }

    /// Forget everything; called when a new link comes up
    pub fn reset(&self) {
        *self.last_inbound.lock() = None;
        *self.last_decrypt_failure.lock() = None;
    }
}

/// Why a repair was not attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No recent inbound traffic: the link itself is probably dead
    LinkSilent,
    /// Recent decryption failures point at a key mismatch instead
    DecryptFailures,
    /// The operation already used its repairs
    AttemptsExhausted,
    /// The previous repair is too recent
    CoolingDown,
}

/// Outcome of evaluating a transaction failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairDecision {
    Repair { step: u32, attempt: u32 },
    Skip(SkipReason),
}

/// Stateful evaluator for replay repairs
#[derive(Debug)]
pub struct ReplayRepair {
    settings: RepairSettings,
    last_repair: Option<Instant>,
    total_repairs: u64,
}

impl ReplayRepair {
    pub fn new(settings: RepairSettings) -> Self {
        Self {
            settings,
            last_repair: None,
            total_repairs: 0,
        }
    }

    /// Repairs granted since creation
    pub fn total_repairs(&self) -> u64 {
        self.total_repairs
    }

    /// Decide whether a failed operation qualifies for repair. A granted
    /// repair starts the cooldown.
    pub fn evaluate(
        &mut self,
        op: &PendingUnicastOp,
        link: &LinkHealth,
        now: Instant,
    ) -> RepairDecision {
        let recent_inbound = link
            .last_inbound()
            .map(|t| now.saturating_duration_since(t) <= self.settings.inbound_recency())
            .unwrap_or(false);
        if !recent_inbound {
            return RepairDecision::Skip(SkipReason::LinkSilent);
        }

        let recent_decrypt_failure = link
            .last_decrypt_failure()
            .map(|t| now.saturating_duration_since(t) <= self.settings.decrypt_quiet())
            .unwrap_or(false);
        if recent_decrypt_failure {
            return RepairDecision::Skip(SkipReason::DecryptFailures);
        }

        if op.attempts >= self.settings.max_repairs {
            return RepairDecision::Skip(SkipReason::AttemptsExhausted);
        }

        if let Some(last) = self.last_repair {
            if now.saturating_duration_since(last) < self.settings.cooldown() {
                return RepairDecision::Skip(SkipReason::CoolingDown);
            }
        }

        self.last_repair = Some(now);
        self.total_repairs += 1;
        RepairDecision::Repair {
            step: self.settings.step_for(op.attempts),
            attempt: op.attempts + 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn op(attempts: u32) -> PendingUnicastOp {
        PendingUnicastOp {
            id: 1,
            destination: 0x0010,
            request: PendingRequest::Set { on: true, tid: 7 },
            created_at: Instant::now(),
            attempts,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_link_is_not_repaired() {
        let mut repair = ReplayRepair::new(RepairSettings::default());
        let link = LinkHealth::new();
        assert_eq!(
            repair.evaluate(&op(0), &link, Instant::now()),
            RepairDecision::Skip(SkipReason::LinkSilent)
        );

        link.note_inbound();
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(
            repair.evaluate(&op(0), &link, Instant::now()),
            RepairDecision::Skip(SkipReason::LinkSilent)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_decrypt_failures_block_repair() {
        let mut repair = ReplayRepair::new(RepairSettings::default());
        let link = LinkHealth::new();
        link.note_inbound();
        link.note_decrypt_failure();
        assert_eq!(
            repair.evaluate(&op(0), &link, Instant::now()),
            RepairDecision::Skip(SkipReason::DecryptFailures)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_repair_steps_grow_and_stop_after_two() {
        let mut repair = ReplayRepair::new(RepairSettings::default());
        let link = LinkHealth::new();
        link.note_inbound();

        let first = repair.evaluate(&op(0), &link, Instant::now());
        assert_eq!(first, RepairDecision::Repair { step: 50_000, attempt: 1 });

        // Cooldown applies across operations.
        assert_eq!(
            repair.evaluate(&op(1), &link, Instant::now()),
            RepairDecision::Skip(SkipReason::CoolingDown)
        );

        tokio::time::advance(Duration::from_secs(6)).await;
        link.note_inbound();
        let second = repair.evaluate(&op(1), &link, Instant::now());
        assert_eq!(second, RepairDecision::Repair { step: 500_000, attempt: 2 });

        tokio::time::advance(Duration::from_secs(6)).await;
        link.note_inbound();
        assert_eq!(
            repair.evaluate(&op(2), &link, Instant::now()),
            RepairDecision::Skip(SkipReason::AttemptsExhausted)
        );
        assert_eq!(repair.total_repairs(), 2);
    }
}
