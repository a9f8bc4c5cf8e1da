// Sequence module: replay-protected counters and repair heuristic

pub mod authority;
pub mod repair;

pub use authority::{SequenceAuthority, SequenceError, SEQ_MAX};
pub use repair::{
    LinkHealth, PendingRequest, PendingUnicastOp, RepairDecision, ReplayRepair, SkipReason,
};
