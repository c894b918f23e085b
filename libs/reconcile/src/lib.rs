//! Convergence primitives for the co-location controller.
//!
//! This library holds the pure, I/O-free half of the controller:
//!
//! - **Resource policy**: maps an observed load sample to a target batch
//!   quota and service core count.
//! - **Core pool**: the service/batch partition of the machine's cores.
//! - **Quota state**: current and previous quota, and the pause/resume
//!   transitions between them.
//!
//! # Invariants
//!
//! - `service ∩ batch = ∅` and `service ∪ batch ⊆ all` after every operation
//! - `0 <= quota <= 100`
//! - Decisions are deterministic given the same inputs

mod cores;
mod error;
mod policy;
mod quota;

pub use cores::{CoreChange, CorePool, CoreSet};
pub use error::ReconcileError;
pub use policy::{
    LatencyHysteresis, LoadSample, PolicyMode, QuotaStep, QuotaTable, ResourcePolicy, Target,
    MIN_QUOTA_STEPS,
};
pub use quota::{Quota, QuotaState, QuotaTransition};

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    /// Actual assignment already matched the target; nothing was done.
    Converged,

    /// The target was applied and every runtime call succeeded.
    Applied,

    /// The target was applied with at least one failed runtime call.
    /// The next pass re-derives the same target and retries.
    Degraded,
}

impl ConvergenceStatus {
    /// Returns true if nothing needed to change.
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged)
    }

    /// Returns true if some runtime call failed.
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded)
    }
}
