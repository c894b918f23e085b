//! Error types for convergence primitives.

use thiserror::Error;

/// Errors raised while building or validating pools, quotas and policies.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// A cpuset list could not be parsed.
    #[error("invalid core list {input:?}: {reason}")]
    InvalidCoreSet { input: String, reason: String },

    /// The service and batch pools share cores.
    #[error("service pool {service} and batch pool {batch} overlap")]
    PoolOverlap { service: String, batch: String },

    /// A pool names cores the machine does not have.
    #[error("pool {pool} is not a subset of machine cores {all}")]
    PoolOutOfRange { pool: String, all: String },

    /// A pool is empty where at least one core is required.
    #[error("{0} pool must contain at least one core")]
    EmptyPool(&'static str),

    /// Quota outside `0..=100`.
    #[error("quota {0} is outside 0..=100")]
    QuotaOutOfRange(u32),

    /// The threshold table or latency parameters are malformed.
    #[error("invalid policy: {0}")]
    InvalidPolicy(String),

    /// A core partition invariant does not hold.
    #[error("core partition invariant violated: {0}")]
    InvariantViolated(String),
}
