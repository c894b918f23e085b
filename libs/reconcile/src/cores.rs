//! CPU core sets and the service/batch core partition.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::ReconcileError;

/// An ordered set of CPU core indices.
///
/// Parses and prints the Linux cpuset list format (`"0-1,3"` parses,
/// `"0,1,3"` prints), which is also what the container runtime expects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct CoreSet(BTreeSet<usize>);

impl CoreSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    /// Number of cores in the set.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the set has no cores.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns true if `core` is in the set.
    pub fn contains(&self, core: usize) -> bool {
        self.0.contains(&core)
    }

    /// Iterate over core indices in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().copied()
    }

    /// Add a core.
    pub fn insert(&mut self, core: usize) -> bool {
        self.0.insert(core)
    }

    pub fn union(&self, other: &CoreSet) -> CoreSet {
        Self(self.0.union(&other.0).copied().collect())
    }

    pub fn difference(&self, other: &CoreSet) -> CoreSet {
        Self(self.0.difference(&other.0).copied().collect())
    }

    pub fn intersection(&self, other: &CoreSet) -> CoreSet {
        Self(self.0.intersection(&other.0).copied().collect())
    }

    pub fn is_disjoint(&self, other: &CoreSet) -> bool {
        self.0.is_disjoint(&other.0)
    }

    pub fn is_subset(&self, other: &CoreSet) -> bool {
        self.0.is_subset(&other.0)
    }

    /// The `count` lowest cores of the set.
    pub fn take_lowest(&self, count: usize) -> CoreSet {
        Self(self.0.iter().copied().take(count).collect())
    }

    /// Render as `[0,1]`, the form used in the session event log.
    pub fn bracketed(&self) -> String {
        format!("[{}]", self)
    }

    pub fn to_vec(&self) -> Vec<usize> {
        self.0.iter().copied().collect()
    }
}

impl fmt::Display for CoreSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|c| c.to_string()).collect();
        write!(f, "{}", parts.join(","))
    }
}

impl FromIterator<usize> for CoreSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<const N: usize> From<[usize; N]> for CoreSet {
    fn from(cores: [usize; N]) -> Self {
        cores.into_iter().collect()
    }
}

impl FromStr for CoreSet {
    type Err = ReconcileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ReconcileError::InvalidCoreSet {
            input: s.to_string(),
            reason: reason.to_string(),
        };

        let mut set = BTreeSet::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match part.split_once('-') {
                Some((lo, hi)) => {
                    let lo: usize = lo.trim().parse().map_err(|_| invalid("bad range start"))?;
                    let hi: usize = hi.trim().parse().map_err(|_| invalid("bad range end"))?;
                    if lo > hi {
                        return Err(invalid("range start exceeds end"));
                    }
                    set.extend(lo..=hi);
                }
                None => {
                    set.insert(part.parse().map_err(|_| invalid("bad core index"))?);
                }
            }
        }
        Ok(Self(set))
    }
}

impl Serialize for CoreSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for CoreSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Core Pool
// =============================================================================

/// Result of resizing the service's share of its pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoreChange {
    /// The service's new core set.
    pub service: CoreSet,
    /// Cores the service gave up.
    pub freed: CoreSet,
    /// Cores the service took back from batch work.
    pub reclaimed: CoreSet,
}

impl CoreChange {
    /// Returns true if the service's core set did not change.
    pub fn is_empty(&self) -> bool {
        self.freed.is_empty() && self.reclaimed.is_empty()
    }
}

/// Partition of the machine's cores between the service and batch work.
///
/// `service_pool` and `batch_pool` are the nominal reservations from the
/// session configuration; `service` and `batch` are the live assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorePool {
    all: CoreSet,
    service_pool: CoreSet,
    batch_pool: CoreSet,
    service: CoreSet,
    batch: CoreSet,
}

impl CorePool {
    /// Build a pool with the service on its full reservation.
    pub fn new(
        all: CoreSet,
        service_pool: CoreSet,
        batch_pool: CoreSet,
    ) -> Result<Self, ReconcileError> {
        if service_pool.is_empty() {
            return Err(ReconcileError::EmptyPool("service"));
        }
        if batch_pool.is_empty() {
            return Err(ReconcileError::EmptyPool("batch"));
        }
        if !service_pool.is_disjoint(&batch_pool) {
            return Err(ReconcileError::PoolOverlap {
                service: service_pool.to_string(),
                batch: batch_pool.to_string(),
            });
        }
        for pool in [&service_pool, &batch_pool] {
            if !pool.is_subset(&all) {
                return Err(ReconcileError::PoolOutOfRange {
                    pool: pool.to_string(),
                    all: all.to_string(),
                });
            }
        }

        Ok(Self {
            service: service_pool.clone(),
            batch: batch_pool.clone(),
            all,
            service_pool,
            batch_pool,
        })
    }

    pub fn all(&self) -> &CoreSet {
        &self.all
    }

    pub fn service_pool(&self) -> &CoreSet {
        &self.service_pool
    }

    pub fn batch_pool(&self) -> &CoreSet {
        &self.batch_pool
    }

    /// Cores the service currently runs on.
    pub fn service(&self) -> &CoreSet {
        &self.service
    }

    /// Cores batch work currently owns.
    pub fn batch(&self) -> &CoreSet {
        &self.batch
    }

    /// Service-reserved cores the service is not using right now.
    pub fn released(&self) -> CoreSet {
        self.service_pool.difference(&self.service)
    }

    /// Core set for a new batch launch: batch cores plus released cores.
    pub fn launch_cores(&self) -> CoreSet {
        self.batch.union(&self.released())
    }

    /// Clamp a requested service core count to what the pool can honour.
    pub fn clamp_service_count(&self, count: usize) -> usize {
        count.clamp(1, self.service_pool.len())
    }

    /// Resize the service to `count` cores of its pool.
    ///
    /// Reclaimed cores always leave the batch set. Freed cores join it only
    /// when `hand_back` is set; otherwise they stay released until the next
    /// launch absorbs them.
    pub fn resize_service(&mut self, count: usize, hand_back: bool) -> CoreChange {
        let target = self
            .service_pool
            .take_lowest(self.clamp_service_count(count));
        let freed = self.service.difference(&target);
        let reclaimed = target.difference(&self.service);

        self.batch = self.batch.difference(&reclaimed);
        if hand_back {
            self.batch = self.batch.union(&freed);
        }
        self.service = target.clone();

        CoreChange {
            service: target,
            freed,
            reclaimed,
        }
    }

    /// Record that batch work now occupies `cores` (released cores taken by a launch).
    pub fn absorb(&mut self, cores: &CoreSet) {
        let usable = cores.difference(&self.service);
        self.batch = self.batch.union(&usable);
    }

    /// Return the service to its full reservation, reclaiming every core.
    pub fn restore_service(&mut self) -> CoreChange {
        let count = self.service_pool.len();
        self.resize_service(count, false)
    }

    /// Check `service ∩ batch = ∅` and `service ∪ batch ⊆ all`.
    pub fn check_invariants(&self) -> Result<(), ReconcileError> {
        let overlap = self.service.intersection(&self.batch);
        if !overlap.is_empty() {
            return Err(ReconcileError::InvariantViolated(format!(
                "cores {overlap} assigned to both service and batch"
            )));
        }
        let used = self.service.union(&self.batch);
        if !used.is_subset(&self.all) {
            return Err(ReconcileError::InvariantViolated(format!(
                "cores {} outside machine set {}",
                used.difference(&self.all),
                self.all
            )));
        }
        Ok(())
    }
}
