//! Shared scheduling state.
//!
//! `ControllerState` is the single unit of mutual exclusion between the
//! sampling loop and the event watcher. Every queue pop, core or quota
//! change, and run-state transition happens under its lock.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use coloc_events::Benchmark;
use coloc_reconcile::{CorePool, Quota, QuotaState, ReconcileError, Target};
use tokio::sync::Mutex;

use crate::job::{JobOutcome, JobQueue, JobRecord, RunState};

/// Handle to the controller state shared between tasks.
pub type SharedState = Arc<Mutex<ControllerState>>;

/// Everything that changes during a session.
#[derive(Debug)]
pub struct ControllerState {
    pub pool: CorePool,
    pub quota: QuotaState,
    pub queue: JobQueue,
    /// Jobs that left the queue, keyed by benchmark.
    pub jobs: BTreeMap<Benchmark, JobRecord>,
}

impl ControllerState {
    /// Fresh state: service on its full pool, batch unrestricted.
    pub fn new(pool: CorePool, queue: JobQueue) -> Self {
        Self {
            pool,
            quota: QuotaState::new(Quota::MAX),
            queue,
            jobs: BTreeMap::new(),
        }
    }

    pub fn into_shared(self) -> SharedState {
        Arc::new(Mutex::new(self))
    }

    /// The assignment currently in force.
    pub fn current_target(&self) -> Target {
        Target {
            quota: self.quota.current(),
            service_cores: self.pool.service().len(),
        }
    }

    /// Jobs that hold cores.
    pub fn active_jobs(&self) -> impl Iterator<Item = &JobRecord> {
        self.jobs.values().filter(|j| j.is_active())
    }

    pub fn active_jobs_mut(&mut self) -> impl Iterator<Item = &mut JobRecord> {
        self.jobs.values_mut().filter(|j| j.is_active())
    }

    pub fn active_count(&self) -> usize {
        self.active_jobs().count()
    }

    /// Queue empty and no job holding cores.
    pub fn is_drained(&self) -> bool {
        self.queue.is_empty() && self.active_count() == 0
    }

    /// Active job owning the container `id`, falling back to its name.
    pub fn resolve_active(&self, container_id: &str, name: Option<&str>) -> Option<Benchmark> {
        let by_id = self.active_jobs().find(|j| {
            j.container
                .as_ref()
                .is_some_and(|c| c.id == container_id)
        });
        if let Some(job) = by_id {
            return Some(job.benchmark());
        }

        let benchmark: Benchmark = name?.trim_start_matches('/').parse().ok()?;
        self.jobs
            .get(&benchmark)
            .filter(|j| j.is_active())
            .map(JobRecord::benchmark)
    }

    /// Run state of `benchmark`, if it belongs to this session.
    pub fn run_state(&self, benchmark: Benchmark) -> Option<RunState> {
        if let Some(job) = self.jobs.get(&benchmark) {
            return Some(job.state);
        }
        self.queue
            .pending()
            .contains(&benchmark)
            .then_some(RunState::Queued)
    }

    /// Core partition invariants plus: every active job's cores are batch cores.
    pub fn check_invariants(&self) -> Result<(), ReconcileError> {
        self.pool.check_invariants()?;
        for job in self.active_jobs() {
            let overlap = job.cores.intersection(self.pool.service());
            if !overlap.is_empty() {
                return Err(ReconcileError::InvariantViolated(format!(
                    "job {} holds service cores {overlap}",
                    job.benchmark()
                )));
            }
        }
        Ok(())
    }

    /// Per-job outcomes and durations, in launch order.
    pub fn summaries(&self) -> Vec<JobSummary> {
        let mut jobs: Vec<&JobRecord> = self.jobs.values().collect();
        jobs.sort_by_key(|j| j.launched_at);
        jobs.into_iter()
            .map(|j| JobSummary {
                benchmark: j.benchmark(),
                outcome: j.state.outcome(),
                duration: j.duration(),
            })
            .collect()
    }
}

/// How one job fared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSummary {
    pub benchmark: Benchmark,
    /// `None` if the session ended before the job did.
    pub outcome: Option<JobOutcome>,
    pub duration: Option<Duration>,
}
