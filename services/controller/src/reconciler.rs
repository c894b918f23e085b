//! Core/quota reconciler.
//!
//! Converges the actual assignment toward a policy target:
//!
//! 1. Pause or resume batch work when the quota enters or leaves zero
//! 2. Resize the service's core set, shrinking batch cpusets before the
//!    service widens and growing them after it narrows
//! 3. Apply the new quota to batch containers
//! 4. Commit the quota
//!
//! A failed pause/resume leaves the quota uncommitted so the next cycle
//! retries the transition. A job whose run state disagrees with the target
//! (paused above zero quota, or running at zero) keeps the target from
//! converging until it is paused or resumed. Any other failed call is
//! logged and bookkeeping advances; the next cycle's decision is the retry.

use std::sync::Arc;

use coloc_events::{EventLogger, Subject};
use coloc_reconcile::{ConvergenceStatus, CoreSet, Quota, QuotaTransition, Target};
use tracing::{debug, info, warn};

use crate::affinity::AffinityDriver;
use crate::job::{HandBack, RunState};
use crate::runtime::{ContainerRuntime, ResourceUpdate};
use crate::state::ControllerState;

/// Reconciler configuration.
#[derive(Debug, Clone, Copy)]
pub struct ReconcilerConfig {
    pub hand_back: HandBack,
    pub cpu_period_us: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            hand_back: HandBack::RunningJob,
            cpu_period_us: 100_000,
        }
    }
}

/// Applies targets to the service and batch containers.
pub struct Reconciler {
    runtime: Arc<dyn ContainerRuntime>,
    affinity: Arc<dyn AffinityDriver>,
    logger: Arc<dyn EventLogger>,
    service_pid: i32,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        affinity: Arc<dyn AffinityDriver>,
        logger: Arc<dyn EventLogger>,
        service_pid: i32,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            runtime,
            affinity,
            logger,
            service_pid,
            config,
        }
    }

    /// Converge `state` toward `target`. The caller holds the state lock.
    pub async fn reconcile(&self, state: &mut ControllerState, target: Target) -> ConvergenceStatus {
        let transition = state.quota.transition_to(target.quota);
        let service_cores = state.pool.clamp_service_count(target.service_cores);
        let resize = service_cores != state.pool.service().len();
        let stray = stray_jobs(state, target.quota);

        if transition.is_unchanged() && !resize && stray == 0 {
            return ConvergenceStatus::Converged;
        }

        debug!(
            quota = %target.quota,
            current = %state.quota.current(),
            service_cores,
            ?transition,
            stray,
            "Reconciling"
        );

        let mut degraded = false;
        let mut commit = true;

        match transition {
            QuotaTransition::Pause => {
                if !self.pause_all(state).await {
                    commit = false;
                    degraded = true;
                }
            }
            QuotaTransition::Resume => {
                if !self.resume_all(state).await {
                    commit = false;
                    degraded = true;
                }
            }
            QuotaTransition::Adjust | QuotaTransition::Unchanged if stray > 0 => {
                info!(stray, quota = %target.quota, "Correcting batch run state");
                let ok = if target.quota.is_zero() {
                    self.pause_all(state).await
                } else {
                    self.resume_all(state).await
                };
                if !ok {
                    degraded = true;
                }
            }
            QuotaTransition::Adjust | QuotaTransition::Unchanged => {}
        }

        if resize && !self.resize_service(state, service_cores).await {
            degraded = true;
        }

        // Paused work keeps its last limit; it is reapplied on resume.
        let quota_changed = !transition.is_unchanged() && commit && !target.quota.is_zero();
        if quota_changed && !self.apply_quota(state, target.quota).await {
            degraded = true;
        }

        if commit {
            if !transition.is_unchanged() {
                info!(from = %state.quota.current(), to = %target.quota, "Batch quota changed");
            }
            state.quota.commit(target.quota);
        }

        if degraded {
            ConvergenceStatus::Degraded
        } else {
            ConvergenceStatus::Applied
        }
    }

    /// Pin the service to its current core set.
    pub fn pin_service(&self, cores: &CoreSet) -> bool {
        match self.affinity.set_affinity(self.service_pid, cores) {
            Ok(()) => true,
            Err(e) => {
                warn!(pid = self.service_pid, cores = %cores, error = %e, "Failed to set service affinity");
                false
            }
        }
    }

    /// Return the service to its full pool and lift the batch quota.
    pub async fn restore_service(&self, state: &mut ControllerState) -> ConvergenceStatus {
        let target = Target {
            quota: Quota::MAX,
            service_cores: state.pool.service_pool().len(),
        };
        self.reconcile(state, target).await
    }

    async fn pause_all(&self, state: &mut ControllerState) -> bool {
        let mut ok = true;
        for job in state.active_jobs_mut() {
            if job.state == RunState::Paused {
                continue;
            }
            let Some(handle) = job.container.clone() else {
                continue;
            };
            match self.runtime.pause(&handle).await {
                Ok(()) => {
                    job.state = RunState::Paused;
                    self.logger.job_pause(job.benchmark().into());
                    info!(job = %job.benchmark(), "Paused batch job");
                }
                Err(e) => {
                    warn!(job = %job.benchmark(), error = %e, "Failed to pause batch job");
                    ok = false;
                }
            }
        }
        ok
    }

    async fn resume_all(&self, state: &mut ControllerState) -> bool {
        let mut ok = true;
        for job in state.active_jobs_mut() {
            if job.state != RunState::Paused {
                continue;
            }
            let Some(handle) = job.container.clone() else {
                continue;
            };
            match self.runtime.unpause(&handle).await {
                Ok(()) => {
                    job.state = RunState::Running;
                    self.logger.job_unpause(job.benchmark().into());
                    info!(job = %job.benchmark(), "Resumed batch job");
                }
                Err(e) => {
                    warn!(job = %job.benchmark(), error = %e, "Failed to resume batch job");
                    ok = false;
                }
            }
        }
        ok
    }

    async fn resize_service(&self, state: &mut ControllerState, count: usize) -> bool {
        let hand_back = self.config.hand_back == HandBack::RunningJob;
        let change = state.pool.resize_service(count, hand_back);
        if change.is_empty() {
            return true;
        }

        info!(
            service = %change.service,
            freed = %change.freed,
            reclaimed = %change.reclaimed,
            "Resizing service cores"
        );

        let mut ok = true;

        // Batch gives cores back before the service widens onto them.
        if !change.reclaimed.is_empty() {
            ok &= self
                .retarget_batch(state, |cores| cores.difference(&change.reclaimed))
                .await;
        }

        if self.pin_service(&change.service) {
            self.logger.update_cores(Subject::Service, &change.service);
        } else {
            ok = false;
        }

        if hand_back && !change.freed.is_empty() {
            ok &= self
                .retarget_batch(state, |cores| cores.union(&change.freed))
                .await;
        }

        ok
    }

    /// Move every active job to `f(its cores)`, skipping no-op changes.
    async fn retarget_batch<F>(&self, state: &mut ControllerState, f: F) -> bool
    where
        F: Fn(&CoreSet) -> CoreSet,
    {
        let quota = state.quota.current();
        let period = self.config.cpu_period_us;
        let mut ok = true;

        for job in state.active_jobs_mut() {
            let cores = f(&job.cores);
            if cores == job.cores {
                continue;
            }
            if cores.is_empty() {
                warn!(job = %job.benchmark(), "Refusing to leave batch job without cores");
                ok = false;
                continue;
            }
            let Some(handle) = job.container.clone() else {
                continue;
            };

            let update = ResourceUpdate {
                cpuset: Some(cores.clone()),
                cpu_period_us: Some(period),
                cpu_quota_us: (!quota.is_zero()).then(|| quota.cpu_quota_us(period, cores.len())),
            };
            if let Err(e) = self.runtime.update(&handle, &update).await {
                warn!(job = %job.benchmark(), cores = %cores, error = %e, "Failed to update batch cores");
                ok = false;
            }

            // Bookkeeping advances either way; the partition stays disjoint.
            job.cores = cores;
            self.logger.update_cores(job.benchmark().into(), &job.cores);
        }
        ok
    }

    async fn apply_quota(&self, state: &mut ControllerState, quota: Quota) -> bool {
        let period = self.config.cpu_period_us;
        let mut ok = true;

        for job in state.active_jobs_mut() {
            let Some(handle) = job.container.clone() else {
                continue;
            };
            let update = ResourceUpdate {
                cpuset: None,
                cpu_period_us: Some(period),
                cpu_quota_us: Some(quota.cpu_quota_us(period, job.cores.len())),
            };
            match self.runtime.update(&handle, &update).await {
                Ok(()) => debug!(job = %job.benchmark(), quota = %quota, "Applied batch quota"),
                Err(e) => {
                    warn!(job = %job.benchmark(), quota = %quota, error = %e, "Failed to apply batch quota");
                    ok = false;
                }
            }
        }
        ok
    }
}

/// Active jobs whose paused/unpaused state does not match `quota`.
fn stray_jobs(state: &ControllerState, quota: Quota) -> usize {
    let paused = quota.is_zero();
    state
        .active_jobs()
        .filter(|j| j.container.is_some() && (j.state == RunState::Paused) != paused)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affinity::RecordingAffinity;
    use crate::job::{JobQueue, JobRecord, JobSpec, LaunchStrategy, QueueOrdering};
    use crate::launcher::{LaunchResult, Launcher, LauncherConfig};
    use crate::runtime::{LaunchSpec, MockRuntime, RuntimeCall, RuntimeOp};
    use coloc_events::{Benchmark, EventKind, MemoryEventLogger};
    use coloc_reconcile::CorePool;
    use std::collections::BTreeMap;

    struct Fixture {
        runtime: MockRuntime,
        affinity: Arc<RecordingAffinity>,
        logger: Arc<MemoryEventLogger>,
        reconciler: Reconciler,
        state: ControllerState,
    }

    async fn fixture(hand_back: HandBack) -> Fixture {
        let runtime = MockRuntime::new();
        let affinity = Arc::new(RecordingAffinity::new());
        let logger = Arc::new(MemoryEventLogger::new());
        let reconciler = Reconciler::new(
            Arc::new(runtime.clone()),
            affinity.clone(),
            logger.clone(),
            4242,
            ReconcilerConfig {
                hand_back,
                cpu_period_us: 100_000,
            },
        );

        let pool = CorePool::new(
            CoreSet::from([0, 1, 2, 3]),
            CoreSet::from([0, 1]),
            CoreSet::from([2, 3]),
        )
        .unwrap();
        let mut state = ControllerState::new(pool, JobQueue::fill([], QueueOrdering::Fifo));

        let spec = JobSpec::new(Benchmark::Blackscholes);
        let cores = state.pool.launch_cores();
        let handle = runtime
            .run(&LaunchSpec {
                name: spec.container_name().to_string(),
                image: spec.image.clone(),
                command: spec.command(2),
                cpuset: cores.clone(),
                cpu_period_us: 100_000,
                cpu_quota_us: -1,
                labels: BTreeMap::new(),
            })
            .await
            .unwrap();
        state.pool.absorb(&cores);
        state
            .jobs
            .insert(spec.benchmark, JobRecord::launched(spec, handle, cores, 2));
        runtime.clear_calls();

        Fixture {
            runtime,
            affinity,
            logger,
            reconciler,
            state,
        }
    }

    fn target(quota: u32, service_cores: usize) -> Target {
        Target {
            quota: Quota::new(quota).unwrap(),
            service_cores,
        }
    }

    #[tokio::test]
    async fn test_unchanged_target_is_noop() {
        let mut f = fixture(HandBack::RunningJob).await;
        let status = f.reconciler.reconcile(&mut f.state, target(100, 2)).await;

        assert!(status.is_converged());
        assert!(f.runtime.calls().is_empty());
        assert!(f.affinity.calls().is_empty());
    }

    #[tokio::test]
    async fn test_pause_then_idempotent() {
        let mut f = fixture(HandBack::RunningJob).await;

        let status = f.reconciler.reconcile(&mut f.state, target(0, 2)).await;
        assert_eq!(status, ConvergenceStatus::Applied);
        assert_eq!(f.state.quota.current(), Quota::ZERO);
        assert_eq!(f.state.quota.previous(), Quota::MAX);
        assert_eq!(f.runtime.count(RuntimeOp::Pause), 1);

        let calls = f.runtime.calls().len();
        let status = f.reconciler.reconcile(&mut f.state, target(0, 2)).await;
        assert!(status.is_converged());
        assert_eq!(f.runtime.calls().len(), calls);
        assert_eq!(f.logger.of_kind(EventKind::Pause).len(), 1);
    }

    #[tokio::test]
    async fn test_failed_pause_is_not_committed() {
        let mut f = fixture(HandBack::RunningJob).await;
        f.runtime.fail_next(RuntimeOp::Pause, 1);

        let status = f.reconciler.reconcile(&mut f.state, target(0, 2)).await;
        assert!(status.is_degraded());
        assert_eq!(f.state.quota.current(), Quota::MAX);
        assert_eq!(f.state.quota.previous(), Quota::MAX);
        assert!(f.logger.of_kind(EventKind::Pause).is_empty());

        let status = f.reconciler.reconcile(&mut f.state, target(0, 2)).await;
        assert_eq!(status, ConvergenceStatus::Applied);
        assert_eq!(f.state.quota.current(), Quota::ZERO);
        assert_eq!(f.runtime.count(RuntimeOp::Pause), 2);
        assert_eq!(f.logger.of_kind(EventKind::Pause).len(), 1);
    }

    /// Start a second job on the first job's cores, as the parallel strategy does.
    async fn add_job(f: &mut Fixture, benchmark: Benchmark) {
        let spec = JobSpec::new(benchmark);
        let cores = f.state.jobs[&Benchmark::Blackscholes].cores.clone();
        let handle = f
            .runtime
            .run(&LaunchSpec {
                name: spec.container_name().to_string(),
                image: spec.image.clone(),
                command: spec.command(2),
                cpuset: cores.clone(),
                cpu_period_us: 100_000,
                cpu_quota_us: -1,
                labels: BTreeMap::new(),
            })
            .await
            .unwrap();
        f.state
            .jobs
            .insert(benchmark, JobRecord::launched(spec, handle, cores, 2));
        f.runtime.clear_calls();
    }

    #[tokio::test]
    async fn test_partial_pause_then_calm_resumes_paused_job() {
        let mut f = fixture(HandBack::RunningJob).await;
        add_job(&mut f, Benchmark::Canneal).await;
        f.runtime.fail_next(RuntimeOp::Pause, 1);

        let status = f.reconciler.reconcile(&mut f.state, target(0, 2)).await;
        assert!(status.is_degraded());
        assert_eq!(f.state.quota.current(), Quota::MAX);
        assert_eq!(f.state.run_state(Benchmark::Blackscholes), Some(RunState::Launched));
        assert_eq!(f.state.run_state(Benchmark::Canneal), Some(RunState::Paused));

        // Load falls back before the pause is retried.
        let status = f.reconciler.reconcile(&mut f.state, target(100, 2)).await;
        assert_eq!(status, ConvergenceStatus::Applied);
        assert_eq!(f.state.run_state(Benchmark::Canneal), Some(RunState::Running));
        assert_eq!(f.runtime.state_of("canneal"), Some("running"));
        assert_eq!(f.runtime.count(RuntimeOp::Unpause), 1);

        let status = f.reconciler.reconcile(&mut f.state, target(100, 2)).await;
        assert!(status.is_converged());
        assert_eq!(f.runtime.count(RuntimeOp::Unpause), 1);
    }

    #[tokio::test]
    async fn test_partial_resume_then_spike_pauses_running_job() {
        let mut f = fixture(HandBack::RunningJob).await;
        add_job(&mut f, Benchmark::Canneal).await;
        f.reconciler.reconcile(&mut f.state, target(0, 2)).await;
        assert_eq!(f.state.quota.current(), Quota::ZERO);
        f.runtime.fail_next(RuntimeOp::Unpause, 1);

        let status = f.reconciler.reconcile(&mut f.state, target(50, 2)).await;
        assert!(status.is_degraded());
        assert_eq!(f.state.quota.current(), Quota::ZERO);
        assert_eq!(f.state.run_state(Benchmark::Blackscholes), Some(RunState::Paused));
        assert_eq!(f.state.run_state(Benchmark::Canneal), Some(RunState::Running));

        // Load rises again; the resumed job must not keep running at zero.
        let status = f.reconciler.reconcile(&mut f.state, target(0, 2)).await;
        assert_eq!(status, ConvergenceStatus::Applied);
        assert_eq!(f.state.run_state(Benchmark::Canneal), Some(RunState::Paused));
        assert_eq!(f.runtime.state_of("canneal"), Some("paused"));
        assert_eq!(f.runtime.state_of("blackscholes"), Some("paused"));

        let status = f.reconciler.reconcile(&mut f.state, target(0, 2)).await;
        assert!(status.is_converged());
    }

    #[tokio::test]
    async fn test_job_launched_at_zero_quota_is_paused_on_retry() {
        let mut f = fixture(HandBack::RunningJob).await;
        f.reconciler.reconcile(&mut f.state, target(0, 2)).await;
        f.state.queue = JobQueue::fill([JobSpec::new(Benchmark::Radix)], QueueOrdering::Fifo);
        let launcher = Launcher::new(
            Arc::new(f.runtime.clone()),
            f.logger.clone(),
            LauncherConfig {
                strategy: LaunchStrategy::Parallel,
                ..LauncherConfig::default()
            },
        );
        f.runtime.fail_next(RuntimeOp::Pause, 1);

        let result = launcher.launch_next(&mut f.state).await;
        assert!(matches!(result, LaunchResult::Launched { job: Benchmark::Radix, .. }));
        assert_eq!(f.state.run_state(Benchmark::Radix), Some(RunState::Launched));
        assert_eq!(f.runtime.state_of("radix"), Some("running"));

        let status = f.reconciler.reconcile(&mut f.state, target(0, 2)).await;
        assert_eq!(status, ConvergenceStatus::Applied);
        assert_eq!(f.state.run_state(Benchmark::Radix), Some(RunState::Paused));
        assert_eq!(f.runtime.state_of("radix"), Some("paused"));
        assert_eq!(f.runtime.count(RuntimeOp::Pause), 3);
        assert_eq!(f.state.quota.current(), Quota::ZERO);

        let status = f.reconciler.reconcile(&mut f.state, target(0, 2)).await;
        assert!(status.is_converged());
    }

    #[tokio::test]
    async fn test_freed_core_goes_to_running_job_and_back() {
        let mut f = fixture(HandBack::RunningJob).await;
        let job = Benchmark::Blackscholes;

        f.reconciler.reconcile(&mut f.state, target(100, 1)).await;
        assert_eq!(f.state.pool.service(), &CoreSet::from([0]));
        assert_eq!(f.state.jobs[&job].cores, CoreSet::from([1, 2, 3]));
        assert_eq!(f.runtime.cpuset_of("blackscholes"), Some(CoreSet::from([1, 2, 3])));
        assert_eq!(f.affinity.last(), Some(CoreSet::from([0])));
        f.state.check_invariants().unwrap();

        f.reconciler.reconcile(&mut f.state, target(100, 2)).await;
        assert_eq!(f.state.pool.service(), &CoreSet::from([0, 1]));
        assert_eq!(f.state.jobs[&job].cores, CoreSet::from([2, 3]));
        assert_eq!(f.affinity.last(), Some(CoreSet::from([0, 1])));
        f.state.check_invariants().unwrap();
    }

    #[tokio::test]
    async fn test_reclaim_shrinks_batch_before_service_widens() {
        let mut f = fixture(HandBack::RunningJob).await;
        f.reconciler.reconcile(&mut f.state, target(100, 1)).await;
        f.runtime.clear_calls();

        f.reconciler.reconcile(&mut f.state, target(30, 2)).await;
        let first = f.runtime.calls().into_iter().next();
        assert!(matches!(
            first,
            Some(RuntimeCall::Update { cpuset: Some(ref c), .. }) if *c == CoreSet::from([2, 3])
        ));
        assert_eq!(f.state.quota.current(), Quota::new(30).unwrap());
    }

    #[tokio::test]
    async fn test_next_job_hand_back_keeps_running_job_cores() {
        let mut f = fixture(HandBack::NextJob).await;

        f.reconciler.reconcile(&mut f.state, target(100, 1)).await;
        assert_eq!(
            f.state.jobs[&Benchmark::Blackscholes].cores,
            CoreSet::from([2, 3])
        );
        assert_eq!(f.state.pool.launch_cores(), CoreSet::from([1, 2, 3]));
        assert_eq!(f.runtime.count(RuntimeOp::Update), 0);
    }

    #[tokio::test]
    async fn test_affinity_failure_degrades_but_advances() {
        let mut f = fixture(HandBack::RunningJob).await;
        f.affinity.fail_next(1);

        let status = f.reconciler.reconcile(&mut f.state, target(100, 1)).await;
        assert!(status.is_degraded());
        assert_eq!(f.state.pool.service(), &CoreSet::from([0]));
        f.state.check_invariants().unwrap();
    }

    #[tokio::test]
    async fn test_quota_update_uses_job_capacity() {
        let mut f = fixture(HandBack::RunningJob).await;
        f.reconciler.reconcile(&mut f.state, target(45, 2)).await;

        let update = f
            .runtime
            .calls()
            .into_iter()
            .find_map(|c| match c {
                RuntimeCall::Update { cpu_quota_us, .. } => cpu_quota_us,
                _ => None,
            });
        // 45% of two cores at a 100ms period.
        assert_eq!(update, Some(90_000));
    }
}
