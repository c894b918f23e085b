//! Job launcher.
//!
//! Pops jobs off the queue and starts them on the batch cores plus any
//! cores the service has released. A job the runtime refuses is recorded
//! as failed and the queue moves on.

use std::collections::BTreeMap;
use std::sync::Arc;

use coloc_events::{Benchmark, EventLogger, Subject};
use coloc_reconcile::CoreSet;
use tracing::{error, info, warn};

use crate::job::{JobRecord, JobSpec, LaunchStrategy, RunState};
use crate::runtime::{split_label, ContainerRuntime, LaunchSpec};
use crate::state::ControllerState;

/// Launcher configuration.
#[derive(Debug, Clone)]
pub struct LauncherConfig {
    pub strategy: LaunchStrategy,
    /// Label (`key=value`) marking scheduler-managed containers.
    pub label: String,
    pub cpu_period_us: u64,
    /// Fixed thread count for every job.
    pub threads: Option<u32>,
    /// Cap on the derived thread count.
    pub max_threads: u32,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            strategy: LaunchStrategy::Sequential,
            label: "scheduler=true".to_string(),
            cpu_period_us: 100_000,
            threads: None,
            max_threads: 4,
        }
    }
}

/// Result of one launch attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchResult {
    Launched {
        job: Benchmark,
        cores: CoreSet,
        threads: u32,
    },
    Failed {
        job: Benchmark,
        error: String,
    },
    Empty,
}

/// Starts queued jobs.
pub struct Launcher {
    runtime: Arc<dyn ContainerRuntime>,
    logger: Arc<dyn EventLogger>,
    config: LauncherConfig,
}

impl Launcher {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        logger: Arc<dyn EventLogger>,
        config: LauncherConfig,
    ) -> Self {
        Self {
            runtime,
            logger,
            config,
        }
    }

    pub fn strategy(&self) -> LaunchStrategy {
        self.config.strategy
    }

    /// Launch whatever the strategy allows right now.
    ///
    /// Sequential: nothing while a job is active, otherwise launch until one
    /// starts or the queue is empty. Parallel: launch everything queued.
    pub async fn advance(&self, state: &mut ControllerState) -> Vec<LaunchResult> {
        let mut results = Vec::new();
        match self.config.strategy {
            LaunchStrategy::Sequential => {
                if state.active_count() > 0 {
                    return results;
                }
                loop {
                    let result = self.launch_next(state).await;
                    let done = !matches!(result, LaunchResult::Failed { .. });
                    if result != LaunchResult::Empty {
                        results.push(result);
                    }
                    if done {
                        break;
                    }
                }
            }
            LaunchStrategy::Parallel => loop {
                match self.launch_next(state).await {
                    LaunchResult::Empty => break,
                    result => results.push(result),
                }
            },
        }
        results
    }

    /// Pop the queue head and start it.
    pub async fn launch_next(&self, state: &mut ControllerState) -> LaunchResult {
        let Some(spec) = state.queue.pop_front() else {
            return LaunchResult::Empty;
        };
        let job = spec.benchmark;
        let cores = state.pool.launch_cores();
        let threads = self.thread_count(&spec, &cores);
        let quota = state.quota.current();
        let period = self.config.cpu_period_us;

        let launch = LaunchSpec {
            name: spec.container_name().to_string(),
            image: spec.image.clone(),
            command: spec.command(threads),
            cpuset: cores.clone(),
            cpu_period_us: period,
            cpu_quota_us: if quota.is_zero() {
                -1
            } else {
                quota.cpu_quota_us(period, cores.len())
            },
            labels: self.labels(),
        };

        let handle = match self.runtime.run(&launch).await {
            Ok(handle) => handle,
            Err(e) => {
                error!(job = %job, image = %spec.image, error = %e, "Failed to launch batch job");
                self.logger
                    .custom(Subject::Job(job), &format!("launch failed: {e}"));
                state.jobs.insert(job, JobRecord::rejected(spec));
                return LaunchResult::Failed {
                    job,
                    error: e.to_string(),
                };
            }
        };

        state.pool.absorb(&cores);
        self.logger.job_start(Subject::Job(job), &cores, threads);
        info!(job = %job, cores = %cores, threads, container = %handle.id, "Launched batch job");

        let mut record = JobRecord::launched(spec, handle.clone(), cores.clone(), threads);
        if quota.is_zero() {
            // Colocated work is frozen; new work joins it.
            match self.runtime.pause(&handle).await {
                Ok(()) => {
                    record.state = RunState::Paused;
                    self.logger.job_pause(Subject::Job(job));
                }
                // Left unpaused; the next reconcile sees it running at zero.
                Err(e) => warn!(job = %job, error = %e, "Failed to pause job launched under zero quota"),
            }
        }
        state.jobs.insert(job, record);

        LaunchResult::Launched {
            job,
            cores,
            threads,
        }
    }

    fn thread_count(&self, spec: &JobSpec, cores: &CoreSet) -> u32 {
        spec.threads
            .or(self.config.threads)
            .unwrap_or_else(|| (cores.len() as u32).min(self.config.max_threads))
            .max(1)
    }

    fn labels(&self) -> BTreeMap<String, String> {
        let (key, value) = split_label(&self.config.label);
        BTreeMap::from([(key, value)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobOutcome, JobQueue, QueueOrdering};
    use crate::runtime::{MockRuntime, RuntimeCall, RuntimeOp};
    use coloc_events::{EventKind, MemoryEventLogger};
    use coloc_reconcile::{CorePool, Quota};

    fn setup(
        jobs: &[Benchmark],
        strategy: LaunchStrategy,
    ) -> (MockRuntime, Arc<MemoryEventLogger>, Launcher, ControllerState) {
        let runtime = MockRuntime::new();
        let logger = Arc::new(MemoryEventLogger::new());
        let launcher = Launcher::new(
            Arc::new(runtime.clone()),
            logger.clone(),
            LauncherConfig {
                strategy,
                ..LauncherConfig::default()
            },
        );
        let pool = CorePool::new(
            CoreSet::from([0, 1, 2, 3]),
            CoreSet::from([0, 1]),
            CoreSet::from([2, 3]),
        )
        .unwrap();
        let queue = JobQueue::fill(jobs.iter().copied().map(JobSpec::new), QueueOrdering::Fifo);
        (runtime, logger, launcher, ControllerState::new(pool, queue))
    }

    #[tokio::test]
    async fn test_launch_uses_batch_and_released_cores() {
        let (runtime, logger, launcher, mut state) =
            setup(&[Benchmark::Freqmine], LaunchStrategy::Sequential);
        state.pool.resize_service(1, false);

        let result = launcher.launch_next(&mut state).await;
        assert_eq!(
            result,
            LaunchResult::Launched {
                job: Benchmark::Freqmine,
                cores: CoreSet::from([1, 2, 3]),
                threads: 3,
            }
        );
        assert_eq!(state.pool.batch(), &CoreSet::from([1, 2, 3]));
        assert_eq!(logger.summaries(), vec!["start freqmine [1,2,3] 3"]);
        assert_eq!(
            state.run_state(Benchmark::Freqmine),
            Some(RunState::Launched)
        );
        assert!(matches!(
            runtime.calls().first(),
            Some(RuntimeCall::Run { cpu_quota_us: -1, .. })
        ));
        state.check_invariants().unwrap();
    }

    #[tokio::test]
    async fn test_sequential_waits_for_active_job() {
        let (_runtime, _logger, launcher, mut state) = setup(
            &[Benchmark::Dedup, Benchmark::Vips],
            LaunchStrategy::Sequential,
        );

        assert_eq!(launcher.advance(&mut state).await.len(), 1);
        assert!(launcher.advance(&mut state).await.is_empty());
        assert_eq!(state.queue.len(), 1);
    }

    #[tokio::test]
    async fn test_parallel_launches_everything() {
        let (runtime, _logger, launcher, mut state) = setup(
            &[Benchmark::Dedup, Benchmark::Vips, Benchmark::Radix],
            LaunchStrategy::Parallel,
        );

        let results = launcher.advance(&mut state).await;
        assert_eq!(results.len(), 3);
        assert!(state.queue.is_empty());
        assert_eq!(state.active_count(), 3);
        assert_eq!(runtime.count(RuntimeOp::Run), 3);
    }

    #[tokio::test]
    async fn test_failed_launch_advances_queue() {
        let (runtime, logger, launcher, mut state) = setup(
            &[Benchmark::Canneal, Benchmark::Ferret],
            LaunchStrategy::Sequential,
        );
        runtime.fail_launch_of("canneal");

        let results = launcher.advance(&mut state).await;
        assert!(matches!(
            results.as_slice(),
            [
                LaunchResult::Failed { job: Benchmark::Canneal, .. },
                LaunchResult::Launched { job: Benchmark::Ferret, .. },
            ]
        ));
        assert_eq!(
            state.run_state(Benchmark::Canneal),
            Some(RunState::Finished(JobOutcome::Failure))
        );
        assert_eq!(logger.of_kind(EventKind::Custom).len(), 1);
        assert_eq!(logger.of_kind(EventKind::Start).len(), 1);
    }

    #[tokio::test]
    async fn test_launch_under_zero_quota_pauses() {
        let (runtime, _logger, launcher, mut state) =
            setup(&[Benchmark::Blackscholes], LaunchStrategy::Sequential);
        state.quota.commit(Quota::ZERO);

        launcher.launch_next(&mut state).await;
        assert_eq!(runtime.state_of("blackscholes"), Some("paused"));
        assert_eq!(
            state.run_state(Benchmark::Blackscholes),
            Some(RunState::Paused)
        );
    }

    #[tokio::test]
    async fn test_empty_queue() {
        let (_runtime, _logger, launcher, mut state) = setup(&[], LaunchStrategy::Sequential);
        assert_eq!(launcher.launch_next(&mut state).await, LaunchResult::Empty);
        assert!(launcher.advance(&mut state).await.is_empty());
    }
}
