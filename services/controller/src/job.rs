//! Batch jobs: launch parameters, the queue, and per-job run state.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use coloc_events::Benchmark;
use coloc_reconcile::CoreSet;
use serde::{Deserialize, Serialize};

use crate::runtime::ContainerHandle;

/// Default image repository for the benchmark catalog.
pub const DEFAULT_IMAGE_REPO: &str = "anakli/cca";

/// Launch parameters of one queued job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub benchmark: Benchmark,
    pub image: String,
    /// Fixed thread count; derived from the launch cores when unset.
    pub threads: Option<u32>,
}

impl JobSpec {
    pub fn new(benchmark: Benchmark) -> Self {
        Self::from_repo(benchmark, DEFAULT_IMAGE_REPO)
    }

    /// Image `<repo>:<suite>_<name>`.
    pub fn from_repo(benchmark: Benchmark, repo: &str) -> Self {
        Self {
            image: format!("{repo}:{}_{}", benchmark.suite(), benchmark.name()),
            benchmark,
            threads: None,
        }
    }

    pub fn with_threads(mut self, threads: Option<u32>) -> Self {
        self.threads = threads;
        self
    }

    /// Container name: the benchmark name.
    pub fn container_name(&self) -> &'static str {
        self.benchmark.name()
    }

    /// Harness invocation for `threads` threads.
    pub fn command(&self, threads: u32) -> Vec<String> {
        [
            "./run",
            "-a",
            "run",
            "-S",
            self.benchmark.suite().as_str(),
            "-p",
            self.benchmark.name(),
            "-i",
            "native",
            "-n",
        ]
        .into_iter()
        .map(str::to_string)
        .chain(std::iter::once(threads.to_string()))
        .collect()
    }
}

/// Order in which the backlog is launched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueOrdering {
    /// As configured.
    #[default]
    Fifo,
    /// Jobs that suffer least from co-location first.
    LeastSensitiveFirst,
    MostSensitiveFirst,
}

/// How many batch jobs run at once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchStrategy {
    /// One job at a time; the next launches when the previous exits.
    #[default]
    Sequential,
    /// Every queued job launches at session start.
    Parallel,
}

/// Who receives cores the service gives up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandBack {
    /// Appended to every running job's cpuset immediately.
    #[default]
    RunningJob,
    /// Left released until the next launch absorbs them.
    NextJob,
}

/// Ordered backlog of not-yet-launched jobs.
#[derive(Debug, Clone, Default)]
pub struct JobQueue {
    jobs: VecDeque<JobSpec>,
}

impl JobQueue {
    /// Fill the queue, ordered per `ordering`. Ties keep configured order.
    pub fn fill(jobs: impl IntoIterator<Item = JobSpec>, ordering: QueueOrdering) -> Self {
        let mut jobs: Vec<JobSpec> = jobs.into_iter().collect();
        match ordering {
            QueueOrdering::Fifo => {}
            QueueOrdering::LeastSensitiveFirst => {
                jobs.sort_by_key(|j| j.benchmark.sensitivity_rank())
            }
            QueueOrdering::MostSensitiveFirst => {
                jobs.sort_by_key(|j| std::cmp::Reverse(j.benchmark.sensitivity_rank()))
            }
        }
        Self { jobs: jobs.into() }
    }

    pub fn pop_front(&mut self) -> Option<JobSpec> {
        self.jobs.pop_front()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Benchmarks still queued, in launch order.
    pub fn pending(&self) -> Vec<Benchmark> {
        self.jobs.iter().map(|j| j.benchmark).collect()
    }
}

/// How a job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Success,
    Failure,
}

impl JobOutcome {
    /// Outcome for an exit code; a missing code counts as success.
    pub fn from_exit_code(code: Option<i64>) -> Self {
        match code {
            Some(c) if c != 0 => JobOutcome::Failure,
            _ => JobOutcome::Success,
        }
    }
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobOutcome::Success => f.write_str("success"),
            JobOutcome::Failure => f.write_str("failure"),
        }
    }
}

/// Job run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Queued,
    Launched,
    Running,
    Paused,
    Finished(JobOutcome),
    /// Finished and deleted from the runtime.
    Removed(JobOutcome),
}

impl RunState {
    /// Launched, running or paused: the job holds cores.
    pub fn is_active(&self) -> bool {
        matches!(self, RunState::Launched | RunState::Running | RunState::Paused)
    }

    pub fn outcome(&self) -> Option<JobOutcome> {
        match self {
            RunState::Finished(o) | RunState::Removed(o) => Some(*o),
            _ => None,
        }
    }
}

/// A job that has left the queue.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub spec: JobSpec,
    pub state: RunState,
    pub container: Option<ContainerHandle>,
    pub cores: CoreSet,
    pub threads: u32,
    pub launched_at: Instant,
    pub finished_at: Option<Instant>,
    pub exit_code: Option<i64>,
}

impl JobRecord {
    pub fn launched(spec: JobSpec, container: ContainerHandle, cores: CoreSet, threads: u32) -> Self {
        Self {
            spec,
            state: RunState::Launched,
            container: Some(container),
            cores,
            threads,
            launched_at: Instant::now(),
            finished_at: None,
            exit_code: None,
        }
    }

    /// A job the runtime refused to start.
    pub fn rejected(spec: JobSpec) -> Self {
        let now = Instant::now();
        Self {
            spec,
            state: RunState::Finished(JobOutcome::Failure),
            container: None,
            cores: CoreSet::new(),
            threads: 0,
            launched_at: now,
            finished_at: Some(now),
            exit_code: None,
        }
    }

    pub fn benchmark(&self) -> Benchmark {
        self.spec.benchmark
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn finish(&mut self, exit_code: Option<i64>) -> JobOutcome {
        let outcome = JobOutcome::from_exit_code(exit_code);
        self.exit_code = exit_code;
        self.state = RunState::Finished(outcome);
        self.finished_at = Some(Instant::now());
        outcome
    }

    /// Wall-clock time from launch to exit.
    pub fn duration(&self) -> Option<Duration> {
        self.finished_at
            .map(|end| end.saturating_duration_since(self.launched_at))
    }
}
