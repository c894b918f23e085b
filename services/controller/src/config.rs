//! Configuration for the controller.
//!
//! Loaded from an optional TOML file in which every field has a default,
//! then overridden by `COLOC_*` environment variables, then by CLI flags.
//! Everything is validated once, at load time.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use coloc_events::Benchmark;
use coloc_reconcile::{
    CorePool, CoreSet, LatencyHysteresis, PolicyMode, QuotaStep, QuotaTable, ReconcileError,
    ResourcePolicy,
};
use serde::Deserialize;
use thiserror::Error;

use crate::job::{HandBack, JobQueue, JobSpec, LaunchStrategy, QueueOrdering, DEFAULT_IMAGE_REPO};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {key}: {value:?}")]
    InvalidEnv { key: &'static str, value: String },

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error("{0}")]
    Invalid(String),
}

/// Controller configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Every core the controller may hand out.
    pub all_cores: CoreSet,

    /// Cores reserved for the service.
    pub service_cores: CoreSet,

    /// Cores always available to batch work.
    pub batch_cores: CoreSet,

    /// Sampling interval in milliseconds.
    pub sampling_interval_ms: u64,

    /// Grace period after the last job, in seconds.
    pub cooldown_secs: u64,

    /// Session event log path.
    pub event_log: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub service: ServiceConfig,
    pub policy: PolicyConfig,
    pub jobs: JobsConfig,
    pub docker: DockerConfig,
}

/// The latency-critical service.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    /// Exact process name (`comm`).
    pub process_name: String,

    /// Pid file consulted before scanning processes.
    pub pid_file: Option<PathBuf>,

    /// Fewest cores the service is ever left with.
    pub min_cores: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            process_name: "memcached".to_string(),
            pid_file: None,
            min_cores: 1,
        }
    }
}

/// Resource policy settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicyConfig {
    pub mode: PolicyMode,

    /// Utilisation thresholds; the built-in table when absent.
    pub quota_steps: Option<Vec<QuotaStep>>,

    pub slo_ms: f64,
    pub scale_up_ratio: f64,
    pub scale_down_ratio: f64,

    /// Load generator output to follow for latency readings.
    pub latency_source: Option<PathBuf>,

    /// Percentile reported by the load generator.
    pub latency_percentile: u8,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        let hysteresis = LatencyHysteresis::default();
        Self {
            mode: PolicyMode::default(),
            quota_steps: None,
            slo_ms: hysteresis.slo_ms,
            scale_up_ratio: hysteresis.scale_up_ratio,
            scale_down_ratio: hysteresis.scale_down_ratio,
            latency_source: None,
            latency_percentile: 95,
        }
    }
}

impl PolicyConfig {
    pub fn hysteresis(&self) -> LatencyHysteresis {
        LatencyHysteresis {
            slo_ms: self.slo_ms,
            scale_up_ratio: self.scale_up_ratio,
            scale_down_ratio: self.scale_down_ratio,
        }
    }

    pub fn quota_table(&self) -> Result<QuotaTable, ReconcileError> {
        match &self.quota_steps {
            Some(steps) => QuotaTable::new(steps.clone()),
            None => Ok(QuotaTable::default()),
        }
    }

    /// Whether the policy consumes CPU utilisation.
    pub fn uses_utilization(&self) -> bool {
        matches!(self.mode, PolicyMode::Utilization | PolicyMode::Combined)
    }

    /// Whether the policy consumes tail latency.
    pub fn uses_latency(&self) -> bool {
        matches!(self.mode, PolicyMode::Latency | PolicyMode::Combined)
    }
}

/// Batch job settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JobsConfig {
    pub queue: Vec<Benchmark>,
    pub ordering: QueueOrdering,
    pub strategy: LaunchStrategy,
    pub hand_back: HandBack,
    pub threads: Option<u32>,
    pub max_threads: u32,
    pub image_repo: String,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            queue: Benchmark::ALL.to_vec(),
            ordering: QueueOrdering::default(),
            strategy: LaunchStrategy::default(),
            hand_back: HandBack::default(),
            threads: None,
            max_threads: 4,
            image_repo: DEFAULT_IMAGE_REPO.to_string(),
        }
    }
}

/// Container runtime settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DockerConfig {
    pub socket: PathBuf,

    /// `key=value` label marking scheduler-managed containers.
    pub label: String,

    pub stop_timeout_secs: u64,
    pub cpu_period_us: u64,

    /// Event stream reconnect attempts before the session ends.
    pub reconnect_attempts: u32,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            socket: PathBuf::from("/var/run/docker.sock"),
            label: "scheduler=true".to_string(),
            stop_timeout_secs: 5,
            cpu_period_us: 100_000,
            reconnect_attempts: 5,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            all_cores: CoreSet::from([0, 1, 2, 3]),
            service_cores: CoreSet::from([0, 1]),
            batch_cores: CoreSet::from([2, 3]),
            sampling_interval_ms: 100,
            cooldown_secs: 60,
            event_log: PathBuf::from("jobs.txt"),
            log_level: "info".to_string(),
            service: ServiceConfig::default(),
            policy: PolicyConfig::default(),
            jobs: JobsConfig::default(),
            docker: DockerConfig::default(),
        }
    }
}

impl Config {
    /// Load from `path` (or defaults), apply environment overrides, validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let contents =
                    std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                        path: path.display().to_string(),
                        source,
                    })?;
                Self::from_toml_str(&contents)?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse TOML without validating.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Apply `COLOC_*` overrides read through `var`.
    pub fn apply_env<F>(&mut self, var: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(socket) = var("COLOC_DOCKER_SOCKET") {
            self.docker.socket = PathBuf::from(socket);
        }
        if let Some(log) = var("COLOC_EVENT_LOG") {
            self.event_log = PathBuf::from(log);
        }
        if let Some(pid_file) = var("COLOC_SERVICE_PID_FILE") {
            self.service.pid_file = Some(PathBuf::from(pid_file));
        }
        if let Some(level) = var("COLOC_LOG_LEVEL") {
            self.log_level = level;
        }
        if let Some(value) = var("COLOC_SAMPLING_INTERVAL_MS") {
            self.sampling_interval_ms = value.parse().map_err(|_| ConfigError::InvalidEnv {
                key: "COLOC_SAMPLING_INTERVAL_MS",
                value,
            })?;
        }
        if let Some(value) = var("COLOC_COOLDOWN_SECS") {
            self.cooldown_secs = value.parse().map_err(|_| ConfigError::InvalidEnv {
                key: "COLOC_COOLDOWN_SECS",
                value,
            })?;
        }
        Ok(())
    }

    /// Check pools, policy and queue.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let pool = self.core_pool()?;
        self.resource_policy(&pool)?;

        if self.sampling_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "sampling_interval_ms must be positive".into(),
            ));
        }
        if self.policy.uses_latency() && self.policy.latency_source.is_none() {
            return Err(ConfigError::Invalid(format!(
                "policy mode {:?} needs policy.latency_source",
                self.policy.mode
            )));
        }
        if !(1..=100).contains(&self.policy.latency_percentile) {
            return Err(ConfigError::Invalid(format!(
                "latency_percentile {} outside 1..=100",
                self.policy.latency_percentile
            )));
        }

        let mut seen = HashSet::new();
        for job in &self.jobs.queue {
            if !seen.insert(job) {
                return Err(ConfigError::Invalid(format!(
                    "job {job} is queued more than once"
                )));
            }
        }
        if self.jobs.threads == Some(0) || self.jobs.max_threads == 0 {
            return Err(ConfigError::Invalid("thread counts must be positive".into()));
        }

        if !self.docker.label.contains('=') {
            return Err(ConfigError::Invalid(format!(
                "docker.label {:?} must be key=value",
                self.docker.label
            )));
        }
        if self.docker.cpu_period_us < 1000 || self.docker.cpu_period_us > 1_000_000 {
            return Err(ConfigError::Invalid(format!(
                "docker.cpu_period_us {} outside 1000..=1000000",
                self.docker.cpu_period_us
            )));
        }

        Ok(())
    }

    pub fn core_pool(&self) -> Result<CorePool, ConfigError> {
        Ok(CorePool::new(
            self.all_cores.clone(),
            self.service_cores.clone(),
            self.batch_cores.clone(),
        )?)
    }

    pub fn resource_policy(&self, pool: &CorePool) -> Result<ResourcePolicy, ConfigError> {
        Ok(ResourcePolicy::new(
            self.policy.mode,
            self.policy.quota_table()?,
            self.policy.hysteresis(),
            self.service.min_cores,
            pool.service_pool().len(),
        )?)
    }

    pub fn job_queue(&self) -> JobQueue {
        let jobs = self.jobs.queue.iter().map(|b| {
            JobSpec::from_repo(*b, &self.jobs.image_repo).with_threads(self.jobs.threads)
        });
        JobQueue::fill(jobs, self.jobs.ordering)
    }

    pub fn sampling_interval(&self) -> Duration {
        Duration::from_millis(self.sampling_interval_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.docker.stop_timeout_secs)
    }
}
