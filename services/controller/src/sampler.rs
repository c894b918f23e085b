//! Load samplers for the service.
//!
//! A sampler observes the service for one sampling interval and returns a
//! `LoadSample`. Utilisation is averaged over the interval, so the sample
//! call itself is the cycle's sleep.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use coloc_reconcile::LoadSample;
use thiserror::Error;

use crate::latency::LatencyFeed;
use crate::process::stat_fields;

/// Errors from load sampling.
#[derive(Debug, Error)]
pub enum SamplerError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed stat line for pid {0}")]
    MalformedStat(i32),
}

/// Observes the service over one interval.
#[async_trait]
pub trait LoadSampler: Send {
    /// Observe for `interval` and report what was seen.
    async fn sample(&mut self, interval: Duration) -> Result<LoadSample, SamplerError>;
}

// =============================================================================
// Process CPU
// =============================================================================

/// CPU utilisation of one process from `/proc/<pid>/stat`.
///
/// Reported as a percentage of one core, so a multi-threaded process can
/// exceed 100.
pub struct ProcCpuSampler {
    pid: i32,
    stat_path: PathBuf,
    ticks_per_sec: f64,
}

impl ProcCpuSampler {
    pub fn new(pid: i32) -> Self {
        Self::with_stat_path(pid, PathBuf::from(format!("/proc/{pid}/stat")))
    }

    pub fn with_stat_path(pid: i32, stat_path: PathBuf) -> Self {
        Self {
            pid,
            stat_path,
            ticks_per_sec: clock_ticks_per_sec(),
        }
    }

    /// `utime + stime` in clock ticks.
    async fn cpu_ticks(&self) -> Result<u64, SamplerError> {
        let stat = tokio::fs::read_to_string(&self.stat_path)
            .await
            .map_err(|source| SamplerError::Read {
                path: self.stat_path.display().to_string(),
                source,
            })?;
        parse_cpu_ticks(&stat).ok_or(SamplerError::MalformedStat(self.pid))
    }

    /// Average utilisation over `interval`.
    pub async fn measure(&self, interval: Duration) -> Result<f64, SamplerError> {
        let before = self.cpu_ticks().await?;
        let started = Instant::now();
        tokio::time::sleep(interval).await;
        let after = self.cpu_ticks().await?;

        let elapsed = started.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return Ok(0.0);
        }
        let busy = after.saturating_sub(before) as f64 / self.ticks_per_sec;
        Ok(busy / elapsed * 100.0)
    }
}

#[async_trait]
impl LoadSampler for ProcCpuSampler {
    async fn sample(&mut self, interval: Duration) -> Result<LoadSample, SamplerError> {
        Ok(LoadSample::utilization(self.measure(interval).await?))
    }
}

/// `utime + stime` (fields 14 and 15) of a stat line.
fn parse_cpu_ticks(stat: &str) -> Option<u64> {
    let fields = stat_fields(stat)?;
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

fn clock_ticks_per_sec() -> f64 {
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 {
        ticks as f64
    } else {
        100.0
    }
}

// =============================================================================
// Service Sampler
// =============================================================================

/// Utilisation and/or latency, depending on the policy mode.
pub struct ServiceSampler {
    cpu: Option<ProcCpuSampler>,
    latency: Option<LatencyFeed>,
}

impl ServiceSampler {
    pub fn new(cpu: Option<ProcCpuSampler>, latency: Option<LatencyFeed>) -> Self {
        Self { cpu, latency }
    }
}

#[async_trait]
impl LoadSampler for ServiceSampler {
    async fn sample(&mut self, interval: Duration) -> Result<LoadSample, SamplerError> {
        let cpu_percent = match &self.cpu {
            Some(cpu) => Some(cpu.measure(interval).await?),
            None => {
                tokio::time::sleep(interval).await;
                None
            }
        };
        let tail_latency_ms = self.latency.as_mut().and_then(LatencyFeed::take_latest);

        Ok(LoadSample {
            cpu_percent,
            tail_latency_ms,
        })
    }
}

// =============================================================================
// Scripted Sampler
// =============================================================================

/// Replays a fixed series of samples, repeating the last one when exhausted.
pub struct ScriptedSampler {
    samples: VecDeque<LoadSample>,
    last: LoadSample,
    taken: usize,
}

impl ScriptedSampler {
    pub fn new(samples: impl IntoIterator<Item = LoadSample>) -> Self {
        Self {
            samples: samples.into_iter().collect(),
            last: LoadSample::default(),
            taken: 0,
        }
    }

    /// Utilisation-only series.
    pub fn utilization(series: &[f64]) -> Self {
        Self::new(series.iter().copied().map(LoadSample::utilization))
    }

    /// Number of samples handed out.
    pub fn taken(&self) -> usize {
        self.taken
    }
}

#[async_trait]
impl LoadSampler for ScriptedSampler {
    async fn sample(&mut self, interval: Duration) -> Result<LoadSample, SamplerError> {
        tokio::time::sleep(interval).await;
        if let Some(next) = self.samples.pop_front() {
            self.last = next;
        }
        self.taken += 1;
        Ok(self.last)
    }
}
