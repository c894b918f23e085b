//! Resource policy: maps a load sample to a quota and service core count.
//!
//! Everything here is a pure function of its inputs. Quota falls as the
//! service's CPU pressure rises and climbs back as it falls; the latency
//! path adds hysteresis so the service's core count does not flap around
//! the SLO.

use serde::{Deserialize, Serialize};

use crate::{Quota, ReconcileError};

/// Minimum number of thresholds a quota table must carry.
pub const MIN_QUOTA_STEPS: usize = 8;

/// One observation of the service's load.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LoadSample {
    /// Service CPU utilisation over the last interval, in percent of one core.
    pub cpu_percent: Option<f64>,
    /// Latest tail latency reported by the load generator, in milliseconds.
    pub tail_latency_ms: Option<f64>,
}

impl LoadSample {
    pub fn utilization(cpu_percent: f64) -> Self {
        Self {
            cpu_percent: Some(cpu_percent),
            tail_latency_ms: None,
        }
    }

    pub fn latency(tail_latency_ms: f64) -> Self {
        Self {
            cpu_percent: None,
            tail_latency_ms: Some(tail_latency_ms),
        }
    }
}

/// Desired resource assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    /// Quota for the colocated batch work.
    pub quota: Quota,
    /// Number of cores the service is entitled to.
    pub service_cores: usize,
}

// =============================================================================
// Quota Table
// =============================================================================

/// Above `above` percent utilisation, grant `quota`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuotaStep {
    pub above: f64,
    pub quota: Quota,
}

/// Monotone step function from service utilisation to batch quota.
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaTable {
    steps: Vec<QuotaStep>,
}

impl QuotaTable {
    /// Build a table from steps ordered by descending threshold.
    ///
    /// Thresholds must strictly decrease and quotas must not decrease, so
    /// that less pressure never yields a smaller quota.
    pub fn new(steps: Vec<QuotaStep>) -> Result<Self, ReconcileError> {
        if steps.len() < MIN_QUOTA_STEPS {
            return Err(ReconcileError::InvalidPolicy(format!(
                "quota table needs at least {MIN_QUOTA_STEPS} thresholds, got {}",
                steps.len()
            )));
        }
        for pair in steps.windows(2) {
            if !(pair[0].above > pair[1].above) {
                return Err(ReconcileError::InvalidPolicy(format!(
                    "thresholds must strictly decrease ({} then {})",
                    pair[0].above, pair[1].above
                )));
            }
            if pair[0].quota > pair[1].quota {
                return Err(ReconcileError::InvalidPolicy(format!(
                    "quota must not shrink as utilisation falls ({} then {})",
                    pair[0].quota, pair[1].quota
                )));
            }
        }
        if steps.iter().any(|s| !s.above.is_finite()) {
            return Err(ReconcileError::InvalidPolicy(
                "thresholds must be finite".to_string(),
            ));
        }
        Ok(Self { steps })
    }

    pub fn steps(&self) -> &[QuotaStep] {
        &self.steps
    }

    /// Quota for a utilisation reading; below every threshold means full quota.
    pub fn quota_for(&self, cpu_percent: f64) -> Quota {
        self.steps
            .iter()
            .find(|step| cpu_percent > step.above)
            .map(|step| step.quota)
            .unwrap_or(Quota::MAX)
    }
}

impl Default for QuotaTable {
    fn default() -> Self {
        let step = |above: f64, quota: u8| QuotaStep {
            above,
            quota: Quota(quota),
        };
        Self {
            steps: vec![
                step(95.0, 0),
                step(90.0, 10),
                step(85.0, 20),
                step(80.0, 30),
                step(70.0, 45),
                step(60.0, 60),
                step(50.0, 75),
                step(40.0, 90),
            ],
        }
    }
}

// =============================================================================
// Latency Hysteresis
// =============================================================================

/// Scale-up / scale-down bands around the latency SLO.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatencyHysteresis {
    /// Target upper bound on the tail latency, in milliseconds.
    pub slo_ms: f64,
    /// Scale up when latency exceeds `slo_ms * scale_up_ratio`.
    #[serde(default = "default_scale_up_ratio")]
    pub scale_up_ratio: f64,
    /// Scale down only when latency is below `slo_ms * scale_down_ratio`.
    #[serde(default = "default_scale_down_ratio")]
    pub scale_down_ratio: f64,
}

fn default_scale_up_ratio() -> f64 {
    1.0
}

fn default_scale_down_ratio() -> f64 {
    0.7
}

impl LatencyHysteresis {
    pub fn new(slo_ms: f64) -> Self {
        Self {
            slo_ms,
            scale_up_ratio: default_scale_up_ratio(),
            scale_down_ratio: default_scale_down_ratio(),
        }
    }

    pub fn validate(&self) -> Result<(), ReconcileError> {
        if !(self.slo_ms > 0.0) {
            return Err(ReconcileError::InvalidPolicy(format!(
                "slo_ms must be positive, got {}",
                self.slo_ms
            )));
        }
        if !(self.scale_down_ratio > 0.0 && self.scale_down_ratio < self.scale_up_ratio) {
            return Err(ReconcileError::InvalidPolicy(format!(
                "scale_down_ratio {} must be in (0, scale_up_ratio {})",
                self.scale_down_ratio, self.scale_up_ratio
            )));
        }
        Ok(())
    }

    /// Core count for a latency reading given the current count.
    pub fn cores_for(&self, latency_ms: f64, current: usize, min: usize, max: usize) -> usize {
        if latency_ms > self.slo_ms * self.scale_up_ratio {
            max
        } else if latency_ms < self.slo_ms * self.scale_down_ratio {
            min
        } else {
            current.clamp(min, max)
        }
    }
}

impl Default for LatencyHysteresis {
    fn default() -> Self {
        Self::new(0.8)
    }
}

// =============================================================================
// Resource Policy
// =============================================================================

/// Which load signal drives decisions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyMode {
    /// Quota and cores from service CPU utilisation.
    #[default]
    Utilization,
    /// Cores from tail latency; quota untouched.
    Latency,
    /// Quota from utilisation, cores from whichever signal asks for more.
    Combined,
}

/// Maps load samples to targets.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourcePolicy {
    mode: PolicyMode,
    table: QuotaTable,
    latency: LatencyHysteresis,
    min_service_cores: usize,
    max_service_cores: usize,
}

impl ResourcePolicy {
    pub fn new(
        mode: PolicyMode,
        table: QuotaTable,
        latency: LatencyHysteresis,
        min_service_cores: usize,
        max_service_cores: usize,
    ) -> Result<Self, ReconcileError> {
        latency.validate()?;
        if min_service_cores == 0 || min_service_cores > max_service_cores {
            return Err(ReconcileError::InvalidPolicy(format!(
                "service cores must satisfy 1 <= min ({min_service_cores}) <= max ({max_service_cores})"
            )));
        }
        Ok(Self {
            mode,
            table,
            latency,
            min_service_cores,
            max_service_cores,
        })
    }

    /// Utilisation policy over the default table.
    pub fn utilization(min_service_cores: usize, max_service_cores: usize) -> Self {
        Self {
            mode: PolicyMode::Utilization,
            table: QuotaTable::default(),
            latency: LatencyHysteresis::default(),
            min_service_cores: min_service_cores.max(1),
            max_service_cores: max_service_cores.max(min_service_cores.max(1)),
        }
    }

    pub fn mode(&self) -> PolicyMode {
        self.mode
    }

    pub fn table(&self) -> &QuotaTable {
        &self.table
    }

    /// Decide the target for `sample`, starting from the `current` assignment.
    ///
    /// Missing or non-finite readings leave the corresponding part of the
    /// target unchanged.
    pub fn decide(&self, sample: &LoadSample, current: Target) -> Target {
        let cpu = sample.cpu_percent.filter(|v| v.is_finite());
        let latency = sample.tail_latency_ms.filter(|v| v.is_finite());

        let quota = match self.mode {
            PolicyMode::Latency => current.quota,
            PolicyMode::Utilization | PolicyMode::Combined => cpu
                .map(|c| self.table.quota_for(c))
                .unwrap_or(current.quota),
        };

        let by_quota = if quota.is_max() {
            self.min_service_cores
        } else {
            self.max_service_cores
        };
        let by_latency = |current_cores: usize| {
            latency.map(|l| {
                self.latency.cores_for(
                    l,
                    current_cores,
                    self.min_service_cores,
                    self.max_service_cores,
                )
            })
        };

        let service_cores = match self.mode {
            PolicyMode::Utilization => {
                if cpu.is_some() {
                    by_quota
                } else {
                    current.service_cores
                }
            }
            PolicyMode::Latency => by_latency(current.service_cores).unwrap_or(current.service_cores),
            PolicyMode::Combined => {
                let from_quota = if cpu.is_some() { by_quota } else { current.service_cores };
                match by_latency(current.service_cores) {
                    Some(cores) => cores.max(from_quota),
                    None => from_quota,
                }
            }
        };

        Target {
            quota,
            service_cores,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn full() -> Target {
        Target {
            quota: Quota::MAX,
            service_cores: 2,
        }
    }

    #[rstest]
    #[case(99.0, 0)]
    #[case(95.5, 0)]
    #[case(95.0, 10)]
    #[case(92.0, 10)]
    #[case(87.0, 20)]
    #[case(82.0, 30)]
    #[case(75.0, 45)]
    #[case(65.0, 60)]
    #[case(55.0, 75)]
    #[case(45.0, 90)]
    #[case(40.0, 100)]
    #[case(10.0, 100)]
    #[case(0.0, 100)]
    fn test_default_table(#[case] cpu: f64, #[case] expected: u32) {
        assert_eq!(QuotaTable::default().quota_for(cpu).percent(), expected);
    }

    #[test]
    fn test_default_table_is_valid_and_monotone() {
        let table = QuotaTable::default();
        QuotaTable::new(table.steps().to_vec()).unwrap();

        let mut last = Quota::MAX;
        for cpu in (0..=120).map(f64::from) {
            let quota = table.quota_for(cpu);
            assert!(quota <= last, "quota rose at {cpu}%");
            last = quota;
        }
    }

    #[test]
    fn test_table_rejects_short_or_unordered() {
        let steps = QuotaTable::default().steps().to_vec();
        assert!(QuotaTable::new(steps[..4].to_vec()).is_err());

        let mut swapped = steps.clone();
        swapped.swap(0, 1);
        assert!(QuotaTable::new(swapped).is_err());

        let mut shrinking = steps;
        shrinking[7].quota = Quota::ZERO;
        assert!(QuotaTable::new(shrinking).is_err());
    }

    #[test]
    fn test_utilization_sequence() {
        let policy = ResourcePolicy::utilization(1, 2);
        let mut current = full();
        let mut quotas = Vec::new();
        for cpu in [10.0, 30.0, 97.0, 97.0, 10.0] {
            current = policy.decide(&LoadSample::utilization(cpu), current);
            quotas.push(current.quota.percent());
        }
        assert_eq!(quotas, vec![100, 100, 0, 0, 100]);
    }

    #[test]
    fn test_utilization_core_entitlement() {
        let policy = ResourcePolicy::utilization(1, 2);
        let relaxed = policy.decide(&LoadSample::utilization(10.0), full());
        assert_eq!(relaxed.service_cores, 1);

        let busy = policy.decide(&LoadSample::utilization(72.0), relaxed);
        assert_eq!(busy.service_cores, 2);
        assert_eq!(busy.quota.percent(), 45);
    }

    #[test]
    fn test_missing_sample_keeps_target() {
        let policy = ResourcePolicy::utilization(1, 2);
        let current = Target {
            quota: Quota::ZERO,
            service_cores: 2,
        };
        assert_eq!(policy.decide(&LoadSample::default(), current), current);
        assert_eq!(
            policy.decide(&LoadSample::utilization(f64::NAN), current),
            current
        );
    }

    #[rstest]
    #[case(0.9, 1, 2)]
    #[case(0.7, 2, 2)]
    #[case(0.6, 2, 2)]
    #[case(0.5, 2, 1)]
    #[case(0.6, 1, 1)]
    fn test_latency_hysteresis(#[case] latency: f64, #[case] current: usize, #[case] expected: usize) {
        let policy = ResourcePolicy::new(
            PolicyMode::Latency,
            QuotaTable::default(),
            LatencyHysteresis::new(0.8),
            1,
            2,
        )
        .unwrap();
        let target = policy.decide(
            &LoadSample::latency(latency),
            Target {
                quota: Quota::MAX,
                service_cores: current,
            },
        );
        assert_eq!(target.service_cores, expected);
        assert_eq!(target.quota, Quota::MAX);
    }

    #[test]
    fn test_combined_takes_larger_core_request() {
        let policy = ResourcePolicy::new(
            PolicyMode::Combined,
            QuotaTable::default(),
            LatencyHysteresis::new(0.8),
            1,
            2,
        )
        .unwrap();
        let sample = LoadSample {
            cpu_percent: Some(10.0),
            tail_latency_ms: Some(1.2),
        };
        let target = policy.decide(&sample, full());
        assert_eq!(target.quota, Quota::MAX);
        assert_eq!(target.service_cores, 2);
    }

    #[test]
    fn test_invalid_hysteresis_rejected() {
        let bad = LatencyHysteresis {
            slo_ms: 1.0,
            scale_up_ratio: 1.0,
            scale_down_ratio: 1.2,
        };
        assert!(ResourcePolicy::new(PolicyMode::Latency, QuotaTable::default(), bad, 1, 2).is_err());
        assert!(ResourcePolicy::new(
            PolicyMode::Utilization,
            QuotaTable::default(),
            LatencyHysteresis::default(),
            3,
            2
        )
        .is_err());
    }
}
