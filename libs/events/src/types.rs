//! Workload identity: the closed benchmark catalog and log subjects.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::EventError;

// =============================================================================
// Benchmark Catalog
// =============================================================================

/// Benchmark harness a workload ships in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Suite {
    Parsec,
    Splash2x,
}

impl Suite {
    pub fn as_str(&self) -> &'static str {
        match self {
            Suite::Parsec => "parsec",
            Suite::Splash2x => "splash2x",
        }
    }
}

impl fmt::Display for Suite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A batch workload from the fixed benchmark catalog.
///
/// Names outside the catalog are rejected at parse time, so every
/// `Benchmark` value maps to a known image and command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Benchmark {
    Blackscholes,
    Canneal,
    Dedup,
    Ferret,
    Freqmine,
    Radix,
    Vips,
}

impl Benchmark {
    /// Every benchmark, in catalog order.
    pub const ALL: [Benchmark; 7] = [
        Benchmark::Blackscholes,
        Benchmark::Canneal,
        Benchmark::Dedup,
        Benchmark::Ferret,
        Benchmark::Freqmine,
        Benchmark::Radix,
        Benchmark::Vips,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Benchmark::Blackscholes => "blackscholes",
            Benchmark::Canneal => "canneal",
            Benchmark::Dedup => "dedup",
            Benchmark::Ferret => "ferret",
            Benchmark::Freqmine => "freqmine",
            Benchmark::Radix => "radix",
            Benchmark::Vips => "vips",
        }
    }

    pub fn suite(&self) -> Suite {
        match self {
            Benchmark::Radix => Suite::Splash2x,
            _ => Suite::Parsec,
        }
    }

    /// Rank by sensitivity to co-location, 0 being the least sensitive.
    pub fn sensitivity_rank(&self) -> u8 {
        match self {
            Benchmark::Radix => 0,
            Benchmark::Blackscholes => 1,
            Benchmark::Canneal => 2,
            Benchmark::Vips => 3,
            Benchmark::Dedup => 4,
            Benchmark::Freqmine => 5,
            Benchmark::Ferret => 6,
        }
    }
}

impl fmt::Display for Benchmark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Benchmark {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Benchmark::ALL
            .into_iter()
            .find(|b| b.name() == s.trim())
            .ok_or_else(|| EventError::UnknownBenchmark(s.to_string()))
    }
}

impl TryFrom<String> for Benchmark {
    type Error = EventError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Benchmark> for String {
    fn from(b: Benchmark) -> Self {
        b.name().to_string()
    }
}

// =============================================================================
// Log Subjects
// =============================================================================

/// Who an event log record is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subject {
    /// The scheduling session itself.
    Scheduler,
    /// The latency-critical service.
    Service,
    /// A batch job.
    Job(Benchmark),
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subject::Scheduler => f.write_str("scheduler"),
            Subject::Service => f.write_str("memcached"),
            Subject::Job(b) => f.write_str(b.name()),
        }
    }
}

impl From<Benchmark> for Subject {
    fn from(b: Benchmark) -> Self {
        Subject::Job(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_roundtrip_names() {
        for b in Benchmark::ALL {
            assert_eq!(b.name().parse::<Benchmark>().unwrap(), b);
        }
    }

    #[test]
    fn test_unknown_benchmark_rejected() {
        let err = "streamcluster".parse::<Benchmark>().unwrap_err();
        assert!(matches!(err, EventError::UnknownBenchmark(name) if name == "streamcluster"));
        assert!(serde_json::from_str::<Benchmark>("\"x264\"").is_err());
    }

    #[test]
    fn test_suite_and_ranking() {
        assert_eq!(Benchmark::Radix.suite(), Suite::Splash2x);
        assert_eq!(Benchmark::Vips.suite(), Suite::Parsec);

        let mut ranked = Benchmark::ALL.to_vec();
        ranked.sort_by_key(|b| b.sensitivity_rank());
        assert_eq!(ranked.first(), Some(&Benchmark::Radix));
        assert_eq!(ranked.last(), Some(&Benchmark::Ferret));
    }

    #[test]
    fn test_subject_display() {
        assert_eq!(Subject::Scheduler.to_string(), "scheduler");
        assert_eq!(Subject::Service.to_string(), "memcached");
        assert_eq!(Subject::from(Benchmark::Dedup).to_string(), "dedup");
    }
}
