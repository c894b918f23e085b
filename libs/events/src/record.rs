//! Session event records.
//!
//! One record per line in the session log:
//!
//! ```text
//! 2025-05-01T10:00:00.123Z start scheduler
//! 2025-05-01T10:00:00.130Z start memcached [0,1] 2
//! 2025-05-01T10:00:00.412Z start blackscholes [2,3] 2
//! 2025-05-01T10:00:03.005Z update_cores memcached [0]
//! 2025-05-01T10:01:12.771Z end blackscholes
//! ```

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use coloc_reconcile::CoreSet;

use crate::encode::form_encode;
use crate::Subject;

/// Record kind, the second column of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Start,
    End,
    UpdateCores,
    Pause,
    Unpause,
    Custom,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Start => "start",
            EventKind::End => "end",
            EventKind::UpdateCores => "update_cores",
            EventKind::Pause => "pause",
            EventKind::Unpause => "unpause",
            EventKind::Custom => "custom",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single timestamped session event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub subject: Subject,
    pub args: Vec<String>,
}

impl EventRecord {
    pub fn new(kind: EventKind, subject: Subject, args: Vec<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            subject,
            args,
        }
    }

    pub fn start(subject: Subject, cores: &CoreSet, threads: u32) -> Self {
        Self::new(
            EventKind::Start,
            subject,
            vec![cores.bracketed(), threads.to_string()],
        )
    }

    pub fn end(subject: Subject) -> Self {
        Self::new(EventKind::End, subject, Vec::new())
    }

    pub fn update_cores(subject: Subject, cores: &CoreSet) -> Self {
        Self::new(EventKind::UpdateCores, subject, vec![cores.bracketed()])
    }

    pub fn custom(subject: Subject, message: &str) -> Self {
        Self::new(EventKind::Custom, subject, vec![form_encode(message)])
    }

    /// The line without its timestamp, e.g. `start radix [2,3] 2`.
    pub fn summary(&self) -> String {
        let mut line = format!("{} {}", self.kind, self.subject);
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

impl fmt::Display for EventRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.summary()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Benchmark;

    #[test]
    fn test_start_summary() {
        let record = EventRecord::start(Benchmark::Radix.into(), &CoreSet::from([2, 3]), 2);
        assert_eq!(record.summary(), "start radix [2,3] 2");
    }

    #[test]
    fn test_line_has_millisecond_utc_timestamp() {
        let record = EventRecord::end(Subject::Scheduler);
        let line = record.to_string();
        let (ts, rest) = line.split_once(' ').unwrap();
        assert_eq!(rest, "end scheduler");
        assert!(ts.ends_with('Z'));
        assert!(DateTime::parse_from_rfc3339(ts).is_ok());
    }

    #[test]
    fn test_custom_message_is_single_token() {
        let record = EventRecord::custom(Subject::Service, "latency 0.91 ms > slo");
        assert_eq!(record.summary(), "custom memcached latency+0.91+ms+%3E+slo");
    }
}
