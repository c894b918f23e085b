//! The session event logger interface and its sinks.

use std::fs::{File, OpenOptions};
use std::io::{LineWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use coloc_reconcile::CoreSet;
use tracing::{debug, warn};

use crate::{EventError, EventKind, EventRecord, Subject};

/// Appends timestamped session records.
///
/// Writing is best-effort: sinks log their own failures and never make a
/// scheduling decision fail.
pub trait EventLogger: Send + Sync {
    /// Append one record.
    fn record(&self, record: EventRecord);

    fn job_start(&self, subject: Subject, cores: &CoreSet, threads: u32) {
        self.record(EventRecord::start(subject, cores, threads));
    }

    fn job_end(&self, subject: Subject) {
        self.record(EventRecord::end(subject));
    }

    fn update_cores(&self, subject: Subject, cores: &CoreSet) {
        self.record(EventRecord::update_cores(subject, cores));
    }

    fn job_pause(&self, subject: Subject) {
        self.record(EventRecord::new(EventKind::Pause, subject, Vec::new()));
    }

    fn job_unpause(&self, subject: Subject) {
        self.record(EventRecord::new(EventKind::Unpause, subject, Vec::new()));
    }

    fn session_start(&self) {
        self.record(EventRecord::new(EventKind::Start, Subject::Scheduler, Vec::new()));
    }

    fn session_end(&self) {
        self.record(EventRecord::end(Subject::Scheduler));
    }

    fn custom(&self, subject: Subject, message: &str) {
        self.record(EventRecord::custom(subject, message));
    }
}

// =============================================================================
// File Sink
// =============================================================================

/// Writes one line per record to a file, truncating it on open.
pub struct FileEventLogger {
    path: PathBuf,
    writer: Mutex<LineWriter<File>>,
}

impl FileEventLogger {
    /// Create (or truncate) the log file at `path`.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, EventError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|source| EventError::Io {
                path: path.display().to_string(),
                source,
            })?;

        Ok(Self {
            path,
            writer: Mutex::new(LineWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventLogger for FileEventLogger {
    fn record(&self, record: EventRecord) {
        let line = record.to_string();
        debug!(record = %line, "Session event");

        let mut writer = match self.writer.lock() {
            Ok(w) => w,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = writeln!(writer, "{line}") {
            warn!(path = %self.path.display(), error = %e, "Failed to append session event");
        }
    }
}

// =============================================================================
// In-Memory Sink
// =============================================================================

/// Keeps records in memory; used by tests and dry runs.
#[derive(Default)]
pub struct MemoryEventLogger {
    records: Mutex<Vec<EventRecord>>,
}

impl MemoryEventLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<EventRecord> {
        match self.records.lock() {
            Ok(r) => r.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Records rendered without timestamps, in append order.
    pub fn summaries(&self) -> Vec<String> {
        self.records().iter().map(EventRecord::summary).collect()
    }

    /// Records of one kind.
    pub fn of_kind(&self, kind: EventKind) -> Vec<EventRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.kind == kind)
            .collect()
    }
}

impl EventLogger for MemoryEventLogger {
    fn record(&self, record: EventRecord) {
        match self.records.lock() {
            Ok(mut r) => r.push(record),
            Err(poisoned) => poisoned.into_inner().push(record),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Benchmark;

    #[test]
    fn test_file_logger_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.txt");
        let logger = FileEventLogger::create(&path).unwrap();

        logger.session_start();
        logger.job_start(Subject::Service, &CoreSet::from([0, 1]), 2);
        logger.update_cores(Subject::Service, &CoreSet::from([0]));
        logger.job_end(Benchmark::Vips.into());
        logger.session_end();

        let contents = std::fs::read_to_string(&path).unwrap();
        let rest: Vec<&str> = contents
            .lines()
            .map(|l| l.split_once(' ').unwrap().1)
            .collect();
        assert_eq!(
            rest,
            vec![
                "start scheduler",
                "start memcached [0,1] 2",
                "update_cores memcached [0]",
                "end vips",
                "end scheduler",
            ]
        );
    }

    #[test]
    fn test_file_logger_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.txt");
        std::fs::write(&path, "stale line\n").unwrap();

        let logger = FileEventLogger::create(&path).unwrap();
        logger.session_start();
        drop(logger);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 1);
        assert!(!contents.contains("stale"));
    }

    #[test]
    fn test_memory_logger_filters_by_kind() {
        let logger = MemoryEventLogger::new();
        logger.job_pause(Benchmark::Canneal.into());
        logger.job_unpause(Benchmark::Canneal.into());
        logger.job_pause(Benchmark::Canneal.into());

        assert_eq!(logger.of_kind(EventKind::Pause).len(), 2);
        assert_eq!(
            logger.summaries(),
            vec!["pause canneal", "unpause canneal", "pause canneal"]
        );
    }
}
