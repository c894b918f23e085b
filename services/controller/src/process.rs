//! Service process discovery.
//!
//! The service is found either through its pid file or by scanning `/proc`
//! for the newest process whose `comm` matches the configured name.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::config::ServiceConfig;
use crate::error::ControllerError;

/// Locates processes under a procfs root.
#[derive(Debug, Clone)]
pub struct ProcessFinder {
    proc_root: PathBuf,
}

impl ProcessFinder {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    pub fn with_root<P: AsRef<Path>>(proc_root: P) -> Self {
        Self {
            proc_root: proc_root.as_ref().to_path_buf(),
        }
    }

    /// Whether `pid` names a live process.
    pub fn is_alive(&self, pid: i32) -> bool {
        pid > 0 && self.proc_root.join(pid.to_string()).join("stat").exists()
    }

    /// PID recorded in `pid_file`, if that process is alive.
    pub fn from_pid_file(&self, pid_file: &Path) -> Option<i32> {
        let contents = std::fs::read_to_string(pid_file).ok()?;
        let pid: i32 = contents.trim().parse().ok()?;
        self.is_alive(pid).then_some(pid)
    }

    /// Newest process whose command name is exactly `name`.
    pub fn newest_by_name(&self, name: &str) -> Option<i32> {
        let entries = std::fs::read_dir(&self.proc_root).ok()?;

        let mut newest: Option<(u64, i32)> = None;
        for entry in entries.filter_map(|e| e.ok()) {
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|s| s.parse::<i32>().ok())
            else {
                continue;
            };
            let Ok(comm) = std::fs::read_to_string(entry.path().join("comm")) else {
                continue;
            };
            if comm.trim_end() != name {
                continue;
            }
            let started = std::fs::read_to_string(entry.path().join("stat"))
                .ok()
                .and_then(|s| start_time(&s))
                .unwrap_or(0);
            if newest.map_or(true, |(t, p)| (started, pid) > (t, p)) {
                newest = Some((started, pid));
            }
        }

        newest.map(|(_, pid)| pid)
    }

    /// Resolve the service PID from configuration.
    pub fn find_service(&self, service: &ServiceConfig) -> Result<i32, ControllerError> {
        if let Some(pid_file) = &service.pid_file {
            if let Some(pid) = self.from_pid_file(pid_file) {
                info!(pid, pid_file = %pid_file.display(), "Found service via pid file");
                return Ok(pid);
            }
            debug!(pid_file = %pid_file.display(), "Pid file missing or stale, scanning processes");
        }

        match self.newest_by_name(&service.process_name) {
            Some(pid) => {
                info!(pid, name = %service.process_name, "Found service process");
                Ok(pid)
            }
            None => Err(ControllerError::service_not_running(
                &service.process_name,
                service.pid_file.as_deref(),
            )),
        }
    }
}

impl Default for ProcessFinder {
    fn default() -> Self {
        Self::new()
    }
}

/// Fields of `/proc/<pid>/stat` after the parenthesised command name.
pub(crate) fn stat_fields(stat: &str) -> Option<Vec<&str>> {
    let close = stat.rfind(')')?;
    Some(stat.get(close + 1..)?.split_whitespace().collect())
}

/// Field 22 (`starttime`), in clock ticks since boot.
fn start_time(stat: &str) -> Option<u64> {
    // Field 3 (state) is index 0 after the command name.
    stat_fields(stat)?.get(19)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_process(root: &Path, pid: i32, comm: &str, start: u64) {
        let dir = root.join(pid.to_string());
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("comm"), format!("{comm}\n")).unwrap();
        let stat = format!(
            "{pid} ({comm}) S 1 1 1 0 -1 4194560 100 0 0 0 10 5 0 0 20 0 4 0 {start} 1000 100"
        );
        std::fs::write(dir.join("stat"), stat).unwrap();
    }

    #[test]
    fn test_newest_process_wins() {
        let root = tempfile::tempdir().unwrap();
        fake_process(root.path(), 100, "memcached", 500);
        fake_process(root.path(), 200, "memcached", 900);
        fake_process(root.path(), 300, "memcached-tool", 999);
        fake_process(root.path(), 400, "nginx", 1000);

        let finder = ProcessFinder::with_root(root.path());
        assert_eq!(finder.newest_by_name("memcached"), Some(200));
        assert_eq!(finder.newest_by_name("redis"), None);
    }

    #[test]
    fn test_pid_file_takes_precedence() {
        let root = tempfile::tempdir().unwrap();
        fake_process(root.path(), 100, "memcached", 500);
        fake_process(root.path(), 200, "memcached", 900);
        let pid_file = root.path().join("memcached.pid");
        std::fs::write(&pid_file, "100\n").unwrap();

        let finder = ProcessFinder::with_root(root.path());
        let service = ServiceConfig {
            pid_file: Some(pid_file),
            ..ServiceConfig::default()
        };
        assert_eq!(finder.find_service(&service).unwrap(), 100);
    }

    #[test]
    fn test_stale_pid_file_falls_back_to_scan() {
        let root = tempfile::tempdir().unwrap();
        fake_process(root.path(), 200, "memcached", 900);
        let pid_file = root.path().join("memcached.pid");
        std::fs::write(&pid_file, "12345").unwrap();

        let finder = ProcessFinder::with_root(root.path());
        let service = ServiceConfig {
            pid_file: Some(pid_file),
            ..ServiceConfig::default()
        };
        assert_eq!(finder.find_service(&service).unwrap(), 200);
    }

    #[test]
    fn test_missing_service_is_fatal() {
        let root = tempfile::tempdir().unwrap();
        let finder = ProcessFinder::with_root(root.path());
        let err = finder.find_service(&ServiceConfig::default()).unwrap_err();
        assert!(matches!(err, ControllerError::ServiceNotRunning { ref name, .. } if name == "memcached"));
        assert!(err.to_string().contains("not running"));
    }

    #[test]
    fn test_stat_parsing_handles_spaces_in_comm() {
        let stat = "42 (my proc) R 1 1 1 0 -1 0 0 0 0 0 7 3 0 0 20 0 1 0 12345 0 0";
        assert_eq!(start_time(stat), Some(12345));
    }
}
