//! Process CPU affinity.
//!
//! Pins the service process, and every thread it has, to a core set.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use coloc_reconcile::CoreSet;
use thiserror::Error;
use tracing::debug;

/// Errors from affinity changes.
#[derive(Debug, Error)]
pub enum AffinityError {
    #[error("refusing to pin pid {0} to an empty core set")]
    EmptyCoreSet(i32),

    #[error("process {0} does not exist")]
    NoSuchProcess(i32),

    #[error("sched_setaffinity failed for tid {tid}: {source}")]
    Os {
        tid: i32,
        #[source]
        source: std::io::Error,
    },

    #[error("CPU affinity is not supported on this platform")]
    Unsupported,

    /// Failure injected by `RecordingAffinity`.
    #[error("injected affinity failure")]
    Injected,
}

/// Applies a core set to an OS process.
pub trait AffinityDriver: Send + Sync {
    /// Restrict `pid` and all of its threads to `cores`.
    fn set_affinity(&self, pid: i32, cores: &CoreSet) -> Result<(), AffinityError>;
}

/// `sched_setaffinity` over every task of the process.
pub struct SchedAffinity {
    proc_root: PathBuf,
}

impl SchedAffinity {
    pub fn new() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
        }
    }

    /// Thread IDs of `pid`, from `/proc/<pid>/task`.
    fn tasks(&self, pid: i32) -> Result<Vec<i32>, AffinityError> {
        let dir = self.proc_root.join(pid.to_string()).join("task");
        let entries = std::fs::read_dir(&dir).map_err(|_| AffinityError::NoSuchProcess(pid))?;
        let mut tids: Vec<i32> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().to_str().and_then(|s| s.parse().ok()))
            .collect();
        tids.sort_unstable();
        if tids.is_empty() {
            tids.push(pid);
        }
        Ok(tids)
    }
}

impl Default for SchedAffinity {
    fn default() -> Self {
        Self::new()
    }
}

impl AffinityDriver for SchedAffinity {
    #[cfg(target_os = "linux")]
    fn set_affinity(&self, pid: i32, cores: &CoreSet) -> Result<(), AffinityError> {
        use libc::{cpu_set_t, sched_setaffinity, CPU_SET, CPU_SETSIZE, CPU_ZERO};

        if cores.is_empty() {
            return Err(AffinityError::EmptyCoreSet(pid));
        }

        let mut set: cpu_set_t = unsafe { std::mem::zeroed() };
        unsafe { CPU_ZERO(&mut set) };
        for core in cores.iter().filter(|c| *c < CPU_SETSIZE as usize) {
            unsafe { CPU_SET(core, &mut set) };
        }

        let tids = self.tasks(pid)?;
        for tid in &tids {
            let rc = unsafe { sched_setaffinity(*tid, std::mem::size_of::<cpu_set_t>(), &set) };
            if rc != 0 {
                let source = std::io::Error::last_os_error();
                // Threads can exit between listing and pinning.
                if source.raw_os_error() == Some(libc::ESRCH) && *tid != pid {
                    continue;
                }
                return Err(AffinityError::Os { tid: *tid, source });
            }
        }

        debug!(pid, cores = %cores, threads = tids.len(), "Applied CPU affinity");
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn set_affinity(&self, _pid: i32, _cores: &CoreSet) -> Result<(), AffinityError> {
        Err(AffinityError::Unsupported)
    }
}

/// Records affinity calls instead of making them.
#[derive(Default)]
pub struct RecordingAffinity {
    calls: Mutex<Vec<(i32, CoreSet)>>,
    failures: AtomicU32,
}

impl RecordingAffinity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` calls fail.
    pub fn fail_next(&self, count: u32) {
        self.failures.fetch_add(count, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<(i32, CoreSet)> {
        match self.calls.lock() {
            Ok(c) => c.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Core set of the most recent call.
    pub fn last(&self) -> Option<CoreSet> {
        self.calls().last().map(|(_, cores)| cores.clone())
    }
}

impl AffinityDriver for RecordingAffinity {
    fn set_affinity(&self, pid: i32, cores: &CoreSet) -> Result<(), AffinityError> {
        match self.calls.lock() {
            Ok(mut c) => c.push((pid, cores.clone())),
            Err(poisoned) => poisoned.into_inner().push((pid, cores.clone())),
        }
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(AffinityError::Injected);
        }
        if cores.is_empty() {
            return Err(AffinityError::EmptyCoreSet(pid));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_affinity_fails_on_demand() {
        let affinity = RecordingAffinity::new();
        affinity.fail_next(1);

        assert!(affinity.set_affinity(42, &CoreSet::from([0, 1])).is_err());
        assert!(affinity.set_affinity(42, &CoreSet::from([0])).is_ok());
        assert_eq!(affinity.calls().len(), 2);
        assert_eq!(affinity.last(), Some(CoreSet::from([0])));
    }

    #[test]
    fn test_empty_core_set_rejected() {
        let affinity = RecordingAffinity::new();
        assert!(matches!(
            affinity.set_affinity(1, &CoreSet::new()),
            Err(AffinityError::EmptyCoreSet(1))
        ));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_pin_self_to_current_mask() {
        // Pinning to every online core is always permitted.
        let online = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) }.max(1) as usize;
        let cores: CoreSet = (0..online).collect();
        let pid = std::process::id() as i32;
        assert!(SchedAffinity::new().set_affinity(pid, &cores).is_ok());
    }

    #[test]
    fn test_missing_process() {
        let affinity = SchedAffinity {
            proc_root: PathBuf::from("/nonexistent-proc"),
        };
        let err = affinity.set_affinity(7, &CoreSet::from([0])).unwrap_err();
        assert!(matches!(
            err,
            AffinityError::NoSuchProcess(7) | AffinityError::Unsupported
        ));
    }
}
