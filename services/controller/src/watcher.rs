//! Runtime event watcher.
//!
//! Consumes container lifecycle events concurrently with the sampling loop.
//! On a job exit it records the end, removes the container and launches the
//! next queued job, all under the state lock, so one exit is fully handled
//! before the next event is looked at.
//!
//! A dropped stream is re-established with exponential backoff; after the
//! last attempt the watcher fails, which ends the session.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use coloc_events::{EventLogger, Subject};
use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::ControllerError;
use crate::job::RunState;
use crate::launcher::Launcher;
use crate::runtime::{ContainerRuntime, EventStream, RuntimeError, RuntimeEvent};
use crate::state::SharedState;

// =============================================================================
// Backoff Policy
// =============================================================================

/// How long to wait between event-stream resubscriptions.
///
/// Waits double from `first_delay` up to `max_delay`, each nudged by up to
/// `jitter` of itself. The watcher gives up after `max_attempts`.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub first_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of a wait that may be added or removed.
    pub jitter: f64,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            first_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            jitter: 0.25,
            max_attempts: 5,
        }
    }
}

impl BackoffPolicy {
    /// Wait before resubscription `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let nominal = self
            .first_delay
            .saturating_mul(1 << attempt.min(16))
            .min(self.max_delay);
        let nanos = nominal.as_nanos() as f64;
        let offset = nanos * self.jitter * clock_noise();
        Duration::from_nanos((nanos + offset).max(0.0) as u64)
    }
}

/// Roughly uniform value in `[-1, 1]` taken from the wall clock.
fn clock_noise() -> f64 {
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or_default();
    let mixed = (nanos as u64).wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    (mixed >> 11) as f64 / (1u64 << 53) as f64 * 2.0 - 1.0
}

// =============================================================================
// Event Watcher
// =============================================================================

/// Watcher configuration.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Label selector for managed containers.
    pub label: String,
    pub backoff: BackoffPolicy,
}

/// Reacts to container lifecycle events.
pub struct EventWatcher {
    runtime: Arc<dyn ContainerRuntime>,
    launcher: Arc<Launcher>,
    logger: Arc<dyn EventLogger>,
    state: SharedState,
    config: WatcherConfig,
}

impl EventWatcher {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        launcher: Arc<Launcher>,
        logger: Arc<dyn EventLogger>,
        state: SharedState,
        config: WatcherConfig,
    ) -> Self {
        Self {
            runtime,
            launcher,
            logger,
            state,
            config,
        }
    }

    /// Subscribe, then run on a task of its own.
    ///
    /// The subscription exists when this returns, so no exit of a job
    /// launched afterwards can be missed.
    pub async fn start(
        self,
        shutdown: watch::Receiver<bool>,
    ) -> Result<JoinHandle<Result<(), ControllerError>>, ControllerError> {
        let stream = self
            .runtime
            .events(&self.config.label)
            .await
            .map_err(|e| ControllerError::EventStream(e.to_string()))?;
        info!(label = %self.config.label, "Event watcher subscribed");
        Ok(tokio::spawn(self.run(stream, shutdown)))
    }

    async fn run(
        self,
        mut stream: EventStream,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ControllerError> {
        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Event watcher stopping");
                        return Ok(());
                    }
                }

                next = stream.next() => match next {
                    Some(Ok(event)) => self.handle_event(event).await,
                    Some(Err(RuntimeError::Decode(e))) => {
                        warn!(error = %e, "Skipping undecodable runtime event");
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Event stream error");
                        match self.reconnect(&mut shutdown).await? {
                            Some(s) => stream = s,
                            None => return Ok(()),
                        }
                    }
                    None => {
                        warn!("Event stream closed");
                        match self.reconnect(&mut shutdown).await? {
                            Some(s) => stream = s,
                            None => return Ok(()),
                        }
                    }
                },
            }
        }
    }

    /// Resubscribe with backoff. `None` if shutdown arrived meanwhile.
    async fn reconnect(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<EventStream>, ControllerError> {
        let backoff = &self.config.backoff;
        let mut last_error = String::from("stream closed");

        for attempt in 0..backoff.max_attempts {
            let delay = backoff.delay(attempt);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting event stream");

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(None);
                    }
                }
                _ = tokio::time::sleep(delay) => {}
            }

            match self.runtime.events(&self.config.label).await {
                Ok(stream) => {
                    info!(attempt, "Event stream re-established");
                    self.resync().await;
                    return Ok(Some(stream));
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Event stream reconnect failed");
                    last_error = e.to_string();
                }
            }
        }

        error!(attempts = backoff.max_attempts, error = %last_error, "Giving up on event stream");
        Err(ControllerError::EventStream(format!(
            "no stream after {} attempts: {last_error}",
            backoff.max_attempts
        )))
    }

    /// Pick up exits that happened while disconnected.
    async fn resync(&self) {
        let containers = match self.runtime.list(&self.config.label).await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "Cannot list containers after reconnect");
                return;
            }
        };

        let exited: Vec<RuntimeEvent> = {
            let state = self.state.lock().await;
            state
                .active_jobs()
                .filter_map(|job| {
                    let handle = job.container.as_ref()?;
                    let live = containers
                        .iter()
                        .any(|c| c.handle.id == handle.id && c.is_live());
                    (!live).then(|| RuntimeEvent::container("die", handle))
                })
                .collect()
        };

        for event in exited {
            info!(container = ?event.name, "Job exited while disconnected");
            self.handle_event(event).await;
        }
    }

    /// Apply one event. Unknown containers are ignored.
    pub async fn handle_event(&self, event: RuntimeEvent) {
        if event.is_start() {
            let mut state = self.state.lock().await;
            if let Some(job) = state.resolve_active(&event.container_id, event.name.as_deref()) {
                if let Some(record) = state.jobs.get_mut(&job) {
                    if record.state == RunState::Launched {
                        record.state = RunState::Running;
                    }
                }
            }
            return;
        }
        if !event.is_exit() {
            return;
        }

        let mut state = self.state.lock().await;
        let Some(job) = state.resolve_active(&event.container_id, event.name.as_deref()) else {
            debug!(
                container = %event.container_id,
                name = ?event.name,
                action = %event.action,
                "Ignoring event for unknown or finished container"
            );
            return;
        };
        let Some(record) = state.jobs.get_mut(&job) else {
            return;
        };

        let outcome = record.finish(event.exit_code);
        let handle = record.container.clone();
        let duration = record.duration().unwrap_or_default();

        self.logger.job_end(Subject::Job(job));
        if let Some(code) = event.exit_code.filter(|c| *c != 0) {
            self.logger
                .custom(Subject::Job(job), &format!("exited with code {code}"));
        }
        info!(
            job = %job,
            outcome = %outcome,
            duration_secs = duration.as_secs_f64(),
            "Batch job finished"
        );

        if let Some(handle) = handle {
            match self.runtime.remove(&handle, true).await {
                Ok(()) => {
                    if let Some(record) = state.jobs.get_mut(&job) {
                        record.state = RunState::Removed(outcome);
                    }
                }
                Err(e) => warn!(job = %job, error = %e, "Failed to remove finished container"),
            }
        }

        self.launcher.advance(&mut state).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = BackoffPolicy {
            first_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            jitter: 0.0,
            max_attempts: 5,
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
        assert_eq!(policy.delay(10), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = BackoffPolicy::default();
        for attempt in 0..5 {
            let delay = policy.delay(attempt).as_millis() as f64;
            let nominal = (100.0 * 2.0_f64.powi(attempt as i32)).min(5000.0);
            assert!(delay >= nominal * 0.75 - 1.0 && delay <= nominal * 1.25 + 1.0);
        }
    }
}
