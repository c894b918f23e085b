//! Top-level controller.
//!
//! Runs one scheduling session through its phases:
//!
//! - **Init**: clear leftovers, pin the service to its full pool, start the
//!   event watcher, launch the first job(s)
//! - **SteadyState**: sample, decide, reconcile, until the queue is empty
//!   and nothing is running
//! - **Draining**: leave the sampling loop
//! - **Cooldown**: hold the service on its full pool for a grace period
//! - **Done**: close the session log and stop the watcher
//!
//! `shutdown` is the cleanup path and must run however `run` ended.

use std::sync::Arc;
use std::time::{Duration, Instant};

use coloc_events::{EventLogger, Subject};
use coloc_reconcile::{ConvergenceStatus, ResourcePolicy};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::affinity::AffinityDriver;
use crate::config::Config;
use crate::error::ControllerError;
use crate::launcher::{LaunchResult, Launcher, LauncherConfig};
use crate::reconciler::{Reconciler, ReconcilerConfig};
use crate::runtime::{remove_labelled, ContainerRuntime};
use crate::sampler::{LoadSampler, SamplerError};
use crate::state::{ControllerState, JobSummary, SharedState};
use crate::watcher::{BackoffPolicy, EventWatcher, WatcherConfig};

/// Session phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    SteadyState,
    Draining,
    Cooldown,
    Done,
}

/// Collaborators the controller drives.
pub struct ControllerDeps {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub affinity: Arc<dyn AffinityDriver>,
    pub logger: Arc<dyn EventLogger>,
    pub sampler: Box<dyn LoadSampler>,
}

/// What a session achieved.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub jobs: Vec<JobSummary>,
    pub elapsed: Duration,
    /// Samples taken in steady state.
    pub samples: u64,
    /// Ended by a termination signal rather than by draining.
    pub cancelled: bool,
}

type WatcherHandle = JoinHandle<Result<(), ControllerError>>;

/// One steady-state wakeup.
enum Tick {
    Shutdown,
    WatcherExited(Result<Result<(), ControllerError>, tokio::task::JoinError>),
    Sample(Result<coloc_reconcile::LoadSample, SamplerError>),
}

/// Drives one scheduling session.
pub struct Controller {
    config: Config,
    runtime: Arc<dyn ContainerRuntime>,
    logger: Arc<dyn EventLogger>,
    sampler: Box<dyn LoadSampler>,
    policy: ResourcePolicy,
    reconciler: Reconciler,
    launcher: Arc<Launcher>,
    state: SharedState,
    phase: Phase,
    watcher: Option<WatcherHandle>,
    watcher_stop: watch::Sender<bool>,
    cleaned_up: bool,
}

impl Controller {
    /// Build a controller for the service at `service_pid`.
    pub fn new(config: Config, deps: ControllerDeps, service_pid: i32) -> Result<Self, ControllerError> {
        let pool = config.core_pool()?;
        let policy = config.resource_policy(&pool)?;
        let state = ControllerState::new(pool, config.job_queue()).into_shared();

        let reconciler = Reconciler::new(
            deps.runtime.clone(),
            deps.affinity,
            deps.logger.clone(),
            service_pid,
            ReconcilerConfig {
                hand_back: config.jobs.hand_back,
                cpu_period_us: config.docker.cpu_period_us,
            },
        );
        let launcher = Arc::new(Launcher::new(
            deps.runtime.clone(),
            deps.logger.clone(),
            LauncherConfig {
                strategy: config.jobs.strategy,
                label: config.docker.label.clone(),
                cpu_period_us: config.docker.cpu_period_us,
                threads: config.jobs.threads,
                max_threads: config.jobs.max_threads,
            },
        ));
        let (watcher_stop, _) = watch::channel(false);

        Ok(Self {
            config,
            runtime: deps.runtime,
            logger: deps.logger,
            sampler: deps.sampler,
            policy,
            reconciler,
            launcher,
            state,
            phase: Phase::Init,
            watcher: None,
            watcher_stop,
            cleaned_up: false,
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Handle to the shared scheduling state.
    pub fn state(&self) -> SharedState {
        self.state.clone()
    }

    fn enter(&mut self, phase: Phase) {
        debug!(from = ?self.phase, to = ?phase, "Controller phase change");
        self.phase = phase;
    }

    /// Run the session to completion or until `shutdown` flips to true.
    pub async fn run(
        &mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<SessionSummary, ControllerError> {
        let started = Instant::now();

        self.init().await?;

        self.enter(Phase::SteadyState);
        let (samples, cancelled) = self.steady_state(&mut shutdown).await?;

        if !cancelled {
            self.enter(Phase::Draining);
            info!(samples, "All batch jobs finished");

            self.enter(Phase::Cooldown);
            self.cooldown(&mut shutdown).await;
        }

        self.enter(Phase::Done);
        self.logger.job_end(Subject::Service);
        self.logger.session_end();
        self.stop_watcher().await;

        let summary = SessionSummary {
            jobs: self.state.lock().await.summaries(),
            elapsed: started.elapsed(),
            samples,
            cancelled,
        };
        for job in &summary.jobs {
            info!(
                job = %job.benchmark,
                outcome = ?job.outcome,
                duration_secs = job.duration.map(|d| d.as_secs_f64()),
                "Job summary"
            );
        }
        info!(
            elapsed_secs = summary.elapsed.as_secs_f64(),
            cancelled,
            "Session finished"
        );
        Ok(summary)
    }

    async fn init(&mut self) -> Result<(), ControllerError> {
        let label = self.config.docker.label.clone();
        let leftovers =
            remove_labelled(self.runtime.as_ref(), &label, self.config.stop_timeout()).await;
        if leftovers > 0 {
            info!(leftovers, "Removed containers from a previous session");
        }

        self.logger.session_start();

        let service = {
            let state = self.state.lock().await;
            state.pool.service().clone()
        };
        self.reconciler.pin_service(&service);
        self.logger
            .job_start(Subject::Service, &service, service.len() as u32);

        let watcher = EventWatcher::new(
            self.runtime.clone(),
            self.launcher.clone(),
            self.logger.clone(),
            self.state.clone(),
            WatcherConfig {
                label,
                backoff: BackoffPolicy {
                    max_attempts: self.config.docker.reconnect_attempts,
                    ..BackoffPolicy::default()
                },
            },
        );
        self.watcher = Some(watcher.start(self.watcher_stop.subscribe()).await?);

        let mut state = self.state.lock().await;
        let results = self.launcher.advance(&mut state).await;
        let launched = results
            .iter()
            .filter(|r| matches!(r, LaunchResult::Launched { .. }))
            .count();
        info!(
            launched,
            queued = state.queue.len(),
            strategy = ?self.launcher.strategy(),
            "Session started"
        );
        Ok(())
    }

    /// Sample and reconcile until drained. Returns `(samples, cancelled)`.
    async fn steady_state(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(u64, bool), ControllerError> {
        let interval = self.config.sampling_interval();
        let mut samples = 0u64;

        loop {
            if *shutdown.borrow() {
                return Ok((samples, true));
            }
            if self.state.lock().await.is_drained() {
                return Ok((samples, false));
            }

            let tick = {
                let watcher_slot = &mut self.watcher;
                let sampler = &mut self.sampler;
                let watcher = async move {
                    match watcher_slot.as_mut() {
                        Some(handle) => handle.await,
                        None => std::future::pending().await,
                    }
                };
                tokio::select! {
                    biased;
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            Tick::Shutdown
                        } else {
                            continue;
                        }
                    }
                    result = watcher => Tick::WatcherExited(result),
                    sample = sampler.sample(interval) => Tick::Sample(sample),
                }
            };

            match tick {
                Tick::Shutdown => {
                    info!("Shutdown requested, leaving sampling loop");
                    return Ok((samples, true));
                }
                Tick::WatcherExited(result) => {
                    self.watcher = None;
                    return Err(match result {
                        Ok(Err(e)) => e,
                        Ok(Ok(())) => ControllerError::WatcherStopped("exited".into()),
                        Err(e) => ControllerError::WatcherStopped(e.to_string()),
                    });
                }
                Tick::Sample(Err(e)) => {
                    warn!(error = %e, "Sampling failed");
                    // The sample did not wait out its interval.
                    tokio::time::sleep(interval).await;
                }
                Tick::Sample(Ok(sample)) => {
                    samples += 1;
                    let mut state = self.state.lock().await;
                    let target = self.policy.decide(&sample, state.current_target());
                    let status = self.reconciler.reconcile(&mut state, target).await;
                    if status != ConvergenceStatus::Converged {
                        debug!(
                            cpu = ?sample.cpu_percent,
                            latency_ms = ?sample.tail_latency_ms,
                            quota = %state.quota.current(),
                            service = %state.pool.service(),
                            ?status,
                            "Reconciled"
                        );
                    }
                    if let Err(e) = state.check_invariants() {
                        error!(error = %e, "Core partition invariant violated");
                    }
                }
            }
        }
    }

    async fn cooldown(&mut self, shutdown: &mut watch::Receiver<bool>) {
        {
            let mut state = self.state.lock().await;
            self.reconciler.restore_service(&mut state).await;
        }

        let cooldown = self.config.cooldown();
        if cooldown.is_zero() {
            return;
        }
        info!(secs = cooldown.as_secs(), "Cooling down");
        tokio::select! {
            _ = tokio::time::sleep(cooldown) => {}
            _ = shutdown.changed() => info!("Shutdown requested during cooldown"),
        }
    }

    async fn stop_watcher(&mut self) {
        let _ = self.watcher_stop.send(true);
        let Some(handle) = self.watcher.take() else {
            return;
        };
        match tokio::time::timeout(Duration::from_secs(5), handle).await {
            Ok(Ok(Ok(()))) => debug!("Event watcher stopped"),
            Ok(Ok(Err(e))) => warn!(error = %e, "Event watcher ended with error"),
            Ok(Err(e)) => warn!(error = %e, "Event watcher task failed"),
            Err(_) => warn!("Event watcher did not stop in time"),
        }
    }

    /// Stop the watcher and remove every managed container. Idempotent.
    pub async fn shutdown(&mut self) {
        if self.cleaned_up {
            return;
        }
        self.cleaned_up = true;

        self.stop_watcher().await;
        let removed = remove_labelled(
            self.runtime.as_ref(),
            &self.config.docker.label,
            self.config.stop_timeout(),
        )
        .await;
        info!(removed, "Cleanup complete");
    }
}
