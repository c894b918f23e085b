//! colocd
//!
//! Runs one co-location session: the service configured under `[service]`
//! keeps priority on its cores while the configured batch jobs run through
//! the container runtime on whatever is left.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use coloc_controller::affinity::SchedAffinity;
use coloc_controller::docker::DockerRuntime;
use coloc_controller::latency::LatencyFeed;
use coloc_controller::process::ProcessFinder;
use coloc_controller::sampler::{ProcCpuSampler, ServiceSampler};
use coloc_controller::{Config, Controller, ControllerDeps};
use coloc_events::FileEventLogger;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Json,
    Pretty,
}

/// Share cores between a latency-critical service and batch containers.
#[derive(Debug, Parser)]
#[command(name = "colocd", version, about)]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long, env = "COLOC_CONFIG")]
    config: Option<PathBuf>,

    /// Session event log path.
    #[arg(long)]
    event_log: Option<PathBuf>,

    /// Seconds to hold the service on all cores after the last job.
    #[arg(long)]
    cooldown_secs: Option<u64>,

    /// Service PID, skipping discovery.
    #[arg(long)]
    service_pid: Option<i32>,

    #[arg(long, value_enum, default_value = "json")]
    log_format: LogFormat,
}

fn init_tracing(format: LogFormat, default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into());
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer().pretty()).init(),
    }
}

/// Flip `tx` on SIGINT or SIGTERM.
fn spawn_signal_handler(tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = term.recv() => {}
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Cannot install SIGTERM handler");
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        info!("Received shutdown signal");
        let _ = tx.send(true);
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(path) = cli.event_log {
        config.event_log = path;
    }
    if let Some(secs) = cli.cooldown_secs {
        config.cooldown_secs = secs;
    }

    init_tracing(cli.log_format, &config.log_level);
    info!(
        config = ?cli.config,
        all_cores = %config.all_cores,
        service_cores = %config.service_cores,
        batch_cores = %config.batch_cores,
        mode = ?config.policy.mode,
        jobs = config.jobs.queue.len(),
        "Starting colocd"
    );

    let service_pid = match cli.service_pid {
        Some(pid) => pid,
        None => match ProcessFinder::new().find_service(&config.service) {
            Ok(pid) => pid,
            Err(e) => {
                error!(error = %e, "Cannot locate service");
                eprintln!("colocd: {e}");
                std::process::exit(1);
            }
        },
    };
    info!(pid = service_pid, "Service located");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handler(shutdown_tx);

    let cpu = config
        .policy
        .uses_utilization()
        .then(|| ProcCpuSampler::new(service_pid));
    let mut latency_task = None;
    let latency = match (&config.policy.latency_source, config.policy.uses_latency()) {
        (Some(path), true) => {
            let (feed, handle) = LatencyFeed::tail(
                path.clone(),
                config.policy.latency_percentile,
                shutdown_rx.clone(),
            );
            latency_task = Some(handle);
            Some(feed)
        }
        _ => None,
    };

    let logger = FileEventLogger::create(&config.event_log)
        .with_context(|| format!("opening event log {}", config.event_log.display()))?;
    let deps = ControllerDeps {
        runtime: Arc::new(DockerRuntime::new(&config.docker.socket)),
        affinity: Arc::new(SchedAffinity::new()),
        logger: Arc::new(logger),
        sampler: Box::new(ServiceSampler::new(cpu, latency)),
    };

    let mut controller = Controller::new(config, deps, service_pid)?;
    let result = controller.run(shutdown_rx).await;
    controller.shutdown().await;
    if let Some(handle) = latency_task {
        handle.abort();
    }

    match result {
        Ok(summary) => {
            info!(
                jobs = summary.jobs.len(),
                cancelled = summary.cancelled,
                "colocd finished"
            );
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Session failed");
            eprintln!("colocd: {e}");
            std::process::exit(1);
        }
    }
}
