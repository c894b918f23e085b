//! Adaptive co-location controller.
//!
//! A latency-critical service shares a small pool of cores with a queue of
//! batch containers. The controller samples the service, decides how many
//! cores it keeps and how much CPU the batch side may use, and applies that
//! through CPU affinity and the container runtime.
//!
//! ## Architecture
//!
//! - **Sampler**: service CPU utilisation and/or tail latency per interval
//! - **Policy**: maps a sample to a target (`coloc_reconcile`)
//! - **Reconciler**: converges containers and affinity onto the target
//! - **Launcher**: starts queued jobs on the batch cores
//! - **Watcher**: reacts to container exits and launches the next job
//! - **Controller**: drives a session from init to cooldown
//! - **Runtime**: container lifecycle (Docker in production, mock in tests)

pub mod affinity;
pub mod config;
pub mod controller;
pub mod docker;
pub mod error;
pub mod job;
pub mod latency;
pub mod launcher;
pub mod process;
pub mod reconciler;
pub mod runtime;
pub mod sampler;
pub mod state;
pub mod watcher;

pub use config::Config;
pub use controller::{Controller, ControllerDeps, Phase, SessionSummary};
pub use error::ControllerError;
