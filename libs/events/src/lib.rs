//! # coloc-events
//!
//! Workload identity and the session event log for the co-location
//! controller.
//!
//! ## Benchmark Catalog
//!
//! Batch workloads come from a closed catalog (`Benchmark`). Unknown names
//! are rejected when configuration is loaded, never at launch time.
//!
//! ## Session Log
//!
//! Every scheduling decision that matters for offline analysis is appended
//! as one timestamped line:
//! - Session start/end (`scheduler`)
//! - Job start (with cores and threads) and end
//! - Service and job core updates
//! - Pause/unpause of colocated work
//! - Free-form custom notes
//!
//! The log is an output artefact, never read back for decisions.

mod encode;
mod error;
mod logger;
mod record;
mod types;

pub use encode::{form_encode, percent_encode};
pub use error::EventError;
pub use logger::{EventLogger, FileEventLogger, MemoryEventLogger};
pub use record::{EventKind, EventRecord};
pub use types::*;
