//! Docker Engine integration.
//!
//! - `api`: HTTP client for the Engine API over its Unix socket
//! - `types`: request and response bodies
//! - `runtime`: `ContainerRuntime` implementation on top of the client

pub mod api;
pub mod runtime;
pub mod types;

pub use api::{ApiError, DockerClient};
pub use runtime::DockerRuntime;
