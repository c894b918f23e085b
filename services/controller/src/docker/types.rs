//! Docker Engine API bodies.
//!
//! Reference: https://docs.docker.com/engine/api/v1.41/

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

/// Docker rejects CFS quotas below 1ms.
pub const MIN_CPU_QUOTA_US: i64 = 1000;

/// `POST /containers/create` body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateContainerRequest {
    pub image: String,
    pub cmd: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub host_config: HostConfig,
}

/// Resource limits shared by create and update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpuset_cpus: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_period: Option<u64>,

    /// Microseconds per period; `-1` lifts the limit (update only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_quota: Option<i64>,
}

/// `POST /containers/create` response.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateContainerResponse {
    #[serde(rename = "Id")]
    pub id: String,

    #[serde(rename = "Warnings", default)]
    pub warnings: Option<Vec<String>>,
}

/// One entry of `GET /containers/json`.
#[derive(Debug, Clone, Deserialize)]
pub struct ContainerListEntry {
    #[serde(rename = "Id")]
    pub id: String,

    #[serde(rename = "Names", default)]
    pub names: Vec<String>,

    #[serde(rename = "State", default)]
    pub state: String,
}

impl ContainerListEntry {
    /// Primary name without the leading slash.
    pub fn name(&self) -> String {
        self.names
            .first()
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_else(|| self.id.clone())
    }
}

/// One message of `GET /events`.
#[derive(Debug, Clone, Deserialize)]
pub struct EventMessage {
    #[serde(rename = "Type", default)]
    pub kind: String,

    #[serde(rename = "Action", default)]
    pub action: String,

    #[serde(rename = "Actor", default)]
    pub actor: EventActor,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventActor {
    #[serde(rename = "ID", default)]
    pub id: String,

    #[serde(rename = "Attributes", default)]
    pub attributes: HashMap<String, String>,
}

/// Error body returned by the daemon.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorResponse {
    pub message: String,
}

/// One progress line of `POST /images/create`.
#[derive(Debug, Clone, Deserialize)]
pub struct PullProgress {
    #[serde(default)]
    pub error: Option<String>,
}

/// Filters for list and events queries, serialised as `{"key": ["value"]}`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Filters(BTreeMap<String, Vec<String>>);

impl Filters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.0
            .entry(key.to_string())
            .or_default()
            .push(value.to_string());
        self
    }
}
