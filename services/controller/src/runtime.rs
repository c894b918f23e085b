//! Container runtime interface and mock implementation.
//!
//! The runtime interface abstracts batch container lifecycle operations:
//! - Launching a job pinned to a cpuset with an optional CFS quota
//! - Pausing, resuming and re-limiting running jobs
//! - Teardown (stop, kill, remove) and label-filtered listing
//! - A lazily decoded lifecycle event stream
//!
//! A mock implementation is provided for testing and development.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use coloc_reconcile::CoreSet;
use futures_core::Stream;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Errors from container runtime operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("image not found: {0}")]
    ImageNotFound(String),

    #[error("no such container: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("runtime API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("decode error: {0}")]
    Decode(String),

    /// Failure injected by the mock runtime.
    #[error("injected failure: {0}")]
    Injected(String),
}

/// Handle to a launched container.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerHandle {
    /// Runtime-assigned container ID.
    pub id: String,

    /// Container name (the job name).
    pub name: String,
}

/// Everything the runtime needs to launch one batch job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub cpuset: CoreSet,
    pub cpu_period_us: u64,
    /// CFS quota in microseconds per period; `-1` means unrestricted.
    pub cpu_quota_us: i64,
    pub labels: BTreeMap<String, String>,
}

/// Resource limit change for a running container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceUpdate {
    pub cpuset: Option<CoreSet>,
    pub cpu_period_us: Option<u64>,
    pub cpu_quota_us: Option<i64>,
}

impl ResourceUpdate {
    pub fn is_empty(&self) -> bool {
        self.cpuset.is_none() && self.cpu_quota_us.is_none()
    }
}

/// Container as reported by a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub handle: ContainerHandle,
    /// Runtime state (`created`, `running`, `paused`, `exited`, `dead`, ...).
    pub state: String,
}

impl ContainerSummary {
    /// Whether the container still holds cores.
    pub fn is_live(&self) -> bool {
        matches!(self.state.as_str(), "created" | "running" | "paused" | "restarting")
    }
}

/// One lifecycle event from the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeEvent {
    /// Object type (`container`, `image`, `network`, ...).
    pub kind: String,
    /// Action (`start`, `die`, `stop`, `pause`, ...).
    pub action: String,
    pub container_id: String,
    pub name: Option<String>,
    pub exit_code: Option<i64>,
}

impl RuntimeEvent {
    pub fn container(action: &str, handle: &ContainerHandle) -> Self {
        Self {
            kind: "container".to_string(),
            action: action.to_string(),
            container_id: handle.id.clone(),
            name: Some(handle.name.clone()),
            exit_code: None,
        }
    }

    pub fn with_exit_code(mut self, code: i64) -> Self {
        self.exit_code = Some(code);
        self
    }

    /// `type == container` and `action ∈ {die, stop}`.
    pub fn is_exit(&self) -> bool {
        self.kind == "container" && matches!(self.action.as_str(), "die" | "stop")
    }

    pub fn is_start(&self) -> bool {
        self.kind == "container" && self.action == "start"
    }
}

/// Lazy, unbounded event sequence; restartable only by resubscribing.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<RuntimeEvent, RuntimeError>> + Send>>;

/// Container runtime interface.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create and start a detached container.
    async fn run(&self, spec: &LaunchSpec) -> Result<ContainerHandle, RuntimeError>;

    async fn pause(&self, handle: &ContainerHandle) -> Result<(), RuntimeError>;

    async fn unpause(&self, handle: &ContainerHandle) -> Result<(), RuntimeError>;

    /// Change the cpuset and/or quota of a container.
    async fn update(
        &self,
        handle: &ContainerHandle,
        update: &ResourceUpdate,
    ) -> Result<(), RuntimeError>;

    /// Graceful stop, waiting at most `timeout` before the runtime kills.
    async fn stop(&self, handle: &ContainerHandle, timeout: Duration) -> Result<(), RuntimeError>;

    async fn kill(&self, handle: &ContainerHandle) -> Result<(), RuntimeError>;

    async fn remove(&self, handle: &ContainerHandle, force: bool) -> Result<(), RuntimeError>;

    /// Containers in any state carrying `label` (`key=value`).
    async fn list(&self, label: &str) -> Result<Vec<ContainerSummary>, RuntimeError>;

    /// Subscribe to container lifecycle events for containers carrying `label`.
    async fn events(&self, label: &str) -> Result<EventStream, RuntimeError>;
}

/// Split a `key=value` label selector.
pub fn split_label(label: &str) -> (String, String) {
    match label.split_once('=') {
        Some((k, v)) => (k.trim().to_string(), v.trim().to_string()),
        None => (label.trim().to_string(), String::new()),
    }
}

/// Best-effort stop and removal of every container carrying `label`.
///
/// Each container gets a graceful stop; a failed or hung stop falls back to
/// kill, and removal is always forced. Returns the number removed.
pub async fn remove_labelled(runtime: &dyn ContainerRuntime, label: &str, timeout: Duration) -> usize {
    let containers = match runtime.list(label).await {
        Ok(c) => c,
        Err(e) => {
            warn!(label = %label, error = %e, "Failed to list managed containers");
            return 0;
        }
    };

    let mut removed = 0;
    for container in containers {
        let handle = &container.handle;
        if container.is_live() {
            let grace = timeout + Duration::from_secs(5);
            let stopped = match tokio::time::timeout(grace, runtime.stop(handle, timeout)).await {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    warn!(container = %handle.name, error = %e, "Graceful stop failed");
                    false
                }
                Err(_) => {
                    warn!(container = %handle.name, "Graceful stop timed out");
                    false
                }
            };
            if !stopped {
                if let Err(e) = runtime.kill(handle).await {
                    warn!(container = %handle.name, error = %e, "Kill failed");
                }
            }
        }

        match runtime.remove(handle, true).await {
            Ok(()) | Err(RuntimeError::NotFound(_)) => {
                debug!(container = %handle.name, "Removed managed container");
                removed += 1;
            }
            Err(e) => warn!(container = %handle.name, error = %e, "Remove failed"),
        }
    }

    if removed > 0 {
        info!(label = %label, removed, "Cleared managed containers");
    }
    removed
}

// =============================================================================
// Mock Runtime
// =============================================================================

/// Runtime operation, used to inject failures and count calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeOp {
    Run,
    Pause,
    Unpause,
    Update,
    Stop,
    Kill,
    Remove,
    List,
    Events,
}

/// A call observed by the mock runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    Run {
        name: String,
        cpuset: CoreSet,
        cpu_quota_us: i64,
        threads: Option<String>,
    },
    Pause(String),
    Unpause(String),
    Update {
        name: String,
        cpuset: Option<CoreSet>,
        cpu_quota_us: Option<i64>,
    },
    Stop(String),
    Kill(String),
    Remove(String),
    List,
    Events,
}

impl RuntimeCall {
    pub fn op(&self) -> RuntimeOp {
        match self {
            RuntimeCall::Run { .. } => RuntimeOp::Run,
            RuntimeCall::Pause(_) => RuntimeOp::Pause,
            RuntimeCall::Unpause(_) => RuntimeOp::Unpause,
            RuntimeCall::Update { .. } => RuntimeOp::Update,
            RuntimeCall::Stop(_) => RuntimeOp::Stop,
            RuntimeCall::Kill(_) => RuntimeOp::Kill,
            RuntimeCall::Remove(_) => RuntimeOp::Remove,
            RuntimeCall::List => RuntimeOp::List,
            RuntimeCall::Events => RuntimeOp::Events,
        }
    }
}

#[derive(Debug, Clone)]
struct MockContainer {
    handle: ContainerHandle,
    labels: BTreeMap<String, String>,
    state: &'static str,
    cpuset: CoreSet,
}

#[derive(Default)]
struct MockInner {
    calls: Vec<RuntimeCall>,
    containers: HashMap<String, MockContainer>,
    failures: HashMap<RuntimeOp, u32>,
    failing_launches: HashSet<String>,
}

struct MockShared {
    inner: Mutex<MockInner>,
    events: Mutex<broadcast::Sender<RuntimeEvent>>,
    counter: AtomicU64,
    auto_exit: Option<Duration>,
}

/// Mock runtime for testing and development.
///
/// Tracks containers in memory, records every call, and publishes
/// lifecycle events to subscribers the way a real daemon would.
#[derive(Clone)]
pub struct MockRuntime {
    shared: Arc<MockShared>,
}

impl MockRuntime {
    /// Create a new mock runtime.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Create a mock runtime whose containers exit (code 0) after `delay`.
    pub fn with_auto_exit(delay: Duration) -> Self {
        Self::build(Some(delay))
    }

    fn build(auto_exit: Option<Duration>) -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            shared: Arc::new(MockShared {
                inner: Mutex::new(MockInner::default()),
                events: Mutex::new(tx),
                counter: AtomicU64::new(0),
                auto_exit,
            }),
        }
    }

    fn inner(&self) -> MutexGuard<'_, MockInner> {
        match self.shared.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn sender(&self) -> broadcast::Sender<RuntimeEvent> {
        match self.shared.events.lock() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Make the next `count` calls of `op` fail.
    pub fn fail_next(&self, op: RuntimeOp, count: u32) {
        *self.inner().failures.entry(op).or_default() += count;
    }

    /// Make every launch of the container `name` fail with a missing image.
    pub fn fail_launch_of(&self, name: &str) {
        self.inner().failing_launches.insert(name.to_string());
    }

    /// Every call so far, in order.
    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.inner().calls.clone()
    }

    pub fn count(&self, op: RuntimeOp) -> usize {
        self.inner().calls.iter().filter(|c| c.op() == op).count()
    }

    pub fn clear_calls(&self) {
        self.inner().calls.clear();
    }

    /// Current cpuset of the container called `name`.
    pub fn cpuset_of(&self, name: &str) -> Option<CoreSet> {
        self.inner()
            .containers
            .values()
            .find(|c| c.handle.name == name)
            .map(|c| c.cpuset.clone())
    }

    /// Runtime state of the container called `name`.
    pub fn state_of(&self, name: &str) -> Option<&'static str> {
        self.inner()
            .containers
            .values()
            .find(|c| c.handle.name == name)
            .map(|c| c.state)
    }

    /// Names of all containers the mock currently tracks.
    pub fn container_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner()
            .containers
            .values()
            .map(|c| c.handle.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Add a container as if left behind by an earlier session.
    pub fn seed_container(&self, name: &str, label: &str, state: &'static str) -> ContainerHandle {
        let handle = ContainerHandle {
            id: self.next_id(),
            name: name.to_string(),
        };
        let (k, v) = split_label(label);
        self.inner().containers.insert(
            handle.id.clone(),
            MockContainer {
                handle: handle.clone(),
                labels: BTreeMap::from([(k, v)]),
                state,
                cpuset: CoreSet::new(),
            },
        );
        handle
    }

    /// Publish an event to current subscribers.
    pub fn emit(&self, event: RuntimeEvent) {
        // No subscribers is fine.
        let _ = self.sender().send(event);
    }

    /// Mark the container `name` exited and publish its `die` event.
    pub fn exit(&self, name: &str, code: i64) -> bool {
        let handle = {
            let mut inner = self.inner();
            let Some(c) = inner.containers.values_mut().find(|c| c.handle.name == name) else {
                return false;
            };
            c.state = "exited";
            c.handle.clone()
        };
        self.emit(RuntimeEvent::container("die", &handle).with_exit_code(code));
        true
    }

    /// End every open event stream, as a daemon restart would.
    pub fn disconnect(&self) {
        let (tx, _) = broadcast::channel(256);
        match self.shared.events.lock() {
            Ok(mut g) => *g = tx,
            Err(poisoned) => *poisoned.into_inner() = tx,
        }
    }

    fn next_id(&self) -> String {
        let counter = self.shared.counter.fetch_add(1, Ordering::SeqCst);
        format!("mock_{:012x}", counter)
    }

    /// Record `call` and consume an injected failure for its op, if any.
    fn observe(&self, call: RuntimeCall) -> Result<(), RuntimeError> {
        let op = call.op();
        let mut inner = self.inner();
        inner.calls.push(call);
        if let Some(remaining) = inner.failures.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(RuntimeError::Injected(format!("{op:?}")));
            }
        }
        Ok(())
    }

    fn find(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        if self.inner().containers.contains_key(&handle.id) {
            Ok(())
        } else {
            Err(RuntimeError::NotFound(handle.name.clone()))
        }
    }

    fn set_state(&self, handle: &ContainerHandle, state: &'static str) {
        if let Some(c) = self.inner().containers.get_mut(&handle.id) {
            c.state = state;
        }
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn run(&self, spec: &LaunchSpec) -> Result<ContainerHandle, RuntimeError> {
        let threads = spec
            .command
            .iter()
            .position(|a| a == "-n")
            .and_then(|i| spec.command.get(i + 1))
            .cloned();
        self.observe(RuntimeCall::Run {
            name: spec.name.clone(),
            cpuset: spec.cpuset.clone(),
            cpu_quota_us: spec.cpu_quota_us,
            threads,
        })?;

        if self.inner().failing_launches.contains(&spec.name) {
            return Err(RuntimeError::ImageNotFound(spec.image.clone()));
        }

        let handle = ContainerHandle {
            id: self.next_id(),
            name: spec.name.clone(),
        };
        {
            let mut inner = self.inner();
            if inner
                .containers
                .values()
                .any(|c| c.handle.name == spec.name)
            {
                return Err(RuntimeError::Conflict(format!(
                    "container name {} already in use",
                    spec.name
                )));
            }
            inner.containers.insert(
                handle.id.clone(),
                MockContainer {
                    handle: handle.clone(),
                    labels: spec.labels.clone(),
                    state: "running",
                    cpuset: spec.cpuset.clone(),
                },
            );
        }

        debug!(container = %handle.name, id = %handle.id, "Mock container started");
        self.emit(RuntimeEvent::container("start", &handle));

        if let Some(delay) = self.shared.auto_exit {
            let runtime = self.clone();
            let name = handle.name.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                // Exit once unpaused; a frozen container makes no progress.
                while runtime.state_of(&name) == Some("paused") {
                    tokio::time::sleep(delay).await;
                }
                if runtime.state_of(&name) == Some("running") {
                    runtime.exit(&name, 0);
                }
            });
        }

        Ok(handle)
    }

    async fn pause(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        self.observe(RuntimeCall::Pause(handle.name.clone()))?;
        self.find(handle)?;
        self.set_state(handle, "paused");
        Ok(())
    }

    async fn unpause(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        self.observe(RuntimeCall::Unpause(handle.name.clone()))?;
        self.find(handle)?;
        self.set_state(handle, "running");
        Ok(())
    }

    async fn update(
        &self,
        handle: &ContainerHandle,
        update: &ResourceUpdate,
    ) -> Result<(), RuntimeError> {
        self.observe(RuntimeCall::Update {
            name: handle.name.clone(),
            cpuset: update.cpuset.clone(),
            cpu_quota_us: update.cpu_quota_us,
        })?;
        self.find(handle)?;
        if let Some(cpuset) = &update.cpuset {
            if let Some(c) = self.inner().containers.get_mut(&handle.id) {
                c.cpuset = cpuset.clone();
            }
        }
        Ok(())
    }

    async fn stop(&self, handle: &ContainerHandle, _timeout: Duration) -> Result<(), RuntimeError> {
        self.observe(RuntimeCall::Stop(handle.name.clone()))?;
        self.find(handle)?;
        self.set_state(handle, "exited");
        Ok(())
    }

    async fn kill(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        self.observe(RuntimeCall::Kill(handle.name.clone()))?;
        self.find(handle)?;
        self.set_state(handle, "exited");
        Ok(())
    }

    async fn remove(&self, handle: &ContainerHandle, force: bool) -> Result<(), RuntimeError> {
        self.observe(RuntimeCall::Remove(handle.name.clone()))?;
        let mut inner = self.inner();
        let state = inner.containers.get(&handle.id).map(|c| c.state);
        match state {
            None => Err(RuntimeError::NotFound(handle.name.clone())),
            Some(state) if state != "exited" && !force => Err(RuntimeError::Conflict(format!(
                "container {} is {state}",
                handle.name
            ))),
            Some(_) => {
                inner.containers.remove(&handle.id);
                Ok(())
            }
        }
    }

    async fn list(&self, label: &str) -> Result<Vec<ContainerSummary>, RuntimeError> {
        self.observe(RuntimeCall::List)?;
        let (key, value) = split_label(label);
        let mut found: Vec<ContainerSummary> = self
            .inner()
            .containers
            .values()
            .filter(|c| c.labels.get(&key) == Some(&value))
            .map(|c| ContainerSummary {
                handle: c.handle.clone(),
                state: c.state.to_string(),
            })
            .collect();
        found.sort_by(|a, b| a.handle.name.cmp(&b.handle.name));
        Ok(found)
    }

    async fn events(&self, _label: &str) -> Result<EventStream, RuntimeError> {
        self.observe(RuntimeCall::Events)?;
        let rx = self.sender().subscribe();
        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((Ok(event), rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Mock event subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn spec(name: &str) -> LaunchSpec {
        LaunchSpec {
            name: name.to_string(),
            image: format!("anakli/cca:parsec_{name}"),
            command: vec!["./run".into(), "-n".into(), "2".into()],
            cpuset: CoreSet::from([2, 3]),
            cpu_period_us: 100_000,
            cpu_quota_us: -1,
            labels: BTreeMap::from([("scheduler".to_string(), "true".to_string())]),
        }
    }

    #[tokio::test]
    async fn test_mock_runtime_lifecycle() {
        let runtime = MockRuntime::new();
        let handle = runtime.run(&spec("dedup")).await.unwrap();
        assert_eq!(runtime.state_of("dedup"), Some("running"));

        runtime.pause(&handle).await.unwrap();
        assert_eq!(runtime.state_of("dedup"), Some("paused"));
        runtime.unpause(&handle).await.unwrap();

        let update = ResourceUpdate {
            cpuset: Some(CoreSet::from([1, 2, 3])),
            ..Default::default()
        };
        runtime.update(&handle, &update).await.unwrap();
        assert_eq!(runtime.cpuset_of("dedup"), Some(CoreSet::from([1, 2, 3])));

        runtime.remove(&handle, true).await.unwrap();
        assert!(runtime.container_names().is_empty());
        assert_eq!(runtime.count(RuntimeOp::Run), 1);
        assert!(matches!(
            runtime.calls().first(),
            Some(RuntimeCall::Run { threads: Some(t), .. }) if t == "2"
        ));
    }

    #[tokio::test]
    async fn test_injected_failure_is_consumed() {
        let runtime = MockRuntime::new();
        let handle = runtime.run(&spec("vips")).await.unwrap();
        runtime.fail_next(RuntimeOp::Pause, 1);

        assert!(runtime.pause(&handle).await.is_err());
        assert!(runtime.pause(&handle).await.is_ok());
        assert_eq!(runtime.count(RuntimeOp::Pause), 2);
    }

    #[tokio::test]
    async fn test_events_reach_subscribers() {
        let runtime = MockRuntime::new();
        let mut events = runtime.events("scheduler=true").await.unwrap();
        runtime.run(&spec("radix")).await.unwrap();
        runtime.exit("radix", 3);

        let start = events.next().await.unwrap().unwrap();
        assert!(start.is_start());
        let die = events.next().await.unwrap().unwrap();
        assert!(die.is_exit());
        assert_eq!(die.exit_code, Some(3));
        assert_eq!(die.name.as_deref(), Some("radix"));
    }

    #[tokio::test]
    async fn test_disconnect_ends_streams() {
        let runtime = MockRuntime::new();
        let mut events = runtime.events("scheduler=true").await.unwrap();
        runtime.disconnect();
        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn test_remove_labelled_clears_leftovers() {
        let runtime = MockRuntime::new();
        runtime.seed_container("canneal", "scheduler=true", "running");
        runtime.seed_container("ferret", "scheduler=true", "exited");
        runtime.seed_container("unrelated", "other=1", "running");
        runtime.fail_next(RuntimeOp::Stop, 1);

        let removed = remove_labelled(&runtime, "scheduler=true", Duration::from_secs(5)).await;

        assert_eq!(removed, 2);
        assert_eq!(runtime.container_names(), vec!["unrelated".to_string()]);
        // The failed stop fell back to kill.
        assert_eq!(runtime.count(RuntimeOp::Kill), 1);
    }

    #[test]
    fn test_exit_event_filter() {
        let handle = ContainerHandle {
            id: "abc".into(),
            name: "vips".into(),
        };
        assert!(RuntimeEvent::container("die", &handle).is_exit());
        assert!(RuntimeEvent::container("stop", &handle).is_exit());
        assert!(!RuntimeEvent::container("pause", &handle).is_exit());

        let mut image = RuntimeEvent::container("die", &handle);
        image.kind = "image".into();
        assert!(!image.is_exit());
    }
}
