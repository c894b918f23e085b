//! `ContainerRuntime` backed by the Docker Engine API.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures_core::Stream;
use futures_util::StreamExt;
use hyper::body::Bytes;
use tracing::{info, warn};

use super::api::DockerClient;
use super::types::{CreateContainerRequest, EventMessage, Filters, HostConfig, MIN_CPU_QUOTA_US};
use crate::runtime::{
    ContainerHandle, ContainerRuntime, ContainerSummary, EventStream, LaunchSpec, ResourceUpdate,
    RuntimeError, RuntimeEvent,
};

/// Docker-backed container runtime.
pub struct DockerRuntime {
    client: DockerClient,
}

impl DockerRuntime {
    pub fn new<P: AsRef<Path>>(socket_path: P) -> Self {
        Self {
            client: DockerClient::new(socket_path),
        }
    }

    async fn create(&self, spec: &LaunchSpec) -> Result<String, RuntimeError> {
        let request = CreateContainerRequest {
            image: spec.image.clone(),
            cmd: spec.command.clone(),
            labels: spec.labels.clone(),
            host_config: HostConfig {
                cpuset_cpus: Some(spec.cpuset.to_string()),
                cpu_period: Some(spec.cpu_period_us),
                // Unlimited is the default at create time.
                cpu_quota: (spec.cpu_quota_us > 0).then(|| spec.cpu_quota_us.max(MIN_CPU_QUOTA_US)),
            },
        };

        let created = match self.client.create_container(&spec.name, &request).await {
            Err(e) if e.status() == Some(404) => {
                info!(image = %spec.image, "Image missing, pulling");
                self.client.pull_image(&spec.image).await?;
                self.client.create_container(&spec.name, &request).await?
            }
            other => other?,
        };

        for warning in created.warnings.iter().flatten() {
            warn!(container = %spec.name, warning = %warning, "Docker create warning");
        }
        Ok(created.id)
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn run(&self, spec: &LaunchSpec) -> Result<ContainerHandle, RuntimeError> {
        let id = self.create(spec).await?;

        if let Err(e) = self.client.start_container(&id).await {
            // Do not leave a created-but-dead container holding the name.
            if let Err(cleanup) = self.client.remove_container(&id, true).await {
                warn!(container = %spec.name, error = %cleanup, "Failed to remove unstarted container");
            }
            return Err(e.into());
        }

        Ok(ContainerHandle {
            id,
            name: spec.name.clone(),
        })
    }

    async fn pause(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        Ok(self.client.pause_container(&handle.id).await?)
    }

    async fn unpause(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        Ok(self.client.unpause_container(&handle.id).await?)
    }

    async fn update(
        &self,
        handle: &ContainerHandle,
        update: &ResourceUpdate,
    ) -> Result<(), RuntimeError> {
        if update.is_empty() {
            return Ok(());
        }
        let host = HostConfig {
            cpuset_cpus: update.cpuset.as_ref().map(ToString::to_string),
            cpu_period: update.cpu_period_us,
            cpu_quota: update
                .cpu_quota_us
                .map(|q| if q > 0 { q.max(MIN_CPU_QUOTA_US) } else { -1 }),
        };
        Ok(self.client.update_container(&handle.id, &host).await?)
    }

    async fn stop(&self, handle: &ContainerHandle, timeout: Duration) -> Result<(), RuntimeError> {
        Ok(self
            .client
            .stop_container(&handle.id, timeout.as_secs())
            .await?)
    }

    async fn kill(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        Ok(self.client.kill_container(&handle.id).await?)
    }

    async fn remove(&self, handle: &ContainerHandle, force: bool) -> Result<(), RuntimeError> {
        Ok(self.client.remove_container(&handle.id, force).await?)
    }

    async fn list(&self, label: &str) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let filters = Filters::new().with("label", label);
        let entries = self.client.list_containers(&filters).await?;
        Ok(entries
            .into_iter()
            .map(|e| ContainerSummary {
                handle: ContainerHandle {
                    name: e.name(),
                    id: e.id,
                },
                state: e.state,
            })
            .collect())
    }

    async fn events(&self, label: &str) -> Result<EventStream, RuntimeError> {
        let filters = Filters::new()
            .with("type", "container")
            .with("label", label);
        let body = self.client.events(&filters).await?;
        Ok(decode_events(body))
    }
}

/// Decode a newline-delimited JSON byte stream into runtime events.
pub fn decode_events<S, E>(body: S) -> EventStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
    E: std::fmt::Display + Send,
{
    let stream = futures_util::stream::unfold((body, Vec::new()), |(mut body, mut buf)| async move {
        loop {
            if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                match decode_event_line(&line) {
                    Some(item) => return Some((item, (body, buf))),
                    None => continue,
                }
            }
            match body.next().await {
                Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    let err = RuntimeError::Transport(e.to_string());
                    return Some((Err(err), (body, buf)));
                }
                None => {
                    // A final message may arrive without its newline.
                    if buf.is_empty() {
                        return None;
                    }
                    let line = std::mem::take(&mut buf);
                    match decode_event_line(&line) {
                        Some(item) => return Some((item, (body, buf))),
                        None => return None,
                    }
                }
            }
        }
    });
    Box::pin(stream)
}

/// One event line; `None` for blank lines.
fn decode_event_line(line: &[u8]) -> Option<Result<RuntimeEvent, RuntimeError>> {
    let text = std::str::from_utf8(line).ok()?.trim();
    if text.is_empty() {
        return None;
    }
    let message = match serde_json::from_str::<EventMessage>(text) {
        Ok(m) => m,
        Err(e) => return Some(Err(RuntimeError::Decode(e.to_string()))),
    };
    let attributes = message.actor.attributes;
    Some(Ok(RuntimeEvent {
        kind: message.kind,
        action: message.action,
        container_id: message.actor.id,
        name: attributes.get("name").cloned(),
        exit_code: attributes.get("exitCode").and_then(|c| c.parse().ok()),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(parts: &[&'static str]) -> impl Stream<Item = Result<Bytes, String>> + Send + Unpin {
        futures_util::stream::iter(
            parts
                .iter()
                .map(|p| Ok(Bytes::from_static(p.as_bytes())))
                .collect::<Vec<_>>(),
        )
    }

    #[tokio::test]
    async fn test_decode_split_messages() {
        let body = chunks(&[
            r#"{"Type":"container","Action":"start","Actor":{"ID":"a1","Attributes":{"name":"dedup"}}}"#,
            "\n{\"Type\":\"container\",\"Action\":\"die\",",
            r#""Actor":{"ID":"a1","Attributes":{"name":"dedup","exitCode":"0"}}}"#,
            "\n\n",
        ]);
        let events: Vec<_> = decode_events(body).collect().await;

        assert_eq!(events.len(), 2);
        let start = events[0].as_ref().unwrap();
        assert!(start.is_start());
        let die = events[1].as_ref().unwrap();
        assert!(die.is_exit());
        assert_eq!(die.container_id, "a1");
        assert_eq!(die.name.as_deref(), Some("dedup"));
        assert_eq!(die.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_decode_error_does_not_end_stream() {
        let body = chunks(&[
            "not json\n",
            r#"{"Type":"container","Action":"stop","Actor":{"ID":"b2"}}"#,
        ]);
        let events: Vec<_> = decode_events(body).collect().await;

        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], Err(RuntimeError::Decode(_))));
        let stop = events[1].as_ref().unwrap();
        assert!(stop.is_exit());
        assert_eq!(stop.exit_code, None);
    }

    #[tokio::test]
    async fn test_unreachable_daemon() {
        let runtime = DockerRuntime::new("/nonexistent/docker.sock");
        assert!(matches!(
            runtime.list("scheduler=true").await,
            Err(RuntimeError::Transport(_))
        ));
    }
}
