//! Docker Engine HTTP API client.
//!
//! This module provides an HTTP client for the Engine API on the daemon's
//! Unix socket. It covers container create/start, pause/unpause, resource
//! updates, teardown, listing, image pulls and the event stream.
//!
//! Reference: https://docs.docker.com/engine/api/v1.41/

use std::path::Path;

use coloc_events::percent_encode;
use hyper::body::Bytes;
use hyper::{Body, Client, Method, Request, Response, StatusCode};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, error};

use super::types::{
    ContainerListEntry, CreateContainerRequest, CreateContainerResponse, ErrorResponse, Filters,
    HostConfig, PullProgress,
};
use crate::runtime::RuntimeError;

/// API version prefix every request is sent under.
const API_VERSION: &str = "/v1.41";

/// Errors from the Docker Engine API.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Socket not found: {0}")]
    SocketNotFound(String),
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<hyper::http::Error> for ApiError {
    fn from(err: hyper::http::Error) -> Self {
        ApiError::Api {
            status: 0,
            message: err.to_string(),
        }
    }
}

impl From<ApiError> for RuntimeError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Api {
                status: 404,
                message,
            } if message.contains("No such image") => RuntimeError::ImageNotFound(message),
            ApiError::Api {
                status: 404,
                message,
            } => RuntimeError::NotFound(message),
            ApiError::Api {
                status: 409,
                message,
            } => RuntimeError::Conflict(message),
            ApiError::Api { status, message } => RuntimeError::Api { status, message },
            ApiError::Http(e) => RuntimeError::Transport(e.to_string()),
            ApiError::SocketNotFound(path) => {
                RuntimeError::Transport(format!("socket not found: {path}"))
            }
            ApiError::Json(e) => RuntimeError::Decode(e.to_string()),
        }
    }
}

/// Docker Engine API client for Unix socket communication.
pub struct DockerClient {
    socket_path: String,
    client: Client<UnixConnector>,
}

impl DockerClient {
    /// Create a new client for the given socket path.
    pub fn new<P: AsRef<Path>>(socket_path: P) -> Self {
        let socket_path = socket_path.as_ref().to_string_lossy().to_string();
        let client = Client::unix();
        Self {
            socket_path,
            client,
        }
    }

    /// Check if the socket exists.
    pub fn socket_exists(&self) -> bool {
        Path::new(&self.socket_path).exists()
    }

    /// Create (but do not start) a named container.
    pub async fn create_container(
        &self,
        name: &str,
        request: &CreateContainerRequest,
    ) -> Result<CreateContainerResponse, ApiError> {
        let path = format!("/containers/create?name={}", percent_encode(name));
        let body = serde_json::to_vec(request)?;
        self.call_json(Method::POST, &path, Some(body)).await
    }

    pub async fn start_container(&self, id: &str) -> Result<(), ApiError> {
        self.call(Method::POST, &format!("/containers/{id}/start"), None)
            .await
            .map(drop)
    }

    pub async fn pause_container(&self, id: &str) -> Result<(), ApiError> {
        self.call(Method::POST, &format!("/containers/{id}/pause"), None)
            .await
            .map(drop)
    }

    pub async fn unpause_container(&self, id: &str) -> Result<(), ApiError> {
        self.call(Method::POST, &format!("/containers/{id}/unpause"), None)
            .await
            .map(drop)
    }

    /// Change cpuset and CFS limits of a container.
    pub async fn update_container(&self, id: &str, update: &HostConfig) -> Result<(), ApiError> {
        let body = serde_json::to_vec(update)?;
        self.call(Method::POST, &format!("/containers/{id}/update"), Some(body))
            .await
            .map(drop)
    }

    /// Stop, letting the daemon kill after `timeout_secs`.
    pub async fn stop_container(&self, id: &str, timeout_secs: u64) -> Result<(), ApiError> {
        self.call(
            Method::POST,
            &format!("/containers/{id}/stop?t={timeout_secs}"),
            None,
        )
        .await
        .map(drop)
    }

    pub async fn kill_container(&self, id: &str) -> Result<(), ApiError> {
        self.call(Method::POST, &format!("/containers/{id}/kill"), None)
            .await
            .map(drop)
    }

    pub async fn remove_container(&self, id: &str, force: bool) -> Result<(), ApiError> {
        self.call(
            Method::DELETE,
            &format!("/containers/{id}?force={force}"),
            None,
        )
        .await
        .map(drop)
    }

    /// Containers in any state matching `filters`.
    pub async fn list_containers(
        &self,
        filters: &Filters,
    ) -> Result<Vec<ContainerListEntry>, ApiError> {
        let filters = serde_json::to_string(filters)?;
        let path = format!("/containers/json?all=true&filters={}", percent_encode(&filters));
        self.call_json(Method::GET, &path, None).await
    }

    /// Pull `image` (`repo[:tag]`), waiting for the pull to finish.
    pub async fn pull_image(&self, image: &str) -> Result<(), ApiError> {
        let (repo, tag) = split_image(image);
        let path = format!(
            "/images/create?fromImage={}&tag={}",
            percent_encode(repo),
            percent_encode(tag)
        );
        let progress = self.call(Method::POST, &path, None).await?;

        // Pull failures arrive as an error line inside a 200 stream.
        for line in progress.split(|b| *b == b'\n') {
            if let Ok(PullProgress {
                error: Some(message),
            }) = serde_json::from_slice::<PullProgress>(line)
            {
                return Err(ApiError::Api {
                    status: 500,
                    message,
                });
            }
        }
        Ok(())
    }

    /// Open the event stream; the body yields newline-delimited JSON.
    pub async fn events(&self, filters: &Filters) -> Result<Body, ApiError> {
        let filters = serde_json::to_string(filters)?;
        let path = format!("/events?filters={}", percent_encode(&filters));
        let response = self.send(Method::GET, &path, None).await?;
        let status = response.status();
        if status.is_success() {
            Ok(response.into_body())
        } else {
            Err(Self::error_from(status, response).await)
        }
    }

    /// Perform a request and return the raw response.
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<Response<Body>, ApiError> {
        if !self.socket_exists() {
            return Err(ApiError::SocketNotFound(self.socket_path.clone()));
        }

        let uri = Uri::new(&self.socket_path, &format!("{API_VERSION}{path}"));
        debug!(method = %method, path = path, "Docker API request");

        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("Accept", "application/json");
        let body = match body {
            Some(bytes) => {
                builder = builder.header("Content-Type", "application/json");
                Body::from(bytes)
            }
            None => Body::empty(),
        };

        Ok(self.client.request(builder.body(body)?).await?)
    }

    /// Perform a request and return the body of a successful response.
    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<Bytes, ApiError> {
        let response = self.send(method, path, body).await?;
        let status = response.status();

        // 304: already in the requested state.
        if status.is_success() || status == StatusCode::NOT_MODIFIED {
            Ok(hyper::body::to_bytes(response.into_body()).await?)
        } else {
            Err(Self::error_from(status, response).await)
        }
    }

    async fn call_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<T, ApiError> {
        let bytes = self.call(method, path, body).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn error_from(status: StatusCode, response: Response<Body>) -> ApiError {
        let bytes = match hyper::body::to_bytes(response.into_body()).await {
            Ok(b) => b,
            Err(e) => return ApiError::Http(e),
        };
        let message = match serde_json::from_slice::<ErrorResponse>(&bytes) {
            Ok(err) => err.message,
            Err(_) => String::from_utf8_lossy(&bytes).trim().to_string(),
        };
        if status != StatusCode::NOT_FOUND {
            error!(status = %status, message = %message, "Docker API error");
        }
        ApiError::Api {
            status: status.as_u16(),
            message,
        }
    }
}

/// Split `repo[:tag]`, defaulting the tag to `latest`.
pub fn split_image(image: &str) -> (&str, &str) {
    let name_start = image.rfind('/').map(|i| i + 1).unwrap_or(0);
    match image[name_start..].rfind(':') {
        Some(i) => (&image[..name_start + i], &image[name_start + i + 1..]),
        None => (image, "latest"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_image() {
        assert_eq!(
            split_image("anakli/cca:parsec_dedup"),
            ("anakli/cca", "parsec_dedup")
        );
        assert_eq!(split_image("registry:5000/cca"), ("registry:5000/cca", "latest"));
        assert_eq!(split_image("busybox"), ("busybox", "latest"));
    }

    #[test]
    fn test_error_mapping() {
        let missing = ApiError::Api {
            status: 404,
            message: "No such image: anakli/cca:parsec_vips".into(),
        };
        assert!(matches!(
            RuntimeError::from(missing),
            RuntimeError::ImageNotFound(_)
        ));

        let gone = ApiError::Api {
            status: 404,
            message: "No such container: abc".into(),
        };
        assert!(matches!(RuntimeError::from(gone), RuntimeError::NotFound(_)));

        let busy = ApiError::Api {
            status: 409,
            message: "Conflict. The container name \"/vips\" is already in use".into(),
        };
        assert!(matches!(RuntimeError::from(busy), RuntimeError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_missing_socket() {
        let client = DockerClient::new("/nonexistent/docker.sock");
        assert!(!client.socket_exists());
        let err = client.pause_container("abc").await.unwrap_err();
        assert!(matches!(err, ApiError::SocketNotFound(_)));
    }
}
