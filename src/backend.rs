mod docker;

pub use docker::DockerBackend;

use std::fmt;
use std::io;
use std::path::Path;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::job::ResourceLimits;

/// Raw multiplexed log bytes, see [`crate::relay::MultiplexedCodec`] for the framing
pub type LogStream = Pin<Box<dyn Stream<Item = Result<Bytes, BackendError>> + Send>>;

/// The backend's identifier for one provisioned sandbox
#[derive(Serialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct ExecutionHandle(String);

impl ExecutionHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 characters, the way container ids are usually shown
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(12)
            .map_or(self.0.len(), |(i, _)| i);
        &self.0[..end]
    }
}

impl fmt::Display for ExecutionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short())
    }
}

/// One live sandbox as reported by [`ExecutionBackend::list`]
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct SandboxSummary {
    pub handle: ExecutionHandle,
    pub image: Option<String>,
    pub state: Option<String>,
    pub status: Option<String>,
    /// Created by this agent (carries the managed label)
    pub managed: bool,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("backend rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl BackendError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound(_))
    }
}

impl From<BackendError> for io::Error {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Io(e) => e,
            other => io::Error::other(other),
        }
    }
}

/// Primitive operations against a service that provisions sandboxes
///
/// Every call may fail independently. Implementations must make `stop`
/// idempotent: stopping a sandbox that is not running succeeds.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Provisions a sandbox; `NotFound` means the image is not available locally
    async fn create(
        &self,
        image: &str,
        command: &[String],
        limits: &ResourceLimits,
    ) -> Result<ExecutionHandle, BackendError>;

    /// Fetches the image so a following `create` can find it
    async fn pull(&self, image: &str) -> Result<(), BackendError>;

    /// Copies the bundle directory into the sandbox at `destination`
    async fn inject(
        &self,
        handle: &ExecutionHandle,
        bundle: &Path,
        destination: &str,
    ) -> Result<(), BackendError>;

    async fn start(&self, handle: &ExecutionHandle) -> Result<(), BackendError>;

    /// Follows combined stdout/stderr until the process exits or `cancel` fires
    async fn stream_logs(
        &self,
        handle: &ExecutionHandle,
        cancel: CancellationToken,
    ) -> Result<LogStream, BackendError>;

    async fn stop(&self, handle: &ExecutionHandle) -> Result<(), BackendError>;

    async fn remove(
        &self,
        handle: &ExecutionHandle,
        force: bool,
        remove_volumes: bool,
    ) -> Result<(), BackendError>;

    async fn list(&self) -> Result<Vec<SandboxSummary>, BackendError>;

    /// Deletes every sandbox that is not running, returning the removed handles
    async fn prune(&self) -> Result<Vec<ExecutionHandle>, BackendError>;
}
