use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogOutput, LogsOptions,
    PruneContainersOptions, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
    UploadToContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::{API_DEFAULT_VERSION, ClientVersion, Docker};
use bytes::Bytes;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use super::{BackendError, ExecutionBackend, ExecutionHandle, LogStream, SandboxSummary};
use crate::bundle;
use crate::config::BackendConfig;
use crate::job::ResourceLimits;
use crate::relay::{LogFrame, LogSource, encode_frame};

const DEFAULT_SOCKET: &str = "unix:///var/run/docker.sock";
const MANAGED_LABEL: &str = "gradebox.managed";

const STATUS_NOT_MODIFIED: u16 = 304;
const STATUS_NOT_FOUND: u16 = 404;

/// Sandboxes are Docker containers
#[derive(Debug, Clone)]
pub struct DockerBackend {
    docker: Docker,
    stop_timeout: i64,
}

impl DockerBackend {
    /// Connects to the daemon named in `config`, falling back to `DOCKER_HOST`
    /// and then the local socket
    pub async fn connect(config: &BackendConfig) -> Result<Self, BackendError> {
        let host = config
            .host
            .clone()
            .or_else(|| std::env::var("DOCKER_HOST").ok())
            .unwrap_or_else(|| DEFAULT_SOCKET.to_string());

        let pinned = config
            .api_version
            .clone()
            .or_else(|| std::env::var("DOCKER_API_VERSION").ok())
            .map(|v| parse_api_version(&v))
            .transpose()?;
        let version = pinned.as_ref().unwrap_or(API_DEFAULT_VERSION);
        let timeout = config.request_timeout_secs;

        let docker = if host.starts_with("unix://") {
            Docker::connect_with_socket(&host, timeout, version)?
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(&host, timeout, version)?
        } else {
            return Err(BackendError::Transport(format!(
                "unsupported docker host {host}"
            )));
        };

        let docker = match pinned {
            Some(_) => docker,
            None => docker.negotiate_version().await?,
        };

        log::info!("Connected to docker daemon at {host}");
        Ok(Self::with_client(docker, config.stop_timeout_secs))
    }

    pub fn with_client(docker: Docker, stop_timeout: i64) -> Self {
        Self {
            docker,
            stop_timeout,
        }
    }
}

#[async_trait]
impl ExecutionBackend for DockerBackend {
    async fn create(
        &self,
        image: &str,
        command: &[String],
        limits: &ResourceLimits,
    ) -> Result<ExecutionHandle, BackendError> {
        let labels = HashMap::from([(MANAGED_LABEL.to_string(), "true".to_string())]);
        let config = Config {
            image: Some(image.to_string()),
            cmd: Some(command.to_vec()),
            labels: Some(labels),
            host_config: Some(HostConfig {
                memory: Some(i64::try_from(limits.memory.0).unwrap_or(i64::MAX)),
                nano_cpus: Some(limits.nano_cpus()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await?;
        for warning in &created.warnings {
            log::warn!("Docker warning while creating {}: {warning}", created.id);
        }

        Ok(ExecutionHandle::new(created.id))
    }

    async fn pull(&self, image: &str) -> Result<(), BackendError> {
        let (from_image, tag) = split_image_ref(image);
        log::debug!("Pulling image {from_image}:{tag}");

        let options = CreateImageOptions {
            from_image: from_image.to_string(),
            tag: tag.to_string(),
            ..Default::default()
        };
        let mut progress = self.docker.create_image(Some(options), None, None);
        while let Some(info) = progress.next().await {
            let info = info?;
            log::trace!(
                "Pull {image}: {} {}",
                info.status.unwrap_or_default(),
                info.progress.unwrap_or_default()
            );
        }

        Ok(())
    }

    async fn inject(
        &self,
        handle: &ExecutionHandle,
        bundle: &Path,
        destination: &str,
    ) -> Result<(), BackendError> {
        let archive = bundle::pack_directory_blocking(bundle).await?;

        let options = UploadToContainerOptions {
            path: destination.to_string(),
            no_overwrite_dir_non_dir: "false".to_string(),
            ..Default::default()
        };
        self.docker
            .upload_to_container(handle.as_str(), Some(options), archive)
            .await?;
        Ok(())
    }

    async fn start(&self, handle: &ExecutionHandle) -> Result<(), BackendError> {
        self.docker
            .start_container(handle.as_str(), None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn stream_logs(
        &self,
        handle: &ExecutionHandle,
        cancel: CancellationToken,
    ) -> Result<LogStream, BackendError> {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };

        let frames = self
            .docker
            .logs(handle.as_str(), Some(options))
            .map(|output| output.map_err(BackendError::from).and_then(reframe))
            .take_until(cancel.cancelled_owned());
        Ok(Box::pin(frames))
    }

    async fn stop(&self, handle: &ExecutionHandle) -> Result<(), BackendError> {
        let options = StopContainerOptions {
            t: self.stop_timeout,
        };
        let result = self
            .docker
            .stop_container(handle.as_str(), Some(options))
            .await;
        // 304: the container was not running
        tolerate_status(result, STATUS_NOT_MODIFIED)
    }

    async fn remove(
        &self,
        handle: &ExecutionHandle,
        force: bool,
        remove_volumes: bool,
    ) -> Result<(), BackendError> {
        let options = RemoveContainerOptions {
            force,
            v: remove_volumes,
            ..Default::default()
        };
        let result = self
            .docker
            .remove_container(handle.as_str(), Some(options))
            .await;
        // 404: already gone
        tolerate_status(result, STATUS_NOT_FOUND)
    }

    async fn list(&self) -> Result<Vec<SandboxSummary>, BackendError> {
        let options = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(options)).await?;

        Ok(containers
            .into_iter()
            .filter_map(|container| {
                let managed = container
                    .labels
                    .as_ref()
                    .is_some_and(|labels| labels.contains_key(MANAGED_LABEL));
                Some(SandboxSummary {
                    handle: ExecutionHandle::new(container.id?),
                    image: container.image,
                    state: container.state,
                    status: container.status,
                    managed,
                })
            })
            .collect())
    }

    async fn prune(&self) -> Result<Vec<ExecutionHandle>, BackendError> {
        let report = self
            .docker
            .prune_containers(None::<PruneContainersOptions<String>>)
            .await?;
        log::debug!(
            "Prune reclaimed {} bytes",
            report.space_reclaimed.unwrap_or_default()
        );

        Ok(report
            .containers_deleted
            .unwrap_or_default()
            .into_iter()
            .map(ExecutionHandle::new)
            .collect())
    }
}

impl From<DockerError> for BackendError {
    fn from(err: DockerError) -> Self {
        match err {
            DockerError::DockerResponseServerError {
                status_code: STATUS_NOT_FOUND,
                message,
            } => BackendError::NotFound(message),
            DockerError::DockerResponseServerError {
                status_code,
                message,
            } => BackendError::Rejected {
                status: status_code,
                message,
            },
            DockerError::IOError { err } => BackendError::Io(err),
            other => BackendError::Transport(other.to_string()),
        }
    }
}

/// Treats a response with `status` as success
fn tolerate_status(result: Result<(), DockerError>, status: u16) -> Result<(), BackendError> {
    match result {
        Err(DockerError::DockerResponseServerError { status_code, .. }) if status_code == status => {
            Ok(())
        }
        other => other.map_err(BackendError::from),
    }
}

/// The daemon hands back already split output; put it back on the wire format
/// the relay reads, so every backend produces the same byte stream.
fn reframe(output: LogOutput) -> Result<Bytes, BackendError> {
    let frame = match output {
        LogOutput::StdErr { message } => LogFrame::new(LogSource::Stderr, message),
        LogOutput::StdOut { message }
        | LogOutput::StdIn { message }
        | LogOutput::Console { message } => LogFrame::new(LogSource::Stdout, message),
    };
    Ok(encode_frame(frame)?)
}

/// Splits `repo[:tag]` into repository and tag, defaulting the tag to
/// `latest`. Digest references are passed through whole.
fn split_image_ref(image: &str) -> (&str, &str) {
    if image.contains('@') {
        return (image, "");
    }
    let name_start = image.rfind('/').map_or(0, |i| i + 1);
    match image[name_start..].rfind(':') {
        Some(i) => (&image[..name_start + i], &image[name_start + i + 1..]),
        None => (image, "latest"),
    }
}

fn parse_api_version(version: &str) -> Result<ClientVersion, BackendError> {
    let invalid = || BackendError::Transport(format!("invalid docker API version {version:?}"));

    let (major, minor) = version
        .trim_start_matches('v')
        .split_once('.')
        .ok_or_else(invalid)?;
    Ok(ClientVersion {
        major_version: major.parse().map_err(|_| invalid())?,
        minor_version: minor.parse().map_err(|_| invalid())?,
    })
}
