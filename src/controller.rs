//! Drives one job through create → inject → start → observe → stop → remove
//!
//! Once a sandbox exists it is owned by a [`SandboxGuard`], and every path out
//! of [`Controller::run`] goes through its release. Cleanup failures are
//! reported next to the job outcome and never replace it.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::{BackendError, ExecutionBackend, ExecutionHandle};
use crate::config::SandboxConfig;
use crate::job::{AbortReason, CleanupReport, FailureKind, Job, JobOutcome, JobReport};
use crate::lifecycle::{Lifecycle, LifecycleState};
use crate::relay::{LogLine, RelayExit, spawn_relay};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Create,
    Inject,
    Start,
    Stop,
    Remove,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Create => "create",
            Stage::Inject => "inject",
            Stage::Start => "start",
            Stage::Stop => "stop",
            Stage::Remove => "remove",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("image {image} is unavailable: {source}")]
    ImageUnavailable {
        image: String,
        #[source]
        source: BackendError,
    },

    #[error("{stage} failed: {source}")]
    ProvisionFailure {
        stage: Stage,
        #[source]
        source: BackendError,
    },

    #[error("log stream failed: {0}")]
    StreamFailure(String),

    #[error("{stage} of sandbox {handle} failed: {source}")]
    CleanupFailure {
        stage: Stage,
        handle: ExecutionHandle,
        #[source]
        source: BackendError,
    },
}

impl JobError {
    fn into_outcome(self) -> JobOutcome {
        let kind = match self {
            JobError::ImageUnavailable { .. } => FailureKind::ImageUnavailable,
            _ => FailureKind::ProvisionFailure,
        };
        JobOutcome::Failed {
            kind,
            reason: self.to_string(),
        }
    }
}

/// What happened between start and cleanup
struct Observation {
    outcome: JobOutcome,
    stream_failure: Option<String>,
}

impl Observation {
    fn finished(outcome: JobOutcome, stream_failure: Option<String>) -> Self {
        Self {
            outcome,
            stream_failure,
        }
    }

    fn failed(job: &Job, err: JobError) -> Self {
        log::error!("Job {}: {err}", job.id);
        Self::finished(err.into_outcome(), None)
    }
}

enum Event {
    Relay(RelayExit),
    Cancelled,
    Deadline,
}

/// Runs jobs against one backend; holds no per-job state, so a single
/// controller can drive any number of concurrent jobs.
pub struct Controller {
    backend: Arc<dyn ExecutionBackend>,
    settings: SandboxConfig,
}

impl Controller {
    pub fn new(backend: Arc<dyn ExecutionBackend>, settings: SandboxConfig) -> Self {
        Self { backend, settings }
    }

    /// Runs `job` to completion, forwarding its output into `lines`
    ///
    /// `cancel` aborts the job early; the sandbox is still cleaned up.
    pub async fn run(
        &self,
        job: &Job,
        lines: UnboundedSender<LogLine>,
        cancel: CancellationToken,
    ) -> JobReport {
        let started_at = Utc::now();
        let mut lifecycle = Lifecycle::new(&job.id);
        log::info!("Job {}: provisioning sandbox from {}", job.id, job.image);

        let handle = match self.provision(job).await {
            Ok(handle) => handle,
            Err(e) => {
                log::error!("Job {}: {e}", job.id);
                lifecycle.advance(LifecycleState::Failed);
                return JobReport {
                    job_id: job.id.clone(),
                    outcome: e.into_outcome(),
                    cleanup: CleanupReport::default(),
                    final_state: lifecycle.state(),
                    handle: None,
                    stream_failure: None,
                    started_at,
                    finished_at: Utc::now(),
                };
            }
        };
        lifecycle.advance(LifecycleState::Created);
        log::info!("Job {}: created sandbox {handle}", job.id);

        let mut sandbox = SandboxGuard::new(
            Arc::clone(&self.backend),
            handle.clone(),
            &job.id,
            self.settings.remove_volumes,
        );
        let observation = self
            .execute(job, &handle, &mut lifecycle, lines, cancel)
            .await;
        let cleanup = sandbox.release(&mut lifecycle).await;

        match cleanup.failures() {
            0 => log::info!(
                "Job {}: finished with {:?}, cleanup clean",
                job.id,
                observation.outcome
            ),
            failures => log::warn!(
                "Job {}: finished with {:?}, {failures} cleanup failure(s){}",
                job.id,
                observation.outcome,
                if cleanup.leaked() { ", sandbox leaked" } else { "" }
            ),
        }

        JobReport {
            job_id: job.id.clone(),
            outcome: observation.outcome,
            cleanup,
            final_state: lifecycle.state(),
            handle: Some(handle),
            stream_failure: observation.stream_failure,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Creates the sandbox, pulling the image and retrying once if it is missing
    async fn provision(&self, job: &Job) -> Result<ExecutionHandle, JobError> {
        let first = self
            .backend
            .create(&job.image, &job.command, &job.limits)
            .await;

        let source = match first {
            Ok(handle) => return Ok(handle),
            Err(source) if source.is_not_found() => source,
            Err(source) => {
                return Err(JobError::ProvisionFailure {
                    stage: Stage::Create,
                    source,
                });
            }
        };

        log::warn!(
            "Job {}: image {} not found ({source}), pulling from registry",
            job.id,
            job.image
        );
        self.backend
            .pull(&job.image)
            .await
            .map_err(|source| JobError::ImageUnavailable {
                image: job.image.clone(),
                source,
            })?;

        self.backend
            .create(&job.image, &job.command, &job.limits)
            .await
            .map_err(|source| {
                if source.is_not_found() {
                    JobError::ImageUnavailable {
                        image: job.image.clone(),
                        source,
                    }
                } else {
                    JobError::ProvisionFailure {
                        stage: Stage::Create,
                        source,
                    }
                }
            })
    }

    async fn execute(
        &self,
        job: &Job,
        handle: &ExecutionHandle,
        lifecycle: &mut Lifecycle,
        lines: UnboundedSender<LogLine>,
        cancel: CancellationToken,
    ) -> Observation {
        if let Err(source) = self
            .backend
            .inject(handle, &job.bundle, &self.settings.destination)
            .await
        {
            let stage = Stage::Inject;
            return Observation::failed(job, JobError::ProvisionFailure { stage, source });
        }
        lifecycle.advance(LifecycleState::Populated);
        log::debug!(
            "Job {}: injected {} into {}",
            job.id,
            job.bundle.display(),
            self.settings.destination
        );

        if let Err(source) = self.backend.start(handle).await {
            let stage = Stage::Start;
            return Observation::failed(job, JobError::ProvisionFailure { stage, source });
        }
        lifecycle.advance(LifecycleState::Running);
        log::info!(
            "Job {}: sandbox {handle} running, budget {:?}",
            job.id,
            job.limits.timeout
        );

        self.observe(job, handle, lines, cancel).await
    }

    /// Relays output until the process exits, the budget runs out, or the
    /// caller cancels. The relay is signalled but never awaited after that.
    async fn observe(
        &self,
        job: &Job,
        handle: &ExecutionHandle,
        lines: UnboundedSender<LogLine>,
        cancel: CancellationToken,
    ) -> Observation {
        let relay_cancel = cancel.child_token();
        // Stops the relay even if this future is dropped mid-observation
        let _relay_guard = relay_cancel.clone().drop_guard();
        let mut stream_failure = None;

        let mut relay = match self.backend.stream_logs(handle, relay_cancel.clone()).await {
            Ok(stream) => Some(spawn_relay(stream, relay_cancel.clone(), lines)),
            Err(e) => {
                let err = JobError::StreamFailure(e.to_string());
                log::error!("Job {}: {err}, waiting out the budget", job.id);
                stream_failure = Some(err.to_string());
                None
            }
        };

        let deadline = tokio::time::sleep(job.limits.timeout);
        tokio::pin!(deadline);

        loop {
            let event = tokio::select! {
                biased;
                exit = wait_relay(&mut relay) => Event::Relay(exit),
                _ = cancel.cancelled() => Event::Cancelled,
                _ = &mut deadline => Event::Deadline,
            };

            match event {
                Event::Relay(RelayExit::Ended) => {
                    log::info!("Job {}: sandboxed process exited", job.id);
                    return Observation::finished(JobOutcome::Succeeded, stream_failure);
                }
                Event::Relay(RelayExit::Cancelled) | Event::Cancelled => {
                    relay_cancel.cancel();
                    log::warn!("Job {}: cancelled by caller", job.id);
                    let reason = AbortReason::Cancelled;
                    return Observation::finished(JobOutcome::Aborted { reason }, stream_failure);
                }
                Event::Relay(exit) => {
                    let reason = match exit {
                        RelayExit::Failed(reason) => reason,
                        _ => "log consumer went away".to_string(),
                    };
                    let err = JobError::StreamFailure(reason);
                    log::warn!("Job {}: {err}, waiting out the budget", job.id);
                    stream_failure = Some(err.to_string());
                    relay = None;
                }
                Event::Deadline => {
                    // Only a natural end of the stream proves the process exited,
                    // so a lost stream still times out here
                    relay_cancel.cancel();
                    log::warn!(
                        "Job {}: timed out after {:?}, cancelling log relay",
                        job.id,
                        job.limits.timeout
                    );
                    let reason = AbortReason::Timeout;
                    return Observation::finished(JobOutcome::Aborted { reason }, stream_failure);
                }
            }
        }
    }
}

async fn wait_relay(relay: &mut Option<JoinHandle<RelayExit>>) -> RelayExit {
    match relay {
        Some(task) => task
            .await
            .unwrap_or_else(|e| RelayExit::Failed(format!("relay task failed: {e}"))),
        None => std::future::pending().await,
    }
}

/// Owns a provisioned sandbox until it has been stopped and removed
///
/// Dropping the guard without calling [`SandboxGuard::release`] (for example
/// when the job future is dropped) spawns a forced removal on the current
/// runtime.
struct SandboxGuard {
    backend: Arc<dyn ExecutionBackend>,
    handle: ExecutionHandle,
    job_id: String,
    remove_volumes: bool,
    released: Option<CleanupReport>,
}

impl SandboxGuard {
    fn new(
        backend: Arc<dyn ExecutionBackend>,
        handle: ExecutionHandle,
        job_id: &str,
        remove_volumes: bool,
    ) -> Self {
        Self {
            backend,
            handle,
            job_id: job_id.to_string(),
            remove_volumes,
            released: None,
        }
    }

    /// Stops then force-removes the sandbox. Later calls return the first report.
    async fn release(&mut self, lifecycle: &mut Lifecycle) -> CleanupReport {
        if let Some(report) = &self.released {
            return report.clone();
        }

        let mut report = CleanupReport::default();

        match self.backend.stop(&self.handle).await {
            Ok(()) => {
                lifecycle.advance(LifecycleState::Stopped);
            }
            Err(source) => {
                let err = self.cleanup_failure(Stage::Stop, source);
                log::warn!("Job {}: {err}", self.job_id);
                report.stop_error = Some(err.to_string());
            }
        }

        match self
            .backend
            .remove(&self.handle, true, self.remove_volumes)
            .await
        {
            Ok(()) => {
                lifecycle.advance(LifecycleState::Removed);
                log::debug!("Job {}: sandbox {} removed", self.job_id, self.handle);
            }
            Err(source) => {
                let err = self.cleanup_failure(Stage::Remove, source);
                log::error!(
                    "Job {}: {err}; sandbox {} is leaked",
                    self.job_id,
                    self.handle.as_str()
                );
                report.remove_error = Some(err.to_string());
                lifecycle.advance(LifecycleState::Failed);
            }
        }

        self.released = Some(report.clone());
        report
    }

    fn cleanup_failure(&self, stage: Stage, source: BackendError) -> JobError {
        JobError::CleanupFailure {
            stage,
            handle: self.handle.clone(),
            source,
        }
    }
}

impl Drop for SandboxGuard {
    fn drop(&mut self) {
        if self.released.is_some() {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log::error!(
                "Job {}: sandbox {} dropped outside a runtime and is leaked",
                self.job_id,
                self.handle.as_str()
            );
            return;
        };

        log::warn!(
            "Job {}: sandbox {} dropped before cleanup, forcing removal",
            self.job_id,
            self.handle
        );
        let backend = Arc::clone(&self.backend);
        let handle = self.handle.clone();
        let job_id = self.job_id.clone();
        let remove_volumes = self.remove_volumes;
        runtime.spawn(async move {
            if let Err(e) = backend.remove(&handle, true, remove_volumes).await {
                log::error!(
                    "Job {job_id}: forced removal of sandbox {} failed: {e}",
                    handle.as_str()
                );
            }
        });
    }
}
