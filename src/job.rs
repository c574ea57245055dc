use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::ExecutionHandle;
use crate::lifecycle::LifecycleState;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteSize(pub u64);

/// Resource ceilings handed to the backend when the sandbox is created
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceLimits {
    /// Memory ceiling in bytes
    pub memory: ByteSize,
    /// CPU allocation, 1.0 is one full core
    pub cpus: f64,
    /// Wall-clock budget for the running phase
    pub timeout: Duration,
}

impl ResourceLimits {
    pub fn nano_cpus(&self) -> i64 {
        (self.cpus * 1_000_000_000.0) as i64
    }
}

/// One attempt to run a submission inside a sandbox
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub image: String,
    pub bundle: PathBuf,
    pub limits: ResourceLimits,
    pub command: Vec<String>,
}

impl Job {
    pub fn new(
        image: impl Into<String>,
        bundle: impl Into<PathBuf>,
        limits: ResourceLimits,
        command: Vec<String>,
    ) -> Self {
        Self {
            id: generate_job_id(),
            image: image.into(),
            bundle: bundle.into(),
            limits,
            command,
        }
    }
}

static JOB_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Timestamped id with a per-process sequence number, unique even for jobs
/// started within the same millisecond
pub fn generate_job_id() -> String {
    let seq = JOB_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("job-{}-{seq}", Utc::now().format("%y%m%d-%H%M%S-%3f"))
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ImageUnavailable,
    ProvisionFailure,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    Timeout,
    Cancelled,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded,
    Failed { kind: FailureKind, reason: String },
    Aborted { reason: AbortReason },
}

/// What went wrong while releasing the sandbox, independent of the job outcome
#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub stop_error: Option<String>,
    pub remove_error: Option<String>,
}

impl CleanupReport {
    /// The sandbox may still hold resources on the backend
    pub fn leaked(&self) -> bool {
        self.remove_error.is_some()
    }

    pub fn failures(&self) -> usize {
        self.stop_error.iter().count() + self.remove_error.iter().count()
    }
}

#[derive(Serialize, Debug, Clone)]
pub struct JobReport {
    pub job_id: String,
    pub outcome: JobOutcome,
    pub cleanup: CleanupReport,
    pub final_state: LifecycleState,
    pub handle: Option<ExecutionHandle>,
    pub stream_failure: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl JobReport {
    pub fn exit_code(&self) -> i32 {
        match (&self.outcome, self.cleanup.leaked()) {
            (JobOutcome::Succeeded, false) => 0,
            (JobOutcome::Succeeded, true) => 3,
            (JobOutcome::Failed { .. }, _) => 1,
            (JobOutcome::Aborted { .. }, _) => 2,
        }
    }
}
