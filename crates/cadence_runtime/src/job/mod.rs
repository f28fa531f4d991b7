//! Background Jobs
//!
//! A job is a named, cancellable unit of asynchronous work. Jobs are
//! registered with the [`JobManager`], which runs them fire-and-forget and
//! guarantees at most one live execution per job identifier.
//!
//! # Cancellation
//!
//! Cancellation is cooperative. Stopping a job calls its `cancel` hook and
//! trips the `CancellationToken` in its [`JobContext`]; the manager stops
//! tracking the run immediately and never aborts the task.

mod manager;
mod scheduler;

pub use manager::*;
pub use scheduler::*;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::batch::StoreError;

// ─────────────────────────────────────────────────────────────────────────────
// Job Error
// ─────────────────────────────────────────────────────────────────────────────

/// Errors a job execution can end with
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobError {
    /// The run observed cancellation; not a failure
    #[error("Job cancelled")]
    Cancelled,

    #[error("Job failed: {0}")]
    Failed(String),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for JobError {
    fn from(e: std::io::Error) -> Self {
        JobError::Io(e.to_string())
    }
}

/// Result type for job execution
pub type JobResult<T> = Result<T, JobError>;

// ─────────────────────────────────────────────────────────────────────────────
// Job Specification
// ─────────────────────────────────────────────────────────────────────────────

/// Identity and description of a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Unique job identifier
    pub id: String,

    /// Human-readable name
    pub name: String,

    #[serde(default)]
    pub description: String,
}

impl JobSpec {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
        }
    }

    /// Set description
    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Job Context
// ─────────────────────────────────────────────────────────────────────────────

/// Context passed to a single job run
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Job identifier
    pub job_id: String,

    /// Unique id of this run
    pub run_id: Uuid,

    cancel: CancellationToken,
}

impl JobContext {
    pub fn new(job_id: impl Into<String>, run_id: Uuid, cancel: CancellationToken) -> Self {
        Self {
            job_id: job_id.into(),
            run_id,
            cancel,
        }
    }

    /// Check whether this run has been asked to stop
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Return `JobError::Cancelled` if this run has been asked to stop
    pub fn check_cancelled(&self) -> JobResult<()> {
        if self.is_cancelled() {
            Err(JobError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// The run's cancellation token, e.g. for a `BatchProcessor`
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait until this run is cancelled
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Job Trait
// ─────────────────────────────────────────────────────────────────────────────

/// A unit of asynchronous, cancellable background work
#[async_trait]
pub trait Job: Send + Sync + 'static {
    /// Returns the job specification
    fn spec(&self) -> JobSpec;

    /// Run the job to completion
    ///
    /// Return `JobError::Cancelled` (or `Ok`) promptly once
    /// `ctx.is_cancelled()` turns true.
    async fn execute(&self, ctx: &JobContext) -> JobResult<()>;

    /// Called when the manager stops a running execution
    ///
    /// The run's cancellation token is tripped as well, so most jobs don't
    /// need to override this.
    fn cancel(&self) {}
}

// ─────────────────────────────────────────────────────────────────────────────
// Status and Events
// ─────────────────────────────────────────────────────────────────────────────

/// How a job run ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "error", rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded,
    Cancelled,
    Failed(String),
}

impl JobOutcome {
    pub(crate) fn from_result(result: &JobResult<()>) -> Self {
        match result {
            Ok(()) => JobOutcome::Succeeded,
            Err(JobError::Cancelled) => JobOutcome::Cancelled,
            Err(e) => JobOutcome::Failed(e.to_string()),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, JobOutcome::Failed(_))
    }
}

impl std::fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobOutcome::Succeeded => write!(f, "succeeded"),
            JobOutcome::Cancelled => write!(f, "cancelled"),
            JobOutcome::Failed(e) => write!(f, "failed: {}", e),
        }
    }
}

/// The most recent finished run of a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastRun {
    pub run_id: Uuid,
    pub outcome: JobOutcome,
    pub finished_at: DateTime<Utc>,
}

/// Point-in-time snapshot of a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub id: String,
    pub name: String,
    pub description: String,
    pub is_running: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<LastRun>,
}

/// Lifecycle notifications broadcast by the manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    Started {
        job_id: String,
        run_id: Uuid,
    },
    Finished {
        job_id: String,
        run_id: Uuid,
        outcome: JobOutcome,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> &str {
        match self {
            JobEvent::Started { job_id, .. } | JobEvent::Finished { job_id, .. } => job_id,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
