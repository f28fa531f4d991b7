//! Cadence Runtime - Plugin orchestration and background jobs
//!
//! This crate contains the pieces every Cadence host builds on:
//! - `plugin`: ordered plugin registry and link-time discovery
//! - `job`: job contract, job manager and scheduler
//! - `batch`: the concurrent batch processor over a persisted collection

pub mod batch;
pub mod job;
pub mod plugin;

// Re-exported for `register_plugin!` expansions in downstream crates
#[doc(hidden)]
pub use inventory;

pub use batch::{
    BatchMode, BatchOperation, BatchOptions, BatchProcessor, BatchProgress, BatchRecord,
    BatchReport, Done, RecordStore, StoreError, StoreResult,
};
pub use job::{
    Job, JobContext, JobError, JobEvent, JobManager, JobOutcome, JobResult, JobScheduler, JobSpec,
    JobStatus, SchedulerConfig, StartOutcome,
};
pub use plugin::{
    DiscoveryReport, InstallSummary, Plugin, PluginContext, PluginRegistry, Registrant,
    SettingsSection,
};
