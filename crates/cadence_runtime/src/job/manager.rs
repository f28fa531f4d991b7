//! Job Manager
//!
//! Tracks registered jobs and which of them are running, and starts and
//! stops executions.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{Job, JobContext, JobError, JobEvent, JobOutcome, JobResult, JobStatus, LastRun};

// ─────────────────────────────────────────────────────────────────────────────
// Job Table
// ─────────────────────────────────────────────────────────────────────────────

/// Running-set entry for one live execution
struct RunSlot {
    run_id: Uuid,
    cancel: CancellationToken,
}

#[derive(Default)]
struct JobTable {
    jobs: HashMap<String, Arc<dyn Job>>,
    running: HashMap<String, RunSlot>,
    last_runs: HashMap<String, LastRun>,
}

impl JobTable {
    fn status(&self, id: &str, job: &Arc<dyn Job>) -> JobStatus {
        let spec = job.spec();
        JobStatus {
            id: id.to_string(),
            name: spec.name,
            description: spec.description,
            is_running: self.running.contains_key(id),
            last_run: self.last_runs.get(id).cloned(),
        }
    }
}

/// Result of asking the manager to start a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new execution was spawned
    Started,
    /// The job was already running; nothing was spawned
    AlreadyRunning,
    /// No job with that identifier is registered
    Unknown,
}

// ─────────────────────────────────────────────────────────────────────────────
// Job Manager
// ─────────────────────────────────────────────────────────────────────────────

/// Central manager for all background jobs
///
/// The JobManager is responsible for:
/// - Keeping the job table (register, replace, unregister)
/// - Starting jobs fire-and-forget, at most one execution per identifier
/// - Stopping jobs cooperatively
/// - Broadcasting lifecycle events and keeping the last outcome per job
///
/// All table access goes through one mutex that is never held across an
/// await point or while calling into job code.
pub struct JobManager {
    table: Arc<Mutex<JobTable>>,

    /// Broadcast channel for lifecycle events
    event_tx: broadcast::Sender<JobEvent>,
}

impl Default for JobManager {
    fn default() -> Self {
        Self::new()
    }
}

impl JobManager {
    /// Create a new job manager
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(256);

        Self {
            table: Arc::new(Mutex::new(JobTable::default())),
            event_tx,
        }
    }

    /// Create a new job manager wrapped in an Arc
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Subscribe to job lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.event_tx.subscribe()
    }

    /// Register a job, replacing any job with the same identifier
    ///
    /// A replaced job that is still running stays tracked under its
    /// identifier until that execution finishes.
    pub fn register(&self, job: Arc<dyn Job>) {
        let spec = job.spec();
        let replaced = self.table.lock().jobs.insert(spec.id.clone(), job).is_some();

        if replaced {
            tracing::debug!(job_id = %spec.id, "Replaced job registration");
        } else {
            tracing::debug!(job_id = %spec.id, name = %spec.name, "Registered job");
        }
    }

    /// Remove a job and forget any execution of it
    ///
    /// An in-flight execution keeps running but is no longer tracked.
    pub fn unregister(&self, job_id: &str) -> bool {
        let mut table = self.table.lock();
        let removed = table.jobs.remove(job_id).is_some();
        let was_running = table.running.remove(job_id).is_some();
        table.last_runs.remove(job_id);
        drop(table);

        if removed {
            tracing::info!(job_id, was_running, "Unregistered job");
        }
        removed
    }

    /// Start a job unless it is unknown or already running
    ///
    /// Never fails: the execution runs on its own task and reports through
    /// status and events.
    pub fn start_job(&self, job_id: &str) -> StartOutcome {
        self.begin(job_id).0
    }

    /// Start a job (or join its current run) and wait for that run to finish
    ///
    /// Returns `None` if the job is unknown or the run's outcome is lost
    /// (for example because the job was unregistered meanwhile).
    pub async fn start_and_wait(&self, job_id: &str) -> Option<JobOutcome> {
        let mut events = self.subscribe();
        let run_id = self.begin(job_id).1?;

        loop {
            match events.recv().await {
                Ok(JobEvent::Finished {
                    run_id: finished,
                    outcome,
                    ..
                }) if finished == run_id => return Some(outcome),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(job_id, skipped, "Event receiver lagged");
                    let table = self.table.lock();
                    if let Some(last) = table.last_runs.get(job_id) {
                        if last.run_id == run_id {
                            return Some(last.outcome.clone());
                        }
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Stop a running job
    ///
    /// Calls the job's `cancel` hook, trips the run's cancellation token and
    /// removes it from the running set right away. Returns false if the job
    /// was not running.
    pub fn stop_job(&self, job_id: &str) -> bool {
        let (job, slot) = {
            let mut table = self.table.lock();
            (table.jobs.get(job_id).cloned(), table.running.remove(job_id))
        };

        match (job, slot) {
            (job, Some(slot)) => {
                slot.cancel.cancel();
                if let Some(job) = job {
                    job.cancel();
                }
                tracing::info!(job_id, run_id = %slot.run_id, "Job stopped");
                true
            }
            (Some(_), None) => {
                tracing::debug!(job_id, "Stop requested for job that is not running");
                false
            }
            (None, None) => {
                tracing::warn!(job_id, "Stop requested for unknown job");
                false
            }
        }
    }

    /// Stop every running job; returns how many were stopped
    pub fn stop_all_jobs(&self) -> usize {
        let stopped: Vec<(String, RunSlot, Option<Arc<dyn Job>>)> = {
            let mut table = self.table.lock();
            let running: Vec<(String, RunSlot)> = table.running.drain().collect();
            running
                .into_iter()
                .map(|(id, slot)| {
                    let job = table.jobs.get(&id).cloned();
                    (id, slot, job)
                })
                .collect()
        };

        for (_, slot, job) in &stopped {
            slot.cancel.cancel();
            if let Some(job) = job {
                job.cancel();
            }
        }

        if !stopped.is_empty() {
            tracing::info!(count = stopped.len(), "Stopped all running jobs");
        }
        stopped.len()
    }

    /// Snapshot of every registered job, sorted by identifier
    pub fn get_all_job_status(&self) -> Vec<JobStatus> {
        let table = self.table.lock();
        let mut statuses: Vec<JobStatus> = table
            .jobs
            .iter()
            .map(|(id, job)| table.status(id, job))
            .collect();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    /// Snapshot of one job
    pub fn get_job_status(&self, job_id: &str) -> Option<JobStatus> {
        let table = self.table.lock();
        table.jobs.get(job_id).map(|job| table.status(job_id, job))
    }

    /// Check if a job is running
    pub fn is_running(&self, job_id: &str) -> bool {
        self.table.lock().running.contains_key(job_id)
    }

    /// Registered job identifiers, sorted
    pub fn job_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.table.lock().jobs.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Get the number of running jobs
    pub fn running_count(&self) -> usize {
        self.table.lock().running.len()
    }

    /// Get the number of registered jobs
    pub fn len(&self) -> usize {
        self.table.lock().jobs.len()
    }

    /// Check if there are no registered jobs
    pub fn is_empty(&self) -> bool {
        self.table.lock().jobs.is_empty()
    }

    /// Claim the running slot and spawn the execution
    ///
    /// Returns the run id of the new or already-live execution.
    fn begin(&self, job_id: &str) -> (StartOutcome, Option<Uuid>) {
        let (job, ctx) = {
            let mut table = self.table.lock();

            let Some(job) = table.jobs.get(job_id).cloned() else {
                drop(table);
                tracing::warn!(job_id, "Cannot start unknown job");
                return (StartOutcome::Unknown, None);
            };

            if let Some(slot) = table.running.get(job_id) {
                tracing::debug!(job_id, run_id = %slot.run_id, "Job already running");
                return (StartOutcome::AlreadyRunning, Some(slot.run_id));
            }

            let run_id = Uuid::new_v4();
            let cancel = CancellationToken::new();
            table.running.insert(
                job_id.to_string(),
                RunSlot {
                    run_id,
                    cancel: cancel.clone(),
                },
            );
            (job, JobContext::new(job_id, run_id, cancel))
        };

        let run_id = ctx.run_id;
        let _ = self.event_tx.send(JobEvent::Started {
            job_id: job_id.to_string(),
            run_id,
        });

        let table = Arc::clone(&self.table);
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            run_job(job, ctx, table, event_tx).await;
        });

        (StartOutcome::Started, Some(run_id))
    }
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.table.lock();
        f.debug_struct("JobManager")
            .field("jobs", &table.jobs.len())
            .field("running", &table.running.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Job Task
// ─────────────────────────────────────────────────────────────────────────────

/// Run one execution and release its running slot
async fn run_job(
    job: Arc<dyn Job>,
    ctx: JobContext,
    table: Arc<Mutex<JobTable>>,
    event_tx: broadcast::Sender<JobEvent>,
) {
    let job_id = ctx.job_id.clone();
    let run_id = ctx.run_id;
    tracing::info!(job_id = %job_id, run_id = %run_id, "Job started");

    let result: JobResult<()> = match AssertUnwindSafe(job.execute(&ctx)).catch_unwind().await {
        Ok(result) => result,
        Err(_) => Err(JobError::Failed("job panicked".to_string())),
    };
    let outcome = JobOutcome::from_result(&result);

    match &outcome {
        JobOutcome::Succeeded => {
            tracing::info!(job_id = %job_id, run_id = %run_id, "Job completed");
        }
        JobOutcome::Cancelled => {
            tracing::info!(job_id = %job_id, run_id = %run_id, "Job cancelled");
        }
        JobOutcome::Failed(error) => {
            tracing::error!(job_id = %job_id, run_id = %run_id, error = %error, "Job failed");
        }
    }

    {
        let mut table = table.lock();
        // Only release the slot this run owns; a stop/restart may have replaced it
        if table.running.get(&job_id).is_some_and(|slot| slot.run_id == run_id) {
            table.running.remove(&job_id);
        }
        if table.jobs.contains_key(&job_id) {
            table.last_runs.insert(
                job_id.clone(),
                LastRun {
                    run_id,
                    outcome: outcome.clone(),
                    finished_at: Utc::now(),
                },
            );
        }
    }

    let _ = event_tx.send(JobEvent::Finished {
        job_id,
        run_id,
        outcome,
    });
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobSpec;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Job that blocks until released or cancelled
    struct GatedJob {
        id: String,
        executions: Arc<AtomicUsize>,
        cancel_calls: Arc<AtomicUsize>,
        release: Arc<Notify>,
        ignore_cancel: bool,
    }

    impl GatedJob {
        fn new(id: &str) -> Self {
            Self {
                id: id.to_string(),
                executions: Arc::new(AtomicUsize::new(0)),
                cancel_calls: Arc::new(AtomicUsize::new(0)),
                release: Arc::new(Notify::new()),
                ignore_cancel: false,
            }
        }
    }

    #[async_trait]
    impl Job for GatedJob {
        fn spec(&self) -> JobSpec {
            JobSpec::new(&self.id, format!("Gated {}", self.id))
        }

        async fn execute(&self, ctx: &JobContext) -> JobResult<()> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            if self.ignore_cancel {
                self.release.notified().await;
                return Ok(());
            }
            tokio::select! {
                _ = self.release.notified() => Ok(()),
                _ = ctx.cancelled() => Err(JobError::Cancelled),
            }
        }

        fn cancel(&self) {
            self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FailingJob;

    #[async_trait]
    impl Job for FailingJob {
        fn spec(&self) -> JobSpec {
            JobSpec::new("failing", "Failing")
        }

        async fn execute(&self, _ctx: &JobContext) -> JobResult<()> {
            Err(JobError::Failed("boom".into()))
        }
    }

    struct PanickingJob;

    #[async_trait]
    impl Job for PanickingJob {
        fn spec(&self) -> JobSpec {
            JobSpec::new("panicking", "Panicking")
        }

        async fn execute(&self, _ctx: &JobContext) -> JobResult<()> {
            panic!("job bug");
        }
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_start_unknown_job_is_a_no_op() {
        let manager = JobManager::new();
        assert_eq!(manager.start_job("missing"), StartOutcome::Unknown);
        assert!(!manager.stop_job("missing"));
        assert!(manager.get_job_status("missing").is_none());
    }

    #[tokio::test]
    async fn test_double_start_runs_once() {
        let manager = JobManager::new();
        let job = GatedJob::new("sync");
        let executions = Arc::clone(&job.executions);
        let release = Arc::clone(&job.release);
        manager.register(Arc::new(job));

        assert_eq!(manager.start_job("sync"), StartOutcome::Started);
        assert_eq!(manager.start_job("sync"), StartOutcome::AlreadyRunning);
        assert!(manager.get_job_status("sync").unwrap().is_running);

        wait_until(|| executions.load(Ordering::SeqCst) == 1).await;
        release.notify_one();
        wait_until(|| !manager.is_running("sync")).await;

        assert_eq!(executions.load(Ordering::SeqCst), 1);
        let status = manager.get_job_status("sync").unwrap();
        assert!(!status.is_running);
        assert_eq!(status.last_run.unwrap().outcome, JobOutcome::Succeeded);
    }

    #[tokio::test]
    async fn test_stop_reports_not_running_immediately() {
        let manager = JobManager::new();
        let mut job = GatedJob::new("stubborn");
        job.ignore_cancel = true;
        let cancel_calls = Arc::clone(&job.cancel_calls);
        let release = Arc::clone(&job.release);
        manager.register(Arc::new(job));

        manager.start_job("stubborn");
        assert!(manager.stop_job("stubborn"));

        // The task has not observed cancellation, but it is no longer tracked
        assert!(!manager.get_job_status("stubborn").unwrap().is_running);
        assert_eq!(cancel_calls.load(Ordering::SeqCst), 1);
        assert!(!manager.stop_job("stubborn"));

        release.notify_one();
    }

    /// Job whose n-th execution waits on the n-th gate and ignores cancellation
    struct SequencedJob {
        executions: Arc<AtomicUsize>,
        gates: [Arc<Notify>; 2],
    }

    #[async_trait]
    impl Job for SequencedJob {
        fn spec(&self) -> JobSpec {
            JobSpec::new("restart", "Restart")
        }

        async fn execute(&self, _ctx: &JobContext) -> JobResult<()> {
            let n = self.executions.fetch_add(1, Ordering::SeqCst);
            self.gates[n.min(1)].notified().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_stale_run_does_not_clear_restarted_run() {
        let manager = JobManager::new();
        let executions = Arc::new(AtomicUsize::new(0));
        let gates = [Arc::new(Notify::new()), Arc::new(Notify::new())];
        manager.register(Arc::new(SequencedJob {
            executions: Arc::clone(&executions),
            gates: gates.clone(),
        }));

        manager.start_job("restart");
        wait_until(|| executions.load(Ordering::SeqCst) == 1).await;
        manager.stop_job("restart");
        assert_eq!(manager.start_job("restart"), StartOutcome::Started);
        wait_until(|| executions.load(Ordering::SeqCst) == 2).await;

        // Finish the first (stale) execution only
        gates[0].notify_one();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(manager.is_running("restart"));

        gates[1].notify_one();
        wait_until(|| !manager.is_running("restart")).await;
    }

    #[tokio::test]
    async fn test_cancelled_run_is_not_a_failure() {
        let manager = JobManager::new();
        manager.register(Arc::new(GatedJob::new("cancel-me")));
        let mut events = manager.subscribe();

        manager.start_job("cancel-me");
        assert!(matches!(events.recv().await.unwrap(), JobEvent::Started { .. }));
        manager.stop_job("cancel-me");

        match events.recv().await.unwrap() {
            JobEvent::Finished { job_id, outcome, .. } => {
                assert_eq!(job_id, "cancel-me");
                assert_eq!(outcome, JobOutcome::Cancelled);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failure_is_reported_and_does_not_block_other_jobs() {
        let manager = JobManager::new();
        manager.register(Arc::new(FailingJob));
        manager.register(Arc::new(PanickingJob));
        let gated = GatedJob::new("other");
        let release = Arc::clone(&gated.release);
        manager.register(Arc::new(gated));

        manager.start_job("other");
        let failed = manager.start_and_wait("failing").await.unwrap();
        assert!(failed.is_failure());
        let panicked = manager.start_and_wait("panicking").await.unwrap();
        assert_eq!(panicked, JobOutcome::Failed("Job failed: job panicked".into()));

        assert!(!manager.is_running("failing"));
        assert!(!manager.is_running("panicking"));
        assert!(manager.is_running("other"));
        release.notify_one();
    }

    #[tokio::test]
    async fn test_stop_all_jobs() {
        let manager = JobManager::new();
        for id in ["a", "b", "c"] {
            manager.register(Arc::new(GatedJob::new(id)));
            manager.start_job(id);
        }
        assert_eq!(manager.running_count(), 3);

        assert_eq!(manager.stop_all_jobs(), 3);
        assert_eq!(manager.running_count(), 0);
        assert!(manager.get_all_job_status().iter().all(|s| !s.is_running));
    }

    #[tokio::test]
    async fn test_unregister_removes_running_entry() {
        let manager = JobManager::new();
        let job = GatedJob::new("gone");
        let release = Arc::clone(&job.release);
        manager.register(Arc::new(job));
        manager.start_job("gone");

        assert!(manager.unregister("gone"));
        assert!(!manager.is_running("gone"));
        assert!(manager.get_job_status("gone").is_none());
        assert_eq!(manager.start_job("gone"), StartOutcome::Unknown);
        release.notify_one();
    }

    #[tokio::test]
    async fn test_register_replaces_entry() {
        struct Renamed;

        #[async_trait]
        impl Job for Renamed {
            fn spec(&self) -> JobSpec {
                JobSpec::new("sync", "Renamed").with_description("second")
            }

            async fn execute(&self, _ctx: &JobContext) -> JobResult<()> {
                Ok(())
            }
        }

        let manager = JobManager::new();
        manager.register(Arc::new(GatedJob::new("sync")));
        manager.register(Arc::new(Renamed));

        assert_eq!(manager.len(), 1);
        let status = manager.get_job_status("sync").unwrap();
        assert_eq!(status.name, "Renamed");
        assert_eq!(status.description, "second");
    }

    #[tokio::test]
    async fn test_stop_calls_hook_and_trips_token() {
        let manager = JobManager::new();
        let job = GatedJob::new("watcher");
        let executions = Arc::clone(&job.executions);
        let cancel_calls = Arc::clone(&job.cancel_calls);
        manager.register(Arc::new(job));

        assert_eq!(manager.start_job("watcher"), StartOutcome::Started);
        wait_until(|| executions.load(Ordering::SeqCst) == 1).await;

        assert!(manager.stop_job("watcher"));
        assert_eq!(cancel_calls.load(Ordering::SeqCst), 1);

        // The run only ends through its token, so a recorded outcome proves it tripped
        wait_until(|| {
            manager
                .get_job_status("watcher")
                .and_then(|s| s.last_run)
                .is_some()
        })
        .await;
        let last = manager.get_job_status("watcher").unwrap().last_run.unwrap();
        assert_eq!(last.outcome, JobOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_hook_not_called_when_idle() {
        let manager = JobManager::new();
        let job = GatedJob::new("idle");
        let cancel_calls = Arc::clone(&job.cancel_calls);
        manager.register(Arc::new(job));

        assert!(!manager.stop_job("idle"));
        assert_eq!(cancel_calls.load(Ordering::SeqCst), 0);
        assert!(!manager.is_empty());
    }
}
