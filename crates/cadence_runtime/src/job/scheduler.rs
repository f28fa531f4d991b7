//! Job Scheduler
//!
//! Thin driver between an external trigger (timer, app lifecycle event) and
//! the `JobManager`. It holds no job logic: every trigger simply asks the
//! manager to start all known jobs, relying on `start_job` being a no-op for
//! jobs that are already running.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::{JobManager, StartOutcome};

/// Configuration for the scheduler's background trigger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Identifier the background trigger is registered under
    pub trigger_id: String,

    /// Period of the interval trigger; `None` disables it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            trigger_id: "cadence.maintenance".to_string(),
            interval: Some(Duration::from_secs(15 * 60)),
        }
    }
}

/// Platform-triggered entry point that (re)runs pending jobs
pub struct JobScheduler {
    manager: Arc<JobManager>,
    config: SchedulerConfig,
    is_setup: AtomicBool,
}

impl JobScheduler {
    pub fn new(manager: Arc<JobManager>, config: SchedulerConfig) -> Self {
        Self {
            manager,
            config,
            is_setup: AtomicBool::new(false),
        }
    }

    /// Perform the one-time trigger registration
    ///
    /// Returns true if this call did the registration, false if it had
    /// already been done.
    pub fn setup(&self) -> bool {
        if self.is_setup.swap(true, Ordering::SeqCst) {
            tracing::debug!(trigger_id = %self.config.trigger_id, "Scheduler already set up");
            return false;
        }

        tracing::info!(
            trigger_id = %self.config.trigger_id,
            interval = ?self.config.interval,
            "Registered background job trigger"
        );
        true
    }

    /// Check if `setup` has run
    pub fn is_setup(&self) -> bool {
        self.is_setup.load(Ordering::SeqCst)
    }

    /// Get the scheduler configuration
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Ask the manager to start every known job
    ///
    /// Returns the number of jobs newly started; jobs already running are
    /// left alone.
    pub fn execute_pending_jobs(&self) -> usize {
        let job_ids = self.manager.job_ids();
        let started = job_ids
            .iter()
            .filter(|id| self.manager.start_job(id) == StartOutcome::Started)
            .count();

        tracing::debug!(known = job_ids.len(), started, "Executed pending jobs");
        started
    }

    /// Spawn the interval trigger
    ///
    /// Calls `execute_pending_jobs` every `interval` until `shutdown` fires.
    /// The first trigger happens one full period after spawning. Returns
    /// `None` when no interval is configured.
    pub fn spawn_interval_trigger(
        self: &Arc<Self>,
        shutdown: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        let period = self.config.interval?;
        let scheduler = Arc::clone(self);

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::debug!(trigger_id = %scheduler.config.trigger_id, "Interval trigger stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        scheduler.execute_pending_jobs();
                    }
                }
            }
        }))
    }
}

impl std::fmt::Debug for JobScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobScheduler")
            .field("config", &self.config)
            .field("is_setup", &self.is_setup())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Job, JobContext, JobResult, JobSpec};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct SlowJob {
        id: &'static str,
        executions: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Job for SlowJob {
        fn spec(&self) -> JobSpec {
            JobSpec::new(self.id, self.id)
        }

        async fn execute(&self, ctx: &JobContext) -> JobResult<()> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            ctx.cancelled().await;
            Ok(())
        }
    }

    fn scheduler_with_jobs(
        ids: &[&'static str],
    ) -> (Arc<JobScheduler>, Arc<JobManager>, Arc<AtomicUsize>) {
        let manager = JobManager::new_shared();
        let executions = Arc::new(AtomicUsize::new(0));
        for &id in ids {
            manager.register(Arc::new(SlowJob {
                id,
                executions: Arc::clone(&executions),
            }));
        }
        let scheduler = Arc::new(JobScheduler::new(
            Arc::clone(&manager),
            SchedulerConfig {
                trigger_id: "test".into(),
                interval: Some(Duration::from_millis(20)),
            },
        ));
        (scheduler, manager, executions)
    }

    #[tokio::test]
    async fn test_setup_is_idempotent() {
        let (scheduler, _, _) = scheduler_with_jobs(&[]);

        assert!(!scheduler.is_setup());
        assert!(scheduler.setup());
        assert!(!scheduler.setup());
        assert!(scheduler.is_setup());
    }

    #[tokio::test]
    async fn test_execute_pending_jobs_never_double_starts() {
        let (scheduler, manager, executions) = scheduler_with_jobs(&["a", "b"]);

        assert_eq!(scheduler.execute_pending_jobs(), 2);
        assert_eq!(scheduler.execute_pending_jobs(), 0);
        assert_eq!(manager.running_count(), 2);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(executions.load(Ordering::SeqCst), 2);
        manager.stop_all_jobs();
    }

    #[tokio::test]
    async fn test_interval_trigger_starts_jobs_until_shutdown() {
        let (scheduler, manager, _) = scheduler_with_jobs(&["periodic"]);
        let shutdown = CancellationToken::new();

        let handle = scheduler.spawn_interval_trigger(shutdown.clone()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !manager.is_running("periodic") {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        shutdown.cancel();
        handle.await.unwrap();
        manager.stop_all_jobs();
    }

    #[tokio::test]
    async fn test_no_interval_means_no_trigger() {
        let manager = JobManager::new_shared();
        let scheduler = Arc::new(JobScheduler::new(
            manager,
            SchedulerConfig {
                trigger_id: "manual".into(),
                interval: None,
            },
        ));

        assert!(scheduler.spawn_interval_trigger(CancellationToken::new()).is_none());
    }
}
