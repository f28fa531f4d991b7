//! Batch processor
//!
//! Enumeration runs on the calling task: count once, then fetch batches on
//! the blocking pool and dispatch each record behind a semaphore permit. A
//! separate collector task owns the tally; every record reaches it exactly
//! once through its [`Done`] signal, and records that were never dispatched
//! reach it as a single `Unreached` signal. The collector finishes when the
//! last sender is gone, which is the fan-in point.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::done::{Completion, Signal};
use super::{BatchOptions, BatchProgress, BatchRecord, BatchReport, Done, RecordStore, StoreError, StoreResult};

// ─────────────────────────────────────────────────────────────────────────────
// Operation
// ─────────────────────────────────────────────────────────────────────────────

type BlockingFn<R> = Arc<dyn Fn(R, Done) + Send + Sync>;
type AsyncFn<R> = Arc<dyn Fn(R, Done) -> BoxFuture<'static, ()> + Send + Sync>;

enum Operation<R> {
    Blocking(BlockingFn<R>),
    Async(AsyncFn<R>),
}

/// Per-record operation applied by the processor
///
/// Blocking operations run on tokio's blocking pool; async operations are
/// spawned as tasks. Either way the operation owns the record's [`Done`].
pub struct BatchOperation<R> {
    inner: Operation<R>,
}

impl<R: Send + 'static> BatchOperation<R> {
    /// Operation that signals completion itself
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(R, Done) + Send + Sync + 'static,
    {
        Self {
            inner: Operation::Blocking(Arc::new(f)),
        }
    }

    /// Blocking operation whose result is the completion signal
    pub fn from_fn<F, E>(f: F) -> Self
    where
        F: Fn(R) -> Result<(), E> + Send + Sync + 'static,
        E: fmt::Display,
    {
        Self::new(move |record, done| done.finish(f(record)))
    }

    /// Async operation whose result is the completion signal
    pub fn from_async<F, Fut, E>(f: F) -> Self
    where
        F: Fn(R) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        Self {
            inner: Operation::Async(Arc::new(move |record, done| {
                let fut = f(record);
                async move { done.finish(fut.await) }.boxed()
            })),
        }
    }

    fn dispatch(&self, record: R, done: Done) {
        match &self.inner {
            Operation::Blocking(f) => {
                let f = Arc::clone(f);
                tokio::task::spawn_blocking(move || f(record, done));
            }
            Operation::Async(f) => {
                tokio::spawn(f(record, done));
            }
        }
    }
}

impl<R> Clone for BatchOperation<R> {
    fn clone(&self) -> Self {
        let inner = match &self.inner {
            Operation::Blocking(f) => Operation::Blocking(Arc::clone(f)),
            Operation::Async(f) => Operation::Async(Arc::clone(f)),
        };
        Self { inner }
    }
}

impl<R> fmt::Debug for BatchOperation<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.inner {
            Operation::Blocking(_) => "blocking",
            Operation::Async(_) => "async",
        };
        f.debug_struct("BatchOperation").field("kind", &kind).finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Processor
// ─────────────────────────────────────────────────────────────────────────────

/// Streams a store's matching records through an operation
pub struct BatchProcessor<S: RecordStore> {
    store: Arc<S>,
    options: BatchOptions,
    label: String,
    progress: Option<watch::Sender<BatchProgress>>,
    cancel: Option<CancellationToken>,
}

impl<S: RecordStore> BatchProcessor<S> {
    pub fn new(store: Arc<S>, options: BatchOptions) -> Self {
        Self {
            store,
            options,
            label: "batch".to_string(),
            progress: None,
            cancel: None,
        }
    }

    /// Name used in log output
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Publish progress snapshots on a watch channel
    pub fn with_progress(mut self, tx: watch::Sender<BatchProgress>) -> Self {
        self.progress = Some(tx);
        self
    }

    /// Stop dispatching once `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn options(&self) -> &BatchOptions {
        &self.options
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Run the operation over every record matching `filter`
    pub async fn run(&self, filter: S::Filter, op: BatchOperation<S::Record>) -> StoreResult<BatchReport> {
        self.run_with_completion(filter, op, |_, _| Ok(())).await
    }

    /// Run the operation, then call `on_complete` once with the store
    ///
    /// `on_complete` runs after every record has signalled, including when
    /// the run was cancelled or enumeration failed part way. It is not called
    /// when the initial count fails.
    pub async fn run_with_completion<C>(
        &self,
        filter: S::Filter,
        op: BatchOperation<S::Record>,
        on_complete: C,
    ) -> StoreResult<BatchReport>
    where
        C: FnOnce(&S, &BatchReport) -> StoreResult<()> + Send + 'static,
    {
        let started = Instant::now();
        let filter = Arc::new(filter);

        let total = {
            let store = Arc::clone(&self.store);
            let filter = Arc::clone(&filter);
            blocking(move || store.count(&filter)).await?
        };

        tracing::debug!(batch = %self.label, total, mode = ?self.options.mode, "Starting batch");

        let (tx, rx) = mpsc::unbounded_channel();
        let collector = tokio::spawn(collect(
            rx,
            total,
            self.label.clone(),
            self.options.progress_every,
            self.progress.clone(),
        ));

        if total > 0 {
            self.enumerate(&filter, total, &op, &tx).await;
        }
        drop(tx);

        let tally = collector.await.map_err(|e| StoreError::Task(e.to_string()))?;
        let report = BatchReport {
            total,
            succeeded: tally.succeeded,
            failed: tally.failed,
            skipped: tally.skipped,
            elapsed: started.elapsed(),
        };
        debug_assert_eq!(report.completed(), total);

        let store = Arc::clone(&self.store);
        blocking(move || on_complete(&store, &report)).await?;

        tracing::info!(
            batch = %self.label,
            total,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Batch complete"
        );
        Ok(report)
    }

    /// Dispatch up to `total` records; anything not dispatched is reported
    /// as one `Unreached` signal
    async fn enumerate(
        &self,
        filter: &Arc<S::Filter>,
        total: usize,
        op: &BatchOperation<S::Record>,
        tx: &mpsc::UnboundedSender<Completion>,
    ) {
        let semaphore = Arc::new(Semaphore::new(self.options.in_flight_limit()));
        let batch_size = self.options.batch_size.max(1);
        let mut after: Option<<S::Record as BatchRecord>::Key> = None;
        let mut dispatched = 0usize;

        let unreached = 'enumerate: loop {
            if dispatched >= total {
                break None;
            }
            if self.is_cancelled() {
                break Some((true, "batch cancelled".to_string()));
            }

            let limit = batch_size.min(total - dispatched);
            let fetched = {
                let store = Arc::clone(&self.store);
                let filter = Arc::clone(filter);
                let after = after.clone();
                blocking(move || store.fetch_batch(&filter, after.as_ref(), limit)).await
            };

            let mut batch = match fetched {
                Ok(batch) => batch,
                Err(e) => break Some((false, e.to_string())),
            };
            if batch.is_empty() {
                break Some((false, "collection shrank during the run".to_string()));
            }
            batch.truncate(limit);

            for record in batch {
                let Some(permit) = self.acquire(&semaphore).await else {
                    let skipped = self.is_cancelled();
                    let reason = if skipped { "batch cancelled" } else { "worker pool closed" };
                    break 'enumerate Some((skipped, reason.to_string()));
                };

                let key = record.key();
                let done = Done::new(format!("{key:?}"), tx.clone(), Some(permit));
                after = Some(key);
                dispatched += 1;
                op.dispatch(record, done);
            }
        };

        if let Some((skipped, reason)) = unreached {
            let _ = tx.send(Completion {
                record: String::new(),
                signal: Signal::Unreached {
                    count: total - dispatched,
                    skipped,
                    reason,
                },
            });
        }
    }

    /// Wait for an in-flight slot, giving up on cancellation
    async fn acquire(&self, semaphore: &Arc<Semaphore>) -> Option<OwnedSemaphorePermit> {
        let acquire = Arc::clone(semaphore).acquire_owned();
        match &self.cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => None,
                permit = acquire => permit.ok(),
            },
            None => acquire.await.ok(),
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|token| token.is_cancelled())
    }
}

impl<S: RecordStore> fmt::Debug for BatchProcessor<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchProcessor")
            .field("label", &self.label)
            .field("options", &self.options)
            .finish()
    }
}

async fn blocking<T, F>(f: F) -> StoreResult<T>
where
    F: FnOnce() -> StoreResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
}

// ─────────────────────────────────────────────────────────────────────────────
// Collector
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Tally {
    succeeded: usize,
    failed: usize,
    skipped: usize,
}

impl Tally {
    fn completed(&self) -> usize {
        self.succeeded + self.failed + self.skipped
    }
}

async fn collect(
    mut rx: mpsc::UnboundedReceiver<Completion>,
    total: usize,
    label: String,
    progress_every: usize,
    progress: Option<watch::Sender<BatchProgress>>,
) -> Tally {
    let mut tally = Tally::default();

    while let Some(Completion { record, signal }) = rx.recv().await {
        let before = tally.completed();

        match signal {
            Signal::Succeeded => tally.succeeded += 1,
            Signal::Failed(error) => {
                tally.failed += 1;
                tracing::warn!(batch = %label, record = %record, error = %error, "Batch record failed");
            }
            Signal::Unreached { count, skipped: true, reason } => {
                tally.skipped += count;
                tracing::info!(batch = %label, count, reason = %reason, "Batch records skipped");
            }
            Signal::Unreached { count, skipped: false, reason } => {
                tally.failed += count;
                tracing::warn!(batch = %label, count, reason = %reason, "Batch records unreachable");
            }
        }

        let completed = tally.completed();
        let crossed_interval = progress_every > 0 && completed / progress_every > before / progress_every;
        if crossed_interval || completed == total {
            let snapshot = BatchProgress {
                total,
                completed,
                failed: tally.failed,
            };
            if let Some(tx) = &progress {
                tx.send_replace(snapshot);
            }
            tracing::debug!(batch = %label, completed, total, failed = tally.failed, "Batch progress");
        }
    }

    tally
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
