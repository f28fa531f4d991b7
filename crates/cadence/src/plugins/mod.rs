//! Built-in library maintenance plugins
//!
//! Each plugin contributes one job that streams part of the media library
//! through the batch processor and commits its staged writes when the batch
//! completes:
//!
//! | Plugin               | Order | Job                       | Mode       |
//! |----------------------|-------|---------------------------|------------|
//! | `library.hashes`     | 10    | `library.compute-hashes`  | concurrent |
//! | `library.covers`     | 20    | `library.populate-covers` | concurrent |
//! | `library.duplicates` | 30    | `library.find-duplicates` | serial     |
//! | `library.prune`      | 40    | `library.prune-stale`     | concurrent |
//!
//! All of them read `enabled`, `concurrency` and `batch_size` from their
//! plugin table, on top of the host's `[jobs]` defaults.

pub mod covers;
pub mod duplicates;
pub mod hashes;
pub mod prune;

use std::sync::Arc;

use async_trait::async_trait;
use cadence_library::{MediaLibrary, MediaRecord, RecordFilter};
use cadence_runtime::{
    BatchMode, BatchOperation, BatchOptions, BatchProcessor, Job, JobContext, JobError, JobResult,
    JobSpec, PluginContext, RecordStore, SettingsSection,
};

/// Builds the per-run record operation
pub(crate) type OperationFactory = fn(Arc<MediaLibrary>) -> BatchOperation<MediaRecord>;

/// A job that runs one batch over the media library
pub struct LibraryJob {
    spec: JobSpec,
    library: Arc<MediaLibrary>,
    filter: RecordFilter,
    options: BatchOptions,
    operation: OperationFactory,
}

impl LibraryJob {
    pub(crate) fn new(
        spec: JobSpec,
        library: Arc<MediaLibrary>,
        filter: RecordFilter,
        options: BatchOptions,
        operation: OperationFactory,
    ) -> Self {
        Self {
            spec,
            library,
            filter,
            options,
            operation,
        }
    }

    pub fn options(&self) -> &BatchOptions {
        &self.options
    }
}

#[async_trait]
impl Job for LibraryJob {
    fn spec(&self) -> JobSpec {
        self.spec.clone()
    }

    async fn execute(&self, ctx: &JobContext) -> JobResult<()> {
        let operation = (self.operation)(Arc::clone(&self.library));

        let report = BatchProcessor::new(Arc::clone(&self.library), self.options.clone())
            .with_label(self.spec.id.clone())
            .with_cancellation(ctx.cancellation())
            .run_with_completion(self.filter.clone(), operation, |library, _| {
                RecordStore::commit(library)
            })
            .await?;

        if ctx.is_cancelled() {
            return Err(JobError::Cancelled);
        }

        tracing::info!(
            job_id = %ctx.job_id,
            run_id = %ctx.run_id,
            total = report.total,
            succeeded = report.succeeded,
            failed = report.failed,
            "Library job finished"
        );
        Ok(())
    }
}

/// Batch tuning for one plugin's job
///
/// Starts from the host's `BatchOptions` resource and applies the plugin's
/// own `concurrency` and `batch_size` settings.
pub(crate) fn batch_options(ctx: &PluginContext, plugin_id: &str, mode: BatchMode) -> BatchOptions {
    let base = ctx
        .resource::<BatchOptions>()
        .map(|options| (*options).clone())
        .unwrap_or_default();

    let mut options = BatchOptions { mode, ..base };
    if let Some(concurrency) = ctx.get_config::<usize>(plugin_id, "concurrency") {
        options.concurrency = concurrency;
    }
    if let Some(batch_size) = ctx.get_config::<usize>(plugin_id, "batch_size") {
        options.batch_size = batch_size;
    }
    options
}

/// The shared library handle, or a warning when the host didn't provide one
pub(crate) fn library(ctx: &PluginContext, plugin_id: &str) -> Option<Arc<MediaLibrary>> {
    let library = ctx.resource::<MediaLibrary>();
    if library.is_none() {
        tracing::warn!(plugin = plugin_id, "No media library available, contributing no jobs");
    }
    library
}

/// Settings every built-in plugin understands
pub(crate) fn common_settings(title: &str) -> SettingsSection {
    SettingsSection::new(title)
        .key("enabled")
        .key("concurrency")
        .key("batch_size")
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::Path;
    use std::sync::Arc;

    use cadence_library::{MediaKind, MediaLibrary, MediaRecord};
    use cadence_runtime::{Job, JobContext, JobResult};
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    /// Write `contents` to `dir/name` and import it
    pub fn import(library: &MediaLibrary, dir: &Path, name: &str, contents: &[u8]) -> MediaRecord {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, contents).unwrap();

        let kind = MediaKind::from_path(&path).unwrap_or(MediaKind::Audio);
        let record = MediaRecord::new(path, kind, contents.len() as u64);
        library.insert(&record).unwrap();
        record
    }

    pub async fn run(job: &Arc<dyn Job>) -> JobResult<()> {
        let ctx = JobContext::new(job.spec().id, Uuid::new_v4(), CancellationToken::new());
        job.execute(&ctx).await
    }
}
