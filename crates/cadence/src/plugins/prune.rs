//! Stale record pruning

use std::sync::Arc;

use cadence_library::{MediaLibrary, MediaRecord, RecordFilter};
use cadence_runtime::{BatchMode, BatchOperation, Job, JobSpec, Plugin, PluginContext, SettingsSection};

use super::LibraryJob;

pub const PLUGIN_ID: &str = "library.prune";
pub const JOB_ID: &str = "library.prune-stale";

pub struct PrunePlugin;

impl PrunePlugin {
    pub fn new() -> Self {
        Self
    }
}

impl Default for PrunePlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for PrunePlugin {
    fn id(&self) -> &str {
        PLUGIN_ID
    }

    fn name(&self) -> &str {
        "Prune stale records"
    }

    fn jobs(&self, ctx: &PluginContext) -> Vec<Arc<dyn Job>> {
        let Some(library) = super::library(ctx, PLUGIN_ID) else {
            return Vec::new();
        };

        let spec = JobSpec::new(JOB_ID, "Prune stale records")
            .with_description("Remove records whose media file no longer exists");
        let options = super::batch_options(ctx, PLUGIN_ID, BatchMode::Concurrent);

        vec![Arc::new(LibraryJob::new(
            spec,
            library,
            RecordFilter::all(),
            options,
            prune_operation,
        ))]
    }

    fn settings(&self) -> Option<SettingsSection> {
        Some(super::common_settings(self.name()))
    }
}

cadence_runtime::register_plugin!(id = PLUGIN_ID, order = 40, plugin = PrunePlugin::new);

fn prune_operation(library: Arc<MediaLibrary>) -> BatchOperation<MediaRecord> {
    BatchOperation::from_fn(move |record: MediaRecord| {
        let exists = record
            .path
            .try_exists()
            .map_err(|e| format!("{}: {e}", record.path.display()))?;

        if !exists {
            tracing::info!(path = %record.path.display(), id = %record.id, "Pruning record for missing file");
            library.stage_remove(record.id);
        }
        Ok::<(), String>(())
    })
}
