//! Duplicate detection
//!
//! Walks hashed records serially in key order. The first record seen with a
//! given hash is the original; every later record with the same hash gets
//! `duplicate_of` pointing at it. Records that are no longer duplicates have
//! the mark cleared.

use std::collections::HashMap;
use std::sync::Arc;

use cadence_library::{MediaLibrary, MediaRecord, RecordFilter, RecordPatch};
use cadence_runtime::{BatchMode, BatchOperation, Job, JobSpec, Plugin, PluginContext, SettingsSection};
use parking_lot::Mutex;
use uuid::Uuid;

use super::LibraryJob;

pub const PLUGIN_ID: &str = "library.duplicates";
pub const JOB_ID: &str = "library.find-duplicates";

pub struct DuplicatesPlugin;

impl DuplicatesPlugin {
    pub fn new() -> Self {
        Self
    }
}

impl Default for DuplicatesPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for DuplicatesPlugin {
    fn id(&self) -> &str {
        PLUGIN_ID
    }

    fn name(&self) -> &str {
        "Duplicate finder"
    }

    fn jobs(&self, ctx: &PluginContext) -> Vec<Arc<dyn Job>> {
        let Some(library) = super::library(ctx, PLUGIN_ID) else {
            return Vec::new();
        };

        let spec = JobSpec::new(JOB_ID, "Find duplicates")
            .with_description("Link media files with identical contents to the first copy");
        // Originals are decided by enumeration order, so this one is serial
        let options = super::batch_options(ctx, PLUGIN_ID, BatchMode::Serial);

        vec![Arc::new(LibraryJob::new(
            spec,
            library,
            RecordFilter::hashed(),
            options,
            duplicate_operation,
        ))]
    }

    fn settings(&self) -> Option<SettingsSection> {
        Some(SettingsSection::new(self.name()).key("enabled").key("batch_size"))
    }
}

cadence_runtime::register_plugin!(id = PLUGIN_ID, order = 30, plugin = DuplicatesPlugin::new);

fn duplicate_operation(library: Arc<MediaLibrary>) -> BatchOperation<MediaRecord> {
    // hash -> id of the first record carrying it, fresh for every run
    let originals: Mutex<HashMap<String, Uuid>> = Mutex::new(HashMap::new());

    BatchOperation::from_fn(move |record: MediaRecord| {
        let Some(hash) = record.content_hash.clone() else {
            return Ok::<(), String>(());
        };

        let original = *originals.lock().entry(hash).or_insert(record.id);
        let duplicate_of = (original != record.id).then_some(original);

        if record.duplicate_of != duplicate_of {
            tracing::debug!(
                path = %record.path.display(),
                duplicate_of = ?duplicate_of,
                "Updating duplicate link"
            );
            library.stage_update(record.id, RecordPatch::duplicate_of(duplicate_of));
        }
        Ok(())
    })
}
