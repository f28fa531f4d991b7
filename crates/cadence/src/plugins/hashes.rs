//! Content hashing
//!
//! Computes the SHA-256 of every record that doesn't have one yet. The
//! duplicate finder depends on these hashes.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::sync::Arc;

use cadence_library::{MediaLibrary, MediaRecord, RecordFilter, RecordPatch};
use cadence_runtime::{BatchMode, BatchOperation, Job, JobSpec, Plugin, PluginContext, SettingsSection};
use sha2::{Digest, Sha256};

use super::LibraryJob;

pub const PLUGIN_ID: &str = "library.hashes";
pub const JOB_ID: &str = "library.compute-hashes";

const CHUNK_SIZE: usize = 1024 * 1024;

pub struct HashesPlugin;

impl HashesPlugin {
    pub fn new() -> Self {
        Self
    }
}

impl Default for HashesPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for HashesPlugin {
    fn id(&self) -> &str {
        PLUGIN_ID
    }

    fn name(&self) -> &str {
        "Content hashes"
    }

    fn jobs(&self, ctx: &PluginContext) -> Vec<Arc<dyn Job>> {
        let Some(library) = super::library(ctx, PLUGIN_ID) else {
            return Vec::new();
        };

        let spec = JobSpec::new(JOB_ID, "Compute content hashes")
            .with_description("Hash the contents of media files that have no hash yet");
        let options = super::batch_options(ctx, PLUGIN_ID, BatchMode::Concurrent);

        vec![Arc::new(LibraryJob::new(
            spec,
            library,
            RecordFilter::missing_hash(),
            options,
            hash_operation,
        ))]
    }

    fn settings(&self) -> Option<SettingsSection> {
        Some(super::common_settings(self.name()))
    }
}

cadence_runtime::register_plugin!(id = PLUGIN_ID, order = 10, plugin = HashesPlugin::new);

fn hash_operation(library: Arc<MediaLibrary>) -> BatchOperation<MediaRecord> {
    BatchOperation::from_fn(move |record: MediaRecord| {
        let hash = hash_file(&record.path)
            .map_err(|e| format!("{}: {e}", record.path.display()))?;

        tracing::trace!(path = %record.path.display(), hash = %hash, "Hashed file");
        library.stage_update(record.id, RecordPatch::content_hash(hash));
        Ok::<(), String>(())
    })
}

/// Hex-encoded SHA-256 of a file's contents
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];

    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}
