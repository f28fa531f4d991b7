//! Cover art lookup
//!
//! Looks for a `cover`, `folder` or `front` image next to each media file
//! and records it on the media record.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cadence_library::{MediaLibrary, MediaRecord, RecordFilter, RecordPatch};
use cadence_runtime::{BatchMode, BatchOperation, Job, JobSpec, Plugin, PluginContext, SettingsSection};

use super::LibraryJob;

pub const PLUGIN_ID: &str = "library.covers";
pub const JOB_ID: &str = "library.populate-covers";

/// Preferred stems, best first
const COVER_STEMS: [&str; 3] = ["cover", "folder", "front"];
/// Accepted extensions, best first
const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "webp"];

pub struct CoversPlugin;

impl CoversPlugin {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CoversPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for CoversPlugin {
    fn id(&self) -> &str {
        PLUGIN_ID
    }

    fn name(&self) -> &str {
        "Cover art"
    }

    fn jobs(&self, ctx: &PluginContext) -> Vec<Arc<dyn Job>> {
        let Some(library) = super::library(ctx, PLUGIN_ID) else {
            return Vec::new();
        };

        let spec = JobSpec::new(JOB_ID, "Populate cover art")
            .with_description("Attach cover images found beside media files");
        let options = super::batch_options(ctx, PLUGIN_ID, BatchMode::Concurrent);

        vec![Arc::new(LibraryJob::new(
            spec,
            library,
            RecordFilter::missing_cover(),
            options,
            cover_operation,
        ))]
    }

    fn settings(&self) -> Option<SettingsSection> {
        Some(super::common_settings(self.name()))
    }
}

cadence_runtime::register_plugin!(id = PLUGIN_ID, order = 20, plugin = CoversPlugin::new);

fn cover_operation(library: Arc<MediaLibrary>) -> BatchOperation<MediaRecord> {
    BatchOperation::from_fn(move |record: MediaRecord| {
        let Some(dir) = record.path.parent() else {
            return Ok(());
        };
        let cover = find_cover(dir).map_err(|e| format!("{}: {e}", dir.display()))?;

        if let Some(cover) = cover {
            tracing::trace!(path = %record.path.display(), cover = %cover.display(), "Found cover art");
            library.stage_update(record.id, RecordPatch::cover_path(cover));
        }
        Ok::<(), String>(())
    })
}

/// Best cover image in `dir`, matched case-insensitively
pub fn find_cover(dir: &Path) -> io::Result<Option<PathBuf>> {
    let mut best: Option<((usize, usize), PathBuf)> = None;

    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(rank) = cover_rank(&path) else {
            continue;
        };
        if path.is_file() && best.as_ref().is_none_or(|(current, _)| rank < *current) {
            best = Some((rank, path));
        }
    }

    Ok(best.map(|(_, path)| path))
}

fn cover_rank(path: &Path) -> Option<(usize, usize)> {
    let stem = path.file_stem()?.to_str()?.to_ascii_lowercase();
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();

    let stem_rank = COVER_STEMS.iter().position(|s| *s == stem)?;
    let ext_rank = IMAGE_EXTENSIONS.iter().position(|e| *e == ext)?;
    Some((stem_rank, ext_rank))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::test_support::{import, run};
    use tempfile::tempdir;

    #[test]
    fn test_find_cover_prefers_cover_then_folder() {
        let dir = tempdir().unwrap();
        assert_eq!(find_cover(dir.path()).unwrap(), None);

        std::fs::write(dir.path().join("Front.PNG"), b"").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"").unwrap();
        assert_eq!(find_cover(dir.path()).unwrap(), Some(dir.path().join("Front.PNG")));

        std::fs::write(dir.path().join("folder.jpg"), b"").unwrap();
        assert_eq!(find_cover(dir.path()).unwrap(), Some(dir.path().join("folder.jpg")));

        std::fs::write(dir.path().join("cover.webp"), b"").unwrap();
        std::fs::write(dir.path().join("cover.jpeg"), b"").unwrap();
        assert_eq!(find_cover(dir.path()).unwrap(), Some(dir.path().join("cover.jpeg")));
    }

    #[tokio::test]
    async fn test_job_attaches_covers_where_present() {
        let dir = tempdir().unwrap();
        let library = Arc::new(MediaLibrary::open_in_memory().unwrap());
        let with_art = import(&library, dir.path(), "album/01.mp3", b"one");
        let without_art = import(&library, dir.path(), "single/02.mp3", b"two");
        std::fs::write(dir.path().join("album/cover.jpg"), b"jpeg").unwrap();

        let ctx = PluginContext::new().with_resource(Arc::clone(&library));
        let jobs = CoversPlugin::new().jobs(&ctx);
        run(&jobs[0]).await.unwrap();

        assert_eq!(
            library.get(with_art.id).unwrap().unwrap().cover_path,
            Some(dir.path().join("album/cover.jpg"))
        );
        assert_eq!(library.get(without_art.id).unwrap().unwrap().cover_path, None);
    }
}
