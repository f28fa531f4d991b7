//! Media import
//!
//! Walks media roots and adds a record for every recognised media file the
//! library doesn't know yet. Symlinks are not followed and hidden entries
//! are skipped.

use std::path::{Path, PathBuf};

use cadence_library::{LibraryError, MediaKind, MediaLibrary, MediaRecord};
use chrono::{DateTime, Utc};
use serde::Serialize;
use walkdir::{DirEntry, WalkDir};

/// Records written per insert transaction
const INSERT_CHUNK: usize = 512;

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    #[error("Not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error(transparent)]
    Library(#[from] LibraryError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    /// Media files found under the roots
    pub discovered: usize,
    /// New records written
    pub imported: usize,
    /// Files the library already had
    pub already_known: usize,
    /// Entries that couldn't be read
    pub errors: usize,
}

/// Import every new media file under `roots`
pub fn scan(library: &MediaLibrary, roots: &[PathBuf]) -> Result<ScanReport, ScanError> {
    let mut known = library.known_paths()?;
    let mut report = ScanReport::default();
    let mut pending = Vec::new();

    for root in roots {
        let root = validate_root(root)?;
        tracing::info!(root = %root.display(), "Scanning media root");

        let walker = WalkDir::new(&root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_hidden(e));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(error = %e, "Error accessing entry");
                    report.errors += 1;
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(kind) = MediaKind::from_path(entry.path()) else {
                continue;
            };

            report.discovered += 1;
            if !known.insert(entry.path().to_path_buf()) {
                report.already_known += 1;
                continue;
            }

            match to_record(&entry, kind) {
                Ok(record) => pending.push(record),
                Err(e) => {
                    tracing::warn!(path = %entry.path().display(), error = %e, "Failed to read file metadata");
                    report.errors += 1;
                }
            }

            if pending.len() >= INSERT_CHUNK {
                report.imported += library.insert_many(&pending)?;
                pending.clear();
            }
        }
    }

    report.imported += library.insert_many(&pending)?;
    tracing::info!(
        discovered = report.discovered,
        imported = report.imported,
        already_known = report.already_known,
        errors = report.errors,
        "Scan complete"
    );
    Ok(report)
}

fn validate_root(root: &Path) -> Result<PathBuf, ScanError> {
    if !root.exists() {
        return Err(ScanError::PathNotFound(root.to_path_buf()));
    }
    if !root.is_dir() {
        return Err(ScanError::NotADirectory(root.to_path_buf()));
    }
    // Absolute paths keep records stable across working directories
    Ok(root.canonicalize().unwrap_or_else(|_| root.to_path_buf()))
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.file_name().to_string_lossy().starts_with('.')
}

fn to_record(entry: &DirEntry, kind: MediaKind) -> std::io::Result<MediaRecord> {
    let metadata = entry.metadata().map_err(std::io::Error::other)?;
    let record = MediaRecord::new(entry.path(), kind, metadata.len());

    Ok(match metadata.modified() {
        Ok(modified) => record.with_modified(DateTime::<Utc>::from(modified)),
        Err(_) => record,
    })
}
