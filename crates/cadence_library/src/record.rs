//! Media records and the filters that select them

use std::path::{Path, PathBuf};

use cadence_runtime::BatchRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of media a record points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Audiobook,
    Video,
}

impl MediaKind {
    /// Classify a file by extension
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "mp3" | "flac" | "ogg" | "opus" | "wav" | "m4a" | "aac" | "wma" | "aiff" => Some(Self::Audio),
            "m4b" | "aax" => Some(Self::Audiobook),
            "mp4" | "mkv" | "mov" | "avi" | "webm" | "m4v" => Some(Self::Video),
            _ => None,
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Audio => "audio",
            Self::Audiobook => "audiobook",
            Self::Video => "video",
        };
        f.write_str(name)
    }
}

/// One media file known to the library
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRecord {
    pub id: Uuid,
    pub path: PathBuf,
    pub title: String,
    pub kind: MediaKind,
    /// File size in bytes at import
    pub size: u64,
    #[serde(default)]
    pub modified: Option<DateTime<Utc>>,
    pub added_at: DateTime<Utc>,

    /// Hex SHA-256 of the file contents
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover_path: Option<PathBuf>,

    /// Earlier record with identical contents
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicate_of: Option<Uuid>,
}

impl MediaRecord {
    /// New record for `path`; the title defaults to the file stem
    pub fn new(path: impl Into<PathBuf>, kind: MediaKind, size: u64) -> Self {
        let path = path.into();
        let title = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        Self {
            id: Uuid::new_v4(),
            path,
            title,
            kind,
            size,
            modified: None,
            added_at: Utc::now(),
            content_hash: None,
            cover_path: None,
            duplicate_of: None,
        }
    }

    pub fn with_modified(mut self, modified: DateTime<Utc>) -> Self {
        self.modified = Some(modified);
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }
}

impl BatchRecord for MediaRecord {
    type Key = Uuid;

    fn key(&self) -> Uuid {
        self.id
    }
}

/// Field changes staged against a stored record
///
/// Patches touch only the fields they carry, so jobs enriching different
/// fields of the same record never overwrite each other.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordPatch {
    pub content_hash: Option<String>,
    pub cover_path: Option<PathBuf>,
    /// `Some(None)` clears the link
    pub duplicate_of: Option<Option<Uuid>>,
}

impl RecordPatch {
    pub fn content_hash(hash: impl Into<String>) -> Self {
        Self {
            content_hash: Some(hash.into()),
            ..Default::default()
        }
    }

    pub fn cover_path(path: impl Into<PathBuf>) -> Self {
        Self {
            cover_path: Some(path.into()),
            ..Default::default()
        }
    }

    pub fn duplicate_of(original: Option<Uuid>) -> Self {
        Self {
            duplicate_of: Some(original),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.content_hash.is_none() && self.cover_path.is_none() && self.duplicate_of.is_none()
    }

    /// Fold a later patch into this one; later fields win
    pub fn merge(&mut self, later: RecordPatch) {
        if later.content_hash.is_some() {
            self.content_hash = later.content_hash;
        }
        if later.cover_path.is_some() {
            self.cover_path = later.cover_path;
        }
        if later.duplicate_of.is_some() {
            self.duplicate_of = later.duplicate_of;
        }
    }

    pub fn apply(&self, record: &mut MediaRecord) {
        if let Some(hash) = &self.content_hash {
            record.content_hash = Some(hash.clone());
        }
        if let Some(cover) = &self.cover_path {
            record.cover_path = Some(cover.clone());
        }
        if let Some(original) = self.duplicate_of {
            record.duplicate_of = original;
        }
    }
}

/// Selects records for counting and enumeration
///
/// All set conditions must hold. The default filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub kind: Option<MediaKind>,
    pub missing_hash: bool,
    pub missing_cover: bool,
    pub hashed: bool,
}

impl RecordFilter {
    pub fn all() -> Self {
        Self::default()
    }

    /// Records whose contents have not been hashed yet
    pub fn missing_hash() -> Self {
        Self {
            missing_hash: true,
            ..Default::default()
        }
    }

    pub fn missing_cover() -> Self {
        Self {
            missing_cover: true,
            ..Default::default()
        }
    }

    pub fn hashed() -> Self {
        Self {
            hashed: true,
            ..Default::default()
        }
    }

    pub fn with_kind(mut self, kind: MediaKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn matches(&self, record: &MediaRecord) -> bool {
        self.kind.is_none_or(|kind| record.kind == kind)
            && (!self.missing_hash || record.content_hash.is_none())
            && (!self.missing_cover || record.cover_path.is_none())
            && (!self.hashed || record.content_hash.is_some())
    }
}
