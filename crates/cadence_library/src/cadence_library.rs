//! Cadence Library - Persisted media collection
//!
//! A `redb`-backed store of media records. It is the persistence collaborator
//! the batch processor streams from: counting, keyset-paginated enumeration
//! and a single commit point for staged writes.

mod error;
mod library;
mod record;

pub use error::{LibraryError, LibraryResult};
pub use library::MediaLibrary;
pub use record::{MediaKind, MediaRecord, RecordFilter, RecordPatch};
