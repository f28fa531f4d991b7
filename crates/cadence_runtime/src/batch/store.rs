//! Store contract the batch processor depends on
//!
//! Three operations: count matching records, fetch the next batch after a
//! key, and commit staged writes. Implementations are synchronous; the
//! processor calls them on the blocking pool.

use std::fmt;

/// Errors reported by a record store
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Storage task failed: {0}")]
    Task(String),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// A record that can be enumerated in key order
pub trait BatchRecord: Send + 'static {
    /// Enumeration key; batches resume strictly after the last key seen
    type Key: Clone + fmt::Debug + Send + Sync + 'static;

    fn key(&self) -> Self::Key;
}

/// Persisted collection the batch processor streams from
pub trait RecordStore: Send + Sync + 'static {
    type Record: BatchRecord;
    type Filter: Send + Sync + 'static;

    /// Number of records currently matching `filter`
    fn count(&self, filter: &Self::Filter) -> StoreResult<usize>;

    /// Up to `limit` matching records with keys strictly greater than `after`,
    /// in ascending key order
    fn fetch_batch(
        &self,
        filter: &Self::Filter,
        after: Option<&<Self::Record as BatchRecord>::Key>,
        limit: usize,
    ) -> StoreResult<Vec<Self::Record>>;

    /// Persist staged writes
    fn commit(&self) -> StoreResult<()>;
}
