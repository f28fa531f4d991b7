use cadence_runtime::StoreError;
use uuid::Uuid;

/// Errors from the media library
#[derive(Debug, thiserror::Error)]
pub enum LibraryError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Record not found: {0}")]
    NotFound(Uuid),
}

/// Result type for library operations
pub type LibraryResult<T> = Result<T, LibraryError>;

/// Map any redb error into `LibraryError::Database`
pub(crate) fn db<E: std::fmt::Display>(e: E) -> LibraryError {
    LibraryError::Database(e.to_string())
}

impl From<LibraryError> for StoreError {
    fn from(e: LibraryError) -> Self {
        match e {
            LibraryError::Database(msg) => StoreError::Backend(msg),
            LibraryError::Serialization(e) => StoreError::Serialization(e.to_string()),
            LibraryError::Io(e) => StoreError::Backend(e.to_string()),
            LibraryError::NotFound(id) => StoreError::NotFound(id.to_string()),
        }
    }
}
