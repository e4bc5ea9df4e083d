//! Error types shared across the pipeline.

/// Failure reported by a collaborator (generator, sender, settings store).
#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    #[error("generation failed: {0}")]
    Generation(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("settings lookup failed: {0}")]
    Settings(String),
}

/// SQLite storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to encode whitelist: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<StorageError> for CollaboratorError {
    fn from(e: StorageError) -> Self {
        CollaboratorError::Settings(e.to_string())
    }
}
