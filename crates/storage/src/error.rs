use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("flag not found: {0}")]
    NotFound(String),

    #[error("flag is static and cannot be modified: {0}")]
    StaticFlag(String),

    #[error("duplicate flag key: {0}")]
    DuplicateKey(String),

    #[error("cache invalidation failed: {0}")]
    Invalidation(String),

    #[error("core error: {0}")]
    Core(#[from] flagsync_core::CoreError),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
