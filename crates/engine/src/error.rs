use flagsync_core::CoreError;
use flagsync_storage::StorageError;
use thiserror::Error;

/// Failures reported by a `FlagGateway`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("flag not found: {0}")]
    NotFound(String),

    #[error("flag is static: {0}")]
    StaticFlag(String),
}

impl GatewayError {
    /// Only transport failures are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl From<StorageError> for GatewayError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(key) => GatewayError::NotFound(key),
            StorageError::StaticFlag(key) => GatewayError::StaticFlag(key),
            other => GatewayError::Transport(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("gateway error: {0}")]
    Gateway(GatewayError),

    #[error("flag not found: {0}")]
    NotFound(String),

    #[error("flag is static and cannot be mutated: {0}")]
    StaticFlag(String),

    #[error("mutation already in flight for flag: {0}")]
    MutationInFlight(String),

    #[error("mutation task ended unexpectedly: {0}")]
    Interrupted(String),

    #[error("invalid config: {0}")]
    Config(String),

    #[error("core error: {0}")]
    Core(#[from] CoreError),
}

impl From<GatewayError> for EngineError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::NotFound(key) => EngineError::NotFound(key),
            GatewayError::StaticFlag(key) => EngineError::StaticFlag(key),
            other => EngineError::Gateway(other),
        }
    }
}
