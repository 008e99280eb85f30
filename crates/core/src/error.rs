use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum CoreError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("unknown flag category: {0}")]
    UnknownCategory(String),

    #[error("unknown flag status: {0}")]
    UnknownStatus(String),

    #[error("duplicate flag key: {0}")]
    DuplicateKey(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Serialization(err.to_string())
    }
}
