use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    #[error("Storage unavailable: {0}")]
    FatalStorage(String),

    #[error("File system error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Errors that mean "nothing usable is stored here", as opposed to a broken backend.
    pub fn is_miss(&self) -> bool {
        matches!(
            self,
            StoreError::NotFound(_) | StoreError::Validation(_) | StoreError::Authentication(_)
        )
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        StoreError::FatalStorage(format!("storage task failed: {}", err))
    }
}
