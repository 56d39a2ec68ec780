use thiserror::Error;

/// Custom error type for the engine operations.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Time series not found: {0}")]
    SeriesNotFound(String),

    #[error("Time series already exists: {0}")]
    SeriesAlreadyExists(String),

    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Bad input: {0}")]
    BadInput(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration Error: {0}")]
    ConfigError(String),

    #[error("Lock acquisition failed: {0}")]
    LockError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

// Implement conversion from lock poison errors for convenience
impl<T> From<std::sync::PoisonError<T>> for EngineError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        EngineError::LockError(format!("Mutex/RwLock poisoned: {}", err))
    }
}
