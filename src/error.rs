use thiserror::Error;

/// Errors produced by the input pipeline.
#[derive(Debug, Error)]
pub enum InputError {
    /// Registry or device lookup miss
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation not valid for the value it was called on (e.g. hat semantics on a button)
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Invalid key name: {0}")]
    InvalidKeyName(String),

    /// Failure while talking to a backend during one poll or dispatch cycle
    #[error("Backend error: {0}")]
    BackendTransient(String),

    /// `stop()` could not confirm that a worker finished within its join attempt
    #[error("Shutdown timeout: {0}")]
    ShutdownTimeout(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Inter-process channel failure
    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Thread error: {0}")]
    ThreadError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
