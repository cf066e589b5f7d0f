use thiserror::Error;

/// The crate-wide error type. One variant per failure category named in
/// the error handling design: malformed input, validation, missing
/// resource, LM failure, and persistence failure are handled at the
/// boundary that owns them; this enum only carries what actually crosses
/// a function boundary.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("store file is malformed: {0}")]
    MalformedStore(String),

    #[error("language model unavailable: {0}")]
    LmUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

impl<T> From<std::sync::PoisonError<T>> for RuntimeError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::Internal(format!("lock poisoned: {err}"))
    }
}
