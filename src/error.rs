use crate::types::SeriesId;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error type for index construction, compaction and lookup.
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed, truncated or wrong-version binary input.
    #[error("Format error: {details}")]
    Format {
        details: String,
        path: Option<PathBuf>,
    },

    #[error("Invalid series: {0}")]
    InvalidSeries(String),

    /// An internal merge invariant was violated while compacting.
    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Handle is closed: {0}")]
    Closed(&'static str),

    #[error("Handle is not open: {0}")]
    NotOpen(&'static str),

    #[error("Series id not found: {0}")]
    NotFound(SeriesId),

    #[error("Series lookup failed: {0}")]
    Lookup(String),

    #[error("Compaction cancelled")]
    Cancelled,

    #[error("Lock acquisition failed: {0}")]
    LockError(String),

    #[error("Serialization Error: {0}")]
    Serialization(String),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IndexError {
    pub(crate) fn format(details: impl Into<String>, path: Option<&Path>) -> Self {
        IndexError::Format {
            details: details.into(),
            path: path.map(Path::to_path_buf),
        }
    }

    /// True when the input was rejected as not being a valid index or log artifact.
    pub fn is_format_error(&self) -> bool {
        matches!(self, IndexError::Format { .. })
    }
}

// Implement conversion from lock poison errors for convenience
impl<T> From<std::sync::PoisonError<T>> for IndexError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        IndexError::LockError(format!("Mutex/RwLock poisoned: {}", err))
    }
}
