//! Error types for leader election

use ds_backend::BackendError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ElectionError {
    #[error("Coordination backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Failed to refresh election node {key}: value changed or lease lost")]
    RefreshFailed { key: String },

    #[error("Already running")]
    AlreadyRunning,

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ElectionError>;
