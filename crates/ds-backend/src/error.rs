//! Error types for coordination backends

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Coordination backend unavailable: {0}")]
    Unavailable(String),

    #[cfg(feature = "etcd")]
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Backend rejected request (status {status}, code {error_code}): {message}")]
    Api {
        status: u16,
        error_code: u32,
        message: String,
    },

    #[error("Watch index {requested} on {key} has been cleared (current index {current})")]
    EventIndexCleared {
        key: String,
        requested: u64,
        current: u64,
    },

    #[error("Failed to decode backend response: {0}")]
    Decode(String),
}

impl BackendError {
    /// True when the failure says nothing about the key, only about reaching the service
    pub fn is_unavailable(&self) -> bool {
        match self {
            BackendError::Unavailable(_) => true,
            #[cfg(feature = "etcd")]
            BackendError::Http(e) => e.is_connect() || e.is_timeout(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(e: serde_json::Error) -> Self {
        BackendError::Decode(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BackendError>;
