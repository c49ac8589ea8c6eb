//! Error types for the distributed lock

use std::time::Duration;

use ds_backend::BackendError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LockError {
    #[error("Coordination backend unavailable: {0}")]
    BackendUnavailable(#[from] BackendError),

    #[error("Lock {key} is not held by this session")]
    LockNotHeld { key: String },

    #[error("Lease on lock {key} expired or was taken over")]
    LockExpired { key: String },

    #[error("Unexpected watch action '{action}' on {key}")]
    UnexpectedWatchAction { key: String, action: String },

    #[error("Gave up waiting for lock {key} after {waited:?}")]
    WaitTimeout { key: String, waited: Duration },

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, LockError>;
