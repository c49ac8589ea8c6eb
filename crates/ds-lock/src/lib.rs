//! dsync Distributed Lock
//!
//! Mutual exclusion across processes on top of a [`ds_backend::CoordinationBackend`]:
//!
//! - **Acquire**: atomic create-if-absent of `prefix + name` with a fresh UUID token
//! - **Contention**: watch the key until it is deleted or expires, then retry
//! - **Renewal**: background loop refreshes the lease by compare-and-swap on the token
//! - **Release**: compare-and-delete on the token, exactly once
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ds_backend::MemoryBackend;
//! use ds_lock::DistributedLockService;
//! use futures::FutureExt;
//!
//! async fn example() -> Result<(), ds_lock::LockError> {
//!     let service = DistributedLockService::new(Arc::new(MemoryBackend::new()));
//!
//!     let session = service.acquire("orders", 15).await?;
//!     // exclusive work
//!     session.release().await?;
//!
//!     // Or scoped: released on every exit path
//!     service.with_lock("orders", 15, |_session| async move {
//!         // exclusive work
//!     }.boxed()).await?;
//!     Ok(())
//! }
//! ```

mod error;
mod service;
mod session;

pub use error::{LockError, Result};
pub use service::{DistributedLockService, LockServiceConfig, DEFAULT_LOCK_PREFIX};
pub use session::{LockSession, LockState};
