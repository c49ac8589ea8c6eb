//! dsync Coordination Backend
//!
//! The capability interface the lock and election crates are written against, plus two
//! implementations:
//!
//! - [`EtcdClient`]: etcd v2 keys API over HTTP (feature `etcd`, on by default)
//! - [`MemoryBackend`]: in-process backend with the same semantics, for tests and dev mode
//!
//! Every operation that can establish or prove ownership is atomic on the backend side
//! (create-if-absent, compare-and-swap, compare-and-delete); callers never need in-process
//! locks for cross-process exclusion.

use async_trait::async_trait;

pub mod error;
pub mod memory;
pub mod node;

#[cfg(feature = "etcd")]
pub mod etcd;

pub use error::{BackendError, Result};
pub use memory::MemoryBackend;
pub use node::{CreateOutcome, DeleteOutcome, Node, SwapOutcome, WatchAction, WatchEvent};

#[cfg(feature = "etcd")]
pub use etcd::{EtcdClient, EtcdClientConfig};

/// Key-value coordination service with TTL leases, atomic conditional writes,
/// ordered keys and watches.
///
/// A `ttl_seconds` of 0 means the key never expires.
#[async_trait]
pub trait CoordinationBackend: Send + Sync {
    /// Atomically create `key` only if it does not exist
    async fn create_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: u64,
    ) -> Result<CreateOutcome>;

    /// Create a child of `parent_key` whose name sorts after every earlier child
    async fn create_sequential(
        &self,
        parent_key: &str,
        value: &str,
        ttl_seconds: u64,
    ) -> Result<Node>;

    /// Write `new_value` only if the stored value equals `expected`
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        new_value: &str,
        ttl_seconds: u64,
    ) -> Result<SwapOutcome>;

    /// Delete `key` only if the stored value equals `expected`
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<DeleteOutcome>;

    /// Unconditional write. Only for keys whose ownership is not established yet.
    async fn set(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<Node>;

    /// Direct children of `key`, sorted by creation order. A missing directory is empty.
    async fn list_sorted(&self, key: &str) -> Result<Vec<Node>>;

    /// Suspend until `key` changes. With `wait_index`, events at or after that index are
    /// delivered even if they happened before the call.
    async fn watch(&self, key: &str, wait_index: Option<u64>) -> Result<WatchEvent>;
}
