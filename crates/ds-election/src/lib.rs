//! Leader Election
//!
//! Elects one master among any number of participants sharing a
//! coordination backend.
//!
//! # Features
//!
//! - **Ordered keys**: the oldest live sequential node under the election key wins
//! - **Lease refresh**: each participant keeps its node alive with compare-and-swap
//! - **Role handlers**: caller work started on every role transition and cancelled
//!   before the next one starts
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ds_backend::MemoryBackend;
//! use ds_election::{role_handler, ElectionConfig, ElectionParticipant};
//! use tokio_util::sync::CancellationToken;
//!
//! async fn example() {
//!     let backend = Arc::new(MemoryBackend::new());
//!     let config = ElectionConfig::new(15).with_instance_id("node-a".to_string());
//!
//!     let participant = ElectionParticipant::new(
//!         backend,
//!         config,
//!         role_handler(|token: CancellationToken| async move {
//!             // master-only work until the role is lost
//!             token.cancelled().await;
//!         }),
//!         role_handler(|token: CancellationToken| async move {
//!             token.cancelled().await;
//!         }),
//!     )
//!     .unwrap();
//!
//!     participant.run(CancellationToken::new()).await.unwrap();
//! }
//! ```

mod config;
mod error;
mod participant;
mod supervisor;

pub use config::{ElectionConfig, RefreshFailurePolicy, DEFAULT_ELECTION_KEY};
pub use error::{ElectionError, Result};
pub use participant::{ElectionParticipant, ParticipantState};
pub use supervisor::{role_handler, Role, RoleHandler, RoleHandlerSupervisor};
