//! dsync shared plumbing: logging setup and shutdown signalling used by every binary.

pub mod logging;
pub mod shutdown;

pub use shutdown::shutdown_on_ctrl_c;
