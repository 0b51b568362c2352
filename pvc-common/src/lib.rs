//! # PVC Common
//!
//! Shared plumbing for the PVC node daemon: logging initialization and
//! the cluster-wide error taxonomy used by every controller.

pub mod error;
pub mod logging;

pub use error::{retry_with_backoff, ClusterError, RetryPolicy};
pub use logging::{init_logging, init_logging_json};
