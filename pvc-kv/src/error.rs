//! Error types for the KV client facade.

use pvc_common::ClusterError;
use thiserror::Error;

/// Errors surfaced by KV operations.
#[derive(Error, Debug)]
pub enum KvError {
    /// The store is disconnected; writes must pause until it returns.
    #[error("KV store unavailable")]
    Unavailable,

    /// Compare-and-set failed because the key moved.
    #[error("CAS mismatch on {path}: expected version {expected:?}, found {actual:?}")]
    CasMismatch {
        path: String,
        expected: Option<u64>,
        actual: Option<u64>,
    },

    /// The key does not exist.
    #[error("Key not found: {0}")]
    NotFound(String),

    /// The session backing an ephemeral key or leadership has expired.
    #[error("Session expired")]
    SessionExpired,

    /// Value could not be decoded into the expected record type.
    #[error("Decode failed for {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    /// Value could not be encoded.
    #[error("Encode failed: {0}")]
    Encode(#[source] serde_json::Error),
}

impl From<KvError> for ClusterError {
    fn from(e: KvError) -> Self {
        match e {
            KvError::Unavailable => ClusterError::Transient("KV store unavailable".into()),
            KvError::CasMismatch { .. } => ClusterError::Conflict(e.to_string()),
            KvError::NotFound(path) => ClusterError::Invalid(format!("missing key: {}", path)),
            KvError::SessionExpired => ClusterError::Fatal("KV session expired".into()),
            KvError::Decode { .. } | KvError::Encode(_) => ClusterError::Invalid(e.to_string()),
        }
    }
}

/// Result type alias for KV operations.
pub type Result<T> = std::result::Result<T, KvError>;
