//! Storage-Node Client
//!
//! One HTTP/1.1 client per storage node, with keep-alive connection reuse, a
//! connect timeout that measures liveness (not socket attachment), a
//! separate idle discipline for streaming, and retry-with-backoff limited
//! strictly to connection setup.

pub mod body;
pub mod client;
pub mod registry;

pub use client::{SharkClient, SharkGetResponse, SharkResponse, UploadHandle};
pub use registry::SharkRegistry;

use thiserror::Error;

/// Status a storage node uses to reject a payload whose MD5 does not match
/// the declared Content-MD5.
pub const CHECKSUM_REJECT_STATUS: u16 = 469;

/// Response header in which a node reports the MD5 it computed while
/// receiving an upload.
pub const COMPUTED_MD5_HEADER: &str = "x-computed-content-md5";

/// How much of an error response body is kept for diagnostics
pub const ERROR_BODY_CAP: usize = 1024;

/// Storage-node client errors
#[derive(Debug, Error)]
pub enum SharkError {
    /// The node did not prove it was processing the request in time
    #[error("{storage_id}: no response within connect timeout")]
    ConnectTimeout { storage_id: String },

    /// TCP/TLS/handshake-level failure
    #[error("{storage_id}: connect failed: {detail}")]
    Connect { storage_id: String, detail: String },

    /// The node answered with an error status
    #[error("{storage_id}: backend returned {status}")]
    BackendStatus {
        storage_id: String,
        status: u16,
        headers: http::HeaderMap,
        body: String,
    },

    /// The node rejected the payload for an MD5 mismatch
    #[error("{storage_id}: backend rejected checksum")]
    ChecksumRejected { storage_id: String },

    /// The connection died while streaming the request body
    #[error("{storage_id}: upload stream broke: {detail}")]
    StreamBroken { storage_id: String, detail: String },

    /// No bytes arrived from the node within the idle window
    #[error("{storage_id}: stream idle too long")]
    IdleTimeout { storage_id: String },

    /// Transport-level failure outside the phases above
    #[error("{storage_id}: {source}")]
    Http {
        storage_id: String,
        source: hyper::Error,
    },
}

impl SharkError {
    pub fn storage_id(&self) -> &str {
        match self {
            SharkError::ConnectTimeout { storage_id }
            | SharkError::Connect { storage_id, .. }
            | SharkError::BackendStatus { storage_id, .. }
            | SharkError::ChecksumRejected { storage_id }
            | SharkError::StreamBroken { storage_id, .. }
            | SharkError::IdleTimeout { storage_id }
            | SharkError::Http { storage_id, .. } => storage_id,
        }
    }

    /// True for failures in the connect phase, the only phase the data
    /// plane may respond to by moving to another placement tuple.
    pub fn is_connect_failure(&self) -> bool {
        matches!(
            self,
            SharkError::ConnectTimeout { .. } | SharkError::Connect { .. }
        )
    }
}

pub type SharkResult<T> = Result<T, SharkError>;
