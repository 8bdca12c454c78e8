//! Error Taxonomy
//!
//! Every error that can reach a client is one of the kinds below. Each kind
//! carries a stable code string and an HTTP status; internal context (which
//! shark failed, what the index said) is logged where the error is raised and
//! never leaks into the response body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Result type used throughout the crate
pub type MuskieResult<T> = Result<T, MuskieError>;

/// Public error taxonomy
#[derive(Debug, Error)]
pub enum MuskieError {
    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid limit: {0}")]
    InvalidLimit(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("unknown role tag: {0}")]
    InvalidRoleTag(String),

    #[error("invalid durability level: {0}")]
    InvalidDurabilityLevel(String),

    #[error("invalid link: {0}")]
    InvalidLink(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("authentication required")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("no matching role tag")]
    NoMatchingRoleTag,

    #[error("authorization failed: {0}")]
    Authorization(String),

    #[error("{0} was not found")]
    ResourceNotFound(String),

    #[error("link source {0} was not found")]
    LinkNotFound(String),

    #[error("method not allowed")]
    MethodNotAllowed,

    #[error("not acceptable")]
    NotAcceptable,

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// An optimistic-concurrency conflict against the metadata index.
    #[error("concurrent request detected")]
    ConcurrentRequest,

    #[error("directory {0} is not empty")]
    DirectoryNotEmpty(String),

    #[error("{0}")]
    DirectoryOperation(String),

    #[error("parent {0} is not a directory")]
    ParentNotDirectory(String),

    #[error("directory {0} does not exist")]
    DirectoryDoesNotExist(String),

    #[error("directory {0} is at its entry limit")]
    DirectoryLimit(String),

    #[error("{0} is a root directory")]
    RootDirectory(String),

    #[error("link source {0} is not an object")]
    LinkNotObject(String),

    /// A storage node rejected the payload for an MD5 mismatch.
    #[error("content-md5 did not match the streamed data")]
    Checksum,

    #[error("request exceeded maximum content length")]
    MaxContentLength,

    #[error("upload exceeded {0} bytes")]
    MaxSizeExceeded(u64),

    #[error("requested range cannot be satisfied")]
    RangeNotSatisfiable,

    /// Admission control shed this request. The queue/in-flight counts are
    /// for audit logging only and never serialized to the client.
    #[error("the system is currently unable to handle the request")]
    Throttled {
        queued: usize,
        in_flight: usize,
        concurrency: usize,
    },

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("not enough free space: {0}")]
    NotEnoughSpace(String),

    #[error("no storage node set could be fully provisioned")]
    SharksExhausted,

    #[error("upload idle for too long")]
    UploadTimeout,

    #[error("upload abandoned")]
    UploadAbandoned,

    #[error("internal error")]
    Internal(String),
}

impl MuskieError {
    /// Stable code string exposed to clients
    pub fn code(&self) -> &'static str {
        match self {
            MuskieError::InvalidPath(_) => "InvalidPath",
            MuskieError::InvalidLimit(_) => "InvalidLimit",
            MuskieError::InvalidParameter(_) => "InvalidParameter",
            MuskieError::InvalidRoleTag(_) => "InvalidRoleTag",
            MuskieError::InvalidDurabilityLevel(_) => "InvalidDurabilityLevel",
            MuskieError::InvalidLink(_) => "InvalidLink",
            MuskieError::BadRequest(_) => "BadRequest",
            MuskieError::Unauthorized => "Unauthorized",
            MuskieError::Forbidden => "Forbidden",
            MuskieError::NoMatchingRoleTag => "NoMatchingRoleTag",
            MuskieError::Authorization(_) => "AuthorizationError",
            MuskieError::ResourceNotFound(_) => "ResourceNotFound",
            MuskieError::LinkNotFound(_) => "LinkNotFound",
            MuskieError::MethodNotAllowed => "MethodNotAllowed",
            MuskieError::NotAcceptable => "NotAcceptable",
            MuskieError::NotImplemented(_) => "NotImplemented",
            MuskieError::PreconditionFailed(_) => "PreconditionFailed",
            MuskieError::ConcurrentRequest => "ConcurrentRequestError",
            MuskieError::DirectoryNotEmpty(_) => "DirectoryNotEmpty",
            MuskieError::DirectoryOperation(_) => "DirectoryOperation",
            MuskieError::ParentNotDirectory(_) => "ParentNotDirectory",
            MuskieError::DirectoryDoesNotExist(_) => "DirectoryDoesNotExist",
            MuskieError::DirectoryLimit(_) => "DirectoryLimit",
            MuskieError::RootDirectory(_) => "RootDirectory",
            MuskieError::LinkNotObject(_) => "LinkNotObject",
            MuskieError::Checksum => "ChecksumError",
            MuskieError::MaxContentLength => "MaxContentLength",
            MuskieError::MaxSizeExceeded(_) => "MaxSizeExceeded",
            MuskieError::RangeNotSatisfiable => "RequestedRangeNotSatisfiable",
            MuskieError::Throttled { .. } => "ThrottledError",
            MuskieError::ServiceUnavailable(_) => "ServiceUnavailable",
            MuskieError::NotEnoughSpace(_) => "NotEnoughSpace",
            MuskieError::SharksExhausted => "SharksExhausted",
            MuskieError::UploadTimeout => "UploadTimeout",
            MuskieError::UploadAbandoned => "UploadAbandoned",
            MuskieError::Internal(_) => "InternalError",
        }
    }

    /// HTTP status for this kind
    pub fn status(&self) -> u16 {
        match self {
            MuskieError::InvalidPath(_)
            | MuskieError::InvalidLimit(_)
            | MuskieError::InvalidParameter(_)
            | MuskieError::InvalidRoleTag(_)
            | MuskieError::InvalidDurabilityLevel(_)
            | MuskieError::InvalidLink(_)
            | MuskieError::BadRequest(_)
            | MuskieError::DirectoryNotEmpty(_)
            | MuskieError::DirectoryOperation(_)
            | MuskieError::ParentNotDirectory(_)
            | MuskieError::RootDirectory(_)
            | MuskieError::LinkNotObject(_)
            | MuskieError::Checksum
            | MuskieError::MaxContentLength => 400,
            MuskieError::Unauthorized => 401,
            MuskieError::Forbidden
            | MuskieError::NoMatchingRoleTag
            | MuskieError::Authorization(_) => 403,
            MuskieError::ResourceNotFound(_)
            | MuskieError::LinkNotFound(_)
            | MuskieError::DirectoryDoesNotExist(_) => 404,
            MuskieError::MethodNotAllowed => 405,
            MuskieError::NotAcceptable => 406,
            MuskieError::DirectoryLimit(_) => 409,
            MuskieError::PreconditionFailed(_) | MuskieError::ConcurrentRequest => 412,
            MuskieError::MaxSizeExceeded(_) => 413,
            MuskieError::RangeNotSatisfiable => 416,
            MuskieError::UploadTimeout | MuskieError::UploadAbandoned => 499,
            MuskieError::Internal(_) => 500,
            MuskieError::NotImplemented(_) => 501,
            MuskieError::Throttled { .. } | MuskieError::ServiceUnavailable(_) => 503,
            MuskieError::NotEnoughSpace(_) | MuskieError::SharksExhausted => 507,
        }
    }

    /// True when the kind indicates the client may retry unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MuskieError::Throttled { .. }
                | MuskieError::ServiceUnavailable(_)
                | MuskieError::ConcurrentRequest
        )
    }
}

/// Wire shape of an error response body
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

impl MuskieError {
    /// Render the client-visible body for this error
    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            code: self.code(),
            message: self.to_string(),
        }
    }
}

impl IntoResponse for MuskieError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.body())).into_response()
    }
}
