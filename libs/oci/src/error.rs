//! Errors from OCI transfer operations.

use std::io;

use thiserror::Error;

use crate::signature::SignatureError;

/// Errors from OCI operations.
#[derive(Debug, Error)]
pub enum OciError {
    #[error("request to {registry} failed for {reference}: {source}")]
    Http {
        registry: String,
        reference: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("unexpected status {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid reference `{reference}`: {reason}")]
    InvalidReference { reference: String, reason: String },

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("{reference} now resolves to {actual}, expected {expected}")]
    ReleaseChanged {
        reference: String,
        expected: String,
        actual: String,
    },

    #[error("unable to find a manifest matching the given platform: `{os}/{arch}`")]
    PlatformNotFound { os: String, arch: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("authentication required for {0}")]
    AuthRequired(String),

    #[error("unsupported media type `{0}`")]
    UnsupportedMediaType(String),

    #[error("artifact type `{0}` is not allowed")]
    TypeNotAllowed(String),

    #[error("signature verification failed: {0}")]
    Signature(#[from] SignatureError),

    #[error("extraction failed: {0}")]
    Extraction(String),

    #[error("invalid push request: {0}")]
    InvalidPush(String),
}

impl OciError {
    pub(crate) fn invalid_reference(reference: &str, reason: impl Into<String>) -> Self {
        Self::InvalidReference {
            reference: reference.to_string(),
            reason: reason.into(),
        }
    }

    /// Returns true for content-integrity failures.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, Self::DigestMismatch { .. } | Self::Signature(_))
    }
}
