//! Error types for index loading and reference resolution.

use thiserror::Error;

use crate::backend::BackendError;

/// Errors raised while building the index cache or resolving names.
#[derive(Debug, Error)]
pub enum IndexError {
    /// The name is not defined by any configured index.
    #[error("cannot find `{0}` among the configured indexes")]
    NotFound(String),

    /// The reference could not be parsed.
    #[error("invalid reference `{reference}`: {reason}")]
    InvalidReference { reference: String, reason: String },

    /// No backend is registered for the requested kind.
    #[error("unsupported index backend `{0}`")]
    UnsupportedBackend(String),

    /// The index source could not be fetched.
    #[error("unable to fetch index `{name}` from {url}: {source}")]
    Unreachable {
        name: String,
        url: String,
        #[source]
        source: BackendError,
    },

    /// A backend could not be constructed.
    #[error("failed to initialize index backend: {0}")]
    Backend(#[from] BackendError),

    /// The index data could not be parsed.
    #[error("malformed index `{name}`: {source}")]
    Malformed {
        name: String,
        #[source]
        source: serde_yaml::Error,
    },

    /// The index configuration is invalid.
    #[error("invalid index configuration: {0}")]
    InvalidConfig(String),
}

impl IndexError {
    /// Returns true if the error means a name was not found.
    pub fn is_not_found(&self) -> bool {
        matches!(self, IndexError::NotFound(_))
    }
}
