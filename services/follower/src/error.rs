//! Error types for the follower.

use artifactctl_index::IndexError;
use artifactctl_oci::{OciError, SignatureError};
use thiserror::Error;

use crate::backoff::BackoffError;
use crate::deps::DependencyError;
use crate::gate::CompatibilityError;
use crate::schedule::ScheduleError;
use crate::versions::VersionsError;

#[derive(Debug, Error)]
pub enum FollowError {
    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Oci(#[from] OciError),

    #[error(transparent)]
    Compatibility(#[from] CompatibilityError),

    #[error("dependency resolution failed: {0}")]
    Dependency(#[from] DependencyError),

    #[error(transparent)]
    Backoff(#[from] BackoffError),

    #[error("failed to retrieve engine versions: {0}")]
    Versions(#[from] VersionsError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error("signature policy for {reference}: {source}")]
    Signature {
        reference: String,
        #[source]
        source: SignatureError,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("follow session cancelled during startup")]
    Cancelled,
}
