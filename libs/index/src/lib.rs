//! # artifactctl-index
//!
//! Resolves short artifact names against the configured indexes.
//!
//! An index maps artifact names to registry coordinates. Several indexes can
//! be configured; [`IndexCache`] merges them into a single read-only view
//! where the earliest-loaded definition of a name wins.
//!
//! ```text
//! "k8saudit-rules"      -> ghcr.io/example/rules/k8saudit:latest
//! "k8saudit-rules:0.5"  -> ghcr.io/example/rules/k8saudit:0.5
//! "ghcr.io/org/repo:1"  -> ghcr.io/org/repo:1 (unchanged)
//! ```

mod backend;
mod cache;
mod entry;
mod error;

pub use backend::{
    infer_backend, BackendError, BackendRegistry, FileBackend, GcsBackend, HttpBackend, IndexBackend,
};
pub use cache::{IndexCache, IndexConfig, DEFAULT_TAG};
pub use entry::{CosignSignature, Index, IndexEntry, Maintainer, Signature};
pub use error::IndexError;
