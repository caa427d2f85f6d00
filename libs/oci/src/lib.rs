//! OCI content transfer for artifactctl.
//!
//! Pulls and pushes rulesfiles, plugins and assets stored as OCI artifacts:
//! - [`Reference`] parsing for `registry/repository[:tag][@digest]`
//! - [`RegistryClient`] speaking the distribution API with bearer/basic auth
//! - [`Puller`] with platform selection, digest and signature verification
//!   and atomic installation
//! - [`Pusher`] for single and multi-platform artifacts

pub mod auth;
pub mod client;
pub mod error;
pub mod extract;
pub mod manifest;
pub mod platform;
pub mod puller;
pub mod pusher;
pub mod reference;
pub mod signature;

pub use auth::{Credential, CredentialStore, NoCredentials, StaticCredentials};
pub use client::{ClientConfig, FetchedManifest, RegistryClient};
pub use error::OciError;
pub use manifest::{
    sha256_digest, Alternative, ArtifactConfig, ArtifactType, Dependency, Descriptor, ImageIndex,
    Manifest, ManifestDocument, Requirement,
};
pub use platform::Platform;
pub use puller::{PullOptions, PullResult, Puller, Resolved, TargetDirs};
pub use pusher::{PushLayer, PushRequest, PushResult, Pusher};
pub use reference::Reference;
pub use signature::{PublicKey, SignatureError, SignaturePolicy};
