//! High-level artifact puller.
//!
//! Everything is fetched and verified before the first byte is written:
//! manifests and blobs are checked against their digests, the signature policy
//! is enforced, and only then are content layers extracted into the target
//! directory for the artifact's type.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, info};

use crate::client::RegistryClient;
use crate::error::OciError;
use crate::extract;
use crate::manifest::{ArtifactConfig, ArtifactType, Manifest, ManifestDocument};
use crate::platform::Platform;
use crate::reference::Reference;
use crate::signature::{self, SignaturePolicy};

/// Install directories per artifact type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetDirs {
    pub rulesfile: PathBuf,
    pub plugin: PathBuf,
    pub asset: PathBuf,
}

impl TargetDirs {
    /// Every type installs into the same directory.
    pub fn all(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            rulesfile: dir.clone(),
            plugin: dir.clone(),
            asset: dir,
        }
    }

    pub fn for_type(&self, artifact_type: ArtifactType) -> &Path {
        match artifact_type {
            ArtifactType::Rulesfile => &self.rulesfile,
            ArtifactType::Plugin => &self.plugin,
            ArtifactType::Asset => &self.asset,
        }
    }
}

/// Per-pull options.
#[derive(Debug, Clone)]
pub struct PullOptions {
    pub platform: Platform,
    pub policy: SignaturePolicy,
    /// When set, artifacts of other types are refused.
    pub allowed_types: Option<Vec<ArtifactType>>,
    /// Platform manifest digest the reference must resolve to.
    pub expected_digest: Option<String>,
}

impl Default for PullOptions {
    fn default() -> Self {
        Self {
            platform: Platform::current(),
            policy: SignaturePolicy::Disabled,
            allowed_types: None,
            expected_digest: None,
        }
    }
}

impl PullOptions {
    fn check_allowed(&self, artifact_type: ArtifactType) -> Result<(), OciError> {
        match &self.allowed_types {
            Some(allowed) if !allowed.contains(&artifact_type) => {
                Err(OciError::TypeNotAllowed(artifact_type.to_string()))
            }
            _ => Ok(()),
        }
    }

    fn check_expected(&self, reference: &Reference, digest: &str) -> Result<(), OciError> {
        match &self.expected_digest {
            Some(expected) if expected != digest => Err(OciError::ReleaseChanged {
                reference: reference.to_string(),
                expected: expected.clone(),
                actual: digest.to_string(),
            }),
            _ => Ok(()),
        }
    }
}

/// A reference resolved down to one platform's manifest.
#[derive(Debug, Clone)]
pub struct Resolved {
    /// Digest of the manifest the reference points at (possibly an index).
    pub top_digest: String,
    /// Digest of the platform-specific manifest.
    pub digest: String,
    pub manifest: Manifest,
    pub artifact_type: ArtifactType,
}

/// Result of a successful pull.
#[derive(Debug, Clone)]
pub struct PullResult {
    pub reference: Reference,
    /// Digest of the platform-specific manifest that was installed.
    pub digest: String,
    pub artifact_type: ArtifactType,
    pub config: ArtifactConfig,
    /// Top-level paths written under the target directory.
    pub installed: Vec<PathBuf>,
}

/// Pulls artifacts from OCI registries.
#[derive(Clone)]
pub struct Puller {
    client: Arc<RegistryClient>,
}

impl Puller {
    pub fn new(client: Arc<RegistryClient>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &RegistryClient {
        &self.client
    }

    /// Resolve `reference` to the manifest for `platform`.
    pub async fn resolve(
        &self,
        reference: &Reference,
        platform: &Platform,
    ) -> Result<Resolved, OciError> {
        let top = self.client.fetch_manifest(reference).await?;
        let top_digest = top.digest.clone();

        let (digest, manifest) = match top.document {
            ManifestDocument::Image(manifest) => (top.digest, manifest),
            ManifestDocument::Index(index) => {
                let entry = index.select(platform)?;
                debug!(
                    reference = %reference,
                    platform = %platform,
                    digest = %entry.digest,
                    "Selected platform manifest"
                );
                let fetched = self
                    .client
                    .fetch_manifest(&reference.with_digest(&entry.digest))
                    .await?;
                match fetched.document {
                    ManifestDocument::Image(manifest) => (fetched.digest, manifest),
                    ManifestDocument::Index(_) => {
                        return Err(OciError::UnsupportedMediaType(
                            "nested manifest list".to_string(),
                        ))
                    }
                }
            }
        };

        let artifact_type = manifest.artifact_type()?;
        Ok(Resolved {
            top_digest,
            digest,
            manifest,
            artifact_type,
        })
    }

    /// Fetch the config layer without decoding it.
    pub async fn raw_config(
        &self,
        reference: &Reference,
        platform: &Platform,
    ) -> Result<Bytes, OciError> {
        let resolved = self.resolve(reference, platform).await?;
        self.client
            .fetch_blob(reference, &resolved.manifest.config)
            .await
    }

    /// Fetch and decode the artifact config.
    pub async fn config(
        &self,
        reference: &Reference,
        platform: &Platform,
    ) -> Result<ArtifactConfig, OciError> {
        let raw = self.raw_config(reference, platform).await?;
        ArtifactConfig::from_bytes(&raw)
    }

    /// Pull `reference` and install it under the directory for its type.
    pub async fn pull(
        &self,
        reference: &Reference,
        dirs: &TargetDirs,
        options: &PullOptions,
    ) -> Result<PullResult, OciError> {
        let start = Instant::now();
        let resolved = self.resolve(reference, &options.platform).await?;
        options.check_expected(reference, &resolved.digest)?;
        options.check_allowed(resolved.artifact_type)?;

        if options.policy.is_enabled() {
            signature::verify(&self.client, reference, &resolved.top_digest, &options.policy)
                .await?;
        }

        let raw_config = self
            .client
            .fetch_blob(reference, &resolved.manifest.config)
            .await?;
        let config = ArtifactConfig::from_bytes(&raw_config)?;

        let layer_type = resolved.artifact_type.layer_media_type();
        let mut layers = Vec::new();
        for descriptor in resolved
            .manifest
            .layers
            .iter()
            .filter(|l| l.media_type == layer_type)
        {
            layers.push(self.client.fetch_blob(reference, descriptor).await?);
        }
        if layers.is_empty() {
            return Err(OciError::NotFound(format!(
                "no `{layer_type}` layer in {reference}"
            )));
        }

        let dest = dirs.for_type(resolved.artifact_type).to_path_buf();
        let installed = tokio::task::spawn_blocking(move || extract::install(&layers, &dest))
            .await
            .map_err(|e| OciError::Extraction(e.to_string()))??;

        info!(
            reference = %reference,
            digest = %resolved.digest,
            artifact_type = %resolved.artifact_type,
            files = installed.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Artifact pulled"
        );

        Ok(PullResult {
            reference: reference.clone(),
            digest: resolved.digest,
            artifact_type: resolved.artifact_type,
            config,
            installed,
        })
    }
}
