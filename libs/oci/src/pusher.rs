//! Artifact pusher.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use ed25519_dalek::SigningKey;
use tracing::info;

use crate::client::RegistryClient;
use crate::error::OciError;
use crate::extract;
use crate::manifest::{
    ArtifactConfig, ArtifactType, Descriptor, ImageIndex, Manifest, OCI_INDEX_MEDIA_TYPE,
    OCI_MANIFEST_MEDIA_TYPE, TITLE_ANNOTATION,
};
use crate::platform::Platform;
use crate::reference::{Reference, DEFAULT_TAG};
use crate::signature::{
    sign_payload, signature_tag, simple_signing_payload, SIGNATURE_ANNOTATION,
    SIMPLE_SIGNING_MEDIA_TYPE,
};

const EMPTY_CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";

/// Content for one platform (or the only platform).
#[derive(Debug, Clone, Default)]
pub struct PushLayer {
    pub platform: Option<Platform>,
    /// `(archive path, contents)` pairs packed into the layer tarball.
    pub files: Vec<(String, Vec<u8>)>,
}

/// Everything needed to publish one artifact version.
#[derive(Debug, Clone)]
pub struct PushRequest {
    pub artifact_type: ArtifactType,
    pub config: ArtifactConfig,
    pub layers: Vec<PushLayer>,
    pub annotations: BTreeMap<String, String>,
}

impl PushRequest {
    /// Reject requests that cannot be laid out as a manifest or index.
    pub fn validate(&self) -> Result<(), OciError> {
        if self.layers.is_empty() {
            return Err(OciError::InvalidPush("no content to push".to_string()));
        }
        if self.layers.iter().any(|l| l.files.is_empty()) {
            return Err(OciError::InvalidPush("layer without files".to_string()));
        }
        let with_platform = self.layers.iter().filter(|l| l.platform.is_some()).count();
        if with_platform > 0 && self.artifact_type != ArtifactType::Plugin {
            return Err(OciError::InvalidPush(format!(
                "only plugins can be pushed per platform, got {}",
                self.artifact_type
            )));
        }
        if self.layers.len() > 1 && with_platform != self.layers.len() {
            return Err(OciError::InvalidPush(
                "every layer of a multi-layer push needs a platform".to_string(),
            ));
        }
        Ok(())
    }

    fn is_multi_platform(&self) -> bool {
        self.layers.iter().any(|l| l.platform.is_some())
    }
}

/// Result of a push.
#[derive(Debug, Clone)]
pub struct PushResult {
    pub reference: Reference,
    /// Digest stored under the tag: a manifest, or an index for per-platform pushes.
    pub digest: String,
    /// Digests of the per-platform manifests, in request order.
    pub manifests: Vec<String>,
}

/// Publishes artifacts to OCI registries.
#[derive(Clone)]
pub struct Pusher {
    client: Arc<RegistryClient>,
}

impl Pusher {
    pub fn new(client: Arc<RegistryClient>) -> Self {
        Self { client }
    }

    pub async fn push(
        &self,
        reference: &Reference,
        request: &PushRequest,
    ) -> Result<PushResult, OciError> {
        if reference.digest().is_some() {
            return Err(OciError::InvalidPush(format!(
                "cannot push to digest reference {reference}"
            )));
        }
        request.validate()?;
        let tag = reference.tag().unwrap_or(DEFAULT_TAG);

        let config = Bytes::from(serde_json::to_vec(&request.config)?);
        let mut config_descriptor = self.client.upload_blob(reference, config).await?;
        config_descriptor.media_type = request.artifact_type.config_media_type().to_string();

        let mut manifests = Vec::with_capacity(request.layers.len());
        for layer in &request.layers {
            let manifest = self
                .push_layer(reference, request, &config_descriptor, layer)
                .await?;
            manifests.push(manifest);
        }

        let digest = if request.is_multi_platform() {
            for descriptor in &manifests {
                self.put_manifest(reference, &descriptor.digest, descriptor.body.clone())
                    .await?;
            }
            let index = ImageIndex {
                schema_version: 2,
                media_type: Some(OCI_INDEX_MEDIA_TYPE.to_string()),
                manifests: manifests.iter().map(|m| m.descriptor()).collect(),
                annotations: request.annotations.clone(),
            };
            self.client
                .put_manifest(
                    reference,
                    tag,
                    OCI_INDEX_MEDIA_TYPE,
                    Bytes::from(serde_json::to_vec(&index)?),
                )
                .await?
        } else {
            let only = &manifests[0];
            self.put_manifest(reference, tag, only.body.clone()).await?
        };

        info!(
            reference = %reference,
            digest = %digest,
            artifact_type = %request.artifact_type,
            platforms = manifests.len(),
            "Artifact pushed"
        );

        Ok(PushResult {
            reference: reference.clone(),
            digest,
            manifests: manifests.into_iter().map(|m| m.digest).collect(),
        })
    }

    /// Sign `digest` in `reference`'s repository and store the signature under
    /// its `.sig` tag.
    pub async fn push_signature(
        &self,
        reference: &Reference,
        digest: &str,
        key: &SigningKey,
    ) -> Result<String, OciError> {
        let repository = format!("{}/{}", reference.registry(), reference.repository());
        let payload = simple_signing_payload(&repository, digest)?;
        let signature = sign_payload(key, &payload);

        let mut layer = self.client.upload_blob(reference, Bytes::from(payload)).await?;
        layer.media_type = SIMPLE_SIGNING_MEDIA_TYPE.to_string();
        layer
            .annotations
            .insert(SIGNATURE_ANNOTATION.to_string(), signature);

        let mut config = self
            .client
            .upload_blob(reference, Bytes::from_static(b"{}"))
            .await?;
        config.media_type = EMPTY_CONFIG_MEDIA_TYPE.to_string();

        let manifest = Manifest {
            schema_version: 2,
            media_type: Some(OCI_MANIFEST_MEDIA_TYPE.to_string()),
            config,
            layers: vec![layer],
            annotations: BTreeMap::new(),
        };
        let body = Bytes::from(serde_json::to_vec(&manifest)?);
        self.put_manifest(reference, &signature_tag(digest), body)
            .await
    }

    async fn push_layer(
        &self,
        reference: &Reference,
        request: &PushRequest,
        config: &Descriptor,
        layer: &PushLayer,
    ) -> Result<PushedManifest, OciError> {
        let files = layer.files.clone();
        let archive = tokio::task::spawn_blocking(move || extract::pack(&files))
            .await
            .map_err(|e| OciError::InvalidPush(e.to_string()))??;

        let mut descriptor = self
            .client
            .upload_blob(reference, Bytes::from(archive))
            .await?;
        descriptor.media_type = request.artifact_type.layer_media_type().to_string();
        descriptor
            .annotations
            .insert(TITLE_ANNOTATION.to_string(), layer_title(reference, layer));

        let manifest = Manifest {
            schema_version: 2,
            media_type: Some(OCI_MANIFEST_MEDIA_TYPE.to_string()),
            config: config.clone(),
            layers: vec![descriptor],
            annotations: request.annotations.clone(),
        };
        let body = Bytes::from(serde_json::to_vec(&manifest)?);
        Ok(PushedManifest {
            digest: crate::manifest::sha256_digest(&body),
            size: body.len() as u64,
            platform: layer.platform.clone(),
            body,
        })
    }

    async fn put_manifest(
        &self,
        reference: &Reference,
        target: &str,
        body: Bytes,
    ) -> Result<String, OciError> {
        self.client
            .put_manifest(reference, target, OCI_MANIFEST_MEDIA_TYPE, body)
            .await
    }
}

struct PushedManifest {
    digest: String,
    size: u64,
    platform: Option<Platform>,
    body: Bytes,
}

impl PushedManifest {
    fn descriptor(&self) -> Descriptor {
        Descriptor {
            media_type: OCI_MANIFEST_MEDIA_TYPE.to_string(),
            digest: self.digest.clone(),
            size: self.size,
            platform: self.platform.clone(),
            annotations: BTreeMap::new(),
        }
    }
}

fn layer_title(reference: &Reference, layer: &PushLayer) -> String {
    let name = reference
        .repository()
        .rsplit('/')
        .next()
        .unwrap_or(reference.repository());
    match &layer.platform {
        Some(platform) => format!(
            "{name}-{}-{}.tar.gz",
            platform.os, platform.architecture
        ),
        None => format!("{name}.tar.gz"),
    }
}
