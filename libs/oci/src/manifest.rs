//! OCI manifests, manifest lists and artifact metadata.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::OciError;
use crate::platform::Platform;

pub const OCI_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";
pub const DOCKER_MANIFEST_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_MANIFEST_LIST_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

/// Annotation carrying the file name of a layer.
pub const TITLE_ANNOTATION: &str = "org.opencontainers.image.title";

/// `Accept` header value covering every manifest shape we understand.
pub const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.index.v1+json, \
application/vnd.oci.image.manifest.v1+json, \
application/vnd.docker.distribution.manifest.list.v2+json, \
application/vnd.docker.distribution.manifest.v2+json";

/// Compute the `sha256:<hex>` digest of some bytes.
pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// Fail unless `data` hashes to `expected`.
pub fn verify_digest(expected: &str, data: &[u8]) -> Result<(), OciError> {
    let actual = sha256_digest(data);
    if actual != expected {
        return Err(OciError::DigestMismatch {
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

/// Content descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced content.
    pub media_type: String,
    /// Digest of the content.
    pub digest: String,
    /// Size in bytes.
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Descriptor {
    /// Describe `data` with the given media type.
    pub fn for_bytes(media_type: impl Into<String>, data: &[u8]) -> Self {
        Self {
            media_type: media_type.into(),
            digest: sha256_digest(data),
            size: data.len() as u64,
            platform: None,
            annotations: BTreeMap::new(),
        }
    }
}

/// Single-platform manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Manifest {
    /// Get total compressed size of all layers.
    pub fn total_layer_size(&self) -> u64 {
        self.layers.iter().map(|l| l.size).sum()
    }

    /// Artifact type implied by the config or layer media types.
    pub fn artifact_type(&self) -> Result<ArtifactType, OciError> {
        if let Some(artifact_type) = ArtifactType::from_media_type(&self.config.media_type) {
            return Ok(artifact_type);
        }
        self.layers
            .iter()
            .find_map(|layer| ArtifactType::from_media_type(&layer.media_type))
            .ok_or_else(|| OciError::UnsupportedMediaType(self.config.media_type.clone()))
    }
}

/// Multi-platform manifest list (OCI image index or Docker manifest list).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub manifests: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ImageIndex {
    /// Entry matching the requested platform.
    pub fn select(&self, platform: &Platform) -> Result<&Descriptor, OciError> {
        self.manifests
            .iter()
            .find(|d| d.platform.as_ref().is_some_and(|p| platform.matches(p)))
            .ok_or_else(|| OciError::PlatformNotFound {
                os: platform.os.clone(),
                arch: platform.architecture.clone(),
            })
    }
}

/// A manifest document as served by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestDocument {
    Image(Manifest),
    Index(ImageIndex),
}

impl ManifestDocument {
    /// Decode manifest bytes using the response content type, falling back to
    /// the embedded `mediaType` and the document shape.
    pub fn parse(content_type: Option<&str>, data: &[u8]) -> Result<Self, OciError> {
        let value: serde_json::Value = serde_json::from_slice(data)?;
        let embedded = value.get("mediaType").and_then(|m| m.as_str());
        let media_type = content_type
            .map(|c| c.split(';').next().unwrap_or(c).trim())
            .filter(|c| !c.is_empty() && *c != "application/json")
            .or(embedded);

        let is_index = match media_type {
            Some(OCI_INDEX_MEDIA_TYPE | DOCKER_MANIFEST_LIST_MEDIA_TYPE) => true,
            Some(OCI_MANIFEST_MEDIA_TYPE | DOCKER_MANIFEST_MEDIA_TYPE) => false,
            Some(other) if value.get("manifests").is_none() && value.get("layers").is_none() => {
                return Err(OciError::UnsupportedMediaType(other.to_string()));
            }
            _ => value.get("manifests").is_some(),
        };

        if is_index {
            Ok(Self::Index(serde_json::from_value(value)?))
        } else {
            Ok(Self::Image(serde_json::from_value(value)?))
        }
    }
}

/// Kinds of artifact distributed through registries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactType {
    Rulesfile,
    Plugin,
    Asset,
}

impl ArtifactType {
    pub const ALL: [ArtifactType; 3] = [Self::Rulesfile, Self::Plugin, Self::Asset];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rulesfile => "rulesfile",
            Self::Plugin => "plugin",
            Self::Asset => "asset",
        }
    }

    pub fn config_media_type(&self) -> &'static str {
        match self {
            Self::Rulesfile => "application/vnd.cncf.artifactctl.rulesfile.config.v1+json",
            Self::Plugin => "application/vnd.cncf.artifactctl.plugin.config.v1+json",
            Self::Asset => "application/vnd.cncf.artifactctl.asset.config.v1+json",
        }
    }

    pub fn layer_media_type(&self) -> &'static str {
        match self {
            Self::Rulesfile => "application/vnd.cncf.artifactctl.rulesfile.layer.v1+tar.gz",
            Self::Plugin => "application/vnd.cncf.artifactctl.plugin.layer.v1+tar.gz",
            Self::Asset => "application/vnd.cncf.artifactctl.asset.layer.v1+tar.gz",
        }
    }

    /// Artifact type owning a config or layer media type.
    pub fn from_media_type(media_type: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| {
            t.config_media_type() == media_type || t.layer_media_type() == media_type
        })
    }
}

impl fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactType {
    type Err = OciError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "rulesfile" | "rulesfiles" => Ok(Self::Rulesfile),
            "plugin" | "plugins" => Ok(Self::Plugin),
            "asset" | "assets" => Ok(Self::Asset),
            other => Err(OciError::UnsupportedMediaType(other.to_string())),
        }
    }
}

/// Metadata published in an artifact's config layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requirements: Vec<Requirement>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<Dependency>,
}

impl ArtifactConfig {
    /// Decode a config blob. Empty blobs decode to the default config.
    pub fn from_bytes(data: &[u8]) -> Result<Self, OciError> {
        if data.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        Ok(serde_json::from_slice(data)?)
    }

    pub fn requirement(&self, name: &str) -> Option<&Requirement> {
        self.requirements.iter().find(|r| r.name == name)
    }
}

/// A version the running engine must provide.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    pub name: String,
    pub version: String,
}

/// Another artifact this one depends on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alternatives: Vec<Alternative>,
}

/// Artifact satisfying a dependency in place of the named one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alternative {
    pub name: String,
    pub version: String,
}
