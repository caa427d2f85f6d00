//! Push command.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use artifactctl_oci::{
    Alternative, ArtifactConfig, ArtifactType, Dependency, Platform, PushLayer, PushRequest,
    Pusher, Reference, Requirement,
};
use base64::Engine;
use clap::Args;
use ed25519_dalek::SigningKey;
use serde::Serialize;

use crate::output::{print_single, print_success};

use super::CommandContext;

#[derive(Debug, Args)]
pub struct PushCommand {
    /// Target reference (`registry/repo:tag`).
    reference: String,

    /// Files to push. For multi-platform plugins, one file per `--platform`,
    /// in the same order.
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Artifact type.
    #[arg(long = "type", value_parser = parse_type)]
    artifact_type: ArtifactType,

    /// Artifact name stored in the config layer.
    #[arg(long)]
    name: Option<String>,

    /// Artifact version stored in the config layer.
    #[arg(long)]
    version: Option<String>,

    /// Engine requirement as `name:version`.
    #[arg(long = "requires", value_parser = parse_requirement)]
    requirements: Vec<Requirement>,

    /// Dependency as `name:version`, with alternatives after `|`.
    #[arg(long = "depends-on", value_parser = parse_dependency)]
    dependencies: Vec<Dependency>,

    /// Platform of each file (`os/arch`); plugins only.
    #[arg(long = "platform")]
    platforms: Vec<String>,

    /// Manifest annotation as `key=value`.
    #[arg(long = "annotation", value_parser = parse_annotation)]
    annotations: Vec<(String, String)>,

    /// Base64 Ed25519 private key seed; signs the pushed manifest.
    #[arg(long, env = "ARTIFACTCTL_SIGNING_KEY", hide_env_values = true)]
    sign_key: Option<String>,
}

#[derive(Debug, Serialize)]
struct PushReceipt {
    reference: String,
    digest: String,
    manifests: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    signature: Option<String>,
}

impl PushCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let reference = Reference::parse(&self.reference)?;
        let request = self.request()?;
        let signing_key = self.sign_key.as_deref().map(parse_signing_key).transpose()?;

        let pusher = Pusher::new(ctx.client()?);
        let pushed = pusher
            .push(&reference, &request)
            .await
            .with_context(|| format!("failed to push {reference}"))?;

        let signature = match &signing_key {
            Some(key) => Some(
                pusher
                    .push_signature(&reference, &pushed.digest, key)
                    .await
                    .context("failed to push signature")?,
            ),
            None => None,
        };

        print_success(&format!("pushed {} ({})", pushed.reference, pushed.digest));
        print_single(&PushReceipt {
            reference: pushed.reference.to_string(),
            digest: pushed.digest,
            manifests: pushed.manifests,
            signature,
        });
        Ok(())
    }

    fn request(&self) -> Result<PushRequest> {
        let layers = if self.platforms.is_empty() {
            let files = self
                .files
                .iter()
                .map(|path| read_file(path))
                .collect::<Result<Vec<_>>>()?;
            vec![PushLayer {
                platform: None,
                files,
            }]
        } else {
            if self.platforms.len() != self.files.len() {
                bail!(
                    "got {} platform(s) for {} file(s); pass one --platform per file",
                    self.platforms.len(),
                    self.files.len()
                );
            }
            self.platforms
                .iter()
                .zip(&self.files)
                .map(|(platform, path)| -> Result<PushLayer> {
                    Ok(PushLayer {
                        platform: Some(Platform::parse(platform)?),
                        files: vec![read_file(path)?],
                    })
                })
                .collect::<Result<Vec<_>>>()?
        };

        let request = PushRequest {
            artifact_type: self.artifact_type,
            config: ArtifactConfig {
                name: self.name.clone().unwrap_or_else(|| default_name(&self.reference)),
                version: self.version.clone().unwrap_or_default(),
                requirements: self.requirements.clone(),
                dependencies: self.dependencies.clone(),
            },
            layers,
            annotations: self.annotations.iter().cloned().collect::<BTreeMap<_, _>>(),
        };
        request.validate()?;
        Ok(request)
    }
}

fn read_file(path: &Path) -> Result<(String, Vec<u8>)> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("{} has no usable file name", path.display()))?
        .to_string();
    let data = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok((name, data))
}

/// Repository basename, e.g. `rules/k8saudit:0.5` -> `k8saudit`.
fn default_name(reference: &str) -> String {
    let path = reference.split_once('/').map_or(reference, |(_, rest)| rest);
    let path = path.split(['@', ':']).next().unwrap_or(path);
    path.rsplit('/').next().unwrap_or(path).to_string()
}

fn parse_type(s: &str) -> Result<ArtifactType, String> {
    s.parse().map_err(|e: artifactctl_oci::OciError| e.to_string())
}

fn parse_pair(s: &str) -> Result<(String, String), String> {
    let (name, version) = s
        .split_once(':')
        .ok_or_else(|| format!("expected name:version, got `{s}`"))?;
    if name.trim().is_empty() || version.trim().is_empty() {
        return Err(format!("expected name:version, got `{s}`"));
    }
    Ok((name.trim().to_string(), version.trim().to_string()))
}

fn parse_requirement(s: &str) -> Result<Requirement, String> {
    let (name, version) = parse_pair(s)?;
    Ok(Requirement { name, version })
}

fn parse_dependency(s: &str) -> Result<Dependency, String> {
    let mut parts = s.split('|');
    let (name, version) = parse_pair(parts.next().unwrap_or_default())?;
    let alternatives = parts
        .map(|alt| parse_pair(alt).map(|(name, version)| Alternative { name, version }))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Dependency {
        name,
        version,
        alternatives,
    })
}

fn parse_annotation(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got `{s}`"))
}

fn parse_signing_key(encoded: &str) -> Result<SigningKey> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .context("signing key is not valid base64")?;
    let seed: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("signing key must be 32 bytes, got {}", bytes.len()))?;
    Ok(SigningKey::from_bytes(&seed))
}
