//! Pull command.

use std::path::PathBuf;

use anyhow::{Context, Result};
use artifactctl_follower::{resolve_dependencies, RegistryConfigResolver};
use artifactctl_oci::{PullOptions, Puller, TargetDirs};
use clap::Args;
use serde::Serialize;
use tabled::Tabled;

use crate::output::{print_output, short_digest};

use super::{parse_types, platform_or_current, CommandContext};

#[derive(Debug, Args)]
pub struct PullCommand {
    /// Index names (`name[:tag]`) or full references (`registry/repo:tag`).
    #[arg(required = true)]
    references: Vec<String>,

    #[command(flatten)]
    dirs: DirArgs,

    /// Platform to pull, e.g. `linux/arm64`. Defaults to the host platform.
    #[arg(long)]
    platform: Option<String>,

    /// Only accept these artifact types (comma-separated).
    #[arg(long = "allowed-types", value_delimiter = ',')]
    allowed_types: Vec<String>,

    /// Skip signature verification.
    #[arg(long)]
    no_verify: bool,

    /// Also pull the dependencies declared in the artifacts' configs.
    #[arg(long)]
    resolve_deps: bool,
}

/// Install directories shared by `pull` and `follow`.
#[derive(Debug, Args)]
pub struct DirArgs {
    /// Install every artifact type here. Overrides the per-type directories.
    #[arg(long, short = 'o')]
    pub dest: Option<PathBuf>,

    #[arg(long, env = "ARTIFACTCTL_RULESFILES_DIR", default_value = artifactctl_follower::config::DEFAULT_RULESFILES_DIR)]
    pub rulesfiles_dir: PathBuf,

    #[arg(long, env = "ARTIFACTCTL_PLUGINS_DIR", default_value = artifactctl_follower::config::DEFAULT_PLUGINS_DIR)]
    pub plugins_dir: PathBuf,

    #[arg(long, env = "ARTIFACTCTL_ASSETS_DIR", default_value = artifactctl_follower::config::DEFAULT_ASSETS_DIR)]
    pub assets_dir: PathBuf,
}

impl DirArgs {
    pub fn target_dirs(&self) -> TargetDirs {
        match &self.dest {
            Some(dest) => TargetDirs::all(dest),
            None => TargetDirs {
                rulesfile: self.rulesfiles_dir.clone(),
                plugin: self.plugins_dir.clone(),
                asset: self.assets_dir.clone(),
            },
        }
    }
}

#[derive(Debug, Serialize, Tabled)]
struct PulledRow {
    #[tabled(rename = "Reference")]
    reference: String,

    #[tabled(rename = "Type")]
    artifact_type: String,

    #[tabled(rename = "Version")]
    version: String,

    #[tabled(rename = "Digest", display = "display_digest")]
    digest: String,

    #[tabled(rename = "Files")]
    files: usize,
}

fn display_digest(digest: &str) -> String {
    short_digest(digest)
}

impl PullCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let cache = ctx.index_cache().await?;
        let puller = Puller::new(ctx.client()?);
        let dirs = self.dirs.target_dirs();
        let platform = platform_or_current(self.platform.as_deref())?;
        let allowed_types = parse_types(&self.allowed_types)?;

        let mut names = self.references.clone();
        if self.resolve_deps {
            let resolver = RegistryConfigResolver::new(&cache, &puller, platform.clone());
            let resolved = resolve_dependencies(&self.references, &resolver)
                .await
                .context("failed to resolve dependencies")?;
            names.extend(
                resolved
                    .into_iter()
                    .filter(|artifact| !artifact.requested)
                    .map(|artifact| artifact.reference),
            );
        }

        let mut rows = Vec::with_capacity(names.len());
        for name in &names {
            let (reference, policy) = ctx.resolve(&cache, name, !self.no_verify)?;
            let options = PullOptions {
                platform: platform.clone(),
                policy,
                allowed_types: allowed_types.clone(),
                ..Default::default()
            };
            let result = puller
                .pull(&reference, &dirs, &options)
                .await
                .with_context(|| format!("failed to pull {name}"))?;
            rows.push(PulledRow {
                reference: result.reference.to_string(),
                artifact_type: result.artifact_type.to_string(),
                version: result.config.version,
                digest: result.digest,
                files: result.installed.len(),
            });
        }

        print_output(&rows, ctx.format);
        Ok(())
    }
}
