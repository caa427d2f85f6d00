//! CLI commands.

mod config;
mod follow;
mod index;
mod pull;
mod push;

use std::sync::Arc;

use anyhow::{Context, Result};
use artifactctl_follower::config::parse_indexes;
use artifactctl_follower::signature_policy;
use artifactctl_index::{BackendRegistry, IndexCache, IndexConfig};
use artifactctl_oci::{
    ArtifactType, ClientConfig, Platform, Reference, RegistryClient, SignaturePolicy,
    StaticCredentials,
};
use clap::{Parser, Subcommand};

use crate::output::OutputFormat;

/// artifactctl - manage rulesfiles, plugins and assets stored in OCI registries.
#[derive(Debug, Parser)]
#[command(name = "artifactctl")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Output format.
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Table)]
    format: OutputFormat,

    /// Talk to registries over plain HTTP.
    #[arg(long, global = true, env = "ARTIFACTCTL_PLAIN_HTTP")]
    plain_http: bool,

    /// Indexes as `name=url[,backend]`, separated by `;`.
    #[arg(long, global = true, env = "ARTIFACTCTL_INDEXES")]
    indexes: Option<String>,

    /// Registry credentials as `host=user:password`, separated by `;`.
    #[arg(long, global = true, env = "ARTIFACTCTL_REGISTRY_CREDENTIALS", hide_env_values = true)]
    registry_credentials: Option<String>,

    /// Enable debug logging.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Pull artifacts and install them.
    Pull(pull::PullCommand),

    /// Push files as an artifact.
    Push(push::PushCommand),

    /// Print the raw config layer of an artifact.
    Config(config::ConfigCommand),

    /// Keep artifacts up to date until interrupted.
    Follow(follow::FollowCommand),

    /// Inspect the configured indexes.
    Index(index::IndexCommand),

    /// Show CLI version.
    Version,
}

impl Cli {
    /// Log filter used when `RUST_LOG` is unset.
    pub fn default_log_filter(&self) -> &'static str {
        match (&self.command, self.verbose) {
            (_, true) => "debug",
            (Commands::Follow(_), false) => "info",
            _ => "warn",
        }
    }

    /// Run the CLI command.
    pub async fn run(self) -> Result<()> {
        let indexes = self
            .indexes
            .as_deref()
            .map(parse_indexes)
            .transpose()?
            .unwrap_or_default();
        let credentials = self
            .registry_credentials
            .as_deref()
            .map(StaticCredentials::parse)
            .transpose()
            .context("invalid registry credentials")?
            .unwrap_or_default();

        let ctx = CommandContext {
            format: self.format,
            plain_http: self.plain_http,
            indexes,
            credentials,
        };

        match self.command {
            Commands::Pull(cmd) => cmd.run(ctx).await,
            Commands::Push(cmd) => cmd.run(ctx).await,
            Commands::Config(cmd) => cmd.run(ctx).await,
            Commands::Follow(cmd) => cmd.run(ctx).await,
            Commands::Index(cmd) => cmd.run(ctx).await,
            Commands::Version => {
                println!("artifactctl {}", env!("CARGO_PKG_VERSION"));
                Ok(())
            }
        }
    }
}

/// Shared command context.
pub struct CommandContext {
    pub format: OutputFormat,
    pub plain_http: bool,
    pub indexes: Vec<IndexConfig>,
    pub credentials: StaticCredentials,
}

impl CommandContext {
    /// A registry client carrying the configured credentials.
    pub fn client(&self) -> Result<Arc<RegistryClient>> {
        let client = RegistryClient::new(ClientConfig {
            plain_http: self.plain_http,
            ..Default::default()
        })?
        .with_credentials(Arc::new(self.credentials.clone()));
        Ok(Arc::new(client))
    }

    pub async fn index_cache(&self) -> Result<IndexCache> {
        let cache = IndexCache::load(&self.indexes, &BackendRegistry::with_defaults()?).await?;
        Ok(cache)
    }

    /// Resolve a name or reference, with the signature policy the index
    /// attaches to it.
    pub fn resolve(
        &self,
        cache: &IndexCache,
        name: &str,
        verify: bool,
    ) -> Result<(Reference, SignaturePolicy)> {
        let reference = Reference::parse(&cache.resolve_reference(name)?)?;
        let policy = if verify {
            signature_policy(cache, name)?
        } else {
            SignaturePolicy::Disabled
        };
        Ok((reference, policy))
    }
}

/// Parse a platform flag, defaulting to the host platform.
pub(crate) fn platform_or_current(platform: Option<&str>) -> Result<Platform> {
    match platform {
        Some(p) => Ok(Platform::parse(p)?),
        None => Ok(Platform::current()),
    }
}

/// Parse a comma-separated list of artifact types.
pub(crate) fn parse_types(types: &[String]) -> Result<Option<Vec<ArtifactType>>> {
    if types.is_empty() {
        return Ok(None);
    }
    let parsed = types
        .iter()
        .flat_map(|t| t.split(','))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| t.parse::<ArtifactType>())
        .collect::<Result<Vec<_>, _>>()
        .context("invalid artifact type")?;
    Ok(Some(parsed))
}
