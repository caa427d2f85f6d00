//! Config command: print an artifact's config layer.

use anyhow::{Context, Result};
use artifactctl_oci::Puller;
use clap::Args;

use crate::output::{print_single, OutputFormat};

use super::{platform_or_current, CommandContext};

#[derive(Debug, Args)]
pub struct ConfigCommand {
    /// Index name or full reference.
    reference: String,

    /// Platform whose manifest to read. Defaults to the host platform.
    #[arg(long)]
    platform: Option<String>,
}

impl ConfigCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let cache = ctx.index_cache().await?;
        let (reference, _) = ctx.resolve(&cache, &self.reference, false)?;
        let platform = platform_or_current(self.platform.as_deref())?;

        let raw = Puller::new(ctx.client()?)
            .raw_config(&reference, &platform)
            .await
            .with_context(|| format!("failed to fetch the config of {reference}"))?;

        match ctx.format {
            OutputFormat::Json => {
                let value: serde_json::Value = if raw.is_empty() {
                    serde_json::Value::Object(Default::default())
                } else {
                    serde_json::from_slice(&raw).context("config layer is not JSON")?
                };
                print_single(&value);
            }
            OutputFormat::Table => println!("{}", String::from_utf8_lossy(&raw)),
        }
        Ok(())
    }
}
