//! Follow command: keep artifacts up to date until interrupted.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use artifactctl_follower::session::DEFAULT_VERSIONS_TIMEOUT;
use artifactctl_follower::versions::DEFAULT_VERSIONS_SOURCE;
use artifactctl_follower::{parse_duration, run_follow, FollowSession, Schedule};
use clap::Args;
use tracing::info;

use super::pull::DirArgs;
use super::{parse_types, platform_or_current, CommandContext};

#[derive(Debug, Args)]
pub struct FollowCommand {
    /// Index names or full references to follow.
    #[arg(required = true)]
    references: Vec<String>,

    /// Check interval, e.g. `6h` or `1h30m`. Defaults to 24h.
    #[arg(long, value_parser = parse_interval, conflicts_with = "cron")]
    every: Option<Duration>,

    /// Check on a 5-field cron schedule instead of an interval.
    #[arg(long)]
    cron: Option<String>,

    #[command(flatten)]
    dirs: DirArgs,

    /// Platform to install, e.g. `linux/arm64`. Defaults to the host platform.
    #[arg(long)]
    platform: Option<String>,

    /// Only accept these artifact types (comma-separated).
    #[arg(long = "allowed-types", value_delimiter = ',')]
    allowed_types: Vec<String>,

    /// Skip signature verification.
    #[arg(long)]
    no_verify: bool,

    /// Engine versions endpoint URL or JSON file.
    #[arg(long, env = "ARTIFACTCTL_VERSIONS", default_value = DEFAULT_VERSIONS_SOURCE)]
    versions: String,

    /// How long to keep retrying the versions endpoint.
    #[arg(long, value_parser = parse_interval)]
    timeout: Option<Duration>,
}

fn parse_interval(s: &str) -> Result<Duration, String> {
    parse_duration(s).map_err(|e| e.to_string())
}

impl FollowCommand {
    fn session(self, ctx: CommandContext) -> Result<FollowSession> {
        let schedule = Schedule::from_options(self.every, self.cron.as_deref())?;
        let mut session = FollowSession::new(self.references, schedule, self.dirs.target_dirs());
        session.platform = platform_or_current(self.platform.as_deref())?;
        session.plain_http = ctx.plain_http;
        session.allowed_types = parse_types(&self.allowed_types)?;
        session.no_verify = self.no_verify;
        session.versions_source = self.versions;
        session.timeout = self.timeout.unwrap_or(DEFAULT_VERSIONS_TIMEOUT);
        session.indexes = ctx.indexes;
        session.credentials = Arc::new(ctx.credentials);
        Ok(session)
    }

    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let session = self.session(ctx)?;
        run_follow(session, async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received shutdown signal");
            }
        })
        .await?;
        Ok(())
    }
}
