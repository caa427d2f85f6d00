//! artifactctl follower daemon
//!
//! Follows the references named in `ARTIFACTCTL_FOLLOW_REFS` and installs
//! new compatible releases as they are published. Stops on Ctrl-C.

use anyhow::Result;
use artifactctl_follower::{run_follow, Config};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting artifact follower");

    let config = Config::from_env()?;
    info!(
        references = ?config.references,
        schedule = %config.schedule,
        versions = %config.versions_source,
        indexes = config.indexes.len(),
        "Configuration loaded"
    );

    run_follow(config.into_session(), async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
        }
    })
    .await?;

    info!("Artifact follower shutdown complete");
    Ok(())
}
