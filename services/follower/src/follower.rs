//! Per-reference follower loop.
//!
//! A follower checks its reference on a schedule. Each check resolves the
//! platform manifest digest; a digest that was already installed is a no-op.
//! New releases are gated on the engine versions before being pulled.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use artifactctl_oci::{
    ArtifactConfig, ArtifactType, OciError, Platform, PullOptions, PullResult, Puller, Reference,
    TargetDirs,
};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::FollowError;
use crate::gate::{check_requirements, CompatibilityError};
use crate::schedule::Schedule;
use crate::supervisor::wait_for_shutdown;
use crate::versions::EngineVersions;

/// Where a follower is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FollowerPhase {
    Created,
    Scheduled,
    Checking,
    Installing,
    Sleeping,
    Stopping,
    Stopped,
}

impl fmt::Display for FollowerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Scheduled => "scheduled",
            Self::Checking => "checking",
            Self::Installing => "installing",
            Self::Sleeping => "sleeping",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// The release a reference currently points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    /// Digest the reference itself resolves to (possibly an index).
    pub top_digest: String,
    /// Platform-resolved manifest digest.
    pub digest: String,
    pub artifact_type: ArtifactType,
}

/// Registry operations a follower needs.
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    async fn resolve(&self, reference: &Reference, platform: &Platform)
        -> Result<Release, OciError>;

    async fn config(
        &self,
        reference: &Reference,
        platform: &Platform,
    ) -> Result<ArtifactConfig, OciError>;

    async fn pull(
        &self,
        reference: &Reference,
        dirs: &TargetDirs,
        options: &PullOptions,
    ) -> Result<PullResult, OciError>;
}

#[async_trait]
impl<S: ArtifactSource + ?Sized> ArtifactSource for Arc<S> {
    async fn resolve(
        &self,
        reference: &Reference,
        platform: &Platform,
    ) -> Result<Release, OciError> {
        (**self).resolve(reference, platform).await
    }

    async fn config(
        &self,
        reference: &Reference,
        platform: &Platform,
    ) -> Result<ArtifactConfig, OciError> {
        (**self).config(reference, platform).await
    }

    async fn pull(
        &self,
        reference: &Reference,
        dirs: &TargetDirs,
        options: &PullOptions,
    ) -> Result<PullResult, OciError> {
        (**self).pull(reference, dirs, options).await
    }
}

/// [`ArtifactSource`] backed by a real registry.
#[derive(Clone)]
pub struct RegistrySource {
    puller: Puller,
}

impl RegistrySource {
    pub fn new(puller: Puller) -> Self {
        Self { puller }
    }
}

#[async_trait]
impl ArtifactSource for RegistrySource {
    async fn resolve(
        &self,
        reference: &Reference,
        platform: &Platform,
    ) -> Result<Release, OciError> {
        let resolved = self.puller.resolve(reference, platform).await?;
        Ok(Release {
            top_digest: resolved.top_digest,
            digest: resolved.digest,
            artifact_type: resolved.artifact_type,
        })
    }

    async fn config(
        &self,
        reference: &Reference,
        platform: &Platform,
    ) -> Result<ArtifactConfig, OciError> {
        self.puller.config(reference, platform).await
    }

    async fn pull(
        &self,
        reference: &Reference,
        dirs: &TargetDirs,
        options: &PullOptions,
    ) -> Result<PullResult, OciError> {
        self.puller.pull(reference, dirs, options).await
    }
}

/// Everything bound to a follower at creation.
#[derive(Debug, Clone)]
pub struct FollowerConfig {
    pub reference: Reference,
    pub schedule: Schedule,
    pub dirs: TargetDirs,
    pub options: PullOptions,
    pub versions: EngineVersions,
}

/// What a single check did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    /// The digest was already installed.
    Unchanged { digest: String },
    /// A new release exists but the engine cannot run it.
    Incompatible {
        digest: String,
        reason: CompatibilityError,
    },
    Installed { digest: String, files: usize },
}

/// Final state of a follower after it stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowerReport {
    pub reference: Reference,
    pub phase: FollowerPhase,
    pub installs: u64,
    pub last_digest: Option<String>,
}

pub struct Follower<S> {
    config: FollowerConfig,
    source: S,
    phase: FollowerPhase,
    last_digest: Option<String>,
    installs: u64,
}

impl<S: ArtifactSource> Follower<S> {
    pub fn new(config: FollowerConfig, source: S) -> Self {
        Self {
            config,
            source,
            phase: FollowerPhase::Created,
            last_digest: None,
            installs: 0,
        }
    }

    pub fn reference(&self) -> &Reference {
        &self.config.reference
    }

    pub fn phase(&self) -> FollowerPhase {
        self.phase
    }

    /// Digest of the last successful install.
    pub fn last_digest(&self) -> Option<&str> {
        self.last_digest.as_deref()
    }

    /// Run one check, installing the current release when it is new and
    /// compatible. The follower is `Sleeping` once the check returns.
    pub async fn check(&mut self) -> Result<CheckOutcome, FollowError> {
        self.phase = FollowerPhase::Checking;
        let result = self.check_release().await;
        self.phase = FollowerPhase::Sleeping;
        result
    }

    async fn check_release(&mut self) -> Result<CheckOutcome, FollowError> {
        let reference = &self.config.reference;
        let platform = &self.config.options.platform;

        let release = self.source.resolve(reference, platform).await?;
        if self.last_digest.as_deref() == Some(release.digest.as_str()) {
            debug!(reference = %reference, digest = %release.digest, "Already up to date");
            return Ok(CheckOutcome::Unchanged {
                digest: release.digest,
            });
        }

        if let Some(allowed) = &self.config.options.allowed_types {
            if !allowed.contains(&release.artifact_type) {
                return Err(OciError::TypeNotAllowed(release.artifact_type.to_string()).into());
            }
        }

        let artifact = self
            .source
            .config(&reference.with_digest(&release.digest), platform)
            .await?;
        if let Err(reason) = check_requirements(&artifact, &self.config.versions) {
            return Ok(CheckOutcome::Incompatible {
                digest: release.digest,
                reason,
            });
        }

        // Install exactly the release that passed the gate, even if the tag
        // has moved since it was resolved.
        self.phase = FollowerPhase::Installing;
        let pinned = reference.with_digest(&release.top_digest);
        let options = PullOptions {
            expected_digest: Some(release.digest.clone()),
            ..self.config.options.clone()
        };
        let pulled = self
            .source
            .pull(&pinned, &self.config.dirs, &options)
            .await?;
        self.last_digest = Some(pulled.digest.clone());
        self.installs += 1;
        Ok(CheckOutcome::Installed {
            digest: pulled.digest,
            files: pulled.installed.len(),
        })
    }

    /// Check on schedule until shutdown is signalled.
    ///
    /// The first check runs immediately.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> FollowerReport {
        info!(
            reference = %self.config.reference,
            schedule = %self.config.schedule,
            "Follower started"
        );

        loop {
            self.phase = FollowerPhase::Scheduled;
            if *shutdown.borrow() {
                break;
            }

            let result = tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => break,
                result = self.check() => result,
            };
            self.log_outcome(result);

            self.phase = FollowerPhase::Sleeping;
            let now = Utc::now();
            let Some(next) = self.config.schedule.next(now) else {
                info!(reference = %self.config.reference, "No further checks scheduled");
                wait_for_shutdown(&mut shutdown).await;
                break;
            };
            let delay = (next - now).to_std().unwrap_or(Duration::ZERO);
            debug!(
                reference = %self.config.reference,
                next = %next.to_rfc3339(),
                "Sleeping until next check"
            );

            tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.phase = FollowerPhase::Stopping;
        debug!(reference = %self.config.reference, phase = %self.phase, "Follower stopping");
        self.phase = FollowerPhase::Stopped;

        FollowerReport {
            reference: self.config.reference,
            phase: self.phase,
            installs: self.installs,
            last_digest: self.last_digest,
        }
    }

    fn log_outcome(&self, result: Result<CheckOutcome, FollowError>) {
        let reference = &self.config.reference;
        match result {
            Ok(CheckOutcome::Unchanged { .. }) => {}
            Ok(CheckOutcome::Incompatible { digest, reason }) => {
                warn!(
                    reference = %reference,
                    digest = %digest,
                    error = %reason,
                    "Release is not compatible with the running engine, skipping"
                );
            }
            Ok(CheckOutcome::Installed { digest, files }) => {
                info!(reference = %reference, digest = %digest, files, "Release installed");
            }
            Err(e) => {
                error!(reference = %reference, error = %e, "Check failed");
            }
        }
    }
}
