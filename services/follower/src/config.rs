//! Configuration for the follower daemon.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use artifactctl_index::IndexConfig;
use artifactctl_oci::{ArtifactType, Platform, StaticCredentials, TargetDirs};

use crate::schedule::{parse_duration, Schedule};
use crate::session::{FollowSession, DEFAULT_VERSIONS_TIMEOUT};
use crate::supervisor::DEFAULT_GRACE;
use crate::versions::DEFAULT_VERSIONS_SOURCE;

pub const DEFAULT_RULESFILES_DIR: &str = "/etc/artifactctl/rules.d";
pub const DEFAULT_PLUGINS_DIR: &str = "/usr/share/artifactctl/plugins";
pub const DEFAULT_ASSETS_DIR: &str = "/etc/artifactctl/assets";

/// Follower daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// References to follow (`ARTIFACTCTL_FOLLOW_REFS`, `;`-separated).
    pub references: Vec<String>,

    /// Check schedule (`ARTIFACTCTL_EVERY` or `ARTIFACTCTL_CRON`).
    pub schedule: Schedule,

    pub rulesfiles_dir: PathBuf,
    pub plugins_dir: PathBuf,
    pub assets_dir: PathBuf,

    pub plain_http: bool,
    pub allowed_types: Option<Vec<ArtifactType>>,
    pub no_verify: bool,

    /// Engine versions URL or file (`ARTIFACTCTL_VERSIONS`).
    pub versions_source: String,
    pub timeout: Duration,
    pub grace: Duration,
    pub platform: Platform,

    /// `name=url[,backend]` entries (`ARTIFACTCTL_INDEXES`).
    pub indexes: Vec<IndexConfig>,

    /// `host=user:password` entries (`ARTIFACTCTL_REGISTRY_CREDENTIALS`).
    pub credentials: StaticCredentials,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, e.g. a fixed map in tests.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let references: Vec<String> = var("ARTIFACTCTL_FOLLOW_REFS")
            .map(|refs| split_list(&refs))
            .unwrap_or_default();
        if references.is_empty() {
            bail!("ARTIFACTCTL_FOLLOW_REFS must name at least one reference");
        }

        let every = var("ARTIFACTCTL_EVERY")
            .map(|s| parse_duration(&s))
            .transpose()
            .context("invalid ARTIFACTCTL_EVERY")?;
        let cron = var("ARTIFACTCTL_CRON");
        let schedule = Schedule::from_options(every, cron.as_deref())?;

        let dir = |key: &str, default: &str| {
            PathBuf::from(var(key).unwrap_or_else(|| default.to_string()))
        };

        let allowed_types = var("ARTIFACTCTL_ALLOWED_TYPES")
            .map(|types| {
                split_list(&types.replace(',', ";"))
                    .iter()
                    .map(|t| t.parse::<ArtifactType>())
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()
            .context("invalid ARTIFACTCTL_ALLOWED_TYPES")?;

        let timeout = var("ARTIFACTCTL_TIMEOUT")
            .map(|s| parse_duration(&s))
            .transpose()
            .context("invalid ARTIFACTCTL_TIMEOUT")?
            .unwrap_or(DEFAULT_VERSIONS_TIMEOUT);

        let grace = var("ARTIFACTCTL_SHUTDOWN_GRACE")
            .map(|s| parse_duration(&s))
            .transpose()
            .context("invalid ARTIFACTCTL_SHUTDOWN_GRACE")?
            .unwrap_or(DEFAULT_GRACE);

        let platform = match var("ARTIFACTCTL_PLATFORM") {
            Some(p) => Platform::parse(&p).context("invalid ARTIFACTCTL_PLATFORM")?,
            None => Platform::current(),
        };

        let indexes = var("ARTIFACTCTL_INDEXES")
            .map(|s| parse_indexes(&s))
            .transpose()?
            .unwrap_or_default();

        let credentials = var("ARTIFACTCTL_REGISTRY_CREDENTIALS")
            .map(|s| StaticCredentials::parse(&s))
            .transpose()
            .context("invalid ARTIFACTCTL_REGISTRY_CREDENTIALS")?
            .unwrap_or_default();

        Ok(Self {
            references,
            schedule,
            rulesfiles_dir: dir("ARTIFACTCTL_RULESFILES_DIR", DEFAULT_RULESFILES_DIR),
            plugins_dir: dir("ARTIFACTCTL_PLUGINS_DIR", DEFAULT_PLUGINS_DIR),
            assets_dir: dir("ARTIFACTCTL_ASSETS_DIR", DEFAULT_ASSETS_DIR),
            plain_http: flag(var("ARTIFACTCTL_PLAIN_HTTP")),
            allowed_types,
            no_verify: flag(var("ARTIFACTCTL_NO_VERIFY")),
            versions_source: var("ARTIFACTCTL_VERSIONS")
                .unwrap_or_else(|| DEFAULT_VERSIONS_SOURCE.to_string()),
            timeout,
            grace,
            platform,
            indexes,
            credentials,
        })
    }

    pub fn into_session(self) -> FollowSession {
        let dirs = TargetDirs {
            rulesfile: self.rulesfiles_dir,
            plugin: self.plugins_dir,
            asset: self.assets_dir,
        };
        let mut session = FollowSession::new(self.references, self.schedule, dirs);
        session.platform = self.platform;
        session.plain_http = self.plain_http;
        session.allowed_types = self.allowed_types;
        session.no_verify = self.no_verify;
        session.versions_source = self.versions_source;
        session.timeout = self.timeout;
        session.grace = self.grace;
        session.indexes = self.indexes;
        session.credentials = Arc::new(self.credentials);
        session
    }
}

fn split_list(s: &str) -> Vec<String> {
    s.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn flag(value: Option<String>) -> bool {
    matches!(
        value.as_deref().map(str::to_ascii_lowercase).as_deref(),
        Some("1" | "true" | "yes" | "on")
    )
}

/// Parse `name=url[,backend]` entries separated by `;`.
pub fn parse_indexes(s: &str) -> Result<Vec<IndexConfig>> {
    split_list(s)
        .iter()
        .map(|entry| {
            let (name, rest) = entry
                .split_once('=')
                .with_context(|| format!("index entry `{entry}` is not name=url"))?;
            let (url, backend) = match rest.split_once(',') {
                Some((url, backend)) => (url, backend),
                None => (rest, ""),
            };
            let mut config = IndexConfig::new(name.trim(), url.trim());
            config.backend = backend.trim().to_string();
            Ok(config)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[("ARTIFACTCTL_FOLLOW_REFS", "k8saudit-rules; cloudtrail:0.9")]).unwrap();
        assert_eq!(config.references, vec!["k8saudit-rules", "cloudtrail:0.9"]);
        assert!(matches!(config.schedule, Schedule::Every(d) if d == Duration::from_secs(86_400)));
        assert_eq!(config.versions_source, DEFAULT_VERSIONS_SOURCE);
        assert_eq!(config.timeout, Duration::from_secs(120));
        assert_eq!(config.grace, Duration::from_secs(5));
        assert_eq!(config.plugins_dir, PathBuf::from(DEFAULT_PLUGINS_DIR));
        assert!(!config.plain_http);
        assert!(config.allowed_types.is_none());
        assert!(config.indexes.is_empty());
    }

    #[test]
    fn test_full_configuration() {
        let config = load(&[
            ("ARTIFACTCTL_FOLLOW_REFS", "json"),
            ("ARTIFACTCTL_CRON", "*/5 * * * *"),
            ("ARTIFACTCTL_PLAIN_HTTP", "true"),
            ("ARTIFACTCTL_NO_VERIFY", "1"),
            ("ARTIFACTCTL_ALLOWED_TYPES", "rulesfile,plugin"),
            ("ARTIFACTCTL_TIMEOUT", "30s"),
            ("ARTIFACTCTL_PLATFORM", "linux/arm64"),
            (
                "ARTIFACTCTL_INDEXES",
                "main=https://example.com/index.yaml;local=/etc/index.yaml,file",
            ),
            ("ARTIFACTCTL_REGISTRY_CREDENTIALS", "ghcr.io=bot:secret"),
        ])
        .unwrap();

        assert!(matches!(config.schedule, Schedule::Cron { .. }));
        assert!(config.plain_http);
        assert!(config.no_verify);
        assert_eq!(
            config.allowed_types,
            Some(vec![ArtifactType::Rulesfile, ArtifactType::Plugin])
        );
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.platform, Platform::new("linux", "arm64"));
        assert_eq!(config.indexes.len(), 2);
        assert_eq!(config.indexes[1].backend, "file");
        assert_eq!(config.indexes[0].backend_kind(), "https");

        let session = config.into_session();
        assert!(session.credentials.get("ghcr.io").is_some());
    }

    #[test]
    fn test_every_and_cron_conflict() {
        let err = load(&[
            ("ARTIFACTCTL_FOLLOW_REFS", "json"),
            ("ARTIFACTCTL_EVERY", "6h"),
            ("ARTIFACTCTL_CRON", "0 * * * *"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("cannot be used together"));
    }

    #[test]
    fn test_missing_references() {
        assert!(load(&[]).is_err());
    }
}
