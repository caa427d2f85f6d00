//! Versions reported by the running engine.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::backoff::{BackoffError, BackoffTransport, Transport};

/// Default location of the engine's version endpoint.
pub const DEFAULT_VERSIONS_SOURCE: &str = "http://localhost:8765/versions";

#[derive(Debug, Error)]
pub enum VersionsError {
    #[error("unable to reach {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: BackoffError,
    },

    #[error("unexpected status {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("unable to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed versions document: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Snapshot of version-kind key to reported value, e.g.
/// `engine_version_semver -> 0.36.0`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EngineVersions(BTreeMap<String, String>);

impl EngineVersions {
    /// Decode a flat JSON object. Non-string values are ignored.
    pub fn from_json(data: &[u8]) -> Result<Self, VersionsError> {
        let raw: BTreeMap<String, serde_json::Value> = serde_json::from_slice(data)?;
        Ok(raw
            .into_iter()
            .filter_map(|(key, value)| match value {
                serde_json::Value::String(s) => Some((key, s)),
                _ => None,
            })
            .collect())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl FromIterator<(String, String)> for EngineVersions {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

fn is_url(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

/// Fetch the engine versions from an HTTP endpoint (retried through
/// `transport`) or read them from a local file.
pub async fn fetch_engine_versions<T: Transport>(
    source: &str,
    transport: &BackoffTransport<T>,
) -> Result<EngineVersions, VersionsError> {
    let body = if is_url(source) {
        let response = transport
            .get(source)
            .await
            .map_err(|source_err| VersionsError::Transport {
                url: source.to_string(),
                source: source_err,
            })?;
        if !response.is_success() {
            return Err(VersionsError::Status {
                url: source.to_string(),
                status: response.status,
            });
        }
        response.body.to_vec()
    } else {
        let path = PathBuf::from(source.trim_start_matches("file://"));
        tokio::fs::read(&path)
            .await
            .map_err(|e| VersionsError::Io { path, source: e })?
    };

    let versions = EngineVersions::from_json(&body)?;
    info!(source = %source, count = versions.len(), "Engine versions retrieved");
    Ok(versions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffConfig;
    use std::time::Duration;
    use tokio::sync::watch;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn transport() -> BackoffTransport<reqwest::Client> {
        let (_tx, rx) = watch::channel(false);
        BackoffTransport::new(
            reqwest::Client::new(),
            BackoffConfig {
                max_delay: Duration::from_secs(5),
                ..Default::default()
            },
            rx,
        )
    }

    #[test]
    fn test_non_string_values_are_ignored() {
        let versions = EngineVersions::from_json(
            br#"{"engine_version":"26","engine_version_semver":"0.26.0","plugin_api_version":3,"flags":{"x":true}}"#,
        )
        .unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions.get("engine_version"), Some("26"));
        assert_eq!(versions.get("plugin_api_version"), None);
    }

    #[test]
    fn test_malformed_document() {
        assert!(matches!(
            EngineVersions::from_json(b"[1, 2]"),
            Err(VersionsError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_fetch_from_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/versions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"{"engine_version_semver":"0.36.0"}"#),
            )
            .mount(&server)
            .await;

        let versions = fetch_engine_versions(&format!("{}/versions", server.uri()), &transport())
            .await
            .unwrap();
        assert_eq!(versions.get("engine_version_semver"), Some("0.36.0"));
    }

    #[tokio::test]
    async fn test_fetch_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = fetch_engine_versions(&format!("{}/versions", server.uri()), &transport())
            .await
            .unwrap_err();
        assert!(matches!(err, VersionsError::Status { status: 503, .. }));
    }

    #[tokio::test]
    async fn test_fetch_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("versions.json");
        std::fs::write(&file, r#"{"engine_version":"31"}"#).unwrap();

        let versions = fetch_engine_versions(file.to_str().unwrap(), &transport())
            .await
            .unwrap();
        assert_eq!(versions.get("engine_version"), Some("31"));

        let missing = dir.path().join("missing.json");
        assert!(matches!(
            fetch_engine_versions(missing.to_str().unwrap(), &transport()).await,
            Err(VersionsError::Io { .. })
        ));
    }
}
