//! Pluggable index backends.
//!
//! Each backend kind is an implementation of [`IndexBackend`]. The set of
//! kinds available at runtime is an explicit [`BackendRegistry`] table built
//! once at startup.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::error::IndexError;

/// Public endpoint serving Google Cloud Storage objects over HTTPS.
const GCS_PUBLIC_ENDPOINT: &str = "https://storage.googleapis.com";

const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors raised by a backend while fetching index data.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid index location `{url}`: {reason}")]
    InvalidLocation { url: String, reason: String },
}

/// Capability shared by every index backend kind.
#[async_trait]
pub trait IndexBackend: Send + Sync {
    /// Backend kind identifier, e.g. `http`.
    fn kind(&self) -> &str;

    /// Fetch the raw index bytes from `url`.
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, BackendError>;
}

/// Fetches indexes over HTTP(S).
pub struct HttpBackend {
    client: reqwest::Client,
}

impl HttpBackend {
    pub fn new(timeout: Duration) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl IndexBackend for HttpBackend {
    fn kind(&self) -> &str {
        "http"
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>, BackendError> {
        debug!(url = %url, "Fetching index over HTTP");
        let response = self.client.get(url).send().await?.error_for_status()?;
        let body = response.bytes().await?;
        Ok(body.to_vec())
    }
}

/// Reads indexes from the local filesystem.
#[derive(Default)]
pub struct FileBackend;

#[async_trait]
impl IndexBackend for FileBackend {
    fn kind(&self) -> &str {
        "file"
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>, BackendError> {
        let path = PathBuf::from(url.strip_prefix("file://").unwrap_or(url));
        debug!(path = %path.display(), "Reading index file");
        tokio::fs::read(&path)
            .await
            .map_err(|source| BackendError::Read { path, source })
    }
}

/// Reads publicly readable indexes stored in Google Cloud Storage.
pub struct GcsBackend {
    http: HttpBackend,
    endpoint: String,
}

impl GcsBackend {
    pub fn new(http: HttpBackend) -> Self {
        Self {
            http,
            endpoint: GCS_PUBLIC_ENDPOINT.to_string(),
        }
    }

    /// Override the storage endpoint (used against emulators).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    fn object_url(&self, url: &str) -> Result<String, BackendError> {
        let invalid = |reason: &str| BackendError::InvalidLocation {
            url: url.to_string(),
            reason: reason.to_string(),
        };
        let object = url
            .strip_prefix("gs://")
            .ok_or_else(|| invalid("expected a gs:// URL"))?;
        let (bucket, path) = object
            .split_once('/')
            .ok_or_else(|| invalid("missing object path"))?;
        Ok(format!(
            "{}/{}/{}",
            self.endpoint.trim_end_matches('/'),
            bucket,
            path
        ))
    }
}

#[async_trait]
impl IndexBackend for GcsBackend {
    fn kind(&self) -> &str {
        "gcs"
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>, BackendError> {
        let object_url = self.object_url(url)?;
        self.http.fetch(&object_url).await
    }
}

/// Table of backend kinds available to the index cache.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn IndexBackend>>,
}

impl BackendRegistry {
    /// Empty registry; every kind must be registered explicitly.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `http`, `https`, `file` and `gcs` kinds.
    pub fn with_defaults() -> Result<Self, IndexError> {
        let http: Arc<dyn IndexBackend> = Arc::new(HttpBackend::new(DEFAULT_HTTP_TIMEOUT)?);
        let mut registry = Self::new();
        registry.register("http", Arc::clone(&http));
        registry.register("https", http);
        registry.register("file", Arc::new(FileBackend));
        registry.register(
            "gcs",
            Arc::new(GcsBackend::new(HttpBackend::new(DEFAULT_HTTP_TIMEOUT)?)),
        );
        Ok(registry)
    }

    /// Register (or replace) the implementation serving `kind`.
    pub fn register(&mut self, kind: impl Into<String>, backend: Arc<dyn IndexBackend>) {
        self.backends.insert(kind.into(), backend);
    }

    /// Look up the implementation for `kind`.
    pub fn get(&self, kind: &str) -> Result<Arc<dyn IndexBackend>, IndexError> {
        self.backends
            .get(kind)
            .cloned()
            .ok_or_else(|| IndexError::UnsupportedBackend(kind.to_string()))
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.backends.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

/// Infer the backend kind from a URL when none is configured.
pub fn infer_backend(url: &str) -> &'static str {
    if url.starts_with("https://") {
        "https"
    } else if url.starts_with("http://") {
        "http"
    } else if url.starts_with("gs://") {
        "gcs"
    } else {
        "file"
    }
}
