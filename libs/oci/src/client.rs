//! OCI Distribution client.
//!
//! Implements the subset of the distribution API needed to move artifacts:
//! manifest GET/PUT, blob GET/HEAD and monolithic blob uploads. Requests that
//! come back `401` are retried once after answering the registry's
//! `WWW-Authenticate` challenge; nothing else is retried at this layer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, LOCATION, WWW_AUTHENTICATE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::auth::{Challenge, CredentialStore, NoCredentials, TokenResponse};
use crate::error::OciError;
use crate::manifest::{sha256_digest, verify_digest, Descriptor, ManifestDocument, MANIFEST_ACCEPT};
use crate::reference::Reference;

const DOCKER_CONTENT_DIGEST: &str = "Docker-Content-Digest";

/// Configuration for the registry client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Talk to registries over plain HTTP.
    pub plain_http: bool,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            plain_http: false,
            timeout: Duration::from_secs(300),
        }
    }
}

/// A manifest as fetched from the registry.
#[derive(Debug, Clone)]
pub struct FetchedManifest {
    /// Digest of the exact bytes served.
    pub digest: String,
    pub media_type: Option<String>,
    pub bytes: Bytes,
    pub document: ManifestDocument,
}

/// Access scope requested from token servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Pull,
    Push,
}

impl Access {
    fn actions(self) -> &'static str {
        match self {
            Self::Pull => "pull",
            Self::Push => "pull,push",
        }
    }
}

/// OCI registry client.
pub struct RegistryClient {
    config: ClientConfig,
    http: Client,
    credentials: Arc<dyn CredentialStore>,
    // "registry/repository" -> Authorization header value
    auth: Mutex<HashMap<String, String>>,
}

impl RegistryClient {
    /// Create a new client with anonymous access.
    pub fn new(config: ClientConfig) -> Result<Self, OciError> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|source| OciError::Http {
                registry: String::new(),
                reference: String::new(),
                source,
            })?;
        Ok(Self {
            config,
            http,
            credentials: Arc::new(NoCredentials),
            auth: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialStore>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn scheme(&self) -> &'static str {
        if self.config.plain_http {
            "http"
        } else {
            "https"
        }
    }

    fn repository_url(&self, reference: &Reference) -> String {
        format!(
            "{}://{}/v2/{}",
            self.scheme(),
            reference.registry(),
            reference.repository()
        )
    }

    /// Fetch the manifest `reference` points to.
    ///
    /// Digest-pinned references are verified against the served bytes, as is
    /// any `Docker-Content-Digest` the registry reports.
    pub async fn fetch_manifest(&self, reference: &Reference) -> Result<FetchedManifest, OciError> {
        let url = format!("{}/manifests/{}", self.repository_url(reference), reference.target());
        debug!(url = %url, "Fetching manifest");

        let response = self
            .send(reference, Access::Pull, || {
                self.http.get(&url).header(ACCEPT, MANIFEST_ACCEPT)
            })
            .await?;
        let response = check_status(response, &url, || reference.to_string(), reference)?;

        let media_type = header_str(&response, CONTENT_TYPE.as_str());
        let reported = header_str(&response, DOCKER_CONTENT_DIGEST);
        let bytes = response
            .bytes()
            .await
            .map_err(|source| http_error(reference, source))?;

        let digest = match reference.digest() {
            Some(pinned) => {
                verify_digest(pinned, &bytes)?;
                pinned.to_string()
            }
            None => sha256_digest(&bytes),
        };
        if let Some(reported) = reported.filter(|r| r.starts_with("sha256:")) {
            if reported != digest {
                return Err(OciError::DigestMismatch {
                    expected: reported,
                    actual: digest,
                });
            }
        }

        let document = ManifestDocument::parse(media_type.as_deref(), &bytes)?;
        Ok(FetchedManifest {
            digest,
            media_type,
            bytes,
            document,
        })
    }

    /// Fetch a blob and verify it against its descriptor.
    pub async fn fetch_blob(
        &self,
        reference: &Reference,
        descriptor: &Descriptor,
    ) -> Result<Bytes, OciError> {
        let url = format!("{}/blobs/{}", self.repository_url(reference), descriptor.digest);
        debug!(url = %url, size = descriptor.size, "Fetching blob");

        let response = self
            .send(reference, Access::Pull, || self.http.get(&url))
            .await?;
        let response = check_status(response, &url, || descriptor.digest.clone(), reference)?;
        let bytes = response
            .bytes()
            .await
            .map_err(|source| http_error(reference, source))?;

        verify_digest(&descriptor.digest, &bytes)?;
        if bytes.len() as u64 != descriptor.size {
            return Err(OciError::DigestMismatch {
                expected: format!("{} ({} bytes)", descriptor.digest, descriptor.size),
                actual: format!("{} bytes", bytes.len()),
            });
        }
        Ok(bytes)
    }

    /// Whether the repository already holds a blob.
    pub async fn blob_exists(&self, reference: &Reference, digest: &str) -> Result<bool, OciError> {
        let url = format!("{}/blobs/{}", self.repository_url(reference), digest);
        let response = self
            .send(reference, Access::Push, || self.http.head(&url))
            .await?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(OciError::Status {
                url,
                status: status.as_u16(),
            }),
        }
    }

    /// Upload a blob with a monolithic POST + PUT, skipping blobs already present.
    pub async fn upload_blob(&self, reference: &Reference, data: Bytes) -> Result<Descriptor, OciError> {
        let digest = sha256_digest(&data);
        let size = data.len() as u64;
        let descriptor = |digest: String| Descriptor {
            media_type: String::new(),
            digest,
            size,
            platform: None,
            annotations: Default::default(),
        };

        if self.blob_exists(reference, &digest).await? {
            debug!(digest = %digest, "Blob already present");
            return Ok(descriptor(digest));
        }

        let url = format!("{}/blobs/uploads/", self.repository_url(reference));
        let response = self
            .send(reference, Access::Push, || self.http.post(&url))
            .await?;
        let response = check_status(response, &url, || url.clone(), reference)?;
        let location = header_str(&response, LOCATION.as_str()).ok_or_else(|| OciError::Status {
            url: url.clone(),
            status: response.status().as_u16(),
        })?;

        let upload_url = self.absolute_location(reference, &location);
        let separator = if upload_url.contains('?') { '&' } else { '?' };
        let put_url = format!("{upload_url}{separator}digest={digest}");
        let response = self
            .send(reference, Access::Push, || {
                self.http
                    .put(&put_url)
                    .header(CONTENT_TYPE, "application/octet-stream")
                    .body(data.clone())
            })
            .await?;
        check_status(response, &put_url, || digest.clone(), reference)?;

        info!(reference = %reference, digest = %digest, size, "Blob uploaded");
        Ok(descriptor(digest))
    }

    /// Store a manifest under `target` (a tag or digest) and return its digest.
    pub async fn put_manifest(
        &self,
        reference: &Reference,
        target: &str,
        media_type: &str,
        body: Bytes,
    ) -> Result<String, OciError> {
        let digest = sha256_digest(&body);
        let url = format!("{}/manifests/{}", self.repository_url(reference), target);
        let response = self
            .send(reference, Access::Push, || {
                self.http
                    .put(&url)
                    .header(CONTENT_TYPE, media_type)
                    .body(body.clone())
            })
            .await?;
        check_status(response, &url, || target.to_string(), reference)?;

        info!(reference = %reference, target = %target, digest = %digest, "Manifest pushed");
        Ok(digest)
    }

    fn absolute_location(&self, reference: &Reference, location: &str) -> String {
        if location.starts_with("http://") || location.starts_with("https://") {
            location.to_string()
        } else {
            format!("{}://{}{}", self.scheme(), reference.registry(), location)
        }
    }

    async fn send<F>(&self, reference: &Reference, access: Access, build: F) -> Result<Response, OciError>
    where
        F: Fn() -> RequestBuilder,
    {
        let key = format!("{}/{}", reference.registry(), reference.repository());
        let cached = self.auth.lock().await.get(&key).cloned();

        let mut request = build();
        if let Some(header) = &cached {
            request = request.header(AUTHORIZATION, header);
        }
        let response = request
            .send()
            .await
            .map_err(|source| http_error(reference, source))?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = header_str(&response, WWW_AUTHENTICATE.as_str())
            .and_then(|h| Challenge::parse(&h))
            .ok_or_else(|| OciError::AuthRequired(reference.registry().to_string()))?;
        let header = self.authenticate(reference, access, challenge).await?;
        debug!(registry = %reference.registry(), "Authenticated against registry");

        let response = build()
            .header(AUTHORIZATION, &header)
            .send()
            .await
            .map_err(|source| http_error(reference, source))?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(OciError::AuthRequired(reference.registry().to_string()));
        }
        self.auth.lock().await.insert(key, header);
        Ok(response)
    }

    async fn authenticate(
        &self,
        reference: &Reference,
        access: Access,
        challenge: Challenge,
    ) -> Result<String, OciError> {
        let credential = self.credentials.get(reference.registry());
        match challenge {
            Challenge::Basic => credential
                .map(|c| c.basic_header())
                .ok_or_else(|| OciError::AuthRequired(reference.registry().to_string())),
            Challenge::Bearer {
                realm,
                service,
                scope,
            } => {
                let scope = scope.unwrap_or_else(|| {
                    format!("repository:{}:{}", reference.repository(), access.actions())
                });
                let mut query = vec![("scope", scope)];
                if let Some(service) = service {
                    query.push(("service", service));
                }

                let mut request = self.http.get(&realm).query(&query);
                if let Some(credential) = &credential {
                    request = request.header(AUTHORIZATION, credential.basic_header());
                }
                let response = request
                    .send()
                    .await
                    .map_err(|source| http_error(reference, source))?;
                if !response.status().is_success() {
                    return Err(OciError::AuthRequired(reference.registry().to_string()));
                }
                let token: TokenResponse = response
                    .json()
                    .await
                    .map_err(|source| http_error(reference, source))?;
                token
                    .into_token()
                    .map(|t| format!("Bearer {t}"))
                    .ok_or_else(|| OciError::AuthRequired(reference.registry().to_string()))
            }
        }
    }
}

fn http_error(reference: &Reference, source: reqwest::Error) -> OciError {
    OciError::Http {
        registry: reference.registry().to_string(),
        reference: reference.to_string(),
        source,
    }
}

fn header_str(response: &Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn check_status(
    response: Response,
    url: &str,
    what: impl FnOnce() -> String,
    reference: &Reference,
) -> Result<Response, OciError> {
    match response.status() {
        status if status.is_success() => Ok(response),
        StatusCode::NOT_FOUND => Err(OciError::NotFound(what())),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(OciError::AuthRequired(reference.registry().to_string()))
        }
        status => Err(OciError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        }),
    }
}
