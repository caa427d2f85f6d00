//! Test fixtures shared by the artifactctl crates.
//!
//! [`FakeRegistry`] is an in-memory OCI distribution endpoint served by
//! `wiremock`: content pushed through the HTTP API (or seeded with the helper
//! methods) can be pulled back, and every request is recorded for assertions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use base64::Engine;
use ed25519_dalek::{Signer, SigningKey};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use wiremock::matchers::path_regex;
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// `sha256:<hex>` digest of `data`.
pub fn sha256(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// Gzipped tarball with `files` at its root.
pub fn tar_gz(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (path, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, path, *data)
            .expect("append to in-memory tarball");
    }
    builder
        .into_inner()
        .and_then(|encoder| encoder.finish())
        .expect("finish in-memory tarball")
}

/// Deterministic signing key for signature tests.
pub fn signing_key(seed: u8) -> SigningKey {
    SigningKey::from_bytes(&[seed; 32])
}

/// Base64 raw public key, in the form index files carry it.
pub fn public_key_b64(key: &SigningKey) -> String {
    base64::engine::general_purpose::STANDARD.encode(key.verifying_key().to_bytes())
}

#[derive(Debug, Clone)]
struct Stored {
    content_type: String,
    body: Vec<u8>,
}

#[derive(Debug, Default)]
struct State {
    // (repository, tag or digest)
    manifests: HashMap<(String, String), Stored>,
    blobs: HashMap<String, Vec<u8>>,
}

/// A blob stored in the fake registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub digest: String,
    pub size: u64,
}

/// In-memory OCI registry.
pub struct FakeRegistry {
    server: MockServer,
    state: Arc<Mutex<State>>,
}

impl FakeRegistry {
    pub async fn start() -> Self {
        let server = MockServer::start().await;
        let state = Arc::new(Mutex::new(State::default()));
        Mock::given(path_regex("^/v2/"))
            .respond_with(RegistryResponder {
                state: Arc::clone(&state),
                uploads: AtomicU64::new(0),
            })
            .mount(&server)
            .await;
        Self { server, state }
    }

    pub fn server(&self) -> &MockServer {
        &self.server
    }

    /// `host:port` of the registry.
    pub fn host(&self) -> String {
        self.server
            .uri()
            .trim_start_matches("http://")
            .to_string()
    }

    /// Fully-qualified reference for `repository:tag`.
    pub fn reference(&self, repository: &str, tag: &str) -> String {
        format!("{}/{repository}:{tag}", self.host())
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn put_blob(&self, data: &[u8]) -> Blob {
        let digest = sha256(data);
        self.state().blobs.insert(digest.clone(), data.to_vec());
        Blob {
            digest,
            size: data.len() as u64,
        }
    }

    /// Store a manifest under `target` and under its digest; returns the digest.
    pub fn put_manifest(&self, repository: &str, target: &str, content_type: &str, body: &[u8]) -> String {
        let digest = sha256(body);
        let stored = Stored {
            content_type: content_type.to_string(),
            body: body.to_vec(),
        };
        let mut state = self.state();
        state
            .manifests
            .insert((repository.to_string(), digest.clone()), stored.clone());
        state
            .manifests
            .insert((repository.to_string(), target.to_string()), stored);
        digest
    }

    /// Replace a stored blob's bytes without changing its digest key.
    pub fn corrupt_blob(&self, digest: &str, data: &[u8]) {
        self.state().blobs.insert(digest.to_string(), data.to_vec());
    }

    /// Publish a single-manifest artifact; returns the manifest digest.
    pub fn publish(
        &self,
        repository: &str,
        tag: &str,
        config_media_type: &str,
        config: &Value,
        layer_media_type: &str,
        files: &[(&str, &[u8])],
    ) -> String {
        let body = self.artifact_manifest(config_media_type, config, layer_media_type, files, None);
        self.put_manifest(repository, tag, OCI_MANIFEST, &body)
    }

    /// Publish one manifest per platform under an image index at `tag`.
    /// Returns `(index digest, per-platform manifest digests)`.
    pub fn publish_multi_platform(
        &self,
        repository: &str,
        tag: &str,
        config_media_type: &str,
        config: &Value,
        layer_media_type: &str,
        platforms: &[(&str, &str, &[(&str, &[u8])])],
    ) -> (String, Vec<String>) {
        let mut entries = Vec::new();
        let mut digests = Vec::new();
        for (os, arch, files) in platforms {
            let body = self.artifact_manifest(
                config_media_type,
                config,
                layer_media_type,
                files,
                Some((*os, *arch)),
            );
            let digest = sha256(&body);
            self.put_manifest(repository, &digest, OCI_MANIFEST, &body);
            entries.push(json!({
                "mediaType": OCI_MANIFEST,
                "digest": digest,
                "size": body.len(),
                "platform": {"os": os, "architecture": arch},
            }));
            digests.push(digest);
        }
        let index = json!({
            "schemaVersion": 2,
            "mediaType": OCI_INDEX,
            "manifests": entries,
        });
        let body = serde_json::to_vec(&index).expect("serialize index");
        (self.put_manifest(repository, tag, OCI_INDEX, &body), digests)
    }

    /// Store a cosign-style signature for `digest` signed with `key`.
    pub fn sign(&self, repository: &str, digest: &str, key: &SigningKey) {
        self.sign_payload(repository, digest, digest, key);
    }

    /// Store a signature whose payload names `signed_digest`, under the
    /// signature tag of `digest`.
    pub fn sign_payload(&self, repository: &str, digest: &str, signed_digest: &str, key: &SigningKey) {
        let payload = serde_json::to_vec(&json!({
            "critical": {
                "identity": {"docker-reference": format!("{}/{repository}", self.host())},
                "image": {"docker-manifest-digest": signed_digest},
                "type": "cosign container image signature",
            }
        }))
        .expect("serialize payload");
        let signature =
            base64::engine::general_purpose::STANDARD.encode(key.sign(&payload).to_bytes());
        let layer = self.put_blob(&payload);
        let config = self.put_blob(b"{}");
        let manifest = json!({
            "schemaVersion": 2,
            "mediaType": OCI_MANIFEST,
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": config.digest,
                "size": config.size,
            },
            "layers": [{
                "mediaType": "application/vnd.dev.cosign.simplesigning.v1+json",
                "digest": layer.digest,
                "size": layer.size,
                "annotations": {"dev.cosignproject.cosign/signature": signature},
            }],
        });
        let tag = format!("{}.sig", digest.replacen(':', "-", 1));
        let body = serde_json::to_vec(&manifest).expect("serialize signature manifest");
        self.put_manifest(repository, &tag, OCI_MANIFEST, &body);
    }

    /// Manifest stored under `repository:target`, decoded.
    pub fn manifest(&self, repository: &str, target: &str) -> Option<Value> {
        self.state()
            .manifests
            .get(&(repository.to_string(), target.to_string()))
            .and_then(|m| serde_json::from_slice(&m.body).ok())
    }

    pub fn blob(&self, digest: &str) -> Option<Vec<u8>> {
        self.state().blobs.get(digest).cloned()
    }

    /// Number of recorded requests with `method` whose path contains `fragment`.
    pub async fn count_requests(&self, method: &str, fragment: &str) -> usize {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|r| r.method.as_str() == method && r.url.path().contains(fragment))
            .count()
    }

    fn artifact_manifest(
        &self,
        config_media_type: &str,
        config: &Value,
        layer_media_type: &str,
        files: &[(&str, &[u8])],
        platform: Option<(&str, &str)>,
    ) -> Vec<u8> {
        let config = self.put_blob(&serde_json::to_vec(config).expect("serialize config"));
        let layer = self.put_blob(&tar_gz(files));
        let mut manifest = json!({
            "schemaVersion": 2,
            "mediaType": OCI_MANIFEST,
            "config": {
                "mediaType": config_media_type,
                "digest": config.digest,
                "size": config.size,
            },
            "layers": [{
                "mediaType": layer_media_type,
                "digest": layer.digest,
                "size": layer.size,
            }],
        });
        if let Some((os, arch)) = platform {
            manifest["annotations"] = json!({"platform": format!("{os}/{arch}")});
        }
        serde_json::to_vec(&manifest).expect("serialize manifest")
    }
}

struct RegistryResponder {
    state: Arc<Mutex<State>>,
    uploads: AtomicU64,
}

impl RegistryResponder {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Respond for RegistryResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let path = request.url.path();
        let method = request.method.as_str();
        let rest = path.trim_start_matches("/v2/");

        if let Some((repository, upload)) = rest.split_once("/blobs/uploads/") {
            return match method {
                "POST" => {
                    let id = self.uploads.fetch_add(1, Ordering::Relaxed);
                    ResponseTemplate::new(202)
                        .insert_header("Location", format!("/v2/{repository}/blobs/uploads/{id}"))
                }
                "PUT" if !upload.is_empty() => {
                    let digest = request
                        .url
                        .query_pairs()
                        .find(|(k, _)| k == "digest")
                        .map(|(_, v)| v.into_owned());
                    match digest {
                        Some(digest) if digest == sha256(&request.body) => {
                            self.state().blobs.insert(digest.clone(), request.body.clone());
                            ResponseTemplate::new(201).insert_header("Docker-Content-Digest", digest)
                        }
                        _ => ResponseTemplate::new(400),
                    }
                }
                _ => ResponseTemplate::new(405),
            };
        }

        if let Some((_, digest)) = rest.split_once("/blobs/") {
            return match (method, self.state().blobs.get(digest)) {
                ("GET" | "HEAD", Some(body)) => ResponseTemplate::new(200)
                    .insert_header("Docker-Content-Digest", digest)
                    .set_body_raw(body.clone(), "application/octet-stream"),
                ("GET" | "HEAD", None) => ResponseTemplate::new(404),
                _ => ResponseTemplate::new(405),
            };
        }

        if let Some((repository, target)) = rest.split_once("/manifests/") {
            let key = (repository.to_string(), target.to_string());
            return match method {
                "GET" | "HEAD" => match self.state().manifests.get(&key) {
                    Some(stored) => ResponseTemplate::new(200)
                        .insert_header("Docker-Content-Digest", sha256(&stored.body))
                        .set_body_raw(stored.body.clone(), &stored.content_type),
                    None => ResponseTemplate::new(404),
                },
                "PUT" => {
                    let content_type = request
                        .headers
                        .get("content-type")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or(OCI_MANIFEST)
                        .to_string();
                    let digest = sha256(&request.body);
                    let stored = Stored {
                        content_type,
                        body: request.body.clone(),
                    };
                    let mut state = self.state();
                    state
                        .manifests
                        .insert((repository.to_string(), digest.clone()), stored.clone());
                    state.manifests.insert(key, stored);
                    ResponseTemplate::new(201).insert_header("Docker-Content-Digest", digest)
                }
                _ => ResponseTemplate::new(405),
            };
        }

        ResponseTemplate::new(404)
    }
}
