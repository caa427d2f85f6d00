//! Cosign-style signature verification.
//!
//! Signatures live in the artifact's own repository under the tag
//! `sha256-<hex>.sig`. Each layer of that manifest is a simple-signing JSON
//! payload naming the signed manifest digest, with the base64 signature over
//! the payload carried in a layer annotation. Ed25519 and ECDSA P-256 keys
//! are supported.

use base64::Engine;
use ed25519_dalek::{Signer, SigningKey};
use p256::pkcs8::DecodePublicKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::client::RegistryClient;
use crate::error::OciError;
use crate::manifest::ManifestDocument;
use crate::reference::Reference;

/// Layer annotation holding the base64 signature.
pub const SIGNATURE_ANNOTATION: &str = "dev.cosignproject.cosign/signature";
pub const SIMPLE_SIGNING_MEDIA_TYPE: &str = "application/vnd.dev.cosign.simplesigning.v1+json";
const SIMPLE_SIGNING_TYPE: &str = "cosign container image signature";

// DER prefix of an Ed25519 SubjectPublicKeyInfo.
const ED25519_SPKI_PREFIX: [u8; 12] = [
    0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x03, 0x21, 0x00,
];

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("no signature found for {0}")]
    NotFound(String),

    #[error("invalid public key: {0}")]
    InvalidKey(String),

    #[error("unsupported signature policy: {0}")]
    UnsupportedPolicy(String),

    #[error("signed payload refers to {signed}, expected {expected}")]
    DigestMismatch { expected: String, signed: String },

    #[error("malformed signature: {0}")]
    Malformed(String),

    #[error("no signature for {0} verifies against the configured key")]
    Invalid(String),
}

/// Public key a signature must verify under.
#[derive(Debug, Clone)]
pub enum PublicKey {
    Ed25519(ed25519_dalek::VerifyingKey),
    /// ECDSA P-256, as produced by `cosign generate-key-pair`.
    P256(p256::ecdsa::VerifyingKey),
}

impl PublicKey {
    /// Parse raw base64 Ed25519 bytes, or a PEM/base64 encoded
    /// SubjectPublicKeyInfo holding an Ed25519 or P-256 key.
    pub fn parse(encoded: &str) -> Result<Self, SignatureError> {
        let body: String = encoded
            .lines()
            .map(str::trim)
            .filter(|l| !l.starts_with("-----"))
            .collect();
        let der = base64::engine::general_purpose::STANDARD
            .decode(body.as_bytes())
            .map_err(|e| SignatureError::InvalidKey(e.to_string()))?;

        let raw = match der.len() {
            32 => der.as_slice(),
            44 if der.starts_with(&ED25519_SPKI_PREFIX) => &der[12..],
            _ => {
                let key = p256::ecdsa::VerifyingKey::from_public_key_der(&der).map_err(|e| {
                    SignatureError::InvalidKey(format!(
                        "expected an Ed25519 or ECDSA P-256 public key ({e})"
                    ))
                })?;
                return Ok(Self::P256(key));
            }
        };
        let bytes: [u8; 32] = raw
            .try_into()
            .map_err(|_| SignatureError::InvalidKey("wrong key length".to_string()))?;
        let key = ed25519_dalek::VerifyingKey::from_bytes(&bytes)
            .map_err(|e| SignatureError::InvalidKey(e.to_string()))?;
        Ok(Self::Ed25519(key))
    }

    /// Check `signature` over `payload`. P-256 signatures may be ASN.1 DER
    /// (cosign's encoding) or fixed-size.
    pub fn verify(&self, payload: &[u8], signature: &[u8]) -> Result<bool, SignatureError> {
        let malformed = |e: &dyn std::fmt::Display| SignatureError::Malformed(e.to_string());
        match self {
            Self::Ed25519(key) => {
                let signature =
                    ed25519_dalek::Signature::from_slice(signature).map_err(|e| malformed(&e))?;
                Ok(ed25519_dalek::Verifier::verify(key, payload, &signature).is_ok())
            }
            Self::P256(key) => {
                let signature = p256::ecdsa::Signature::from_der(signature)
                    .or_else(|_| p256::ecdsa::Signature::from_slice(signature))
                    .map_err(|e| malformed(&e))?;
                Ok(p256::ecdsa::signature::Verifier::verify(key, payload, &signature).is_ok())
            }
        }
    }
}

/// How pulled content must be signed.
#[derive(Debug, Clone, Default)]
pub enum SignaturePolicy {
    #[default]
    Disabled,
    /// Require a signature verifying under this key.
    CosignKey(PublicKey),
}

impl SignaturePolicy {
    /// Policy from an encoded public key; see [`PublicKey::parse`].
    pub fn cosign_key(encoded: &str) -> Result<Self, SignatureError> {
        PublicKey::parse(encoded).map(Self::CosignKey)
    }

    /// Policy from index signing metadata.
    ///
    /// Identity-only (keyless) metadata cannot be verified here and is refused.
    pub fn from_metadata(
        key: Option<&str>,
        certificate_identity: Option<&str>,
    ) -> Result<Self, SignatureError> {
        match (key, certificate_identity) {
            (Some(key), _) => Self::cosign_key(key),
            (None, Some(identity)) => Err(SignatureError::UnsupportedPolicy(format!(
                "keyless verification for identity `{identity}`"
            ))),
            (None, None) => Err(SignatureError::UnsupportedPolicy(
                "cosign metadata without a key".to_string(),
            )),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::Disabled)
    }
}

/// Tag under which signatures for `digest` are stored.
pub fn signature_tag(digest: &str) -> String {
    format!("{}.sig", digest.replacen(':', "-", 1))
}

/// Simple-signing payload document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimpleSigning {
    pub critical: Critical,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optional: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Critical {
    pub identity: Identity,
    pub image: Image,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    #[serde(rename = "docker-reference")]
    pub docker_reference: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    #[serde(rename = "docker-manifest-digest")]
    pub docker_manifest_digest: String,
}

/// Payload stating that `repository` at `digest` is signed.
pub fn simple_signing_payload(repository: &str, digest: &str) -> Result<Vec<u8>, OciError> {
    let payload = SimpleSigning {
        critical: Critical {
            identity: Identity {
                docker_reference: repository.to_string(),
            },
            image: Image {
                docker_manifest_digest: digest.to_string(),
            },
            kind: SIMPLE_SIGNING_TYPE.to_string(),
        },
        optional: None,
    };
    Ok(serde_json::to_vec(&payload)?)
}

/// Base64 Ed25519 signature over `payload`.
pub fn sign_payload(key: &SigningKey, payload: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(key.sign(payload).to_bytes())
}

/// Check one signature layer against the manifest digest it should cover.
pub fn verify_payload(
    key: &PublicKey,
    expected_digest: &str,
    payload: &[u8],
    signature_b64: &str,
) -> Result<(), SignatureError> {
    let document: SimpleSigning = serde_json::from_slice(payload)
        .map_err(|e| SignatureError::Malformed(e.to_string()))?;
    let signed = document.critical.image.docker_manifest_digest;
    if signed != expected_digest {
        return Err(SignatureError::DigestMismatch {
            expected: expected_digest.to_string(),
            signed,
        });
    }

    let raw = base64::engine::general_purpose::STANDARD
        .decode(signature_b64.trim())
        .map_err(|e| SignatureError::Malformed(e.to_string()))?;
    if key.verify(payload, &raw)? {
        Ok(())
    } else {
        Err(SignatureError::Invalid(expected_digest.to_string()))
    }
}

/// Verify that `digest` in `reference`'s repository carries a valid signature.
pub async fn verify(
    client: &RegistryClient,
    reference: &Reference,
    digest: &str,
    policy: &SignaturePolicy,
) -> Result<(), OciError> {
    let SignaturePolicy::CosignKey(key) = policy else {
        return Ok(());
    };

    let sig_ref = reference.with_tag(&signature_tag(digest));
    let fetched = match client.fetch_manifest(&sig_ref).await {
        Ok(fetched) => fetched,
        Err(OciError::NotFound(_)) => {
            return Err(SignatureError::NotFound(reference.to_string()).into())
        }
        Err(e) => return Err(e),
    };
    let ManifestDocument::Image(manifest) = fetched.document else {
        return Err(SignatureError::Malformed("signature tag holds an index".to_string()).into());
    };

    let mut last_error = SignatureError::NotFound(reference.to_string());
    for layer in &manifest.layers {
        let Some(signature) = layer.annotations.get(SIGNATURE_ANNOTATION) else {
            continue;
        };
        let payload = client.fetch_blob(&sig_ref, layer).await?;
        match verify_payload(key, digest, &payload, signature) {
            Ok(()) => {
                debug!(reference = %reference, digest = %digest, "Signature verified");
                return Ok(());
            }
            Err(e) => {
                warn!(reference = %reference, layer = %layer.digest, error = %e, "Signature layer rejected");
                last_error = e;
            }
        }
    }
    Err(last_error.into())
}
