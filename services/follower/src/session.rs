//! Follow session wiring.
//!
//! Startup is all-or-nothing: indexes are loaded, every reference resolved and
//! the engine versions fetched before the first follower is spawned. Once the
//! followers run, their failures are per-cycle and never end the session.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use artifactctl_index::{BackendRegistry, IndexCache, IndexConfig};
use artifactctl_oci::{
    ArtifactType, ClientConfig, CredentialStore, NoCredentials, Platform, PullOptions, Puller,
    Reference, RegistryClient, SignaturePolicy, TargetDirs,
};
use tracing::{info, warn};

use crate::backoff::{BackoffConfig, BackoffTransport};
use crate::error::FollowError;
use crate::follower::{Follower, FollowerConfig, RegistrySource};
use crate::schedule::Schedule;
use crate::supervisor::{Supervisor, DEFAULT_GRACE};
use crate::versions::{fetch_engine_versions, DEFAULT_VERSIONS_SOURCE};

/// Default retry budget for the engine versions endpoint.
pub const DEFAULT_VERSIONS_TIMEOUT: Duration = Duration::from_secs(120);

/// Everything needed to follow a set of references.
#[derive(Clone)]
pub struct FollowSession {
    /// Bare index names or fully-qualified references.
    pub references: Vec<String>,
    pub schedule: Schedule,
    pub dirs: TargetDirs,
    pub platform: Platform,
    pub plain_http: bool,
    pub allowed_types: Option<Vec<ArtifactType>>,
    /// Skip signature verification even when the index requires it.
    pub no_verify: bool,
    /// URL or file path of the engine versions document.
    pub versions_source: String,
    /// Retry budget for the versions endpoint.
    pub timeout: Duration,
    /// Shutdown grace period.
    pub grace: Duration,
    pub indexes: Vec<IndexConfig>,
    pub credentials: Arc<dyn CredentialStore>,
}

impl FollowSession {
    pub fn new(references: Vec<String>, schedule: Schedule, dirs: TargetDirs) -> Self {
        Self {
            references,
            schedule,
            dirs,
            platform: Platform::current(),
            plain_http: false,
            allowed_types: None,
            no_verify: false,
            versions_source: DEFAULT_VERSIONS_SOURCE.to_string(),
            timeout: DEFAULT_VERSIONS_TIMEOUT,
            grace: DEFAULT_GRACE,
            indexes: Vec::new(),
            credentials: Arc::new(NoCredentials),
        }
    }
}

/// Signature policy for `name` from the index metadata.
///
/// Fully-qualified references and entries without cosign metadata are not
/// verified.
pub fn signature_policy(cache: &IndexCache, name: &str) -> Result<SignaturePolicy, FollowError> {
    let Some(cosign) = cache
        .signature_for_index_ref(name)
        .and_then(|signature| signature.cosign.as_ref())
    else {
        return Ok(SignaturePolicy::Disabled);
    };
    SignaturePolicy::from_metadata(cosign.key.as_deref(), cosign.certificate_identity.as_deref())
        .map_err(|source| FollowError::Signature {
            reference: name.to_string(),
            source,
        })
}

/// A reference ready to be followed.
struct Target {
    reference: Reference,
    policy: SignaturePolicy,
}

fn resolve_targets(session: &FollowSession, cache: &IndexCache) -> Result<Vec<Target>, FollowError> {
    if session.references.is_empty() {
        return Err(FollowError::InvalidConfig(
            "no references to follow".to_string(),
        ));
    }

    session
        .references
        .iter()
        .map(|name| {
            let resolved = cache.resolve_reference(name)?;
            let reference = Reference::parse(&resolved)?;
            let policy = if session.no_verify {
                SignaturePolicy::Disabled
            } else {
                signature_policy(cache, name)?
            };
            info!(
                name = %name,
                reference = %reference,
                verify = policy.is_enabled(),
                "Reference resolved"
            );
            Ok(Target { reference, policy })
        })
        .collect()
}

/// Follow every reference of `session` until `cancel` resolves.
///
/// Returns an error only when startup fails; a slow shutdown is logged.
pub async fn run_follow<F>(session: FollowSession, cancel: F) -> Result<(), FollowError>
where
    F: Future<Output = ()>,
{
    let cache = IndexCache::load(&session.indexes, &BackendRegistry::with_defaults()?).await?;
    let targets = resolve_targets(&session, &cache)?;

    let mut supervisor = Supervisor::new(session.grace);
    tokio::pin!(cancel);

    let transport = BackoffTransport::new(
        reqwest::Client::new(),
        BackoffConfig {
            max_delay: session.timeout,
            ..Default::default()
        },
        supervisor.shutdown_signal(),
    );
    let versions = tokio::select! {
        _ = &mut cancel => return Err(FollowError::Cancelled),
        versions = fetch_engine_versions(&session.versions_source, &transport) => versions?,
    };

    for target in targets {
        let client = RegistryClient::new(ClientConfig {
            plain_http: session.plain_http,
            ..Default::default()
        })?
        .with_credentials(Arc::clone(&session.credentials));
        let source = RegistrySource::new(Puller::new(Arc::new(client)));

        let follower = Follower::new(
            FollowerConfig {
                reference: target.reference,
                schedule: session.schedule.clone(),
                dirs: session.dirs.clone(),
                options: PullOptions {
                    platform: session.platform.clone(),
                    policy: target.policy,
                    allowed_types: session.allowed_types.clone(),
                    expected_digest: None,
                },
                versions: versions.clone(),
            },
            source,
        );
        supervisor.spawn_follower(follower);
    }

    info!(
        followers = supervisor.worker_count(),
        schedule = %session.schedule,
        "Follow session started"
    );

    if let Err(e) = supervisor.run_until(cancel).await {
        warn!(error = %e, "Shutdown timed out");
    }
    info!("Follow session stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use artifactctl_index::{CosignSignature, Index, IndexEntry, Signature};

    fn entry(name: &str, cosign: Option<CosignSignature>) -> IndexEntry {
        IndexEntry {
            name: name.to_string(),
            artifact_type: "rulesfile".to_string(),
            registry: "ghcr.io".to_string(),
            repository: format!("example/{name}"),
            signature: cosign.map(|cosign| Signature {
                cosign: Some(cosign),
            }),
            ..Default::default()
        }
    }

    fn cache() -> IndexCache {
        IndexCache::from_indexes(vec![Index {
            name: "main".to_string(),
            backend: "file".to_string(),
            entries: vec![
                entry("plain", None),
                entry(
                    "keyed",
                    Some(CosignSignature {
                        key: Some(base64_key()),
                        ..Default::default()
                    }),
                ),
                entry(
                    "keyless",
                    Some(CosignSignature {
                        certificate_identity: Some("ci@example.com".to_string()),
                        ..Default::default()
                    }),
                ),
            ],
        }])
    }

    fn base64_key() -> String {
        artifactctl_testing::public_key_b64(&artifactctl_testing::signing_key(3))
    }

    #[test]
    fn test_signature_policy_from_index() {
        let cache = cache();
        assert!(!signature_policy(&cache, "plain").unwrap().is_enabled());
        assert!(signature_policy(&cache, "keyed:1.0").unwrap().is_enabled());
        assert!(!signature_policy(&cache, "ghcr.io/example/keyed:1.0")
            .unwrap()
            .is_enabled());
        assert!(matches!(
            signature_policy(&cache, "keyless"),
            Err(FollowError::Signature { .. })
        ));
    }

    #[test]
    fn test_resolution_failure_is_fatal() {
        let session = FollowSession::new(
            vec!["plain".to_string(), "unknown".to_string()],
            Schedule::every(Duration::from_secs(60)).unwrap(),
            TargetDirs::all("/tmp"),
        );
        assert!(matches!(
            resolve_targets(&session, &cache()),
            Err(FollowError::Index(_))
        ));
    }

    #[test]
    fn test_no_verify_skips_keyless_metadata() {
        let mut session = FollowSession::new(
            vec!["keyless".to_string()],
            Schedule::every(Duration::from_secs(60)).unwrap(),
            TargetDirs::all("/tmp"),
        );
        session.no_verify = true;
        let targets = resolve_targets(&session, &cache()).unwrap();
        assert_eq!(
            targets[0].reference.to_string(),
            "ghcr.io/example/keyless:latest"
        );
        assert!(!targets[0].policy.is_enabled());
    }

    #[test]
    fn test_empty_reference_list() {
        let session = FollowSession::new(
            vec![],
            Schedule::every(Duration::from_secs(60)).unwrap(),
            TargetDirs::all("/tmp"),
        );
        assert!(matches!(
            resolve_targets(&session, &cache()),
            Err(FollowError::InvalidConfig(_))
        ));
    }
}
