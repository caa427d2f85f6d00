//! Push integration tests: publish through the distribution API, then pull back.

use std::collections::BTreeMap;
use std::sync::Arc;

use artifactctl_oci::{
    ArtifactConfig, ArtifactType, ClientConfig, OciError, Platform, PullOptions, Puller,
    PushLayer, PushRequest, Pusher, Reference, RegistryClient, Requirement, SignaturePolicy,
    TargetDirs,
};
use artifactctl_testing::{public_key_b64, signing_key, FakeRegistry, OCI_INDEX};
use tempfile::TempDir;

fn client() -> Arc<RegistryClient> {
    Arc::new(
        RegistryClient::new(ClientConfig {
            plain_http: true,
            ..Default::default()
        })
        .unwrap(),
    )
}

fn rules_request() -> PushRequest {
    PushRequest {
        artifact_type: ArtifactType::Rulesfile,
        config: ArtifactConfig {
            name: "cloudtrail-rules".to_string(),
            version: "0.9.0".to_string(),
            requirements: vec![Requirement {
                name: "engine_version_semver".to_string(),
                version: "0.36.0".to_string(),
            }],
            dependencies: vec![],
        },
        layers: vec![PushLayer {
            platform: None,
            files: vec![("cloudtrail_rules.yaml".to_string(), b"- rule: ct\n".to_vec())],
        }],
        annotations: BTreeMap::new(),
    }
}

#[tokio::test]
async fn test_push_then_pull() {
    let registry = FakeRegistry::start().await;
    let client = client();
    let reference = Reference::parse(&registry.reference("rules/cloudtrail", "0.9.0")).unwrap();

    let pushed = Pusher::new(Arc::clone(&client))
        .push(&reference, &rules_request())
        .await
        .unwrap();
    assert_eq!(pushed.manifests, vec![pushed.digest.clone()]);

    let dest = TempDir::new().unwrap();
    let pulled = Puller::new(client)
        .pull(
            &reference,
            &TargetDirs::all(dest.path()),
            &PullOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(pulled.digest, pushed.digest);
    assert_eq!(pulled.config.name, "cloudtrail-rules");
    assert_eq!(
        std::fs::read_to_string(dest.path().join("cloudtrail_rules.yaml")).unwrap(),
        "- rule: ct\n"
    );
}

#[tokio::test]
async fn test_push_skips_existing_blobs() {
    let registry = FakeRegistry::start().await;
    let pusher = Pusher::new(client());
    let reference = Reference::parse(&registry.reference("rules/cloudtrail", "0.9.0")).unwrap();

    pusher.push(&reference, &rules_request()).await.unwrap();
    let uploads = registry.count_requests("POST", "/blobs/uploads/").await;
    pusher
        .push(&reference.with_tag("latest"), &rules_request())
        .await
        .unwrap();

    assert_eq!(uploads, 2);
    assert_eq!(registry.count_requests("POST", "/blobs/uploads/").await, 2);
}

#[tokio::test]
async fn test_push_multi_platform_plugin() {
    let registry = FakeRegistry::start().await;
    let client = client();
    let reference = Reference::parse(&registry.reference("plugins/json", "0.7.0")).unwrap();
    let request = PushRequest {
        artifact_type: ArtifactType::Plugin,
        config: ArtifactConfig {
            name: "json".to_string(),
            version: "0.7.0".to_string(),
            ..Default::default()
        },
        layers: vec![
            PushLayer {
                platform: Some(Platform::new("linux", "amd64")),
                files: vec![("libjson.so".to_string(), b"amd".to_vec())],
            },
            PushLayer {
                platform: Some(Platform::new("linux", "arm64")),
                files: vec![("libjson.so".to_string(), b"arm".to_vec())],
            },
        ],
        annotations: BTreeMap::new(),
    };

    let pushed = Pusher::new(Arc::clone(&client))
        .push(&reference, &request)
        .await
        .unwrap();
    assert_eq!(pushed.manifests.len(), 2);
    let index = registry.manifest("plugins/json", "0.7.0").unwrap();
    assert_eq!(index["mediaType"], OCI_INDEX);
    assert_eq!(index["manifests"][1]["platform"]["architecture"], "arm64");

    let dest = TempDir::new().unwrap();
    let pulled = Puller::new(client)
        .pull(
            &reference,
            &TargetDirs::all(dest.path()),
            &PullOptions {
                platform: Platform::new("linux", "arm64"),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(pulled.digest, pushed.manifests[1]);
    assert_eq!(std::fs::read(dest.path().join("libjson.so")).unwrap(), b"arm");
}

#[tokio::test]
async fn test_push_to_digest_is_rejected() {
    let registry = FakeRegistry::start().await;
    let reference = Reference::parse(&format!(
        "{}/rules/cloudtrail@sha256:{}",
        registry.host(),
        "ab".repeat(32)
    ))
    .unwrap();

    let err = Pusher::new(client())
        .push(&reference, &rules_request())
        .await
        .unwrap_err();
    assert!(matches!(err, OciError::InvalidPush(_)));
    assert_eq!(registry.count_requests("PUT", "/manifests/").await, 0);
}

#[tokio::test]
async fn test_push_signature_then_verified_pull() {
    let registry = FakeRegistry::start().await;
    let client = client();
    let key = signing_key(11);
    let reference = Reference::parse(&registry.reference("rules/cloudtrail", "0.9.0")).unwrap();

    let pusher = Pusher::new(Arc::clone(&client));
    let pushed = pusher.push(&reference, &rules_request()).await.unwrap();
    pusher
        .push_signature(&reference, &pushed.digest, &key)
        .await
        .unwrap();

    let dest = TempDir::new().unwrap();
    Puller::new(client)
        .pull(
            &reference,
            &TargetDirs::all(dest.path()),
            &PullOptions {
                policy: SignaturePolicy::cosign_key(&public_key_b64(&key)).unwrap(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
}
