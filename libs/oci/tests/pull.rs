//! Pull integration tests against an in-memory registry.

use std::sync::Arc;

use artifactctl_oci::{
    ArtifactType, ClientConfig, OciError, Platform, PullOptions, Puller, Reference,
    RegistryClient, SignatureError, SignaturePolicy, TargetDirs,
};
use artifactctl_testing::{public_key_b64, signing_key, tar_gz, FakeRegistry, OCI_MANIFEST};
use serde_json::json;
use tempfile::TempDir;

const RULES_CONFIG: &str = "application/vnd.cncf.artifactctl.rulesfile.config.v1+json";
const RULES_LAYER: &str = "application/vnd.cncf.artifactctl.rulesfile.layer.v1+tar.gz";
const PLUGIN_CONFIG: &str = "application/vnd.cncf.artifactctl.plugin.config.v1+json";
const PLUGIN_LAYER: &str = "application/vnd.cncf.artifactctl.plugin.layer.v1+tar.gz";

fn puller() -> Puller {
    let client = RegistryClient::new(ClientConfig {
        plain_http: true,
        ..Default::default()
    })
    .unwrap();
    Puller::new(Arc::new(client))
}

fn options(platform: &str) -> PullOptions {
    PullOptions {
        platform: Platform::parse(platform).unwrap(),
        ..Default::default()
    }
}

fn publish_rules(registry: &FakeRegistry) -> String {
    let files: [(&str, &[u8]); 1] = [("k8s_audit_rules.yaml", b"- rule: audit\n")];
    registry.publish(
        "rules/k8saudit",
        "0.5",
        RULES_CONFIG,
        &json!({
            "name": "k8saudit-rules",
            "version": "0.5.0",
            "requirements": [{"name": "plugin_api_version", "version": "2.0.0"}],
        }),
        RULES_LAYER,
        &files,
    )
}

fn publish_plugin(registry: &FakeRegistry) -> (String, Vec<String>) {
    let amd: [(&str, &[u8]); 1] = [("libjson.so", b"amd64 build")];
    let arm: [(&str, &[u8]); 1] = [("libjson.so", b"arm64 build")];
    registry.publish_multi_platform(
        "plugins/json",
        "latest",
        PLUGIN_CONFIG,
        &json!({"name": "json", "version": "0.7.0"}),
        PLUGIN_LAYER,
        &[("linux", "amd64", amd.as_slice()), ("linux", "arm64", arm.as_slice())],
    )
}

#[tokio::test]
async fn test_pull_single_manifest_artifact() {
    let registry = FakeRegistry::start().await;
    let digest = publish_rules(&registry);
    let dest = TempDir::new().unwrap();

    let reference = Reference::parse(&registry.reference("rules/k8saudit", "0.5")).unwrap();
    let result = puller()
        .pull(&reference, &TargetDirs::all(dest.path()), &options("linux/amd64"))
        .await
        .unwrap();

    assert_eq!(result.digest, digest);
    assert_eq!(result.artifact_type, ArtifactType::Rulesfile);
    assert_eq!(result.config.version, "0.5.0");
    assert_eq!(
        std::fs::read_to_string(dest.path().join("k8s_audit_rules.yaml")).unwrap(),
        "- rule: audit\n"
    );
}

#[tokio::test]
async fn test_pull_selects_requested_platform() {
    let registry = FakeRegistry::start().await;
    let (_, digests) = publish_plugin(&registry);
    let rules = TempDir::new().unwrap();
    let plugins = TempDir::new().unwrap();
    let dirs = TargetDirs {
        rulesfile: rules.path().to_path_buf(),
        plugin: plugins.path().to_path_buf(),
        asset: rules.path().to_path_buf(),
    };

    let reference = Reference::parse(&registry.reference("plugins/json", "latest")).unwrap();
    let result = puller()
        .pull(&reference, &dirs, &options("linux/arm64"))
        .await
        .unwrap();

    assert_eq!(result.digest, digests[1]);
    assert_eq!(
        std::fs::read(plugins.path().join("libjson.so")).unwrap(),
        b"arm64 build"
    );
    assert_eq!(std::fs::read_dir(rules.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_pull_missing_platform() {
    let registry = FakeRegistry::start().await;
    publish_plugin(&registry);
    let dest = TempDir::new().unwrap();

    let reference = Reference::parse(&registry.reference("plugins/json", "latest")).unwrap();
    let err = puller()
        .pull(&reference, &TargetDirs::all(dest.path()), &options("linux/wrong"))
        .await
        .unwrap_err();

    assert_eq!(
        err.to_string(),
        "unable to find a manifest matching the given platform: `linux/wrong`"
    );
    assert_eq!(std::fs::read_dir(dest.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_digest_mismatch_aborts_before_write() {
    let registry = FakeRegistry::start().await;
    let digest = publish_rules(&registry);
    let manifest = registry.manifest("rules/k8saudit", &digest).unwrap();
    let layer_digest = manifest["layers"][0]["digest"].as_str().unwrap().to_string();
    registry.corrupt_blob(&layer_digest, b"tampered layer bytes");
    let dest = TempDir::new().unwrap();

    let reference = Reference::parse(&registry.reference("rules/k8saudit", "0.5")).unwrap();
    let err = puller()
        .pull(&reference, &TargetDirs::all(dest.path()), &options("linux/amd64"))
        .await
        .unwrap_err();

    assert!(matches!(err, OciError::DigestMismatch { .. }));
    assert_eq!(std::fs::read_dir(dest.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_config_and_raw_config() {
    let registry = FakeRegistry::start().await;
    publish_rules(&registry);
    let reference = Reference::parse(&registry.reference("rules/k8saudit", "0.5")).unwrap();
    let platform = Platform::new("linux", "amd64");
    let puller = puller();

    let config = puller.config(&reference, &platform).await.unwrap();
    assert_eq!(config.name, "k8saudit-rules");
    assert_eq!(config.requirements[0].name, "plugin_api_version");

    let raw = puller.raw_config(&reference, &platform).await.unwrap();
    let value: serde_json::Value = serde_json::from_slice(&raw).unwrap();
    assert_eq!(value["version"], "0.5.0");
}

#[tokio::test]
async fn test_allowed_types_refuse_before_write() {
    let registry = FakeRegistry::start().await;
    publish_plugin(&registry);
    let dest = TempDir::new().unwrap();

    let reference = Reference::parse(&registry.reference("plugins/json", "latest")).unwrap();
    let options = PullOptions {
        allowed_types: Some(vec![ArtifactType::Rulesfile]),
        ..options("linux/amd64")
    };
    let err = puller()
        .pull(&reference, &TargetDirs::all(dest.path()), &options)
        .await
        .unwrap_err();

    assert!(matches!(err, OciError::TypeNotAllowed(_)));
    assert_eq!(std::fs::read_dir(dest.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_signed_artifact_verifies() {
    let registry = FakeRegistry::start().await;
    let digest = publish_rules(&registry);
    let key = signing_key(3);
    registry.sign("rules/k8saudit", &digest, &key);
    let dest = TempDir::new().unwrap();

    let reference = Reference::parse(&registry.reference("rules/k8saudit", "0.5")).unwrap();
    let options = PullOptions {
        policy: SignaturePolicy::cosign_key(&public_key_b64(&key)).unwrap(),
        ..options("linux/amd64")
    };
    puller()
        .pull(&reference, &TargetDirs::all(dest.path()), &options)
        .await
        .unwrap();
    assert!(dest.path().join("k8s_audit_rules.yaml").exists());
}

#[tokio::test]
async fn test_signature_failures_abort_before_write() {
    let registry = FakeRegistry::start().await;
    let digest = publish_rules(&registry);
    let trusted = signing_key(3);
    let reference = Reference::parse(&registry.reference("rules/k8saudit", "0.5")).unwrap();
    let options = PullOptions {
        policy: SignaturePolicy::cosign_key(&public_key_b64(&trusted)).unwrap(),
        ..options("linux/amd64")
    };
    let dest = TempDir::new().unwrap();
    let dirs = TargetDirs::all(dest.path());

    // unsigned
    let err = puller().pull(&reference, &dirs, &options).await.unwrap_err();
    assert!(matches!(err, OciError::Signature(SignatureError::NotFound(_))));

    // signed by someone else
    registry.sign("rules/k8saudit", &digest, &signing_key(4));
    let err = puller().pull(&reference, &dirs, &options).await.unwrap_err();
    assert!(matches!(err, OciError::Signature(SignatureError::Invalid(_))));

    // trusted key, but the payload names another manifest
    registry.sign_payload("rules/k8saudit", &digest, "sha256:00ff", &trusted);
    let err = puller().pull(&reference, &dirs, &options).await.unwrap_err();
    assert!(err.is_integrity_failure());

    assert_eq!(std::fs::read_dir(dest.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_corrupt_second_layer_installs_nothing() {
    let registry = FakeRegistry::start().await;
    let config = registry.put_blob(br#"{"name":"k8saudit-rules","version":"0.5.0"}"#);
    let first = registry.put_blob(&tar_gz(&[(
        "k8s_audit_rules.yaml",
        b"- rule: audit\n".as_slice(),
    )]));
    // valid digest, but not a gzip stream
    let second = registry.put_blob(b"\x1f\x8b not really gzip");
    let manifest = json!({
        "schemaVersion": 2,
        "mediaType": OCI_MANIFEST,
        "config": {"mediaType": RULES_CONFIG, "digest": config.digest, "size": config.size},
        "layers": [
            {"mediaType": RULES_LAYER, "digest": first.digest, "size": first.size},
            {"mediaType": RULES_LAYER, "digest": second.digest, "size": second.size},
        ],
    });
    registry.put_manifest(
        "rules/k8saudit",
        "0.5",
        OCI_MANIFEST,
        &serde_json::to_vec(&manifest).unwrap(),
    );
    let dest = TempDir::new().unwrap();
    std::fs::write(dest.path().join("k8s_audit_rules.yaml"), b"previous").unwrap();

    let reference = Reference::parse(&registry.reference("rules/k8saudit", "0.5")).unwrap();
    let result = puller()
        .pull(&reference, &TargetDirs::all(dest.path()), &options("linux/amd64"))
        .await;

    assert!(result.is_err());
    assert_eq!(
        std::fs::read(dest.path().join("k8s_audit_rules.yaml")).unwrap(),
        b"previous"
    );
    assert_eq!(std::fs::read_dir(dest.path()).unwrap().count(), 1);
}

#[tokio::test]
async fn test_pull_refuses_moved_release() {
    let registry = FakeRegistry::start().await;
    let digest = publish_rules(&registry);
    let dest = TempDir::new().unwrap();
    let reference = Reference::parse(&registry.reference("rules/k8saudit", "0.5")).unwrap();

    let pinned = PullOptions {
        expected_digest: Some(digest.clone()),
        ..options("linux/amd64")
    };
    puller()
        .pull(&reference, &TargetDirs::all(dest.path()), &pinned)
        .await
        .unwrap();

    let stale = PullOptions {
        expected_digest: Some(format!("sha256:{}", "00".repeat(32))),
        ..options("linux/amd64")
    };
    let other = TempDir::new().unwrap();
    let err = puller()
        .pull(&reference, &TargetDirs::all(other.path()), &stale)
        .await
        .unwrap_err();
    assert!(matches!(err, OciError::ReleaseChanged { actual, .. } if actual == digest));
    assert_eq!(std::fs::read_dir(other.path()).unwrap().count(), 0);
}
