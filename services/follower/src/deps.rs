//! Dependency resolution for pulls.
//!
//! Artifacts named by the user are pinned at the version their config
//! reports. Each dependency resolves to the highest version required of it
//! within one major version; a dependency is skipped when one of its
//! alternatives is already selected at a compatible version.

use std::collections::{BTreeMap, VecDeque};

use artifactctl_index::IndexCache;
use artifactctl_oci::{ArtifactConfig, Dependency, Platform, Puller, Reference};
use async_trait::async_trait;
use semver::Version;
use thiserror::Error;
use tracing::debug;

use crate::error::FollowError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DependencyError {
    #[error("artifact config of {0} carries no name")]
    Unnamed(String),

    #[error("`{name}` has invalid version `{version}`: {reason}")]
    InvalidVersion {
        name: String,
        version: String,
        reason: String,
    },

    #[error("{required_by} requires {name} {required}, incompatible with selected {selected}")]
    MajorConflict {
        name: String,
        required: String,
        selected: String,
        required_by: String,
    },

    #[error("{required_by} requires {name} {required}, but {pinned} was requested")]
    PinnedTooLow {
        name: String,
        required: String,
        pinned: String,
        required_by: String,
    },
}

/// Looks up the config of an artifact by name or reference.
#[async_trait]
pub trait ConfigResolver: Send + Sync {
    async fn config(&self, reference: &str) -> Result<ArtifactConfig, FollowError>;
}

/// Resolves names through the index cache and reads configs from the registry.
pub struct RegistryConfigResolver<'a> {
    cache: &'a IndexCache,
    puller: &'a Puller,
    platform: Platform,
}

impl<'a> RegistryConfigResolver<'a> {
    pub fn new(cache: &'a IndexCache, puller: &'a Puller, platform: Platform) -> Self {
        Self {
            cache,
            puller,
            platform,
        }
    }
}

#[async_trait]
impl ConfigResolver for RegistryConfigResolver<'_> {
    async fn config(&self, reference: &str) -> Result<ArtifactConfig, FollowError> {
        let reference = Reference::parse(&self.cache.resolve_reference(reference)?)?;
        Ok(self.puller.config(&reference, &self.platform).await?)
    }
}

/// An artifact selected by [`resolve_dependencies`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedArtifact {
    pub name: String,
    pub version: String,
    /// Name or reference the artifact is pulled from.
    pub reference: String,
    /// Whether the user asked for this artifact directly.
    pub requested: bool,
}

/// Resolve the dependency closure of `inputs`, sorted by name.
pub async fn resolve_dependencies(
    inputs: &[String],
    resolver: &dyn ConfigResolver,
) -> Result<Vec<ResolvedArtifact>, FollowError> {
    let mut selected: BTreeMap<String, ResolvedArtifact> = BTreeMap::new();
    let mut queue = VecDeque::new();

    for input in inputs {
        let config = resolver.config(input).await?;
        if config.name.is_empty() {
            return Err(DependencyError::Unnamed(input.clone()).into());
        }
        selected.insert(
            config.name.clone(),
            ResolvedArtifact {
                name: config.name.clone(),
                version: config.version.clone(),
                reference: input.clone(),
                requested: true,
            },
        );
        queue.push_back(config);
    }

    while let Some(config) = queue.pop_front() {
        for dependency in &config.dependencies {
            if satisfied_by_alternative(dependency, &selected)? {
                debug!(dependency = %dependency.name, required_by = %config.name, "Dependency satisfied by alternative");
                continue;
            }

            let required = parse_version(&dependency.name, &dependency.version)?;
            if let Some(existing) = selected.get(&dependency.name) {
                let current = parse_version(&existing.name, &existing.version)?;
                if current.major != required.major {
                    return Err(DependencyError::MajorConflict {
                        name: dependency.name.clone(),
                        required: dependency.version.clone(),
                        selected: existing.version.clone(),
                        required_by: config.name.clone(),
                    }
                    .into());
                }
                if current >= required {
                    continue;
                }
                if existing.requested {
                    return Err(DependencyError::PinnedTooLow {
                        name: dependency.name.clone(),
                        required: dependency.version.clone(),
                        pinned: existing.version.clone(),
                        required_by: config.name.clone(),
                    }
                    .into());
                }
                debug!(dependency = %dependency.name, from = %existing.version, to = %dependency.version, "Upgrading dependency");
            }

            let reference = format!("{}:{}", dependency.name, dependency.version);
            let dependency_config = resolver.config(&reference).await?;
            selected.insert(
                dependency.name.clone(),
                ResolvedArtifact {
                    name: dependency.name.clone(),
                    version: dependency.version.clone(),
                    reference,
                    requested: false,
                },
            );
            queue.push_back(dependency_config);
        }
    }

    Ok(selected.into_values().collect())
}

fn satisfied_by_alternative(
    dependency: &Dependency,
    selected: &BTreeMap<String, ResolvedArtifact>,
) -> Result<bool, DependencyError> {
    for alternative in &dependency.alternatives {
        let Some(existing) = selected.get(&alternative.name) else {
            continue;
        };
        let wanted = parse_version(&alternative.name, &alternative.version)?;
        let current = parse_version(&existing.name, &existing.version)?;
        if current.major == wanted.major && current >= wanted {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Parse a version, padding `1` and `1.2` to full semantic versions.
fn parse_version(name: &str, version: &str) -> Result<Version, DependencyError> {
    let trimmed = version.trim().trim_start_matches('v');
    let padded = match trimmed.matches('.').count() {
        0 => format!("{trimmed}.0.0"),
        1 => format!("{trimmed}.0"),
        _ => trimmed.to_string(),
    };
    Version::parse(&padded).map_err(|e| DependencyError::InvalidVersion {
        name: name.to_string(),
        version: version.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use artifactctl_oci::Alternative;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Catalog {
        configs: HashMap<String, ArtifactConfig>,
        lookups: Mutex<Vec<String>>,
    }

    impl Catalog {
        fn add(mut self, name: &str, version: &str, dependencies: Vec<Dependency>) -> Self {
            let config = ArtifactConfig {
                name: name.to_string(),
                version: version.to_string(),
                requirements: Vec::new(),
                dependencies,
            };
            self.configs.insert(format!("{name}:{version}"), config);
            self
        }
    }

    #[async_trait]
    impl ConfigResolver for Catalog {
        async fn config(&self, reference: &str) -> Result<ArtifactConfig, FollowError> {
            self.lookups.lock().unwrap().push(reference.to_string());
            self.configs
                .get(reference)
                .cloned()
                .ok_or_else(|| FollowError::InvalidConfig(format!("unknown {reference}")))
        }
    }

    fn dep(name: &str, version: &str) -> Dependency {
        Dependency {
            name: name.to_string(),
            version: version.to_string(),
            alternatives: Vec::new(),
        }
    }

    fn versions(resolved: &[ResolvedArtifact]) -> Vec<(&str, &str, bool)> {
        resolved
            .iter()
            .map(|r| (r.name.as_str(), r.version.as_str(), r.requested))
            .collect()
    }

    fn inputs(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_transitive_dependencies() {
        let catalog = Catalog::default()
            .add("rules", "1.0.0", vec![dep("k8saudit", "0.5.0")])
            .add("k8saudit", "0.5.0", vec![dep("json", "0.7.0")])
            .add("json", "0.7.0", vec![]);

        let resolved = resolve_dependencies(&inputs(&["rules:1.0.0"]), &catalog)
            .await
            .unwrap();
        assert_eq!(
            versions(&resolved),
            vec![
                ("json", "0.7.0", false),
                ("k8saudit", "0.5.0", false),
                ("rules", "1.0.0", true),
            ]
        );
        assert_eq!(resolved[0].reference, "json:0.7.0");
    }

    #[tokio::test]
    async fn test_highest_version_in_major_wins() {
        let catalog = Catalog::default()
            .add("a", "1.0.0", vec![dep("json", "1.2")])
            .add("b", "1.0.0", vec![dep("json", "1.4.0")])
            .add("json", "1.2", vec![dep("old-only", "1.0.0")])
            .add("old-only", "1.0.0", vec![])
            .add("json", "1.4.0", vec![]);

        let resolved = resolve_dependencies(&inputs(&["a:1.0.0", "b:1.0.0"]), &catalog)
            .await
            .unwrap();
        let json = resolved.iter().find(|r| r.name == "json").unwrap();
        assert_eq!(json.version, "1.4.0");
        assert_eq!(json.reference, "json:1.4.0");
    }

    #[tokio::test]
    async fn test_lower_requirement_keeps_selected_version() {
        let catalog = Catalog::default()
            .add("a", "1.0.0", vec![dep("json", "1.4.0")])
            .add("b", "1.0.0", vec![dep("json", "1.2.0")])
            .add("json", "1.4.0", vec![]);

        let resolved = resolve_dependencies(&inputs(&["a:1.0.0", "b:1.0.0"]), &catalog)
            .await
            .unwrap();
        assert!(resolved.iter().any(|r| r.name == "json" && r.version == "1.4.0"));
        assert!(!catalog
            .lookups
            .lock()
            .unwrap()
            .contains(&"json:1.2.0".to_string()));
    }

    #[tokio::test]
    async fn test_major_conflict() {
        let catalog = Catalog::default()
            .add("a", "1.0.0", vec![dep("json", "1.0.0")])
            .add("b", "1.0.0", vec![dep("json", "2.0.0")])
            .add("json", "1.0.0", vec![]);

        let err = resolve_dependencies(&inputs(&["a:1.0.0", "b:1.0.0"]), &catalog)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FollowError::Dependency(DependencyError::MajorConflict { ref name, .. }) if name == "json"
        ));
    }

    #[tokio::test]
    async fn test_requested_version_is_pinned() {
        let catalog = Catalog::default()
            .add("rules", "1.0.0", vec![dep("json", "0.8.0")])
            .add("json", "0.7.0", vec![]);

        let err = resolve_dependencies(&inputs(&["rules:1.0.0", "json:0.7.0"]), &catalog)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FollowError::Dependency(DependencyError::PinnedTooLow { ref pinned, .. }) if pinned == "0.7.0"
        ));

        let catalog = Catalog::default()
            .add("rules", "1.0.0", vec![dep("json", "0.7.0")])
            .add("json", "0.9.0", vec![]);
        let resolved = resolve_dependencies(&inputs(&["rules:1.0.0", "json:0.9.0"]), &catalog)
            .await
            .unwrap();
        assert_eq!(
            versions(&resolved),
            vec![("json", "0.9.0", true), ("rules", "1.0.0", true)]
        );
    }

    #[tokio::test]
    async fn test_alternative_satisfies_dependency() {
        let mut dependency = dep("k8saudit", "0.5.0");
        dependency.alternatives = vec![Alternative {
            name: "k8saudit-eks".to_string(),
            version: "0.2.0".to_string(),
        }];
        let catalog = Catalog::default()
            .add("rules", "1.0.0", vec![dependency])
            .add("k8saudit-eks", "0.2.1", vec![]);

        let resolved = resolve_dependencies(&inputs(&["k8saudit-eks:0.2.1", "rules:1.0.0"]), &catalog)
            .await
            .unwrap();
        assert!(resolved.iter().all(|r| r.name != "k8saudit"));
    }

    #[tokio::test]
    async fn test_unnamed_config_is_rejected() {
        let mut catalog = Catalog::default();
        catalog
            .configs
            .insert("ghcr.io/org/raw:1".to_string(), ArtifactConfig::default());

        let err = resolve_dependencies(&inputs(&["ghcr.io/org/raw:1"]), &catalog)
            .await
            .unwrap_err();
        assert!(matches!(err, FollowError::Dependency(DependencyError::Unnamed(_))));
    }

    #[test]
    fn test_parse_version_padding() {
        assert_eq!(parse_version("x", "1").unwrap(), Version::new(1, 0, 0));
        assert_eq!(parse_version("x", "0.5").unwrap(), Version::new(0, 5, 0));
        assert_eq!(parse_version("x", "v2.1.3").unwrap(), Version::new(2, 1, 3));
        assert!(parse_version("x", "latest").is_err());
    }
}
