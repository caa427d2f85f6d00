//! Merged view over every configured index.
//!
//! The cache is built once, before any follower starts, and is read-only
//! afterwards. Resolution is deterministic: when several indexes define the
//! same name, the entry from the earliest-loaded index wins.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::backend::{infer_backend, BackendRegistry};
use crate::entry::{Index, IndexEntry, Signature};
use crate::error::IndexError;

/// Tag used when a bare name carries none.
pub const DEFAULT_TAG: &str = "latest";

/// A configured index source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Index name.
    pub name: String,
    /// URL or local path of the index file.
    pub url: String,
    /// Backend kind; inferred from the URL when empty.
    #[serde(default)]
    pub backend: String,
}

impl IndexConfig {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            backend: String::new(),
        }
    }

    /// Backend kind to use, inferring from the URL when unset.
    pub fn backend_kind(&self) -> &str {
        if self.backend.is_empty() {
            infer_backend(&self.url)
        } else {
            &self.backend
        }
    }
}

/// Name to registry-location mapping merged from all loaded indexes.
#[derive(Debug, Clone, Default)]
pub struct IndexCache {
    /// Loaded index names in load order.
    indexes: Vec<String>,
    entries: HashMap<String, IndexEntry>,
}

impl IndexCache {
    /// Fetch and merge every configured index, in order.
    ///
    /// Any unsupported backend, unreachable source or malformed index aborts
    /// the whole build.
    pub async fn load(
        configs: &[IndexConfig],
        backends: &BackendRegistry,
    ) -> Result<Self, IndexError> {
        let mut indexes = Vec::with_capacity(configs.len());

        for config in configs {
            if config.name.is_empty() {
                return Err(IndexError::InvalidConfig(format!(
                    "index with url {} has no name",
                    config.url
                )));
            }

            let kind = config.backend_kind();
            let backend = backends.get(kind)?;
            let data = backend
                .fetch(&config.url)
                .await
                .map_err(|source| IndexError::Unreachable {
                    name: config.name.clone(),
                    url: config.url.clone(),
                    source,
                })?;

            let index = Index::parse(&config.name, kind, &data)?;
            debug!(
                index = %index.name,
                backend = %kind,
                entries = index.entries.len(),
                "Index fetched"
            );
            indexes.push(index);
        }

        let cache = Self::from_indexes(indexes);
        info!(
            indexes = cache.indexes.len(),
            entries = cache.entries.len(),
            "Index cache built"
        );
        Ok(cache)
    }

    /// Merge already-parsed indexes, earliest first.
    pub fn from_indexes(indexes: Vec<Index>) -> Self {
        let mut cache = Self::default();

        for index in indexes {
            for entry in index.entries {
                if let Some(existing) = cache.entries.get(&entry.name) {
                    debug!(
                        name = %entry.name,
                        kept = %existing.location(),
                        shadowed = %entry.location(),
                        index = %index.name,
                        "Entry already defined by an earlier index"
                    );
                    continue;
                }
                cache.entries.insert(entry.name.clone(), entry);
            }
            cache.indexes.push(index.name);
        }

        cache
    }

    /// Resolve a name or reference to a fully-qualified reference.
    ///
    /// Inputs containing `/` are treated as fully qualified and returned
    /// unchanged. Bare names (optionally `name:tag` or `name@digest`) are
    /// looked up in the merged view.
    pub fn resolve_reference(&self, name: &str) -> Result<String, IndexError> {
        if name.contains('/') {
            validate_qualified(name)?;
            return Ok(name.to_string());
        }

        let (bare, suffix) = split_bare_name(name)?;
        let entry = self
            .entries
            .get(bare)
            .ok_or_else(|| IndexError::NotFound(bare.to_string()))?;

        let reference = match suffix {
            Suffix::Digest(digest) => format!("{}@{}", entry.location(), digest),
            Suffix::Tag(tag) => format!("{}:{}", entry.location(), tag),
            Suffix::None => format!("{}:{}", entry.location(), DEFAULT_TAG),
        };

        debug!(name = %name, reference = %reference, "Resolved reference");
        Ok(reference)
    }

    /// Signing metadata for a bare-name reference.
    ///
    /// Fully-qualified references never carry index-level metadata.
    pub fn signature_for_index_ref(&self, name: &str) -> Option<&Signature> {
        if name.contains('/') {
            return None;
        }
        let (bare, _) = split_bare_name(name).ok()?;
        self.entries.get(bare)?.signature.as_ref()
    }

    /// Entry for an exact name.
    pub fn get(&self, name: &str) -> Option<&IndexEntry> {
        self.entries.get(name)
    }

    /// All merged entries, sorted by name.
    pub fn entries(&self) -> Vec<&IndexEntry> {
        let mut entries: Vec<&IndexEntry> = self.entries.values().collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    /// Entries matching a keyword, sorted by name.
    pub fn search(&self, keyword: &str) -> Vec<&IndexEntry> {
        self.entries()
            .into_iter()
            .filter(|entry| entry.matches(keyword))
            .collect()
    }

    /// Names of the loaded indexes, in load order.
    pub fn indexes(&self) -> &[String] {
        &self.indexes
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

enum Suffix<'a> {
    None,
    Tag(&'a str),
    Digest(&'a str),
}

fn split_bare_name(name: &str) -> Result<(&str, Suffix<'_>), IndexError> {
    let (bare, suffix) = if let Some((bare, digest)) = name.split_once('@') {
        (bare, Suffix::Digest(digest))
    } else if let Some((bare, tag)) = name.split_once(':') {
        (bare, Suffix::Tag(tag))
    } else {
        (name, Suffix::None)
    };

    let empty_suffix = match suffix {
        Suffix::Tag(s) | Suffix::Digest(s) => s.is_empty(),
        Suffix::None => false,
    };
    if bare.is_empty() || empty_suffix {
        return Err(IndexError::InvalidReference {
            reference: name.to_string(),
            reason: "empty name, tag or digest".to_string(),
        });
    }

    Ok((bare, suffix))
}

fn validate_qualified(reference: &str) -> Result<(), IndexError> {
    let name = reference
        .split_once('@')
        .map(|(name, _)| name)
        .unwrap_or(reference);
    let invalid = |reason: &str| IndexError::InvalidReference {
        reference: reference.to_string(),
        reason: reason.to_string(),
    };

    let (registry, repository) = name
        .split_once('/')
        .ok_or_else(|| invalid("missing repository"))?;
    if registry.is_empty() {
        return Err(invalid("missing registry"));
    }
    if repository.is_empty() || repository.starts_with(':') || repository.ends_with('/') {
        return Err(invalid("missing repository"));
    }
    if reference.ends_with(':') || reference.ends_with('@') {
        return Err(invalid("empty tag or digest"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn entry(name: &str, registry: &str, repository: &str) -> IndexEntry {
        IndexEntry {
            name: name.to_string(),
            artifact_type: "rulesfile".to_string(),
            registry: registry.to_string(),
            repository: repository.to_string(),
            description: None,
            home: None,
            keywords: vec![],
            license: None,
            maintainers: vec![],
            sources: vec![],
            signature: None,
        }
    }

    fn index(name: &str, entries: Vec<IndexEntry>) -> Index {
        Index {
            name: name.to_string(),
            backend: "file".to_string(),
            entries,
        }
    }

    fn sample_cache() -> IndexCache {
        let mut signed = entry("signed", "ghcr.io", "org/signed");
        signed.signature = Some(Signature {
            cosign: Some(Default::default()),
        });
        IndexCache::from_indexes(vec![
            index("first", vec![entry("x", "ghcr.io", "first/x"), signed]),
            index(
                "second",
                vec![
                    entry("x", "quay.io", "second/x"),
                    entry("y", "quay.io", "second/y"),
                ],
            ),
        ])
    }

    #[test]
    fn test_first_match_precedence() {
        let cache = sample_cache();
        assert_eq!(
            cache.resolve_reference("x").unwrap(),
            "ghcr.io/first/x:latest"
        );
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.indexes(), ["first".to_string(), "second".to_string()]);
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let cache = sample_cache();
        let first = cache.resolve_reference("y:1.0").unwrap();
        for _ in 0..10 {
            assert_eq!(cache.resolve_reference("y:1.0").unwrap(), first);
        }
        assert_eq!(first, "quay.io/second/y:1.0");
    }

    #[rstest]
    #[case("x:0.5", "ghcr.io/first/x:0.5")]
    #[case("x@sha256:abc", "ghcr.io/first/x@sha256:abc")]
    #[case("ghcr.io/other/repo:1.0", "ghcr.io/other/repo:1.0")]
    #[case("localhost:5000/plugins/json", "localhost:5000/plugins/json")]
    fn test_resolve_reference(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(sample_cache().resolve_reference(input).unwrap(), expected);
    }

    #[test]
    fn test_unknown_name() {
        let err = sample_cache().resolve_reference("doesnotexist").unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(
            err.to_string(),
            "cannot find `doesnotexist` among the configured indexes"
        );
    }

    #[rstest]
    #[case("")]
    #[case("x:")]
    #[case(":tag")]
    #[case("/repo")]
    #[case("ghcr.io/")]
    #[case("ghcr.io/repo:")]
    fn test_invalid_reference(#[case] input: &str) {
        let err = sample_cache().resolve_reference(input).unwrap_err();
        assert!(matches!(err, IndexError::InvalidReference { .. }), "{input}: {err}");
    }

    #[test]
    fn test_signature_only_for_bare_names() {
        let cache = sample_cache();
        assert!(cache.signature_for_index_ref("signed").is_some());
        assert!(cache.signature_for_index_ref("signed:1.0").is_some());
        assert!(cache.signature_for_index_ref("ghcr.io/org/signed").is_none());
        assert!(cache.signature_for_index_ref("x").is_none());
        assert!(cache.signature_for_index_ref("missing").is_none());
    }

    #[test]
    fn test_entries_sorted_and_search() {
        let cache = sample_cache();
        let names: Vec<&str> = cache.entries().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["signed", "x", "y"]);
        assert_eq!(cache.search("Y").len(), 1);
        assert!(cache.search("nothing").is_empty());
    }

    #[test]
    fn test_backend_kind_inference() {
        let mut config = IndexConfig::new("main", "https://example.com/index.yaml");
        assert_eq!(config.backend_kind(), "https");
        config.backend = "gcs".to_string();
        assert_eq!(config.backend_kind(), "gcs");
    }
}
