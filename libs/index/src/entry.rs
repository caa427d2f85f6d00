//! Index entries and the on-disk index format.
//!
//! An index is a YAML list of entries:
//!
//! ```yaml
//! - name: k8saudit-rules
//!   type: rulesfile
//!   registry: ghcr.io
//!   repository: example/rules/k8saudit
//!   keywords: [audit, kubernetes]
//!   signature:
//!     cosign:
//!       key: <base64 ed25519 public key>
//! ```

use serde::{Deserialize, Serialize};

use crate::error::IndexError;

/// One artifact known to an index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Artifact name, unique within the merged view.
    pub name: String,

    /// Artifact type as declared by the index (rulesfile, plugin, asset).
    #[serde(rename = "type", default)]
    pub artifact_type: String,

    /// Registry host, e.g. `ghcr.io`.
    pub registry: String,

    /// Repository path inside the registry.
    pub repository: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub maintainers: Vec<Maintainer>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,

    /// Signing metadata used to verify pulled content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<Signature>,
}

impl IndexEntry {
    /// `registry/repository` without tag.
    pub fn location(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// Whether the entry matches a search keyword (case-insensitive).
    pub fn matches(&self, keyword: &str) -> bool {
        let keyword = keyword.to_lowercase();
        self.name.to_lowercase().contains(&keyword)
            || self
                .keywords
                .iter()
                .any(|k| k.to_lowercase().contains(&keyword))
            || self
                .description
                .as_deref()
                .is_some_and(|d| d.to_lowercase().contains(&keyword))
    }
}

/// Artifact maintainer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Maintainer {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Signing metadata attached to an index entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cosign: Option<CosignSignature>,
}

/// Cosign verification parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CosignSignature {
    /// Base64 encoded public key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// Expected certificate identity for keyless signatures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_identity: Option<String>,

    /// Expected OIDC issuer for keyless signatures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_oidc_issuer: Option<String>,
}

/// A parsed index: its configured name plus its entries in file order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Index {
    pub name: String,
    pub backend: String,
    pub entries: Vec<IndexEntry>,
}

impl Index {
    /// Parse raw index bytes.
    pub fn parse(name: &str, backend: &str, data: &[u8]) -> Result<Self, IndexError> {
        let entries: Vec<IndexEntry> =
            serde_yaml::from_slice(data).map_err(|source| IndexError::Malformed {
                name: name.to_string(),
                source,
            })?;

        Ok(Self {
            name: name.to_string(),
            backend: backend.to_string(),
            entries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
- name: k8saudit-rules
  type: rulesfile
  registry: ghcr.io
  repository: example/rules/k8saudit
  description: Rules for Kubernetes audit events
  keywords: [audit, kubernetes]
  maintainers:
    - name: The Maintainers
      email: maintainers@example.com
  signature:
    cosign:
      key: dGVzdA==
- name: json
  type: plugin
  registry: ghcr.io
  repository: example/plugins/json
"#;

    #[test]
    fn test_parse_index() {
        let index = Index::parse("main", "http", SAMPLE.as_bytes()).unwrap();
        assert_eq!(index.entries.len(), 2);

        let rules = &index.entries[0];
        assert_eq!(rules.artifact_type, "rulesfile");
        assert_eq!(rules.location(), "ghcr.io/example/rules/k8saudit");
        assert_eq!(
            rules.signature.as_ref().unwrap().cosign.as_ref().unwrap().key,
            Some("dGVzdA==".to_string())
        );
        assert!(index.entries[1].signature.is_none());
    }

    #[test]
    fn test_parse_malformed_index() {
        let err = Index::parse("broken", "file", b"name: [unclosed").unwrap_err();
        assert!(matches!(err, IndexError::Malformed { .. }));
    }

    #[test]
    fn test_entry_matches_keyword() {
        let index = Index::parse("main", "http", SAMPLE.as_bytes()).unwrap();
        let rules = &index.entries[0];

        assert!(rules.matches("AUDIT"));
        assert!(rules.matches("kubernetes"));
        assert!(rules.matches("audit events"));
        assert!(!rules.matches("cloudtrail"));
    }
}
