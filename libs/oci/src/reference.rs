//! Fully-qualified artifact references.
//!
//! A reference has the shape `registry/repository[:tag][@digest]`. Bare names
//! are resolved through the index cache before they reach this layer, so a
//! registry component is always required.

use std::fmt;
use std::str::FromStr;

use crate::error::OciError;

/// Tag assumed when a reference has neither tag nor digest.
pub const DEFAULT_TAG: &str = "latest";

/// A parsed `registry/repository[:tag][@digest]` reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    registry: String,
    repository: String,
    tag: Option<String>,
    digest: Option<String>,
}

impl Reference {
    /// Parse a fully-qualified reference.
    pub fn parse(reference: &str) -> Result<Self, OciError> {
        let (name, digest) = match reference.split_once('@') {
            Some((name, digest)) => {
                validate_digest(reference, digest)?;
                (name, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        // A ':' after the last '/' separates the tag; earlier ones are ports.
        let last_slash = name.rfind('/');
        let (name, tag) = match name.rfind(':') {
            Some(colon) if last_slash.is_none_or(|slash| colon > slash) => {
                (&name[..colon], Some(name[colon + 1..].to_string()))
            }
            _ => (name, None),
        };

        let (registry, repository) = name
            .split_once('/')
            .ok_or_else(|| OciError::invalid_reference(reference, "missing registry"))?;

        if registry.is_empty() {
            return Err(OciError::invalid_reference(reference, "empty registry"));
        }
        validate_repository(reference, repository)?;
        if let Some(tag) = &tag {
            validate_tag(reference, tag)?;
        }

        Ok(Self {
            registry: registry.to_string(),
            repository: repository.to_string(),
            tag,
            digest,
        })
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// The manifest reference used on the wire: digest, else tag, else `latest`.
    pub fn target(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or(DEFAULT_TAG)
    }

    /// Same repository, pinned to `digest`.
    pub fn with_digest(&self, digest: &str) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: None,
            digest: Some(digest.to_string()),
        }
    }

    /// Same repository, pointing at `tag`.
    pub fn with_tag(&self, tag: &str) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: Some(tag.to_string()),
            digest: None,
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

impl FromStr for Reference {
    type Err = OciError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn validate_repository(reference: &str, repository: &str) -> Result<(), OciError> {
    if repository.is_empty() {
        return Err(OciError::invalid_reference(reference, "empty repository"));
    }
    let valid_chars = repository.chars().all(|c| {
        c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-' | '/')
    });
    let valid_components = repository.split('/').all(|component| !component.is_empty());
    if !valid_chars || !valid_components {
        return Err(OciError::invalid_reference(
            reference,
            format!("invalid repository `{repository}`"),
        ));
    }
    Ok(())
}

fn validate_tag(reference: &str, tag: &str) -> Result<(), OciError> {
    let valid = !tag.is_empty()
        && tag.len() <= 128
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if !valid {
        return Err(OciError::invalid_reference(
            reference,
            format!("invalid tag `{tag}`"),
        ));
    }
    Ok(())
}

fn validate_digest(reference: &str, digest: &str) -> Result<(), OciError> {
    let valid = digest
        .split_once(':')
        .is_some_and(|(algorithm, encoded)| {
            !algorithm.is_empty()
                && !encoded.is_empty()
                && encoded.chars().all(|c| c.is_ascii_hexdigit())
        });
    if !valid {
        return Err(OciError::invalid_reference(
            reference,
            format!("invalid digest `{digest}`"),
        ));
    }
    Ok(())
}
