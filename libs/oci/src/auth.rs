//! Registry credentials and authentication challenges.

use std::collections::HashMap;
use std::fmt;

use base64::Engine;
use serde::Deserialize;

use crate::error::OciError;

/// Basic credentials for one registry host.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

impl Credential {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Value for an `Authorization: Basic` header.
    pub fn basic_header(&self) -> String {
        let encoded = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", self.username, self.password));
        format!("Basic {encoded}")
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Source of registry credentials. Storage is owned by the caller.
pub trait CredentialStore: Send + Sync {
    /// Credentials for `registry`, if any are known.
    fn get(&self, registry: &str) -> Option<Credential>;
}

/// Anonymous access only.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCredentials;

impl CredentialStore for NoCredentials {
    fn get(&self, _registry: &str) -> Option<Credential> {
        None
    }
}

/// In-memory credentials keyed by registry host.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    by_registry: HashMap<String, Credential>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, registry: impl Into<String>, credential: Credential) {
        self.by_registry.insert(registry.into(), credential);
    }

    /// Parse `host=user:password` pairs separated by `;`.
    pub fn parse(s: &str) -> Result<Self, OciError> {
        let mut store = Self::new();
        for pair in s.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (host, secret) = pair.split_once('=').ok_or_else(|| {
                OciError::AuthRequired(format!("malformed credential entry `{}`", redact(pair)))
            })?;
            let (user, password) = secret.split_once(':').ok_or_else(|| {
                OciError::AuthRequired(format!("malformed credentials for {host}"))
            })?;
            store.insert(host.trim(), Credential::new(user, password));
        }
        Ok(store)
    }
}

impl CredentialStore for StaticCredentials {
    fn get(&self, registry: &str) -> Option<Credential> {
        self.by_registry.get(registry).cloned()
    }
}

fn redact(entry: &str) -> &str {
    entry.split(['=', ':']).next().unwrap_or_default()
}

/// A parsed `WWW-Authenticate` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    Basic,
    Bearer {
        realm: String,
        service: Option<String>,
        scope: Option<String>,
    },
}

impl Challenge {
    pub fn parse(header: &str) -> Option<Self> {
        let (scheme, params) = header.trim().split_once(' ').unwrap_or((header.trim(), ""));
        match scheme.to_ascii_lowercase().as_str() {
            "basic" => Some(Self::Basic),
            "bearer" => {
                let params = parse_params(params);
                Some(Self::Bearer {
                    realm: params.get("realm")?.clone(),
                    service: params.get("service").cloned(),
                    scope: params.get("scope").cloned(),
                })
            }
            _ => None,
        }
    }
}

// Splits `key="value",key2="a,b"` honoring quotes.
fn parse_params(s: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut rest = s.trim();
    while !rest.is_empty() {
        let Some((key, after)) = rest.split_once('=') else {
            break;
        };
        let key = key.trim().trim_start_matches(',').trim().to_ascii_lowercase();
        let (value, remaining) = if let Some(quoted) = after.strip_prefix('"') {
            match quoted.find('"') {
                Some(end) => (&quoted[..end], &quoted[end + 1..]),
                None => (quoted, ""),
            }
        } else {
            match after.find(',') {
                Some(end) => (&after[..end], &after[end..]),
                None => (after, ""),
            }
        };
        params.insert(key, value.to_string());
        rest = remaining.trim_start_matches([',', ' ']);
    }
    params
}

/// Token endpoint response.
#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

impl TokenResponse {
    pub(crate) fn into_token(self) -> Option<String> {
        self.token.or(self.access_token).filter(|t| !t.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bearer_challenge() {
        let challenge = Challenge::parse(
            r#"Bearer realm="https://auth.example.io/token",service="registry.example.io",scope="repository:org/rules:pull,push""#,
        )
        .unwrap();
        assert_eq!(
            challenge,
            Challenge::Bearer {
                realm: "https://auth.example.io/token".to_string(),
                service: Some("registry.example.io".to_string()),
                scope: Some("repository:org/rules:pull,push".to_string()),
            }
        );
    }

    #[test]
    fn test_parse_basic_and_unknown_challenge() {
        assert_eq!(Challenge::parse(r#"Basic realm="x""#), Some(Challenge::Basic));
        assert_eq!(Challenge::parse("Negotiate abc"), None);
        // realm is mandatory for bearer
        assert_eq!(Challenge::parse(r#"Bearer service="x""#), None);
    }

    #[test]
    fn test_static_credentials_parse() {
        let store = StaticCredentials::parse("ghcr.io=bot:s3cr:et; localhost:5000=a:b").unwrap();
        let ghcr = store.get("ghcr.io").unwrap();
        assert_eq!(ghcr.username, "bot");
        assert_eq!(ghcr.password, "s3cr:et");
        assert_eq!(store.get("localhost:5000").unwrap().username, "a");
        assert!(store.get("docker.io").is_none());
        assert!(StaticCredentials::parse("ghcr.io").is_err());
    }

    #[test]
    fn test_credential_debug_is_redacted() {
        let debug = format!("{:?}", Credential::new("user", "hunter2"));
        assert!(!debug.contains("hunter2"));
        assert_eq!(Credential::new("u", "p").basic_header(), "Basic dTpw");
    }
}
