//! Token authentication.
//!
//! Tokens are `base64(user) + "." + base64(secret)`. The hub resolves a
//! token to a user identity through the `Authenticator` trait; the bundled
//! implementation checks against a static user table loaded from a JSON
//! file (`{"user": "secret", ...}`).

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::collections::HashMap;
use std::path::Path;

use crate::error::{HubError, Result};

/// Resolves an opaque token string to a user identity.
///
/// `Ok(None)` means the token was well-formed but rejected; `Err` means
/// the token was malformed. Both reject the handshake.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, token: &str) -> Result<Option<String>>;
}

/// Authenticator backed by a static user/secret table.
#[derive(Debug, Clone, Default)]
pub struct StaticAuthenticator {
    users: HashMap<String, String>,
}

impl StaticAuthenticator {
    pub fn new(users: HashMap<String, String>) -> Self {
        Self { users }
    }

    /// Load the user table from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            HubError::Config(format!("users file {}: {}", path.as_ref().display(), e))
        })?;
        let users: HashMap<String, String> = serde_json::from_str(&raw)?;
        Ok(Self::new(users))
    }

    /// Issue a token for a known user. Operator tooling and tests only;
    /// the hub itself never generates tokens.
    pub fn generate_token(&self, user: &str) -> Result<String> {
        let secret = self
            .users
            .get(user)
            .ok_or_else(|| HubError::Auth(format!("user does not exist: {user}")))?;
        Ok(format!(
            "{}.{}",
            STANDARD.encode(user),
            STANDARD.encode(secret)
        ))
    }
}

impl Authenticator for StaticAuthenticator {
    fn authenticate(&self, token: &str) -> Result<Option<String>> {
        let chunks: Vec<&str> = token.split('.').collect();
        if chunks.len() != 2 {
            return Err(HubError::Auth("token must have two segments".to_string()));
        }

        let mut decoded = Vec::with_capacity(2);
        for chunk in chunks {
            let bytes = STANDARD
                .decode(chunk)
                .map_err(|e| HubError::Auth(format!("invalid token encoding: {e}")))?;
            let text = String::from_utf8(bytes)
                .map_err(|_| HubError::Auth("token segment is not UTF-8".to_string()))?;
            decoded.push(text);
        }

        let (user, secret) = (&decoded[0], &decoded[1]);
        Ok(self
            .users
            .get(user)
            .filter(|known| *known == secret)
            .map(|_| user.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> StaticAuthenticator {
        let mut users = HashMap::new();
        users.insert("grafana".to_string(), "s3cret".to_string());
        StaticAuthenticator::new(users)
    }

    #[test]
    fn test_token_round_trip() {
        let auth = table();
        let token = auth.generate_token("grafana").unwrap();
        assert_eq!(auth.authenticate(&token).unwrap(), Some("grafana".to_string()));
    }

    #[test]
    fn test_wrong_secret_is_rejected() {
        let auth = table();
        let token = format!("{}.{}", STANDARD.encode("grafana"), STANDARD.encode("nope"));
        assert_eq!(auth.authenticate(&token).unwrap(), None);
    }

    #[test]
    fn test_unknown_user_is_rejected() {
        let auth = table();
        let token = format!("{}.{}", STANDARD.encode("ghost"), STANDARD.encode("s3cret"));
        assert_eq!(auth.authenticate(&token).unwrap(), None);
    }

    #[test]
    fn test_malformed_token_is_an_error() {
        let auth = table();
        assert!(auth.authenticate("one-segment").is_err());
        assert!(auth.authenticate("a.b.c").is_err());
        assert!(auth.authenticate("!!!.???").is_err());
    }

    #[test]
    fn test_generate_token_for_unknown_user_fails() {
        assert!(table().generate_token("ghost").is_err());
    }
}
