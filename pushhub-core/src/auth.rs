//! Authentication seam
//!
//! The push core never validates credentials itself. It asks an
//! [`Authenticator`] to resolve a presented client token into a [`Principal`]
//! and keeps the token on the connection so a single device can be evicted
//! later.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::config::AuthConfig;
use crate::models::{ClientToken, UserId};
use crate::{Error, Result};

/// Identity resolved by the auth chain for one stream connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: UserId,
    pub token: ClientToken,
}

/// Resolves a presented client token into a [`Principal`]
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, token: &str) -> Result<Principal>;
}

/// In-memory token table.
///
/// Used when no external client store is wired in; entries are seeded from
/// the `auth.clients` config section and can be revoked at runtime.
#[derive(Debug, Default)]
pub struct StaticTokenAuthenticator {
    tokens: DashMap<String, UserId>,
}

impl StaticTokenAuthenticator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_config(config: &AuthConfig) -> Self {
        let authenticator = Self::new();
        for client in &config.clients {
            authenticator.insert(client.token.clone(), UserId::new(client.user_id));
        }
        authenticator
    }

    pub fn insert(&self, token: impl Into<String>, user_id: UserId) {
        self.tokens.insert(token.into(), user_id);
    }

    /// Forget a token; returns the user it belonged to.
    pub fn revoke(&self, token: &str) -> Option<UserId> {
        self.tokens.remove(token).map(|(_, user_id)| user_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<Principal> {
        if token.is_empty() {
            return Err(Error::Authentication("Empty client token".to_string()));
        }

        let user_id = self
            .tokens
            .get(token)
            .map(|entry| *entry.value())
            .ok_or_else(|| Error::Authentication("Unknown client token".to_string()))?;

        Ok(Principal {
            user_id,
            token: ClientToken::from(token),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientCredential;

    #[tokio::test]
    async fn test_authenticate_known_token() {
        let auth = StaticTokenAuthenticator::new();
        auth.insert("tok-1", UserId::new(7));

        let principal = auth.authenticate("tok-1").await.unwrap();
        assert_eq!(principal.user_id, UserId::new(7));
        assert_eq!(principal.token.as_str(), "tok-1");
    }

    #[tokio::test]
    async fn test_authenticate_rejects_unknown_and_revoked() {
        let auth = StaticTokenAuthenticator::from_config(&AuthConfig {
            clients: vec![ClientCredential {
                token: "tok-1".to_string(),
                user_id: 1,
            }],
        });
        assert_eq!(auth.len(), 1);

        assert!(matches!(
            auth.authenticate("nope").await,
            Err(Error::Authentication(_))
        ));
        assert!(auth.authenticate("").await.is_err());

        assert_eq!(auth.revoke("tok-1"), Some(UserId::new(1)));
        assert!(auth.authenticate("tok-1").await.is_err());
        assert!(auth.is_empty());
    }
}
