use serde::{Deserialize, Serialize};

/// User ID type (numeric identity resolved by the auth chain)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl UserId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for UserId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Per-connection credential token.
///
/// Opaque to the push core: it is only compared for equality when a single
/// device's credential is revoked.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientToken(pub String);

impl ClientToken {
    #[must_use]
    pub const fn from_string(token: String) -> Self {
        Self(token)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Tokens are credentials; keep them out of debug output.
impl std::fmt::Debug for ClientToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ClientToken(***)")
    }
}

impl From<String> for ClientToken {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ClientToken {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_id_serializes_as_integer() {
        let json = serde_json::to_string(&UserId::new(7)).unwrap();
        assert_eq!(json, "7");

        let parsed: UserId = serde_json::from_str("42").unwrap();
        assert_eq!(parsed, UserId(42));
    }

    #[test]
    fn test_client_token_debug_is_redacted() {
        let token = ClientToken::from("secret-token");
        assert_eq!(format!("{token:?}"), "ClientToken(***)");
        assert_eq!(token.as_str(), "secret-token");
    }
}
