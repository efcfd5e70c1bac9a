//! Origin check for stream upgrades
//!
//! Browsers send an `Origin` header on WebSocket handshakes. Same-origin
//! requests and non-browser clients (no header) are always accepted;
//! cross-origin ones must match one of the configured patterns.

use regex::{Regex, RegexBuilder};
use url::Url;

#[derive(Debug, Clone, Default)]
pub struct OriginPolicy {
    allowed: Vec<Regex>,
}

impl OriginPolicy {
    /// Compile the allowed-origin patterns (matched case-insensitively).
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, regex::Error> {
        let allowed = patterns
            .iter()
            .map(|pattern| {
                RegexBuilder::new(pattern.as_ref())
                    .case_insensitive(true)
                    .build()
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { allowed })
    }

    /// Whether an upgrade with this `Origin` and `Host` may proceed
    #[must_use]
    pub fn is_allowed(&self, origin: Option<&str>, host: Option<&str>) -> bool {
        let Some(origin) = origin else {
            return true;
        };

        if let Some(host) = host {
            if same_host(origin, host) {
                return true;
            }
        }

        self.allowed.iter().any(|pattern| pattern.is_match(origin))
    }
}

fn same_host(origin: &str, host: &str) -> bool {
    let Ok(url) = Url::parse(origin) else {
        return false;
    };
    let Some(origin_host) = url.host_str() else {
        return false;
    };
    let authority = match url.port() {
        Some(port) => format!("{origin_host}:{port}"),
        None => origin_host.to_string(),
    };
    authority.eq_ignore_ascii_case(host)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_origin_is_allowed() {
        let policy = OriginPolicy::default();
        assert!(policy.is_allowed(None, Some("push.example.com")));
        assert!(policy.is_allowed(None, None));
    }

    #[test]
    fn test_same_host_is_allowed() {
        let policy = OriginPolicy::default();
        assert!(policy.is_allowed(Some("https://push.example.com"), Some("push.example.com")));
        assert!(policy.is_allowed(Some("http://LOCALHOST:8080"), Some("localhost:8080")));
        assert!(!policy.is_allowed(Some("http://localhost:9000"), Some("localhost:8080")));
    }

    #[test]
    fn test_cross_origin_needs_a_matching_pattern() {
        let policy = OriginPolicy::new(&["^https://.*\\.example\\.com$"]).unwrap();
        assert!(policy.is_allowed(Some("https://app.EXAMPLE.com"), Some("push.internal")));
        assert!(!policy.is_allowed(Some("https://evil.com"), Some("push.internal")));
        assert!(!OriginPolicy::default().is_allowed(Some("https://evil.com"), Some("push.internal")));
    }

    #[test]
    fn test_unparseable_origin_falls_back_to_patterns() {
        let policy = OriginPolicy::new(&["^null$"]).unwrap();
        assert!(policy.is_allowed(Some("null"), Some("push.internal")));
        assert!(!OriginPolicy::default().is_allowed(Some("null"), Some("push.internal")));
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        assert!(OriginPolicy::new(&["(["]).is_err());
    }
}
