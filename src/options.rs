//! Options describing one subscribed system.

use crate::auth::RequestAuthenticator;
use crate::feed::DEFAULT_TIMEOUT;
use crate::validation::FeedValidator;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// How to reach and refresh one GBFS system.
///
/// Only the discovery URL is required:
///
/// ```ignore
/// let options = SubscriptionOptions::new(url)
///     .with_language("en")
///     .with_timeout(Duration::from_secs(2))
///     .with_validation(true);
/// ```
#[derive(Debug, Clone)]
pub struct SubscriptionOptions {
    pub discovery_url: Url,
    /// Language group to use from a v2 discovery file; the first group when unset.
    /// Ignored for v3.
    pub language_code: Option<String>,
    /// Floor in seconds applied to every server-supplied ttl
    pub minimum_ttl: i64,
    /// Sent with every request, before authentication
    pub headers: HashMap<String, String>,
    pub authenticator: Option<Arc<dyn RequestAuthenticator>>,
    pub timeout: Duration,
    pub enable_validation: bool,
    /// Validator used when validation is enabled; structural checks when unset
    pub validator: Option<Arc<dyn FeedValidator>>,
}

impl SubscriptionOptions {
    pub fn new(discovery_url: Url) -> Self {
        Self {
            discovery_url,
            language_code: None,
            minimum_ttl: 0,
            headers: HashMap::new(),
            authenticator: None,
            timeout: DEFAULT_TIMEOUT,
            enable_validation: false,
            validator: None,
        }
    }

    pub fn with_language(mut self, code: impl Into<String>) -> Self {
        self.language_code = Some(code.into());
        self
    }

    pub fn with_minimum_ttl(mut self, seconds: i64) -> Self {
        self.minimum_ttl = seconds;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn RequestAuthenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_validation(mut self, enabled: bool) -> Self {
        self.enable_validation = enabled;
        self
    }

    /// Use a custom validator. Also enables validation.
    pub fn with_validator(mut self, validator: Arc<dyn FeedValidator>) -> Self {
        self.validator = Some(validator);
        self.enable_validation = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::BearerTokenAuthenticator;

    #[test]
    fn test_defaults() {
        let options = SubscriptionOptions::new(Url::parse("https://example.com/gbfs.json").unwrap());
        assert_eq!(options.timeout, Duration::from_millis(5000));
        assert_eq!(options.minimum_ttl, 0);
        assert!(options.language_code.is_none());
        assert!(options.authenticator.is_none());
        assert!(!options.enable_validation);
    }

    #[test]
    fn test_builders() {
        let options = SubscriptionOptions::new(Url::parse("https://example.com/gbfs.json").unwrap())
            .with_language("nb")
            .with_minimum_ttl(30)
            .with_header("Client-Identifier", "acme")
            .with_authenticator(Arc::new(BearerTokenAuthenticator::new("t")))
            .with_timeout(Duration::from_secs(1))
            .with_validation(true);

        assert_eq!(options.language_code.as_deref(), Some("nb"));
        assert_eq!(options.minimum_ttl, 30);
        assert_eq!(options.headers["Client-Identifier"], "acme");
        assert!(options.authenticator.is_some());
        assert_eq!(options.timeout, Duration::from_secs(1));
        assert!(options.enable_validation);

        // Debug must not leak the token
        assert!(format!("{:?}", options).contains("[REDACTED]"));
    }
}
