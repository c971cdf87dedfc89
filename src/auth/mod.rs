//! Request authentication strategies.
//!
//! A [`RequestAuthenticator`] is handed a copy of the configured headers right
//! before every request and may add credentials to it. Failures are never
//! fatal: the caller logs them and sends the request without credentials.
//!
//! Provided strategies:
//!
//! - [`NoAuthentication`] - used when nothing else is configured
//! - [`BearerTokenAuthenticator`] - static `Authorization: Bearer` token
//! - [`HeadersAuthenticator`] - arbitrary static headers (API keys etc.)
//! - [`OAuth2ClientCredentials`] - OAuth2 client-credentials grant with token caching

mod oauth2;

pub use oauth2::OAuth2ClientCredentials;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    /// Header name or value contains characters not allowed in HTTP headers
    #[error("Invalid header: {0}")]
    InvalidHeader(String),
    /// Token endpoint could not be reached
    #[error("Token request failed: {0}")]
    TokenRequest(#[from] reqwest::Error),
    /// Token endpoint answered with a non-2xx status
    #[error("Token endpoint returned status {0}")]
    TokenEndpoint(u16),
    /// Token endpoint answered with something that is not a token response
    #[error("Invalid token response: {0}")]
    TokenResponse(#[from] serde_json::Error),
    #[error("Token request timed out after {0:?}")]
    Timeout(Duration),
}

/// Adds credentials to outgoing request headers.
#[async_trait]
pub trait RequestAuthenticator: Send + Sync + fmt::Debug {
    async fn authenticate(&self, headers: &mut HeaderMap) -> Result<(), AuthError>;
}

/// Sends requests as they are.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAuthentication;

#[async_trait]
impl RequestAuthenticator for NoAuthentication {
    async fn authenticate(&self, _headers: &mut HeaderMap) -> Result<(), AuthError> {
        Ok(())
    }
}

/// Adds `Authorization: Bearer <token>` to every request.
pub struct BearerTokenAuthenticator {
    token: SecretString,
}

impl BearerTokenAuthenticator {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: SecretString::from(token.into()),
        }
    }
}

impl fmt::Debug for BearerTokenAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BearerTokenAuthenticator")
            .field("token", &"[REDACTED]")
            .finish()
    }
}

#[async_trait]
impl RequestAuthenticator for BearerTokenAuthenticator {
    async fn authenticate(&self, headers: &mut HeaderMap) -> Result<(), AuthError> {
        headers.insert(AUTHORIZATION, bearer_value(self.token.expose_secret())?);
        Ok(())
    }
}

/// Adds a fixed set of headers to every request, replacing existing values.
pub struct HeadersAuthenticator {
    headers: HeaderMap,
}

impl HeadersAuthenticator {
    /// Fails if any name or value is not a valid HTTP header.
    pub fn new(headers: &HashMap<String, String>) -> Result<Self, AuthError> {
        Ok(Self {
            headers: header_map(headers)?,
        })
    }
}

impl fmt::Debug for HeadersAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Header values are credentials; only show the names
        f.debug_struct("HeadersAuthenticator")
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[async_trait]
impl RequestAuthenticator for HeadersAuthenticator {
    async fn authenticate(&self, headers: &mut HeaderMap) -> Result<(), AuthError> {
        for (name, value) in &self.headers {
            headers.insert(name.clone(), value.clone());
        }
        Ok(())
    }
}

/// Builds a `HeaderMap` from plain string pairs.
pub fn header_map(headers: &HashMap<String, String>) -> Result<HeaderMap, AuthError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| AuthError::InvalidHeader(name.clone()))?;
        let value =
            HeaderValue::from_str(value).map_err(|_| AuthError::InvalidHeader(name.to_string()))?;
        map.insert(name, value);
    }
    Ok(map)
}

pub(crate) fn bearer_value(token: &str) -> Result<HeaderValue, AuthError> {
    let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
        .map_err(|_| AuthError::InvalidHeader(AUTHORIZATION.to_string()))?;
    value.set_sensitive(true);
    Ok(value)
}
