use super::{bearer_value, AuthError, RequestAuthenticator};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use url::Url;

const TOKEN_TIMEOUT: Duration = Duration::from_secs(10);
/// Tokens are renewed this long before they expire.
const EXPIRY_MARGIN: Duration = Duration::from_secs(30);
/// Lifetime assumed when the token endpoint does not send `expires_in`.
const DEFAULT_LIFETIME: Duration = Duration::from_secs(3600);

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

struct CachedToken {
    token: SecretString,
    renew_at: Instant,
}

/// OAuth2 client-credentials grant.
///
/// Requests a token from `token_url` with HTTP Basic client authentication and
/// caches it until shortly before it expires. Concurrent requests share one
/// token request.
pub struct OAuth2ClientCredentials {
    client: reqwest::Client,
    token_url: Url,
    client_id: String,
    client_secret: SecretString,
    scope: Option<String>,
    cached: Mutex<Option<CachedToken>>,
}

impl OAuth2ClientCredentials {
    pub fn new(
        client: reqwest::Client,
        token_url: Url,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        scope: Option<String>,
    ) -> Self {
        Self {
            client,
            token_url,
            client_id: client_id.into(),
            client_secret: SecretString::from(client_secret.into()),
            scope,
            cached: Mutex::new(None),
        }
    }

    async fn request_token(&self) -> Result<CachedToken, AuthError> {
        // The serializer is not Send, so it must not live across the await below
        let body = {
            let mut form = url::form_urlencoded::Serializer::new(String::new());
            form.append_pair("grant_type", "client_credentials");
            if let Some(scope) = &self.scope {
                form.append_pair("scope", scope);
            }
            form.finish()
        };

        let request = self
            .client
            .post(self.token_url.as_str())
            .basic_auth(&self.client_id, Some(self.client_secret.expose_secret()))
            .header(
                CONTENT_TYPE,
                HeaderValue::from_static("application/x-www-form-urlencoded"),
            )
            .body(body);

        let response = tokio::time::timeout(TOKEN_TIMEOUT, request.send())
            .await
            .map_err(|_| AuthError::Timeout(TOKEN_TIMEOUT))??;

        if !response.status().is_success() {
            return Err(AuthError::TokenEndpoint(response.status().as_u16()));
        }

        let body = response.bytes().await?;
        let token: TokenResponse = serde_json::from_slice(&body)?;
        let lifetime = token
            .expires_in
            .map_or(DEFAULT_LIFETIME, Duration::from_secs);

        tracing::debug!(
            token_url = %self.token_url,
            expires_in_secs = lifetime.as_secs(),
            "Obtained OAuth2 access token"
        );

        Ok(CachedToken {
            token: SecretString::from(token.access_token),
            renew_at: renew_at(Instant::now(), lifetime),
        })
    }
}

/// When a token obtained at `now` with `lifetime` should be renewed.
///
/// Lifetimes too large to represent fall back to [`DEFAULT_LIFETIME`].
fn renew_at(now: Instant, lifetime: Duration) -> Instant {
    now.checked_add(lifetime.saturating_sub(EXPIRY_MARGIN))
        .unwrap_or(now + DEFAULT_LIFETIME.saturating_sub(EXPIRY_MARGIN))
}

impl fmt::Debug for OAuth2ClientCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuth2ClientCredentials")
            .field("token_url", &self.token_url.as_str())
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("scope", &self.scope)
            .finish()
    }
}

#[async_trait]
impl RequestAuthenticator for OAuth2ClientCredentials {
    async fn authenticate(&self, headers: &mut HeaderMap) -> Result<(), AuthError> {
        let mut cached = self.cached.lock().await;

        let valid = cached
            .as_ref()
            .filter(|token| Instant::now() < token.renew_at);
        let value = match valid {
            Some(token) => bearer_value(token.token.expose_secret())?,
            None => {
                let fresh = self.request_token().await?;
                let value = bearer_value(fresh.token.expose_secret())?;
                *cached = Some(fresh);
                value
            }
        };

        headers.insert(AUTHORIZATION, value);
        Ok(())
    }
}
