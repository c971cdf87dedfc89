//! Fetch, decode and reschedule a single feed.

use crate::auth::{NoAuthentication, RequestAuthenticator};
use crate::feed::fetcher::{fetch_bytes, FetchError};
use crate::feed::model::{DecodeError, MetadataError, Payload};
use crate::feed::strategy::UpdateStrategy;
use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::header::HeaderMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Timeout used when none is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Why a single refresh attempt failed. Every variant is recoverable.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("Decode failed: {0}")]
    Decode(#[from] DecodeError),
    #[error("Refresh metadata unusable: {0}")]
    Metadata(#[from] MetadataError),
}

/// Everything needed to issue requests against one system.
///
/// Shared by the discovery updater and every feed updater of a registry.
#[derive(Clone)]
pub struct RequestContext {
    pub client: reqwest::Client,
    pub headers: HeaderMap,
    pub authenticator: Arc<dyn RequestAuthenticator>,
    pub timeout: Duration,
    pub minimum_ttl: i64,
}

impl RequestContext {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            headers: HeaderMap::new(),
            authenticator: Arc::new(NoAuthentication),
            timeout: DEFAULT_TIMEOUT,
            minimum_ttl: 0,
        }
    }

    /// Configured headers plus whatever the authenticator adds.
    ///
    /// Authentication failures are logged and the configured headers are
    /// returned unchanged.
    async fn authenticated_headers(&self, url: &Url) -> HeaderMap {
        let mut headers = self.headers.clone();
        if let Err(e) = self.authenticator.authenticate(&mut headers).await {
            tracing::warn!(url = %url, error = %e, "Authentication failed, sending request without credentials");
            headers = self.headers.clone();
        }
        headers
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .field("authenticator", &self.authenticator)
            .field("timeout", &self.timeout)
            .field("minimum_ttl", &self.minimum_ttl)
            .finish()
    }
}

struct UpdaterState<T> {
    strategy: UpdateStrategy,
    raw: Option<Bytes>,
    payload: Option<Arc<T>>,
    last_error: Option<Arc<UpdateError>>,
}

/// Keeps one feed's payload fresh.
///
/// The lock only guards state transitions; it is never held across a fetch.
/// Callers are expected to serialize `update` calls (the registry does).
pub struct FeedUpdater<T: Payload> {
    url: Url,
    schema: T::Schema,
    context: RequestContext,
    state: Mutex<UpdaterState<T>>,
}

impl<T: Payload> FeedUpdater<T> {
    pub fn new(url: Url, schema: T::Schema, context: RequestContext) -> Self {
        let strategy = UpdateStrategy::with_minimum_ttl(context.minimum_ttl);
        Self {
            url,
            schema,
            context,
            state: Mutex::new(UpdaterState {
                strategy,
                raw: None,
                payload: None,
                last_error: None,
            }),
        }
    }

    /// Refresh the feed if it is due.
    ///
    /// Returns `true` only if a fetch happened and the response decoded and
    /// yielded usable refresh metadata. On failure the previous payload is kept
    /// and the next attempt is pushed back.
    pub async fn update(&self) -> bool {
        if !self.should_update() {
            tracing::trace!(url = %self.url, "Feed not due");
            return false;
        }

        match self.fetch_and_decode().await {
            Ok((raw, payload, last_updated, ttl)) => {
                let mut state = self.state.lock();
                state.raw = Some(raw);
                state.payload = Some(Arc::new(payload));
                state.last_error = None;
                state.strategy.schedule_next_update(last_updated, ttl);
                tracing::debug!(
                    url = %self.url,
                    next_update = state.strategy.next_update(),
                    "Feed refreshed"
                );
                true
            }
            Err(e) => {
                let mut state = self.state.lock();
                let next_update = state.strategy.reschedule_after_failure();
                tracing::warn!(
                    url = %self.url,
                    error = %e,
                    failures = state.strategy.consecutive_failures(),
                    next_update,
                    "Feed refresh failed"
                );
                state.last_error = Some(Arc::new(e));
                false
            }
        }
    }

    async fn fetch_and_decode(
        &self,
    ) -> Result<(Bytes, T, Option<i64>, Option<i64>), UpdateError> {
        let headers = self.context.authenticated_headers(&self.url).await;
        let raw = fetch_bytes(&self.context.client, &self.url, headers, self.context.timeout).await?;
        let payload = T::decode(self.schema, &raw)?;
        let metadata = payload.refresh_metadata()?;
        Ok((raw, payload, metadata.last_updated, metadata.ttl))
    }

    pub fn should_update(&self) -> bool {
        self.state.lock().strategy.should_update()
    }

    /// Latest successfully decoded payload.
    pub fn payload(&self) -> Option<Arc<T>> {
        self.state.lock().payload.clone()
    }

    /// Bytes behind [`payload`](Self::payload).
    pub fn raw(&self) -> Option<Bytes> {
        self.state.lock().raw.clone()
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.lock().strategy.consecutive_failures()
    }

    pub fn next_update(&self) -> i64 {
        self.state.lock().strategy.next_update()
    }

    /// Error from the most recent attempt, cleared by the next success.
    pub fn last_error(&self) -> Option<Arc<UpdateError>> {
        self.state.lock().last_error.clone()
    }
}

impl<T: Payload> fmt::Debug for FeedUpdater<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedUpdater")
            .field("url", &self.url.as_str())
            .field("schema", &self.schema)
            .field("next_update", &self.next_update())
            .finish()
    }
}
