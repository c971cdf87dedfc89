//! Per-system registry of feed updaters, built from the discovery document.
//!
//! A registry is set up exactly once: the discovery file is fetched, expanded
//! into descriptors and turned into one [`FeedUpdater`] per recognized feed.
//! After that the set of feeds is frozen and only their contents change.
//!
//! Refreshes never queue. A [`GbfsRegistry::refresh`] call that finds another
//! refresh running returns `false` immediately.

use crate::auth::{header_map, NoAuthentication};
use crate::feed::{
    Discovery, DiscoveryError, FeedName, FeedPayload, FeedSchema, FeedUpdater, GbfsVersion,
    RequestContext,
};
use crate::options::SubscriptionOptions;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::OnceCell;
use url::Url;

/// Errors setting up a registry.
///
/// Everything except [`RegistryError::DiscoveryUnavailable`] is a
/// configuration problem that retrying will not fix.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The discovery file could not be fetched or decoded
    #[error("Could not load discovery file from {url}: {reason}")]
    DiscoveryUnavailable { url: String, reason: String },
    #[error("Language '{language}' does not exist in discovery file {url}")]
    LanguageNotFound { language: String, url: String },
    #[error("Discovery file {url} lists no languages")]
    NoLanguages { url: String },
    #[error("Discovery file contains duplicate url for feed {feed}. Urls: {first}, {second}")]
    DuplicateFeed {
        feed: FeedName,
        first: String,
        second: String,
    },
    #[error("Invalid URL for feed {feed}: {url}")]
    InvalidFeedUrl { feed: FeedName, url: String },
    #[error("Invalid request header: {0}")]
    InvalidHeader(String),
}

impl RegistryError {
    /// Whether this error is caused by configuration rather than availability.
    pub fn is_configuration(&self) -> bool {
        !matches!(self, RegistryError::DiscoveryUnavailable { .. })
    }

    fn from_discovery(error: DiscoveryError, url: &Url) -> Self {
        match error {
            DiscoveryError::LanguageNotFound(language) => RegistryError::LanguageNotFound {
                language,
                url: url.to_string(),
            },
            DiscoveryError::NoLanguages => RegistryError::NoLanguages {
                url: url.to_string(),
            },
            DiscoveryError::InvalidFeedUrl { feed, url } => {
                RegistryError::InvalidFeedUrl { feed, url }
            }
        }
    }
}

type Updaters = BTreeMap<FeedName, FeedUpdater<FeedPayload>>;

/// Releases the refresh flag when dropped, including on unwind or when the
/// refresh future is cancelled.
struct RefreshGuard<'a>(&'a AtomicBool);

impl<'a> RefreshGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| RefreshGuard(flag))
    }
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// All feeds of one GBFS system.
#[derive(Debug)]
pub struct GbfsRegistry {
    version: GbfsVersion,
    language_code: Option<String>,
    context: RequestContext,
    discovery: FeedUpdater<Discovery>,
    setup: OnceCell<Result<Updaters, RegistryError>>,
    refreshing: AtomicBool,
}

impl GbfsRegistry {
    /// Registry using a client of its own.
    pub fn new(version: GbfsVersion, options: &SubscriptionOptions) -> Result<Self, RegistryError> {
        Self::with_client(version, options, reqwest::Client::new())
    }

    /// Registry sharing `client` with others.
    ///
    /// Nothing is fetched until [`init`](Self::init).
    pub fn with_client(
        version: GbfsVersion,
        options: &SubscriptionOptions,
        client: reqwest::Client,
    ) -> Result<Self, RegistryError> {
        let headers = header_map(&options.headers)
            .map_err(|e| RegistryError::InvalidHeader(e.to_string()))?;

        let context = RequestContext {
            client,
            headers,
            authenticator: options
                .authenticator
                .clone()
                .unwrap_or_else(|| Arc::new(NoAuthentication)),
            timeout: options.timeout,
            minimum_ttl: options.minimum_ttl,
        };

        Ok(Self {
            version,
            language_code: options.language_code.clone(),
            discovery: FeedUpdater::new(options.discovery_url.clone(), version, context.clone()),
            context,
            setup: OnceCell::new(),
            refreshing: AtomicBool::new(false),
        })
    }

    /// Fetch the discovery file and create the feed updaters.
    ///
    /// Runs at most once; later calls return the first outcome without any
    /// I/O. A failed setup is permanent for this registry.
    pub async fn init(&self) -> Result<(), RegistryError> {
        self.setup
            .get_or_init(|| self.build())
            .await
            .as_ref()
            .map(|_| ())
            .map_err(Clone::clone)
    }

    async fn build(&self) -> Result<Updaters, RegistryError> {
        let url = self.discovery_url();

        let discovery = if self.discovery.update().await {
            self.discovery.payload()
        } else {
            None
        };
        let Some(discovery) = discovery else {
            let reason = self
                .discovery
                .last_error()
                .map_or_else(|| "no data".to_string(), |e| e.to_string());
            tracing::warn!(url = %url, error = %reason, "Could not fetch the discovery file");
            return Err(RegistryError::DiscoveryUnavailable {
                url: url.to_string(),
                reason,
            });
        };

        let descriptors = discovery
            .descriptors(self.language_code.as_deref(), url)
            .map_err(|e| RegistryError::from_discovery(e, url))?;

        let mut updaters = Updaters::new();
        for descriptor in descriptors {
            if let Some(existing) = updaters.get(&descriptor.name) {
                return Err(RegistryError::DuplicateFeed {
                    feed: descriptor.name,
                    first: existing.url().to_string(),
                    second: descriptor.url.to_string(),
                });
            }
            let schema = FeedSchema {
                version: self.version,
                name: descriptor.name,
            };
            updaters.insert(
                descriptor.name,
                FeedUpdater::new(descriptor.url, schema, self.context.clone()),
            );
        }

        tracing::info!(
            url = %url,
            version = %self.version,
            feeds = updaters.len(),
            "Registry setup complete"
        );
        Ok(updaters)
    }

    pub fn setup_complete(&self) -> bool {
        matches!(self.setup.get(), Some(Ok(_)))
    }

    fn updaters(&self) -> Option<&Updaters> {
        self.setup.get().and_then(|setup| setup.as_ref().ok())
    }

    /// Refresh every feed that is due, one after another.
    ///
    /// Returns `true` if at least one feed was refreshed successfully. Returns
    /// `false` without doing anything if setup is incomplete or another
    /// refresh of this registry is running.
    pub async fn refresh(&self) -> bool {
        let Some(updaters) = self.updaters() else {
            tracing::debug!(url = %self.discovery_url(), "Registry not set up, skipping refresh");
            return false;
        };
        let Some(_guard) = RefreshGuard::try_acquire(&self.refreshing) else {
            tracing::debug!(url = %self.discovery_url(), "Refresh already in progress, skipping");
            return false;
        };

        let mut updated = false;
        for updater in updaters.values() {
            updated |= updater.update().await;
        }
        updated
    }

    /// Latest payload of `name`; `None` if the system does not publish it or
    /// it has never been fetched successfully.
    pub fn feed(&self, name: FeedName) -> Option<Arc<FeedPayload>> {
        self.updaters()?.get(&name)?.payload()
    }

    pub fn raw_feed(&self, name: FeedName) -> Option<Bytes> {
        self.updaters()?.get(&name)?.raw()
    }

    /// Raw bytes of every feed that has data, keyed by name.
    pub fn raw_feeds(&self) -> BTreeMap<FeedName, Bytes> {
        self.updaters()
            .map(|updaters| {
                updaters
                    .iter()
                    .filter_map(|(name, updater)| updater.raw().map(|raw| (*name, raw)))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn discovery(&self) -> Option<Arc<Discovery>> {
        self.discovery.payload()
    }

    pub fn raw_discovery(&self) -> Option<Bytes> {
        self.discovery.raw()
    }

    /// Updater behind `name`, for diagnostics.
    pub fn updater(&self, name: FeedName) -> Option<&FeedUpdater<FeedPayload>> {
        self.updaters()?.get(&name)
    }

    /// Feeds this system publishes. Empty until setup completes.
    pub fn feed_names(&self) -> Vec<FeedName> {
        self.updaters()
            .map(|updaters| updaters.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn version(&self) -> GbfsVersion {
        self.version
    }

    pub fn discovery_url(&self) -> &Url {
        self.discovery.url()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::strategy::now_secs;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn options(server: &MockServer) -> SubscriptionOptions {
        SubscriptionOptions::new(Url::parse(&format!("{}/gbfs.json", server.uri())).unwrap())
    }

    async fn mount_v3_discovery(server: &MockServer) {
        let body = format!(
            r#"{{"last_updated": "2024-01-01T00:00:00Z", "ttl": 0, "version": "3.0", "data": {{"feeds": [
                {{"name": "system_information", "url": "{0}/system_information.json"}},
                {{"name": "station_status", "url": "{0}/station_status.json"}}
            ]}}}}"#,
            server.uri()
        );
        Mock::given(method("GET"))
            .and(path("/gbfs.json"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(server)
            .await;
    }

    fn v3_body(key: &str, ttl: i64) -> String {
        format!(
            r#"{{"last_updated": {}, "ttl": {}, "version": "3.0", "data": {{"{}": []}}}}"#,
            now_secs(),
            ttl,
            key
        )
    }

    #[tokio::test]
    async fn test_refresh_before_setup_is_noop() {
        let mock_server = MockServer::start().await;
        let registry = GbfsRegistry::new(GbfsVersion::V3, &options(&mock_server)).unwrap();
        assert!(!registry.setup_complete());
        assert!(!registry.refresh().await);
        assert!(registry.feed_names().is_empty());
        assert!(mock_server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_refresh_is_skipped() {
        let mock_server = MockServer::start().await;
        mount_v3_discovery(&mock_server).await;
        Mock::given(method("GET"))
            .and(path("/system_information.json"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(
                        r#"{"last_updated": 1, "ttl": 0, "version": "3.0", "data": {"system_id": "x"}}"#,
                    )
                    .set_delay(Duration::from_millis(200)),
            )
            .expect(1)
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/station_status.json"))
            .respond_with(ResponseTemplate::new(200).set_body_string(v3_body("stations", 600)))
            .expect(1)
            .mount(&mock_server)
            .await;

        let registry = GbfsRegistry::new(GbfsVersion::V3, &options(&mock_server)).unwrap();
        registry.init().await.unwrap();

        let (first, second) = tokio::join!(registry.refresh(), registry.refresh());
        assert!(first);
        assert!(!second);

        // Guard is released afterwards
        assert!(registry.refresh_flag_released());
    }

    #[tokio::test]
    async fn test_guard_released_when_refresh_cancelled() {
        let mock_server = MockServer::start().await;
        mount_v3_discovery(&mock_server).await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(v3_body("stations", 0))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&mock_server)
            .await;

        let registry = GbfsRegistry::new(GbfsVersion::V3, &options(&mock_server)).unwrap();
        registry.init().await.unwrap();

        let cancelled =
            tokio::time::timeout(Duration::from_millis(50), registry.refresh()).await;
        assert!(cancelled.is_err());
        assert!(registry.refresh_flag_released());
    }

    #[test]
    fn test_invalid_header_is_configuration_error() {
        let options = SubscriptionOptions::new(Url::parse("https://example.com/gbfs.json").unwrap())
            .with_header("bad header", "x");
        let err = GbfsRegistry::new(GbfsVersion::V2, &options).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidHeader(_)));
        assert!(err.is_configuration());
    }

    impl GbfsRegistry {
        fn refresh_flag_released(&self) -> bool {
            !self.refreshing.load(Ordering::Acquire)
        }
    }
}
