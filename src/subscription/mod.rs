//! Subscriptions to GBFS systems.
//!
//! A [`Subscription`] couples one [`GbfsRegistry`] with the subscriber's
//! callback. The [`SubscriptionManager`] owns many of them, fans refreshes out
//! over a Tokio runtime and tears subscriptions down without racing in-flight
//! refreshes.
//!
//! # Example
//!
//! ```ignore
//! let manager = SubscriptionManager::new();
//! let id = manager
//!     .subscribe_v3(options, |delivery| {
//!         println!("{} stations", delivery.station_status().map_or(0, |s| s.records("stations").map_or(0, <[_]>::len)));
//!     })
//!     .await?;
//!
//! manager.update();
//! manager.unsubscribe_async(&id).await?;
//! ```

mod delivery;
mod manager;
mod refresh;

pub use delivery::Delivery;
pub use manager::{
    SubscribeError, SubscriptionId, SubscriptionManager, UnsubscribeError,
    DEFAULT_UNSUBSCRIBE_TIMEOUT,
};
pub use refresh::{RefreshHandle, RefreshPanicked};

use crate::feed::GbfsVersion;
use crate::options::SubscriptionOptions;
use crate::registry::{GbfsRegistry, RegistryError};
use crate::validation::{FeedValidator, StructuralValidator};
use futures::FutureExt;
use refresh::{RefreshTicket, RefreshTracker};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Receives every delivery. Runs on Tokio's blocking pool, so it may block.
///
/// Successive calls may land on different threads, and never on the thread
/// that called `update`; thread-local state does not carry over between them.
pub type DeliveryCallback = Arc<dyn Fn(Delivery) + Send + Sync>;

/// Hooks around every subscription update.
///
/// `after_update` runs even when the update fails or the callback panics.
pub trait UpdateInterceptor: Send + Sync {
    fn before_update(&self);
    fn after_update(&self);
}

/// One subscribed system.
pub struct Subscription {
    options: SubscriptionOptions,
    registry: GbfsRegistry,
    callback: DeliveryCallback,
    interceptor: Option<Arc<dyn UpdateInterceptor>>,
    update_lock: tokio::sync::Mutex<()>,
    tracker: RefreshTracker,
}

impl Subscription {
    pub fn new(
        version: GbfsVersion,
        options: SubscriptionOptions,
        callback: DeliveryCallback,
        interceptor: Option<Arc<dyn UpdateInterceptor>>,
        client: reqwest::Client,
    ) -> Result<Self, RegistryError> {
        let registry = GbfsRegistry::with_client(version, &options, client)?;
        Ok(Self {
            options,
            registry,
            callback,
            interceptor,
            update_lock: tokio::sync::Mutex::new(()),
            tracker: RefreshTracker::new(),
        })
    }

    /// Set up the registry. See [`GbfsRegistry::init`].
    pub async fn init(&self) -> Result<(), RegistryError> {
        self.registry.init().await
    }

    pub fn setup_complete(&self) -> bool {
        self.registry.setup_complete()
    }

    pub fn registry(&self) -> &GbfsRegistry {
        &self.registry
    }

    /// Refresh the registry and deliver a snapshot if anything changed.
    ///
    /// If an update of this subscription is already running the call returns
    /// without doing anything.
    pub async fn update(&self) {
        let ticket = self.tracker.begin();
        self.run_update(&ticket).await;
    }

    /// Handle on the refreshes currently in flight.
    pub fn current_refresh(&self) -> RefreshHandle {
        self.tracker.current()
    }

    pub(crate) fn tracker(&self) -> &RefreshTracker {
        &self.tracker
    }

    /// Body of [`update`](Self::update). A contained panic is recorded on `ticket`.
    pub(crate) async fn run_update(&self, ticket: &RefreshTicket) {
        let Ok(_lock) = self.update_lock.try_lock() else {
            tracing::debug!(url = %self.registry.discovery_url(), "Update already running, skipping");
            return;
        };

        if let Some(interceptor) = &self.interceptor {
            interceptor.before_update();
        }

        let refreshed = AssertUnwindSafe(self.registry.refresh())
            .catch_unwind()
            .await;
        match refreshed {
            Ok(true) => {
                if !self.deliver().await {
                    ticket.mark_panicked();
                }
            }
            Ok(false) => {}
            Err(_) => {
                tracing::error!(url = %self.registry.discovery_url(), "Registry refresh panicked");
                ticket.mark_panicked();
            }
        }

        if let Some(interceptor) = &self.interceptor {
            interceptor.after_update();
        }
    }

    /// Returns `false` if the callback (or validator) panicked.
    async fn deliver(&self) -> bool {
        let Some(discovery) = self.registry.discovery() else {
            return true;
        };
        let version = self.registry.version();
        let feeds = self
            .registry
            .feed_names()
            .into_iter()
            .filter_map(|name| self.registry.feed(name).map(|payload| (name, payload)))
            .collect();
        let validation = self.options.enable_validation.then(|| {
            let validator: Arc<dyn FeedValidator> = self
                .options
                .validator
                .clone()
                .unwrap_or_else(|| Arc::new(StructuralValidator::new(version)));
            (validator, self.registry.raw_feeds())
        });
        let callback = Arc::clone(&self.callback);

        let delivered = tokio::task::spawn_blocking(move || {
            let validation_result = validation.map(|(validator, raw)| validator.validate(&raw));
            if let Some(result) = &validation_result {
                if !result.is_valid() {
                    tracing::warn!(errors = result.summary.errors_count, "Feeds failed validation");
                }
            }
            callback(Delivery::new(version, discovery, feeds, validation_result));
        })
        .await;

        match delivered {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(
                    url = %self.registry.discovery_url(),
                    error = %e,
                    "Delivery callback failed"
                );
                false
            }
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("registry", &self.registry)
            .field("in_flight", &self.tracker.in_flight())
            .finish()
    }
}
