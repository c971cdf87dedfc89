use super::{Delivery, DeliveryCallback, RefreshPanicked, Subscription, UpdateInterceptor};
use crate::feed::GbfsVersion;
use crate::options::SubscriptionOptions;
use crate::registry::RegistryError;
use dashmap::DashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::{Handle, RuntimeFlavor};
use uuid::Uuid;

/// How long unsubscribe waits for an in-flight refresh unless told otherwise.
pub const DEFAULT_UNSUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(30);

static USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Opaque subscription identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscribeError {
    /// The discovery file could not be loaded at subscribe time
    #[error("System unreachable: {0}")]
    Unreachable(RegistryError),
    /// The system is reachable but cannot be used as configured
    #[error("Invalid subscription: {0}")]
    Configuration(RegistryError),
}

impl From<RegistryError> for SubscribeError {
    fn from(error: RegistryError) -> Self {
        if error.is_configuration() {
            SubscribeError::Configuration(error)
        } else {
            SubscribeError::Unreachable(error)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnsubscribeError {
    /// A refresh was still running when the timeout expired, usually a stuck callback
    #[error("Timed out after {0:?} waiting for in-flight refresh")]
    Timeout(Duration),
    /// Blocking unsubscribe called outside any Tokio runtime and the manager has none
    #[error("No Tokio runtime available to wait on")]
    NoRuntime,
    /// Blocking unsubscribe called from a current-thread runtime, which would deadlock
    #[error("Blocking unsubscribe is not supported on a current-thread runtime")]
    CurrentThreadRuntime,
    /// The subscription was removed, but a refresh it was waiting on panicked
    #[error(transparent)]
    RefreshPanicked(#[from] RefreshPanicked),
}

/// Owns subscriptions and dispatches their refreshes.
///
/// Refreshes run on the ambient Tokio runtime unless a runtime handle is
/// supplied with [`with_runtime`](Self::with_runtime). All subscriptions share
/// one HTTP client.
pub struct SubscriptionManager {
    subscriptions: DashMap<SubscriptionId, Arc<Subscription>>,
    runtime: Option<Handle>,
    client: reqwest::Client,
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionManager {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Failed to build HTTP client, using defaults");
                reqwest::Client::new()
            });
        Self::with_client(client)
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            subscriptions: DashMap::new(),
            runtime: None,
            client,
        }
    }

    /// Dispatch refreshes onto `runtime` instead of the ambient one.
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Subscribe to a GBFS v2.x system. v1.x systems are accepted too.
    pub async fn subscribe_v2<F>(
        &self,
        options: SubscriptionOptions,
        callback: F,
    ) -> Result<SubscriptionId, SubscribeError>
    where
        F: Fn(Delivery) + Send + Sync + 'static,
    {
        self.subscribe_with_interceptor(GbfsVersion::V2, options, callback, None)
            .await
    }

    /// Subscribe to a GBFS v3.x system.
    pub async fn subscribe_v3<F>(
        &self,
        options: SubscriptionOptions,
        callback: F,
    ) -> Result<SubscriptionId, SubscribeError>
    where
        F: Fn(Delivery) + Send + Sync + 'static,
    {
        self.subscribe_with_interceptor(GbfsVersion::V3, options, callback, None)
            .await
    }

    /// Subscribe with hooks around every update.
    ///
    /// The subscription is registered only if its discovery file loads and
    /// expands cleanly.
    pub async fn subscribe_with_interceptor<F>(
        &self,
        version: GbfsVersion,
        options: SubscriptionOptions,
        callback: F,
        interceptor: Option<Arc<dyn UpdateInterceptor>>,
    ) -> Result<SubscriptionId, SubscribeError>
    where
        F: Fn(Delivery) + Send + Sync + 'static,
    {
        let callback: DeliveryCallback = Arc::new(callback);
        let subscription =
            Subscription::new(version, options, callback, interceptor, self.client.clone())?;

        if let Err(e) = subscription.init().await {
            tracing::warn!(
                url = %subscription.registry().discovery_url(),
                error = %e,
                "Subscription setup failed"
            );
            return Err(e.into());
        }

        let id = SubscriptionId::generate();
        tracing::info!(
            subscription = %id,
            url = %subscription.registry().discovery_url(),
            version = %version,
            "Subscribed"
        );
        self.subscriptions.insert(id.clone(), Arc::new(subscription));
        Ok(id)
    }

    /// Dispatch one refresh per subscription. Returns immediately.
    pub fn update(&self) {
        let Some(runtime) = self.runtime() else {
            return;
        };
        for entry in self.subscriptions.iter() {
            Self::dispatch(&runtime, entry.key(), entry.value());
        }
    }

    /// Dispatch a refresh for one subscription. Returns `false` if `id` is unknown.
    pub fn update_one(&self, id: &SubscriptionId) -> bool {
        let Some(runtime) = self.runtime() else {
            return false;
        };
        match self.subscriptions.get(id) {
            Some(entry) => {
                Self::dispatch(&runtime, entry.key(), entry.value());
                true
            }
            None => false,
        }
    }

    fn runtime(&self) -> Option<Handle> {
        match &self.runtime {
            Some(handle) => Some(handle.clone()),
            None => match Handle::try_current() {
                Ok(handle) => Some(handle),
                Err(_) => {
                    tracing::error!("No Tokio runtime available, cannot dispatch refreshes");
                    None
                }
            },
        }
    }

    // Called while the map entry is borrowed, so the ticket is taken before
    // any concurrent unsubscribe can remove the entry.
    fn dispatch(runtime: &Handle, id: &SubscriptionId, subscription: &Arc<Subscription>) {
        let ticket = subscription.tracker().begin();
        let subscription = Arc::clone(subscription);
        tracing::trace!(subscription = %id, "Dispatching refresh");
        runtime.spawn(async move {
            subscription.run_update(&ticket).await;
        });
    }

    /// Remove a subscription, waiting up to [`DEFAULT_UNSUBSCRIBE_TIMEOUT`]
    /// for its in-flight refresh.
    pub fn unsubscribe_async(
        &self,
        id: &SubscriptionId,
    ) -> impl Future<Output = Result<(), UnsubscribeError>> + Send + 'static {
        self.unsubscribe_async_with_timeout(id, DEFAULT_UNSUBSCRIBE_TIMEOUT)
    }

    /// Remove a subscription and wait for its in-flight refresh.
    ///
    /// The subscription is removed before this returns, so no new refresh can
    /// be dispatched for it. The returned future resolves once every refresh
    /// already dispatched has finished, or fails with
    /// [`UnsubscribeError::Timeout`]. If one of those refreshes panicked the
    /// subscription is still removed and the future fails with
    /// [`UnsubscribeError::RefreshPanicked`]. Unknown ids resolve immediately.
    pub fn unsubscribe_async_with_timeout(
        &self,
        id: &SubscriptionId,
        timeout: Duration,
    ) -> impl Future<Output = Result<(), UnsubscribeError>> + Send + 'static {
        let in_flight = self
            .subscriptions
            .remove(id)
            .map(|(_, subscription)| subscription.current_refresh());
        if in_flight.is_some() {
            tracing::info!(subscription = %id, "Unsubscribed");
        }

        async move {
            let Some(in_flight) = in_flight else {
                return Ok(());
            };
            match tokio::time::timeout(timeout, in_flight.wait()).await {
                Ok(finished) => finished.map_err(UnsubscribeError::from),
                Err(_) => Err(UnsubscribeError::Timeout(timeout)),
            }
        }
    }

    /// Blocking unsubscribe.
    ///
    /// Inside a multi-thread runtime this blocks the current worker in place.
    #[deprecated(note = "use `unsubscribe_async` instead")]
    pub fn unsubscribe(&self, id: &SubscriptionId) -> Result<(), UnsubscribeError> {
        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::CurrentThread => {
                Err(UnsubscribeError::CurrentThreadRuntime)
            }
            Ok(handle) => {
                let wait = self.unsubscribe_async(id);
                tokio::task::block_in_place(|| handle.block_on(wait))
            }
            Err(_) => match &self.runtime {
                Some(handle) => handle.block_on(self.unsubscribe_async(id)),
                None => Err(UnsubscribeError::NoRuntime),
            },
        }
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    pub fn contains(&self, id: &SubscriptionId) -> bool {
        self.subscriptions.contains_key(id)
    }

    /// Ids of all live subscriptions.
    pub fn ids(&self) -> Vec<SubscriptionId> {
        self.subscriptions.iter().map(|e| e.key().clone()).collect()
    }

    pub fn subscription(&self, id: &SubscriptionId) -> Option<Arc<Subscription>> {
        self.subscriptions.get(id).map(|e| Arc::clone(e.value()))
    }
}

impl fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("subscriptions", &self.subscriptions.len())
            .field("custom_runtime", &self.runtime.is_some())
            .finish()
    }
}
