//! Client-side refresh engine for GBFS bikeshare feeds.
//!
//! Keeps an in-memory mirror of every file a GBFS system publishes, refreshing
//! each file when its `ttl` expires and backing off exponentially when a fetch
//! fails. Any number of systems can be followed concurrently through a
//! [`SubscriptionManager`]; subscribers receive an immutable [`Delivery`]
//! whenever something changed.
//!
//! # Layers
//!
//! - [`feed`] - scheduling, transport and decoding for single files
//! - [`registry`] - all feeds of one system, built from its discovery file
//! - [`subscription`] - callbacks, fan-out and teardown across many systems
//! - [`auth`] - credentials added to outgoing requests
//! - [`validation`] - optional checks over the raw files

pub mod auth;
pub mod feed;
pub mod options;
pub mod registry;
pub mod subscription;
pub mod validation;

pub use feed::{FeedName, FeedPayload, GbfsVersion};
pub use options::SubscriptionOptions;
pub use registry::{GbfsRegistry, RegistryError};
pub use subscription::{
    Delivery, RefreshPanicked, SubscribeError, Subscription, SubscriptionId,
    SubscriptionManager, UnsubscribeError, UpdateInterceptor, DEFAULT_UNSUBSCRIBE_TIMEOUT,
};
