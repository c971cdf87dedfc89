//! Everything needed to keep a single GBFS file fresh.
//!
//! - **Naming**: the closed set of feeds each protocol version publishes
//! - **Decoding**: the shared envelope and the refresh metadata it carries
//! - **Discovery**: expanding `gbfs.json` into one descriptor per feed
//! - **Fetching**: HTTP and `file:` transport with size limits and timeouts
//! - **Scheduling**: TTL-driven refresh with exponential failure backoff
//!
//! # Architecture
//!
//! - [`strategy`] - when a feed is due, pure and clock-injectable
//! - [`fetcher`] - raw bytes from a URL
//! - [`updater`] - fetch, decode, extract metadata and reschedule, per feed
//!
//! # Example
//!
//! ```ignore
//! use gbfs_loader::feed::{FeedPayload, FeedSchema, FeedUpdater, RequestContext};
//!
//! let updater: FeedUpdater<FeedPayload> = FeedUpdater::new(url, schema, context);
//! if updater.update().await {
//!     let stations = updater.payload().and_then(|p| p.records("stations").map(<[_]>::len));
//! }
//! ```

mod discovery;
mod fetcher;
mod model;
mod name;
pub mod strategy;
mod updater;

pub use discovery::{Discovery, DiscoveryError, FeedDescriptor};
pub use fetcher::{fetch_bytes, FetchError};
pub use model::{
    DecodeError, Envelope, FeedPayload, FeedSchema, MetadataError, Payload, RefreshMetadata,
};
pub use name::{FeedName, GbfsVersion, UnknownFeedName};
pub use strategy::{backoff_secs, UpdateStrategy, MAX_BACKOFF_SECS};
pub use updater::{FeedUpdater, RequestContext, UpdateError, DEFAULT_TIMEOUT};

pub(crate) use model::json_type;
