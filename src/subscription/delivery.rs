use crate::feed::{Discovery, FeedName, FeedPayload, GbfsVersion};
use crate::validation::ValidationResult;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Consistent snapshot of one system, handed to the subscriber.
///
/// Built fresh after every refresh that changed something and never mutated
/// afterwards. Cloning is cheap.
#[derive(Debug, Clone)]
pub struct Delivery {
    version: GbfsVersion,
    discovery: Arc<Discovery>,
    feeds: BTreeMap<FeedName, Arc<FeedPayload>>,
    validation_result: Option<Arc<ValidationResult>>,
}

impl Delivery {
    pub(crate) fn new(
        version: GbfsVersion,
        discovery: Arc<Discovery>,
        feeds: BTreeMap<FeedName, Arc<FeedPayload>>,
        validation_result: Option<ValidationResult>,
    ) -> Self {
        Self {
            version,
            discovery,
            feeds,
            validation_result: validation_result.map(Arc::new),
        }
    }

    pub fn version(&self) -> GbfsVersion {
        self.version
    }

    pub fn discovery(&self) -> &Discovery {
        &self.discovery
    }

    /// Payload of `name`, if the system publishes it and it has been fetched.
    pub fn feed(&self, name: FeedName) -> Option<&FeedPayload> {
        self.feeds.get(&name).map(Arc::as_ref)
    }

    /// One slot per feed the protocol version knows, in table order.
    pub fn slots(&self) -> impl Iterator<Item = (FeedName, Option<&FeedPayload>)> + '_ {
        self.version
            .feeds()
            .iter()
            .filter(|name| **name != FeedName::Gbfs)
            .map(|name| (*name, self.feed(*name)))
    }

    pub fn feeds(&self) -> &BTreeMap<FeedName, Arc<FeedPayload>> {
        &self.feeds
    }

    pub fn system_information(&self) -> Option<&FeedPayload> {
        self.feed(FeedName::SystemInformation)
    }

    pub fn station_information(&self) -> Option<&FeedPayload> {
        self.feed(FeedName::StationInformation)
    }

    pub fn station_status(&self) -> Option<&FeedPayload> {
        self.feed(FeedName::StationStatus)
    }

    /// `free_bike_status` for v2, `vehicle_status` for v3.
    pub fn vehicle_status(&self) -> Option<&FeedPayload> {
        match self.version {
            GbfsVersion::V2 => self.feed(FeedName::FreeBikeStatus),
            GbfsVersion::V3 => self.feed(FeedName::VehicleStatus),
        }
    }

    /// Present only when validation is enabled for the subscription.
    pub fn validation_result(&self) -> Option<&ValidationResult> {
        self.validation_result.as_deref()
    }
}
