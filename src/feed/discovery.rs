//! The discovery document (`gbfs.json`) and its expansion into feed descriptors.

use crate::feed::model::{DecodeError, Envelope, MetadataError, Payload, RefreshMetadata};
use crate::feed::name::{FeedName, GbfsVersion};
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use url::Url;

/// One concrete file published by a system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedDescriptor {
    pub name: FeedName,
    pub url: Url,
}

/// Errors expanding a discovery document into descriptors.
///
/// These are configuration problems: retrying the same document cannot fix them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiscoveryError {
    /// The requested language code has no feed group in the discovery document
    #[error("Language '{0}' does not exist in discovery document")]
    LanguageNotFound(String),
    /// A v2 discovery document without any language group
    #[error("Discovery document lists no languages")]
    NoLanguages,
    /// A recognized feed's URL could not be parsed
    #[error("Invalid URL for feed {feed}: {url}")]
    InvalidFeedUrl { feed: FeedName, url: String },
}

#[derive(Debug, Clone, Deserialize)]
struct RawFeed {
    name: String,
    url: String,
}

#[derive(Debug, Clone, Deserialize)]
struct RawFeedList {
    feeds: Vec<RawFeed>,
}

#[derive(Debug, Clone)]
enum Listing {
    /// v2: feed lists keyed by language code, in document order
    ByLanguage(Vec<(String, Vec<RawFeed>)>),
    /// v3: a single list
    Flat(Vec<RawFeed>),
}

/// Decoded discovery document.
#[derive(Debug, Clone)]
pub struct Discovery {
    version: GbfsVersion,
    envelope: Envelope<Map<String, Value>>,
    listing: Listing,
}

impl Discovery {
    pub fn version(&self) -> GbfsVersion {
        self.version
    }

    pub fn envelope(&self) -> &Envelope<Map<String, Value>> {
        &self.envelope
    }

    /// Language codes offered by a v2 document; empty for v3.
    pub fn languages(&self) -> Vec<&str> {
        match &self.listing {
            Listing::ByLanguage(groups) => groups.iter().map(|(lang, _)| lang.as_str()).collect(),
            Listing::Flat(_) => Vec::new(),
        }
    }

    /// Expand into one descriptor per recognized feed.
    ///
    /// For v2, `language` selects the group; without it the first group is used.
    /// `language` is ignored for v3. Unrecognized feed names are skipped.
    /// Relative feed URLs are resolved against `base`.
    pub fn descriptors(
        &self,
        language: Option<&str>,
        base: &Url,
    ) -> Result<Vec<FeedDescriptor>, DiscoveryError> {
        let feeds = match &self.listing {
            Listing::Flat(feeds) => feeds,
            Listing::ByLanguage(groups) => match language {
                Some(code) => groups
                    .iter()
                    .find(|(lang, _)| lang == code)
                    .map(|(_, feeds)| feeds)
                    .ok_or_else(|| DiscoveryError::LanguageNotFound(code.to_owned()))?,
                None => groups
                    .first()
                    .map(|(_, feeds)| feeds)
                    .ok_or(DiscoveryError::NoLanguages)?,
            },
        };

        let mut descriptors = Vec::with_capacity(feeds.len());
        for raw in feeds {
            let Some(name) = FeedName::for_version(self.version, &raw.name) else {
                tracing::debug!(feed = %raw.name, version = %self.version, "Skipping unrecognized feed");
                continue;
            };
            let url = base
                .join(raw.url.trim())
                .map_err(|_| DiscoveryError::InvalidFeedUrl {
                    feed: name,
                    url: raw.url.clone(),
                })?;
            descriptors.push(FeedDescriptor { name, url });
        }
        Ok(descriptors)
    }
}

impl Payload for Discovery {
    type Schema = GbfsVersion;

    fn decode(version: GbfsVersion, bytes: &[u8]) -> Result<Self, DecodeError> {
        let envelope: Envelope<Map<String, Value>> = serde_json::from_slice(bytes)?;

        let listing = match version {
            GbfsVersion::V3 => {
                let feeds = envelope.data.get("feeds").ok_or(DecodeError::MissingData {
                    feed: FeedName::Gbfs,
                    key: "feeds",
                })?;
                Listing::Flat(serde_json::from_value(feeds.clone())?)
            }
            GbfsVersion::V2 => {
                let mut groups = Vec::with_capacity(envelope.data.len());
                for (language, group) in &envelope.data {
                    let list: RawFeedList = serde_json::from_value(group.clone()).map_err(|e| {
                        DecodeError::Invalid {
                            feed: FeedName::Gbfs,
                            reason: format!("language '{language}': {e}"),
                        }
                    })?;
                    groups.push((language.clone(), list.feeds));
                }
                Listing::ByLanguage(groups)
            }
        };

        Ok(Self {
            version,
            envelope,
            listing,
        })
    }

    fn refresh_metadata(&self) -> Result<RefreshMetadata, MetadataError> {
        self.envelope.refresh_metadata()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const V2_DISCOVERY: &str = r#"{
        "last_updated": 1700000000,
        "ttl": 0,
        "version": "2.3",
        "data": {
            "nb": {"feeds": [
                {"name": "system_information", "url": "https://example.com/nb/system_information.json"},
                {"name": "station_status", "url": "https://example.com/nb/station_status.json"}
            ]},
            "en": {"feeds": [
                {"name": "system_information", "url": "https://example.com/en/system_information.json"},
                {"name": "vehicle_status", "url": "https://example.com/en/vehicle_status.json"}
            ]}
        }
    }"#;

    const V3_DISCOVERY: &str = r#"{
        "last_updated": "2023-11-14T22:13:20+00:00",
        "ttl": 0,
        "version": "3.0",
        "data": {"feeds": [
            {"name": "system_information", "url": "https://example.com/system_information.json"},
            {"name": "vehicle_status", "url": "vehicle_status.json"},
            {"name": "free_bike_status", "url": "https://example.com/free_bike_status.json"},
            {"name": "some_vendor_extension", "url": "https://example.com/ext.json"}
        ]}
    }"#;

    fn base() -> Url {
        Url::parse("https://example.com/gbfs.json").unwrap()
    }

    fn names(descriptors: &[FeedDescriptor]) -> Vec<FeedName> {
        descriptors.iter().map(|d| d.name).collect()
    }

    #[test]
    fn test_v2_selects_requested_language() {
        let discovery = Discovery::decode(GbfsVersion::V2, V2_DISCOVERY.as_bytes()).unwrap();
        assert_eq!(discovery.languages(), vec!["nb", "en"]);

        let descriptors = discovery.descriptors(Some("en"), &base()).unwrap();
        // vehicle_status is a v3 feed and is not recognized in a v2 document
        assert_eq!(names(&descriptors), vec![FeedName::SystemInformation]);
        assert_eq!(
            descriptors[0].url.as_str(),
            "https://example.com/en/system_information.json"
        );
    }

    #[test]
    fn test_v2_defaults_to_first_language() {
        let discovery = Discovery::decode(GbfsVersion::V2, V2_DISCOVERY.as_bytes()).unwrap();
        let descriptors = discovery.descriptors(None, &base()).unwrap();
        assert_eq!(
            names(&descriptors),
            vec![FeedName::SystemInformation, FeedName::StationStatus]
        );
        assert!(descriptors[0].url.as_str().contains("/nb/"));
    }

    #[test]
    fn test_v2_missing_language_is_error() {
        let discovery = Discovery::decode(GbfsVersion::V2, V2_DISCOVERY.as_bytes()).unwrap();
        assert_eq!(
            discovery.descriptors(Some("fr"), &base()),
            Err(DiscoveryError::LanguageNotFound("fr".to_owned()))
        );
    }

    #[test]
    fn test_v2_without_languages() {
        let raw = br#"{"last_updated": 1, "ttl": 0, "data": {}}"#;
        let discovery = Discovery::decode(GbfsVersion::V2, raw).unwrap();
        assert_eq!(
            discovery.descriptors(None, &base()),
            Err(DiscoveryError::NoLanguages)
        );
    }

    #[test]
    fn test_v3_flat_listing() {
        let discovery = Discovery::decode(GbfsVersion::V3, V3_DISCOVERY.as_bytes()).unwrap();
        assert!(discovery.languages().is_empty());

        // Language is ignored for v3
        let descriptors = discovery.descriptors(Some("nb"), &base()).unwrap();
        assert_eq!(
            names(&descriptors),
            vec![FeedName::SystemInformation, FeedName::VehicleStatus]
        );
        // Relative URL resolved against the discovery URL
        assert_eq!(
            descriptors[1].url.as_str(),
            "https://example.com/vehicle_status.json"
        );
    }

    #[test]
    fn test_v3_requires_feeds() {
        let raw = br#"{"last_updated": 1, "ttl": 0, "data": {"nb": {"feeds": []}}}"#;
        assert!(matches!(
            Discovery::decode(GbfsVersion::V3, raw),
            Err(DecodeError::MissingData { key: "feeds", .. })
        ));
    }

    #[test]
    fn test_v2_malformed_group() {
        let raw = br#"{"last_updated": 1, "ttl": 0, "data": {"nb": {"files": []}}}"#;
        assert!(matches!(
            Discovery::decode(GbfsVersion::V2, raw),
            Err(DecodeError::Invalid { .. })
        ));
    }

    #[test]
    fn test_invalid_feed_url() {
        let raw = br#"{"last_updated": 1, "ttl": 0, "data": {"feeds": [
            {"name": "station_status", "url": "http://[broken"}
        ]}}"#;
        let discovery = Discovery::decode(GbfsVersion::V3, raw).unwrap();
        assert!(matches!(
            discovery.descriptors(None, &base()),
            Err(DiscoveryError::InvalidFeedUrl {
                feed: FeedName::StationStatus,
                ..
            })
        ));
    }
}
