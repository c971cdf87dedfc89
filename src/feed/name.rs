//! The closed set of GBFS files this crate knows how to mirror.
//!
//! Every file is tied to one [`FeedName`], and each protocol version publishes a
//! fixed subset of them. A name that is not in the version's table is treated as
//! unrecognized and never stored.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// GBFS protocol variant.
///
/// v2.x (and v1.x, which it stays compatible with) groups feeds by language in
/// the discovery file; v3.x publishes one flat list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GbfsVersion {
    #[serde(rename = "2", alias = "v2")]
    V2,
    #[serde(rename = "3", alias = "v3")]
    V3,
}

impl GbfsVersion {
    pub const fn as_str(&self) -> &'static str {
        match self {
            GbfsVersion::V2 => "2",
            GbfsVersion::V3 => "3",
        }
    }

    /// Whether a discovery file for this version groups feeds by language.
    pub const fn has_languages(&self) -> bool {
        matches!(self, GbfsVersion::V2)
    }

    /// All feeds this version can publish, in delivery order.
    pub const fn feeds(&self) -> &'static [FeedName] {
        match self {
            GbfsVersion::V2 => V2_FEEDS,
            GbfsVersion::V3 => V3_FEEDS,
        }
    }

    /// Whether a `version` string from a GBFS file belongs to this protocol variant.
    ///
    /// v1.x files are accepted as v2 since v2 is backwards compatible.
    pub fn matches(&self, version: &str) -> bool {
        let major = version.split('.').next().unwrap_or_default();
        match self {
            GbfsVersion::V2 => major == "1" || major == "2",
            GbfsVersion::V3 => major == "3",
        }
    }
}

impl fmt::Display for GbfsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.as_str())
    }
}

/// Identity of a single GBFS file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FeedName {
    Gbfs,
    GbfsVersions,
    Manifest,
    SystemInformation,
    VehicleTypes,
    StationInformation,
    StationStatus,
    FreeBikeStatus,
    VehicleStatus,
    SystemHours,
    SystemCalendar,
    SystemRegions,
    SystemPricingPlans,
    SystemAlerts,
    GeofencingZones,
}

const V2_FEEDS: &[FeedName] = &[
    FeedName::Gbfs,
    FeedName::GbfsVersions,
    FeedName::SystemInformation,
    FeedName::VehicleTypes,
    FeedName::StationInformation,
    FeedName::StationStatus,
    FeedName::FreeBikeStatus,
    FeedName::SystemHours,
    FeedName::SystemCalendar,
    FeedName::SystemRegions,
    FeedName::SystemPricingPlans,
    FeedName::SystemAlerts,
    FeedName::GeofencingZones,
];

const V3_FEEDS: &[FeedName] = &[
    FeedName::Gbfs,
    FeedName::Manifest,
    FeedName::GbfsVersions,
    FeedName::SystemInformation,
    FeedName::VehicleTypes,
    FeedName::StationInformation,
    FeedName::StationStatus,
    FeedName::VehicleStatus,
    FeedName::SystemRegions,
    FeedName::SystemPricingPlans,
    FeedName::SystemAlerts,
    FeedName::GeofencingZones,
];

impl FeedName {
    /// File name as it appears in a discovery document.
    pub const fn as_str(&self) -> &'static str {
        match self {
            FeedName::Gbfs => "gbfs",
            FeedName::GbfsVersions => "gbfs_versions",
            FeedName::Manifest => "manifest",
            FeedName::SystemInformation => "system_information",
            FeedName::VehicleTypes => "vehicle_types",
            FeedName::StationInformation => "station_information",
            FeedName::StationStatus => "station_status",
            FeedName::FreeBikeStatus => "free_bike_status",
            FeedName::VehicleStatus => "vehicle_status",
            FeedName::SystemHours => "system_hours",
            FeedName::SystemCalendar => "system_calendar",
            FeedName::SystemRegions => "system_regions",
            FeedName::SystemPricingPlans => "system_pricing_plans",
            FeedName::SystemAlerts => "system_alerts",
            FeedName::GeofencingZones => "geofencing_zones",
        }
    }

    /// Look up a feed name for a specific version. Names the version does not
    /// publish yield `None`.
    pub fn for_version(version: GbfsVersion, name: &str) -> Option<Self> {
        name.parse::<FeedName>()
            .ok()
            .filter(|feed| version.feeds().contains(feed))
    }

    /// Key that must be present in the file's `data` object for it to match
    /// this feed's schema. `None` means any object is accepted.
    pub(crate) const fn required_data_key(&self, version: GbfsVersion) -> Option<&'static str> {
        match self {
            FeedName::Gbfs => match version {
                // v2 nests feeds under language codes, which are not known up front
                GbfsVersion::V2 => None,
                GbfsVersion::V3 => Some("feeds"),
            },
            FeedName::GbfsVersions => Some("versions"),
            FeedName::Manifest => Some("datasets"),
            FeedName::SystemInformation => Some("system_id"),
            FeedName::VehicleTypes => Some("vehicle_types"),
            FeedName::StationInformation | FeedName::StationStatus => Some("stations"),
            FeedName::FreeBikeStatus => Some("bikes"),
            FeedName::VehicleStatus => Some("vehicles"),
            FeedName::SystemHours => Some("rental_hours"),
            FeedName::SystemCalendar => Some("calendars"),
            FeedName::SystemRegions => Some("regions"),
            FeedName::SystemPricingPlans => Some("plans"),
            FeedName::SystemAlerts => Some("alerts"),
            FeedName::GeofencingZones => Some("geofencing_zones"),
        }
    }
}

impl fmt::Display for FeedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing a string that is not a known GBFS file name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown feed name: {0}")]
pub struct UnknownFeedName(pub String);

impl FromStr for FeedName {
    type Err = UnknownFeedName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gbfs" => Ok(FeedName::Gbfs),
            "gbfs_versions" => Ok(FeedName::GbfsVersions),
            "manifest" => Ok(FeedName::Manifest),
            "system_information" => Ok(FeedName::SystemInformation),
            "vehicle_types" => Ok(FeedName::VehicleTypes),
            "station_information" => Ok(FeedName::StationInformation),
            "station_status" => Ok(FeedName::StationStatus),
            "free_bike_status" => Ok(FeedName::FreeBikeStatus),
            "vehicle_status" => Ok(FeedName::VehicleStatus),
            "system_hours" => Ok(FeedName::SystemHours),
            "system_calendar" => Ok(FeedName::SystemCalendar),
            "system_regions" => Ok(FeedName::SystemRegions),
            "system_pricing_plans" => Ok(FeedName::SystemPricingPlans),
            "system_alerts" => Ok(FeedName::SystemAlerts),
            "geofencing_zones" => Ok(FeedName::GeofencingZones),
            other => Err(UnknownFeedName(other.to_owned())),
        }
    }
}
