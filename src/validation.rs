//! Validation of raw GBFS files.
//!
//! Validation runs only when a subscription enables it, over the raw bytes of
//! every file currently held by the registry. The result travels with the
//! [`Delivery`](crate::subscription::Delivery); it never blocks a delivery.

use crate::feed::{json_type, FeedName, GbfsVersion};
use crate::feed::strategy::now_secs;
use bytes::Bytes;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Fields every GBFS file carries at its top level.
const REQUIRED_FIELDS: [&str; 4] = ["last_updated", "ttl", "version", "data"];

/// Oracle that checks a set of raw files.
pub trait FeedValidator: Send + Sync + fmt::Debug {
    fn validate(&self, files: &BTreeMap<FeedName, Bytes>) -> ValidationResult;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationSummary {
    /// Protocol variant the files were checked against
    pub version: GbfsVersion,
    /// Epoch seconds when validation ran
    pub timestamp: i64,
    pub errors_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileValidationResult {
    pub errors: Vec<String>,
}

impl FileValidationResult {
    pub fn errors_count(&self) -> usize {
        self.errors.len()
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    pub summary: ValidationSummary,
    pub files: BTreeMap<FeedName, FileValidationResult>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.summary.errors_count == 0
    }
}

/// Checks the envelope shape of every file.
///
/// Each file must be a JSON object with `last_updated`, `ttl`, `version` and
/// `data`, `data` must be an object, and `version` must belong to the expected
/// protocol variant. Record-level schemas are not checked; plug a full JSON
/// schema validator in with
/// [`SubscriptionOptions::with_validator`](crate::SubscriptionOptions::with_validator)
/// for that.
#[derive(Debug, Clone, Copy)]
pub struct StructuralValidator {
    version: GbfsVersion,
}

impl StructuralValidator {
    pub fn new(version: GbfsVersion) -> Self {
        Self { version }
    }

    fn check(&self, raw: &[u8]) -> Vec<String> {
        let value: Value = match serde_json::from_slice(raw) {
            Ok(value) => value,
            Err(e) => return vec![format!("not valid JSON: {e}")],
        };
        let Some(object) = value.as_object() else {
            return vec![format!("expected object at top level, found {}", json_type(&value))];
        };

        let mut errors: Vec<String> = REQUIRED_FIELDS
            .iter()
            .filter(|field| !object.contains_key(**field))
            .map(|field| format!("missing required field '{field}'"))
            .collect();

        if let Some(data) = object.get("data") {
            if !data.is_object() {
                errors.push(format!("'data' must be an object, found {}", json_type(data)));
            }
        }

        match object.get("version") {
            Some(Value::String(v)) if !self.version.matches(v) => {
                errors.push(format!("version '{v}' does not match GBFS {}", self.version));
            }
            Some(Value::String(_)) | None => {}
            Some(other) => {
                errors.push(format!("'version' must be a string, found {}", json_type(other)));
            }
        }
        errors
    }
}

impl FeedValidator for StructuralValidator {
    fn validate(&self, files: &BTreeMap<FeedName, Bytes>) -> ValidationResult {
        let files: BTreeMap<FeedName, FileValidationResult> = files
            .iter()
            .map(|(name, raw)| {
                (
                    *name,
                    FileValidationResult {
                        errors: self.check(raw),
                    },
                )
            })
            .collect();
        let errors_count = files.values().map(FileValidationResult::errors_count).sum();

        ValidationResult {
            summary: ValidationSummary {
                version: self.version,
                timestamp: now_secs(),
                errors_count,
            },
            files,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn files(entries: &[(FeedName, &'static str)]) -> BTreeMap<FeedName, Bytes> {
        entries
            .iter()
            .map(|(name, raw)| (*name, Bytes::from_static(raw.as_bytes())))
            .collect()
    }

    #[test]
    fn test_valid_files() {
        let validator = StructuralValidator::new(GbfsVersion::V2);
        let result = validator.validate(&files(&[
            (
                FeedName::SystemInformation,
                r#"{"last_updated": 1, "ttl": 0, "version": "2.3", "data": {"system_id": "x"}}"#,
            ),
            (
                FeedName::StationStatus,
                r#"{"last_updated": 1, "ttl": 0, "version": "1.1", "data": {"stations": []}}"#,
            ),
        ]));
        assert!(result.is_valid());
        assert_eq!(result.files.len(), 2);
        assert_eq!(result.summary.version, GbfsVersion::V2);
    }

    #[test]
    fn test_errors_are_counted_per_file() {
        let validator = StructuralValidator::new(GbfsVersion::V3);
        let result = validator.validate(&files(&[
            (FeedName::SystemInformation, r#"{"data": []}"#),
            (
                FeedName::VehicleStatus,
                r#"{"last_updated": "2023-11-14T22:13:20Z", "ttl": 0, "version": "2.3", "data": {}}"#,
            ),
            (FeedName::StationStatus, "not json"),
        ]));

        let system_information = &result.files[&FeedName::SystemInformation];
        assert_eq!(
            system_information.errors,
            vec![
                "missing required field 'last_updated'".to_string(),
                "missing required field 'ttl'".to_string(),
                "missing required field 'version'".to_string(),
                "'data' must be an object, found array".to_string(),
            ]
        );
        assert_eq!(
            result.files[&FeedName::VehicleStatus].errors,
            vec!["version '2.3' does not match GBFS v3".to_string()]
        );
        assert_eq!(result.files[&FeedName::StationStatus].errors_count(), 1);
        assert_eq!(result.summary.errors_count, 6);
        assert!(!result.is_valid());
    }

    #[test]
    fn test_non_object_file() {
        let validator = StructuralValidator::new(GbfsVersion::V2);
        let result = validator.validate(&files(&[(FeedName::SystemAlerts, "[1, 2]")]));
        assert_eq!(
            result.files[&FeedName::SystemAlerts].errors,
            vec!["expected object at top level, found array".to_string()]
        );
    }

    #[test]
    fn test_empty_input() {
        let result = StructuralValidator::new(GbfsVersion::V2).validate(&BTreeMap::new());
        assert!(result.is_valid());
        assert!(result.files.is_empty());
    }
}
