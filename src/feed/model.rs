//! Payload envelope shared by every GBFS file, and the capability the updater
//! needs from a payload: decode from bytes, then report when it should be
//! refreshed.

use crate::feed::name::{FeedName, GbfsVersion};
use chrono::DateTime;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// Errors turning raw bytes into a typed payload.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Not JSON, or JSON that does not have the GBFS envelope shape
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// The `data` object lacks the key that identifies this feed's schema
    #[error("{feed} data is missing required field '{key}'")]
    MissingData { feed: FeedName, key: &'static str },
    /// The payload is well-formed but its content is unusable
    #[error("Invalid {feed} payload: {reason}")]
    Invalid { feed: FeedName, reason: String },
}

/// Errors extracting refresh metadata from a decoded payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MetadataError {
    #[error("last_updated has unsupported type {0}")]
    LastUpdatedType(&'static str),
    #[error("last_updated is not a valid timestamp: {0}")]
    LastUpdatedFormat(String),
    #[error("ttl must be a non-negative integer, got {0}")]
    Ttl(String),
}

/// When a payload was produced and how long it stays valid, in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshMetadata {
    pub last_updated: Option<i64>,
    pub ttl: Option<i64>,
}

/// Capability implemented by everything a [`FeedUpdater`](crate::feed::FeedUpdater)
/// can hold.
///
/// `Schema` identifies which shape to decode into when one Rust type covers
/// several files.
pub trait Payload: Sized + Send + Sync + 'static {
    type Schema: Copy + fmt::Debug + Send + Sync + 'static;

    fn decode(schema: Self::Schema, bytes: &[u8]) -> Result<Self, DecodeError>;

    fn refresh_metadata(&self) -> Result<RefreshMetadata, MetadataError>;
}

/// Common top level of every GBFS file.
///
/// `last_updated` and `ttl` are kept untyped here because versions disagree on
/// their encoding; [`Envelope::refresh_metadata`] interprets them.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope<D> {
    #[serde(default)]
    pub last_updated: Option<Value>,
    #[serde(default)]
    pub ttl: Option<Value>,
    #[serde(default)]
    pub version: Option<String>,
    pub data: D,
}

impl<D> Envelope<D> {
    /// Interpret `last_updated` (epoch seconds or RFC 3339) and `ttl`.
    ///
    /// Missing or null values yield `None`; values of the wrong type are errors.
    pub fn refresh_metadata(&self) -> Result<RefreshMetadata, MetadataError> {
        let last_updated = self
            .last_updated
            .as_ref()
            .filter(|v| !v.is_null())
            .map(parse_last_updated)
            .transpose()?;
        let ttl = self
            .ttl
            .as_ref()
            .filter(|v| !v.is_null())
            .map(parse_ttl)
            .transpose()?;
        Ok(RefreshMetadata { last_updated, ttl })
    }
}

fn parse_last_updated(value: &Value) -> Result<i64, MetadataError> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| MetadataError::LastUpdatedFormat(n.to_string())),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.timestamp())
            .map_err(|_| MetadataError::LastUpdatedFormat(s.clone())),
        other => Err(MetadataError::LastUpdatedType(json_type(other))),
    }
}

fn parse_ttl(value: &Value) -> Result<i64, MetadataError> {
    value
        .as_u64()
        .and_then(|ttl| i64::try_from(ttl).ok())
        .ok_or_else(|| MetadataError::Ttl(value.to_string()))
}

pub(crate) fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Selects which file schema a [`FeedPayload`] is decoded against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedSchema {
    pub version: GbfsVersion,
    pub name: FeedName,
}

/// A decoded GBFS file other than the discovery document.
///
/// The record schemas themselves are not modelled; `data` stays a JSON object
/// that is guaranteed to carry the key identifying its feed type.
#[derive(Debug, Clone)]
pub struct FeedPayload {
    name: FeedName,
    envelope: Envelope<Map<String, Value>>,
}

impl FeedPayload {
    pub fn name(&self) -> FeedName {
        self.name
    }

    pub fn version(&self) -> Option<&str> {
        self.envelope.version.as_deref()
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.envelope.data
    }

    /// Records under `data.<key>` when that value is an array
    /// (e.g. `stations`, `vehicles`, `plans`).
    pub fn records(&self, key: &str) -> Option<&[Value]> {
        self.envelope
            .data
            .get(key)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
    }

    pub fn envelope(&self) -> &Envelope<Map<String, Value>> {
        &self.envelope
    }
}

impl Payload for FeedPayload {
    type Schema = FeedSchema;

    fn decode(schema: FeedSchema, bytes: &[u8]) -> Result<Self, DecodeError> {
        let envelope: Envelope<Map<String, Value>> = serde_json::from_slice(bytes)?;
        if let Some(key) = schema.name.required_data_key(schema.version) {
            if !envelope.data.contains_key(key) {
                return Err(DecodeError::MissingData {
                    feed: schema.name,
                    key,
                });
            }
        }
        Ok(Self {
            name: schema.name,
            envelope,
        })
    }

    fn refresh_metadata(&self) -> Result<RefreshMetadata, MetadataError> {
        self.envelope.refresh_metadata()
    }
}
