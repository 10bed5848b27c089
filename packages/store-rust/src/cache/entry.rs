//! Cache entries and the entity tags derived from them.

use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use restkit_core::hash::entity_tag_digest;
use restkit_core::{FieldMap, Record, StoreError, StoreResult, Value};
use serde::{Deserialize, Serialize};

const URI: &str = "uri";
const VERSION: &str = "version";
const MODIFIED: &str = "modified";
const RESOURCE_TYPE: &str = "resource_type";
const PAYLOAD: &str = "payload";

/// Field names of a stored entry, for schema-bound metadata stores.
pub const ENTRY_FIELDS: [&str; 5] = [URI, VERSION, MODIFIED, RESOURCE_TYPE, PAYLOAD];

/// Modification metadata kept for one resource URI.
///
/// `version` starts at 1 and only ever grows while the entry exists.
/// `modified` has one-second resolution, matching HTTP dates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub uri: String,
    pub version: u64,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub modified: DateTime<Utc>,
    #[serde(default)]
    pub resource_type: Option<String>,
    #[serde(default)]
    pub payload: Option<Value>,
}

impl CacheEntry {
    /// First entry for a URI.
    #[must_use]
    pub fn first(uri: &str, now: DateTime<Utc>) -> Self {
        Self {
            uri: uri.to_string(),
            version: 1,
            modified: truncate_to_second(now),
            resource_type: None,
            payload: None,
        }
    }

    /// The entry after one more write: next version, refreshed timestamp.
    #[must_use]
    pub fn bumped(mut self, now: DateTime<Utc>) -> Self {
        self.version = self.version.saturating_add(1);
        self.modified = truncate_to_second(now);
        self
    }

    /// Strong validator for this state of the resource.
    #[must_use]
    pub fn entity_tag(&self) -> EntityTag {
        EntityTag(entity_tag_digest(
            &self.uri,
            self.modified.timestamp(),
            self.version,
        ))
    }

    /// Record written to the metadata store.
    #[must_use]
    pub fn to_record(&self) -> Record {
        let mut fields = FieldMap::new();
        fields.insert(URI.to_string(), Value::from(self.uri.as_str()));
        fields.insert(
            VERSION.to_string(),
            Value::Int(i64::try_from(self.version).unwrap_or(i64::MAX)),
        );
        fields.insert(MODIFIED.to_string(), Value::Int(self.modified.timestamp()));
        fields.insert(
            RESOURCE_TYPE.to_string(),
            self.resource_type
                .as_deref()
                .map_or(Value::Null, Value::from),
        );
        fields.insert(
            PAYLOAD.to_string(),
            self.payload.clone().unwrap_or(Value::Null),
        );
        Value::Map(fields)
    }

    /// Reads an entry back from a metadata record.
    ///
    /// Text-based stores may hand numbers back as strings; both are accepted.
    /// Unknown fields (such as a key column) are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::SchemaViolation`] if `uri`, `version` or
    /// `modified` is missing or malformed.
    pub fn from_record(record: &Record) -> StoreResult<Self> {
        let uri = record
            .get(URI)
            .and_then(Value::as_str)
            .ok_or_else(|| malformed(URI))?
            .to_string();
        let version = integer(record.get(VERSION))
            .and_then(|v| u64::try_from(v).ok())
            .filter(|v| *v > 0)
            .ok_or_else(|| malformed(VERSION))?;
        let modified = integer(record.get(MODIFIED))
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .ok_or_else(|| malformed(MODIFIED))?;
        let resource_type = record
            .get(RESOURCE_TYPE)
            .and_then(Value::as_str)
            .map(str::to_string);
        let payload = record.get(PAYLOAD).filter(|v| !v.is_null()).cloned();
        Ok(Self {
            uri,
            version,
            modified,
            resource_type,
            payload,
        })
    }
}

fn integer(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Int(i) => Some(*i),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn malformed(field: &str) -> StoreError {
    StoreError::SchemaViolation(format!("cache entry has no valid `{field}`"))
}

fn truncate_to_second(at: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_opt(at.timestamp(), 0).single().unwrap_or(at)
}

/// A strong entity tag: the hex digest without quotes.
///
/// [`Display`](fmt::Display) renders the quoted header form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityTag(String);

impl EntityTag {
    /// Wraps an opaque tag as sent by a client, quotes already removed.
    pub fn new(opaque: impl Into<String>) -> Self {
        Self(opaque.into())
    }

    /// The opaque part, unquoted.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\"", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    #[test]
    fn bump_advances_version_and_time() {
        let entry = CacheEntry::first("/dogs/1", at(100));
        let next = entry.clone().bumped(at(160));
        assert_eq!(next.version, 2);
        assert_eq!(next.modified, at(160));
        assert_ne!(entry.entity_tag(), next.entity_tag());
    }

    #[test]
    fn same_second_writes_get_distinct_tags() {
        let entry = CacheEntry::first("/dogs/1", at(100));
        let next = entry.clone().bumped(at(100));
        assert_eq!(entry.modified, next.modified);
        assert_ne!(entry.entity_tag(), next.entity_tag());
    }

    #[test]
    fn sub_second_precision_is_dropped() {
        let precise = Utc.timestamp_opt(100, 999_000_000).single().unwrap();
        assert_eq!(CacheEntry::first("/a", precise).modified, at(100));
    }

    #[test]
    fn record_round_trip_keeps_every_field() {
        let mut entry = CacheEntry::first("/dogs/1", at(1_700_000_000));
        entry.resource_type = Some("dog".to_string());
        entry.payload = Some([("name", "Rex")].into_iter().collect());
        assert_eq!(CacheEntry::from_record(&entry.to_record()).unwrap(), entry);
    }

    #[test]
    fn textual_numbers_and_extra_columns_are_accepted() {
        let record: Value = [
            ("id", "abc"),
            ("uri", "/dogs/1"),
            ("version", "3"),
            ("modified", "100"),
        ]
        .into_iter()
        .collect();
        let entry = CacheEntry::from_record(&record).unwrap();
        assert_eq!(entry.version, 3);
        assert_eq!(entry.modified, at(100));
        assert_eq!(entry.resource_type, None);
        assert_eq!(entry.payload, None);
    }

    #[test]
    fn zero_version_is_rejected() {
        let mut record = CacheEntry::first("/a", at(1)).to_record();
        if let Value::Map(fields) = &mut record {
            fields.insert("version".to_string(), Value::Int(0));
        }
        assert!(matches!(
            CacheEntry::from_record(&record),
            Err(StoreError::SchemaViolation(_))
        ));
    }

    #[test]
    fn entity_tag_displays_quoted() {
        let tag = EntityTag::new("abc");
        assert_eq!(tag.to_string(), "\"abc\"");
        assert_eq!(tag.as_str(), "abc");
    }
}
