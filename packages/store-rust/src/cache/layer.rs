//! [`ConditionalCache`]: per-URI modification metadata over a metadata store.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use http::header::{ETAG, LAST_MODIFIED};
use http::{HeaderMap, HeaderValue};
use restkit_core::hash::uri_key;
use restkit_core::{ResourceId, StoreError, StoreResult, Value};
use tokio::sync::Mutex;

use super::entry::{CacheEntry, EntityTag};
use super::preconditions::{http_date, Preconditions};
use crate::config::DriverConfig;
use crate::storage::{StorageDriver, Store};

/// Source of "now" for modification timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Answers "is the client's copy of this URI still current?" from stored
/// version counters and timestamps, without touching the resource itself.
///
/// Entries live in their own store, keyed by the SHA-256 of the URI.
/// Every access runs inside a begin/commit bracket on that store, one at a
/// time, so buffered stores see changes made by other processes.
pub struct ConditionalCache<S = Store> {
    store: S,
    clock: Arc<dyn Clock>,
    gate: Mutex<()>,
}

impl ConditionalCache<Store> {
    /// Opens the metadata store described by `config`.
    ///
    /// # Errors
    ///
    /// Propagates [`Store::open`] failures.
    pub async fn open(config: &DriverConfig) -> StoreResult<Self> {
        Ok(Self::new(Store::open(config).await?))
    }
}

impl<S: StorageDriver> ConditionalCache<S> {
    /// Cache over `store`, timestamped by the system clock.
    pub fn new(store: S) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: S, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            gate: Mutex::new(()),
        }
    }

    /// The metadata store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Records a write to `uri`: creates the entry at version 1, or bumps
    /// the version and refreshes the timestamp.
    ///
    /// # Errors
    ///
    /// Propagates metadata store failures; the store is rolled back first.
    pub async fn mark_modified(&self, uri: &str) -> StoreResult<CacheEntry> {
        self.mark_modified_with(uri, None, None).await
    }

    /// Like [`mark_modified`](Self::mark_modified), also replacing the stored
    /// resource type and payload when given.
    ///
    /// # Errors
    ///
    /// Propagates metadata store failures; the store is rolled back first.
    pub async fn mark_modified_with(
        &self,
        uri: &str,
        resource_type: Option<&str>,
        payload: Option<Value>,
    ) -> StoreResult<CacheEntry> {
        let _turn = self.gate.lock().await;
        self.store.begin().await?;
        let result = self.bump(uri, resource_type, payload).await;
        self.settle(result).await
    }

    async fn bump(
        &self,
        uri: &str,
        resource_type: Option<&str>,
        payload: Option<Value>,
    ) -> StoreResult<CacheEntry> {
        let key = key_for(uri);
        let now = self.clock.now();
        let previous = self.lookup(uri, &key).await?;
        let existed = previous.is_some();
        let mut entry = match previous {
            Some(entry) => entry.bumped(now),
            None => CacheEntry::first(uri, now),
        };
        if let Some(resource_type) = resource_type {
            entry.resource_type = Some(resource_type.to_string());
        }
        if payload.is_some() {
            entry.payload = payload;
        }
        if existed {
            self.store.update(entry.to_record(), &key).await?;
        } else {
            self.store.create(entry.to_record(), Some(key)).await?;
        }
        tracing::debug!(uri, version = entry.version, "marked modified");
        Ok(entry)
    }

    /// The stored entry for `uri`, if any.
    ///
    /// # Errors
    ///
    /// Propagates metadata store failures.
    pub async fn entry(&self, uri: &str) -> StoreResult<Option<CacheEntry>> {
        let _turn = self.gate.lock().await;
        self.store.begin().await?;
        let result = self.lookup(uri, &key_for(uri)).await;
        self.settle(result).await
    }

    /// Strong validator for the current state of `uri`; `None` if the URI
    /// was never marked.
    ///
    /// # Errors
    ///
    /// Propagates metadata store failures.
    pub async fn entity_tag(&self, uri: &str) -> StoreResult<Option<EntityTag>> {
        Ok(self.entry(uri).await?.map(|entry| entry.entity_tag()))
    }

    /// Time of the last recorded write to `uri`.
    ///
    /// # Errors
    ///
    /// Propagates metadata store failures.
    pub async fn last_modified(&self, uri: &str) -> StoreResult<Option<DateTime<Utc>>> {
        Ok(self.entry(uri).await?.map(|entry| entry.modified))
    }

    /// Whether the client must be sent a fresh copy of `uri`.
    ///
    /// `false` when `If-None-Match` lists the current tag (or is `*` and an
    /// entry exists), or when `If-Modified-Since` is at or after the stored
    /// timestamp. `true` otherwise, including for URIs with no entry.
    ///
    /// # Errors
    ///
    /// Propagates metadata store failures.
    pub async fn is_modified(&self, uri: &str, preconditions: &Preconditions) -> StoreResult<bool> {
        let Some(entry) = self.entry(uri).await? else {
            return Ok(true);
        };
        if let Some(condition) = &preconditions.if_none_match {
            if condition.matches(&entry.entity_tag()) {
                return Ok(false);
            }
        }
        if let Some(since) = preconditions.if_modified_since {
            if since >= entry.modified {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Drops the entry for a deleted resource. Returns whether one existed.
    ///
    /// # Errors
    ///
    /// Propagates metadata store failures; the store is rolled back first.
    pub async fn forget(&self, uri: &str) -> StoreResult<bool> {
        let _turn = self.gate.lock().await;
        self.store.begin().await?;
        let key = key_for(uri);
        let result = match self.store.delete(&key).await {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        };
        self.settle(result).await
    }

    /// `ETag` and `Last-Modified` response headers for `uri`; empty when
    /// the URI has no entry.
    ///
    /// # Errors
    ///
    /// Propagates metadata store failures.
    pub async fn validator_headers(&self, uri: &str) -> StoreResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        if let Some(entry) = self.entry(uri).await? {
            headers.insert(ETAG, header_value(&entry.entity_tag().to_string())?);
            headers.insert(LAST_MODIFIED, header_value(&http_date(entry.modified))?);
        }
        Ok(headers)
    }

    async fn lookup(&self, uri: &str, key: &ResourceId) -> StoreResult<Option<CacheEntry>> {
        let record = match self.store.read(key).await {
            Ok(record) => record,
            Err(StoreError::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        let entry = CacheEntry::from_record(&record)?;
        if entry.uri != uri {
            return Err(StoreError::conflict(
                key,
                format!("cache key holds `{}`, not `{uri}`", entry.uri),
            ));
        }
        Ok(Some(entry))
    }

    /// Commits after success, rolls back after failure (including a failed commit).
    async fn settle<T>(&self, result: StoreResult<T>) -> StoreResult<T> {
        let result = match result {
            Ok(value) => self.store.commit().await.map(|()| value),
            Err(e) => Err(e),
        };
        if result.is_err() {
            if let Err(rollback) = self.store.rollback().await {
                tracing::warn!(error = %rollback, "cache rollback failed");
            }
        }
        result
    }
}

fn key_for(uri: &str) -> ResourceId {
    ResourceId::parse(&uri_key(uri))
}

fn header_value(text: &str) -> StoreResult<HeaderValue> {
    HeaderValue::from_str(text).map_err(|e| StoreError::medium("encode validator header", e))
}
