//! The storage driver contract.
//!
//! Defines [`StorageDriver`], the uniform transactional CRUD interface every
//! backend implements, and [`DriverKind`], the closed set of backends.

use std::fmt;

use async_trait::async_trait;
use restkit_core::{Page, Record, RecordSet, ResourceId, StoreResult, Value};

/// Which backend implements a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverKind {
    /// In-process map, no durability.
    Memory,
    /// One file per record in a directory.
    File,
    /// One delimited-text file holding the whole table.
    Delimited,
    /// Relational table via parameterized statements.
    Relational,
    /// HTTP-REST document database (`CouchDB` protocol).
    CouchDb,
    /// Embedded document database (redb).
    Native,
}

impl DriverKind {
    /// Configuration name of the driver.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            DriverKind::Memory => "memory",
            DriverKind::File => "file",
            DriverKind::Delimited => "delimited",
            DriverKind::Relational => "relational",
            DriverKind::CouchDb => "couchdb",
            DriverKind::Native => "native",
        }
    }

    /// Whether transactions are emulated by buffering writes until commit.
    #[must_use]
    pub fn buffers_writes(self) -> bool {
        matches!(
            self,
            DriverKind::Memory | DriverKind::File | DriverKind::Delimited
        )
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Uniform transactional CRUD contract over one configured collection.
///
/// A `begin()`/`commit()`/`rollback()` bracket surrounds each logical request.
/// The caller is responsible for calling `rollback()` when an error is raised
/// inside the bracket. Drivers that buffer writes open their working set
/// implicitly when a call arrives outside a bracket.
///
/// `first()`/`last()` and the iteration order of [`RecordSet`] results are
/// driver-defined; see each driver's documentation.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// Which backend this is.
    fn kind(&self) -> DriverKind;

    /// Opens a working transaction, loading current state where the driver buffers.
    async fn begin(&self) -> StoreResult<()>;

    /// Persists buffered mutations. No-op when nothing changed.
    async fn commit(&self) -> StoreResult<()>;

    /// Discards buffered mutations and reloads from the durable medium.
    async fn rollback(&self) -> StoreResult<()>;

    /// Stores `record`, generating an id when `id` is `None`. Returns the id.
    async fn create(&self, record: Record, id: Option<ResourceId>) -> StoreResult<ResourceId>;

    /// Reads the record stored under `id`.
    async fn read(&self, id: &ResourceId) -> StoreResult<Record>;

    /// Merges `partial` into the record stored under `id`; returns the merged record.
    async fn update(&self, partial: Record, id: &ResourceId) -> StoreResult<Record>;

    /// Deletes the record stored under `id`; returns it.
    async fn delete(&self, id: &ResourceId) -> StoreResult<Record>;

    /// Whether a record is stored under `id`.
    async fn exists(&self, id: &ResourceId) -> StoreResult<bool>;

    /// Enumerates records in driver order, optionally windowed.
    async fn all(&self, page: Option<Page>) -> StoreResult<RecordSet>;

    /// Removes every record. Returns how many were removed.
    async fn delete_all(&self) -> StoreResult<u64>;

    /// Number of stored records.
    async fn count(&self) -> StoreResult<u64>;

    /// All records whose `field` equals `value`.
    async fn search(&self, field: &str, value: &Value) -> StoreResult<RecordSet>;

    /// First record in driver order.
    async fn first(&self) -> StoreResult<Option<(ResourceId, Record)>> {
        Ok(self.all(Some(Page::new(1, 1))).await?.into_iter().next())
    }

    /// Last record in driver order.
    async fn last(&self) -> StoreResult<Option<(ResourceId, Record)>> {
        Ok(self.all(None).await?.pop())
    }
}

/// Exact-match predicate shared by drivers that search in memory.
pub(crate) fn field_matches(record: &Record, field: &str, value: &Value) -> bool {
    record.get(field) == Some(value)
}
