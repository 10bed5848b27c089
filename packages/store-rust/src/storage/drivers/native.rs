//! Embedded document-store [`StorageDriver`] on redb.
//!
//! Each collection is one redb table. Keys sort integers numerically before
//! strings (`0x00` + big-endian `u64`, or `0x01` + UTF-8), which is the
//! order `all()`, `first()` and `last()` follow. Values are `MessagePack`
//! documents carrying the body and a revision counter that starts at 1 and
//! increments on every write.
//!
//! Every operation runs in its own redb transaction on the blocking pool, so
//! `begin()`/`commit()`/`rollback()` are no-ops. Update and delete compare
//! the stored revision against the one this store last observed, inside the
//! same write transaction, and fail with [`StoreError::Conflict`] when stale.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use restkit_core::{
    merge, IdSequence, Page, Record, RecordSet, ResourceId, StoreError, StoreResult, Value,
};
use serde::{Deserialize, Serialize};

use super::revisions::RevisionCache;
use crate::config::NativeConfig;
use crate::storage::driver::{field_matches, DriverKind, StorageDriver};

const INT_KEY: u8 = 0;
const STR_KEY: u8 = 1;

type Docs<'a> = TableDefinition<'a, &'static [u8], &'static [u8]>;

fn docs(collection: &str) -> Docs<'_> {
    TableDefinition::new(collection)
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredDoc {
    rev: u64,
    body: Value,
}

impl StoredDoc {
    fn encode(&self) -> StoreResult<Vec<u8>> {
        rmp_serde::to_vec_named(self)
            .map_err(|e| StoreError::SchemaViolation(format!("native encoding: {e}")))
    }

    fn decode(bytes: &[u8]) -> StoreResult<Self> {
        rmp_serde::from_slice(bytes).map_err(|e| StoreError::medium("native decoding", e))
    }
}

fn encode_key(id: &ResourceId) -> Vec<u8> {
    match id {
        ResourceId::Int(n) => {
            let mut key = Vec::with_capacity(9);
            key.push(INT_KEY);
            key.extend_from_slice(&n.to_be_bytes());
            key
        }
        ResourceId::Str(s) => {
            let mut key = Vec::with_capacity(s.len() + 1);
            key.push(STR_KEY);
            key.extend_from_slice(s.as_bytes());
            key
        }
    }
}

fn decode_key(key: &[u8]) -> StoreResult<ResourceId> {
    match key.split_first() {
        Some((&INT_KEY, rest)) => <[u8; 8]>::try_from(rest)
            .map(|bytes| ResourceId::Int(u64::from_be_bytes(bytes)))
            .map_err(|e| StoreError::medium("native key", e)),
        Some((&STR_KEY, rest)) => std::str::from_utf8(rest)
            .map(|s| ResourceId::Str(s.to_string()))
            .map_err(|e| StoreError::medium("native key", e)),
        _ => Err(StoreError::medium(
            "native key",
            anyhow::anyhow!("unknown key tag"),
        )),
    }
}

fn storage(context: &str) -> impl Fn(redb::StorageError) -> StoreError + '_ {
    move |e| StoreError::medium(format!("native {context}"), e)
}

/// redb-backed document store.
pub struct NativeDriver {
    db: Arc<Database>,
    collection: Arc<str>,
    revisions: Arc<RevisionCache<u64>>,
    high_water: Arc<Mutex<u64>>,
}

impl NativeDriver {
    /// Opens (or creates) the database file and the collection table.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidConfiguration`] if the database cannot
    /// be opened.
    pub async fn open(config: &NativeConfig) -> StoreResult<Self> {
        let path = config.path.clone();
        let db = tokio::task::spawn_blocking(move || open_database(&path))
            .await
            .map_err(|e| StoreError::medium("native open task failed", e))??;
        Self::from_database(Arc::new(db), &config.collection).await
    }

    /// Binds a collection inside an already open database.
    ///
    /// redb allows one open handle per file and process; stores for several
    /// collections of one file share the handle through this constructor.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::MediumFailure`] if the table cannot be created.
    pub async fn from_database(db: Arc<Database>, collection: &str) -> StoreResult<Self> {
        let driver = Self {
            db,
            collection: Arc::from(collection),
            revisions: Arc::new(RevisionCache::new()),
            high_water: Arc::new(Mutex::new(0)),
        };
        driver
            .blocking("create table", |db, collection| {
                let txn = db
                    .begin_write()
                    .map_err(|e| StoreError::medium("native begin", e))?;
                txn.open_table(docs(collection))
                    .map_err(|e| StoreError::medium("native open table", e))?;
                txn.commit()
                    .map_err(|e| StoreError::medium("native commit", e))
            })
            .await?;
        tracing::info!(collection = %driver.collection, "opened native store");
        Ok(driver)
    }

    /// Shared database handle.
    #[must_use]
    pub fn database(&self) -> Arc<Database> {
        Arc::clone(&self.db)
    }

    /// Runs `op` on the blocking pool with the database and collection name.
    async fn blocking<T, F>(&self, what: &'static str, op: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database, &str) -> StoreResult<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        let collection = Arc::clone(&self.collection);
        tokio::task::spawn_blocking(move || op(&db, &collection))
            .await
            .map_err(|e| StoreError::medium(format!("native {what} task failed"), e))?
    }

    /// Reads every document in key order.
    async fn scan(&self) -> StoreResult<Vec<(ResourceId, StoredDoc)>> {
        self.blocking("scan", |db, collection| {
            let txn = db
                .begin_read()
                .map_err(|e| StoreError::medium("native begin", e))?;
            let table = txn
                .open_table(docs(collection))
                .map_err(|e| StoreError::medium("native open table", e))?;
            let mut out = Vec::new();
            for entry in table.iter().map_err(storage("scan"))? {
                let (key, value) = entry.map_err(storage("scan"))?;
                out.push((decode_key(key.value())?, StoredDoc::decode(value.value())?));
            }
            Ok(out)
        })
        .await
    }

    fn observe_all(&self, docs: Vec<(ResourceId, StoredDoc)>) -> RecordSet {
        docs.into_iter()
            .map(|(id, doc)| {
                self.revisions.observe(&id, doc.rev);
                (id, doc.body)
            })
            .collect()
    }

    /// Applies `change` to the stored document inside one write transaction.
    ///
    /// `change` receives the current body and returns the new body, or `None`
    /// to delete. Returns the previous body and the new revision.
    async fn rewrite<F>(&self, id: &ResourceId, change: F) -> StoreResult<(Value, Option<Value>)>
    where
        F: FnOnce(Value) -> StoreResult<Option<Value>> + Send + 'static,
    {
        let key = encode_key(id);
        let target = id.clone();
        let expected = self.revisions.get(id);
        let (previous, next) = self
            .blocking("write", move |db, collection| {
                let txn = db
                    .begin_write()
                    .map_err(|e| StoreError::medium("native begin", e))?;
                let outcome = {
                    let mut table = txn
                        .open_table(docs(collection))
                        .map_err(|e| StoreError::medium("native open table", e))?;
                    let current = match table.get(key.as_slice()).map_err(storage("read"))? {
                        Some(guard) => StoredDoc::decode(guard.value())?,
                        None => return Err(StoreError::not_found(&target)),
                    };
                    if let Some(expected) = expected {
                        if expected != current.rev {
                            return Err(StoreError::conflict(
                                &target,
                                format!("stale revision {expected}, stored {}", current.rev),
                            ));
                        }
                    }
                    let previous = current.body.clone();
                    match change(current.body)? {
                        Some(body) => {
                            let doc = StoredDoc {
                                rev: current.rev + 1,
                                body,
                            };
                            table
                                .insert(key.as_slice(), doc.encode()?.as_slice())
                                .map_err(storage("write"))?;
                            (previous, Some(doc))
                        }
                        None => {
                            table.remove(key.as_slice()).map_err(storage("delete"))?;
                            (previous, None)
                        }
                    }
                };
                txn.commit()
                    .map_err(|e| StoreError::medium("native commit", e))?;
                Ok(outcome)
            })
            .await?;

        match next {
            Some(doc) => {
                self.revisions.observe(id, doc.rev);
                Ok((previous, Some(doc.body)))
            }
            None => {
                self.revisions.forget(id);
                Ok((previous, None))
            }
        }
    }
}

fn open_database(path: &Path) -> StoreResult<Database> {
    Database::create(path).map_err(|e| {
        StoreError::InvalidConfiguration(format!("cannot open {}: {e}", path.display()))
    })
}

#[async_trait]
impl StorageDriver for NativeDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Native
    }

    async fn begin(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn commit(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn rollback(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn create(&self, record: Record, id: Option<ResourceId>) -> StoreResult<ResourceId> {
        let high_water = Arc::clone(&self.high_water);
        let id = self
            .blocking("create", move |db, collection| {
                let txn = db
                    .begin_write()
                    .map_err(|e| StoreError::medium("native begin", e))?;
                let id = {
                    let mut table = txn
                        .open_table(docs(collection))
                        .map_err(|e| StoreError::medium("native open table", e))?;
                    let id = match id {
                        Some(id) => id,
                        None => {
                            let mut existing = Vec::new();
                            for entry in table.iter().map_err(storage("scan"))? {
                                let (key, _) = entry.map_err(storage("scan"))?;
                                existing.push(decode_key(key.value())?);
                            }
                            let mut sequence = IdSequence::seeded(&existing);
                            let mut floor = high_water.lock();
                            sequence.raise_high_water(*floor);
                            let in_use: HashSet<&ResourceId> = existing.iter().collect();
                            let id = sequence.next_id(|candidate| in_use.contains(candidate));
                            *floor = sequence.high_water();
                            id
                        }
                    };
                    let key = encode_key(&id);
                    if table.get(key.as_slice()).map_err(storage("read"))?.is_some() {
                        return Err(StoreError::conflict(&id, "id already exists"));
                    }
                    let doc = StoredDoc { rev: 1, body: record };
                    table
                        .insert(key.as_slice(), doc.encode()?.as_slice())
                        .map_err(storage("write"))?;
                    id
                };
                txn.commit()
                    .map_err(|e| StoreError::medium("native commit", e))?;
                if let ResourceId::Int(n) = id {
                    let mut floor = high_water.lock();
                    *floor = (*floor).max(n);
                }
                Ok(id)
            })
            .await?;
        self.revisions.observe(&id, 1);
        Ok(id)
    }

    async fn read(&self, id: &ResourceId) -> StoreResult<Record> {
        let key = encode_key(id);
        let target = id.clone();
        let doc = self
            .blocking("read", move |db, collection| {
                let txn = db
                    .begin_read()
                    .map_err(|e| StoreError::medium("native begin", e))?;
                let table = txn
                    .open_table(docs(collection))
                    .map_err(|e| StoreError::medium("native open table", e))?;
                match table.get(key.as_slice()).map_err(storage("read"))? {
                    Some(guard) => StoredDoc::decode(guard.value()),
                    None => Err(StoreError::not_found(&target)),
                }
            })
            .await?;
        self.revisions.observe(id, doc.rev);
        Ok(doc.body)
    }

    async fn update(&self, partial: Record, id: &ResourceId) -> StoreResult<Record> {
        let (_, merged) = self
            .rewrite(id, move |existing| Ok(Some(merge(existing, partial))))
            .await?;
        Ok(merged.unwrap_or_default())
    }

    async fn delete(&self, id: &ResourceId) -> StoreResult<Record> {
        let (previous, _) = self.rewrite(id, |_| Ok(None)).await?;
        Ok(previous)
    }

    async fn exists(&self, id: &ResourceId) -> StoreResult<bool> {
        let key = encode_key(id);
        self.blocking("exists", move |db, collection| {
            let txn = db
                .begin_read()
                .map_err(|e| StoreError::medium("native begin", e))?;
            let table = txn
                .open_table(docs(collection))
                .map_err(|e| StoreError::medium("native open table", e))?;
            Ok(table.get(key.as_slice()).map_err(storage("read"))?.is_some())
        })
        .await
    }

    async fn all(&self, page: Option<Page>) -> StoreResult<RecordSet> {
        let docs = self.scan().await?;
        let records = self.observe_all(docs);
        Ok(match page {
            Some(page) => page.apply(records),
            None => records,
        })
    }

    async fn delete_all(&self) -> StoreResult<u64> {
        let removed = self
            .blocking("delete all", |db, collection| {
                let txn = db
                    .begin_write()
                    .map_err(|e| StoreError::medium("native begin", e))?;
                let removed = {
                    let mut table = txn
                        .open_table(docs(collection))
                        .map_err(|e| StoreError::medium("native open table", e))?;
                    let mut keys = Vec::new();
                    for entry in table.iter().map_err(storage("scan"))? {
                        let (key, _) = entry.map_err(storage("scan"))?;
                        keys.push(key.value().to_vec());
                    }
                    for key in &keys {
                        table.remove(key.as_slice()).map_err(storage("delete"))?;
                    }
                    keys.len() as u64
                };
                txn.commit()
                    .map_err(|e| StoreError::medium("native commit", e))?;
                Ok(removed)
            })
            .await?;
        self.revisions.clear();
        Ok(removed)
    }

    async fn count(&self) -> StoreResult<u64> {
        self.blocking("count", |db, collection| {
            let txn = db
                .begin_read()
                .map_err(|e| StoreError::medium("native begin", e))?;
            let table = txn
                .open_table(docs(collection))
                .map_err(|e| StoreError::medium("native open table", e))?;
            table.len().map_err(storage("count"))
        })
        .await
    }

    async fn search(&self, field: &str, value: &Value) -> StoreResult<RecordSet> {
        let docs = self
            .scan()
            .await?
            .into_iter()
            .filter(|(_, doc)| field_matches(&doc.body, field, value))
            .collect();
        Ok(self.observe_all(docs))
    }

    async fn first(&self) -> StoreResult<Option<(ResourceId, Record)>> {
        self.end(false).await
    }

    async fn last(&self) -> StoreResult<Option<(ResourceId, Record)>> {
        self.end(true).await
    }
}

impl NativeDriver {
    async fn end(&self, last: bool) -> StoreResult<Option<(ResourceId, Record)>> {
        let found = self
            .blocking("scan", move |db, collection| {
                let txn = db
                    .begin_read()
                    .map_err(|e| StoreError::medium("native begin", e))?;
                let table = txn
                    .open_table(docs(collection))
                    .map_err(|e| StoreError::medium("native open table", e))?;
                let entry = if last { table.last() } else { table.first() };
                let found = match entry.map_err(storage("scan"))? {
                    Some((key, value)) => Ok(Some((
                        decode_key(key.value())?,
                        StoredDoc::decode(value.value())?,
                    ))),
                    None => Ok(None),
                };
                found
            })
            .await?;
        Ok(found.map(|(id, doc)| {
            self.revisions.observe(&id, doc.rev);
            (id, doc.body)
        }))
    }
}
