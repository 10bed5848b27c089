//! Emulated transactions for media without native ones.
//!
//! A [`BufferedDriver`] keeps a [`WorkingSet`] (the full record set plus a
//! log of pending changes) loaded from its [`Medium`] at `begin()`. Every
//! mutation lands in the working set only; `commit()` hands the working set
//! to the medium for one bulk write. Reads through the same driver observe
//! the working set.
//!
//! There is no locking across processes: two processes can both `begin()`,
//! mutate, and `commit()`, and the second commit overwrites the first.

use async_trait::async_trait;
use indexmap::IndexMap;
use restkit_core::{
    merge, IdSequence, Page, Record, RecordSet, ResourceId, StoreError, StoreResult, Value,
};
use tokio::sync::{Mutex, MutexGuard};

use super::driver::{field_matches, DriverKind, StorageDriver};

/// Pending change to one record, recorded for media that write per record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    /// Record was created or updated.
    Put,
    /// Record was deleted.
    Delete,
}

/// In-memory image of a store between `begin()` and `commit()`.
#[derive(Debug, Default)]
pub struct WorkingSet {
    records: RecordSet,
    changes: IndexMap<ResourceId, Change>,
    ids: IdSequence,
    dirty: bool,
}

impl WorkingSet {
    /// Builds a clean working set over loaded records (in store order).
    #[must_use]
    pub fn load(records: RecordSet) -> Self {
        let ids = IdSequence::seeded(records.keys());
        Self {
            records,
            changes: IndexMap::new(),
            ids,
            dirty: false,
        }
    }

    /// Records in store order, including uncommitted changes.
    #[must_use]
    pub fn records(&self) -> &RecordSet {
        &self.records
    }

    /// Pending per-record changes since the last commit, in change order.
    #[must_use]
    pub fn changes(&self) -> &IndexMap<ResourceId, Change> {
        &self.changes
    }

    /// Whether anything changed since the last load or commit.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn high_water(&self) -> u64 {
        self.ids.high_water()
    }

    fn mark_committed(&mut self) {
        self.changes.clear();
        self.dirty = false;
    }

    fn next_id(&mut self) -> ResourceId {
        let records = &self.records;
        self.ids.next_id(|candidate| records.contains_key(candidate))
    }

    fn insert_new(&mut self, id: ResourceId, record: Record) -> StoreResult<()> {
        if self.records.contains_key(&id) {
            return Err(StoreError::conflict(&id, "id already exists"));
        }
        self.ids.observe(&id);
        self.records.insert(id.clone(), record);
        self.changes.insert(id, Change::Put);
        self.dirty = true;
        Ok(())
    }

    fn get(&self, id: &ResourceId) -> StoreResult<&Record> {
        self.records.get(id).ok_or_else(|| StoreError::not_found(id))
    }

    fn replace(&mut self, id: &ResourceId, record: Record) {
        self.records.insert(id.clone(), record);
        self.changes.insert(id.clone(), Change::Put);
        self.dirty = true;
    }

    fn remove(&mut self, id: &ResourceId) -> StoreResult<Record> {
        let record = self
            .records
            .shift_remove(id)
            .ok_or_else(|| StoreError::not_found(id))?;
        self.changes.insert(id.clone(), Change::Delete);
        self.dirty = true;
        Ok(record)
    }

    fn clear(&mut self) -> u64 {
        let removed = self.records.len() as u64;
        for id in self.records.keys() {
            self.changes.insert(id.clone(), Change::Delete);
        }
        self.records.clear();
        if removed > 0 {
            self.dirty = true;
        }
        removed
    }
}

/// The durable side of a [`BufferedDriver`].
#[async_trait]
pub trait Medium: Send + Sync {
    /// Which backend this medium belongs to.
    fn kind(&self) -> DriverKind;

    /// Reads every record, in the driver's documented order.
    async fn load(&self) -> StoreResult<RecordSet>;

    /// Writes the working set back. Called only when the set is dirty.
    async fn persist(&self, working: &WorkingSet) -> StoreResult<()>;

    /// Shapes a record before it enters the working set.
    ///
    /// Pass-through by default; schema-bound media force the schema and
    /// stamp the id into the key field.
    fn shape(&self, record: Record, _id: &ResourceId) -> StoreResult<Record> {
        Ok(record)
    }

    /// Id carried inside a record, used when `create` is called without one.
    fn embedded_id(&self, _record: &Record) -> Option<ResourceId> {
        None
    }

    /// Rejects ids the medium cannot represent.
    fn check_id(&self, _id: &ResourceId) -> StoreResult<()> {
        Ok(())
    }

    /// Whether a commit can change the medium's record order, so the working
    /// set must be reloaded to keep matching what a fresh store would see.
    fn reorders_on_commit(&self) -> bool {
        false
    }
}

/// [`StorageDriver`] over a [`Medium`] with write buffering.
pub struct BufferedDriver<M> {
    medium: M,
    state: Mutex<Option<WorkingSet>>,
}

impl<M: Medium> BufferedDriver<M> {
    /// Wraps a medium. Nothing is loaded until the first call.
    pub fn new(medium: M) -> Self {
        Self {
            medium,
            state: Mutex::new(None),
        }
    }

    /// Borrows the underlying medium.
    pub fn medium(&self) -> &M {
        &self.medium
    }

    /// Loads from the medium, keeping the id high-water mark of the previous set.
    async fn reload(&self, previous: Option<&WorkingSet>) -> StoreResult<WorkingSet> {
        let mut working = WorkingSet::load(self.medium.load().await?);
        if let Some(previous) = previous {
            working.ids.raise_high_water(previous.high_water());
        }
        Ok(working)
    }

    /// Locks the state, loading the working set if no transaction is open.
    async fn working(&self) -> StoreResult<MutexGuard<'_, Option<WorkingSet>>> {
        let mut guard = self.state.lock().await;
        if guard.is_none() {
            *guard = Some(self.reload(None).await?);
        }
        Ok(guard)
    }
}

/// Unwraps a guard returned by [`BufferedDriver::working`].
fn loaded<'a>(guard: &'a mut MutexGuard<'_, Option<WorkingSet>>) -> &'a mut WorkingSet {
    guard.get_or_insert_with(WorkingSet::default)
}

#[async_trait]
impl<M: Medium> StorageDriver for BufferedDriver<M> {
    fn kind(&self) -> DriverKind {
        self.medium.kind()
    }

    async fn begin(&self) -> StoreResult<()> {
        let mut guard = self.state.lock().await;
        if guard.as_ref().is_some_and(WorkingSet::is_dirty) {
            tracing::warn!(
                driver = %self.medium.kind(),
                "begin() discards uncommitted changes from a previous transaction"
            );
        }
        let working = self.reload(guard.as_ref()).await?;
        *guard = Some(working);
        Ok(())
    }

    async fn commit(&self) -> StoreResult<()> {
        let mut guard = self.state.lock().await;
        let Some(working) = guard.as_mut() else {
            return Ok(());
        };
        if !working.is_dirty() {
            return Ok(());
        }
        self.medium.persist(working).await?;
        tracing::debug!(
            driver = %self.medium.kind(),
            changes = working.changes().len(),
            records = working.records().len(),
            "committed working set"
        );
        working.mark_committed();
        if self.medium.reorders_on_commit() {
            match self.reload(Some(&*working)).await {
                Ok(reordered) => *working = reordered,
                Err(err) => tracing::warn!(
                    driver = %self.medium.kind(),
                    error = %err,
                    "reload after commit failed; keeping the committed working set"
                ),
            }
        }
        Ok(())
    }

    async fn rollback(&self) -> StoreResult<()> {
        let mut guard = self.state.lock().await;
        let working = self.reload(guard.as_ref()).await?;
        *guard = Some(working);
        Ok(())
    }

    async fn create(&self, record: Record, id: Option<ResourceId>) -> StoreResult<ResourceId> {
        let mut guard = self.working().await?;
        let working = loaded(&mut guard);
        let id = match id.or_else(|| self.medium.embedded_id(&record)) {
            Some(id) => id,
            None => working.next_id(),
        };
        self.medium.check_id(&id)?;
        let record = self.medium.shape(record, &id)?;
        working.insert_new(id.clone(), record)?;
        Ok(id)
    }

    async fn read(&self, id: &ResourceId) -> StoreResult<Record> {
        let mut guard = self.working().await?;
        loaded(&mut guard).get(id).cloned()
    }

    async fn update(&self, partial: Record, id: &ResourceId) -> StoreResult<Record> {
        let mut guard = self.working().await?;
        let working = loaded(&mut guard);
        let existing = working.get(id)?.clone();
        let merged = self.medium.shape(merge(existing, partial), id)?;
        working.replace(id, merged.clone());
        Ok(merged)
    }

    async fn delete(&self, id: &ResourceId) -> StoreResult<Record> {
        let mut guard = self.working().await?;
        loaded(&mut guard).remove(id)
    }

    async fn exists(&self, id: &ResourceId) -> StoreResult<bool> {
        let mut guard = self.working().await?;
        Ok(loaded(&mut guard).records().contains_key(id))
    }

    async fn all(&self, page: Option<Page>) -> StoreResult<RecordSet> {
        let mut guard = self.working().await?;
        let records = loaded(&mut guard).records();
        Ok(match page {
            Some(page) => records
                .iter()
                .skip(page.offset())
                .take(page.limit)
                .map(|(id, record)| (id.clone(), record.clone()))
                .collect(),
            None => records.clone(),
        })
    }

    async fn delete_all(&self) -> StoreResult<u64> {
        let mut guard = self.working().await?;
        Ok(loaded(&mut guard).clear())
    }

    async fn count(&self) -> StoreResult<u64> {
        let mut guard = self.working().await?;
        Ok(loaded(&mut guard).records().len() as u64)
    }

    async fn search(&self, field: &str, value: &Value) -> StoreResult<RecordSet> {
        let mut guard = self.working().await?;
        Ok(loaded(&mut guard)
            .records()
            .iter()
            .filter(|(_, record)| field_matches(record, field, value))
            .map(|(id, record)| (id.clone(), record.clone()))
            .collect())
    }

    async fn first(&self) -> StoreResult<Option<(ResourceId, Record)>> {
        let mut guard = self.working().await?;
        Ok(loaded(&mut guard)
            .records()
            .first()
            .map(|(id, record)| (id.clone(), record.clone())))
    }

    async fn last(&self) -> StoreResult<Option<(ResourceId, Record)>> {
        let mut guard = self.working().await?;
        Ok(loaded(&mut guard)
            .records()
            .last()
            .map(|(id, record)| (id.clone(), record.clone())))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use parking_lot::Mutex as SyncMutex;

    use super::*;

    /// Medium that records how often it was loaded and persisted.
    #[derive(Default)]
    struct CountingMedium {
        durable: SyncMutex<RecordSet>,
        loads: AtomicUsize,
        persists: AtomicUsize,
    }

    #[async_trait]
    impl Medium for Arc<CountingMedium> {
        fn kind(&self) -> DriverKind {
            DriverKind::Memory
        }

        async fn load(&self) -> StoreResult<RecordSet> {
            self.loads.fetch_add(1, Ordering::Relaxed);
            Ok(self.durable.lock().clone())
        }

        async fn persist(&self, working: &WorkingSet) -> StoreResult<()> {
            self.persists.fetch_add(1, Ordering::Relaxed);
            *self.durable.lock() = working.records().clone();
            Ok(())
        }
    }

    fn driver() -> (BufferedDriver<Arc<CountingMedium>>, Arc<CountingMedium>) {
        let medium = Arc::new(CountingMedium::default());
        (BufferedDriver::new(medium.clone()), medium)
    }

    #[tokio::test]
    async fn first_call_loads_lazily() {
        let (driver, medium) = driver();
        assert_eq!(medium.loads.load(Ordering::Relaxed), 0);
        assert_eq!(driver.count().await.unwrap(), 0);
        assert_eq!(medium.loads.load(Ordering::Relaxed), 1);
        driver.count().await.unwrap();
        assert_eq!(medium.loads.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn clean_commit_does_not_persist() {
        let (driver, medium) = driver();
        driver.begin().await.unwrap();
        driver.commit().await.unwrap();
        assert_eq!(medium.persists.load(Ordering::Relaxed), 0);

        driver.create(Value::from("x"), None).await.unwrap();
        driver.commit().await.unwrap();
        driver.commit().await.unwrap();
        assert_eq!(medium.persists.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn rollback_restores_durable_state() {
        let (driver, medium) = driver();
        driver.create(Value::from("kept"), None).await.unwrap();
        driver.commit().await.unwrap();

        driver.begin().await.unwrap();
        driver.delete(&ResourceId::Int(1)).await.unwrap();
        driver.create(Value::from("dropped"), None).await.unwrap();
        driver.rollback().await.unwrap();

        assert_eq!(driver.count().await.unwrap(), 1);
        assert_eq!(driver.read(&ResourceId::Int(1)).await.unwrap(), Value::from("kept"));
        assert_eq!(medium.durable.lock().len(), 1);
    }

    #[tokio::test]
    async fn ids_are_not_reused_after_rollback() {
        let (driver, _medium) = driver();
        let first = driver.create(Value::Null, None).await.unwrap();
        assert_eq!(first, ResourceId::Int(1));
        driver.rollback().await.unwrap();
        let second = driver.create(Value::Null, None).await.unwrap();
        assert_eq!(second, ResourceId::Int(2));
    }

    #[tokio::test]
    async fn explicit_duplicate_id_conflicts() {
        let (driver, _medium) = driver();
        driver.create(Value::Null, Some(ResourceId::from("a"))).await.unwrap();
        let err = driver
            .create(Value::Null, Some(ResourceId::from("a")))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn changes_log_tracks_puts_and_deletes() {
        let (driver, _medium) = driver();
        driver.create(Value::Null, None).await.unwrap();
        driver.create(Value::Null, None).await.unwrap();
        driver.delete(&ResourceId::Int(1)).await.unwrap();

        let guard = driver.state.lock().await;
        let working = guard.as_ref().unwrap();
        assert_eq!(working.changes()[&ResourceId::Int(1)], Change::Delete);
        assert_eq!(working.changes()[&ResourceId::Int(2)], Change::Put);
    }
}
