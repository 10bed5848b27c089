//! In-process [`StorageDriver`](crate::storage::StorageDriver) with no durability.
//!
//! Records live in a committed map owned by the store instance; the working
//! set is a staging copy that replaces the committed map on commit. Nothing
//! is shared across store instances or processes, so every new store starts
//! empty. Enumeration follows insertion order.

use async_trait::async_trait;
use parking_lot::Mutex;
use restkit_core::{RecordSet, StoreResult};

use crate::storage::buffered::{BufferedDriver, Medium, WorkingSet};
use crate::storage::driver::DriverKind;

/// Committed side of the memory driver.
#[derive(Default)]
pub struct MemoryMedium {
    committed: Mutex<RecordSet>,
}

impl MemoryMedium {
    /// Number of committed records (ignores the working set).
    #[must_use]
    pub fn committed_len(&self) -> usize {
        self.committed.lock().len()
    }
}

#[async_trait]
impl Medium for MemoryMedium {
    fn kind(&self) -> DriverKind {
        DriverKind::Memory
    }

    async fn load(&self) -> StoreResult<RecordSet> {
        Ok(self.committed.lock().clone())
    }

    async fn persist(&self, working: &WorkingSet) -> StoreResult<()> {
        *self.committed.lock() = working.records().clone();
        Ok(())
    }
}

/// Memory-backed store.
pub type MemoryDriver = BufferedDriver<MemoryMedium>;

impl MemoryDriver {
    /// Creates an empty memory store.
    #[must_use]
    pub fn in_memory() -> Self {
        BufferedDriver::new(MemoryMedium::default())
    }
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::in_memory()
    }
}

#[cfg(test)]
mod tests {
    use restkit_core::{Page, ResourceId, StoreError, Value};

    use super::*;
    use crate::storage::driver::StorageDriver;

    fn dog(name: &str) -> Value {
        [("name", name)].into_iter().collect()
    }

    #[tokio::test]
    async fn spike_to_fido_lifecycle() {
        let store = MemoryDriver::in_memory();
        store.begin().await.unwrap();

        let id = store.create(dog("Spike"), None).await.unwrap();
        assert_eq!(id, ResourceId::Int(1));

        let updated = store.update(dog("Fido"), &id).await.unwrap();
        assert_eq!(updated, dog("Fido"));

        let deleted = store.delete(&id).await.unwrap();
        assert_eq!(deleted, dog("Fido"));
        assert!(!store.exists(&id).await.unwrap());

        store.commit().await.unwrap();
    }

    #[tokio::test]
    async fn ids_count_up_in_creation_order() {
        let store = MemoryDriver::in_memory();
        for expected in 1..=5 {
            let id = store.create(Value::Int(expected), None).await.unwrap();
            assert_eq!(id, ResourceId::Int(expected.try_into().unwrap()));
        }
    }

    #[tokio::test]
    async fn missing_records_are_not_found() {
        let store = MemoryDriver::in_memory();
        let id = ResourceId::Int(9);
        assert!(matches!(store.read(&id).await, Err(StoreError::NotFound { .. })));
        assert!(matches!(
            store.update(dog("x"), &id).await,
            Err(StoreError::NotFound { .. })
        ));
        assert!(matches!(store.delete(&id).await, Err(StoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn round_trip_preserves_arbitrary_shape() {
        let store = MemoryDriver::in_memory();
        let record = Value::Array(vec![Value::Bytes(vec![1, 2]), dog("Rex"), Value::Float(0.5)]);
        let id = store.create(record.clone(), None).await.unwrap();
        assert_eq!(store.read(&id).await.unwrap(), record);
    }

    #[tokio::test]
    async fn uncommitted_changes_stay_out_of_committed_map() {
        let store = MemoryDriver::in_memory();
        store.begin().await.unwrap();
        store.create(dog("Spike"), None).await.unwrap();
        assert_eq!(store.medium().committed_len(), 0);
        store.commit().await.unwrap();
        assert_eq!(store.medium().committed_len(), 1);
    }

    #[tokio::test]
    async fn separate_instances_do_not_share_records() {
        let a = MemoryDriver::in_memory();
        let b = MemoryDriver::in_memory();
        a.create(dog("Spike"), None).await.unwrap();
        a.commit().await.unwrap();
        assert_eq!(b.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn insertion_order_drives_paging_and_ends() {
        let store = MemoryDriver::in_memory();
        for name in ["a", "b", "c", "d", "e"] {
            store.create(dog(name), Some(ResourceId::from(name))).await.unwrap();
        }

        let page = store.all(Some(Page::new(2, 2))).await.unwrap();
        let ids: Vec<String> = page.keys().map(ToString::to_string).collect();
        assert_eq!(ids, vec!["c", "d"]);

        let (first, _) = store.first().await.unwrap().unwrap();
        let (last, _) = store.last().await.unwrap().unwrap();
        assert_eq!(first, ResourceId::from("a"));
        assert_eq!(last, ResourceId::from("e"));
    }

    #[tokio::test]
    async fn search_matches_exact_field_values() {
        let store = MemoryDriver::in_memory();
        store.create(dog("Rex"), None).await.unwrap();
        store.create(dog("Fido"), None).await.unwrap();
        store.create(dog("Rex"), None).await.unwrap();

        let hits = store.search("name", &Value::from("Rex")).await.unwrap();
        let ids: Vec<ResourceId> = hits.into_keys().collect();
        assert_eq!(ids, vec![ResourceId::Int(1), ResourceId::Int(3)]);
        assert!(store.search("name", &Value::from("Re")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_all_reports_count() {
        let store = MemoryDriver::in_memory();
        store.create(dog("a"), None).await.unwrap();
        store.create(dog("b"), None).await.unwrap();
        assert_eq!(store.delete_all().await.unwrap(), 2);
        assert_eq!(store.count().await.unwrap(), 0);
        assert_eq!(store.delete_all().await.unwrap(), 0);
    }
}
