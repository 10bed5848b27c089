//! Resolves a [`DriverConfig`] into a ready [`Store`].
//!
//! [`Store`] is the closed set of backends. The variant is chosen once, at
//! [`Store::open`]; every contract call then delegates to the concrete
//! driver without further dispatch on configuration.

use async_trait::async_trait;
use restkit_core::{Page, Record, RecordSet, ResourceId, StoreResult, Value};

use crate::config::DriverConfig;
use crate::storage::driver::{DriverKind, StorageDriver};
use crate::storage::drivers::{
    CouchDbDriver, DelimitedDriver, FileDriver, MemoryDriver, NativeDriver, RelationalDriver,
};

/// One configured store: a driver bound to its location.
pub enum Store {
    Memory(MemoryDriver),
    File(FileDriver),
    Delimited(DelimitedDriver),
    Relational(RelationalDriver),
    CouchDb(CouchDbDriver),
    Native(NativeDriver),
}

impl Store {
    /// Validates `config` and opens the selected driver.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidConfiguration`](restkit_core::StoreError::InvalidConfiguration)
    /// for missing or malformed parameters and unusable locations.
    pub async fn open(config: &DriverConfig) -> StoreResult<Self> {
        config.validate()?;
        let store = match config {
            DriverConfig::Memory => Store::Memory(MemoryDriver::in_memory()),
            DriverConfig::File(file) => Store::File(FileDriver::open(file)?),
            DriverConfig::Delimited(delimited) => Store::Delimited(DelimitedDriver::open(delimited)?),
            DriverConfig::Relational(relational) => {
                Store::Relational(RelationalDriver::open(relational).await?)
            }
            DriverConfig::CouchDb(couch) => Store::CouchDb(CouchDbDriver::open(couch).await?),
            DriverConfig::Native(native) => Store::Native(NativeDriver::open(native).await?),
        };
        tracing::debug!(driver = %store.kind(), "store ready");
        Ok(store)
    }

    /// The concrete driver behind this store.
    #[must_use]
    pub fn as_driver(&self) -> &dyn StorageDriver {
        match self {
            Store::Memory(driver) => driver,
            Store::File(driver) => driver,
            Store::Delimited(driver) => driver,
            Store::Relational(driver) => driver,
            Store::CouchDb(driver) => driver,
            Store::Native(driver) => driver,
        }
    }
}

#[async_trait]
impl StorageDriver for Store {
    fn kind(&self) -> DriverKind {
        self.as_driver().kind()
    }

    async fn begin(&self) -> StoreResult<()> {
        self.as_driver().begin().await
    }

    async fn commit(&self) -> StoreResult<()> {
        self.as_driver().commit().await
    }

    async fn rollback(&self) -> StoreResult<()> {
        self.as_driver().rollback().await
    }

    async fn create(&self, record: Record, id: Option<ResourceId>) -> StoreResult<ResourceId> {
        self.as_driver().create(record, id).await
    }

    async fn read(&self, id: &ResourceId) -> StoreResult<Record> {
        self.as_driver().read(id).await
    }

    async fn update(&self, partial: Record, id: &ResourceId) -> StoreResult<Record> {
        self.as_driver().update(partial, id).await
    }

    async fn delete(&self, id: &ResourceId) -> StoreResult<Record> {
        self.as_driver().delete(id).await
    }

    async fn exists(&self, id: &ResourceId) -> StoreResult<bool> {
        self.as_driver().exists(id).await
    }

    async fn all(&self, page: Option<Page>) -> StoreResult<RecordSet> {
        self.as_driver().all(page).await
    }

    async fn delete_all(&self) -> StoreResult<u64> {
        self.as_driver().delete_all().await
    }

    async fn count(&self) -> StoreResult<u64> {
        self.as_driver().count().await
    }

    async fn search(&self, field: &str, value: &Value) -> StoreResult<RecordSet> {
        self.as_driver().search(field, value).await
    }

    async fn first(&self) -> StoreResult<Option<(ResourceId, Record)>> {
        self.as_driver().first().await
    }

    async fn last(&self) -> StoreResult<Option<(ResourceId, Record)>> {
        self.as_driver().last().await
    }
}

#[cfg(test)]
mod tests {
    use restkit_core::{ErrorKind, StoreError};

    use super::*;
    use crate::config::{DelimitedConfig, FileConfig, NativeConfig, RelationalConfig};
    use crate::storage::drivers::FileFormat;

    fn dog(name: &str) -> Value {
        [("name", name)].into_iter().collect()
    }

    /// Drives one store through a full begin/commit lifecycle.
    async fn lifecycle(store: &Store) {
        store.begin().await.unwrap();
        let id = store.create(dog("Spike"), None).await.unwrap();
        assert!(store.exists(&id).await.unwrap());
        let updated = store.update(dog("Fido"), &id).await.unwrap();
        assert_eq!(updated.get("name"), Some(&Value::from("Fido")));
        let deleted = store.delete(&id).await.unwrap();
        assert_eq!(deleted.get("name"), Some(&Value::from("Fido")));
        assert!(!store.exists(&id).await.unwrap());
        store.commit().await.unwrap();
    }

    #[tokio::test]
    async fn every_local_driver_honours_the_contract() {
        let dir = tempfile::tempdir().unwrap();
        let mut delimited = DelimitedConfig::new(dir.path().join("dogs.csv"));
        delimited.columns = Some(vec!["id".into(), "name".into()]);
        let configs = vec![
            DriverConfig::Memory,
            DriverConfig::File(FileConfig {
                path: dir.path().join("files"),
                format: FileFormat::Json,
            }),
            DriverConfig::Delimited(delimited),
            DriverConfig::Native(NativeConfig {
                path: dir.path().join("docs.redb"),
                collection: "dogs".to_string(),
            }),
        ];
        for config in &configs {
            let store = Store::open(config).await.unwrap();
            lifecycle(&store).await;
            assert_eq!(store.count().await.unwrap(), 0, "{}", store.kind());
        }
    }

    #[tokio::test]
    async fn relational_store_opens_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("dogs.db").display());
        {
            use sqlx::Connection;
            sqlx::any::install_default_drivers();
            let mut conn = sqlx::AnyConnection::connect(&url).await.unwrap();
            sqlx::raw_sql("CREATE TABLE dogs (id INTEGER PRIMARY KEY, name TEXT)")
                .execute(&mut conn)
                .await
                .unwrap();
            conn.close().await.unwrap();
        }
        let store = Store::open(&DriverConfig::Relational(RelationalConfig {
            url,
            table: "dogs".to_string(),
            primary_key: "id".to_string(),
        }))
        .await
        .unwrap();
        assert_eq!(store.kind(), DriverKind::Relational);
        lifecycle(&store).await;
    }

    #[tokio::test]
    async fn invalid_parameters_fail_at_open() {
        let err = Store::open(&DriverConfig::Relational(RelationalConfig {
            url: String::new(),
            table: "dogs".to_string(),
            primary_key: "id".to_string(),
        }))
        .await
        .err()
        .unwrap();
        assert!(matches!(err, StoreError::InvalidConfiguration(_)));
        assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);
    }

    #[tokio::test]
    async fn kind_reports_the_variant() {
        let store = Store::open(&DriverConfig::Memory).await.unwrap();
        assert_eq!(store.kind(), DriverKind::Memory);
        assert!(store.kind().buffers_writes());
    }
}
