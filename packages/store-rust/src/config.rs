//! Store configuration types.
//!
//! A [`DriverConfig`] names one driver plus the parameters it requires; a
//! [`ToolkitConfig`] groups named stores and the cache's metadata store and
//! is loaded from TOML or JSON.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use restkit_core::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};

use crate::storage::drivers::FileFormat;

fn default_primary_key() -> String {
    "id".to_string()
}

fn default_delimiter() -> char {
    ','
}

fn default_enclosure() -> char {
    '"'
}

/// Driver selection plus driver-specific parameters.
///
/// Deserialized from a table tagged by `driver`; unknown driver names fail
/// at parse time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "driver", rename_all = "snake_case")]
pub enum DriverConfig {
    /// In-process store.
    Memory,
    /// One file per record.
    File(FileConfig),
    /// Delimited-text table file.
    Delimited(DelimitedConfig),
    /// Relational table.
    Relational(RelationalConfig),
    /// `CouchDB`-protocol document database.
    #[serde(rename = "couchdb")]
    CouchDb(CouchDbConfig),
    /// Embedded redb document database.
    Native(NativeConfig),
}

impl DriverConfig {
    /// Checks required parameters without touching the medium.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidConfiguration`] naming the first problem found.
    pub fn validate(&self) -> StoreResult<()> {
        match self {
            DriverConfig::Memory => Ok(()),
            DriverConfig::File(config) => require_path("file", &config.path),
            DriverConfig::Delimited(config) => config.validate(),
            DriverConfig::Relational(config) => {
                require("relational", "url", &config.url)?;
                require("relational", "table", &config.table)?;
                require("relational", "primary_key", &config.primary_key)
            }
            DriverConfig::CouchDb(config) => {
                require("couchdb", "base_url", &config.base_url)?;
                require("couchdb", "database", &config.database)?;
                if config.password.is_some() && config.username.is_none() {
                    return Err(StoreError::InvalidConfiguration(
                        "couchdb: password given without username".to_string(),
                    ));
                }
                Ok(())
            }
            DriverConfig::Native(config) => {
                require_path("native", &config.path)?;
                require("native", "collection", &config.collection)
            }
        }
    }
}

fn require(driver: &str, field: &str, value: &str) -> StoreResult<()> {
    if value.trim().is_empty() {
        return Err(StoreError::InvalidConfiguration(format!(
            "{driver}: `{field}` is required"
        )));
    }
    Ok(())
}

fn require_path(driver: &str, path: &Path) -> StoreResult<()> {
    if path.as_os_str().is_empty() {
        return Err(StoreError::InvalidConfiguration(format!(
            "{driver}: `path` is required"
        )));
    }
    Ok(())
}

/// Parameters for the one-file-per-record driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileConfig {
    /// Store root directory. Created when missing.
    pub path: PathBuf,
    /// Serialization format of each record file.
    #[serde(default)]
    pub format: FileFormat,
}

/// Parameters for the delimited-text driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelimitedConfig {
    /// Table file.
    pub path: PathBuf,
    /// Column list used to create a missing file and checked against an existing header.
    #[serde(default)]
    pub columns: Option<Vec<String>>,
    /// Column holding the record id.
    #[serde(default = "default_primary_key")]
    pub primary_key: String,
    /// Cell separator.
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    /// Quote character around cells.
    #[serde(default = "default_enclosure")]
    pub enclosure: char,
}

impl DelimitedConfig {
    /// Config for a comma-separated file with default quoting.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            columns: None,
            primary_key: default_primary_key(),
            delimiter: default_delimiter(),
            enclosure: default_enclosure(),
        }
    }

    fn validate(&self) -> StoreResult<()> {
        require_path("delimited", &self.path)?;
        require("delimited", "primary_key", &self.primary_key)?;
        if self.delimiter == self.enclosure {
            return Err(StoreError::InvalidConfiguration(
                "delimited: delimiter and enclosure must differ".to_string(),
            ));
        }
        if matches!(self.delimiter, '\n' | '\r') || matches!(self.enclosure, '\n' | '\r') {
            return Err(StoreError::InvalidConfiguration(
                "delimited: line breaks cannot delimit or enclose cells".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parameters for the relational driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationalConfig {
    /// Connection URL; the scheme selects the dialect (`sqlite:` or `postgres:`).
    pub url: String,
    /// Table holding the records.
    pub table: String,
    /// Primary-key column.
    #[serde(default = "default_primary_key")]
    pub primary_key: String,
}

/// Parameters for the `CouchDB`-protocol driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CouchDbConfig {
    /// Server base URL, e.g. `http://localhost:5984`.
    pub base_url: String,
    /// Database name.
    pub database: String,
    /// Basic-auth user.
    #[serde(default)]
    pub username: Option<String>,
    /// Basic-auth password.
    #[serde(default)]
    pub password: Option<String>,
    /// Create the database on open when it does not exist.
    #[serde(default)]
    pub create_database: bool,
}

/// Parameters for the embedded document driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NativeConfig {
    /// Database file. Created when missing.
    pub path: PathBuf,
    /// Collection (table) name.
    pub collection: String,
}

/// Named stores plus the cache metadata store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolkitConfig {
    /// Stores by name.
    #[serde(default)]
    pub stores: BTreeMap<String, DriverConfig>,
    /// Metadata store for the conditional-request cache.
    #[serde(default)]
    pub cache: Option<DriverConfig>,
}

impl ToolkitConfig {
    /// Parses TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidConfiguration`] on syntax errors, unknown
    /// drivers, missing parameters, or failed validation.
    pub fn from_toml_str(text: &str) -> StoreResult<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|e| StoreError::InvalidConfiguration(e.message().to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parses JSON text.
    ///
    /// # Errors
    ///
    /// Same as [`ToolkitConfig::from_toml_str`].
    pub fn from_json_str(text: &str) -> StoreResult<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| StoreError::InvalidConfiguration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a config file, choosing the syntax by extension (`.json`, else TOML).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidConfiguration`] if the file cannot be
    /// read or parsed.
    pub fn load(path: &Path) -> StoreResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            StoreError::InvalidConfiguration(format!("cannot read {}: {e}", path.display()))
        })?;
        if path.extension().is_some_and(|ext| ext == "json") {
            Self::from_json_str(&text)
        } else {
            Self::from_toml_str(&text)
        }
    }

    /// Validates every configured store.
    ///
    /// # Errors
    ///
    /// Returns the first validation failure, prefixed with the store name.
    pub fn validate(&self) -> StoreResult<()> {
        for (name, store) in &self.stores {
            store.validate().map_err(|e| match e {
                StoreError::InvalidConfiguration(msg) => {
                    StoreError::InvalidConfiguration(format!("store `{name}`: {msg}"))
                }
                other => other,
            })?;
        }
        if let Some(cache) = &self.cache {
            cache.validate()?;
        }
        Ok(())
    }

    /// Looks up a named store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidConfiguration`] if no store has that name.
    pub fn store(&self, name: &str) -> StoreResult<&DriverConfig> {
        self.stores.get(name).ok_or_else(|| {
            StoreError::InvalidConfiguration(format!("no store named `{name}` is configured"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [stores.dogs]
        driver = "file"
        path = "/var/lib/restkit/dogs"
        format = "msgpack"

        [stores.people]
        driver = "delimited"
        path = "people.csv"
        columns = ["id", "name", "age"]
        delimiter = ";"

        [stores.orders]
        driver = "relational"
        url = "sqlite://orders.db"
        table = "orders"

        [cache]
        driver = "memory"
    "#;

    #[test]
    fn parses_toml_with_defaults() {
        let config = ToolkitConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.stores.len(), 3);
        assert_eq!(
            config.store("dogs").unwrap(),
            &DriverConfig::File(FileConfig {
                path: PathBuf::from("/var/lib/restkit/dogs"),
                format: FileFormat::MsgPack,
            })
        );
        let DriverConfig::Delimited(people) = config.store("people").unwrap() else {
            panic!("expected delimited config");
        };
        assert_eq!(people.delimiter, ';');
        assert_eq!(people.enclosure, '"');
        assert_eq!(people.primary_key, "id");
        assert_eq!(config.cache, Some(DriverConfig::Memory));
    }

    #[test]
    fn unknown_driver_fails_fast() {
        let err = ToolkitConfig::from_toml_str(
            r#"
            [stores.x]
            driver = "mongo"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::InvalidConfiguration(_)));
    }

    #[test]
    fn missing_parameter_fails_fast() {
        let err = ToolkitConfig::from_json_str(
            r#"{"stores": {"x": {"driver": "relational", "url": "sqlite::memory:"}}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::InvalidConfiguration(_)));
    }

    #[test]
    fn empty_parameter_is_rejected_with_store_name() {
        let err = ToolkitConfig::from_json_str(
            r#"{"stores": {"x": {"driver": "native", "path": "db.redb", "collection": " "}}}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("store `x`"));
    }

    #[test]
    fn delimiter_equal_to_enclosure_is_rejected() {
        let mut config = DelimitedConfig::new("t.csv");
        config.enclosure = ',';
        assert!(DriverConfig::Delimited(config).validate().is_err());
    }

    #[test]
    fn unknown_store_lookup_fails() {
        let config = ToolkitConfig::default();
        assert!(matches!(
            config.store("nope"),
            Err(StoreError::InvalidConfiguration(_))
        ));
    }
}
