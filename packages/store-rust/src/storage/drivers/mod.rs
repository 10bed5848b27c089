//! Backend implementations of [`StorageDriver`](crate::storage::StorageDriver).
//!
//! Memory, File and Delimited-Text buffer writes in a
//! [`WorkingSet`](crate::storage::buffered::WorkingSet) until commit.
//! Relational forwards transactions to the database. The two document
//! stores write through and detect lost updates with revision tokens.

pub mod couch;
pub mod delimited;
pub mod file;
pub mod file_format;
pub mod memory;
pub mod native;
pub mod relational;
pub mod revisions;

pub use couch::CouchDbDriver;
pub use delimited::{DelimitedDriver, DelimitedMedium, Dialect};
pub use file::{FileDriver, FileMedium};
pub use file_format::FileFormat;
pub use memory::{MemoryDriver, MemoryMedium};
pub use native::NativeDriver;
pub use relational::{RelationalDriver, SqlDialect};
pub use revisions::RevisionCache;
