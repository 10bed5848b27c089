//! restkit core: record model, schema coercion, identifier sequencing,
//! tagged value codec, entity-tag hashing, and the storage error taxonomy.

pub mod codec;
pub mod error;
pub mod hash;
pub mod id;
pub mod schema;
pub mod types;

pub use error::{ErrorKind, StoreError, StoreResult};
pub use id::IdSequence;
pub use schema::{merge, PassThrough, RecordCoercion, Schema};
pub use types::{FieldMap, Page, Record, RecordSet, ResourceId, Value};
