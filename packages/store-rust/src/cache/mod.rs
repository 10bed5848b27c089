//! Conditional-request cache.
//!
//! Tracks a version counter and modification time per resource URI so a
//! service can answer `If-None-Match` / `If-Modified-Since` without
//! fetching the resource. The consumer calls
//! [`ConditionalCache::is_modified`] before a read,
//! [`ConditionalCache::mark_modified`] after every write and
//! [`ConditionalCache::forget`] after a delete.

pub mod entry;
pub mod layer;
pub mod preconditions;

pub use entry::{CacheEntry, EntityTag, ENTRY_FIELDS};
pub use layer::{Clock, ConditionalCache, SystemClock};
pub use preconditions::{http_date, parse_http_date, Preconditions, TagCondition};
