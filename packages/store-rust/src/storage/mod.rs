//! Pluggable persistence layer.
//!
//! - [`StorageDriver`]: the uniform transactional CRUD contract
//! - [`buffered`]: emulated transactions for media without native ones
//! - [`drivers`]: the backend implementations
//! - [`Store`]: the closed set of drivers, chosen from a
//!   [`DriverConfig`](crate::config::DriverConfig)

pub mod buffered;
pub mod driver;
pub mod drivers;
pub mod factory;

pub use driver::*;
pub use factory::Store;
