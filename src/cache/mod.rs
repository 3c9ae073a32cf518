//! Caching of records and aggregate views

pub mod backend;
pub mod coordinator;
pub mod invalidation;
pub mod keys;

pub use backend::{CacheBackend, CacheBackendError, MemoryCache, NoopCache};
pub use coordinator::CacheCoordinator;
pub use invalidation::{CacheInvalidator, Invalidation};
pub use keys::{CacheKey, View};
