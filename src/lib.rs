//! Request Cache - keyed request de-duplication for async data stores
//!
//! Concurrent or rapidly repeated fetches for the same key share one
//! operation for a TTL window; failures are never cached.

pub mod cache;
pub mod config;
pub mod error;
pub mod keys;
pub mod resource;
pub mod tasks;

pub use cache::{CacheStats, RequestCache};
pub use config::Config;
pub use error::{CacheError, Result};
pub use resource::CachedResource;
pub use tasks::spawn_cleanup_task;
