//! Cache Module
//!
//! Keyed request de-duplication with TTL-bounded sharing of in-flight and
//! settled operations.

mod entry;
mod stats;
mod store;


// Re-export public types
pub use entry::{EntryState, Operation, Outcome, Payload};
pub use stats::{CacheStats, StatsRecorder};
pub use store::RequestCache;

// == Public Constants ==
/// Default freshness window of an entry
pub const DEFAULT_TTL: std::time::Duration = std::time::Duration::from_secs(30);
