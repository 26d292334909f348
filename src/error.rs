//! Error types for the request cache
//!
//! Provides unified error handling using thiserror.

use std::error::Error as StdError;
use std::sync::Arc;

use thiserror::Error;

/// Shared, type-erased fetcher failure.
///
/// Every caller that shares one operation receives a clone of the same `Arc`.
pub type FetchFailure = Arc<dyn StdError + Send + Sync + 'static>;

// == Cache Error Enum ==
/// Unified error type for the request cache.
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    /// The fetcher rejected; the failure is passed through unchanged
    #[error("fetch for '{key}' failed: {source}")]
    Fetch {
        key: String,
        #[source]
        source: FetchFailure,
    },

    /// The key is registered with a payload of another type
    #[error("cached value for '{key}' is not a {expected}")]
    TypeMismatch { key: String, expected: &'static str },

    /// The fetcher panicked or its task was cancelled
    #[error("fetch for '{key}' aborted: {reason}")]
    Aborted { key: String, reason: String },
}

impl CacheError {
    /// Key of the operation that produced this error.
    pub fn key(&self) -> &str {
        match self {
            CacheError::Fetch { key, .. }
            | CacheError::TypeMismatch { key, .. }
            | CacheError::Aborted { key, .. } => key,
        }
    }

    /// Returns the fetcher's own error if it is of type `E`.
    pub fn fetch_error<E: StdError + 'static>(&self) -> Option<&E> {
        match self {
            CacheError::Fetch { source, .. } => source.downcast_ref::<E>(),
            _ => None,
        }
    }
}

// == Result Type Alias ==
/// Convenience Result type for the request cache.
pub type Result<T> = std::result::Result<T, CacheError>;
