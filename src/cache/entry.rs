//! Cache Entry Module
//!
//! Defines a single registered operation together with its freshness metadata.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use tokio::time::Instant;

use crate::error::CacheError;

/// Type-erased successful payload of an operation.
pub type Payload = Arc<dyn Any + Send + Sync>;

/// Settled result of an operation, cloned out to every sharing caller.
pub type Outcome = Result<Payload, CacheError>;

/// A registered operation. Cloning yields another handle to the same computation.
pub type Operation = Shared<BoxFuture<'static, Outcome>>;

/// Observable lifecycle state of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Fetcher invoked, awaiting settlement
    Pending,
    /// Settled and still inside its freshness window
    Settled,
    /// Older than its TTL; never served again
    Expired,
}

// == Cache Entry ==
/// One registered operation under a key.
///
/// Entries are immutable once created; replacing an entry means inserting a
/// new one with a higher generation.
#[derive(Clone)]
pub(crate) struct CacheEntry {
    /// Shared handle on the in-flight or settled operation
    pub(crate) operation: Operation,
    /// Registration instant
    pub(crate) created_at: Instant,
    /// Freshness window of this entry
    pub(crate) ttl: Duration,
    /// Monotonic registration number, unique within one cache
    pub(crate) generation: u64,
}

impl CacheEntry {
    // == Constructor ==
    pub(crate) fn new(operation: Operation, ttl: Duration, generation: u64) -> Self {
        Self {
            operation,
            created_at: Instant::now(),
            ttl,
            generation,
        }
    }

    // == Is Fresh ==
    /// True while `now - created_at < ttl`.
    pub(crate) fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) < self.ttl
    }

    // == Is Settled ==
    pub(crate) fn is_settled(&self) -> bool {
        self.operation.peek().is_some()
    }

    // == State ==
    pub(crate) fn state(&self, now: Instant) -> EntryState {
        if !self.is_fresh(now) {
            EntryState::Expired
        } else if self.is_settled() {
            EntryState::Settled
        } else {
            EntryState::Pending
        }
    }

    /// Remaining freshness, zero once expired.
    pub(crate) fn ttl_remaining(&self, now: Instant) -> Duration {
        self.ttl
            .saturating_sub(now.saturating_duration_since(self.created_at))
    }
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("created_at", &self.created_at)
            .field("ttl", &self.ttl)
            .field("generation", &self.generation)
            .field("settled", &self.is_settled())
            .finish()
    }
}
