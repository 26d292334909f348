//! Background Tasks Module
//!
//! # Tasks
//! - Expiry cleanup: purges expired request cache entries at configured intervals

mod cleanup;

pub use cleanup::spawn_cleanup_task;
