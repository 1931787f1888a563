//! Storage layer: durable SQLite store plus the advisory hot cache.
//!
//! The durable store is the source of truth for every entity, state and
//! ledger row; the cache only accelerates reads and is never the sole
//! writer.

pub mod cache;
pub mod db;

pub use cache::HotCache;
pub use db::{CoreDb, DbHandle};
