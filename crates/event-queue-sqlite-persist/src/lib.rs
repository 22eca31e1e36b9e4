//! Persistent event queue for the dispatch core.
//!
//! This crate provides:
//! - [`EventQueueStorage`]: the storage contract the queue coordinator drives
//! - [`SqliteEventQueue`]: the SQLite implementation (one row per event plus
//!   one row per pending destination)
//! - Schema migrations tracked in a `migrations` table
//!
//! # Semantics
//!
//! - Storing an id that already exists replaces the item (payload, timestamp
//!   and destination set).
//! - The number of distinct items never exceeds the capacity; the oldest
//!   timestamps are evicted first, for every destination at once.
//! - An item disappears once its last destination releases it.
//! - Events parked by the consent gate live in their own table, outside the
//!   capacity and the destination purge.
//!
//! All calls are synchronous. The coordinator invokes them from its serial
//! execution context, so the implementation does no locking of its own.

mod error;
mod migrations;
mod sqlite;
mod storage;

pub use error::{QueueResult, QueueStorageError};
pub use migrations::{run_migrations, CURRENT_VERSION};
pub use sqlite::{SqliteEventQueue, DEFAULT_CAPACITY};
pub use storage::{EventQueueStorage, StoreReport};
