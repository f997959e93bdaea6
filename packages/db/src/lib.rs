//! Storage for the job queue.
//!
//! [`JobStore`] is the ordered-collection contract the rest of the system
//! talks to. Two backends implement it:
//!
//! - [`MemoryStore`]: in-process, for tests and ephemeral queues
//! - [`SurrealStore`]: SurrealDB, in memory (`mem://`) or on disk (`rocksdb://`)
//!
//! # Features
//!
//! - `memory` (default): SurrealDB in-memory engine
//! - `rocksdb`: SurrealDB RocksDB engine for persistent file-based storage

mod connection;
mod memory;
mod schema;
mod store;
mod surreal;

pub use connection::{Database, DbConfig, DbError, open};
pub use memory::MemoryStore;
pub use schema::init_schema;
pub use store::{Claim, JobStore, StoreResult, lease_deadline};
pub use surreal::SurrealStore;
