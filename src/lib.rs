//! # Phonon - Distributed Write Coalescing
//!
//! A library for coordinating database write-out across many producer nodes
//! that observe events updating the same logical records. Writing every event
//! to the database is prohibitive; writing from one node loses updates from
//! its peers. Phonon tracks which nodes hold a reference to each resource,
//! aggregates local deltas into per-resource sessions, caches intermediate
//! state in a shared Redis store, and executes exactly one final write when
//! the last reference drops.
//!
//! ## Architecture
//!
//! - `store`: the shared-store abstraction (Redis-backed in production,
//!   in-memory for tests)
//! - `connection`: node identity, heartbeat loop, registry, failure recovery
//! - `lock`: lease-based scoped mutual exclusion over a store key
//! - `nodelist`: per-resource membership with session timestamps
//! - `reference`: per-resource handle combining refcount, nodelist and
//!   dereference lifecycle
//! - `update`: write-through aggregation sessions (pessimistic and
//!   conflict-free strategies)
//! - `cache`: bounded local LRU that owns update lifetimes and drives expiry
//! - `fields` / `model`: declarative typed aggregation fields routed through
//!   the conflict-free path

#![warn(missing_docs)]
#![warn(clippy::all)]

// Shared store access
pub mod store;

// Connection, heartbeat and failure recovery
pub mod connection;

// Lease locks
pub mod lock;

// Per-resource membership
pub mod nodelist;

// Reference lifecycle
pub mod reference;

// Aggregation sessions
pub mod update;

// Local LRU with expiry pipeline
pub mod cache;

// Declarative field model
pub mod fields;
pub mod model;

// Configuration
pub mod config;

// Error types
pub mod error;

mod clock;

// Re-export commonly used types
pub use cache::{Expirable, LruCache, SetOutcome};
pub use config::ConnectionConfig;
pub use connection::{Connection, ConnectionEvent};
pub use error::{PhononError, Result};
pub use lock::{Acquisition, Lock, LockGuard, LockOptions};
pub use reference::{Counting, Reference};
pub use store::{Keyspace, MemoryStore, RedisStore, SharedStore};
pub use update::{
    Aggregate, ConflictFreeUpdate, CounterDoc, CounterValue, Sink, Update, UpdateMeta,
    UpdateOptions,
};

/// Re-export version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Default namespace prefix for all shared-store keys
pub const DEFAULT_NAMESPACE: &str = "phonon";
