//! Shared-store access layer
//!
//! Every piece of cross-node state lives in a shared key-value store. This
//! module defines the command surface the rest of the crate needs as the
//! [`SharedStore`] trait, with two implementations:
//!
//! - [`RedisStore`]: the production backend over a Redis connection manager
//! - [`MemoryStore`]: an in-process backend with the same semantics,
//!   including millisecond TTLs, used by the test suite
//!
//! Key layout is centralized in [`Keyspace`] so every component names
//! shared-store entries the same way.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::Result;

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

/// Namespaced key layout for all shared-store entries.
///
/// | Purpose | Key |
/// |---|---|
/// | Heartbeat table | `<ns>_heartbeat` |
/// | Per-connection registry | `<ns>_<node-id>` |
/// | Per-resource nodelist | `<ns>_<resource>.nodelist` |
/// | Times modified | `<ns>_<resource>.times_modified` |
/// | Refcount (conflict-free) | `<ns>_<resource>.refcount` |
/// | Lock lease | `<resource>.lock` |
/// | Cached update payload | `<ns>_Update.<collection>.<id>` |
#[derive(Debug, Clone)]
pub struct Keyspace {
    namespace: String,
}

impl Keyspace {
    /// Create a keyspace with the given namespace prefix.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    /// The namespace prefix.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Key of the process-wide heartbeat hash.
    pub fn heartbeat(&self) -> String {
        format!("{}_heartbeat", self.namespace)
    }

    /// Key of a connection's registry set.
    pub fn registry(&self, node_id: &str) -> String {
        format!("{}_{}", self.namespace, node_id)
    }

    /// Key of a resource's nodelist hash.
    pub fn nodelist(&self, resource: &str) -> String {
        format!("{}_{}.nodelist", self.namespace, resource)
    }

    /// Key of a resource's times-modified counter.
    pub fn times_modified(&self, resource: &str) -> String {
        format!("{}_{}.times_modified", self.namespace, resource)
    }

    /// Key of a resource's reference counter (conflict-free path only).
    pub fn refcount(&self, resource: &str) -> String {
        format!("{}_{}.refcount", self.namespace, resource)
    }

    /// Key of a resource's lock lease. Lock keys are not namespaced.
    pub fn lock(&self, resource: &str) -> String {
        format!("{}.lock", resource)
    }

    /// Resource id of a cached update for a collection and primary key.
    pub fn update_resource(&self, collection: &str, id: &str) -> String {
        format!("{}_Update.{}.{}", self.namespace, collection, id)
    }
}

/// The command surface the core needs from the shared store.
///
/// Mirrors the Redis commands the library issues; implementations must keep
/// Redis semantics (e.g. counters parse as integers, `set_nx_px` is atomic,
/// TTLs are milliseconds).
#[async_trait]
pub trait SharedStore: Send + Sync + 'static {
    /// Health check; errors when the store is unreachable.
    async fn ping(&self) -> Result<()>;

    /// GET; `None` when the key is absent.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// SET.
    async fn set(&self, key: &str, value: &[u8]) -> Result<()>;

    /// SET NX PX: set if absent with a millisecond TTL; true when set.
    async fn set_nx_px(&self, key: &str, value: &str, ttl_ms: u64) -> Result<bool>;

    /// SETNX without expiry; true when the key was created.
    async fn set_nx(&self, key: &str, value: &str) -> Result<bool>;

    /// DEL; returns the number of keys removed.
    async fn del(&self, keys: &[&str]) -> Result<u64>;

    /// Atomic compare-and-delete: remove `key` iff its value equals
    /// `expected`. Returns true when the key was deleted.
    async fn del_if_equals(&self, key: &str, expected: &str) -> Result<bool>;

    /// PEXPIRE; true when the key exists and the TTL was set.
    async fn pexpire(&self, key: &str, ttl_ms: u64) -> Result<bool>;

    /// INCR.
    async fn incr(&self, key: &str) -> Result<i64>;

    /// INCRBY.
    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64>;

    /// INCRBYFLOAT.
    async fn incr_by_float(&self, key: &str, delta: f64) -> Result<f64>;

    /// DECR.
    async fn decr(&self, key: &str) -> Result<i64>;

    /// HSET; true when the field is new.
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<bool>;

    /// HGET.
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;

    /// HGETALL; empty map when the key is absent.
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;

    /// HDEL; returns the number of fields removed.
    async fn hdel(&self, key: &str, fields: &[&str]) -> Result<u64>;

    /// HLEN.
    async fn hlen(&self, key: &str) -> Result<u64>;

    /// HINCRBY.
    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64>;

    /// HINCRBYFLOAT.
    async fn hincr_by_float(&self, key: &str, field: &str, delta: f64) -> Result<f64>;

    /// SADD; true when the member is new.
    async fn sadd(&self, key: &str, member: &str) -> Result<bool>;

    /// SREM; true when the member was present.
    async fn srem(&self, key: &str, member: &str) -> Result<bool>;

    /// SMEMBERS.
    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    /// SCARD.
    async fn scard(&self, key: &str) -> Result<u64>;

    /// SRANDMEMBER with a count; distinct members, at most `count`.
    async fn srandmember(&self, key: &str, count: usize) -> Result<Vec<String>>;

    /// RPUSH; returns the list length after the push.
    async fn rpush(&self, key: &str, values: &[String]) -> Result<u64>;

    /// LRANGE with Redis index semantics (negative indexes from the tail).
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>>;

    /// ZADD; true when the member is new.
    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<bool>;

    /// ZRANGE by rank, ascending score.
    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>>;

    /// ZREMRANGEBYRANK; returns the number of members removed.
    async fn zremrangebyrank(&self, key: &str, start: i64, stop: i64) -> Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyspace_layout() {
        let keys = Keyspace::new("phonon");
        assert_eq!(keys.heartbeat(), "phonon_heartbeat");
        assert_eq!(keys.registry("abc"), "phonon_abc");
        assert_eq!(keys.nodelist("foo"), "phonon_foo.nodelist");
        assert_eq!(keys.times_modified("foo"), "phonon_foo.times_modified");
        assert_eq!(keys.refcount("foo"), "phonon_foo.refcount");
        assert_eq!(keys.lock("foo"), "foo.lock");
        assert_eq!(
            keys.update_resource("user", "12345"),
            "phonon_Update.user.12345"
        );
    }
}
