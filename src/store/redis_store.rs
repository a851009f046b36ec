//! Redis-backed shared store

use std::collections::HashMap;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use redis::aio::ConnectionManager;
use redis::Script;

use crate::error::Result;

use super::SharedStore;

// Owner-checked release: delete the key only while it still holds the
// caller's value. GET+DEL from the client would race the lease expiring
// and another owner acquiring in between.
static DEL_IF_EQUALS: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        if redis.call('GET', KEYS[1]) == ARGV[1] then
            return redis.call('DEL', KEYS[1])
        else
            return 0
        end
        "#,
    )
});

/// Shared store backed by a Redis connection manager.
///
/// The connection manager transparently reconnects on transport errors, so a
/// `RedisStore` can be cloned freely and held for the process lifetime.
#[derive(Clone)]
pub struct RedisStore {
    manager: ConnectionManager,
}

impl RedisStore {
    /// Connect to a Redis server.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self { manager })
    }

    /// Wrap an existing connection manager.
    pub fn from_manager(manager: ConnectionManager) -> Self {
        Self { manager }
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn();
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn();
        Ok(redis::cmd("GET").arg(key).query_async(&mut conn).await?)
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut conn = self.conn();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_nx_px(&self, key: &str, value: &str, ttl_ms: u64) -> Result<bool> {
        let mut conn = self.conn();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn set_nx(&self, key: &str, value: &str) -> Result<bool> {
        let mut conn = self.conn();
        let created: i64 = redis::cmd("SETNX")
            .arg(key)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(created == 1)
    }

    async fn del(&self, keys: &[&str]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn();
        Ok(redis::cmd("DEL").arg(keys).query_async(&mut conn).await?)
    }

    async fn del_if_equals(&self, key: &str, expected: &str) -> Result<bool> {
        let mut conn = self.conn();
        let removed: i64 = DEL_IF_EQUALS
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    async fn pexpire(&self, key: &str, ttl_ms: u64) -> Result<bool> {
        let mut conn = self.conn();
        let set: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(set == 1)
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn();
        Ok(redis::cmd("INCR").arg(key).query_async(&mut conn).await?)
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        let mut conn = self.conn();
        Ok(redis::cmd("INCRBY")
            .arg(key)
            .arg(delta)
            .query_async(&mut conn)
            .await?)
    }

    async fn incr_by_float(&self, key: &str, delta: f64) -> Result<f64> {
        let mut conn = self.conn();
        Ok(redis::cmd("INCRBYFLOAT")
            .arg(key)
            .arg(delta)
            .query_async(&mut conn)
            .await?)
    }

    async fn decr(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn();
        Ok(redis::cmd("DECR").arg(key).query_async(&mut conn).await?)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<bool> {
        let mut conn = self.conn();
        let new: i64 = redis::cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(new == 1)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.conn();
        Ok(redis::cmd("HGET")
            .arg(key)
            .arg(field)
            .query_async(&mut conn)
            .await?)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.conn();
        Ok(redis::cmd("HGETALL").arg(key).query_async(&mut conn).await?)
    }

    async fn hdel(&self, key: &str, fields: &[&str]) -> Result<u64> {
        if fields.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn();
        Ok(redis::cmd("HDEL")
            .arg(key)
            .arg(fields)
            .query_async(&mut conn)
            .await?)
    }

    async fn hlen(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn();
        Ok(redis::cmd("HLEN").arg(key).query_async(&mut conn).await?)
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let mut conn = self.conn();
        Ok(redis::cmd("HINCRBY")
            .arg(key)
            .arg(field)
            .arg(delta)
            .query_async(&mut conn)
            .await?)
    }

    async fn hincr_by_float(&self, key: &str, field: &str, delta: f64) -> Result<f64> {
        let mut conn = self.conn();
        Ok(redis::cmd("HINCRBYFLOAT")
            .arg(key)
            .arg(field)
            .arg(delta)
            .query_async(&mut conn)
            .await?)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn();
        let added: i64 = redis::cmd("SADD")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(added == 1)
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn();
        let removed: i64 = redis::cmd("SREM")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn();
        Ok(redis::cmd("SMEMBERS").arg(key).query_async(&mut conn).await?)
    }

    async fn scard(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn();
        Ok(redis::cmd("SCARD").arg(key).query_async(&mut conn).await?)
    }

    async fn srandmember(&self, key: &str, count: usize) -> Result<Vec<String>> {
        let mut conn = self.conn();
        Ok(redis::cmd("SRANDMEMBER")
            .arg(key)
            .arg(count)
            .query_async(&mut conn)
            .await?)
    }

    async fn rpush(&self, key: &str, values: &[String]) -> Result<u64> {
        if values.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn();
        Ok(redis::cmd("RPUSH")
            .arg(key)
            .arg(values)
            .query_async(&mut conn)
            .await?)
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let mut conn = self.conn();
        Ok(redis::cmd("LRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async(&mut conn)
            .await?)
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<bool> {
        let mut conn = self.conn();
        let added: i64 = redis::cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(added == 1)
    }

    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let mut conn = self.conn();
        Ok(redis::cmd("ZRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async(&mut conn)
            .await?)
    }

    async fn zremrangebyrank(&self, key: &str, start: i64, stop: i64) -> Result<u64> {
        let mut conn = self.conn();
        Ok(redis::cmd("ZREMRANGEBYRANK")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async(&mut conn)
            .await?)
    }
}
