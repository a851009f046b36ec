//! In-process shared store used by the test suite
//!
//! Implements the same command semantics as the Redis backend, including
//! millisecond TTLs (checked lazily on access) and empty-collection key
//! removal, against a `DashMap`. Suitable for exercising the full
//! coordination stack without a server; not for cross-process sharing.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use dashmap::DashMap;
use rand::seq::IteratorRandom;

use crate::clock::now_ms;
use crate::error::{PhononError, Result};

use super::SharedStore;

#[derive(Debug, Clone)]
enum Value {
    Str(Vec<u8>),
    Hash(HashMap<String, String>),
    Set(HashSet<String>),
    List(Vec<String>),
    ZSet(Vec<(f64, String)>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<i64>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| now_ms() >= at)
    }
}

fn wrong_type() -> PhononError {
    PhononError::Store("WRONGTYPE operation against a key holding the wrong kind of value".into())
}

fn not_an_integer() -> PhononError {
    PhononError::Store("value is not an integer or out of range".into())
}

fn not_a_float() -> PhononError {
    PhononError::Store("value is not a valid float".into())
}

/// Redis index semantics: negative indexes count from the tail; the range is
/// inclusive. Returns `None` for an empty result.
fn normalize_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    let mut start = if start < 0 { len + start } else { start };
    let mut stop = if stop < 0 { len + stop } else { stop };
    start = start.max(0);
    stop = stop.min(len - 1);
    if start > stop || len == 0 {
        return None;
    }
    Some((start as usize, stop as usize))
}

/// In-memory shared store.
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove everything, like FLUSHALL. Test helper.
    pub fn clear(&self) {
        self.entries.clear();
    }

    fn evict_if_expired(&self, key: &str) {
        let expired = self
            .entries
            .get(key)
            .map(|e| e.is_expired())
            .unwrap_or(false);
        if expired {
            self.entries.remove(key);
        }
    }

    fn remove_if_empty(&self, key: &str) {
        let empty = self
            .entries
            .get(key)
            .map(|e| match &e.value {
                Value::Hash(h) => h.is_empty(),
                Value::Set(s) => s.is_empty(),
                Value::List(l) => l.is_empty(),
                Value::ZSet(z) => z.is_empty(),
                Value::Str(_) => false,
            })
            .unwrap_or(false);
        if empty {
            self.entries.remove(key);
        }
    }

    fn read_int(&self, key: &str) -> Result<Option<i64>> {
        self.evict_if_expired(key);
        match self.entries.get(key) {
            None => Ok(None),
            Some(e) => match &e.value {
                Value::Str(raw) => std::str::from_utf8(raw)
                    .ok()
                    .and_then(|s| s.parse::<i64>().ok())
                    .map(Some)
                    .ok_or_else(not_an_integer),
                _ => Err(wrong_type()),
            },
        }
    }

    fn write_int(&self, key: &str, value: i64) {
        let expires_at = self.entries.get(key).and_then(|e| e.expires_at);
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string().into_bytes()),
                expires_at,
            },
        );
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.evict_if_expired(key);
        match self.entries.get(key) {
            None => Ok(None),
            Some(e) => match &e.value {
                Value::Str(raw) => Ok(Some(raw.clone())),
                _ => Err(wrong_type()),
            },
        }
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        // SET discards any existing TTL
        self.entries
            .insert(key.to_string(), Entry::new(Value::Str(value.to_vec())));
        Ok(())
    }

    async fn set_nx_px(&self, key: &str, value: &str, ttl_ms: u64) -> Result<bool> {
        self.evict_if_expired(key);
        if self.entries.contains_key(key) {
            return Ok(false);
        }
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.as_bytes().to_vec()),
                expires_at: Some(now_ms() + ttl_ms as i64),
            },
        );
        Ok(true)
    }

    async fn set_nx(&self, key: &str, value: &str) -> Result<bool> {
        self.evict_if_expired(key);
        if self.entries.contains_key(key) {
            return Ok(false);
        }
        self.entries.insert(
            key.to_string(),
            Entry::new(Value::Str(value.as_bytes().to_vec())),
        );
        Ok(true)
    }

    async fn del(&self, keys: &[&str]) -> Result<u64> {
        let mut removed = 0;
        for key in keys {
            self.evict_if_expired(key);
            if self.entries.remove(*key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn del_if_equals(&self, key: &str, expected: &str) -> Result<bool> {
        self.evict_if_expired(key);
        let matches = match self.entries.get(key) {
            Some(e) => matches!(&e.value, Value::Str(raw) if raw.as_slice() == expected.as_bytes()),
            None => false,
        };
        if matches {
            self.entries.remove(key);
        }
        Ok(matches)
    }

    async fn pexpire(&self, key: &str, ttl_ms: u64) -> Result<bool> {
        self.evict_if_expired(key);
        match self.entries.get_mut(key) {
            Some(mut e) => {
                e.expires_at = Some(now_ms() + ttl_ms as i64);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        self.incr_by(key, 1).await
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        let next = self.read_int(key)?.unwrap_or(0) + delta;
        self.write_int(key, next);
        Ok(next)
    }

    async fn incr_by_float(&self, key: &str, delta: f64) -> Result<f64> {
        self.evict_if_expired(key);
        let current = match self.entries.get(key) {
            None => 0.0,
            Some(e) => match &e.value {
                Value::Str(raw) => std::str::from_utf8(raw)
                    .ok()
                    .and_then(|s| s.parse::<f64>().ok())
                    .ok_or_else(not_a_float)?,
                _ => return Err(wrong_type()),
            },
        };
        let next = current + delta;
        let expires_at = self.entries.get(key).and_then(|e| e.expires_at);
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(next.to_string().into_bytes()),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn decr(&self, key: &str) -> Result<i64> {
        self.incr_by(key, -1).await
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<bool> {
        self.evict_if_expired(key);
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::Hash(HashMap::new())));
        match &mut entry.value {
            Value::Hash(h) => Ok(h.insert(field.to_string(), value.to_string()).is_none()),
            _ => Err(wrong_type()),
        }
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.evict_if_expired(key);
        match self.entries.get(key) {
            None => Ok(None),
            Some(e) => match &e.value {
                Value::Hash(h) => Ok(h.get(field).cloned()),
                _ => Err(wrong_type()),
            },
        }
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        self.evict_if_expired(key);
        match self.entries.get(key) {
            None => Ok(HashMap::new()),
            Some(e) => match &e.value {
                Value::Hash(h) => Ok(h.clone()),
                _ => Err(wrong_type()),
            },
        }
    }

    async fn hdel(&self, key: &str, fields: &[&str]) -> Result<u64> {
        self.evict_if_expired(key);
        let removed = match self.entries.get_mut(key) {
            None => 0,
            Some(mut e) => match &mut e.value {
                Value::Hash(h) => fields.iter().filter(|f| h.remove(**f).is_some()).count(),
                _ => return Err(wrong_type()),
            },
        };
        self.remove_if_empty(key);
        Ok(removed as u64)
    }

    async fn hlen(&self, key: &str) -> Result<u64> {
        self.evict_if_expired(key);
        match self.entries.get(key) {
            None => Ok(0),
            Some(e) => match &e.value {
                Value::Hash(h) => Ok(h.len() as u64),
                _ => Err(wrong_type()),
            },
        }
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        self.evict_if_expired(key);
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::Hash(HashMap::new())));
        match &mut entry.value {
            Value::Hash(h) => {
                let current = match h.get(field) {
                    None => 0,
                    Some(v) => v.parse::<i64>().map_err(|_| not_an_integer())?,
                };
                let next = current + delta;
                h.insert(field.to_string(), next.to_string());
                Ok(next)
            }
            _ => Err(wrong_type()),
        }
    }

    async fn hincr_by_float(&self, key: &str, field: &str, delta: f64) -> Result<f64> {
        self.evict_if_expired(key);
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::Hash(HashMap::new())));
        match &mut entry.value {
            Value::Hash(h) => {
                let current = match h.get(field) {
                    None => 0.0,
                    Some(v) => v.parse::<f64>().map_err(|_| not_a_float())?,
                };
                let next = current + delta;
                h.insert(field.to_string(), next.to_string());
                Ok(next)
            }
            _ => Err(wrong_type()),
        }
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        self.evict_if_expired(key);
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::Set(HashSet::new())));
        match &mut entry.value {
            Value::Set(s) => Ok(s.insert(member.to_string())),
            _ => Err(wrong_type()),
        }
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        self.evict_if_expired(key);
        let removed = match self.entries.get_mut(key) {
            None => false,
            Some(mut e) => match &mut e.value {
                Value::Set(s) => s.remove(member),
                _ => return Err(wrong_type()),
            },
        };
        self.remove_if_empty(key);
        Ok(removed)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        self.evict_if_expired(key);
        match self.entries.get(key) {
            None => Ok(Vec::new()),
            Some(e) => match &e.value {
                Value::Set(s) => Ok(s.iter().cloned().collect()),
                _ => Err(wrong_type()),
            },
        }
    }

    async fn scard(&self, key: &str) -> Result<u64> {
        self.evict_if_expired(key);
        match self.entries.get(key) {
            None => Ok(0),
            Some(e) => match &e.value {
                Value::Set(s) => Ok(s.len() as u64),
                _ => Err(wrong_type()),
            },
        }
    }

    async fn srandmember(&self, key: &str, count: usize) -> Result<Vec<String>> {
        self.evict_if_expired(key);
        match self.entries.get(key) {
            None => Ok(Vec::new()),
            Some(e) => match &e.value {
                Value::Set(s) => {
                    let mut rng = rand::thread_rng();
                    Ok(s.iter().cloned().choose_multiple(&mut rng, count))
                }
                _ => Err(wrong_type()),
            },
        }
    }

    async fn rpush(&self, key: &str, values: &[String]) -> Result<u64> {
        self.evict_if_expired(key);
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::List(Vec::new())));
        match &mut entry.value {
            Value::List(l) => {
                l.extend(values.iter().cloned());
                Ok(l.len() as u64)
            }
            _ => Err(wrong_type()),
        }
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        self.evict_if_expired(key);
        match self.entries.get(key) {
            None => Ok(Vec::new()),
            Some(e) => match &e.value {
                Value::List(l) => Ok(match normalize_range(l.len(), start, stop) {
                    Some((lo, hi)) => l[lo..=hi].to_vec(),
                    None => Vec::new(),
                }),
                _ => Err(wrong_type()),
            },
        }
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<bool> {
        self.evict_if_expired(key);
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::ZSet(Vec::new())));
        match &mut entry.value {
            Value::ZSet(z) => {
                if let Some(existing) = z.iter_mut().find(|(_, m)| m == member) {
                    existing.0 = score;
                    return Ok(false);
                }
                z.push((score, member.to_string()));
                Ok(true)
            }
            _ => Err(wrong_type()),
        }
    }

    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        self.evict_if_expired(key);
        match self.entries.get(key) {
            None => Ok(Vec::new()),
            Some(e) => match &e.value {
                Value::ZSet(z) => {
                    let mut sorted = z.clone();
                    sorted.sort_by(|a, b| {
                        a.0.partial_cmp(&b.0)
                            .unwrap_or(std::cmp::Ordering::Equal)
                            .then_with(|| a.1.cmp(&b.1))
                    });
                    Ok(match normalize_range(sorted.len(), start, stop) {
                        Some((lo, hi)) => sorted[lo..=hi].iter().map(|(_, m)| m.clone()).collect(),
                        None => Vec::new(),
                    })
                }
                _ => Err(wrong_type()),
            },
        }
    }

    async fn zremrangebyrank(&self, key: &str, start: i64, stop: i64) -> Result<u64> {
        self.evict_if_expired(key);
        let removed = match self.entries.get_mut(key) {
            None => 0,
            Some(mut e) => match &mut e.value {
                Value::ZSet(z) => {
                    z.sort_by(|a, b| {
                        a.0.partial_cmp(&b.0)
                            .unwrap_or(std::cmp::Ordering::Equal)
                            .then_with(|| a.1.cmp(&b.1))
                    });
                    match normalize_range(z.len(), start, stop) {
                        Some((lo, hi)) => {
                            z.drain(lo..=hi);
                            (hi - lo + 1) as u64
                        }
                        None => 0,
                    }
                }
                _ => return Err(wrong_type()),
            },
        };
        self.remove_if_empty(key);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_nx_px_expires() {
        let store = MemoryStore::new();
        assert!(store.set_nx_px("k", "v", 10_000).await.unwrap());
        assert!(!store.set_nx_px("k", "w", 10_000).await.unwrap());

        // Force expiry by rewriting the deadline into the past.
        store.entries.get_mut("k").unwrap().expires_at = Some(now_ms() - 1);
        assert!(store.set_nx_px("k", "w", 10_000).await.unwrap());
    }

    #[tokio::test]
    async fn test_del_if_equals_only_matches_owner() {
        let store = MemoryStore::new();
        store.set_nx("k", "me").await.unwrap();
        assert!(!store.del_if_equals("k", "you").await.unwrap());
        assert!(store.del_if_equals("k", "me").await.unwrap());
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_counters() {
        let store = MemoryStore::new();
        assert_eq!(store.incr("n").await.unwrap(), 1);
        assert_eq!(store.incr_by("n", 4).await.unwrap(), 5);
        assert_eq!(store.decr("n").await.unwrap(), 4);
        assert_eq!(store.hincr_by("h", "a", 7).await.unwrap(), 7);
        assert_eq!(store.hincr_by("h", "a", 8).await.unwrap(), 15);
        let total = store.hincr_by_float("h", "b", 1.5).await.unwrap();
        assert!((total - 1.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_empty_collections_drop_their_key() {
        let store = MemoryStore::new();
        store.hset("h", "f", "1").await.unwrap();
        store.hdel("h", &["f"]).await.unwrap();
        assert_eq!(store.hlen("h").await.unwrap(), 0);
        assert!(!store.entries.contains_key("h"));

        store.sadd("s", "m").await.unwrap();
        store.srem("s", "m").await.unwrap();
        assert!(!store.entries.contains_key("s"));
    }

    #[tokio::test]
    async fn test_zset_rank_operations() {
        let store = MemoryStore::new();
        for (score, member) in [(3.0, "c"), (1.0, "a"), (2.0, "b"), (4.0, "d")] {
            store.zadd("z", score, member).await.unwrap();
        }
        assert_eq!(store.zrange("z", 0, -1).await.unwrap(), ["a", "b", "c", "d"]);
        // Keep the two highest-scored members.
        assert_eq!(store.zremrangebyrank("z", 0, -3).await.unwrap(), 2);
        assert_eq!(store.zrange("z", 0, -1).await.unwrap(), ["c", "d"]);
    }
}
