//! Bounded local LRU that owns update lifetimes
//!
//! The cache is the usual place update sessions live between events: setting
//! a key that already exists merges the incoming update into the resident
//! one, and eviction ends the victim's session, which is what ultimately
//! caches or executes it. Recency ordering comes from the `lru` crate; what
//! this wrapper adds is the expiry pipeline.
//!
//! Expiry runs inline by default. In async mode victims are handed to a
//! single worker over a bounded queue; a victim whose `end_session` fails is
//! retained as the last failure and the worker moves on.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::error;

use crate::error::{PhononError, Result};

/// A cache entry with a session lifecycle.
///
/// Implemented by [`Update`](crate::Update) and
/// [`ConflictFreeUpdate`](crate::ConflictFreeUpdate).
#[async_trait]
pub trait Expirable: Send + 'static {
    /// End this entry's session (cache or execute as appropriate).
    async fn end_session(&mut self) -> Result<()>;

    /// Whether the entry passed its soft or hard deadline.
    fn is_expired(&self) -> bool;

    /// Whether the entry passed its hard deadline.
    fn is_hard_expired(&self) -> bool;

    /// Absorb another entry for the same key and slide the soft deadline.
    async fn refresh(&mut self, other: Self) -> Result<()>
    where
        Self: Sized;
}

/// Outcome of a [`LruCache::set`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    /// The key was new (or the cache evicted its oldest entry to make room).
    Inserted,
    /// The incoming entry was merged into the resident one.
    Merged,
    /// The resident entry was past its hard deadline; its session was ended
    /// and the incoming entry took its slot.
    ReplacedByExpiry,
}

/// Bounded map with newest-wins ordering and session-ending eviction.
pub struct LruCache<V: Expirable> {
    entries: lru::LruCache<String, V>,
    max_entries: usize,
    last_failed: Arc<Mutex<Option<V>>>,
    expiry_tx: Option<mpsc::Sender<V>>,
    worker: Option<JoinHandle<()>>,
}

impl<V: Expirable> LruCache<V> {
    /// A cache that ends sessions inline on the calling task.
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: lru::LruCache::unbounded(),
            max_entries: max_entries.max(1),
            last_failed: Arc::new(Mutex::new(None)),
            expiry_tx: None,
            worker: None,
        }
    }

    /// A cache that hands expiry victims to a dedicated worker over a
    /// bounded queue.
    pub fn with_async_expiry(max_entries: usize, queue_depth: usize) -> Self {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let last_failed = Arc::new(Mutex::new(None));
        let worker = spawn_expiry_worker(rx, Arc::clone(&last_failed));
        Self {
            entries: lru::LruCache::unbounded(),
            max_entries: max_entries.max(1),
            last_failed,
            expiry_tx: Some(tx),
            worker: Some(worker),
        }
    }

    /// Number of entries currently held.
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    /// Maximum number of entries.
    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Take the most recent entry whose `end_session` failed, if any.
    pub fn take_last_failed(&self) -> Option<V> {
        self.last_failed.lock().take()
    }

    /// Insert or merge an entry.
    ///
    /// An existing entry past its hard deadline is expired and the incoming
    /// entry takes its place. An existing live entry absorbs the incoming
    /// one via [`Expirable::refresh`]. Inserting into a full cache expires
    /// the oldest entry first. The touched key becomes the newest.
    pub async fn set(&mut self, key: &str, val: V) -> Result<SetOutcome> {
        match self.entries.peek(key).map(Expirable::is_hard_expired) {
            Some(true) => {
                self.expire(key).await?;
                self.entries.put(key.to_string(), val);
                Ok(SetOutcome::ReplacedByExpiry)
            }
            Some(false) => {
                // get_mut promotes the resident entry to newest
                if let Some(resident) = self.entries.get_mut(key) {
                    resident.refresh(val).await?;
                }
                Ok(SetOutcome::Merged)
            }
            None => {
                if self.entries.len() >= self.max_entries {
                    self.expire_oldest().await?;
                }
                self.entries.put(key.to_string(), val);
                Ok(SetOutcome::Inserted)
            }
        }
    }

    /// Fetch an entry, marking it newest. An expired entry is ended and
    /// reported as absent.
    pub async fn get(&mut self, key: &str) -> Result<Option<&mut V>> {
        let expired = match self.entries.peek(key) {
            None => return Ok(None),
            Some(entry) => entry.is_expired(),
        };
        if expired {
            self.expire(key).await?;
            return Ok(None);
        }
        Ok(self.entries.get_mut(key))
    }

    /// Remove an entry and end its session (inline or via the worker).
    pub async fn expire(&mut self, key: &str) -> Result<()> {
        let Some(mut victim) = self.entries.pop(key) else {
            return Ok(());
        };
        match &self.expiry_tx {
            Some(tx) => tx
                .send(victim)
                .await
                .map_err(|_| PhononError::ExpiryQueueClosed),
            None => {
                if let Err(e) = victim.end_session().await {
                    *self.last_failed.lock() = Some(victim);
                    return Err(e);
                }
                Ok(())
            }
        }
    }

    /// Expire the least recently touched entry.
    pub async fn expire_oldest(&mut self) -> Result<()> {
        let Some((key, _)) = self.entries.peek_lru() else {
            return Ok(());
        };
        let key = key.clone();
        self.expire(&key).await
    }

    /// Expire everything.
    pub async fn expire_all(&mut self) -> Result<()> {
        while !self.entries.is_empty() {
            self.expire_oldest().await?;
        }
        Ok(())
    }

    /// Expire every entry past its hard deadline.
    pub async fn purge(&mut self) -> Result<()> {
        let victims: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_hard_expired())
            .map(|(key, _)| key.clone())
            .collect();
        for key in victims {
            self.expire(&key).await?;
        }
        Ok(())
    }

    /// Shut down the async expiry pipeline, draining already-queued victims.
    /// A no-op in sync mode.
    pub async fn close(&mut self) -> Result<()> {
        self.expiry_tx = None;
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
        Ok(())
    }
}

fn spawn_expiry_worker<V: Expirable>(
    mut rx: mpsc::Receiver<V>,
    last_failed: Arc<Mutex<Option<V>>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(mut victim) = rx.recv().await {
            if let Err(e) = victim.end_session().await {
                error!(error = %e, "expiry worker failed to end session");
                *last_failed.lock() = Some(victim);
            }
        }
    })
}
