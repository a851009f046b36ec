//! Per-resource reference handles
//!
//! A `Reference` asserts "this node is currently using resource R". It joins
//! the resource's nodelist, registers the resource with the owning
//! connection, and drives the dereference lifecycle: the last reference to
//! drop runs the caller's write-out callback exactly once and then removes
//! every per-resource entry from the shared store.
//!
//! Two counting strategies exist. `Membership` derives the reference count
//! from the nodelist and is the authoritative source for the pessimistic
//! update path. `Counter` keeps an explicit shared counter incremented per
//! reference and is authoritative for the conflict-free path, where nodelist
//! pruning races are tolerated.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::warn;

use crate::connection::Connection;
use crate::error::Result;
use crate::lock::{Acquisition, Lock};
use crate::nodelist::Nodelist;

/// How the reference count for a resource is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counting {
    /// Count is the nodelist size. Used by the pessimistic update path.
    Membership,
    /// Count is an explicit shared counter. Used by the conflict-free path.
    Counter,
}

/// A handle asserting this node's interest in one resource.
pub struct Reference {
    conn: Arc<Connection>,
    resource_key: String,
    times_modified_key: String,
    refcount_key: String,
    nodelist: Nodelist,
    counting: Counting,
    force_expiry: AtomicBool,
}

impl Reference {
    /// Register interest in `resource`: add it to the connection registry,
    /// join the nodelist, and (counter mode) increment the shared refcount.
    pub(crate) async fn new(
        conn: Arc<Connection>,
        resource: &str,
        counting: Counting,
    ) -> Result<Self> {
        let keyspace = conn.keyspace();
        let times_modified_key = keyspace.times_modified(resource);
        let refcount_key = keyspace.refcount(resource);
        let nodelist = Nodelist::new(
            conn.store(),
            keyspace,
            resource,
            conn.config().session_length,
        );

        conn.add_to_registry(resource).await?;
        nodelist.refresh_session(&conn.id()).await?;
        if counting == Counting::Counter {
            conn.store().incr(&refcount_key).await?;
        }

        Ok(Self {
            conn,
            resource_key: resource.to_string(),
            times_modified_key,
            refcount_key,
            nodelist,
            counting,
            force_expiry: AtomicBool::new(false),
        })
    }

    /// The resource this reference points at.
    pub fn resource_key(&self) -> &str {
        &self.resource_key
    }

    /// The nodelist for this resource.
    pub fn nodelist(&self) -> &Nodelist {
        &self.nodelist
    }

    /// The counting strategy in effect.
    pub fn counting(&self) -> Counting {
        self.counting
    }

    /// The connection that owns this reference.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Acquire the resource lock with the connection's configured options.
    pub async fn lock(&self) -> Result<Acquisition> {
        Lock::acquire(
            self.conn.store(),
            &self.resource_key,
            &self.conn.lock_options(),
        )
        .await
    }

    /// Acquire the resource lock without blocking.
    pub async fn try_lock(&self) -> Result<Acquisition> {
        let mut opts = self.conn.lock_options();
        opts.blocking_timeout = std::time::Duration::ZERO;
        Lock::acquire(self.conn.store(), &self.resource_key, &opts).await
    }

    /// Prune expired nodelist entries and refresh this node's timestamp.
    ///
    /// The membership variant runs under the resource lock so the prune and
    /// count stay consistent; the counter variant tolerates the race.
    pub async fn refresh_session(&self) -> Result<()> {
        match self.counting {
            Counting::Membership => {
                let guard = self.lock().await?.into_guard()?;
                let result = self.prune_and_refresh().await;
                if let Err(e) = guard.release().await {
                    warn!(resource = %self.resource_key, error = %e, "lock release failed");
                }
                result
            }
            Counting::Counter => self.prune_and_refresh().await,
        }
    }

    async fn prune_and_refresh(&self) -> Result<()> {
        self.nodelist.remove_expired(None).await?;
        self.nodelist.refresh_session(&self.conn.id()).await
    }

    /// Increment the shared count of completed caches for this resource.
    /// The TTL is armed when the counter is first created.
    pub async fn increment_times_modified(&self) -> Result<i64> {
        let store = self.conn.store();
        if store.set_nx(&self.times_modified_key, "1").await? {
            let ttl_ms = self.conn.config().ttl.as_millis() as u64;
            store.pexpire(&self.times_modified_key, ttl_ms).await?;
            Ok(1)
        } else {
            store.incr(&self.times_modified_key).await
        }
    }

    /// Reset the times-modified counter to zero. Used after an early flush
    /// so peers do not merge and re-execute data that already reached the
    /// database.
    pub async fn reset_times_modified(&self) -> Result<()> {
        self.conn.store().set(&self.times_modified_key, b"0").await
    }

    /// How many times this resource has been cached by any node; 0 when the
    /// counter is absent.
    pub async fn get_times_modified(&self) -> Result<i64> {
        let raw = self.conn.store().get(&self.times_modified_key).await?;
        Ok(raw
            .and_then(|b| String::from_utf8(b).ok())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0))
    }

    /// The current reference count for this resource.
    pub async fn count(&self) -> Result<i64> {
        match self.counting {
            Counting::Membership => Ok(self.nodelist.count().await? as i64),
            Counting::Counter => {
                let raw = self.conn.store().get(&self.refcount_key).await?;
                Ok(raw
                    .and_then(|b| String::from_utf8(b).ok())
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0))
            }
        }
    }

    /// Mark this reference so the next dereference treats this node as the
    /// last holder regardless of peers.
    pub fn set_force_expiry(&self) {
        self.force_expiry.store(true, Ordering::SeqCst);
    }

    /// Whether force-expiry has been requested.
    pub fn is_force_expiry(&self) -> bool {
        self.force_expiry.load(Ordering::SeqCst)
    }

    /// Relinquish this reference. See [`Reference::dereference_with`].
    pub async fn dereference(&self) -> Result<bool> {
        self.dereference_with(|| std::future::ready(Ok(()))).await
    }

    /// Relinquish this reference, running `on_last` exactly once if this was
    /// the last reference among all nodes.
    ///
    /// The resource is always removed from the connection registry and this
    /// node leaves the nodelist before `on_last` runs, even when forced.
    /// When last, every per-resource store entry is deleted; cleanup is
    /// attempted even if `on_last` fails, and the callback's error
    /// propagates after cleanup. Operating on a dereferenced reference is
    /// undefined behavior.
    pub async fn dereference_with<F, Fut>(&self, on_last: F) -> Result<bool>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let force = self.force_expiry.swap(false, Ordering::SeqCst);
        let node_id = self.conn.id();
        let store = self.conn.store();

        let last_local = self.conn.remove_from_registry(&self.resource_key).await?;

        // The counter tracks every reference, so it steps down even while
        // other local references keep the node in the nodelist.
        let remaining = match self.counting {
            Counting::Counter => Some(store.decr(&self.refcount_key).await?),
            Counting::Membership => None,
        };

        let last = if force {
            self.nodelist.remove_node(&node_id).await?;
            true
        } else {
            if last_local {
                self.nodelist.remove_node(&node_id).await?;
                self.nodelist.remove_expired(None).await?;
            }
            match self.counting {
                Counting::Membership => last_local && self.nodelist.count().await? == 0,
                Counting::Counter => remaining.unwrap_or(0) <= 0,
            }
        };

        if !last {
            return Ok(false);
        }

        let callback_result = on_last().await;
        let cleanup_result = store
            .del(&[
                self.resource_key.as_str(),
                self.nodelist.key(),
                self.times_modified_key.as_str(),
                self.refcount_key.as_str(),
            ])
            .await;

        callback_result?;
        cleanup_result?;
        Ok(true)
    }

    /// Drop this reference's share without any last-holder bookkeeping.
    /// Used when an update is merged into another update on the same node
    /// that keeps its own reference alive.
    pub(crate) async fn surrender(&self) -> Result<()> {
        self.conn.release_local(&self.resource_key);
        if self.counting == Counting::Counter {
            self.conn.store().decr(&self.refcount_key).await?;
        }
        Ok(())
    }
}
