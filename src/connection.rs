//! Process-wide handle to the shared store
//!
//! A `Connection` owns a node identity, a registry of the resources this
//! node currently references, and a background heartbeat task. The heartbeat
//! both proves this node is alive and opportunistically reclaims registry
//! entries from peers whose heartbeats have lapsed.
//!
//! There is deliberately no process-wide singleton: the `Arc<Connection>` is
//! an explicit dependency handed to reference and update constructors, which
//! keeps tests able to run many connections against one store.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::clock::{now_ms, to_ms};
use crate::config::ConnectionConfig;
use crate::error::Result;
use crate::lock::LockOptions;
use crate::nodelist::Nodelist;
use crate::reference::{Counting, Reference};
use crate::store::{Keyspace, RedisStore, SharedStore};

/// Events emitted by a connection's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The store was reachable at open.
    Connected,
    /// A heartbeat round completed.
    Heartbeat,
}

/// A node-local handle to the shared store.
pub struct Connection {
    store: Arc<dyn SharedStore>,
    config: ConnectionConfig,
    keyspace: Keyspace,
    /// Reassigned when our own heartbeat lapses, so reads go through a lock.
    id: RwLock<String>,
    /// Local reference multiplicity per resource. A node appears once in a
    /// resource's nodelist no matter how many local references it holds;
    /// this map decides when the node-level membership is actually released.
    local_refs: Mutex<HashMap<String, usize>>,
    events: broadcast::Sender<ConnectionEvent>,
    shutdown: watch::Sender<bool>,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Connect to the first configured Redis host and start the heartbeat.
    pub async fn open(config: ConnectionConfig) -> Result<Arc<Self>> {
        let url = config
            .hosts
            .first()
            .ok_or_else(|| crate::PhononError::Argument("no redis hosts configured".into()))?;
        let store = RedisStore::connect(url).await?;
        Self::with_store(Arc::new(store), config).await
    }

    /// Start a connection over an already-constructed store.
    pub async fn with_store(
        store: Arc<dyn SharedStore>,
        config: ConnectionConfig,
    ) -> Result<Arc<Self>> {
        store.ping().await?;

        let keyspace = Keyspace::new(config.namespace.clone());
        let (events, _) = broadcast::channel(64);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let conn = Arc::new(Self {
            store,
            config,
            keyspace,
            id: RwLock::new(Uuid::new_v4().to_string()),
            local_refs: Mutex::new(HashMap::new()),
            events,
            shutdown,
            heartbeat_task: Mutex::new(None),
        });

        let _ = conn.events.send(ConnectionEvent::Connected);

        let task = tokio::spawn(heartbeat_loop(Arc::clone(&conn), shutdown_rx));
        *conn.heartbeat_task.lock() = Some(task);

        Ok(conn)
    }

    /// This connection's node id.
    pub fn id(&self) -> String {
        self.id.read().clone()
    }

    /// The configuration this connection was opened with.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// The shared store handle.
    pub fn store(&self) -> Arc<dyn SharedStore> {
        Arc::clone(&self.store)
    }

    /// The key layout for this connection's namespace.
    pub fn keyspace(&self) -> &Keyspace {
        &self.keyspace
    }

    /// Lock options derived from this connection's configuration.
    pub fn lock_options(&self) -> LockOptions {
        LockOptions {
            ttl: self.config.ttl,
            retry_interval: self.config.retry_interval,
            blocking_timeout: self.config.blocking_timeout,
        }
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Key of this connection's registry set in the store.
    pub fn registry_key(&self) -> String {
        self.keyspace.registry(&self.id())
    }

    /// Create a reference to `resource` owned by this connection.
    pub async fn create_reference(
        self: &Arc<Self>,
        resource: &str,
        counting: Counting,
    ) -> Result<Reference> {
        Reference::new(Arc::clone(self), resource, counting).await
    }

    /// Snapshot of the resources this connection holds local references to.
    pub fn local_registry(&self) -> Vec<String> {
        self.local_refs.lock().keys().cloned().collect()
    }

    /// The resources recorded for this connection in the store, including
    /// any adopted from failed peers.
    pub async fn registry(&self) -> Result<Vec<String>> {
        self.store.smembers(&self.registry_key()).await
    }

    /// Record a local reference to `resource`. The store-side registry entry
    /// is created on the first local reference only.
    pub async fn add_to_registry(&self, resource: &str) -> Result<()> {
        let first = {
            let mut refs = self.local_refs.lock();
            let count = refs.entry(resource.to_string()).or_insert(0);
            *count += 1;
            *count == 1
        };
        if first {
            self.store.sadd(&self.registry_key(), resource).await?;
        }
        Ok(())
    }

    /// Release a local reference to `resource`.
    ///
    /// Returns true when this was the last local reference, in which case
    /// the store-side registry entry has been removed and the caller owns
    /// node-level cleanup (nodelist removal). Removing a resource that is
    /// not registered is a no-op returning true; `force_expiry` can cause a
    /// second removal.
    pub async fn remove_from_registry(&self, resource: &str) -> Result<bool> {
        let last = {
            let mut refs = self.local_refs.lock();
            match refs.get_mut(resource) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    false
                }
                Some(_) => {
                    refs.remove(resource);
                    true
                }
                None => true,
            }
        };
        if last {
            self.store.srem(&self.registry_key(), resource).await?;
        }
        Ok(last)
    }

    /// Drop one unit of local multiplicity without touching the store.
    /// Used when an update is absorbed into another local update for the
    /// same resource.
    pub(crate) fn release_local(&self, resource: &str) {
        let mut refs = self.local_refs.lock();
        if let Some(count) = refs.get_mut(resource) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                refs.remove(resource);
            }
        }
    }

    /// Record this node as alive and reclaim references from failed peers.
    ///
    /// Transient store errors are surfaced to the caller; the heartbeat loop
    /// logs them and keeps going.
    pub async fn send_heartbeat(&self) -> Result<()> {
        self.store
            .hset(&self.keyspace.heartbeat(), &self.id(), &now_ms().to_string())
            .await?;

        if self.config.recover_failed_processes {
            self.recover_failed_processes().await?;
        }

        let _ = self.events.send(ConnectionEvent::Heartbeat);
        Ok(())
    }

    /// Partition the heartbeat table into failed and active node ids.
    ///
    /// A node has failed when its heartbeat is at least three intervals old.
    pub async fn list_failed_and_active(&self) -> Result<(Vec<String>, Vec<String>)> {
        let threshold = now_ms() - to_ms(self.config.failure_threshold());
        let beats = self.store.hgetall(&self.keyspace.heartbeat()).await?;

        let mut failed = Vec::new();
        let mut active = Vec::new();
        for (node_id, raw) in beats {
            let alive = raw.parse::<i64>().map(|t| t > threshold).unwrap_or(false);
            if alive {
                active.push(node_id);
            } else {
                failed.push(node_id);
            }
        }
        Ok((failed, active))
    }

    /// Reclaim registry entries from peers whose heartbeats have lapsed.
    ///
    /// Each surviving node claims `max(1, orphans / active)` entries, chosen
    /// at random so repeated recovery rounds spread orphans across the
    /// survivors instead of hotspotting the first one to notice. Running
    /// this against an unchanged snapshot is idempotent: already-claimed
    /// entries are gone from the failed registry.
    pub async fn recover_failed_processes(&self) -> Result<()> {
        let (failed, active) = self.list_failed_and_active().await?;
        if failed.is_empty() {
            return Ok(());
        }
        warn!(count = failed.len(), "recovering failed processes");

        let heartbeat_key = self.keyspace.heartbeat();
        for failed_id in failed {
            if failed_id == self.id() {
                // Our own heartbeat lapsed (suspend, clock skew, partition).
                // Start over under a fresh identity; the abandoned registry
                // is reclaimed by peers through this same path.
                let fresh = Uuid::new_v4().to_string();
                warn!(old = %failed_id, new = %fresh, "own heartbeat lapsed, assuming new node id");
                *self.id.write() = fresh;
                continue;
            }

            if active.is_empty() {
                error!("no active processes available to recover failed references");
                continue;
            }

            let failed_registry = self.keyspace.registry(&failed_id);
            let orphan_count = self.store.scard(&failed_registry).await? as usize;
            if orphan_count == 0 {
                self.store.hdel(&heartbeat_key, &[failed_id.as_str()]).await?;
                continue;
            }

            let claim = std::cmp::max(1, orphan_count / active.len());
            let members = self.store.srandmember(&failed_registry, claim).await?;
            debug!(failed = %failed_id, claimed = members.len(), "adopting orphaned references");

            for resource in &members {
                self.adopt_resource(resource, &failed_id).await?;
                self.store.srem(&failed_registry, resource).await?;
            }

            if self.store.scard(&failed_registry).await? == 0 {
                self.store.hdel(&heartbeat_key, &[failed_id.as_str()]).await?;
            }
        }
        Ok(())
    }

    /// Take over a single orphaned resource: register it under this node,
    /// join its nodelist and evict the dead peer from it.
    ///
    /// Adoption is store-level only; it does not create local multiplicity,
    /// so an adopted entry that never sees local activity ages out of the
    /// nodelist after the session length like any abandoned member.
    async fn adopt_resource(&self, resource: &str, failed_id: &str) -> Result<()> {
        self.store.sadd(&self.registry_key(), resource).await?;
        let nodelist = Nodelist::new(
            self.store(),
            &self.keyspace,
            resource,
            self.config.session_length,
        );
        nodelist.refresh_session(&self.id()).await?;
        nodelist.remove_node(failed_id).await?;
        Ok(())
    }

    /// Stop the heartbeat and withdraw this node from the heartbeat table.
    ///
    /// Registry entries in the store are left for peers to reclaim; the
    /// local registry is discarded.
    pub async fn close(&self) -> Result<()> {
        let _ = self.shutdown.send(true);
        let task = self.heartbeat_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        let id = self.id();
        self.store
            .hdel(&self.keyspace.heartbeat(), &[id.as_str()])
            .await?;
        self.local_refs.lock().clear();
        Ok(())
    }
}

/// Periodic heartbeat driver. Cancellation is observed before each store
/// call; an in-flight heartbeat is never interrupted mid-write.
async fn heartbeat_loop(conn: Arc<Connection>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(conn.config.heartbeat_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                if *shutdown.borrow() {
                    break;
                }
                if let Err(e) = conn.send_heartbeat().await {
                    warn!(error = %e, "heartbeat failed, retrying on next interval");
                }
            }
        }
    }
}
