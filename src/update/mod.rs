//! Write-through aggregation sessions
//!
//! An update is a per-resource session that accumulates local deltas and
//! decides, at session end, whether to flush to the user's database sink or
//! to park the merged state in the shared store for the surviving peers.
//! The node holding the last reference executes exactly one final write.
//!
//! Two strategies share the lifecycle:
//!
//! - [`Update`]: arbitrary documents, all shared-store mutation under the
//!   resource lock, state cached as a versioned snapshot blob
//! - [`ConflictFreeUpdate`]: commutative counter documents, cached as atomic
//!   per-field increments with no lock at all
//!
//! User behavior plugs in through two capabilities: the document type's
//! [`Aggregate::merge`] and the database write in [`Sink::execute`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cache::Expirable;
use crate::clock::{now_ms, to_ms};
use crate::connection::Connection;
use crate::error::Result;
use crate::reference::{Counting, Reference};

mod conflict_free;
pub mod snapshot;

pub use conflict_free::{ConflictFreeUpdate, CounterDoc, CounterValue};
use snapshot::Snapshot;

/// A document that can absorb another instance of itself.
///
/// `merge` must be pure on local state: combine `other` into `self` without
/// touching the shared store.
pub trait Aggregate:
    Serialize + DeserializeOwned + Default + Clone + Send + Sync + 'static
{
    /// Combine another document into this one.
    fn merge(&mut self, other: Self);
}

/// Identity of the record an update session targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateMeta {
    /// Shared-store resource id (`<ns>_Update.<collection>.<id>`).
    pub resource_id: String,
    /// Primary key of the record in the database.
    pub id: String,
    /// Target database name.
    pub database: String,
    /// Target collection name.
    pub collection: String,
    /// Lookup specification for the record, if any.
    pub spec: Option<serde_json::Value>,
}

/// The database write-out. The sole external write the library performs;
/// no format is dictated. Error handling is the implementor's concern --
/// shared-store cleanup happens regardless.
#[async_trait]
pub trait Sink<A>: Send + Sync {
    /// Write the final aggregated record.
    async fn execute(&self, meta: &UpdateMeta, doc: &A) -> Result<()>;
}

/// Options for constructing an update session.
#[derive(Debug, Clone)]
pub struct UpdateOptions {
    /// Primary key of the record.
    pub id: String,
    /// Target database name.
    pub database: String,
    /// Target collection name.
    pub collection: String,
    /// Lookup specification for the record.
    pub spec: Option<serde_json::Value>,
    /// Soft session length; refreshes slide it forward. Defaults to half
    /// the connection TTL.
    pub soft_session: Option<Duration>,
    /// Hard session length; never extended. Defaults to the connection TTL.
    pub hard_session: Option<Duration>,
    /// Cache a snapshot immediately at construction so the data survives a
    /// crash of this node, at the cost of an extra store round trip.
    pub init_cache: bool,
}

impl UpdateOptions {
    /// Options for a record id with defaults for everything else.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            database: "test".to_string(),
            collection: "test".to_string(),
            spec: None,
            soft_session: None,
            hard_session: None,
            init_cache: false,
        }
    }
}

/// A pessimistic aggregation session. All cache and execute activity runs
/// under the resource lock; the nodelist is the authoritative reference
/// count.
pub struct Update<A: Aggregate> {
    sink: Arc<dyn Sink<A>>,
    reference: Arc<Reference>,
    meta: UpdateMeta,
    doc: A,
    soft_session: Duration,
    soft_expiration_ms: i64,
    hard_expiration_ms: i64,
    init_cache: bool,
    ended: bool,
}

impl<A: Aggregate> Update<A> {
    /// Open a session for `doc` against the resource derived from the
    /// options' collection and id.
    pub async fn new(
        conn: Arc<Connection>,
        sink: Arc<dyn Sink<A>>,
        doc: A,
        opts: UpdateOptions,
    ) -> Result<Self> {
        let resource_id = conn.keyspace().update_resource(&opts.collection, &opts.id);
        let reference = Arc::new(
            conn.create_reference(&resource_id, Counting::Membership)
                .await?,
        );

        let soft_session = opts.soft_session.unwrap_or_else(|| conn.config().soft_session());
        let hard_session = opts.hard_session.unwrap_or_else(|| conn.config().hard_session());
        let now = now_ms();

        let mut update = Self {
            sink,
            reference,
            meta: UpdateMeta {
                resource_id,
                id: opts.id,
                database: opts.database,
                collection: opts.collection,
                spec: opts.spec,
            },
            doc,
            soft_session,
            soft_expiration_ms: now + to_ms(soft_session),
            hard_expiration_ms: now + to_ms(hard_session),
            init_cache: opts.init_cache,
            ended: false,
        };

        if update.init_cache {
            update.cache().await?;
        }
        Ok(update)
    }

    /// The record identity for this session.
    pub fn meta(&self) -> &UpdateMeta {
        &self.meta
    }

    /// The underlying reference.
    pub fn reference(&self) -> &Arc<Reference> {
        &self.reference
    }

    /// The locally accumulated document.
    pub fn doc(&self) -> &A {
        &self.doc
    }

    /// Mutable access to the local document.
    pub fn doc_mut(&mut self) -> &mut A {
        &mut self.doc
    }

    /// Merge another document into the local one. Local-only.
    pub fn merge(&mut self, other: A) {
        self.doc.merge(other);
    }

    /// Whether the session has passed its soft or hard deadline.
    pub fn is_expired(&self) -> bool {
        let now = now_ms();
        now > self.hard_expiration_ms || now > self.soft_expiration_ms
    }

    /// Whether the session has passed its hard deadline.
    pub fn is_hard_expired(&self) -> bool {
        now_ms() > self.hard_expiration_ms
    }

    /// Merge another session for the same record into this one and slide
    /// the soft deadline forward. The absorbed session's reference is
    /// surrendered without ending the resource session.
    pub async fn refresh(&mut self, other: Update<A>) -> Result<()> {
        self.soft_expiration_ms = now_ms() + to_ms(self.soft_session);
        let Update { doc, reference, .. } = other;
        self.doc.merge(doc);
        reference.surrender().await?;
        Ok(())
    }

    /// Pull any cached snapshot, merge it in, write the merged snapshot and
    /// bump the times-modified counter. Runs under the resource lock.
    pub async fn cache(&mut self) -> Result<()> {
        let guard = self.reference.lock().await?.into_guard()?;
        let result = self.cache_in_lock().await;
        if let Err(e) = guard.release().await {
            warn!(resource = %self.meta.resource_id, error = %e, "lock release failed");
        }
        result
    }

    /// Merge any cached snapshot and write the final record through the
    /// sink. Runs under the resource lock.
    pub async fn execute(&mut self) -> Result<()> {
        let guard = self.reference.lock().await?.into_guard()?;
        let result = self.execute_in_lock().await;
        if let Err(e) = guard.release().await {
            warn!(resource = %self.meta.resource_id, error = %e, "lock release failed");
        }
        result
    }

    /// Treat this node as the last holder and end the session, guaranteeing
    /// a single execute regardless of peer count. Calling again after the
    /// session ended is a no-op.
    pub async fn force_expiry(&mut self) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        self.reference.set_force_expiry();
        self.end_session().await
    }

    /// End the session on this node.
    ///
    /// Dereferences the resource; the last holder executes. A session that
    /// outlived its deadlines but still has peers executes immediately and
    /// resets the shared state so peers cannot re-execute the same data.
    /// Anything else caches for the survivors.
    pub async fn end_session(&mut self) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        let guard = self.reference.lock().await?.into_guard()?;
        let result = self.end_session_in_lock().await;
        if let Err(e) = guard.release().await {
            warn!(resource = %self.meta.resource_id, error = %e, "lock release failed");
        }
        if result.is_ok() {
            self.ended = true;
        }
        result
    }

    async fn end_session_in_lock(&mut self) -> Result<()> {
        let reference = Arc::clone(&self.reference);
        let last = reference
            .dereference_with(|| async { self.execute_in_lock().await })
            .await?;
        if last {
            return Ok(());
        }

        if self.is_expired() {
            // Expired with peers still active: flush now, then clear the
            // cached payload and zero the counter so peers do not write the
            // same data again.
            self.execute_in_lock().await?;
            let store = self.reference.connection().store();
            store.del(&[self.meta.resource_id.as_str()]).await?;
            self.reference.reset_times_modified().await?;
        } else {
            self.cache_in_lock().await?;
        }
        Ok(())
    }

    async fn cache_in_lock(&mut self) -> Result<()> {
        if self.reference.get_times_modified().await? > 0 {
            self.merge_cached().await?;
        }
        let snapshot =
            Snapshot::from_parts(&self.meta, self.doc.clone(), self.hard_expiration_ms)?;
        let blob = snapshot.encode()?;
        let store = self.reference.connection().store();
        store.set(&self.meta.resource_id, &blob).await?;
        self.reference.increment_times_modified().await?;

        if self.init_cache {
            // Recoverable mode: the data now lives in the store, so the
            // local copy resets to empty.
            self.doc = A::default();
        }
        Ok(())
    }

    async fn execute_in_lock(&mut self) -> Result<()> {
        if self.reference.get_times_modified().await? > 0 {
            self.merge_cached().await?;
        }
        self.sink.execute(&self.meta, &self.doc).await
    }

    async fn merge_cached(&mut self) -> Result<()> {
        let store = self.reference.connection().store();
        if let Some(blob) = store.get(&self.meta.resource_id).await? {
            let cached: Snapshot<A> = Snapshot::decode(&blob)?;
            self.doc.merge(cached.doc);
            // A merged-in session keeps the earlier hard deadline.
            self.hard_expiration_ms = self.hard_expiration_ms.min(cached.hard_expiration_ms);
        }
        Ok(())
    }
}

#[async_trait]
impl<A: Aggregate> Expirable for Update<A> {
    async fn end_session(&mut self) -> Result<()> {
        Update::end_session(self).await
    }

    fn is_expired(&self) -> bool {
        Update::is_expired(self)
    }

    fn is_hard_expired(&self) -> bool {
        Update::is_hard_expired(self)
    }

    async fn refresh(&mut self, other: Self) -> Result<()> {
        Update::refresh(self, other).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::store::{MemoryStore, SharedStore};
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Per-field additive document, like a per-user event counter map.
    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct CountDoc(HashMap<String, i64>);

    impl CountDoc {
        fn of(pairs: &[(&str, i64)]) -> Self {
            Self(
                pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), *v))
                    .collect(),
            )
        }
    }

    impl Aggregate for CountDoc {
        fn merge(&mut self, other: Self) {
            for (k, v) in other.0 {
                *self.0.entry(k).or_insert(0) += v;
            }
        }
    }

    struct RecordingSink {
        executions: Mutex<Vec<(String, CountDoc)>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                executions: Mutex::new(Vec::new()),
            })
        }

        fn executed(&self) -> Vec<(String, CountDoc)> {
            self.executions.lock().clone()
        }
    }

    #[async_trait]
    impl Sink<CountDoc> for RecordingSink {
        async fn execute(&self, meta: &UpdateMeta, doc: &CountDoc) -> Result<()> {
            self.executions
                .lock()
                .push((meta.resource_id.clone(), doc.clone()));
            Ok(())
        }
    }

    fn test_config() -> ConnectionConfig {
        ConnectionConfig {
            heartbeat_interval: Duration::from_secs(300),
            ..Default::default()
        }
    }

    async fn connect(store: &Arc<MemoryStore>) -> Arc<Connection> {
        let shared: Arc<dyn SharedStore> = Arc::clone(store) as Arc<dyn SharedStore>;
        Connection::with_store(shared, test_config()).await.unwrap()
    }

    fn user_options(id: &str) -> UpdateOptions {
        let mut opts = UpdateOptions::new(id);
        opts.collection = "user".to_string();
        opts.spec = Some(serde_json::json!({"_id": id}));
        opts
    }

    #[tokio::test]
    async fn test_cache_writes_versioned_snapshot() {
        let store = Arc::new(MemoryStore::new());
        let conn = connect(&store).await;
        let sink = RecordingSink::new();

        let mut update = Update::new(
            Arc::clone(&conn),
            sink,
            CountDoc::of(&[("a", 1), ("b", 2), ("c", 3)]),
            user_options("12345"),
        )
        .await
        .unwrap();

        update.cache().await.unwrap();

        let blob = store.get("phonon_Update.user.12345").await.unwrap().unwrap();
        let cached: Snapshot<CountDoc> = Snapshot::decode(&blob).unwrap();
        assert_eq!(cached.doc, CountDoc::of(&[("a", 1), ("b", 2), ("c", 3)]));
        assert_eq!(cached.collection, "user");
        assert_eq!(update.reference().get_times_modified().await.unwrap(), 1);

        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_single_node_sessions_cache_then_execute() {
        let store = Arc::new(MemoryStore::new());
        let conn = connect(&store).await;
        let sink = RecordingSink::new();

        let mut first = Update::new(
            Arc::clone(&conn),
            Arc::clone(&sink) as Arc<dyn Sink<CountDoc>>,
            CountDoc::of(&[("a", 1), ("b", 2), ("c", 3)]),
            user_options("12345"),
        )
        .await
        .unwrap();
        let mut second = Update::new(
            Arc::clone(&conn),
            Arc::clone(&sink) as Arc<dyn Sink<CountDoc>>,
            CountDoc::of(&[("a", 1)]),
            user_options("12345"),
        )
        .await
        .unwrap();

        first.end_session().await.unwrap();
        assert!(sink.executed().is_empty());
        assert!(store.get("phonon_Update.user.12345").await.unwrap().is_some());

        second.end_session().await.unwrap();
        let executed = sink.executed();
        assert_eq!(executed.len(), 1);
        assert_eq!(executed[0].0, "phonon_Update.user.12345");
        assert_eq!(executed[0].1, CountDoc::of(&[("a", 2), ("b", 2), ("c", 3)]));

        // Last dereference removed every per-resource entry.
        assert!(store.get("phonon_Update.user.12345").await.unwrap().is_none());
        assert!(store
            .get("phonon_phonon_Update.user.12345.times_modified")
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            store
                .hlen("phonon_phonon_Update.user.12345.nodelist")
                .await
                .unwrap(),
            0
        );

        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_two_node_aggregate() {
        let store = Arc::new(MemoryStore::new());
        let c1 = connect(&store).await;
        let c2 = connect(&store).await;
        let sink = RecordingSink::new();

        let mut u1 = Update::new(
            Arc::clone(&c1),
            Arc::clone(&sink) as Arc<dyn Sink<CountDoc>>,
            CountDoc::of(&[("d", 4), ("e", 5), ("f", 6)]),
            user_options("456"),
        )
        .await
        .unwrap();
        let mut u2 = Update::new(
            Arc::clone(&c2),
            Arc::clone(&sink) as Arc<dyn Sink<CountDoc>>,
            CountDoc::of(&[("d", 4), ("e", 5), ("f", 6)]),
            user_options("456"),
        )
        .await
        .unwrap();

        u1.end_session().await.unwrap();
        u2.end_session().await.unwrap();

        let executed = sink.executed();
        assert_eq!(executed.len(), 1);
        assert_eq!(
            executed[0].1,
            CountDoc::of(&[("d", 8), ("e", 10), ("f", 12)])
        );

        c1.close().await.unwrap();
        c2.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_init_cache_snapshots_immediately_and_clears_doc() {
        let store = Arc::new(MemoryStore::new());
        let conn = connect(&store).await;
        let sink = RecordingSink::new();

        let mut opts = user_options("321");
        opts.init_cache = true;
        let update = Update::new(
            Arc::clone(&conn),
            sink,
            CountDoc::of(&[("a", 9)]),
            opts,
        )
        .await
        .unwrap();

        // The data survives in the store; the local copy is empty.
        assert!(update.doc().0.is_empty());
        let blob = store.get("phonon_Update.user.321").await.unwrap().unwrap();
        let cached: Snapshot<CountDoc> = Snapshot::decode(&blob).unwrap();
        assert_eq!(cached.doc, CountDoc::of(&[("a", 9)]));

        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_session_with_peers_flushes_early() {
        let store = Arc::new(MemoryStore::new());
        let c1 = connect(&store).await;
        let c2 = connect(&store).await;
        let sink = RecordingSink::new();

        let mut opts = user_options("777");
        opts.soft_session = Some(Duration::ZERO);
        let mut u1 = Update::new(
            Arc::clone(&c1),
            Arc::clone(&sink) as Arc<dyn Sink<CountDoc>>,
            CountDoc::of(&[("x", 1)]),
            opts,
        )
        .await
        .unwrap();
        let mut u2 = Update::new(
            Arc::clone(&c2),
            Arc::clone(&sink) as Arc<dyn Sink<CountDoc>>,
            CountDoc::of(&[("x", 10)]),
            user_options("777"),
        )
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(u1.is_expired());

        // Not last, but expired: flush now and reset shared state.
        u1.end_session().await.unwrap();
        let executed = sink.executed();
        assert_eq!(executed.len(), 1);
        assert_eq!(executed[0].1, CountDoc::of(&[("x", 1)]));
        assert!(store.get("phonon_Update.user.777").await.unwrap().is_none());
        assert_eq!(
            u2.reference().get_times_modified().await.unwrap(),
            0
        );

        // The survivor executes only its own data.
        u2.end_session().await.unwrap();
        let executed = sink.executed();
        assert_eq!(executed.len(), 2);
        assert_eq!(executed[1].1, CountDoc::of(&[("x", 10)]));

        c1.close().await.unwrap();
        c2.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_force_expiry_executes_merged_doc_despite_peers() {
        let store = Arc::new(MemoryStore::new());
        let c1 = connect(&store).await;
        let c2 = connect(&store).await;
        let c3 = connect(&store).await;
        let sink = RecordingSink::new();

        // A departed session leaves cached state behind.
        let mut departed = Update::new(
            Arc::clone(&c3),
            Arc::clone(&sink) as Arc<dyn Sink<CountDoc>>,
            CountDoc::of(&[("n", 100)]),
            user_options("42"),
        )
        .await
        .unwrap();

        let mut u1 = Update::new(
            Arc::clone(&c1),
            Arc::clone(&sink) as Arc<dyn Sink<CountDoc>>,
            CountDoc::of(&[("n", 1)]),
            user_options("42"),
        )
        .await
        .unwrap();
        let mut u2 = Update::new(
            Arc::clone(&c2),
            Arc::clone(&sink) as Arc<dyn Sink<CountDoc>>,
            CountDoc::of(&[("n", 10)]),
            user_options("42"),
        )
        .await
        .unwrap();

        departed.end_session().await.unwrap();
        assert_eq!(u1.reference().get_times_modified().await.unwrap(), 1);

        u1.force_expiry().await.unwrap();
        let executed = sink.executed();
        assert_eq!(executed.len(), 1);
        assert_eq!(executed[0].1, CountDoc::of(&[("n", 101)]));

        // All shared state is gone; repeating the force is a no-op.
        assert!(store.get("phonon_Update.user.42").await.unwrap().is_none());
        u1.force_expiry().await.unwrap();
        assert_eq!(sink.executed().len(), 1);

        // The remaining holder finds no peers and executes only local data.
        u2.end_session().await.unwrap();
        let executed = sink.executed();
        assert_eq!(executed.len(), 2);
        assert_eq!(executed[1].1, CountDoc::of(&[("n", 10)]));

        c1.close().await.unwrap();
        c2.close().await.unwrap();
        c3.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_refresh_absorbs_sibling_session() {
        let store = Arc::new(MemoryStore::new());
        let conn = connect(&store).await;
        let sink = RecordingSink::new();

        let mut u1 = Update::new(
            Arc::clone(&conn),
            Arc::clone(&sink) as Arc<dyn Sink<CountDoc>>,
            CountDoc::of(&[("a", 1)]),
            user_options("9"),
        )
        .await
        .unwrap();
        let u2 = Update::new(
            Arc::clone(&conn),
            Arc::clone(&sink) as Arc<dyn Sink<CountDoc>>,
            CountDoc::of(&[("a", 5)]),
            user_options("9"),
        )
        .await
        .unwrap();

        u1.refresh(u2).await.unwrap();
        assert_eq!(u1.doc(), &CountDoc::of(&[("a", 6)]));

        // The absorbed session no longer counts: u1 is the last holder.
        u1.end_session().await.unwrap();
        let executed = sink.executed();
        assert_eq!(executed.len(), 1);
        assert_eq!(executed[0].1, CountDoc::of(&[("a", 6)]));

        conn.close().await.unwrap();
    }
}
