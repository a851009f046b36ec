//! Conflict-free aggregation sessions
//!
//! Restricting documents to commutative counter fields licenses the removal
//! of the resource lock: per-field increments against the shared store are
//! atomic, and any interleaving of caches from distinct nodes produces the
//! same totals. The explicit shared refcount, not the nodelist, decides who
//! is last.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cache::Expirable;
use crate::clock::{now_ms, to_ms};
use crate::connection::Connection;
use crate::error::Result;
use crate::reference::{Counting, Reference};

use super::{Aggregate, Sink, UpdateMeta, UpdateOptions};

/// A single commutative field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CounterValue {
    /// Integer counter.
    Int(i64),
    /// Float counter.
    Float(f64),
    /// Map of integer counters, cached as `field.key` hash entries.
    IntMap(HashMap<String, i64>),
    /// Map of float counters, cached as `field.key` hash entries.
    FloatMap(HashMap<String, f64>),
}

impl CounterValue {
    /// Combine two values. Addition per shape; integers promote to floats
    /// when mixed. Combining is commutative and associative, which is what
    /// permits lock-free caching.
    fn combine(a: CounterValue, b: CounterValue) -> CounterValue {
        use CounterValue::*;
        match (a, b) {
            (Int(x), Int(y)) => Int(x + y),
            (Float(x), Float(y)) => Float(x + y),
            (Int(x), Float(y)) | (Float(y), Int(x)) => Float(x as f64 + y),
            (IntMap(mut x), IntMap(y)) => {
                for (k, v) in y {
                    *x.entry(k).or_insert(0) += v;
                }
                IntMap(x)
            }
            (FloatMap(mut x), FloatMap(y)) => {
                for (k, v) in y {
                    *x.entry(k).or_insert(0.0) += v;
                }
                FloatMap(x)
            }
            (IntMap(x), FloatMap(y)) | (FloatMap(y), IntMap(x)) => {
                let mut out: HashMap<String, f64> =
                    x.into_iter().map(|(k, v)| (k, v as f64)).collect();
                for (k, v) in y {
                    *out.entry(k).or_insert(0.0) += v;
                }
                FloatMap(out)
            }
            // A scalar cannot meaningfully add into a map; the map survives
            // in either argument order.
            (m @ IntMap(_), Int(_) | Float(_)) | (Int(_) | Float(_), m @ IntMap(_)) => m,
            (m @ FloatMap(_), Int(_) | Float(_)) | (Int(_) | Float(_), m @ FloatMap(_)) => m,
        }
    }
}

/// A document of commutative counter fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CounterDoc {
    fields: HashMap<String, CounterValue>,
}

impl CounterDoc {
    /// An empty document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulate an integer delta on a field.
    pub fn incr(&mut self, field: &str, delta: i64) {
        self.apply(field, CounterValue::Int(delta));
    }

    /// Accumulate a float delta on a field.
    pub fn incr_float(&mut self, field: &str, delta: f64) {
        self.apply(field, CounterValue::Float(delta));
    }

    /// Accumulate an integer delta on a sub-key of a map field.
    pub fn incr_map(&mut self, field: &str, key: &str, delta: i64) {
        self.apply(
            field,
            CounterValue::IntMap(HashMap::from([(key.to_string(), delta)])),
        );
    }

    /// Accumulate a float delta on a sub-key of a map field.
    pub fn incr_map_float(&mut self, field: &str, key: &str, delta: f64) {
        self.apply(
            field,
            CounterValue::FloatMap(HashMap::from([(key.to_string(), delta)])),
        );
    }

    /// The value of a field, if present.
    pub fn get(&self, field: &str) -> Option<&CounterValue> {
        self.fields.get(field)
    }

    /// All fields with their values.
    pub fn fields(&self) -> &HashMap<String, CounterValue> {
        &self.fields
    }

    /// Whether the document holds no deltas.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    fn apply(&mut self, field: &str, value: CounterValue) {
        match self.fields.remove(field) {
            Some(existing) => {
                self.fields
                    .insert(field.to_string(), CounterValue::combine(existing, value));
            }
            None => {
                self.fields.insert(field.to_string(), value);
            }
        }
    }
}

impl Aggregate for CounterDoc {
    fn merge(&mut self, other: Self) {
        for (field, value) in other.fields {
            self.apply(&field, value);
        }
    }
}

/// A lock-free aggregation session over commutative counter fields.
pub struct ConflictFreeUpdate {
    sink: Arc<dyn Sink<CounterDoc>>,
    reference: Arc<Reference>,
    meta: UpdateMeta,
    doc: CounterDoc,
    soft_session: Duration,
    soft_expiration_ms: i64,
    hard_expiration_ms: i64,
    init_cache: bool,
    ended: bool,
}

impl ConflictFreeUpdate {
    /// Open a session for `doc` against the resource derived from the
    /// options' collection and id.
    pub async fn new(
        conn: Arc<Connection>,
        sink: Arc<dyn Sink<CounterDoc>>,
        doc: CounterDoc,
        opts: UpdateOptions,
    ) -> Result<Self> {
        let resource_id = conn.keyspace().update_resource(&opts.collection, &opts.id);
        let reference = Arc::new(
            conn.create_reference(&resource_id, Counting::Counter)
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
    pub fn doc(&self) -> &CounterDoc {
        &self.doc
    }

    /// Mutable access to the local document.
    pub fn doc_mut(&mut self) -> &mut CounterDoc {
        &mut self.doc
    }

    /// Merge another counter document into the local one. Local-only.
    pub fn merge(&mut self, other: CounterDoc) {
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
    /// the soft deadline forward.
    pub async fn refresh(&mut self, other: ConflictFreeUpdate) -> Result<()> {
        self.soft_expiration_ms = now_ms() + to_ms(self.soft_session);
        let ConflictFreeUpdate { doc, reference, .. } = other;
        self.doc.merge(doc);
        reference.surrender().await?;
        Ok(())
    }

    /// Contribute the local deltas to the shared per-field counters and
    /// reset the local document. No lock is taken; every operation is an
    /// atomic increment.
    pub async fn cache(&mut self) -> Result<()> {
        let store = self.reference.connection().store();
        let resource_id = self.meta.resource_id.clone();

        for (field, value) in self.doc.fields() {
            match value {
                CounterValue::Int(v) => {
                    store.hincr_by(&resource_id, field, *v).await?;
                }
                CounterValue::Float(v) => {
                    store.hincr_by_float(&resource_id, field, *v).await?;
                }
                CounterValue::IntMap(m) => {
                    for (k, v) in m {
                        store
                            .hincr_by(&resource_id, &format!("{}.{}", field, k), *v)
                            .await?;
                    }
                }
                CounterValue::FloatMap(m) => {
                    for (k, v) in m {
                        store
                            .hincr_by_float(&resource_id, &format!("{}.{}", field, k), *v)
                            .await?;
                    }
                }
            }
        }

        self.doc = CounterDoc::default();
        Ok(())
    }

    /// Read the accumulated counters, fold in the local deltas and write the
    /// final record through the sink. Lock-free.
    pub async fn execute(&mut self) -> Result<()> {
        let cached = self.cached_doc().await?;
        self.doc.merge(cached);
        self.sink.execute(&self.meta, &self.doc).await
    }

    /// Treat this node as the last holder and end the session. Calling
    /// again after the session ended is a no-op.
    pub async fn force_expiry(&mut self) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        self.reference.set_force_expiry();
        self.end_session().await
    }

    /// End the session on this node: dereference, execute when last,
    /// otherwise contribute another increment batch.
    pub async fn end_session(&mut self) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        let reference = Arc::clone(&self.reference);
        let last = reference
            .dereference_with(|| async { self.execute().await })
            .await?;
        if !last {
            self.cache().await?;
        }
        self.ended = true;
        Ok(())
    }

    /// Reconstruct a counter document from the flattened shared hash.
    async fn cached_doc(&self) -> Result<CounterDoc> {
        let store = self.reference.connection().store();
        let raw = store.hgetall(&self.meta.resource_id).await?;

        let mut doc = CounterDoc::new();
        for (key, value) in raw {
            match key.split_once('.') {
                Some((field, sub)) => {
                    if let Ok(v) = value.parse::<i64>() {
                        doc.incr_map(field, sub, v);
                    } else if let Ok(v) = value.parse::<f64>() {
                        doc.incr_map_float(field, sub, v);
                    }
                }
                None => {
                    if let Ok(v) = value.parse::<i64>() {
                        doc.incr(&key, v);
                    } else if let Ok(v) = value.parse::<f64>() {
                        doc.incr_float(&key, v);
                    }
                }
            }
        }
        Ok(doc)
    }
}

#[async_trait]
impl Expirable for ConflictFreeUpdate {
    async fn end_session(&mut self) -> Result<()> {
        ConflictFreeUpdate::end_session(self).await
    }

    fn is_expired(&self) -> bool {
        ConflictFreeUpdate::is_expired(self)
    }

    fn is_hard_expired(&self) -> bool {
        ConflictFreeUpdate::is_hard_expired(self)
    }

    async fn refresh(&mut self, other: Self) -> Result<()> {
        ConflictFreeUpdate::refresh(self, other).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::store::{MemoryStore, SharedStore};
    use parking_lot::Mutex;
    use proptest::prelude::*;

    struct RecordingSink {
        executions: Mutex<Vec<CounterDoc>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                executions: Mutex::new(Vec::new()),
            })
        }

        fn executed(&self) -> Vec<CounterDoc> {
            self.executions.lock().clone()
        }
    }

    #[async_trait]
    impl Sink<CounterDoc> for RecordingSink {
        async fn execute(&self, _meta: &UpdateMeta, doc: &CounterDoc) -> Result<()> {
            self.executions.lock().push(doc.clone());
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

    fn doc_with(field: &str, value: i64) -> CounterDoc {
        let mut doc = CounterDoc::new();
        doc.incr(field, value);
        doc
    }

    #[test]
    fn test_counter_doc_merge_adds_fields() {
        let mut a = CounterDoc::new();
        a.incr("views", 3);
        a.incr_map("pages", "home", 1);

        let mut b = CounterDoc::new();
        b.incr("views", 4);
        b.incr_map("pages", "home", 2);
        b.incr_map("pages", "about", 5);

        a.merge(b);
        assert_eq!(a.get("views"), Some(&CounterValue::Int(7)));
        match a.get("pages") {
            Some(CounterValue::IntMap(m)) => {
                assert_eq!(m["home"], 3);
                assert_eq!(m["about"], 5);
            }
            other => panic!("unexpected pages value: {:?}", other),
        }
    }

    #[test]
    fn test_mixed_numeric_shapes_promote_to_float() {
        let mut a = CounterDoc::new();
        a.incr("score", 2);
        let mut b = CounterDoc::new();
        b.incr_float("score", 0.5);

        a.merge(b);
        assert_eq!(a.get("score"), Some(&CounterValue::Float(2.5)));
    }

    #[tokio::test]
    async fn test_cache_applies_increments_and_clears_local_doc() {
        let store = Arc::new(MemoryStore::new());
        let conn = connect(&store).await;
        let sink = RecordingSink::new();

        let mut doc = CounterDoc::new();
        doc.incr("a", 4);
        doc.incr_map("b", "x", 2);

        let mut update = ConflictFreeUpdate::new(
            Arc::clone(&conn),
            sink,
            doc,
            UpdateOptions::new("99"),
        )
        .await
        .unwrap();

        update.cache().await.unwrap();
        assert!(update.doc().is_empty());

        let hash = store.hgetall("phonon_Update.test.99").await.unwrap();
        assert_eq!(hash["a"], "4");
        assert_eq!(hash["b.x"], "2");

        // A second cache of the same deltas adds, never overwrites.
        update.doc_mut().incr("a", 1);
        update.cache().await.unwrap();
        let hash = store.hgetall("phonon_Update.test.99").await.unwrap();
        assert_eq!(hash["a"], "5");

        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_caches_commute() {
        let store = Arc::new(MemoryStore::new());
        let sink = RecordingSink::new();

        // Three connections contribute {a:1}, {a:7}, {a:7} concurrently.
        let mut handles = Vec::new();
        for delta in [1i64, 7, 7] {
            let store = Arc::clone(&store);
            let sink = Arc::clone(&sink) as Arc<dyn Sink<CounterDoc>>;
            handles.push(tokio::spawn(async move {
                let conn = connect(&store).await;
                let mut update = ConflictFreeUpdate::new(
                    Arc::clone(&conn),
                    sink,
                    doc_with("a", delta),
                    UpdateOptions::new("777"),
                )
                .await
                .unwrap();
                update.cache().await.unwrap();
                conn.close().await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let hash = store.hgetall("phonon_Update.test.777").await.unwrap();
        assert_eq!(hash["a"], "15");
    }

    #[tokio::test]
    async fn test_last_end_session_executes_accumulated_totals() {
        let store = Arc::new(MemoryStore::new());
        let c1 = connect(&store).await;
        let c2 = connect(&store).await;
        let sink = RecordingSink::new();

        let mut u1 = ConflictFreeUpdate::new(
            Arc::clone(&c1),
            Arc::clone(&sink) as Arc<dyn Sink<CounterDoc>>,
            doc_with("d", 4),
            UpdateOptions::new("456"),
        )
        .await
        .unwrap();
        let mut u2 = ConflictFreeUpdate::new(
            Arc::clone(&c2),
            Arc::clone(&sink) as Arc<dyn Sink<CounterDoc>>,
            doc_with("d", 4),
            UpdateOptions::new("456"),
        )
        .await
        .unwrap();

        u1.end_session().await.unwrap();
        assert!(sink.executed().is_empty());

        u2.end_session().await.unwrap();
        let executed = sink.executed();
        assert_eq!(executed.len(), 1);
        assert_eq!(executed[0].get("d"), Some(&CounterValue::Int(8)));

        // Last dereference removed the accumulated hash.
        assert!(store
            .hgetall("phonon_Update.test.456")
            .await
            .unwrap()
            .is_empty());

        c1.close().await.unwrap();
        c2.close().await.unwrap();
    }

    proptest! {
        // Any permutation of the same increments produces the same totals.
        #[test]
        fn prop_merge_order_is_irrelevant(deltas in proptest::collection::vec(-1000i64..1000, 1..20)) {
            let mut forward = CounterDoc::new();
            for d in &deltas {
                forward.merge(doc_with("a", *d));
            }

            let mut backward = CounterDoc::new();
            for d in deltas.iter().rev() {
                backward.merge(doc_with("a", *d));
            }

            prop_assert_eq!(forward, backward);
        }

        #[test]
        fn prop_combine_is_associative(a in -1000i64..1000, b in -1000i64..1000, c in -1000i64..1000) {
            use CounterValue::Int;
            let left = CounterValue::combine(CounterValue::combine(Int(a), Int(b)), Int(c));
            let right = CounterValue::combine(Int(a), CounterValue::combine(Int(b), Int(c)));
            prop_assert_eq!(left, right);
        }
    }
}
