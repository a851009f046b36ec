//! Declarative aggregation models
//!
//! A model is a schema of named [`FieldKind`]s plus one instance's values.
//! Instances with the same registry key merge field-wise; caching walks the
//! schema and applies each field's store mutation. The registry keeps
//! instances alive for a TTL, re-arming on re-registration, and on expiry
//! dereferences the model's resource: the last node runs the completion
//! sink, everyone else caches.
//!
//! Field operations are commutative, so models ride the conflict-free
//! reference counting path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::warn;

use crate::connection::Connection;
use crate::error::{PhononError, Result};
use crate::fields::{FieldKind, FieldValue};
use crate::reference::{Counting, Reference};

/// Named field kinds for a model type.
#[derive(Debug, Clone)]
pub struct ModelSchema {
    name: String,
    fields: HashMap<String, FieldKind>,
}

impl ModelSchema {
    /// A schema with the given model name and an implicit `id` field.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: HashMap::from([("id".to_string(), FieldKind::Id)]),
        }
    }

    /// Add a field.
    pub fn field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.insert(name.into(), kind);
        self
    }

    /// The model name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The declared fields.
    pub fn fields(&self) -> &HashMap<String, FieldKind> {
        &self.fields
    }
}

/// One instance of a model: a schema plus values for every declared field.
#[derive(Debug, Clone)]
pub struct Model {
    schema: Arc<ModelSchema>,
    id: String,
    values: HashMap<String, FieldValue>,
}

impl Model {
    /// Build an instance, validating the values against the schema.
    ///
    /// `id` is required and every declared field must be present with a
    /// value of the right shape; anything else is an argument error.
    pub fn new(schema: Arc<ModelSchema>, values: HashMap<String, FieldValue>) -> Result<Self> {
        let id = match values.get("id") {
            Some(FieldValue::Id(id)) => id.clone(),
            Some(other) => {
                return Err(PhononError::Argument(format!(
                    "id must be an Id value, got {:?}",
                    other
                )))
            }
            None => return Err(PhononError::Argument("id is a required field".to_string())),
        };

        for (name, kind) in schema.fields() {
            match values.get(name) {
                Some(value) if kind.accepts(value) => {}
                Some(value) => {
                    return Err(PhononError::Argument(format!(
                        "field {} expects {:?}, got {:?}",
                        name, kind, value
                    )))
                }
                None => {
                    return Err(PhononError::Argument(format!(
                        "field {} is required by model {}",
                        name,
                        schema.name()
                    )))
                }
            }
        }
        for name in values.keys() {
            if !schema.fields().contains_key(name) {
                return Err(PhononError::Argument(format!(
                    "field {} is not declared on model {}",
                    name,
                    schema.name()
                )));
            }
        }

        Ok(Self { schema, id, values })
    }

    /// The instance id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The schema this instance conforms to.
    pub fn schema(&self) -> &Arc<ModelSchema> {
        &self.schema
    }

    /// The key instances of this model aggregate under (`<name>.<id>`).
    pub fn registry_key(&self) -> String {
        format!("{}.{}", self.schema.name(), self.id)
    }

    /// A field value.
    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.values.get(field)
    }

    /// Merge another instance of the same model field-wise.
    pub fn merge(&mut self, other: Model) -> Result<()> {
        if self.registry_key() != other.registry_key() {
            return Err(PhononError::Argument(format!(
                "cannot merge {} into {}",
                other.registry_key(),
                self.registry_key()
            )));
        }
        let mut other_values = other.values;
        for (name, kind) in self.schema.fields() {
            let (Some(a), Some(b)) = (self.values.remove(name), other_values.remove(name)) else {
                continue;
            };
            self.values.insert(name.clone(), kind.merge(a, b)?);
        }
        Ok(())
    }

    /// Cache every field through its declared store operation.
    pub async fn cache(&self, conn: &Arc<Connection>) -> Result<()> {
        let store = conn.store();
        let model_key = self.registry_key();
        for (name, kind) in self.schema.fields() {
            if let Some(value) = self.values.get(name) {
                kind.cache(&store, &model_key, name, value).await?;
            }
        }
        Ok(())
    }
}

/// Completion callback for a model whose last reference dropped.
#[async_trait]
pub trait ModelSink: Send + Sync {
    /// Write the aggregated model to its final destination.
    async fn on_complete(&self, model: &Model) -> Result<()>;
}

struct RegisteredModel {
    model: Model,
    reference: Arc<Reference>,
    deadline: Instant,
}

/// Holds registered model instances for a TTL and drives their expiry.
pub struct ModelRegistry {
    conn: Arc<Connection>,
    sink: Arc<dyn ModelSink>,
    ttl: Duration,
    entries: Mutex<HashMap<String, RegisteredModel>>,
}

impl ModelRegistry {
    /// A registry expiring instances `ttl` after their last registration.
    pub fn new(conn: Arc<Connection>, sink: Arc<dyn ModelSink>, ttl: Duration) -> Self {
        Self {
            conn,
            sink,
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Number of instances currently held.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the registry holds no instances.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Register an instance. A re-registration merges into the held
    /// instance and re-arms its TTL.
    pub async fn register(&self, model: Model) -> Result<()> {
        let key = model.registry_key();
        let deadline = Instant::now() + self.ttl;

        // Merge path first: no new reference is taken.
        {
            let mut entries = self.entries.lock();
            if let Some(existing) = entries.get_mut(&key) {
                existing.model.merge(model)?;
                existing.deadline = deadline;
                return Ok(());
            }
        }

        let reference = Arc::new(
            self.conn
                .create_reference(&key, Counting::Counter)
                .await?,
        );

        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get_mut(&key) {
            // A concurrent register won the insert; fold into it and give
            // back the reference we took.
            existing.model.merge(model)?;
            existing.deadline = deadline;
            drop(entries);
            reference.surrender().await?;
            return Ok(());
        }
        entries.insert(
            key,
            RegisteredModel {
                model,
                reference,
                deadline,
            },
        );
        Ok(())
    }

    /// Expire every instance past its deadline: dereference, run the
    /// completion sink on the last node, cache otherwise. Returns how many
    /// instances were expired.
    pub async fn expire_due(&self) -> Result<usize> {
        let now = Instant::now();
        let due: Vec<RegisteredModel> = {
            let mut entries = self.entries.lock();
            let keys: Vec<String> = entries
                .iter()
                .filter(|(_, e)| e.deadline <= now)
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter()
                .filter_map(|k| entries.remove(&k))
                .collect()
        };

        let expired = due.len();
        for entry in due {
            let RegisteredModel {
                model, reference, ..
            } = entry;
            let sink = Arc::clone(&self.sink);
            let last = reference
                .dereference_with(|| async { sink.on_complete(&model).await })
                .await?;
            if !last {
                model.cache(&self.conn).await?;
            }
        }
        Ok(expired)
    }

    /// Drive expiry on an interval until the returned handle is aborted.
    pub fn spawn_expiry_task(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = self.expire_due().await {
                    warn!(error = %e, "model expiry pass failed");
                }
            }
        })
    }
}
