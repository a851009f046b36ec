//! Typed aggregation fields
//!
//! Each field kind pairs a pure local merge with the shared-store mutation
//! that caches it: sums become counter increments, list appends become
//! RPUSH, set appends become SADD, windowed lists become a sorted set
//! trimmed by rank. Field kinds are the vocabulary the declarative
//! [`Model`](crate::model::Model) layer is built from.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{PhononError, Result};
use crate::store::SharedStore;

/// Aggregation semantics of a model field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    /// Identity field; never cached.
    Id,
    /// Additive counter (`a + b`), cached with INCRBY/INCRBYFLOAT.
    Sum,
    /// Subtractive counter (`a - b`), cached with a negative INCRBY.
    Diff,
    /// Append-only list, cached with RPUSH.
    ListAppend,
    /// Grow-only set, cached with SADD.
    SetAppend,
    /// Timestamped list keeping only the newest `window` items, cached as a
    /// sorted set trimmed by rank.
    WindowedList {
        /// Number of newest items to retain.
        window: usize,
    },
}

/// A field's value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    /// Identity value.
    Id(String),
    /// Integer counter value.
    Int(i64),
    /// Float counter value.
    Float(f64),
    /// List of items.
    List(Vec<String>),
    /// Set of items.
    Set(BTreeSet<String>),
    /// Timestamped items, millisecond timestamps.
    Windowed(Vec<(i64, String)>),
}

impl FieldKind {
    /// Whether `value` has the shape this kind operates on.
    pub fn accepts(&self, value: &FieldValue) -> bool {
        matches!(
            (self, value),
            (FieldKind::Id, FieldValue::Id(_))
                | (FieldKind::Sum, FieldValue::Int(_))
                | (FieldKind::Sum, FieldValue::Float(_))
                | (FieldKind::Diff, FieldValue::Int(_))
                | (FieldKind::Diff, FieldValue::Float(_))
                | (FieldKind::ListAppend, FieldValue::List(_))
                | (FieldKind::SetAppend, FieldValue::Set(_))
                | (FieldKind::WindowedList { .. }, FieldValue::Windowed(_))
        )
    }

    /// Combine two values of this kind. Pure.
    pub fn merge(&self, a: FieldValue, b: FieldValue) -> Result<FieldValue> {
        use FieldValue::*;
        match (self, a, b) {
            (FieldKind::Id, a, _) => Ok(a),
            (FieldKind::Sum, Int(x), Int(y)) => Ok(Int(x + y)),
            (FieldKind::Sum, Float(x), Float(y)) => Ok(Float(x + y)),
            (FieldKind::Sum, Int(x), Float(y)) | (FieldKind::Sum, Float(y), Int(x)) => {
                Ok(Float(x as f64 + y))
            }
            (FieldKind::Diff, Int(x), Int(y)) => Ok(Int(x - y)),
            (FieldKind::Diff, Float(x), Float(y)) => Ok(Float(x - y)),
            (FieldKind::ListAppend, List(mut x), List(y)) => {
                x.extend(y);
                Ok(List(x))
            }
            (FieldKind::SetAppend, Set(mut x), Set(y)) => {
                x.extend(y);
                Ok(Set(x))
            }
            (FieldKind::WindowedList { window }, Windowed(mut x), Windowed(y)) => {
                x.extend(y);
                x.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
                let excess = x.len().saturating_sub(*window);
                x.drain(..excess);
                Ok(Windowed(x))
            }
            (kind, a, b) => Err(PhononError::Argument(format!(
                "cannot merge {:?} and {:?} as {:?}",
                a, b, kind
            ))),
        }
    }

    /// Apply the shared-store mutation that caches `value` for the field
    /// `field_name` of the model instance at `model_key`.
    pub async fn cache(
        &self,
        store: &Arc<dyn SharedStore>,
        model_key: &str,
        field_name: &str,
        value: &FieldValue,
    ) -> Result<()> {
        use FieldValue::*;
        let key = format!("{}.{}", model_key, field_name);
        match (self, value) {
            (FieldKind::Id, _) => Ok(()),
            (FieldKind::Sum, Int(v)) => {
                store.incr_by(&key, *v).await?;
                Ok(())
            }
            (FieldKind::Sum, Float(v)) => {
                store.incr_by_float(&key, *v).await?;
                Ok(())
            }
            (FieldKind::Diff, Int(v)) => {
                store.incr_by(&key, -*v).await?;
                Ok(())
            }
            (FieldKind::Diff, Float(v)) => {
                store.incr_by_float(&key, -*v).await?;
                Ok(())
            }
            (FieldKind::ListAppend, List(items)) => {
                store.rpush(&key, items).await?;
                Ok(())
            }
            (FieldKind::SetAppend, Set(items)) => {
                for item in items {
                    store.sadd(&key, item).await?;
                }
                Ok(())
            }
            (FieldKind::WindowedList { window }, Windowed(items)) => {
                for (ts, item) in items {
                    store.zadd(&key, *ts as f64, item).await?;
                }
                // Trim to the newest `window` members.
                store
                    .zremrangebyrank(&key, 0, -(*window as i64) - 1)
                    .await?;
                Ok(())
            }
            (kind, value) => Err(PhononError::Argument(format!(
                "cannot cache {:?} as {:?}",
                value, kind
            ))),
        }
    }
}
