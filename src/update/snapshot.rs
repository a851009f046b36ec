//! Versioned encoding for cached update payloads
//!
//! A cached pessimistic update is a single opaque blob in the shared store.
//! The blob is a one-byte version tag followed by a bincode body with a
//! fixed field layout (strings and byte sequences are length-prefixed).
//! Decoding rejects versions this build does not know; cross-version
//! evolution adds a new tag rather than mutating the layout.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{PhononError, Result};

use super::UpdateMeta;

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u8 = 1;

/// The serialized form of a cached pessimistic update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot<A> {
    /// Resource id the payload belongs to.
    pub resource_id: String,
    /// Primary key of the record in the database.
    pub id: String,
    /// Target database name.
    pub database: String,
    /// Target collection name.
    pub collection: String,
    /// Lookup specification, serialized as JSON text. JSON values are not
    /// self-describing under bincode, so the envelope carries them opaquely.
    pub spec_json: Option<String>,
    /// The aggregated document.
    pub doc: A,
    /// Hard deadline of the session that wrote this snapshot.
    pub hard_expiration_ms: i64,
}

impl<A> Snapshot<A> {
    /// Build a snapshot from an update's metadata and document.
    pub fn from_parts(meta: &UpdateMeta, doc: A, hard_expiration_ms: i64) -> Result<Self> {
        let spec_json = match &meta.spec {
            Some(spec) => Some(
                serde_json::to_string(spec)
                    .map_err(|e| PhononError::Snapshot(format!("spec encode failed: {}", e)))?,
            ),
            None => None,
        };
        Ok(Self {
            resource_id: meta.resource_id.clone(),
            id: meta.id.clone(),
            database: meta.database.clone(),
            collection: meta.collection.clone(),
            spec_json,
            doc,
            hard_expiration_ms,
        })
    }
}

impl<A: Serialize> Snapshot<A> {
    /// Encode as a version-tagged blob.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = bincode::serialize(self)
            .map_err(|e| PhononError::Snapshot(format!("encode failed: {}", e)))?;
        let mut blob = Vec::with_capacity(body.len() + 1);
        blob.push(SNAPSHOT_VERSION);
        blob.extend_from_slice(&body);
        Ok(blob)
    }
}

impl<A: DeserializeOwned> Snapshot<A> {
    /// Decode a version-tagged blob.
    pub fn decode(blob: &[u8]) -> Result<Self> {
        let (&version, body) = blob
            .split_first()
            .ok_or_else(|| PhononError::Snapshot("empty snapshot payload".to_string()))?;
        if version != SNAPSHOT_VERSION {
            return Err(PhononError::UnknownSnapshotVersion(version));
        }
        bincode::deserialize(body)
            .map_err(|e| PhononError::Snapshot(format!("decode failed: {}", e)))
    }
}
