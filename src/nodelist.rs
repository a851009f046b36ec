//! Per-resource membership tracking
//!
//! Each resource keeps a shared hash of node-id to the time that node last
//! refreshed its session. The nodelist is how peers learn who is still
//! interested in a resource: entries older than the session length are
//! treated as abandoned and pruned.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{now_ms, to_ms};
use crate::error::Result;
use crate::store::{Keyspace, SharedStore};

/// Mapping of node-id to last-refresh timestamp for one resource.
pub struct Nodelist {
    store: Arc<dyn SharedStore>,
    nodelist_key: String,
    session_length: Duration,
}

impl Nodelist {
    /// Create a handle to the nodelist of `resource`.
    pub fn new(
        store: Arc<dyn SharedStore>,
        keyspace: &Keyspace,
        resource: &str,
        session_length: Duration,
    ) -> Self {
        Self {
            store,
            nodelist_key: keyspace.nodelist(resource),
            session_length,
        }
    }

    /// The shared-store key this nodelist lives at.
    pub fn key(&self) -> &str {
        &self.nodelist_key
    }

    /// Add or refresh a node, attributing the current time to it.
    pub async fn refresh_session(&self, node_id: &str) -> Result<()> {
        self.store
            .hset(&self.nodelist_key, node_id, &now_ms().to_string())
            .await?;
        Ok(())
    }

    /// Nodes that have held their reference longer than the session length
    /// without refreshing. Does not remove them.
    ///
    /// With `node_ids`, only those candidates are checked; otherwise the
    /// whole nodelist is scanned.
    pub async fn find_expired(&self, node_ids: Option<&[String]>) -> Result<Vec<String>> {
        let cutoff = now_ms() - to_ms(self.session_length);
        match node_ids {
            Some(ids) => {
                let mut expired = Vec::new();
                for id in ids {
                    if let Some(raw) = self.store.hget(&self.nodelist_key, id).await? {
                        if raw.parse::<i64>().map(|t| t < cutoff).unwrap_or(true) {
                            expired.push(id.clone());
                        }
                    }
                }
                Ok(expired)
            }
            None => {
                let nodes = self.store.hgetall(&self.nodelist_key).await?;
                Ok(nodes
                    .into_iter()
                    .filter(|(_, raw)| raw.parse::<i64>().map(|t| t < cutoff).unwrap_or(true))
                    .map(|(id, _)| id)
                    .collect())
            }
        }
    }

    /// Remove expired nodes.
    ///
    /// Candidates are re-checked against current timestamps immediately
    /// before deletion, so a node whose session was refreshed between the
    /// caller's scan and this call is kept.
    pub async fn remove_expired(&self, candidates: Option<&[String]>) -> Result<()> {
        let expired = self.find_expired(candidates).await?;
        if !expired.is_empty() {
            let fields: Vec<&str> = expired.iter().map(String::as_str).collect();
            self.store.hdel(&self.nodelist_key, &fields).await?;
        }
        Ok(())
    }

    /// Remove one node unconditionally.
    pub async fn remove_node(&self, node_id: &str) -> Result<()> {
        self.store.hdel(&self.nodelist_key, &[node_id]).await?;
        Ok(())
    }

    /// Drop the whole nodelist.
    pub async fn clear(&self) -> Result<()> {
        self.store.del(&[self.nodelist_key.as_str()]).await?;
        Ok(())
    }

    /// The last refresh time for a node, if present.
    pub async fn get_last_updated(&self, node_id: &str) -> Result<Option<i64>> {
        Ok(self
            .store
            .hget(&self.nodelist_key, node_id)
            .await?
            .and_then(|raw| raw.parse().ok()))
    }

    /// All nodes with their last refresh times.
    pub async fn get_all_nodes(&self) -> Result<HashMap<String, i64>> {
        Ok(self
            .store
            .hgetall(&self.nodelist_key)
            .await?
            .into_iter()
            .filter_map(|(id, raw)| raw.parse().ok().map(|t| (id, t)))
            .collect())
    }

    /// The number of nodes currently in the nodelist.
    pub async fn count(&self) -> Result<u64> {
        self.store.hlen(&self.nodelist_key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn nodelist(store: Arc<dyn SharedStore>, session_length: Duration) -> Nodelist {
        Nodelist::new(store, &Keyspace::new("phonon"), "res", session_length)
    }

    #[tokio::test]
    async fn test_refresh_adds_and_updates() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let list = nodelist(Arc::clone(&store), Duration::from_secs(60));

        list.refresh_session("n1").await.unwrap();
        let first = list.get_last_updated("n1").await.unwrap().unwrap();
        assert_eq!(list.count().await.unwrap(), 1);

        tokio::time::sleep(Duration::from_millis(5)).await;
        list.refresh_session("n1").await.unwrap();
        let second = list.get_last_updated("n1").await.unwrap().unwrap();
        assert!(second >= first);
        assert_eq!(list.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_expired_nodes_are_found_and_removed() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let list = nodelist(Arc::clone(&store), Duration::from_millis(20));

        list.refresh_session("old").await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        list.refresh_session("fresh").await.unwrap();

        let expired = list.find_expired(None).await.unwrap();
        assert_eq!(expired, vec!["old".to_string()]);

        list.remove_expired(None).await.unwrap();
        assert_eq!(list.count().await.unwrap(), 1);
        assert!(list.get_last_updated("old").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remove_expired_recheck_keeps_refreshed_node() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let list = nodelist(Arc::clone(&store), Duration::from_millis(20));

        list.refresh_session("n1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        // The node looked expired, but refreshed before the removal ran.
        let candidates = list.find_expired(None).await.unwrap();
        assert_eq!(candidates.len(), 1);
        list.refresh_session("n1").await.unwrap();
        list.remove_expired(Some(&candidates)).await.unwrap();

        assert_eq!(list.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_clear_and_remove_node() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let list = nodelist(Arc::clone(&store), Duration::from_secs(60));

        list.refresh_session("a").await.unwrap();
        list.refresh_session("b").await.unwrap();
        list.remove_node("a").await.unwrap();
        assert_eq!(list.count().await.unwrap(), 1);

        list.clear().await.unwrap();
        assert_eq!(list.count().await.unwrap(), 0);
    }
}
