//! Live connections keyed by node id.
//!
//! Entries are never evicted on close. A closed entry stays in place as a
//! stale link until it is replaced, so callers can still see who dropped.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use overlay_core::{Message, NodeId};

use crate::connection::{Connection, ConnectionError};

#[derive(Clone, Default)]
pub struct ConnectionCache {
    by_id: Arc<DashMap<NodeId, Connection>>,
}

impl ConnectionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `conn` under `id`, returning whatever it replaced.
    pub fn insert(&self, id: NodeId, conn: Connection) -> Option<Connection> {
        self.by_id.insert(id, conn)
    }

    pub fn get(&self, id: NodeId) -> Option<Connection> {
        self.by_id.get(&id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.by_id.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Cached ids in ascending order.
    pub fn ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.by_id.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Ids whose connection is no longer open.
    pub fn stale_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .by_id
            .iter()
            .filter(|entry| !entry.value().is_open())
            .map(|entry| *entry.key())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Unicast to one node.
    pub fn send_to(&self, id: NodeId, message: &Message) -> Result<(), ConnectionError> {
        let conn = self.get(id).ok_or(ConnectionError::NoSuchPeer(id))?;
        conn.send(message)
    }

    /// Send to every cached node. Encodes once. Returns how many queues
    /// accepted the message; stale links are skipped and logged.
    pub fn broadcast(&self, message: &Message) -> usize {
        let payload = message.encode();
        let mut delivered = 0;
        for entry in self.by_id.iter() {
            match entry.value().send_data(payload.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(peer = *entry.key(), tag = ?message.tag(), error = %e, "broadcast skipped stale link");
                }
            }
        }
        delivered
    }

    /// Close every cached connection and empty the cache.
    pub fn close_all(&self) {
        for entry in self.by_id.iter() {
            entry.value().close();
        }
        self.by_id.clear();
    }

    /// Close every link and wait up to `grace` for their queues to flush.
    pub async fn shutdown(&self, grace: Duration) {
        let links: Vec<Connection> = self.by_id.iter().map(|entry| entry.value().clone()).collect();
        self.close_all();
        let flushed = futures::future::join_all(links.iter().map(|link| link.closed()));
        if tokio::time::timeout(grace, flushed).await.is_err() {
            tracing::warn!(links = links.len(), "links still flushing at shutdown");
        }
    }
}
