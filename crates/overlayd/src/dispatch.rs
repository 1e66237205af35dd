//! Routes incoming frames to the component that owns their tag.

use std::collections::HashMap;
use std::sync::Arc;

use overlay_core::wire::Tag;
use overlay_core::Message;

use crate::connection::Connection;

/// A component that consumes decoded messages: the registry or a node.
pub trait EventHandler: Send + Sync {
    /// Handle one message that arrived on `conn`. Errors are logged by the
    /// dispatcher; the receive loop keeps going.
    fn handle(&self, conn: &Connection, message: Message) -> anyhow::Result<()>;

    /// The link broke without anyone asking it to close.
    fn connection_lost(&self, _conn: &Connection) {}
}

/// Maps tags to handlers and dispatches decoded frames.
pub struct Dispatcher {
    handlers: HashMap<Tag, Arc<dyn EventHandler>>,
    /// Receives connection-lost events.
    owner: Option<Arc<dyn EventHandler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            owner: None,
        }
    }

    /// A dispatcher where one component owns `tags` and the connection
    /// lifecycle.
    pub fn for_owner(owner: Arc<dyn EventHandler>, tags: &[Tag]) -> Self {
        let mut d = Self::new();
        for tag in tags {
            d.register(*tag, owner.clone());
        }
        d.owner = Some(owner);
        d
    }

    /// Register the handler for one tag, replacing any previous one.
    pub fn register(&mut self, tag: Tag, handler: Arc<dyn EventHandler>) {
        self.handlers.insert(tag, handler);
    }

    /// Decode a frame and hand it to its handler.
    /// Returns false if the frame was dropped.
    pub fn dispatch(&self, conn: &Connection, frame: &[u8]) -> bool {
        let message = match Message::decode(frame) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(
                    remote = %conn.remote_addr(),
                    len = frame.len(),
                    head = hex::encode(&frame[..frame.len().min(16)]),
                    error = %e,
                    "dropping undecodable frame"
                );
                return false;
            }
        };

        let tag = message.tag();
        let Some(handler) = self.handlers.get(&tag) else {
            tracing::warn!(remote = %conn.remote_addr(), ?tag, "no handler for message");
            return false;
        };

        if let Err(e) = handler.handle(conn, message) {
            tracing::warn!(
                remote = %conn.remote_addr(),
                peer = conn.peer_id(),
                ?tag,
                error = %e,
                "message handling failed"
            );
        }
        true
    }

    /// Tell the owner a link broke.
    pub fn connection_lost(&self, conn: &Connection) {
        match &self.owner {
            Some(owner) => owner.connection_lost(conn),
            None => tracing::warn!(remote = %conn.remote_addr(), "connection lost"),
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}
