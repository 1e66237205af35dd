//! overlayd: registry and messaging node for the hypercube overlay.
//!
//! A registry admits peers and assigns them dense ids, computes every
//! node's routing table, pushes manifests and drives task rounds. Messaging
//! nodes register, link up with their neighbors, route generated packets
//! and report traffic counters.

pub mod cache;
pub mod command;
pub mod connection;
pub mod dispatch;
pub mod peer;
pub mod registry;

pub use cache::ConnectionCache;
pub use connection::{ConnState, Connection, ConnectionError};
pub use dispatch::{Dispatcher, EventHandler};
pub use peer::{MessagingNode, PeerError};
pub use registry::{RegistrationError, Registry, TrafficReport};

/// Install the tracing subscriber used by both binaries. RUST_LOG wins;
/// `info` otherwise.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
