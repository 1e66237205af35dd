//! overlay-core: wire format, framing, message codec and routing types.
//! The overlay daemon crate and the integration tests depend on this one.

pub mod config;
pub mod frame;
pub mod message;
pub mod routing;
pub mod stats;
pub mod wire;

pub use message::Message;
pub use routing::{NodeId, RegisterItem, Route, RoutingTable};
pub use stats::TrafficCounters;
