//! Overlay integration test harness.
//!
//! Every test starts its own registry on an OS-assigned loopback port and
//! drives it with real messaging nodes, hand-rolled protocol peers, or both.
//! Nothing here needs root or any setup outside the test process.
//!
//!   cargo test --test integration

mod infra;
mod registration;
mod rounds;
mod topology;

pub use infra::*;
