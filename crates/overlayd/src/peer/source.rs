use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use overlay_core::NodeId;

/// Deterministic stream of (destination, payload) pairs for one node.
///
/// The same seed, id and membership always produce the same packets.
pub struct PacketSource {
    rng: StdRng,
    targets: Vec<NodeId>,
}

impl PacketSource {
    pub fn new(seed: u64, id: NodeId, members: &[NodeId]) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed ^ id as u64),
            targets: members.iter().copied().filter(|&m| m != id).collect(),
        }
    }

    /// None when this node is alone in the overlay.
    pub fn next_packet(&mut self) -> Option<(NodeId, i32)> {
        if self.targets.is_empty() {
            return None;
        }
        let destination = self.targets[self.rng.gen_range(0..self.targets.len())];
        Some((destination, self.rng.gen()))
    }
}
