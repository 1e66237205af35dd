//! Hypercube-style overlay: node i links to (i + 2^j) mod N for j < k.

use overlay_core::{RegisterItem, RoutingTable};

/// Neighbor indices of node `i` in an overlay of `n` nodes with manifest
/// size `k`. Never contains `i` and never repeats an index.
pub fn neighbor_indices(i: usize, n: usize, k: u32) -> Vec<usize> {
    let mut neighbors = Vec::new();
    if n == 0 {
        return neighbors;
    }

    // 2^j mod n repeats with period at most n, so nothing new shows up
    // after that many steps.
    let steps = (k as usize).min(n + usize::BITS as usize);
    let mut offset = 1 % n;
    for _ in 0..steps {
        let candidate = (i + offset) % n;
        if candidate != i && !neighbors.contains(&candidate) {
            neighbors.push(candidate);
        }
        offset = (offset * 2) % n;
    }
    neighbors
}

/// One routing table per registered item, indexed like `items`.
pub fn compute_routing_tables(items: &[RegisterItem], k: u32) -> Vec<RoutingTable> {
    (0..items.len())
        .map(|i| {
            neighbor_indices(i, items.len(), k)
                .into_iter()
                .map(|j| items[j].route())
                .collect()
        })
        .collect()
}
