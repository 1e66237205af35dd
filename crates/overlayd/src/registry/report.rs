//! Per-round traffic report assembled from the nodes' summaries.

use std::fmt;

use overlay_core::{NodeId, TrafficCounters};

/// Traffic summaries of one round, one row per node, plus totals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficReport {
    pub rows: Vec<(NodeId, TrafficCounters)>,
    pub total: TrafficCounters,
}

impl TrafficReport {
    pub fn from_rows(mut rows: Vec<(NodeId, TrafficCounters)>) -> Self {
        rows.sort_unstable_by_key(|(id, _)| *id);
        let mut total = TrafficCounters::default();
        for (_, counters) in &rows {
            total.accumulate(counters);
        }
        Self { rows, total }
    }

    /// Every packet sent was received, and the payload sums agree.
    pub fn is_balanced(&self) -> bool {
        self.total.sent == self.total.received && self.total.sum_sent == self.total.sum_received
    }
}

impl fmt::Display for TrafficReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:<8} {:>10} {:>10} {:>10} {:>16} {:>16}",
            "node", "sent", "received", "relayed", "sum sent", "sum received"
        )?;
        let mut row = |label: &str, c: &TrafficCounters| {
            writeln!(
                f,
                "{:<8} {:>10} {:>10} {:>10} {:>16} {:>16}",
                label, c.sent, c.received, c.relayed, c.sum_sent, c.sum_received
            )
        };
        for (id, counters) in &self.rows {
            row(&format!("node {id}"), counters)?;
        }
        row("total", &self.total)
    }
}
