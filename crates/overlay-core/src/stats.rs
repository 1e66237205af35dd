//! Traffic counters kept by each messaging node for one task round.

use zerocopy::byteorder::{I64, U32};

use crate::wire::TrafficRecord;

/// Per-node traffic statistics.
///
/// Sums use wrapping arithmetic so a long round never panics; they are
/// deterministic given the generated payloads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficCounters {
    /// Packets this node originated.
    pub sent: u32,
    /// Packets this node forwarded on behalf of others.
    pub relayed: u32,
    /// Packets addressed to this node that arrived.
    pub received: u32,
    pub sum_sent: i64,
    pub sum_received: i64,
}

impl TrafficCounters {
    pub fn record_sent(&mut self, payload: i32) {
        self.sent = self.sent.wrapping_add(1);
        self.sum_sent = self.sum_sent.wrapping_add(i64::from(payload));
    }

    pub fn record_received(&mut self, payload: i32) {
        self.received = self.received.wrapping_add(1);
        self.sum_received = self.sum_received.wrapping_add(i64::from(payload));
    }

    pub fn record_relayed(&mut self) {
        self.relayed = self.relayed.wrapping_add(1);
    }

    /// Add another node's counters into this one (registry totals).
    pub fn accumulate(&mut self, other: &TrafficCounters) {
        self.sent = self.sent.wrapping_add(other.sent);
        self.relayed = self.relayed.wrapping_add(other.relayed);
        self.received = self.received.wrapping_add(other.received);
        self.sum_sent = self.sum_sent.wrapping_add(other.sum_sent);
        self.sum_received = self.sum_received.wrapping_add(other.sum_received);
    }

    pub fn to_record(&self) -> TrafficRecord {
        TrafficRecord {
            sent: U32::new(self.sent),
            relayed: U32::new(self.relayed),
            received: U32::new(self.received),
            sum_sent: I64::new(self.sum_sent),
            sum_received: I64::new(self.sum_received),
        }
    }

    pub fn from_record(record: &TrafficRecord) -> Self {
        Self {
            sent: record.sent.get(),
            relayed: record.relayed.get(),
            received: record.received.get(),
            sum_sent: record.sum_sent.get(),
            sum_received: record.sum_received.get(),
        }
    }
}
