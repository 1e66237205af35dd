//! Per-round traffic accounting on a messaging node.
//!
//! Rounds are numbered from the node's last manifest: every TASK_INITIATE
//! opens the next one, and every DATA packet carries the number of the round
//! that generated it. A neighbor can start the next round before this node's
//! own TASK_INITIATE arrives, so packets stamped one round ahead are kept
//! aside and folded in when that round opens here.

use overlay_core::TrafficCounters;

#[derive(Debug, Default)]
pub(crate) struct RoundLedger {
    round: u32,
    current: TrafficCounters,
    early: TrafficCounters,
    summary_requested: bool,
    update_scheduled: bool,
}

impl RoundLedger {
    /// Start numbering again; a new manifest means a new overlay.
    pub(crate) fn restart(&mut self) {
        *self = Self::default();
    }

    /// Open the next round and return its number.
    pub(crate) fn begin(&mut self) -> u32 {
        self.round = self.round.wrapping_add(1);
        self.current = std::mem::take(&mut self.early);
        self.summary_requested = false;
        self.update_scheduled = false;
        self.round
    }

    pub(crate) fn round(&self) -> u32 {
        self.round
    }

    pub(crate) fn current(&self) -> TrafficCounters {
        self.current
    }

    /// Counters a packet stamped `round` belongs to. None for rounds that are
    /// already over or too far ahead.
    pub(crate) fn counters_for(&mut self, round: u32) -> Option<&mut TrafficCounters> {
        if round == self.round {
            Some(&mut self.current)
        } else if round == self.round.wrapping_add(1) {
            Some(&mut self.early)
        } else {
            None
        }
    }

    /// Record a locally generated packet.
    pub(crate) fn record_sent(&mut self, payload: i32) {
        self.current.record_sent(payload);
    }

    /// The registry asked for this round's counters. Returns the snapshot to
    /// report.
    pub(crate) fn summary_requested(&mut self) -> TrafficCounters {
        self.summary_requested = true;
        self.update_scheduled = false;
        self.current
    }

    /// Called after a packet of `round` was counted. True when the registry
    /// already holds a summary for it and no follow-up is pending yet; the
    /// caller then owns sending one.
    pub(crate) fn wants_update(&mut self, round: u32) -> bool {
        if round != self.round || !self.summary_requested || self.update_scheduled {
            return false;
        }
        self.update_scheduled = true;
        true
    }

    /// Counters for a follow-up summary of `round`, or None if that round has
    /// closed since the follow-up was scheduled.
    pub(crate) fn take_update(&mut self, round: u32) -> Option<TrafficCounters> {
        if round != self.round || !self.update_scheduled {
            return None;
        }
        self.update_scheduled = false;
        Some(self.current)
    }
}
