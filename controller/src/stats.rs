//! Controller counters
//!
//! Mirrors the statistics the modeled hardware exports: one counter per
//! observable event, updated as the event happens, readable at any tick.

/// Node controller statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControllerStats {
    /// Nodes created (roots and children)
    pub derives: u64,
    /// Revocations completed (idempotent re-revokes included)
    pub revokes: u64,
    /// Validity flags flipped by revocations
    pub nodes_revoked: u64,
    /// Slots reclaimed by revocation walks and rc updates
    pub nodes_freed: u64,
    /// Validity queries served
    pub queries: u64,
    /// Unlinks completed
    pub unlinks: u64,
    /// Reference-count updates completed
    pub rc_updates: u64,
    /// Node-table operations answered with an error status
    pub node_op_errors: u64,
    /// Requests rejected as malformed
    pub malformed_requests: u64,
    /// Pass-through requests issued downstream
    pub passthrough_issued: u64,
    /// Pass-through responses delivered back to the CPU side
    pub passthrough_completed: u64,
    /// Pass-through requests that hit the timeout bound
    pub passthrough_timed_out: u64,
    /// Downstream responses dropped because their request already timed out
    pub passthrough_late_dropped: u64,
    /// Responses pushed out the CPU-side port
    pub responses_sent: u64,
}

impl ControllerStats {
    /// Node-table operations completed, successes and errors together
    pub fn node_ops(&self) -> u64 {
        self.derives
            + self.revokes
            + self.queries
            + self.unlinks
            + self.rc_updates
            + self.node_op_errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_ops_totals_all_outcomes() {
        let stats = ControllerStats {
            derives: 2,
            revokes: 1,
            queries: 5,
            unlinks: 1,
            rc_updates: 3,
            node_op_errors: 4,
            ..Default::default()
        };
        assert_eq!(stats.node_ops(), 16);
    }
}
