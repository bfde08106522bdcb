//! Controller configuration
//!
//! Owned by whatever wires the controller into a system: tests, the trace
//! tool, or a larger simulation. The controller itself never reads files or
//! environment; everything arrives through this struct.

/// Node-table capacity of the hardware the model is based on
pub const DEFAULT_NODE_CAPACITY: usize = 65536;

/// Default revocation visits per clock tick
pub const DEFAULT_REVOKE_BUDGET: usize = 8;

/// Default depth of both port channels
pub const DEFAULT_PORT_DEPTH: usize = 64;

/// Node controller configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeControllerConfig {
    /// Slots in the node table
    pub node_capacity: usize,

    /// Nodes a revocation walk may visit per tick; the walk spans several
    /// ticks when the subtree is larger
    pub revoke_budget: usize,

    /// Ticks a pass-through request may stay unanswered before it completes
    /// with a timeout error; `None` waits forever
    pub mem_timeout: Option<u64>,

    /// Bounded capacity of each port channel
    pub port_depth: usize,
}

impl NodeControllerConfig {
    /// Create config with a given node-table capacity and defaults for the
    /// rest
    pub const fn with_capacity(node_capacity: usize) -> Self {
        Self {
            node_capacity,
            revoke_budget: DEFAULT_REVOKE_BUDGET,
            mem_timeout: None,
            port_depth: DEFAULT_PORT_DEPTH,
        }
    }

    /// Set the per-tick revocation budget
    ///
    /// # Panics
    /// Panics on a zero budget; a walk that may visit no nodes per tick
    /// never finishes.
    pub const fn revoke_budget(mut self, budget: usize) -> Self {
        assert!(budget > 0, "revoke budget must be nonzero");
        self.revoke_budget = budget;
        self
    }

    /// Set the pass-through timeout in ticks
    pub const fn mem_timeout(mut self, ticks: u64) -> Self {
        self.mem_timeout = Some(ticks);
        self
    }

    /// Set the port channel depth
    ///
    /// # Panics
    /// Panics on zero depth; the ports use non-blocking sends, which a
    /// zero-capacity channel always refuses.
    pub const fn port_depth(mut self, depth: usize) -> Self {
        assert!(depth > 0, "port depth must be nonzero");
        self.port_depth = depth;
        self
    }
}

impl Default for NodeControllerConfig {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_NODE_CAPACITY)
    }
}
