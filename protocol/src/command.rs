//! Commands accepted on the CPU-side port
//!
//! Node-table commands carry node handles and operands; ordinary reads and
//! writes carry an address and either a size or the bytes to store. The
//! dispatcher classifies every command into one of three routes: the
//! pass-through path, the immediate query path, or the serialized mutation
//! queue.

use capstone_node_table::{Derivation, NodeHandle};
use serde::{Deserialize, Serialize};

/// Wire opcodes, one per command
///
/// Opcode values are part of the raw frame format and never reused.
pub mod opcode {
    /// Ordinary memory read (pass-through)
    pub const MEM_READ: u32 = 0x00;

    /// Ordinary memory write (pass-through)
    pub const MEM_WRITE: u32 = 0x01;

    /// Derive a node under a parent, or a new root when the parent word is
    /// the "no node" sentinel
    pub const DERIVE: u32 = 0x10;

    /// Invalidate a node and its whole subtree
    pub const REVOKE: u32 = 0x11;

    /// Read a node's validity flag
    pub const QUERY: u32 = 0x12;

    /// Detach a node from its parent without revoking it
    pub const UNLINK: u32 = 0x13;

    /// Adjust a node's reference count by a signed delta
    pub const RCUPDATE: u32 = 0x14;
}

/// Identity of the requesting core/thread
///
/// Pass-through ordering is guaranteed per requester, never across
/// requesters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequesterId(pub u32);

/// Requester-chosen correlation tag echoed in the response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestTag(pub u64);

/// One CPU-side command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Read `size` bytes at `addr` from downstream memory
    MemRead { addr: u64, size: u32 },

    /// Write bytes at `addr` to downstream memory
    MemWrite { addr: u64, data: Vec<u8> },

    /// Create a node: a root when `parent` is `None`, otherwise a child
    /// under `parent`
    Derive {
        parent: Option<NodeHandle>,
        derivation: Derivation,
    },

    /// Invalidate `node` and every descendant
    Revoke { node: NodeHandle },

    /// Read the validity flag of `node`
    Query { node: NodeHandle },

    /// Detach `node` from its parent's child set
    Unlink { node: NodeHandle },

    /// Adjust the reference count of `node` by `delta`
    RcUpdate { node: NodeHandle, delta: i32 },
}

/// Which route a command takes through the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandClass {
    /// Forwarded downstream, per-requester FIFO
    PassThrough,

    /// Served immediately from the validity flag; may overtake mutations
    NodeQuery,

    /// Enters the serialized mutation queue, one active at a time
    NodeMutation,
}

impl Command {
    /// Wire opcode of this command
    #[inline]
    pub fn opcode(&self) -> u32 {
        match self {
            Command::MemRead { .. } => opcode::MEM_READ,
            Command::MemWrite { .. } => opcode::MEM_WRITE,
            Command::Derive { .. } => opcode::DERIVE,
            Command::Revoke { .. } => opcode::REVOKE,
            Command::Query { .. } => opcode::QUERY,
            Command::Unlink { .. } => opcode::UNLINK,
            Command::RcUpdate { .. } => opcode::RCUPDATE,
        }
    }

    /// Dispatch route for this command
    #[inline]
    pub fn class(&self) -> CommandClass {
        match self {
            Command::MemRead { .. } | Command::MemWrite { .. } => CommandClass::PassThrough,
            Command::Query { .. } => CommandClass::NodeQuery,
            Command::Derive { .. }
            | Command::Revoke { .. }
            | Command::Unlink { .. }
            | Command::RcUpdate { .. } => CommandClass::NodeMutation,
        }
    }

    /// Check whether this command mutates the node table
    #[inline]
    pub fn is_mutation(&self) -> bool {
        self.class() == CommandClass::NodeMutation
    }
}
