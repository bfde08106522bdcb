//! Revocation forest for the Capstone node controller
//!
//! # Purpose
//! The node table is the authoritative record of every live capability in
//! the system. Each capability is backed by a node in a revocation forest;
//! revoking a node invalidates its entire subtree so that every capability
//! derived from it dies with it.
//!
//! # Architecture
//! Two layers:
//! - [`store::NodeStore`] - a fixed-capacity arena that owns every node
//!   record. Slots are recycled through a free list, and each slot carries a
//!   generation counter so recycled slots can never be reached through an
//!   old handle.
//! - [`engine::RevocationEngine`] - the forest operations (derive, revoke,
//!   query, unlink, refcount maintenance) layered over the store.
//!
//! All references between nodes, and all references handed to callers, are
//! [`NodeHandle`]s (index + generation), never pointers. A handle that has
//! outlived its node fails with [`NodeTableError::StaleReference`] instead
//! of aliasing whatever the slot holds now.
//!
//! # Testing Strategy
//! - Unit tests: slot recycling, generation checks, walk bookkeeping
//! - Integration tests: full derive/revoke scenarios live in the
//!   `capstone-controller` crate

mod engine;
mod node;
mod store;

pub use engine::{RevocationEngine, RevokeProgress, RevokeWalk};
pub use node::{handle_bits, Bounds, Derivation, Node, NodeHandle, NodeKind, NODE_HANDLE_NONE_BITS};
pub use store::{NodeStore, StoreStats};

use thiserror::Error;

/// Error types for node-table operations
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum NodeTableError {
    #[error("node table full (capacity: {capacity})")]
    CapacityExceeded { capacity: usize },

    #[error("stale node reference: {handle:?}")]
    StaleReference { handle: NodeHandle },

    #[error("invalid parent for derivation: {handle:?}")]
    InvalidParent { handle: NodeHandle },

    #[error("node not found: {handle:?}")]
    NotFound { handle: NodeHandle },

    #[error("reference count underflow on {handle:?} (count: {count}, delta: {delta})")]
    RefCountUnderflow {
        handle: NodeHandle,
        count: u32,
        delta: i32,
    },
}

pub type Result<T> = core::result::Result<T, NodeTableError>;
