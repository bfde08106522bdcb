//! Capstone node controller device model
//!
//! # Purpose
//! The node controller is the hardware unit that keeps the capability
//! derivation forest for a Capstone machine: every capability in the
//! system points at a node here, and revoking one capability invalidates
//! the whole subtree derived from it without touching the capabilities
//! themselves. This crate models the full device: the request dispatcher,
//! the revocation engine over the node table, the pass-through path for
//! ordinary memory traffic, and the host-side capability bookkeeping.
//!
//! ## Architecture
//! ```text
//!             +--------------------------------------------+
//!   CPU <---->| CpuPort   Dispatcher ----> RevocationEngine |
//!   link      |              |                (node table)  |
//!             |              v                              |
//!             |          PassThrough        CapTracker      |
//!             | MemPort     (FIFO)        ObjectRegistry    |
//!             +--------------------------------------------+
//!   mem  <----+
//!   link
//! ```
//!
//! One [`NodeController`] owns all of it; [`NodeController::tick`] is the
//! only place state advances, so the node table has exactly one writer and
//! no locking anywhere.
//!
//! # Testing Strategy
//! Each module unit-tests its own lane; `tests/integration_test.rs` drives
//! the assembled device over its links, with the memory model from
//! `capstone-mem-model` on the far side.

mod config;
mod controller;
mod dispatcher;
mod passthrough;
mod ports;
mod stats;
mod tracking;

pub use config::{
    NodeControllerConfig, DEFAULT_NODE_CAPACITY, DEFAULT_PORT_DEPTH, DEFAULT_REVOKE_BUDGET,
};
pub use controller::NodeController;
pub use dispatcher::{Admit, Dispatcher};
pub use passthrough::{Completion, PassThrough};
pub use ports::{cpu_channel, mem_channel, CpuLink, CpuPort, MemLink, MemPort};
pub use stats::ControllerStats;
pub use tracking::{CapLoc, CapTracker, ObjectRegistry, TrackingError};
