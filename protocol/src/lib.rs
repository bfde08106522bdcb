//! Wire protocol for the Capstone node controller
//!
//! # Purpose
//! Defines the packet vocabulary spoken on the controller's two ports: the
//! CPU-side request/response pair and the memory-side request/response pair
//! for pass-through traffic.
//!
//! # Architecture
//! Requests exist in two forms:
//! - Typed: [`Request`] carrying a [`Command`] - what the dispatcher and
//!   everything behind it operate on.
//! - Raw: a fixed word-oriented frame (see [`wire`]) - what a transport can
//!   carry without knowing the enums. Decoding failures map onto the
//!   `MalformedRequest` error status rather than being dropped.
//!
//! Node handles travel as packed 64-bit words; the all-ones word means
//! "no node" and, in a derive request, asks for a new tree root.

mod command;
mod packet;
pub mod wire;

pub use command::{opcode, Command, CommandClass, RequestTag, RequesterId};
pub use packet::{
    ErrorCode, MemRequest, MemRequestKind, MemResponse, MemResponseBody, MemTag, Request,
    Response, ResponseBody,
};
pub use wire::{DecodeError, NODE_TABLE_BASE, NODE_RECORD_STRIDE};
