//! Request/response packets for both controller ports
//!
//! CPU-side traffic pairs a [`Request`] with exactly one [`Response`],
//! correlated by the requester-chosen tag. Memory-side traffic uses the
//! controller's own [`MemTag`] namespace so downstream completions can be
//! matched back to the pass-through request that caused them.

use capstone_node_table::{NodeHandle, NodeTableError};
use serde::{Deserialize, Serialize};

use crate::command::{Command, RequestTag, RequesterId};

/// One CPU-side request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Correlation tag, echoed in the response
    pub tag: RequestTag,

    /// Originating core/thread
    pub requester: RequesterId,

    /// What to do
    pub command: Command,
}

impl Request {
    /// Create a request
    pub fn new(tag: RequestTag, requester: RequesterId, command: Command) -> Self {
        Self {
            tag,
            requester,
            command,
        }
    }
}

/// Result payload of a completed request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseBody {
    /// Handle of the node a derive created
    Handle(NodeHandle),

    /// Validity flag a query read
    Validity(bool),

    /// Reference count after an rc update
    RefCount(u32),

    /// Bytes a pass-through read returned
    Data(Vec<u8>),

    /// Completion without payload (revoke, unlink, pass-through write)
    Ack,

    /// The request failed with this status
    Error(ErrorCode),
}

/// One CPU-side response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// Tag of the request this answers
    pub tag: RequestTag,

    /// Requester the response is routed back to
    pub requester: RequesterId,

    /// Result payload or error status
    pub body: ResponseBody,
}

impl Response {
    /// Create a success response
    pub fn new(tag: RequestTag, requester: RequesterId, body: ResponseBody) -> Self {
        Self {
            tag,
            requester,
            body,
        }
    }

    /// Create an error response
    pub fn error(tag: RequestTag, requester: RequesterId, code: ErrorCode) -> Self {
        Self {
            tag,
            requester,
            body: ResponseBody::Error(code),
        }
    }

    /// Check whether this response reports a failure
    #[inline]
    pub fn is_error(&self) -> bool {
        matches!(self.body, ResponseBody::Error(_))
    }

    /// Error status, if this response reports a failure
    #[inline]
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self.body {
            ResponseBody::Error(code) => Some(code),
            _ => None,
        }
    }
}

/// Error status carried in a response
///
/// Values are part of the wire format and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum ErrorCode {
    /// Node table full; nothing was allocated
    CapacityExceeded = 1,

    /// The handle names a freed or recycled slot
    StaleReference = 2,

    /// Derivation parent is invalid, terminal, or missing
    InvalidParent = 3,

    /// Operation target does not exist (or has no parent, for unlink)
    NotFound = 4,

    /// The request could not be classified or decoded
    MalformedRequest = 5,

    /// No response arrived from memory within the configured bound
    MemoryTimeout = 6,

    /// A reference-count update would go below zero
    RefCountUnderflow = 7,
}

impl ErrorCode {
    /// Stable name for logs and trace output
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::CapacityExceeded => "capacity-exceeded",
            ErrorCode::StaleReference => "stale-reference",
            ErrorCode::InvalidParent => "invalid-parent",
            ErrorCode::NotFound => "not-found",
            ErrorCode::MalformedRequest => "malformed-request",
            ErrorCode::MemoryTimeout => "memory-timeout",
            ErrorCode::RefCountUnderflow => "refcount-underflow",
        }
    }
}

impl core::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<NodeTableError> for ErrorCode {
    fn from(err: NodeTableError) -> Self {
        match err {
            NodeTableError::CapacityExceeded { .. } => ErrorCode::CapacityExceeded,
            NodeTableError::StaleReference { .. } => ErrorCode::StaleReference,
            NodeTableError::InvalidParent { .. } => ErrorCode::InvalidParent,
            NodeTableError::NotFound { .. } => ErrorCode::NotFound,
            NodeTableError::RefCountUnderflow { .. } => ErrorCode::RefCountUnderflow,
        }
    }
}

/// Controller-private tag correlating downstream traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemTag(pub u64);

/// What a downstream request asks memory to do
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemRequestKind {
    /// Read `size` bytes at `addr`
    Read { addr: u64, size: u32 },

    /// Store bytes at `addr`
    Write { addr: u64, data: Vec<u8> },
}

/// One memory-side request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemRequest {
    pub tag: MemTag,
    pub kind: MemRequestKind,
}

/// Payload of a memory-side completion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemResponseBody {
    /// Bytes a read returned
    Data(Vec<u8>),

    /// A write was performed
    Written,
}

/// One memory-side completion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemResponse {
    pub tag: MemTag,
    pub body: MemResponseBody,
}

// Both are words of the raw frame format
static_assertions::const_assert_eq!(core::mem::size_of::<ErrorCode>(), 4);
static_assertions::const_assert_eq!(core::mem::size_of::<MemTag>(), 8);
