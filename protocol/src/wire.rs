//! Raw frame codec and address-space reservations
//!
//! A transport that cannot carry the typed enums carries requests as flat
//! little-endian word frames instead:
//!
//! ```text
//! word 0:  opcode (low 32) | requester id (high 32)
//! word 1:  correlation tag
//! word 2+: operands, per opcode
//! ```
//!
//! | opcode    | operand words                                            |
//! |-----------|----------------------------------------------------------|
//! | MEM_READ  | addr, size                                               |
//! | MEM_WRITE | addr, payload length; payload bytes follow the words     |
//! | DERIVE    | parent handle, derivation kind, bounds base, bounds len  |
//! | REVOKE    | node handle                                              |
//! | QUERY     | node handle                                              |
//! | UNLINK    | node handle                                              |
//! | RCUPDATE  | node handle, signed delta                                |
//!
//! Frames are strict: short frames, trailing bytes, unknown opcodes and
//! contradictory operands are all rejected, and the dispatcher reports
//! every rejection as a `MalformedRequest` response.

use capstone_node_table::{handle_bits, Bounds, Derivation, NodeHandle, NODE_HANDLE_NONE_BITS};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::command::{opcode, Command, RequestTag, RequesterId};
use crate::packet::{ErrorCode, Request};

/// Base physical address of the reserved node-table window
pub const NODE_TABLE_BASE: u64 = 0x1000_0000_0000;

/// Bytes of window reserved per node slot
pub const NODE_RECORD_STRIDE: u64 = 64;

/// Largest pass-through access the controller accepts, in bytes
pub const MAX_ACCESS_SIZE: u32 = 4096;

const WORD: usize = 8;
const HEADER_WORDS: usize = 2;

/// The reserved window for a table of `capacity` slots
///
/// Ordinary accesses that overlap this window are malformed: the window is
/// command space, not storage.
pub fn node_table_window(capacity: usize) -> Bounds {
    Bounds::new(NODE_TABLE_BASE, capacity as u64 * NODE_RECORD_STRIDE)
}

/// Raw frame rejection reasons
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame truncated at {len} bytes")]
    Truncated { len: usize },

    #[error("frame carries {len} bytes, expected {expected}")]
    TrailingBytes { len: usize, expected: usize },

    #[error("unknown opcode {opcode:#x}")]
    UnknownOpcode { opcode: u32 },

    #[error("access size {size} outside 1..={MAX_ACCESS_SIZE}")]
    BadAccessSize { size: u64 },

    #[error("write declares {declared} payload bytes, frame carries {available}")]
    PayloadLength { declared: u64, available: usize },

    #[error("command requires a node operand, got the reserved sentinel")]
    MissingNode,

    #[error("leaf derivation without a parent")]
    LeafWithoutParent,

    #[error("unknown derivation kind {kind}")]
    UnknownDerivation { kind: u64 },

    #[error("refcount delta {delta} outside the signed 32-bit range")]
    DeltaRange { delta: i64 },

    #[error("codec failure: {0}")]
    Codec(String),
}

impl From<DecodeError> for ErrorCode {
    fn from(_: DecodeError) -> Self {
        ErrorCode::MalformedRequest
    }
}

/// Encode a request as a raw frame
pub fn encode_request(request: &Request) -> Vec<u8> {
    let mut frame = Vec::with_capacity(6 * WORD);
    let header = (request.command.opcode() as u64) | ((request.requester.0 as u64) << 32);
    push_word(&mut frame, header);
    push_word(&mut frame, request.tag.0);

    match &request.command {
        Command::MemRead { addr, size } => {
            push_word(&mut frame, *addr);
            push_word(&mut frame, *size as u64);
        }
        Command::MemWrite { addr, data } => {
            push_word(&mut frame, *addr);
            push_word(&mut frame, data.len() as u64);
            frame.extend_from_slice(data);
        }
        Command::Derive { parent, derivation } => {
            push_word(&mut frame, handle_bits(*parent));
            match derivation {
                Derivation::Branch => {
                    push_word(&mut frame, 0);
                    push_word(&mut frame, 0);
                    push_word(&mut frame, 0);
                }
                Derivation::Leaf { bounds } => {
                    push_word(&mut frame, 1);
                    push_word(&mut frame, bounds.base);
                    push_word(&mut frame, bounds.length);
                }
            }
        }
        Command::Revoke { node } | Command::Query { node } | Command::Unlink { node } => {
            push_word(&mut frame, node.to_bits());
        }
        Command::RcUpdate { node, delta } => {
            push_word(&mut frame, node.to_bits());
            push_word(&mut frame, *delta as i64 as u64);
        }
    }
    frame
}

/// Read the correlation tag and requester out of a frame header
///
/// Works on frames [`decode_request`] rejects, as long as both header
/// words are present, so a malformed frame can still be answered to the
/// sender that is waiting on it. `None` means the frame is too short to
/// answer at all.
pub fn peek_header(frame: &[u8]) -> Option<(RequestTag, RequesterId)> {
    let header = word(frame, 0).ok()?;
    let tag = word(frame, 1).ok()?;
    Some((RequestTag(tag), RequesterId((header >> 32) as u32)))
}

/// Decode a raw frame into a request
///
/// # Errors
/// Any [`DecodeError`]; the caller answers with `MalformedRequest`.
pub fn decode_request(frame: &[u8]) -> Result<Request, DecodeError> {
    let header = word(frame, 0)?;
    let tag = word(frame, 1)?;
    let op = header as u32;
    let requester = RequesterId((header >> 32) as u32);
    let tag = RequestTag(tag);

    let command = match op {
        opcode::MEM_READ => {
            expect_len(frame, (HEADER_WORDS + 2) * WORD)?;
            let addr = word(frame, 2)?;
            let size = word(frame, 3)?;
            check_access_size(size)?;
            Command::MemRead {
                addr,
                size: size as u32,
            }
        }
        opcode::MEM_WRITE => {
            let addr = word(frame, 2)?;
            let declared = word(frame, 3)?;
            check_access_size(declared)?;
            let body_start = (HEADER_WORDS + 2) * WORD;
            let available = frame.len().saturating_sub(body_start);
            if available != declared as usize {
                return Err(DecodeError::PayloadLength {
                    declared,
                    available,
                });
            }
            Command::MemWrite {
                addr,
                data: frame[body_start..].to_vec(),
            }
        }
        opcode::DERIVE => {
            expect_len(frame, (HEADER_WORDS + 4) * WORD)?;
            let parent = NodeHandle::from_bits(word(frame, 2)?);
            let kind = word(frame, 3)?;
            let derivation = match kind {
                0 => Derivation::Branch,
                1 => Derivation::Leaf {
                    bounds: Bounds::new(word(frame, 4)?, word(frame, 5)?),
                },
                _ => return Err(DecodeError::UnknownDerivation { kind }),
            };
            if parent.is_none() && matches!(derivation, Derivation::Leaf { .. }) {
                // A root anchors a tree; a terminal root is contradictory
                return Err(DecodeError::LeafWithoutParent);
            }
            Command::Derive { parent, derivation }
        }
        opcode::REVOKE | opcode::QUERY | opcode::UNLINK => {
            expect_len(frame, (HEADER_WORDS + 1) * WORD)?;
            let node = require_node(word(frame, 2)?)?;
            match op {
                opcode::REVOKE => Command::Revoke { node },
                opcode::QUERY => Command::Query { node },
                _ => Command::Unlink { node },
            }
        }
        opcode::RCUPDATE => {
            expect_len(frame, (HEADER_WORDS + 2) * WORD)?;
            let node = require_node(word(frame, 2)?)?;
            let delta = word(frame, 3)? as i64;
            if delta < i32::MIN as i64 || delta > i32::MAX as i64 {
                return Err(DecodeError::DeltaRange { delta });
            }
            Command::RcUpdate {
                node,
                delta: delta as i32,
            }
        }
        _ => return Err(DecodeError::UnknownOpcode { opcode: op }),
    };

    Ok(Request {
        tag,
        requester,
        command,
    })
}

/// Serialize any packet for an in-memory transport
pub fn to_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, DecodeError> {
    bincode::serialize(value).map_err(|e| DecodeError::Codec(e.to_string()))
}

/// Deserialize a packet from an in-memory transport
pub fn from_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, DecodeError> {
    bincode::deserialize(bytes).map_err(|e| DecodeError::Codec(e.to_string()))
}

fn push_word(frame: &mut Vec<u8>, value: u64) {
    frame.extend_from_slice(&value.to_le_bytes());
}

fn word(frame: &[u8], index: usize) -> Result<u64, DecodeError> {
    let off = index * WORD;
    let bytes = frame
        .get(off..off + WORD)
        .ok_or(DecodeError::Truncated { len: frame.len() })?;
    let bytes: [u8; WORD] = bytes
        .try_into()
        .map_err(|_| DecodeError::Truncated { len: frame.len() })?;
    Ok(u64::from_le_bytes(bytes))
}

fn expect_len(frame: &[u8], expected: usize) -> Result<(), DecodeError> {
    if frame.len() < expected {
        return Err(DecodeError::Truncated { len: frame.len() });
    }
    if frame.len() > expected {
        return Err(DecodeError::TrailingBytes {
            len: frame.len(),
            expected,
        });
    }
    Ok(())
}

fn check_access_size(size: u64) -> Result<(), DecodeError> {
    if size == 0 || size > MAX_ACCESS_SIZE as u64 {
        return Err(DecodeError::BadAccessSize { size });
    }
    Ok(())
}

fn require_node(bits: u64) -> Result<NodeHandle, DecodeError> {
    NodeHandle::from_bits(bits).ok_or(DecodeError::MissingNode)
}

// The sentinel must stay representable in a frame word.
static_assertions::const_assert_eq!(NODE_HANDLE_NONE_BITS, u64::MAX);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Response, ResponseBody};

    fn round_trip(command: Command) -> Request {
        let request = Request::new(RequestTag(0xfeed), RequesterId(3), command);
        let frame = encode_request(&request);
        let decoded = decode_request(&frame).expect("frame should decode");
        assert_eq!(decoded, request);
        decoded
    }

    #[test]
    fn frames_round_trip_every_command() {
        round_trip(Command::MemRead {
            addr: 0x8000_0000,
            size: 64,
        });
        round_trip(Command::MemWrite {
            addr: 0x8000_0040,
            data: vec![0xaa; 24],
        });
        round_trip(Command::Derive {
            parent: None,
            derivation: Derivation::Branch,
        });
        round_trip(Command::Derive {
            parent: Some(NodeHandle::new(9, 4)),
            derivation: Derivation::Leaf {
                bounds: Bounds::new(0x1000, 0x2000),
            },
        });
        round_trip(Command::Revoke {
            node: NodeHandle::new(1, 0),
        });
        round_trip(Command::Query {
            node: NodeHandle::new(2, 5),
        });
        round_trip(Command::Unlink {
            node: NodeHandle::new(3, 1),
        });
        round_trip(Command::RcUpdate {
            node: NodeHandle::new(4, 2),
            delta: -7,
        });
    }

    #[test]
    fn truncated_frames_are_rejected() {
        let request = Request::new(
            RequestTag(1),
            RequesterId(0),
            Command::Query {
                node: NodeHandle::new(0, 0),
            },
        );
        let frame = encode_request(&request);
        for cut in [0, 8, 15, 23] {
            assert!(matches!(
                decode_request(&frame[..cut]),
                Err(DecodeError::Truncated { .. })
            ));
        }
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let request = Request::new(
            RequestTag(1),
            RequesterId(0),
            Command::Revoke {
                node: NodeHandle::new(0, 0),
            },
        );
        let mut frame = encode_request(&request);
        frame.push(0);
        assert!(matches!(
            decode_request(&frame),
            Err(DecodeError::TrailingBytes { .. })
        ));
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        let mut frame = Vec::new();
        push_word(&mut frame, 0xdead);
        push_word(&mut frame, 0);
        push_word(&mut frame, 0);
        assert_eq!(
            decode_request(&frame),
            Err(DecodeError::UnknownOpcode { opcode: 0xdead })
        );
    }

    #[test]
    fn peek_header_survives_undecodable_frames() {
        // Unknown opcode, but a complete header: still answerable
        let mut frame = Vec::new();
        push_word(&mut frame, 0xdead | (7u64 << 32));
        push_word(&mut frame, 0x1234);
        assert!(decode_request(&frame).is_err());
        assert_eq!(
            peek_header(&frame),
            Some((RequestTag(0x1234), RequesterId(7)))
        );

        // Header itself truncated: nothing to answer
        assert_eq!(peek_header(&frame[..9]), None);
        assert_eq!(peek_header(&[]), None);
    }

    #[test]
    fn leaf_root_is_contradictory() {
        let mut frame = Vec::new();
        push_word(&mut frame, opcode::DERIVE as u64);
        push_word(&mut frame, 0);
        push_word(&mut frame, NODE_HANDLE_NONE_BITS);
        push_word(&mut frame, 1);
        push_word(&mut frame, 0x1000);
        push_word(&mut frame, 0x100);
        assert_eq!(decode_request(&frame), Err(DecodeError::LeafWithoutParent));
    }

    #[test]
    fn sentinel_node_operand_is_rejected() {
        for op in [opcode::REVOKE, opcode::QUERY, opcode::UNLINK] {
            let mut frame = Vec::new();
            push_word(&mut frame, op as u64);
            push_word(&mut frame, 0);
            push_word(&mut frame, NODE_HANDLE_NONE_BITS);
            assert_eq!(decode_request(&frame), Err(DecodeError::MissingNode));
        }
    }

    #[test]
    fn write_payload_length_must_match() {
        let request = Request::new(
            RequestTag(1),
            RequesterId(0),
            Command::MemWrite {
                addr: 0x1000,
                data: vec![1, 2, 3, 4],
            },
        );
        let mut frame = encode_request(&request);
        frame.pop();
        assert!(matches!(
            decode_request(&frame),
            Err(DecodeError::PayloadLength { declared: 4, available: 3 })
        ));
    }

    #[test]
    fn zero_and_oversized_accesses_are_rejected() {
        let mut frame = Vec::new();
        push_word(&mut frame, opcode::MEM_READ as u64);
        push_word(&mut frame, 0);
        push_word(&mut frame, 0x1000);
        push_word(&mut frame, 0);
        assert_eq!(
            decode_request(&frame),
            Err(DecodeError::BadAccessSize { size: 0 })
        );

        let mut frame = Vec::new();
        push_word(&mut frame, opcode::MEM_READ as u64);
        push_word(&mut frame, 0);
        push_word(&mut frame, 0x1000);
        push_word(&mut frame, MAX_ACCESS_SIZE as u64 + 1);
        assert!(matches!(
            decode_request(&frame),
            Err(DecodeError::BadAccessSize { .. })
        ));
    }

    #[test]
    fn delta_outside_i32_is_rejected() {
        let mut frame = Vec::new();
        push_word(&mut frame, opcode::RCUPDATE as u64);
        push_word(&mut frame, 0);
        push_word(&mut frame, NodeHandle::new(0, 0).to_bits());
        push_word(&mut frame, u64::MAX / 2);
        assert!(matches!(
            decode_request(&frame),
            Err(DecodeError::DeltaRange { .. })
        ));
    }

    #[test]
    fn window_scales_with_capacity() {
        let window = node_table_window(65536);
        assert_eq!(window.base, NODE_TABLE_BASE);
        assert!(window.contains(NODE_TABLE_BASE));
        assert!(window.contains(NODE_TABLE_BASE + 65536 * NODE_RECORD_STRIDE - 1));
        assert!(!window.contains(NODE_TABLE_BASE + 65536 * NODE_RECORD_STRIDE));
    }

    #[test]
    fn packets_survive_the_byte_codec() {
        let request = Request::new(
            RequestTag(42),
            RequesterId(1),
            Command::Derive {
                parent: Some(NodeHandle::new(5, 2)),
                derivation: Derivation::Branch,
            },
        );
        let bytes = to_bytes(&request).unwrap();
        let back: Request = from_bytes(&bytes).unwrap();
        assert_eq!(back, request);

        let response = Response::new(
            RequestTag(42),
            RequesterId(1),
            ResponseBody::Handle(NodeHandle::new(6, 0)),
        );
        let bytes = to_bytes(&response).unwrap();
        let back: Response = from_bytes(&bytes).unwrap();
        assert_eq!(back, response);
    }
}
