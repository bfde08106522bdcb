//! Node records and handles
//!
//! A node backs one capability in the revocation forest. Nodes refer to each
//! other (parent and child links) exclusively through [`NodeHandle`]s so
//! that a freed-and-recycled slot is always detected by generation mismatch
//! instead of being silently traversed.
//!
//! ## Handle encoding
//!
//! On the wire a handle travels as a single word:
//!
//! ```text
//! 63            32 31             0
//! +---------------+---------------+
//! |  generation   |  slot index   |
//! +---------------+---------------+
//! ```
//!
//! The all-ones word is reserved as the "no node" sentinel, matching the
//! invalid node id of the hardware interface.

use serde::{Deserialize, Serialize};

/// Wire encoding of "no node" (all ones).
///
/// A derive request carrying this value as its parent asks for a new tree
/// root. [`NodeHandle::from_bits`] never yields a handle that encodes to it.
pub const NODE_HANDLE_NONE_BITS: u64 = u64::MAX;

/// Opaque reference to a node: slot index plus the slot generation observed
/// when the node was allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeHandle {
    index: u32,
    generation: u32,
}

impl NodeHandle {
    /// Create a handle for a slot at a given generation
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Slot index within the node store
    #[inline]
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// Slot generation this handle was issued for
    #[inline]
    pub const fn generation(&self) -> u32 {
        self.generation
    }

    /// Pack into the wire representation (generation in the high half)
    #[inline]
    pub const fn to_bits(&self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    /// Unpack from the wire representation
    ///
    /// Returns `None` for the "no node" sentinel.
    #[inline]
    pub const fn from_bits(bits: u64) -> Option<Self> {
        if bits == NODE_HANDLE_NONE_BITS {
            return None;
        }
        Some(Self {
            index: bits as u32,
            generation: (bits >> 32) as u32,
        })
    }
}

/// Encode an optional handle for the wire
#[inline]
pub const fn handle_bits(handle: Option<NodeHandle>) -> u64 {
    match handle {
        Some(h) => h.to_bits(),
        None => NODE_HANDLE_NONE_BITS,
    }
}

/// Address range authorized by a leaf capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bounds {
    /// First byte of the range
    pub base: u64,

    /// Length in bytes
    pub length: u64,
}

impl Bounds {
    /// Create a bounds record
    pub const fn new(base: u64, length: u64) -> Self {
        Self { base, length }
    }

    /// One past the last byte of the range, saturating at the top of the
    /// address space
    #[inline]
    pub const fn end(&self) -> u64 {
        self.base.saturating_add(self.length)
    }

    /// Check whether an address falls inside the range
    #[inline]
    pub const fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.end()
    }

    /// Check whether two ranges share at least one byte
    #[inline]
    pub const fn overlaps(&self, other: &Bounds) -> bool {
        other.base < self.end() && self.base < other.end()
    }
}

/// Position of a node in the capability hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Top of a tree; created directly rather than by derivation
    Root,

    /// Interior node; may be derived from further
    Branch,

    /// Terminal node carrying memory bounds; nothing derives from a leaf
    Leaf { bounds: Bounds },
}

impl NodeKind {
    /// Check whether further capabilities may be derived from this node
    #[inline]
    pub const fn is_derivable(&self) -> bool {
        !matches!(self, NodeKind::Leaf { .. })
    }
}

/// What a derive request asks to create under its parent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Derivation {
    /// An interior node that can itself be derived from
    Branch,

    /// A terminal node authorizing an address range
    Leaf { bounds: Bounds },
}

impl Derivation {
    /// The node kind this derivation produces
    #[inline]
    pub const fn kind(&self) -> NodeKind {
        match self {
            Derivation::Branch => NodeKind::Branch,
            Derivation::Leaf { bounds } => NodeKind::Leaf { bounds: *bounds },
        }
    }
}

/// One record of the revocation forest
///
/// Owned exclusively by the node store; everything outside the store sees
/// nodes through handles. A node starts valid with a reference count of one
/// held by whoever asked for the derivation.
#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) kind: NodeKind,
    pub(crate) parent: Option<NodeHandle>,
    pub(crate) children: Vec<NodeHandle>,
    pub(crate) valid: bool,
    pub(crate) refcount: u32,
}

impl Node {
    /// Create a node about to be linked under `parent`
    pub(crate) fn new(kind: NodeKind, parent: Option<NodeHandle>) -> Self {
        Self {
            kind,
            parent,
            children: Vec::new(),
            valid: true,
            refcount: 1,
        }
    }

    /// Hierarchy position and, for leaves, the authorized bounds
    #[inline]
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Parent link, `None` for roots and unlinked nodes
    #[inline]
    pub fn parent(&self) -> Option<NodeHandle> {
        self.parent
    }

    /// Child links, unordered
    #[inline]
    pub fn children(&self) -> &[NodeHandle] {
        &self.children
    }

    /// Validity flag, maintained eagerly by revocation
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Count of live external references to this node
    #[inline]
    pub fn refcount(&self) -> u32 {
        self.refcount
    }

    /// Check whether this node may still be derived from
    #[inline]
    pub fn is_derivable(&self) -> bool {
        self.valid && self.kind.is_derivable()
    }
}

// Handle packing must round-trip through a single wire word.
static_assertions::const_assert_eq!(core::mem::size_of::<NodeHandle>(), 8);
static_assertions::const_assert!(NODE_HANDLE_NONE_BITS == !0u64);
