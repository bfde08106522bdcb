//! Host-side capability and object bookkeeping
//!
//! # Purpose
//! The simulated CPU needs to know, for any architectural location, which
//! node a capability stored there is pinned to, and which allocated object
//! an address falls inside. Both maps are plain bookkeeping: tracking a
//! capability does not touch the node's reference count. The host issues
//! explicit `RcUpdate` commands when locations gain or lose a capability,
//! so every reference the table counts was declared on purpose.

use std::collections::{BTreeMap, HashMap};

use capstone_node_table::{Bounds, NodeHandle};
use thiserror::Error;

/// Architectural home of a capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapLoc {
    /// Stored in memory at this address
    Mem(u64),

    /// Held in a register file
    Reg { hart: u32, reg: u16 },
}

impl core::fmt::Display for CapLoc {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match *self {
            CapLoc::Mem(addr) => write!(f, "mem {:#x}", addr),
            CapLoc::Reg { hart, reg } => write!(f, "hart {} reg {}", hart, reg),
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TrackingError {
    #[error("object {base:#x}+{length} overlaps an allocated object")]
    Overlap { base: u64, length: u64 },

    #[error("no allocated object contains {addr:#x}")]
    UnknownObject { addr: u64 },

    #[error("empty object range at {base:#x}")]
    EmptyObject { base: u64 },
}

/// Capability location map
///
/// Each location holds at most one capability; storing over an occupied
/// location displaces the previous entry and hands it back so the caller
/// can drop its reference.
#[derive(Debug, Default)]
pub struct CapTracker {
    locations: HashMap<CapLoc, NodeHandle>,
}

impl CapTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin `handle` at `loc`; returns the displaced handle if any
    pub fn track(&mut self, loc: CapLoc, handle: NodeHandle) -> Option<NodeHandle> {
        log::trace!("cap track added: {} -> {:?}", loc, handle);
        self.locations.insert(loc, handle)
    }

    /// Clear `loc`; returns what was pinned there
    pub fn untrack(&mut self, loc: CapLoc) -> Option<NodeHandle> {
        let removed = self.locations.remove(&loc);
        if removed.is_some() {
            log::trace!("cap track removed: {}", loc);
        }
        removed
    }

    /// Handle pinned at `loc`, if any
    #[inline]
    pub fn lookup(&self, loc: CapLoc) -> Option<NodeHandle> {
        self.locations.get(&loc).copied()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.locations.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }
}

/// Allocated-object ranges, keyed by base address
///
/// Ranges never overlap, so an address resolves to at most one object.
#[derive(Debug, Default)]
pub struct ObjectRegistry {
    objects: BTreeMap<u64, Bounds>,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a newly allocated object
    pub fn alloc_object(&mut self, bounds: Bounds) -> Result<(), TrackingError> {
        if bounds.length == 0 {
            return Err(TrackingError::EmptyObject { base: bounds.base });
        }
        let clash = self
            .neighbor_below(bounds.base)
            .into_iter()
            .chain(self.neighbor_at_or_above(bounds.base))
            .any(|other| other.overlaps(&bounds));
        if clash {
            return Err(TrackingError::Overlap {
                base: bounds.base,
                length: bounds.length,
            });
        }
        log::trace!("object allocated: {:#x}+{}", bounds.base, bounds.length);
        self.objects.insert(bounds.base, bounds);
        Ok(())
    }

    /// Drop the object containing `addr`
    pub fn free_object(&mut self, addr: u64) -> Result<Bounds, TrackingError> {
        let bounds = self
            .lookup_addr(addr)
            .ok_or(TrackingError::UnknownObject { addr })?;
        self.objects.remove(&bounds.base);
        log::trace!("object freed: {:#x}+{}", bounds.base, bounds.length);
        Ok(bounds)
    }

    /// Object containing `addr`, if any
    pub fn lookup_addr(&self, addr: u64) -> Option<Bounds> {
        self.neighbor_below(addr)
            .filter(|bounds| bounds.contains(addr))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Greatest-base object at or below `addr`
    fn neighbor_below(&self, addr: u64) -> Option<Bounds> {
        self.objects
            .range(..=addr)
            .next_back()
            .map(|(_, bounds)| *bounds)
    }

    fn neighbor_at_or_above(&self, addr: u64) -> Option<Bounds> {
        self.objects.range(addr..).next().map(|(_, bounds)| *bounds)
    }
}
