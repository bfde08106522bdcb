//! Node store - fixed-capacity arena with generation counters
//!
//! # Purpose
//! The store is the single owner of every node record. Callers hold
//! [`NodeHandle`]s; slot reuse is made safe by bumping a per-slot generation
//! counter on free, so a handle issued before the free can never reach the
//! slot's next occupant.
//!
//! ## Allocation
//! Freed slots are recycled first (free list), then fresh slots are taken
//! from the never-used tail until the configured capacity is reached. The
//! slot vector grows lazily, so an empty table costs nothing regardless of
//! its capacity.

use crate::node::{Node, NodeHandle};
use crate::{NodeTableError, Result};

/// One arena slot: the generation survives the node it holds
#[derive(Debug, Clone)]
struct Slot {
    /// Incremented every time the slot is vacated
    generation: u32,

    /// Current occupant, `None` while on the free list
    node: Option<Node>,
}

/// Fixed-capacity arena of node records
#[derive(Debug)]
pub struct NodeStore {
    /// Lazily materialized slots; never shrinks
    slots: Vec<Slot>,

    /// Indices of vacated slots available for reuse
    free_list: Vec<u32>,

    /// Hard limit on materialized slots
    capacity: usize,

    /// Running totals for [`StoreStats`]
    total_allocated: u64,
    total_freed: u64,
}

impl NodeStore {
    /// Create an empty store
    ///
    /// # Panics
    /// Panics if `capacity` cannot be indexed by a `u32` handle. The top
    /// index is additionally reserved so no legal handle packs to the wire
    /// sentinel.
    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity < u32::MAX as usize,
            "node store capacity {capacity} exceeds handle index range"
        );
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            capacity,
            total_allocated: 0,
            total_freed: 0,
        }
    }

    /// Configured slot limit
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of live nodes
    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len() - self.free_list.len()
    }

    /// Check whether no nodes are live
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Place a node in the store
    ///
    /// Reuses a vacated slot when one exists, otherwise claims a fresh slot.
    /// The returned handle carries the slot's current generation.
    ///
    /// # Errors
    /// [`NodeTableError::CapacityExceeded`] when every slot is live; the
    /// store is unchanged.
    pub fn allocate(&mut self, node: Node) -> Result<NodeHandle> {
        // Reuse a vacated slot first
        if let Some(index) = self.free_list.pop() {
            let slot = &mut self.slots[index as usize];
            debug_assert!(slot.node.is_none());
            slot.node = Some(node);
            self.total_allocated += 1;
            let handle = NodeHandle::new(index, slot.generation);
            log::trace!("node store: reuse slot {} gen {}", index, slot.generation);
            return Ok(handle);
        }

        // Claim a fresh slot
        if self.slots.len() >= self.capacity {
            return Err(NodeTableError::CapacityExceeded {
                capacity: self.capacity,
            });
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            node: Some(node),
        });
        self.total_allocated += 1;
        log::trace!("node store: fresh slot {}", index);
        Ok(NodeHandle::new(index, 0))
    }

    /// Look up a node
    ///
    /// # Errors
    /// [`NodeTableError::NotFound`] for an index the store never issued;
    /// [`NodeTableError::StaleReference`] when the slot has been vacated or
    /// recycled since the handle was issued.
    pub fn get(&self, handle: NodeHandle) -> Result<&Node> {
        let slot = self
            .slots
            .get(handle.index() as usize)
            .ok_or(NodeTableError::NotFound { handle })?;
        if slot.generation != handle.generation() {
            return Err(NodeTableError::StaleReference { handle });
        }
        slot.node
            .as_ref()
            .ok_or(NodeTableError::StaleReference { handle })
    }

    /// Look up a node for mutation
    ///
    /// # Errors
    /// Same as [`NodeStore::get`].
    pub fn get_mut(&mut self, handle: NodeHandle) -> Result<&mut Node> {
        let slot = self
            .slots
            .get_mut(handle.index() as usize)
            .ok_or(NodeTableError::NotFound { handle })?;
        if slot.generation != handle.generation() {
            return Err(NodeTableError::StaleReference { handle });
        }
        slot.node
            .as_mut()
            .ok_or(NodeTableError::StaleReference { handle })
    }

    /// Check whether a handle still refers to a live node
    #[inline]
    pub fn contains(&self, handle: NodeHandle) -> bool {
        self.get(handle).is_ok()
    }

    /// Remove a node and return its record
    ///
    /// The slot's generation is bumped, so every outstanding handle to the
    /// removed node becomes detectably stale before the slot can be reused.
    ///
    /// # Errors
    /// Same as [`NodeStore::get`]; the store is unchanged on error.
    pub fn free(&mut self, handle: NodeHandle) -> Result<Node> {
        // Validate before mutating anything
        self.get(handle)?;

        let slot = &mut self.slots[handle.index() as usize];
        let node = slot.node.take().ok_or(NodeTableError::StaleReference { handle })?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_list.push(handle.index());
        self.total_freed += 1;
        log::trace!(
            "node store: freed slot {} now gen {}",
            handle.index(),
            slot.generation
        );
        Ok(node)
    }

    /// Visit every live node
    pub fn iter(&self) -> impl Iterator<Item = (NodeHandle, &Node)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.node
                .as_ref()
                .map(|node| (NodeHandle::new(index as u32, slot.generation), node))
        })
    }

    /// Get current occupancy statistics
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            live: self.len(),
            capacity: self.capacity,
            high_water: self.slots.len(),
            total_allocated: self.total_allocated,
            total_freed: self.total_freed,
        }
    }
}

/// Node store occupancy statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    /// Nodes currently live
    pub live: usize,
    /// Configured slot limit
    pub capacity: usize,
    /// Slots that have ever been materialized
    pub high_water: usize,
    /// Allocations since creation
    pub total_allocated: u64,
    /// Frees since creation
    pub total_freed: u64,
}

impl StoreStats {
    /// Calculate utilization percentage
    pub fn utilization(&self) -> usize {
        if self.capacity == 0 {
            0
        } else {
            (self.live * 100) / self.capacity
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeKind;

    fn branch() -> Node {
        Node::new(NodeKind::Branch, None)
    }

    #[test]
    fn allocate_and_get() {
        let mut store = NodeStore::new(4);
        let h = store.allocate(branch()).unwrap();
        assert_eq!(h.index(), 0);
        assert_eq!(h.generation(), 0);
        assert!(store.get(h).unwrap().is_valid());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn capacity_is_enforced() {
        let mut store = NodeStore::new(2);
        store.allocate(branch()).unwrap();
        store.allocate(branch()).unwrap();
        let err = store.allocate(branch()).unwrap_err();
        assert_eq!(err, NodeTableError::CapacityExceeded { capacity: 2 });
        // A failed allocation changes nothing
        assert_eq!(store.len(), 2);
        assert_eq!(store.stats().total_allocated, 2);
    }

    #[test]
    fn free_then_reuse_bumps_generation() {
        let mut store = NodeStore::new(4);
        let first = store.allocate(branch()).unwrap();
        store.free(first).unwrap();

        let second = store.allocate(branch()).unwrap();
        // Same slot, next generation
        assert_eq!(second.index(), first.index());
        assert_eq!(second.generation(), first.generation() + 1);
    }

    #[test]
    fn stale_handle_is_rejected_after_reuse() {
        let mut store = NodeStore::new(4);
        let old = store.allocate(branch()).unwrap();
        store.free(old).unwrap();
        let _new = store.allocate(branch()).unwrap();

        assert_eq!(
            store.get(old).unwrap_err(),
            NodeTableError::StaleReference { handle: old }
        );
        assert_eq!(
            store.free(old).unwrap_err(),
            NodeTableError::StaleReference { handle: old }
        );
    }

    #[test]
    fn vacant_slot_is_stale_not_found() {
        let mut store = NodeStore::new(4);
        let h = store.allocate(branch()).unwrap();
        store.free(h).unwrap();
        // Slot exists but is vacant: stale, not missing
        assert!(matches!(
            store.get(h),
            Err(NodeTableError::StaleReference { .. })
        ));
    }

    #[test]
    fn unissued_index_is_not_found() {
        let store = NodeStore::new(4);
        let bogus = NodeHandle::new(3, 0);
        assert_eq!(
            store.get(bogus).unwrap_err(),
            NodeTableError::NotFound { handle: bogus }
        );
    }

    #[test]
    fn double_free_is_rejected() {
        let mut store = NodeStore::new(4);
        let h = store.allocate(branch()).unwrap();
        store.free(h).unwrap();
        assert!(store.free(h).is_err());
        assert_eq!(store.stats().total_freed, 1);
    }

    #[test]
    fn iter_visits_only_live_nodes() {
        let mut store = NodeStore::new(4);
        let a = store.allocate(branch()).unwrap();
        let b = store.allocate(branch()).unwrap();
        let c = store.allocate(branch()).unwrap();
        store.free(b).unwrap();

        let handles: Vec<NodeHandle> = store.iter().map(|(h, _)| h).collect();
        assert_eq!(handles.len(), 2);
        assert!(handles.contains(&a));
        assert!(handles.contains(&c));
    }

    #[test]
    fn stats_track_churn() {
        let mut store = NodeStore::new(8);
        let handles: Vec<_> = (0..4).map(|_| store.allocate(branch()).unwrap()).collect();
        for h in &handles[..2] {
            store.free(*h).unwrap();
        }
        let stats = store.stats();
        assert_eq!(stats.live, 2);
        assert_eq!(stats.high_water, 4);
        assert_eq!(stats.total_allocated, 4);
        assert_eq!(stats.total_freed, 2);
        assert_eq!(stats.utilization(), 25);
    }
}
