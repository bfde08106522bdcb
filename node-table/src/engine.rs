//! Revocation engine - forest operations over the node store
//!
//! # Purpose
//! Implements the capability lifecycle: derivation links new nodes under
//! valid parents, revocation invalidates whole subtrees, queries read the
//! eagerly-maintained validity flag, and reference-count updates decide
//! when a slot can be reclaimed.
//!
//! ## Revocation
//!
//! Revoking a node walks its subtree depth-first with an explicit stack and
//! flips every visited validity flag exactly once. The walk is budgeted:
//! [`RevocationEngine::revoke_step`] visits at most `budget` nodes, so a
//! large subtree can be spread across clock ticks while queries keep being
//! served between steps. Validity is propagated eagerly at revoke time
//! precisely so that [`RevocationEngine::query`] stays O(1); capability
//! checks sit on the CPU's critical path, revocations do not.
//!
//! ## Reclamation
//!
//! A slot is reclaimed the moment its node is both invalid and
//! unreferenced: the walk frees such nodes as it flips them, and
//! [`RevocationEngine::rc_update`] frees an invalid node when its count
//! reaches zero. Valid nodes are never reclaimed, whatever their count -
//! referenced descendants may still hang below them.

use crate::node::{Derivation, Node, NodeHandle, NodeKind};
use crate::store::NodeStore;
use crate::{NodeTableError, Result};

/// Forest operations over a [`NodeStore`]
#[derive(Debug)]
pub struct RevocationEngine {
    store: NodeStore,
}

/// An in-progress subtree revocation
///
/// Holds the traversal frontier between budgeted steps. The walk counts
/// nodes it has invalidated and slots it has reclaimed; both are reported
/// on completion.
#[derive(Debug)]
pub struct RevokeWalk {
    root: NodeHandle,
    stack: Vec<NodeHandle>,
    revoked: usize,
    freed: usize,
}

impl RevokeWalk {
    /// Subtree root this walk was started for
    #[inline]
    pub fn root(&self) -> NodeHandle {
        self.root
    }

    /// Check whether the whole subtree has been visited
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.stack.is_empty()
    }

    /// Nodes invalidated so far
    #[inline]
    pub fn revoked(&self) -> usize {
        self.revoked
    }

    /// Slots reclaimed so far
    #[inline]
    pub fn freed(&self) -> usize {
        self.freed
    }
}

/// Outcome of one budgeted revocation step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevokeProgress {
    /// Frontier not yet exhausted; call again
    InProgress,

    /// Whole subtree visited
    Complete { revoked: usize, freed: usize },
}

impl RevocationEngine {
    /// Create an engine over an empty store
    pub fn new(capacity: usize) -> Self {
        Self {
            store: NodeStore::new(capacity),
        }
    }

    /// Read access to the underlying store
    #[inline]
    pub fn store(&self) -> &NodeStore {
        &self.store
    }

    /// Create a new tree root
    ///
    /// Roots are created directly rather than derived; the requester holds
    /// the single initial reference.
    ///
    /// # Errors
    /// [`NodeTableError::CapacityExceeded`] when the store is full.
    pub fn derive_root(&mut self) -> Result<NodeHandle> {
        let handle = self.store.allocate(Node::new(NodeKind::Root, None))?;
        log::debug!("derived root {:?}", handle);
        Ok(handle)
    }

    /// Derive a child capability under `parent`
    ///
    /// The child starts valid (its parent is necessarily valid) with one
    /// reference. Leaves are terminal: deriving from one is refused.
    ///
    /// # Errors
    /// [`NodeTableError::InvalidParent`] when the parent is invalid, is a
    /// leaf, or does not exist; [`NodeTableError::StaleReference`] when the
    /// parent handle has been freed or recycled;
    /// [`NodeTableError::CapacityExceeded`] when the store is full. The
    /// forest is unchanged on any failure.
    pub fn derive(&mut self, parent: NodeHandle, derivation: Derivation) -> Result<NodeHandle> {
        let parent_node = match self.store.get(parent) {
            Ok(node) => node,
            Err(NodeTableError::NotFound { .. }) => {
                return Err(NodeTableError::InvalidParent { handle: parent })
            }
            Err(err) => return Err(err),
        };
        if !parent_node.is_derivable() {
            return Err(NodeTableError::InvalidParent { handle: parent });
        }

        let child = self
            .store
            .allocate(Node::new(derivation.kind(), Some(parent)))?;

        match self.store.get_mut(parent) {
            Ok(parent_node) => {
                parent_node.children.push(child);
                log::debug!("derived {:?} under {:?}", child, parent);
                Ok(child)
            }
            Err(err) => {
                // Keep the operation all-or-nothing
                let _ = self.store.free(child);
                Err(err)
            }
        }
    }

    /// Read a node's validity flag
    ///
    /// O(1): the flag is maintained eagerly by revocation, never recomputed
    /// here.
    ///
    /// # Errors
    /// [`NodeTableError::StaleReference`] on generation mismatch,
    /// [`NodeTableError::NotFound`] for an index the store never issued.
    pub fn query(&self, handle: NodeHandle) -> Result<bool> {
        Ok(self.store.get(handle)?.is_valid())
    }

    /// Detach a node from its parent's child set without revoking it
    ///
    /// Used for benign capability transfer: the detached node keeps its
    /// validity and its own subtree, and from here on behaves as a root.
    ///
    /// # Errors
    /// [`NodeTableError::NotFound`] when the node is already unlinked
    /// (roots included); [`NodeTableError::StaleReference`] for a dead
    /// handle.
    pub fn unlink(&mut self, handle: NodeHandle) -> Result<()> {
        let node = self.store.get(handle)?;
        let parent = node
            .parent()
            .ok_or(NodeTableError::NotFound { handle })?;

        // The parent may already be reclaimed; its child list dies with it
        if let Ok(parent_node) = self.store.get_mut(parent) {
            parent_node.children.retain(|&c| c != handle);
        }
        self.store.get_mut(handle)?.parent = None;
        log::debug!("unlinked {:?} from {:?}", handle, parent);
        Ok(())
    }

    /// Adjust a node's reference count by a signed delta
    ///
    /// Returns the new count. An invalid node whose count reaches zero is
    /// reclaimed immediately; the returned count is zero and the handle is
    /// stale from that point on. A valid node at zero is kept - it still
    /// anchors its subtree.
    ///
    /// # Errors
    /// [`NodeTableError::RefCountUnderflow`] when the delta would take the
    /// count below zero (the count is unchanged);
    /// [`NodeTableError::StaleReference`] / [`NodeTableError::NotFound`]
    /// for a dead or unknown handle.
    pub fn rc_update(&mut self, handle: NodeHandle, delta: i32) -> Result<u32> {
        let node = self.store.get_mut(handle)?;
        let count = node.refcount;
        let new_count = if delta >= 0 {
            count.saturating_add(delta as u32)
        } else {
            count
                .checked_sub(delta.unsigned_abs())
                .ok_or(NodeTableError::RefCountUnderflow {
                    handle,
                    count,
                    delta,
                })?
        };
        node.refcount = new_count;
        let invalid = !node.valid;

        if new_count == 0 && invalid {
            self.release(handle);
        }
        Ok(new_count)
    }

    /// Start revoking the subtree rooted at `root`
    ///
    /// Revoking an already-invalid node is a no-op that still succeeds: the
    /// returned walk is complete before the first step (its whole subtree
    /// was invalidated when it was).
    ///
    /// # Errors
    /// [`NodeTableError::StaleReference`] / [`NodeTableError::NotFound`]
    /// when `root` does not name a live node.
    pub fn begin_revoke(&mut self, root: NodeHandle) -> Result<RevokeWalk> {
        let node = self.store.get(root)?;
        let stack = if node.is_valid() { vec![root] } else { Vec::new() };
        Ok(RevokeWalk {
            root,
            stack,
            revoked: 0,
            freed: 0,
        })
    }

    /// Advance a revocation walk by at most `budget` node visits
    ///
    /// Every node in the subtree is visited exactly once across all steps.
    /// Each visit flips the validity flag and, when the node carries no
    /// references, reclaims its slot on the spot. Completion is reported
    /// only once the frontier is exhausted.
    pub fn revoke_step(&mut self, walk: &mut RevokeWalk, budget: usize) -> RevokeProgress {
        let mut visited = 0;
        while visited < budget {
            let Some(handle) = walk.stack.pop() else { break };
            visited += 1;

            let node = match self.store.get_mut(handle) {
                Ok(node) => node,
                // Reclaimed through another path; nothing left here
                Err(_) => continue,
            };

            if !node.valid {
                // An invalid node's subtree is invalid in full already;
                // do not descend again
                continue;
            }

            node.valid = false;
            walk.revoked += 1;
            let unreferenced = node.refcount == 0;
            walk.stack.extend(node.children.iter().copied());

            if unreferenced {
                self.release(handle);
                walk.freed += 1;
            }
        }

        if walk.stack.is_empty() {
            log::debug!(
                "revoke of {:?} complete: {} invalidated, {} reclaimed",
                walk.root,
                walk.revoked,
                walk.freed
            );
            RevokeProgress::Complete {
                revoked: walk.revoked,
                freed: walk.freed,
            }
        } else {
            RevokeProgress::InProgress
        }
    }

    /// Revoke a subtree in one call
    ///
    /// Runs the walk to completion and returns the number of nodes
    /// invalidated.
    ///
    /// # Errors
    /// Same as [`RevocationEngine::begin_revoke`].
    pub fn revoke(&mut self, root: NodeHandle) -> Result<usize> {
        let mut walk = self.begin_revoke(root)?;
        loop {
            if let RevokeProgress::Complete { revoked, .. } =
                self.revoke_step(&mut walk, usize::MAX)
            {
                return Ok(revoked);
            }
        }
    }

    /// Reclaim a slot and detach the record from its parent's child set
    fn release(&mut self, handle: NodeHandle) {
        let Ok(node) = self.store.free(handle) else {
            return;
        };
        if let Some(parent) = node.parent {
            if let Ok(parent_node) = self.store.get_mut(parent) {
                parent_node.children.retain(|&c| c != handle);
            }
        }
    }
}
