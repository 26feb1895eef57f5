//! Lock nodes, their outgoing dependency edges, and the address index
//!
//! Nodes and edges live in arena memory and are referenced through
//! [`NodeRef`]. A `NodeRef` stays valid from creation until the owning
//! [`LockRegistry`] is cleared, and is only ever dereferenced while the engine
//! critical section is held.

use crate::core::arena::Arena;
use crate::core::logger;
use crate::core::types::{LockAddr, LockKind};
use fxhash::FxHashMap;
use std::ptr::NonNull;

/// Handle to an arena-resident [`LockNode`]
pub(crate) type NodeRef = NonNull<LockNode>;

/// One tracked synchronization object
pub(crate) struct LockNode {
    pub(crate) addr: LockAddr,
    pub(crate) kind: LockKind,
    /// Head of the singly linked outgoing edge list, newest first
    pub(crate) edges: Option<NonNull<Edge>>,
    pub(crate) out_degree: usize,
    /// Search epoch in which this node was last visited
    pub(crate) visit_mark: u64,
}

/// "Owner node was held while `target` was acquired"
#[derive(Clone, Copy)]
pub(crate) struct Edge {
    pub(crate) target: NodeRef,
    pub(crate) next: Option<NonNull<Edge>>,
}

/// Address of a node
pub(crate) fn node_addr(node: NodeRef) -> LockAddr {
    // SAFETY: see module docs.
    unsafe { (*node.as_ptr()).addr }
}

/// Recorded synchronization type of a node
pub(crate) fn node_kind(node: NodeRef) -> LockKind {
    // SAFETY: see module docs.
    unsafe { (*node.as_ptr()).kind }
}

/// Iterate the direct successors of `node`
pub(crate) fn successors(node: NodeRef) -> impl Iterator<Item = NodeRef> {
    // SAFETY: see module docs.
    let mut cursor = unsafe { (*node.as_ptr()).edges };
    std::iter::from_fn(move || {
        let edge = cursor?;
        // SAFETY: edges are arena-resident and never freed while the node lives.
        let Edge { target, next } = unsafe { *edge.as_ptr() };
        cursor = next;
        Some(target)
    })
}

/// Process-wide lookup from lock address to node
#[derive(Default)]
pub(crate) struct LockRegistry {
    index: FxHashMap<LockAddr, NodeRef>,
    edge_count: usize,
}

impl LockRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Look up an existing node
    pub(crate) fn find(&self, addr: LockAddr) -> Option<NodeRef> {
        self.index.get(&addr).copied()
    }

    /// Return the node for `addr`, creating it on first sight
    ///
    /// If the address was previously seen with another type the stored type is
    /// replaced by `kind`; history (edges) is kept.
    pub(crate) fn find_or_create(
        &mut self,
        arena: &mut Arena,
        addr: LockAddr,
        kind: LockKind,
    ) -> NodeRef {
        if let Some(&node) = self.index.get(&addr) {
            // SAFETY: see module docs; we have exclusive access through `&mut self`.
            let stored = unsafe { &mut (*node.as_ptr()).kind };
            if *stored != kind {
                logger::verbose(format_args!(
                    "lock {addr:#x} re-registered as {kind} (was {stored})"
                ));
                *stored = kind;
            }
            return node;
        }

        let node = arena.alloc(LockNode {
            addr,
            kind,
            edges: None,
            out_degree: 0,
            visit_mark: 0,
        });
        self.index.insert(addr, node);
        node
    }

    /// Record `from -> to`
    ///
    /// # Returns
    /// `true` if the edge is new, `false` if it was already present
    pub(crate) fn add_edge(&mut self, arena: &mut Arena, from: NodeRef, to: NodeRef) -> bool {
        if successors(from).any(|target| target == to) {
            return false;
        }

        // SAFETY: see module docs.
        let head = unsafe { (*from.as_ptr()).edges };
        let edge = arena.alloc(Edge {
            target: to,
            next: head,
        });
        // SAFETY: see module docs.
        unsafe {
            let node = &mut *from.as_ptr();
            node.edges = Some(edge);
            node.out_degree += 1;
        }
        self.edge_count += 1;
        true
    }

    pub(crate) fn nodes(&self) -> impl Iterator<Item = NodeRef> + '_ {
        self.index.values().copied()
    }

    pub(crate) fn len(&self) -> usize {
        self.index.len()
    }

    pub(crate) fn edge_count(&self) -> usize {
        self.edge_count
    }

    /// Forget every node; the caller resets the arena afterwards
    pub(crate) fn clear(&mut self) {
        self.index.clear();
        self.edge_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_or_create_is_idempotent() {
        let mut arena = Arena::new();
        let mut registry = LockRegistry::new();

        let a = registry.find_or_create(&mut arena, 0x1000, LockKind::Mutex);
        let again = registry.find_or_create(&mut arena, 0x1000, LockKind::Mutex);
        let b = registry.find_or_create(&mut arena, 0x2000, LockKind::Semaphore);

        assert_eq!(a, again);
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.find(0x2000), Some(b));
        assert_eq!(registry.find(0x3000), None);
    }

    #[test]
    fn test_type_change_overwrites_kind() {
        let mut arena = Arena::new();
        let mut registry = LockRegistry::new();

        let a = registry.find_or_create(&mut arena, 0x1000, LockKind::Mutex);
        let b = registry.find_or_create(&mut arena, 0x2000, LockKind::Mutex);
        registry.add_edge(&mut arena, a, b);

        let retyped = registry.find_or_create(&mut arena, 0x1000, LockKind::RwLock);
        assert_eq!(retyped, a);
        assert_eq!(node_kind(a), LockKind::RwLock);
        assert_eq!(successors(a).collect::<Vec<_>>(), vec![b]);
    }

    #[test]
    fn test_edges_are_deduplicated() {
        let mut arena = Arena::new();
        let mut registry = LockRegistry::new();

        let a = registry.find_or_create(&mut arena, 1, LockKind::Mutex);
        let b = registry.find_or_create(&mut arena, 2, LockKind::Mutex);
        let c = registry.find_or_create(&mut arena, 3, LockKind::Mutex);

        assert!(registry.add_edge(&mut arena, a, b));
        assert!(!registry.add_edge(&mut arena, a, b));
        assert!(registry.add_edge(&mut arena, a, c));

        let targets: Vec<LockAddr> = successors(a).map(node_addr).collect();
        assert_eq!(targets, vec![3, 2]);
        assert_eq!(registry.edge_count(), 2);
    }
}
