//! Lock dependency graph
//!
//! Nodes are locks; an edge `H -> L` records that some thread held `H` while
//! acquiring `L`. Edges are append-only. As long as every acquisition that
//! added edges was validated, the graph stays acyclic, so any path found from
//! `L` back to a held lock `H` proves a lock-ordering violation.
//!
//! Cycle search is an iterative depth-first search. Visited nodes are marked
//! with a per-search epoch stored on the node itself, so the search needs no
//! visited buffer and has no size limit.

mod lock_registry;

pub(crate) use lock_registry::{NodeRef, node_addr, node_kind, successors};

use crate::core::arena::Arena;
use crate::core::types::{LockAddr, LockKind};
use fxhash::FxHashMap;
use lock_registry::{Edge, LockRegistry};
use std::ptr::NonNull;

/// Registry of lock nodes plus cycle-search scratch state
pub(crate) struct LockGraph {
    registry: LockRegistry,
    epoch: u64,
    /// DFS stack: node and the next outgoing edge still to explore
    stack: Vec<(NodeRef, Option<NonNull<Edge>>)>,
}

impl Default for LockGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl LockGraph {
    pub(crate) fn new() -> Self {
        LockGraph {
            registry: LockRegistry::new(),
            epoch: 0,
            stack: Vec::with_capacity(64),
        }
    }

    pub(crate) fn find(&self, addr: LockAddr) -> Option<NodeRef> {
        self.registry.find(addr)
    }

    pub(crate) fn find_or_create(
        &mut self,
        arena: &mut Arena,
        addr: LockAddr,
        kind: LockKind,
    ) -> NodeRef {
        self.registry.find_or_create(arena, addr, kind)
    }

    pub(crate) fn add_edge(&mut self, arena: &mut Arena, from: NodeRef, to: NodeRef) -> bool {
        self.registry.add_edge(arena, from, to)
    }

    /// Search for a path `start -> ... -> target`
    ///
    /// Every node is visited at most once per call.
    ///
    /// # Returns
    /// The addresses along the path, both ends included, or `None` if `target`
    /// is unreachable. `start == target` yields the one-element path.
    pub(crate) fn find_path(&mut self, start: NodeRef, target: NodeRef) -> Option<Vec<LockAddr>> {
        if start == target {
            return Some(vec![node_addr(start)]);
        }

        self.epoch += 1;
        let epoch = self.epoch;
        self.stack.clear();

        mark(start, epoch);
        self.stack.push((start, first_edge(start)));

        while let Some(top) = self.stack.last_mut() {
            let Some(edge) = top.1 else {
                self.stack.pop();
                continue;
            };
            // SAFETY: edges are arena-resident for the life of the graph.
            let Edge { target: next, next: rest } = unsafe { *edge.as_ptr() };
            top.1 = rest;

            if next == target {
                let mut path: Vec<LockAddr> =
                    self.stack.iter().map(|&(node, _)| node_addr(node)).collect();
                path.push(node_addr(target));
                self.stack.clear();
                return Some(path);
            }

            if !is_marked(next, epoch) {
                mark(next, epoch);
                self.stack.push((next, first_edge(next)));
            }
        }

        None
    }

    /// Whether the recorded edge `from -> to` exists
    pub(crate) fn has_edge(&self, from: LockAddr, to: LockAddr) -> bool {
        match (self.registry.find(from), self.registry.find(to)) {
            (Some(from), Some(to)) => successors(from).any(|target| target == to),
            _ => false,
        }
    }

    /// Whole-graph acyclicity check (Kahn's algorithm)
    ///
    /// Walks every node and edge; meant for tests and tooling, not the
    /// acquisition path.
    pub(crate) fn is_acyclic(&self) -> bool {
        let mut in_degree: FxHashMap<NodeRef, usize> =
            self.registry.nodes().map(|node| (node, 0)).collect();
        for node in self.registry.nodes() {
            for target in successors(node) {
                *in_degree.entry(target).or_insert(0) += 1;
            }
        }

        let mut ready: Vec<NodeRef> = in_degree
            .iter()
            .filter(|&(_, &degree)| degree == 0)
            .map(|(&node, _)| node)
            .collect();
        let mut removed = 0;

        while let Some(node) = ready.pop() {
            removed += 1;
            for target in successors(node) {
                if let Some(degree) = in_degree.get_mut(&target) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(target);
                    }
                }
            }
        }

        removed == in_degree.len()
    }

    pub(crate) fn node_count(&self) -> usize {
        self.registry.len()
    }

    pub(crate) fn edge_count(&self) -> usize {
        self.registry.edge_count()
    }

    pub(crate) fn clear(&mut self) {
        self.registry.clear();
        self.stack.clear();
    }
}

fn first_edge(node: NodeRef) -> Option<NonNull<Edge>> {
    // SAFETY: nodes are arena-resident for the life of the graph.
    unsafe { (*node.as_ptr()).edges }
}

fn is_marked(node: NodeRef, epoch: u64) -> bool {
    // SAFETY: as above.
    unsafe { (*node.as_ptr()).visit_mark == epoch }
}

fn mark(node: NodeRef, epoch: u64) {
    // SAFETY: as above; the engine lock gives exclusive access.
    unsafe { (*node.as_ptr()).visit_mark = epoch }
}
