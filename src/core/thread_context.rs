//! Per-thread record of currently held locks
//!
//! A [`ThreadContext`] is created the first time a thread acquires a lock and
//! lives as long as the engine state. Its held-lock list is ordered most
//! recently acquired first. Detached entries go onto a spare list and are
//! reused by later attaches; arena memory itself is never returned.

use crate::core::arena::Arena;
use crate::core::graph::{NodeRef, node_addr};
use crate::core::types::{LockAddr, ThreadId};
use fxhash::FxHashMap;
use std::ptr::NonNull;

/// Handle to an arena-resident [`ThreadContext`]
pub(crate) type ContextRef = NonNull<ThreadContext>;

pub(crate) struct ThreadContext {
    pub(crate) thread_id: ThreadId,
    held: Option<NonNull<HeldLock>>,
    depth: usize,
}

struct HeldLock {
    node: NodeRef,
    next: Option<NonNull<HeldLock>>,
}

/// Thread identity to context lookup
#[derive(Default)]
pub(crate) struct ThreadRegistry {
    index: FxHashMap<ThreadId, ContextRef>,
    spare: Option<NonNull<HeldLock>>,
}

impl ThreadRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Look up a thread's context without creating one
    pub(crate) fn find(&self, thread_id: ThreadId) -> Option<ContextRef> {
        self.index.get(&thread_id).copied()
    }

    /// Push `node` onto the held list of `context`
    ///
    /// When `context` is `None` a fresh context for `thread_id` is allocated,
    /// seeded with `node` and registered.
    ///
    /// # Returns
    /// The (possibly newly created) context
    pub(crate) fn attach(
        &mut self,
        arena: &mut Arena,
        context: Option<ContextRef>,
        thread_id: ThreadId,
        node: NodeRef,
    ) -> ContextRef {
        let context = match context {
            Some(context) => context,
            None => {
                let context = arena.alloc(ThreadContext {
                    thread_id,
                    held: None,
                    depth: 0,
                });
                self.index.insert(thread_id, context);
                context
            }
        };

        // SAFETY: contexts and entries are arena-resident until `clear`, and
        // the engine lock gives exclusive access.
        unsafe {
            let ctx = &mut *context.as_ptr();
            debug_assert_eq!(ctx.thread_id, thread_id);
            let entry = match self.spare {
                Some(entry) => {
                    self.spare = (*entry.as_ptr()).next;
                    entry.as_ptr().write(HeldLock {
                        node,
                        next: ctx.held,
                    });
                    entry
                }
                None => arena.alloc(HeldLock {
                    node,
                    next: ctx.held,
                }),
            };
            ctx.held = Some(entry);
            ctx.depth += 1;
        }
        context
    }

    /// Remove the most recent held entry for `addr`
    ///
    /// # Returns
    /// `false` if the thread did not hold `addr`; nothing changes in that case
    pub(crate) fn detach(&mut self, context: ContextRef, addr: LockAddr) -> bool {
        // SAFETY: see `attach`.
        unsafe {
            let ctx = &mut *context.as_ptr();
            let mut link: *mut Option<NonNull<HeldLock>> = &mut ctx.held;
            while let Some(entry) = *link {
                let entry_ptr = entry.as_ptr();
                if node_addr((*entry_ptr).node) == addr {
                    *link = (*entry_ptr).next;
                    (*entry_ptr).next = self.spare;
                    self.spare = Some(entry);
                    ctx.depth -= 1;
                    return true;
                }
                link = &mut (*entry_ptr).next;
            }
        }
        false
    }

    /// Copy the held nodes of `context` into `out`, most recent first
    pub(crate) fn held_nodes(context: ContextRef, out: &mut Vec<NodeRef>) {
        // SAFETY: see `attach`.
        let mut cursor = unsafe { (*context.as_ptr()).held };
        while let Some(entry) = cursor {
            // SAFETY: see `attach`.
            let HeldLock { node, next } = unsafe { &*entry.as_ptr() };
            out.push(*node);
            cursor = *next;
        }
    }

    /// Number of locks currently held through `context`
    pub(crate) fn depth(context: ContextRef) -> usize {
        // SAFETY: see `attach`.
        unsafe { (*context.as_ptr()).depth }
    }

    pub(crate) fn len(&self) -> usize {
        self.index.len()
    }

    /// Forget every context; the caller resets the arena afterwards
    pub(crate) fn clear(&mut self) {
        self.index.clear();
        self.spare = None;
    }
}
