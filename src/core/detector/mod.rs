//! Lock-order validation engine
//!
//! The [`Engine`] owns the arena, the lock registry (dependency graph) and the
//! thread context registry, all behind one `parking_lot` mutex. Every call-in
//! runs its whole body inside that critical section: node lookup, edge
//! insertion, cycle search and held-set mutation. Reports (diagnostics, the
//! deadlock callback) are produced after the critical section is left.
//!
//! Per-flavor entry points live in the submodules; the free functions there
//! operate on the process-global engine for the calling thread.

pub mod acquire;
pub mod condvar;

use crate::core::arena::Arena;
use crate::core::config::{self, Config};
use crate::core::graph::{LockGraph, NodeRef, node_addr, node_kind};
use crate::core::guard::guarded;
use crate::core::logger::{self, EventLogger, LogEntry};
use crate::core::thread_context::{ContextRef, ThreadRegistry};
use crate::core::types::{CycleInfo, Events, LockAddr, LockKind, ThreadId};
use anyhow::Result;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;

pub use acquire::{
    acquire_mutex, acquire_rwlock_read, acquire_rwlock_write, acquire_semaphore, release,
};
pub use condvar::{signal_condvar, wait_condvar};

/// Function invoked with the report of every denied acquisition
pub type DeadlockCallback = Arc<dyn Fn(CycleInfo) + Send + Sync>;

/// Counters of engine activity since creation or the last reset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub acquisitions: u64,
    pub releases: u64,
    /// Releases of a lock the calling thread did not hold
    pub unmatched_releases: u64,
    pub condvar_waits: u64,
    pub condvar_signals: u64,
    pub denials: u64,
}

/// All mutable engine state, guarded by [`Engine::state`]
pub(crate) struct EngineState {
    arena: Arena,
    graph: LockGraph,
    threads: ThreadRegistry,
    /// Reused buffer for the held set of the thread being validated
    held_scratch: Vec<NodeRef>,
    logger: Option<EventLogger>,
    stats: EngineStats,
}

// SAFETY: the raw node and context pointers point into `arena`, which the
// state owns, and are only touched through `&mut EngineState` under the mutex.
unsafe impl Send for EngineState {}

impl EngineState {
    fn new(arena: Arena) -> Self {
        EngineState {
            arena,
            graph: LockGraph::new(),
            threads: ThreadRegistry::new(),
            held_scratch: Vec::with_capacity(16),
            logger: None,
            stats: EngineStats::default(),
        }
    }

    /// Validate `node` against every lock `context` holds, then record the
    /// held-before edges.
    ///
    /// Held locks at `excluded` are skipped. When `shared` is set, a held entry
    /// for `node` itself is skipped instead of being treated as a
    /// self-deadlock. Nothing is recorded if any held lock closes a cycle.
    fn order_after_held(
        &mut self,
        thread_id: ThreadId,
        context: Option<ContextRef>,
        node: NodeRef,
        excluded: Option<LockAddr>,
        shared: bool,
    ) -> Option<CycleInfo> {
        let context = context?;

        let mut held = std::mem::take(&mut self.held_scratch);
        held.clear();
        ThreadRegistry::held_nodes(context, &mut held);
        let considered = |h: NodeRef| Some(node_addr(h)) != excluded && !(shared && h == node);

        let mut denial = None;
        for &h in held.iter().filter(|&&h| considered(h)) {
            if let Some(cycle) = self.graph.find_path(node, h) {
                denial = Some(CycleInfo {
                    thread_id,
                    requested: node_addr(node),
                    requested_kind: node_kind(node),
                    held: node_addr(h),
                    held_kind: node_kind(h),
                    cycle,
                    timestamp: Utc::now().to_rfc3339(),
                });
                break;
            }
        }

        if denial.is_none() {
            for &h in held.iter().filter(|&&h| considered(h)) {
                self.graph.add_edge(&mut self.arena, h, node);
            }
        }

        self.held_scratch = held;
        denial
    }

    fn deny(&mut self, info: &CycleInfo) {
        self.stats.denials += 1;
        self.log(|| {
            LogEntry::new(info.thread_id, info.requested, Some(info.requested_kind), Events::Denied)
                .with_peer(info.held)
                .with_cycle(info.cycle.clone())
        });
    }

    fn log(&self, entry: impl FnOnce() -> LogEntry) {
        if let Some(logger) = &self.logger {
            logger.log(entry());
        }
    }

    fn reset(&mut self) {
        // Registries first: they hold pointers into the arena.
        self.graph.clear();
        self.threads.clear();
        self.held_scratch.clear();
        self.arena.reset();
        self.stats = EngineStats::default();
    }
}

/// Lock dependency graph and deadlock-detection engine
pub struct Engine {
    state: Mutex<EngineState>,
    callback: RwLock<Option<DeadlockCallback>>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    /// Create an engine with an empty graph and the default arena size
    pub fn new() -> Self {
        Self::with_arena(Arena::new())
    }

    /// Create an engine whose arenas are at least `arena_size` bytes
    pub fn with_arena_size(arena_size: usize) -> Self {
        Self::with_arena(Arena::with_arena_size(arena_size))
    }

    fn with_arena(arena: Arena) -> Self {
        Engine {
            state: Mutex::new(EngineState::new(arena)),
            callback: RwLock::new(None),
        }
    }

    /// Create an engine set up according to `config`
    ///
    /// A log file that cannot be created is reported and logging stays off; the
    /// engine itself never fails to start.
    pub fn from_config(config: &Config) -> Self {
        let engine = Self::new();
        if let Some(path) = &config.log_path {
            match EventLogger::with_file(path) {
                Ok(event_logger) => engine.set_logger(Some(event_logger)),
                Err(e) => logger::diag(format_args!("event log disabled: {e:#}")),
            }
        }
        engine
    }

    /// Attach (or detach, with `None`) the structured event log
    pub fn set_logger(&self, event_logger: Option<EventLogger>) {
        self.state.lock().logger = event_logger;
    }

    /// Whether a structured event log is attached
    pub fn is_logging(&self) -> bool {
        self.state.lock().logger.is_some()
    }

    /// Register the function called with every denial report
    pub fn set_callback<F>(&self, callback: F)
    where
        F: Fn(CycleInfo) + Send + Sync + 'static,
    {
        self.install_callback(Arc::new(callback));
    }

    pub(crate) fn install_callback(&self, callback: DeadlockCallback) {
        *self.callback.write() = Some(callback);
    }

    pub fn clear_callback(&self) {
        *self.callback.write() = None;
    }

    /// Flush pending event log entries to disk
    ///
    /// # Errors
    /// Returns an error if the logger thread does not acknowledge the flush
    pub fn flush_logs(&self) -> Result<()> {
        match &self.state.lock().logger {
            Some(event_logger) => event_logger.flush(),
            None => Ok(()),
        }
    }

    /// Report a denial outside the critical section
    fn report_denial(&self, info: CycleInfo) {
        logger::diag(format_args!("{info}"));
        let callback = self.callback.read().clone();
        if let Some(callback) = callback {
            callback(info);
        }
    }

    /// Locks `thread_id` currently holds, most recently acquired first
    pub fn held_locks(&self, thread_id: ThreadId) -> Vec<LockAddr> {
        let state = self.state.lock();
        let Some(context) = state.threads.find(thread_id) else {
            return Vec::new();
        };
        let mut nodes = Vec::new();
        ThreadRegistry::held_nodes(context, &mut nodes);
        nodes.into_iter().map(node_addr).collect()
    }

    /// Whether `thread_id` currently holds `addr`
    pub fn holds(&self, thread_id: ThreadId, addr: LockAddr) -> bool {
        let state = self.state.lock();
        let Some(context) = state.threads.find(thread_id) else {
            return false;
        };
        let mut nodes = Vec::new();
        ThreadRegistry::held_nodes(context, &mut nodes);
        nodes.into_iter().any(|node| node_addr(node) == addr)
    }

    /// Number of held-lock entries of `thread_id`, counting stacked shared holds
    pub fn held_count(&self, thread_id: ThreadId) -> usize {
        self.state
            .lock()
            .threads
            .find(thread_id)
            .map_or(0, ThreadRegistry::depth)
    }

    /// Whether the engine has recorded that `before` was held while `after` was acquired
    pub fn has_edge(&self, before: LockAddr, after: LockAddr) -> bool {
        self.state.lock().graph.has_edge(before, after)
    }

    /// Recorded synchronization type of `addr`, if the engine has seen it
    pub fn lock_kind(&self, addr: LockAddr) -> Option<LockKind> {
        self.state.lock().graph.find(addr).map(node_kind)
    }

    /// Number of distinct lock addresses seen
    pub fn lock_count(&self) -> usize {
        self.state.lock().graph.node_count()
    }

    /// Number of distinct dependency edges recorded
    pub fn edge_count(&self) -> usize {
        self.state.lock().graph.edge_count()
    }

    /// Number of threads that ever acquired a lock
    pub fn thread_count(&self) -> usize {
        self.state.lock().threads.len()
    }

    /// Whether the recorded dependency graph is free of cycles
    pub fn is_acyclic(&self) -> bool {
        self.state.lock().graph.is_acyclic()
    }

    pub fn stats(&self) -> EngineStats {
        self.state.lock().stats
    }

    /// Bytes of arena memory handed out to engine objects
    pub fn memory_used(&self) -> usize {
        self.state.lock().arena.bytes_used()
    }

    /// Forget every lock, edge and thread context and rewind the arena
    ///
    /// Meant for resets between test runs; must not race with threads that
    /// still hold locks they expect the engine to remember.
    pub fn reset(&self) {
        self.state.lock().reset();
    }
}

// Process-global engine used by the facade functions and the C API
lazy_static::lazy_static! {
    static ref GLOBAL_ENGINE: Engine = {
        let engine = Engine::from_config(config::get());
        if engine.is_logging() {
            // SAFETY: registering a plain `extern "C"` function has no preconditions.
            if unsafe { libc::atexit(flush_global_at_exit) } != 0 {
                logger::diag(format_args!("could not register event log flush at exit"));
            }
        }
        engine
    };
}

/// The global engine is never dropped; queued log entries are written here
extern "C" fn flush_global_at_exit() {
    guarded((), || {
        if let Err(e) = GLOBAL_ENGINE.flush_logs() {
            logger::diag(format_args!("failed to flush event log at exit: {e:#}"));
        }
    });
}

/// The process-global engine
pub fn global() -> &'static Engine {
    &GLOBAL_ENGINE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Acquisition;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const T1: ThreadId = 1;
    const T2: ThreadId = 2;
    const A: LockAddr = 0xA000;
    const B: LockAddr = 0xB000;

    #[test]
    fn test_reset_forgets_everything() {
        let engine = Engine::new();
        assert!(engine.acquire(T1, A, Acquisition::Mutex));
        assert!(engine.acquire(T1, B, Acquisition::Mutex));
        assert!(engine.memory_used() > 0);

        engine.reset();
        assert_eq!(engine.lock_count(), 0);
        assert_eq!(engine.edge_count(), 0);
        assert_eq!(engine.thread_count(), 0);
        assert!(engine.held_locks(T1).is_empty());
        assert_eq!(engine.memory_used(), 0);
        assert_eq!(engine.stats(), EngineStats::default());

        // The reversed order is fine again once history is gone
        assert!(engine.acquire(T2, B, Acquisition::Mutex));
        assert!(engine.acquire(T2, A, Acquisition::Mutex));
    }

    #[test]
    fn test_callback_receives_denial() {
        let engine = Engine::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(None));
        {
            let calls = Arc::clone(&calls);
            let seen = Arc::clone(&seen);
            engine.set_callback(move |info| {
                calls.fetch_add(1, Ordering::SeqCst);
                *seen.lock() = Some(info);
            });
        }

        assert!(engine.acquire(T1, A, Acquisition::Mutex));
        assert!(engine.acquire(T1, B, Acquisition::Mutex));
        engine.release(T1, B);
        engine.release(T1, A);

        assert!(engine.acquire(T2, B, Acquisition::Mutex));
        assert!(!engine.acquire(T2, A, Acquisition::Mutex));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let info = seen.lock().take().unwrap();
        assert_eq!(info.thread_id, T2);
        assert_eq!(info.requested, A);
        assert_eq!(info.held, B);
        assert_eq!(info.cycle, vec![A, B]);

        engine.clear_callback();
        assert!(!engine.acquire(T2, A, Acquisition::Mutex));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stats_track_operations() {
        let engine = Engine::new();
        engine.acquire(T1, A, Acquisition::Mutex);
        engine.wait_condvar(T1, 0xC0, A);
        engine.signal_condvar(T2, 0xC0);
        engine.release(T1, A);
        engine.release(T1, B);

        let stats = engine.stats();
        assert_eq!(stats.acquisitions, 1);
        assert_eq!(stats.condvar_waits, 1);
        assert_eq!(stats.condvar_signals, 1);
        assert_eq!(stats.releases, 2);
        assert_eq!(stats.unmatched_releases, 2);
        assert_eq!(stats.denials, 0);
    }

    #[test]
    fn test_engine_logs_events() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let log_path = temp_dir.path().join("engine.log");

        let engine = Engine::new();
        engine.set_logger(Some(EventLogger::with_file(&log_path).unwrap()));
        engine.acquire(T1, A, Acquisition::Mutex);
        engine.acquire(T1, B, Acquisition::Mutex);
        engine.release(T1, B);
        engine.release(T1, A);
        engine.acquire(T2, B, Acquisition::Mutex);
        engine.acquire(T2, A, Acquisition::Mutex);
        engine.flush_logs().unwrap();

        let entries = logger::read_log(&log_path).unwrap();
        let events: Vec<Events> = entries.iter().map(|e| e.event).collect();
        assert_eq!(
            events,
            vec![
                Events::Acquire,
                Events::Acquire,
                Events::Release,
                Events::Release,
                Events::Acquire,
                Events::Denied
            ]
        );
        let denial = entries.last().unwrap();
        assert_eq!(denial.peer, Some(B));
        assert_eq!(denial.cycle, vec![A, B]);
    }
}
