//! Mutex, reader-writer lock and semaphore acquisition, and release
//!
//! Acquiring lock `L` while holding `H1..Hn` records the edges `Hi -> L`. Before
//! any of them is recorded the engine searches for a path `L -> ... -> Hi`; if
//! one exists the new edge would close a cycle, the acquisition is denied and
//! neither the graph nor the thread's held set changes.

use crate::core::config;
use crate::core::detector::{Engine, EngineState, global};
use crate::core::logger::{self, LogEntry};
use crate::core::types::{Acquisition, CycleInfo, Events, LockAddr, ThreadId, get_current_thread_id};

impl EngineState {
    pub(crate) fn acquire(
        &mut self,
        thread_id: ThreadId,
        addr: LockAddr,
        how: Acquisition,
    ) -> Result<(), CycleInfo> {
        let node = self.graph.find_or_create(&mut self.arena, addr, how.kind());
        let context = self.threads.find(thread_id);

        if let Some(info) = self.order_after_held(thread_id, context, node, None, how.is_shared()) {
            self.deny(&info);
            return Err(info);
        }

        self.threads.attach(&mut self.arena, context, thread_id, node);
        self.stats.acquisitions += 1;
        self.log(|| LogEntry::new(thread_id, addr, Some(how.kind()), Events::Acquire));
        Ok(())
    }

    /// # Returns
    /// `false` if the thread held no entry for `addr`
    pub(crate) fn release(&mut self, thread_id: ThreadId, addr: LockAddr) -> bool {
        self.stats.releases += 1;
        self.log(|| {
            let kind = self.graph.find(addr).map(crate::core::graph::node_kind);
            LogEntry::new(thread_id, addr, kind, Events::Release)
        });

        let released = match self.threads.find(thread_id) {
            Some(context) => self.threads.detach(context, addr),
            None => false,
        };
        if !released {
            self.stats.unmatched_releases += 1;
        }
        released
    }
}

impl Engine {
    /// Validate an acquisition of `addr` by `thread_id`
    ///
    /// # Arguments
    /// * `thread_id` - Thread performing the acquisition
    /// * `addr` - Identity of the lock
    /// * `how` - Primitive flavor; decides the recorded type and whether
    ///   re-acquiring a held lock is allowed
    ///
    /// # Returns
    /// `true` if the acquisition keeps the lock order acyclic and was recorded,
    /// `false` if it was denied
    pub fn acquire(&self, thread_id: ThreadId, addr: LockAddr, how: Acquisition) -> bool {
        let verdict = self.state.lock().acquire(thread_id, addr, how);
        match verdict {
            Ok(()) => {
                logger::verbose(format_args!(
                    "thread {thread_id} acquired {} {addr:#x}",
                    how.kind()
                ));
                true
            }
            Err(info) => {
                self.report_denial(info);
                false
            }
        }
    }

    /// Record that `thread_id` released `addr`
    ///
    /// Releasing a lock the thread does not hold, or releasing before the
    /// thread ever acquired anything, is tolerated and changes nothing.
    /// Dependency edges are never removed.
    pub fn release(&self, thread_id: ThreadId, addr: LockAddr) {
        let released = self.state.lock().release(thread_id, addr);
        if released {
            logger::verbose(format_args!("thread {thread_id} released {addr:#x}"));
        } else {
            logger::verbose(format_args!(
                "thread {thread_id} released untracked lock {addr:#x}"
            ));
        }
    }

    pub fn acquire_mutex(&self, thread_id: ThreadId, addr: LockAddr) -> bool {
        self.acquire(thread_id, addr, Acquisition::Mutex)
    }

    pub fn acquire_rwlock_read(&self, thread_id: ThreadId, addr: LockAddr) -> bool {
        self.acquire(thread_id, addr, Acquisition::RwLockRead)
    }

    pub fn acquire_rwlock_write(&self, thread_id: ThreadId, addr: LockAddr) -> bool {
        self.acquire(thread_id, addr, Acquisition::RwLockWrite)
    }

    pub fn acquire_semaphore(&self, thread_id: ThreadId, addr: LockAddr) -> bool {
        self.acquire(thread_id, addr, Acquisition::Semaphore)
    }
}

fn acquire_current(addr: LockAddr, how: Acquisition) -> bool {
    if !config::is_enabled() {
        return true;
    }
    global().acquire(get_current_thread_id(), addr, how)
}

/// Validate a mutex lock by the calling thread against the global engine
pub fn acquire_mutex(addr: LockAddr) -> bool {
    acquire_current(addr, Acquisition::Mutex)
}

/// Validate a shared (read) lock of a reader-writer lock
pub fn acquire_rwlock_read(addr: LockAddr) -> bool {
    acquire_current(addr, Acquisition::RwLockRead)
}

/// Validate an exclusive (write) lock of a reader-writer lock
pub fn acquire_rwlock_write(addr: LockAddr) -> bool {
    acquire_current(addr, Acquisition::RwLockWrite)
}

/// Validate a semaphore wait
pub fn acquire_semaphore(addr: LockAddr) -> bool {
    acquire_current(addr, Acquisition::Semaphore)
}

/// Record a successful unlock/post by the calling thread
pub fn release(addr: LockAddr) {
    if !config::is_enabled() {
        return;
    }
    global().release(get_current_thread_id(), addr);
}
