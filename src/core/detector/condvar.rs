//! Condition variable wait and signal
//!
//! Waiting on condvar `C` with mutex `M` orders `C` after every other lock the
//! thread holds, exactly like an acquisition of `C`, and then drops `M` from
//! the thread's held set: while blocked the thread does not hold `M`. The
//! caller reports the re-acquisition of `M` after the wait returns as an
//! ordinary mutex acquisition.
//!
//! Signalling is observational only and records no ordering.

use crate::core::config;
use crate::core::detector::{Engine, EngineState, global};
use crate::core::logger::{self, LogEntry};
use crate::core::types::{CycleInfo, Events, LockAddr, LockKind, ThreadId, get_current_thread_id};

impl EngineState {
    pub(crate) fn wait_condvar(
        &mut self,
        thread_id: ThreadId,
        cond: LockAddr,
        mutex: LockAddr,
    ) -> Result<(), CycleInfo> {
        let node = self.graph.find_or_create(&mut self.arena, cond, LockKind::CondVar);
        let context = self.threads.find(thread_id);

        if let Some(info) = self.order_after_held(thread_id, context, node, Some(mutex), false) {
            self.deny(&info);
            return Err(info);
        }

        if let Some(context) = context {
            self.threads.detach(context, mutex);
        }
        self.stats.condvar_waits += 1;
        self.log(|| {
            LogEntry::new(thread_id, cond, Some(LockKind::CondVar), Events::CondvarWait)
                .with_peer(mutex)
        });
        Ok(())
    }

    /// Put `mutex` back into the held set after a wait that never blocked
    pub(crate) fn cancel_wait(&mut self, thread_id: ThreadId, mutex: LockAddr) {
        let Some(node) = self.graph.find(mutex) else {
            return;
        };
        let context = self.threads.find(thread_id);
        self.threads.attach(&mut self.arena, context, thread_id, node);
    }

    pub(crate) fn signal_condvar(&mut self, thread_id: ThreadId, cond: LockAddr) {
        self.stats.condvar_signals += 1;
        self.log(|| LogEntry::new(thread_id, cond, Some(LockKind::CondVar), Events::CondvarSignal));
    }
}

impl Engine {
    /// Validate a wait on `cond` while holding `mutex`
    ///
    /// # Returns
    /// `true` if the wait is allowed; `mutex` is then no longer in the
    /// thread's held set. `false` if waiting would close a cycle; nothing
    /// changes in that case.
    pub fn wait_condvar(&self, thread_id: ThreadId, cond: LockAddr, mutex: LockAddr) -> bool {
        let verdict = self.state.lock().wait_condvar(thread_id, cond, mutex);
        match verdict {
            Ok(()) => {
                logger::verbose(format_args!(
                    "thread {thread_id} waits on condvar {cond:#x} releasing mutex {mutex:#x}"
                ));
                true
            }
            Err(info) => {
                self.report_denial(info);
                false
            }
        }
    }

    /// Undo the held-set change of an allowed [`wait_condvar`](Self::wait_condvar)
    /// whose real wait failed before releasing `mutex`
    ///
    /// The mutex is re-attached without validation: the thread never let go
    /// of it. Edges recorded by the wait stay.
    pub fn cancel_wait(&self, thread_id: ThreadId, mutex: LockAddr) {
        self.state.lock().cancel_wait(thread_id, mutex);
        logger::verbose(format_args!(
            "thread {thread_id} still holds mutex {mutex:#x} after a failed wait"
        ));
    }

    /// Record a signal or broadcast of `cond`
    pub fn signal_condvar(&self, thread_id: ThreadId, cond: LockAddr) {
        self.state.lock().signal_condvar(thread_id, cond);
        logger::verbose(format_args!("thread {thread_id} signals condvar {cond:#x}"));
    }
}

/// Validate a condvar wait by the calling thread against the global engine
pub fn wait_condvar(cond: LockAddr, mutex: LockAddr) -> bool {
    if !config::is_enabled() {
        return true;
    }
    global().wait_condvar(get_current_thread_id(), cond, mutex)
}

/// Record a condvar signal/broadcast by the calling thread
pub fn signal_condvar(cond: LockAddr) {
    if !config::is_enabled() {
        return;
    }
    global().signal_condvar(get_current_thread_id(), cond);
}
