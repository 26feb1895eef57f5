//! # Lockdep
//!
//! A runtime lock-order validator that refuses acquisitions which would
//! deadlock.
//!
//! Every time a thread acquires a lock while holding others, the engine
//! records a "held before" edge in a process-wide dependency graph. An
//! acquisition that would close a cycle in that graph is denied before the
//! thread blocks, so the potential deadlock is reported instead of hanging the
//! process.
//!
//! ## Features
//!
//! - Mutexes, reader-writer locks, counting semaphores and condition variables
//! - Arena-backed graph storage outside the general-purpose heap
//! - Structured JSON-lines event log and a `lockdep` CLI summarising it
//! - C API and, with the `interpose` feature, `pthread_*`/`sem_*` overrides
//!   for `LD_PRELOAD`
//!
//! ## Usage
//!
//! ```no_run
//! use lockdep::Lockdep;
//!
//! Lockdep::new()
//!     .with_log("lockdep_{timestamp}.log")
//!     .callback(|info| eprintln!("{info}"))
//!     .start()
//!     .expect("lockdep configuration");
//!
//! let (a, b) = (0x1000, 0x2000);
//! assert!(lockdep::acquire_mutex(a));
//! assert!(lockdep::acquire_mutex(b));
//! lockdep::release(b);
//! lockdep::release(a);
//! ```

mod core;
pub use crate::core::{
    DeadlockCallback, Engine, EngineStats, Lockdep,
    arena::Arena,
    config::Config,
    detector::{
        acquire_mutex, acquire_rwlock_read, acquire_rwlock_write, acquire_semaphore, release,
        signal_condvar, wait_condvar,
    },
    global,
    guard::{ReentrancyGuard, guarded},
    logger::{EventLogger, LogEntry, read_log},
    types::{
        Acquisition, CycleInfo, Events, LockAddr, LockKind, ThreadId, get_current_thread_id,
    },
};

/// Environment switches read on first use when no [`Lockdep`] builder ran
pub mod env {
    pub use crate::core::config::{ENV_DISABLE, ENV_LOG, ENV_VERBOSE};
}

pub mod ffi;
pub mod interpose;
