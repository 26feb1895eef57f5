use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Thread identifier type
///
/// Uniquely identifies a thread in the application.
pub type ThreadId = usize;

// Global counter for assigning unique thread IDs
static THREAD_ID_COUNTER: AtomicUsize = AtomicUsize::new(1);

// Thread-local storage for each thread's assigned ID
thread_local! {
    static THREAD_ID: ThreadId = {
        // Each thread gets a unique ID once, when this is first accessed
        THREAD_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
    };
}

/// Get a unique identifier of the current thread
/// This will always return the same ID for the lifetime of the thread
pub fn get_current_thread_id() -> ThreadId {
    THREAD_ID.with(|&id| id)
}

/// Lock identity
///
/// The address of the synchronization object. It is only ever compared for
/// equality and hashed; the engine never dereferences it.
pub type LockAddr = usize;

/// Synchronization type recorded on a lock node
///
/// Read and write acquisitions of a reader-writer lock collapse into
/// [`LockKind::RwLock`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum LockKind {
    Mutex,
    RwLock,
    Semaphore,
    CondVar,
}

impl fmt::Display for LockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LockKind::Mutex => "mutex",
            LockKind::RwLock => "rwlock",
            LockKind::Semaphore => "semaphore",
            LockKind::CondVar => "condvar",
        };
        f.write_str(name)
    }
}

/// The flavor of an acquisition as seen at the call-in boundary
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Acquisition {
    Mutex,
    RwLockRead,
    RwLockWrite,
    Semaphore,
}

impl Acquisition {
    /// Node type this acquisition is recorded under
    pub fn kind(self) -> LockKind {
        match self {
            Acquisition::Mutex => LockKind::Mutex,
            Acquisition::RwLockRead | Acquisition::RwLockWrite => LockKind::RwLock,
            Acquisition::Semaphore => LockKind::Semaphore,
        }
    }

    /// Whether a thread may acquire this lock again while already holding it.
    ///
    /// Exclusive acquisitions of a held lock block forever on a normal
    /// primitive, so they are treated as a self-deadlock. Shared ones stack.
    pub fn is_shared(self) -> bool {
        matches!(self, Acquisition::RwLockRead | Acquisition::Semaphore)
    }
}

/// Represents the type of engine event that occurred
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Events {
    /// Thread was allowed to acquire a lock
    Acquire,
    /// Thread released a lock
    Release,
    /// Thread started waiting on a condition variable
    CondvarWait,
    /// Thread signalled or broadcast a condition variable
    CondvarSignal,
    /// Acquisition or wait refused because it would close a cycle
    Denied,
}

/// Report produced when an acquisition is refused
///
/// `cycle` is the ordering path that already existed in the graph from the
/// requested lock back to the held lock, so the full cycle reads
/// `held -> cycle[0] -> ... -> cycle[n-1]` with `cycle[0] == requested` and
/// `cycle[n-1] == held`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleInfo {
    /// Thread whose acquisition was denied
    pub thread_id: ThreadId,
    /// Lock the thread was trying to acquire (or the condvar it tried to wait on)
    pub requested: LockAddr,
    pub requested_kind: LockKind,
    /// Lock already held by the thread that closes the cycle
    pub held: LockAddr,
    pub held_kind: LockKind,
    /// Recorded ordering path from `requested` back to `held`
    pub cycle: Vec<LockAddr>,
    /// ISO-8601 timestamp of the denial
    pub timestamp: String,
}

impl fmt::Display for CycleInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DEADLOCK DETECTED: thread {} acquiring {} {:#x} while holding {} {:#x}; recorded order:",
            self.thread_id, self.requested_kind, self.requested, self.held_kind, self.held
        )?;
        for addr in &self.cycle {
            write!(f, " {addr:#x} ->")?;
        }
        write!(f, " {:#x}", self.requested)
    }
}
