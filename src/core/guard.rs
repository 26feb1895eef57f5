//! Thread-local re-entrancy guard
//!
//! Anything that calls into the engine from an intercepted primitive must hold
//! a [`ReentrancyGuard`] for the duration of the engine call, and only for
//! that: the real primitive call stays outside. If the engine (or anything it
//! calls) touches an intercepted primitive again on the same thread, the inner
//! call finds the guard taken and skips instrumentation.
//!
//! The engine's own critical section is a `parking_lot` mutex, which never
//! goes through the intercepted `pthread_mutex_*` entry points; it must never
//! be routed through the interception boundary.

use std::cell::Cell;
use std::marker::PhantomData;

thread_local! {
    static IN_ENGINE: Cell<bool> = const { Cell::new(false) };
}

/// Scoped "inside the engine" marker; cleared on drop, including early returns
#[derive(Debug)]
pub struct ReentrancyGuard {
    // Tied to the thread that set the flag.
    _not_send: PhantomData<*const ()>,
}

impl ReentrancyGuard {
    /// Take the guard for the current thread
    ///
    /// # Returns
    /// `None` if this thread is already inside the engine, or if its thread
    /// locals are already torn down (thread exit)
    pub fn enter() -> Option<Self> {
        IN_ENGINE
            .try_with(|flag| {
                if flag.replace(true) {
                    None
                } else {
                    Some(ReentrancyGuard {
                        _not_send: PhantomData,
                    })
                }
            })
            .ok()
            .flatten()
    }

    /// Whether the current thread is inside the engine
    pub fn is_active() -> bool {
        IN_ENGINE.try_with(Cell::get).unwrap_or(true)
    }
}

impl Drop for ReentrancyGuard {
    fn drop(&mut self) {
        let _ = IN_ENGINE.try_with(|flag| flag.set(false));
    }
}

/// Run `f` under the guard, or return `fallback` if already inside the engine
pub fn guarded<R>(fallback: R, f: impl FnOnce() -> R) -> R {
    match ReentrancyGuard::enter() {
        Some(_guard) => f(),
        None => fallback,
    }
}
