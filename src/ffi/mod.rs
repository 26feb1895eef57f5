//! FFI bindings for the Lockdep C API
//!
//! Maps C calls onto the process-global engine for the calling thread. Lock
//! identities are the addresses of the caller's synchronization objects; they
//! are never dereferenced. Every engine call runs under the thread-local
//! re-entrancy guard, so a nested call made from inside the engine is allowed
//! without being recorded.

use crate::core::config;
use crate::core::detector::{self, global};
use crate::core::guard::guarded;
use crate::core::{Lockdep, logger};
use crate::core::types::{CycleInfo, LockAddr};
use std::ffi::{CStr, CString, c_void};
use std::os::raw::{c_char, c_int};

fn as_addr(ptr: *const c_void) -> LockAddr {
    ptr as LockAddr
}

fn verdict(allowed: bool) -> c_int {
    if allowed { 1 } else { 0 }
}

/// Initialize lockdep.
///
/// Fixes the process configuration (instead of reading it from the
/// environment) and optionally registers a deadlock callback.
///
/// # Arguments
/// * `log_path` - Path to the event log as a null-terminated C string, or NULL to disable logging.
/// * `verbose` - Non-zero to print a diagnostic line for every operation.
/// * `callback` - Function called with a JSON description of every denied
///   acquisition, or NULL for no callback. The string is only valid during the call.
///
/// # Returns
/// * `0` on success
/// * `1` if the configuration was already fixed
/// * `-1` if the log path contains invalid UTF-8
/// * `-2` if the event log could not be created
///
/// # Safety
/// The caller must ensure `log_path` is either `NULL` or a valid null-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn lockdep_init(
    log_path: *const c_char,
    verbose: c_int,
    callback: Option<extern "C" fn(*const c_char)>,
) -> c_int {
    if config::is_fixed() {
        return 1;
    }

    let mut builder = Lockdep::new().verbose(verbose != 0);
    if !log_path.is_null() {
        // SAFETY: non-null and NUL-terminated per the caller contract.
        match unsafe { CStr::from_ptr(log_path) }.to_str() {
            Ok(path) => builder = builder.with_log(path),
            Err(_) => return -1,
        }
    }
    if let Some(cb) = callback {
        builder = builder.callback(move |info: CycleInfo| {
            if let Ok(json) = serde_json::to_string(&info)
                && let Ok(c_str) = CString::new(json)
            {
                cb(c_str.as_ptr());
            }
        });
    }

    match builder.start() {
        Ok(()) => 0,
        Err(e) => {
            logger::diag(format_args!("{e:#}"));
            -2
        }
    }
}

/// Check if detection is enabled.
///
/// # Returns
/// * `1` unless disabled through `LOCKDEP_DISABLE=1`
#[unsafe(no_mangle)]
pub extern "C" fn lockdep_is_enabled() -> c_int {
    verdict(config::is_enabled())
}

/// Check if the event log is active.
#[unsafe(no_mangle)]
pub extern "C" fn lockdep_is_logging_enabled() -> c_int {
    verdict(config::is_enabled() && global().is_logging())
}

/// Validate a mutex acquisition by the calling thread.
///
/// Call before blocking on the mutex.
///
/// # Returns
/// * `1` if the acquisition is allowed
/// * `0` if it would close a lock-order cycle; the mutex must not be locked
#[unsafe(no_mangle)]
pub extern "C" fn lockdep_acquire_mutex(mutex: *const c_void) -> c_int {
    guarded(1, || verdict(detector::acquire_mutex(as_addr(mutex))))
}

/// Validate a shared (read) acquisition of a reader-writer lock.
#[unsafe(no_mangle)]
pub extern "C" fn lockdep_acquire_rwlock_read(rwlock: *const c_void) -> c_int {
    guarded(1, || verdict(detector::acquire_rwlock_read(as_addr(rwlock))))
}

/// Validate an exclusive (write) acquisition of a reader-writer lock.
#[unsafe(no_mangle)]
pub extern "C" fn lockdep_acquire_rwlock_write(rwlock: *const c_void) -> c_int {
    guarded(1, || verdict(detector::acquire_rwlock_write(as_addr(rwlock))))
}

/// Validate a semaphore wait.
#[unsafe(no_mangle)]
pub extern "C" fn lockdep_acquire_semaphore(sem: *const c_void) -> c_int {
    guarded(1, || verdict(detector::acquire_semaphore(as_addr(sem))))
}

/// Record that the calling thread released a lock of any flavor.
///
/// Call after the real unlock/post succeeded. Releasing a lock the thread
/// does not hold is ignored.
#[unsafe(no_mangle)]
pub extern "C" fn lockdep_release_lock(lock: *const c_void) {
    guarded((), || detector::release(as_addr(lock)));
}

/// Alias of [`lockdep_release_lock`] for mutexes.
#[unsafe(no_mangle)]
pub extern "C" fn lockdep_release_mutex(mutex: *const c_void) {
    lockdep_release_lock(mutex);
}

/// Alias of [`lockdep_release_lock`] for reader-writer locks.
#[unsafe(no_mangle)]
pub extern "C" fn lockdep_release_rwlock(rwlock: *const c_void) {
    lockdep_release_lock(rwlock);
}

/// Alias of [`lockdep_release_lock`] for semaphores.
#[unsafe(no_mangle)]
pub extern "C" fn lockdep_release_semaphore(sem: *const c_void) {
    lockdep_release_lock(sem);
}

/// Validate a condition variable wait.
///
/// On success `mutex` is no longer considered held; report its
/// re-acquisition with [`lockdep_acquire_mutex`] once the wait returns.
///
/// # Returns
/// * `1` if the wait is allowed
/// * `0` if it would close a lock-order cycle
#[unsafe(no_mangle)]
pub extern "C" fn lockdep_wait_condvar(cond: *const c_void, mutex: *const c_void) -> c_int {
    guarded(1, || verdict(detector::wait_condvar(as_addr(cond), as_addr(mutex))))
}

/// Record a condition variable signal or broadcast.
#[unsafe(no_mangle)]
pub extern "C" fn lockdep_signal_condvar(cond: *const c_void) {
    guarded((), || detector::signal_condvar(as_addr(cond)));
}

/// Flush all pending event log entries to disk.
///
/// # Returns
/// * `0` on success (or when logging is off)
/// * `-1` if the flush failed
#[unsafe(no_mangle)]
pub extern "C" fn lockdep_flush_logs() -> c_int {
    guarded(0, || match global().flush_logs() {
        Ok(()) => 0,
        Err(e) => {
            logger::diag(format_args!("flush failed: {e:#}"));
            -1
        }
    })
}

/// Forget every recorded lock, edge and thread context.
///
/// Meant for test harnesses between runs; no thread may hold a tracked lock
/// while this runs.
#[unsafe(no_mangle)]
pub extern "C" fn lockdep_reset() {
    guarded((), || global().reset());
}
