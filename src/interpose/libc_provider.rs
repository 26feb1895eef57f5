//! The next definitions of the pthread and semaphore functions in symbol
//! lookup order, resolved once through `dlsym(RTLD_NEXT, ..)`

use super::RealPrimitiveProvider;
use crate::core::logger;
use crate::core::types::LockAddr;
use std::ffi::{CStr, c_void};
use std::os::raw::c_int;
use std::sync::OnceLock;

type MutexFn = unsafe extern "C" fn(*mut libc::pthread_mutex_t) -> c_int;
type RwLockFn = unsafe extern "C" fn(*mut libc::pthread_rwlock_t) -> c_int;
type SemFn = unsafe extern "C" fn(*mut libc::sem_t) -> c_int;
type CondFn = unsafe extern "C" fn(*mut libc::pthread_cond_t) -> c_int;
type CondWaitFn =
    unsafe extern "C" fn(*mut libc::pthread_cond_t, *mut libc::pthread_mutex_t) -> c_int;
type CondTimedWaitFn = unsafe extern "C" fn(
    *mut libc::pthread_cond_t,
    *mut libc::pthread_mutex_t,
    *const libc::timespec,
) -> c_int;

struct RealFns {
    mutex_lock: Option<MutexFn>,
    mutex_trylock: Option<MutexFn>,
    mutex_unlock: Option<MutexFn>,
    rwlock_rdlock: Option<RwLockFn>,
    rwlock_wrlock: Option<RwLockFn>,
    rwlock_tryrdlock: Option<RwLockFn>,
    rwlock_trywrlock: Option<RwLockFn>,
    rwlock_unlock: Option<RwLockFn>,
    sem_wait: Option<SemFn>,
    sem_trywait: Option<SemFn>,
    sem_post: Option<SemFn>,
    cond_wait: Option<CondWaitFn>,
    cond_timedwait: Option<CondTimedWaitFn>,
    cond_signal: Option<CondFn>,
    cond_broadcast: Option<CondFn>,
}

static REAL: OnceLock<RealFns> = OnceLock::new();

/// Look up the next definition of `name`
///
/// # Safety
/// `F` must be the function pointer type matching the C signature of `name`.
unsafe fn resolve<F: Copy>(name: &CStr) -> Option<F> {
    // SAFETY: `name` is NUL-terminated; RTLD_NEXT is a valid pseudo-handle.
    let sym = unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr()) };
    if sym.is_null() {
        logger::diag(format_args!("could not resolve real {}", name.to_string_lossy()));
        return None;
    }
    // SAFETY: caller guarantees `F` is a fn pointer of the symbol's signature,
    // and fn pointers have the size of a data pointer on supported targets.
    Some(unsafe { std::mem::transmute_copy::<*mut c_void, F>(&sym) })
}

/// Condvar functions carry two symbol versions in glibc; plain `dlsym`
/// returns the legacy one, which is incompatible with current `pthread_cond_t`.
#[cfg(target_env = "gnu")]
unsafe fn resolve_cond<F: Copy>(name: &CStr) -> Option<F> {
    // SAFETY: both strings are NUL-terminated.
    let sym = unsafe { libc::dlvsym(libc::RTLD_NEXT, name.as_ptr(), c"GLIBC_2.3.2".as_ptr()) };
    if sym.is_null() {
        // SAFETY: forwarded caller contract.
        return unsafe { resolve(name) };
    }
    // SAFETY: as in `resolve`.
    Some(unsafe { std::mem::transmute_copy::<*mut c_void, F>(&sym) })
}

#[cfg(not(target_env = "gnu"))]
unsafe fn resolve_cond<F: Copy>(name: &CStr) -> Option<F> {
    // SAFETY: forwarded caller contract.
    unsafe { resolve(name) }
}

fn real() -> &'static RealFns {
    // SAFETY: every type annotation below matches the POSIX prototype.
    REAL.get_or_init(|| unsafe {
        RealFns {
            mutex_lock: resolve(c"pthread_mutex_lock"),
            mutex_trylock: resolve(c"pthread_mutex_trylock"),
            mutex_unlock: resolve(c"pthread_mutex_unlock"),
            rwlock_rdlock: resolve(c"pthread_rwlock_rdlock"),
            rwlock_wrlock: resolve(c"pthread_rwlock_wrlock"),
            rwlock_tryrdlock: resolve(c"pthread_rwlock_tryrdlock"),
            rwlock_trywrlock: resolve(c"pthread_rwlock_trywrlock"),
            rwlock_unlock: resolve(c"pthread_rwlock_unlock"),
            sem_wait: resolve(c"sem_wait"),
            sem_trywait: resolve(c"sem_trywait"),
            sem_post: resolve(c"sem_post"),
            cond_wait: resolve_cond(c"pthread_cond_wait"),
            cond_timedwait: resolve_cond(c"pthread_cond_timedwait"),
            cond_signal: resolve_cond(c"pthread_cond_signal"),
            cond_broadcast: resolve_cond(c"pthread_cond_broadcast"),
        }
    })
}

/// Semaphore functions report failure as `-1` plus `errno`
fn sem_result(rc: c_int) -> c_int {
    match rc {
        -1 => std::io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or(libc::EINVAL),
        rc => rc,
    }
}

/// [`RealPrimitiveProvider`] calling the process's real libc/libpthread
///
/// Every [`LockAddr`] handed to it must be the address of a live object of
/// the matching pthread/semaphore type.
#[derive(Debug, Clone, Copy, Default)]
pub struct LibcProvider;

macro_rules! call_real {
    ($slot:ident, $($arg:expr),+) => {
        match real().$slot {
            // SAFETY: the resolved symbol has this signature and the caller
            // passed addresses of live objects of the matching type.
            Some(f) => unsafe { f($($arg),+) },
            None => libc::ENOSYS,
        }
    };
}

impl RealPrimitiveProvider for LibcProvider {
    fn mutex_lock(&self, mutex: LockAddr) -> c_int {
        call_real!(mutex_lock, mutex as *mut libc::pthread_mutex_t)
    }

    fn mutex_trylock(&self, mutex: LockAddr) -> c_int {
        call_real!(mutex_trylock, mutex as *mut libc::pthread_mutex_t)
    }

    fn mutex_unlock(&self, mutex: LockAddr) -> c_int {
        call_real!(mutex_unlock, mutex as *mut libc::pthread_mutex_t)
    }

    fn rwlock_rdlock(&self, rwlock: LockAddr) -> c_int {
        call_real!(rwlock_rdlock, rwlock as *mut libc::pthread_rwlock_t)
    }

    fn rwlock_wrlock(&self, rwlock: LockAddr) -> c_int {
        call_real!(rwlock_wrlock, rwlock as *mut libc::pthread_rwlock_t)
    }

    fn rwlock_tryrdlock(&self, rwlock: LockAddr) -> c_int {
        call_real!(rwlock_tryrdlock, rwlock as *mut libc::pthread_rwlock_t)
    }

    fn rwlock_trywrlock(&self, rwlock: LockAddr) -> c_int {
        call_real!(rwlock_trywrlock, rwlock as *mut libc::pthread_rwlock_t)
    }

    fn rwlock_unlock(&self, rwlock: LockAddr) -> c_int {
        call_real!(rwlock_unlock, rwlock as *mut libc::pthread_rwlock_t)
    }

    fn sem_wait(&self, sem: LockAddr) -> c_int {
        sem_result(call_real!(sem_wait, sem as *mut libc::sem_t))
    }

    fn sem_trywait(&self, sem: LockAddr) -> c_int {
        sem_result(call_real!(sem_trywait, sem as *mut libc::sem_t))
    }

    fn sem_post(&self, sem: LockAddr) -> c_int {
        sem_result(call_real!(sem_post, sem as *mut libc::sem_t))
    }

    fn cond_wait(&self, cond: LockAddr, mutex: LockAddr) -> c_int {
        call_real!(
            cond_wait,
            cond as *mut libc::pthread_cond_t,
            mutex as *mut libc::pthread_mutex_t
        )
    }

    fn cond_timedwait(&self, cond: LockAddr, mutex: LockAddr, abstime: &libc::timespec) -> c_int {
        call_real!(
            cond_timedwait,
            cond as *mut libc::pthread_cond_t,
            mutex as *mut libc::pthread_mutex_t,
            abstime as *const libc::timespec
        )
    }

    fn cond_signal(&self, cond: LockAddr) -> c_int {
        call_real!(cond_signal, cond as *mut libc::pthread_cond_t)
    }

    fn cond_broadcast(&self, cond: LockAddr) -> c_int {
        call_real!(cond_broadcast, cond as *mut libc::pthread_cond_t)
    }
}
