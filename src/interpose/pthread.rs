//! `pthread_*` and `sem_*` overrides for `LD_PRELOAD`
//!
//! Built only with the `interpose` feature. Each override hands the object
//! address to an [`Interposer`] over the global engine and the real libc
//! functions. Mutex, rwlock and condvar overrides return the errno-style code
//! directly; semaphore overrides return `-1` and set `errno`.

#![allow(clippy::missing_safety_doc)]

use super::{Interposer, LibcProvider};
use crate::core::detector::global;
use crate::core::types::LockAddr;
use std::os::raw::c_int;

fn interposer() -> Interposer<'static, LibcProvider> {
    Interposer::new(global(), LibcProvider)
}

fn sem_return(rc: c_int) -> c_int {
    if rc == 0 {
        return 0;
    }
    // SAFETY: `__errno_location` returns the calling thread's errno slot.
    unsafe { *libc::__errno_location() = rc };
    -1
}

/// POSIX `pthread_mutex_lock`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pthread_mutex_lock(mutex: *mut libc::pthread_mutex_t) -> c_int {
    interposer().mutex_lock(mutex as LockAddr)
}

/// POSIX `pthread_mutex_trylock`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pthread_mutex_trylock(mutex: *mut libc::pthread_mutex_t) -> c_int {
    interposer().mutex_trylock(mutex as LockAddr)
}

/// POSIX `pthread_mutex_unlock`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pthread_mutex_unlock(mutex: *mut libc::pthread_mutex_t) -> c_int {
    interposer().mutex_unlock(mutex as LockAddr)
}

/// POSIX `pthread_rwlock_rdlock`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pthread_rwlock_rdlock(rwlock: *mut libc::pthread_rwlock_t) -> c_int {
    interposer().rwlock_rdlock(rwlock as LockAddr)
}

/// POSIX `pthread_rwlock_wrlock`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pthread_rwlock_wrlock(rwlock: *mut libc::pthread_rwlock_t) -> c_int {
    interposer().rwlock_wrlock(rwlock as LockAddr)
}

/// POSIX `pthread_rwlock_tryrdlock`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pthread_rwlock_tryrdlock(rwlock: *mut libc::pthread_rwlock_t) -> c_int {
    interposer().rwlock_tryrdlock(rwlock as LockAddr)
}

/// POSIX `pthread_rwlock_trywrlock`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pthread_rwlock_trywrlock(rwlock: *mut libc::pthread_rwlock_t) -> c_int {
    interposer().rwlock_trywrlock(rwlock as LockAddr)
}

/// POSIX `pthread_rwlock_unlock`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pthread_rwlock_unlock(rwlock: *mut libc::pthread_rwlock_t) -> c_int {
    interposer().rwlock_unlock(rwlock as LockAddr)
}

/// POSIX `sem_wait`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn sem_wait(sem: *mut libc::sem_t) -> c_int {
    sem_return(interposer().sem_wait(sem as LockAddr))
}

/// POSIX `sem_trywait`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn sem_trywait(sem: *mut libc::sem_t) -> c_int {
    sem_return(interposer().sem_trywait(sem as LockAddr))
}

/// POSIX `sem_post`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn sem_post(sem: *mut libc::sem_t) -> c_int {
    sem_return(interposer().sem_post(sem as LockAddr))
}

/// POSIX `pthread_cond_wait`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pthread_cond_wait(
    cond: *mut libc::pthread_cond_t,
    mutex: *mut libc::pthread_mutex_t,
) -> c_int {
    interposer().cond_wait(cond as LockAddr, mutex as LockAddr)
}

/// POSIX `pthread_cond_timedwait`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pthread_cond_timedwait(
    cond: *mut libc::pthread_cond_t,
    mutex: *mut libc::pthread_mutex_t,
    abstime: *const libc::timespec,
) -> c_int {
    // SAFETY: the caller passes a valid deadline, as POSIX requires.
    let Some(abstime) = (unsafe { abstime.as_ref() }) else {
        return libc::EINVAL;
    };
    interposer().cond_timedwait(cond as LockAddr, mutex as LockAddr, abstime)
}

/// POSIX `pthread_cond_signal`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pthread_cond_signal(cond: *mut libc::pthread_cond_t) -> c_int {
    interposer().cond_signal(cond as LockAddr)
}

/// POSIX `pthread_cond_broadcast`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pthread_cond_broadcast(cond: *mut libc::pthread_cond_t) -> c_int {
    interposer().cond_broadcast(cond as LockAddr)
}
