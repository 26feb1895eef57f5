//! Call-in/call-out boundary between real synchronization primitives and the
//! engine
//!
//! [`Interposer`] sits where an intercepted `pthread_*`/`sem_*` call lands. It
//! asks the engine for a verdict, translates denials into OS error codes and
//! forwards everything else to the real primitive through a
//! [`RealPrimitiveProvider`]. Ordering per flavor:
//!
//! - blocking lock / wait: validate first, then block in the real primitive
//! - try-lock / try-wait: call the real primitive first; on success validate,
//!   and on denial undo the real acquisition before reporting failure
//! - unlock / post: call the real primitive, then record the release if it
//!   succeeded
//! - condvar wait: validate the wait, block, then record the re-acquisition of
//!   the mutex the real wait returns holding; a wait that fails without
//!   blocking puts the mutex back into the held set unvalidated
//! - signal / broadcast: call the real primitive, then record it
//!
//! Each engine call, and only the engine call, runs under the thread's
//! [`ReentrancyGuard`](crate::ReentrancyGuard).

#[cfg(all(feature = "interpose", target_os = "linux"))]
mod libc_provider;
#[cfg(all(feature = "interpose", target_os = "linux"))]
pub mod pthread;

#[cfg(all(feature = "interpose", target_os = "linux"))]
pub use libc_provider::LibcProvider;

use crate::core::config;
use crate::core::guard::guarded;
use crate::core::logger;
use crate::core::types::{LockAddr, ThreadId, get_current_thread_id};
use crate::core::Engine;
use std::os::raw::c_int;

/// The real primitives behind the interception layer
///
/// Locks are addressed by the same opaque [`LockAddr`] the engine uses. Every
/// method returns `0` on success or a positive errno-style code, as the
/// pthread functions do; semaphore methods use that convention too.
pub trait RealPrimitiveProvider {
    fn mutex_lock(&self, mutex: LockAddr) -> c_int;
    fn mutex_trylock(&self, mutex: LockAddr) -> c_int;
    fn mutex_unlock(&self, mutex: LockAddr) -> c_int;

    fn rwlock_rdlock(&self, rwlock: LockAddr) -> c_int;
    fn rwlock_wrlock(&self, rwlock: LockAddr) -> c_int;
    fn rwlock_tryrdlock(&self, rwlock: LockAddr) -> c_int;
    fn rwlock_trywrlock(&self, rwlock: LockAddr) -> c_int;
    fn rwlock_unlock(&self, rwlock: LockAddr) -> c_int;

    fn sem_wait(&self, sem: LockAddr) -> c_int;
    fn sem_trywait(&self, sem: LockAddr) -> c_int;
    fn sem_post(&self, sem: LockAddr) -> c_int;

    fn cond_wait(&self, cond: LockAddr, mutex: LockAddr) -> c_int;
    fn cond_timedwait(&self, cond: LockAddr, mutex: LockAddr, abstime: &libc::timespec)
    -> c_int;
    fn cond_signal(&self, cond: LockAddr) -> c_int;
    fn cond_broadcast(&self, cond: LockAddr) -> c_int;
}

/// Instrumented front for a [`RealPrimitiveProvider`]
pub struct Interposer<'e, P> {
    engine: &'e Engine,
    provider: P,
    enabled: bool,
}

impl<'e, P: RealPrimitiveProvider> Interposer<'e, P> {
    /// Instrument `provider` against `engine`, honoring the process
    /// enable switch
    pub fn new(engine: &'e Engine, provider: P) -> Self {
        Self::with_enabled(engine, provider, config::is_enabled())
    }

    /// Instrument `provider`; when `enabled` is false every call goes straight
    /// to the real primitive
    pub fn with_enabled(engine: &'e Engine, provider: P, enabled: bool) -> Self {
        Interposer {
            engine,
            provider,
            enabled,
        }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn engine(&self) -> &'e Engine {
        self.engine
    }

    /// Ask the engine for a verdict; allowed when disabled or re-entered
    fn validate(&self, verdict: impl FnOnce(&Engine, ThreadId) -> bool) -> bool {
        if !self.enabled {
            return true;
        }
        guarded(true, || verdict(self.engine, get_current_thread_id()))
    }

    fn observe(&self, record: impl FnOnce(&Engine, ThreadId)) {
        if self.enabled {
            guarded((), || record(self.engine, get_current_thread_id()));
        }
    }

    /// Undo the bookkeeping of a validated acquisition whose real call failed
    fn forget_on_failure(&self, addr: LockAddr, rc: c_int) -> c_int {
        if rc != 0 {
            self.observe(|engine, thread| engine.release(thread, addr));
        }
        rc
    }

    pub fn mutex_lock(&self, mutex: LockAddr) -> c_int {
        if !self.validate(|engine, thread| engine.acquire_mutex(thread, mutex)) {
            return libc::EDEADLK;
        }
        let rc = self.provider.mutex_lock(mutex);
        self.forget_on_failure(mutex, rc)
    }

    pub fn mutex_trylock(&self, mutex: LockAddr) -> c_int {
        let rc = self.provider.mutex_trylock(mutex);
        if rc != 0 {
            return rc;
        }
        if !self.validate(|engine, thread| engine.acquire_mutex(thread, mutex)) {
            self.rollback("mutex", mutex, self.provider.mutex_unlock(mutex));
            return libc::EBUSY;
        }
        0
    }

    pub fn mutex_unlock(&self, mutex: LockAddr) -> c_int {
        let rc = self.provider.mutex_unlock(mutex);
        if rc == 0 {
            self.observe(|engine, thread| engine.release(thread, mutex));
        }
        rc
    }

    pub fn rwlock_rdlock(&self, rwlock: LockAddr) -> c_int {
        if !self.validate(|engine, thread| engine.acquire_rwlock_read(thread, rwlock)) {
            return libc::EDEADLK;
        }
        let rc = self.provider.rwlock_rdlock(rwlock);
        self.forget_on_failure(rwlock, rc)
    }

    pub fn rwlock_wrlock(&self, rwlock: LockAddr) -> c_int {
        if !self.validate(|engine, thread| engine.acquire_rwlock_write(thread, rwlock)) {
            return libc::EDEADLK;
        }
        let rc = self.provider.rwlock_wrlock(rwlock);
        self.forget_on_failure(rwlock, rc)
    }

    pub fn rwlock_tryrdlock(&self, rwlock: LockAddr) -> c_int {
        let rc = self.provider.rwlock_tryrdlock(rwlock);
        if rc != 0 {
            return rc;
        }
        if !self.validate(|engine, thread| engine.acquire_rwlock_read(thread, rwlock)) {
            self.rollback("rwlock", rwlock, self.provider.rwlock_unlock(rwlock));
            return libc::EBUSY;
        }
        0
    }

    pub fn rwlock_trywrlock(&self, rwlock: LockAddr) -> c_int {
        let rc = self.provider.rwlock_trywrlock(rwlock);
        if rc != 0 {
            return rc;
        }
        if !self.validate(|engine, thread| engine.acquire_rwlock_write(thread, rwlock)) {
            self.rollback("rwlock", rwlock, self.provider.rwlock_unlock(rwlock));
            return libc::EBUSY;
        }
        0
    }

    pub fn rwlock_unlock(&self, rwlock: LockAddr) -> c_int {
        let rc = self.provider.rwlock_unlock(rwlock);
        if rc == 0 {
            self.observe(|engine, thread| engine.release(thread, rwlock));
        }
        rc
    }

    pub fn sem_wait(&self, sem: LockAddr) -> c_int {
        if !self.validate(|engine, thread| engine.acquire_semaphore(thread, sem)) {
            return libc::EDEADLK;
        }
        let rc = self.provider.sem_wait(sem);
        self.forget_on_failure(sem, rc)
    }

    pub fn sem_trywait(&self, sem: LockAddr) -> c_int {
        let rc = self.provider.sem_trywait(sem);
        if rc != 0 {
            return rc;
        }
        if !self.validate(|engine, thread| engine.acquire_semaphore(thread, sem)) {
            self.rollback("semaphore", sem, self.provider.sem_post(sem));
            return libc::EAGAIN;
        }
        0
    }

    pub fn sem_post(&self, sem: LockAddr) -> c_int {
        let rc = self.provider.sem_post(sem);
        if rc == 0 {
            self.observe(|engine, thread| engine.release(thread, sem));
        }
        rc
    }

    /// Wait on `cond`; the real wait returns holding `mutex` again, which is
    /// recorded as a fresh acquisition
    pub fn cond_wait(&self, cond: LockAddr, mutex: LockAddr) -> c_int {
        let held = self.holds(mutex);
        if !self.validate(|engine, thread| engine.wait_condvar(thread, cond, mutex)) {
            return libc::EDEADLK;
        }
        let rc = self.provider.cond_wait(cond, mutex);
        self.after_wait(mutex, held, rc);
        rc
    }

    /// Like [`cond_wait`](Self::cond_wait); `ETIMEDOUT` also returns with the
    /// mutex held
    pub fn cond_timedwait(
        &self,
        cond: LockAddr,
        mutex: LockAddr,
        abstime: &libc::timespec,
    ) -> c_int {
        let held = self.holds(mutex);
        if !self.validate(|engine, thread| engine.wait_condvar(thread, cond, mutex)) {
            return libc::EDEADLK;
        }
        let rc = self.provider.cond_timedwait(cond, mutex, abstime);
        self.after_wait(mutex, held, rc);
        rc
    }

    pub fn cond_signal(&self, cond: LockAddr) -> c_int {
        let rc = self.provider.cond_signal(cond);
        if rc == 0 {
            self.observe(|engine, thread| engine.signal_condvar(thread, cond));
        }
        rc
    }

    pub fn cond_broadcast(&self, cond: LockAddr) -> c_int {
        let rc = self.provider.cond_broadcast(cond);
        if rc == 0 {
            self.observe(|engine, thread| engine.signal_condvar(thread, cond));
        }
        rc
    }

    fn holds(&self, mutex: LockAddr) -> bool {
        self.enabled && guarded(false, || self.engine.holds(get_current_thread_id(), mutex))
    }

    /// Only `0` and `ETIMEDOUT` return with the mutex re-taken; any other code
    /// means the real wait never released it.
    fn after_wait(&self, mutex: LockAddr, held: bool, rc: c_int) {
        if rc == 0 || rc == libc::ETIMEDOUT {
            // Already holding it for real; a denial here is only reported.
            self.validate(|engine, thread| engine.acquire_mutex(thread, mutex));
        } else if held {
            self.observe(|engine, thread| engine.cancel_wait(thread, mutex));
        }
    }

    fn rollback(&self, what: &str, addr: LockAddr, rc: c_int) {
        if rc != 0 {
            logger::diag(format_args!(
                "failed to roll back denied try-acquire of {what} {addr:#x}: error {rc}"
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Provider that records calls and lets every primitive succeed
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
        fail_blocking: bool,
    }

    impl Recorder {
        fn record(&self, name: &str, addr: LockAddr) -> c_int {
            self.calls.lock().push(format!("{name} {addr:#x}"));
            0
        }

        fn blocking(&self, name: &str, addr: LockAddr) -> c_int {
            self.record(name, addr);
            if self.fail_blocking { libc::EINVAL } else { 0 }
        }

        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.calls.lock())
        }
    }

    impl RealPrimitiveProvider for Recorder {
        fn mutex_lock(&self, m: LockAddr) -> c_int {
            self.blocking("mutex_lock", m)
        }
        fn mutex_trylock(&self, m: LockAddr) -> c_int {
            self.record("mutex_trylock", m)
        }
        fn mutex_unlock(&self, m: LockAddr) -> c_int {
            self.record("mutex_unlock", m)
        }
        fn rwlock_rdlock(&self, l: LockAddr) -> c_int {
            self.blocking("rwlock_rdlock", l)
        }
        fn rwlock_wrlock(&self, l: LockAddr) -> c_int {
            self.blocking("rwlock_wrlock", l)
        }
        fn rwlock_tryrdlock(&self, l: LockAddr) -> c_int {
            self.record("rwlock_tryrdlock", l)
        }
        fn rwlock_trywrlock(&self, l: LockAddr) -> c_int {
            self.record("rwlock_trywrlock", l)
        }
        fn rwlock_unlock(&self, l: LockAddr) -> c_int {
            self.record("rwlock_unlock", l)
        }
        fn sem_wait(&self, s: LockAddr) -> c_int {
            self.blocking("sem_wait", s)
        }
        fn sem_trywait(&self, s: LockAddr) -> c_int {
            self.record("sem_trywait", s)
        }
        fn sem_post(&self, s: LockAddr) -> c_int {
            self.record("sem_post", s)
        }
        fn cond_wait(&self, c: LockAddr, _m: LockAddr) -> c_int {
            self.blocking("cond_wait", c)
        }
        fn cond_timedwait(&self, c: LockAddr, _m: LockAddr, _t: &libc::timespec) -> c_int {
            self.record("cond_timedwait", c);
            libc::ETIMEDOUT
        }
        fn cond_signal(&self, c: LockAddr) -> c_int {
            self.record("cond_signal", c)
        }
        fn cond_broadcast(&self, c: LockAddr) -> c_int {
            self.record("cond_broadcast", c)
        }
    }

    const A: LockAddr = 0xa0;
    const B: LockAddr = 0xb0;

    fn prime_a_before_b(engine: &Engine) {
        assert!(engine.acquire_mutex(1, A));
        assert!(engine.acquire_mutex(1, B));
        engine.release(1, B);
        engine.release(1, A);
    }

    #[test]
    fn test_blocking_denial_never_reaches_provider() {
        let engine = Engine::new();
        prime_a_before_b(&engine);
        let ip = Interposer::with_enabled(&engine, Recorder::default(), true);

        assert_eq!(ip.mutex_lock(B), 0);
        assert_eq!(ip.mutex_lock(A), libc::EDEADLK);
        assert_eq!(ip.provider().take(), vec!["mutex_lock 0xb0"]);
        assert_eq!(ip.mutex_unlock(B), 0);
        assert!(engine.held_locks(get_current_thread_id()).is_empty());
    }

    #[test]
    fn test_denied_trylock_is_rolled_back() {
        let engine = Engine::new();
        prime_a_before_b(&engine);
        let ip = Interposer::with_enabled(&engine, Recorder::default(), true);

        assert_eq!(ip.rwlock_wrlock(B), 0);
        assert_eq!(ip.mutex_trylock(A), libc::EBUSY);
        assert_eq!(
            ip.provider().take(),
            vec!["rwlock_wrlock 0xb0", "mutex_trylock 0xa0", "mutex_unlock 0xa0"]
        );
        assert_eq!(engine.held_locks(get_current_thread_id()), vec![B]);
    }

    #[test]
    fn test_denied_sem_trywait_posts_back() {
        let engine = Engine::new();
        prime_a_before_b(&engine);
        let ip = Interposer::with_enabled(&engine, Recorder::default(), true);

        assert_eq!(ip.mutex_lock(B), 0);
        assert_eq!(ip.sem_trywait(A), libc::EAGAIN);
        assert_eq!(
            ip.provider().take(),
            vec!["mutex_lock 0xb0", "sem_trywait 0xa0", "sem_post 0xa0"]
        );
    }

    #[test]
    fn test_failed_real_lock_is_forgotten() {
        let engine = Engine::new();
        let recorder = Recorder {
            fail_blocking: true,
            ..Recorder::default()
        };
        let ip = Interposer::with_enabled(&engine, recorder, true);

        assert_eq!(ip.mutex_lock(A), libc::EINVAL);
        assert!(engine.held_locks(get_current_thread_id()).is_empty());
    }

    #[test]
    fn test_condvar_wait_reacquires_mutex() {
        let engine = Engine::new();
        let ip = Interposer::with_enabled(&engine, Recorder::default(), true);
        let cond = 0xc0;

        assert_eq!(ip.mutex_lock(A), 0);
        assert_eq!(ip.cond_wait(cond, A), 0);
        assert_eq!(engine.held_locks(get_current_thread_id()), vec![A]);

        let deadline = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        assert_eq!(ip.cond_timedwait(cond, A, &deadline), libc::ETIMEDOUT);
        assert_eq!(engine.held_locks(get_current_thread_id()), vec![A]);

        assert_eq!(ip.cond_broadcast(cond), 0);
        assert_eq!(engine.stats().condvar_waits, 2);
        assert_eq!(engine.stats().condvar_signals, 1);
    }

    #[test]
    fn test_failed_wait_keeps_mutex_held() {
        let engine = Engine::new();
        let recorder = Recorder {
            fail_blocking: true,
            ..Recorder::default()
        };
        let ip = Interposer::with_enabled(&engine, recorder, true);
        let me = get_current_thread_id();
        let cond = 0xc0;

        assert_eq!(ip.mutex_trylock(A), 0);
        assert_eq!(ip.mutex_trylock(B), 0);
        assert_eq!(ip.cond_wait(cond, A), libc::EINVAL);

        // A was never released, so no B -> A ordering may appear
        assert_eq!(engine.held_count(me), 2);
        assert!(engine.holds(me, A));
        assert!(!engine.has_edge(B, A));
        assert!(engine.has_edge(B, cond));
        assert_eq!(engine.stats().acquisitions, 2);
        assert_eq!(engine.stats().denials, 0);

        // A mutex the engine never saw held is not invented
        assert_eq!(ip.cond_wait(cond, 0xd0), libc::EINVAL);
        assert!(!engine.holds(me, 0xd0));
        assert_eq!(engine.held_count(me), 2);

        assert_eq!(ip.mutex_unlock(B), 0);
        assert_eq!(ip.mutex_unlock(A), 0);
        assert_eq!(engine.held_count(me), 0);
        assert_eq!(engine.stats().unmatched_releases, 0);
    }

    #[test]
    fn test_disabled_interposer_only_forwards() {
        let engine = Engine::new();
        let ip = Interposer::with_enabled(&engine, Recorder::default(), false);

        assert_eq!(ip.mutex_lock(A), 0);
        assert_eq!(ip.sem_post(B), 0);
        assert_eq!(engine.lock_count(), 0);
        assert_eq!(ip.provider().take().len(), 2);
    }

    #[test]
    fn test_reentrant_calls_are_not_instrumented() {
        let engine = Engine::new();
        let ip = Interposer::with_enabled(&engine, Recorder::default(), true);

        let _guard = crate::core::guard::ReentrancyGuard::enter().unwrap();
        assert_eq!(ip.mutex_lock(A), 0);
        assert_eq!(engine.lock_count(), 0);
    }
}
