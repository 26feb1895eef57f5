use lockdep::interpose::{Interposer, RealPrimitiveProvider};
use lockdep::{CycleInfo, Engine, LockAddr};
use parking_lot::lock_api::{RawMutex as _, RawRwLock as _};
use parking_lot::{Condvar, Mutex, RawMutex, RawRwLock};
use std::os::raw::c_int;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[allow(dead_code)]
pub const DEADLOCK_TIMEOUT: Duration = Duration::from_secs(3);
#[allow(dead_code)]
pub const NO_DEADLOCK_TIMEOUT: Duration = Duration::from_millis(500);

/// A real mutex whose address is its lock identity
pub struct TestMutex {
    raw: RawMutex,
}

/// A real reader-writer lock; remembers whether it is write-locked so a single
/// unlock entry point can release either mode
pub struct TestRwLock {
    raw: RawRwLock,
    writer: AtomicBool,
}

/// A counting semaphore
pub struct TestSemaphore {
    permits: Mutex<usize>,
    available: Condvar,
}

/// A condition variable usable with [`TestMutex`]
pub struct TestCondvar {
    generation: Mutex<u64>,
    changed: Condvar,
}

pub trait Addressed {
    fn addr(&self) -> LockAddr
    where
        Self: Sized,
    {
        self as *const Self as *const () as LockAddr
    }
}

impl Addressed for TestMutex {}
impl Addressed for TestRwLock {}
impl Addressed for TestSemaphore {}
impl Addressed for TestCondvar {}

impl TestMutex {
    pub fn new() -> Self {
        TestMutex { raw: RawMutex::INIT }
    }
}

impl TestRwLock {
    pub fn new() -> Self {
        TestRwLock {
            raw: RawRwLock::INIT,
            writer: AtomicBool::new(false),
        }
    }
}

impl TestSemaphore {
    pub fn new(permits: usize) -> Self {
        TestSemaphore {
            permits: Mutex::new(permits),
            available: Condvar::new(),
        }
    }

    #[allow(dead_code)]
    pub fn permits(&self) -> usize {
        *self.permits.lock()
    }
}

impl TestCondvar {
    pub fn new() -> Self {
        TestCondvar {
            generation: Mutex::new(0),
            changed: Condvar::new(),
        }
    }
}

/// Resolve a lock identity back to the test object living at that address
///
/// # Safety
/// `addr` must come from [`Addressed::addr`] of a live `T`.
unsafe fn object<'a, T>(addr: LockAddr) -> &'a T {
    unsafe { &*(addr as *const T) }
}

/// Real primitives for the interposer, backed by `parking_lot`
#[derive(Clone, Copy, Default)]
pub struct ParkingLotProvider;

impl ParkingLotProvider {
    /// Release `mutex`, wait for the generation to move past `seen` or for
    /// the deadline, then take `mutex` again
    fn wait_on(cond: &TestCondvar, mutex: &TestMutex, deadline: Option<SystemTime>) -> c_int {
        let mut generation = cond.generation.lock();
        let seen = *generation;
        unsafe { mutex.raw.unlock() };

        let mut rc = 0;
        while *generation == seen {
            match deadline {
                None => cond.changed.wait(&mut generation),
                Some(deadline) => {
                    let left = deadline
                        .duration_since(SystemTime::now())
                        .unwrap_or(Duration::ZERO);
                    if left.is_zero() || cond.changed.wait_for(&mut generation, left).timed_out() {
                        rc = libc::ETIMEDOUT;
                        break;
                    }
                }
            }
        }
        drop(generation);
        mutex.raw.lock();
        rc
    }
}

impl RealPrimitiveProvider for ParkingLotProvider {
    fn mutex_lock(&self, mutex: LockAddr) -> c_int {
        unsafe { object::<TestMutex>(mutex) }.raw.lock();
        0
    }

    fn mutex_trylock(&self, mutex: LockAddr) -> c_int {
        if unsafe { object::<TestMutex>(mutex) }.raw.try_lock() {
            0
        } else {
            libc::EBUSY
        }
    }

    fn mutex_unlock(&self, mutex: LockAddr) -> c_int {
        unsafe { object::<TestMutex>(mutex).raw.unlock() };
        0
    }

    fn rwlock_rdlock(&self, rwlock: LockAddr) -> c_int {
        unsafe { object::<TestRwLock>(rwlock) }.raw.lock_shared();
        0
    }

    fn rwlock_wrlock(&self, rwlock: LockAddr) -> c_int {
        let lock = unsafe { object::<TestRwLock>(rwlock) };
        lock.raw.lock_exclusive();
        lock.writer.store(true, Ordering::SeqCst);
        0
    }

    fn rwlock_tryrdlock(&self, rwlock: LockAddr) -> c_int {
        if unsafe { object::<TestRwLock>(rwlock) }.raw.try_lock_shared() {
            0
        } else {
            libc::EBUSY
        }
    }

    fn rwlock_trywrlock(&self, rwlock: LockAddr) -> c_int {
        let lock = unsafe { object::<TestRwLock>(rwlock) };
        if lock.raw.try_lock_exclusive() {
            lock.writer.store(true, Ordering::SeqCst);
            0
        } else {
            libc::EBUSY
        }
    }

    fn rwlock_unlock(&self, rwlock: LockAddr) -> c_int {
        let lock = unsafe { object::<TestRwLock>(rwlock) };
        if lock.writer.swap(false, Ordering::SeqCst) {
            unsafe { lock.raw.unlock_exclusive() };
        } else {
            unsafe { lock.raw.unlock_shared() };
        }
        0
    }

    fn sem_wait(&self, sem: LockAddr) -> c_int {
        let sem = unsafe { object::<TestSemaphore>(sem) };
        let mut permits = sem.permits.lock();
        while *permits == 0 {
            sem.available.wait(&mut permits);
        }
        *permits -= 1;
        0
    }

    fn sem_trywait(&self, sem: LockAddr) -> c_int {
        let sem = unsafe { object::<TestSemaphore>(sem) };
        let mut permits = sem.permits.lock();
        if *permits == 0 {
            return libc::EAGAIN;
        }
        *permits -= 1;
        0
    }

    fn sem_post(&self, sem: LockAddr) -> c_int {
        let sem = unsafe { object::<TestSemaphore>(sem) };
        *sem.permits.lock() += 1;
        sem.available.notify_one();
        0
    }

    fn cond_wait(&self, cond: LockAddr, mutex: LockAddr) -> c_int {
        let (cond, mutex) = unsafe { (object::<TestCondvar>(cond), object::<TestMutex>(mutex)) };
        Self::wait_on(cond, mutex, None)
    }

    fn cond_timedwait(&self, cond: LockAddr, mutex: LockAddr, abstime: &libc::timespec) -> c_int {
        let (cond, mutex) = unsafe { (object::<TestCondvar>(cond), object::<TestMutex>(mutex)) };
        let deadline = UNIX_EPOCH + Duration::new(abstime.tv_sec as u64, abstime.tv_nsec as u32);
        Self::wait_on(cond, mutex, Some(deadline))
    }

    fn cond_signal(&self, cond: LockAddr) -> c_int {
        let cond = unsafe { object::<TestCondvar>(cond) };
        *cond.generation.lock() += 1;
        cond.changed.notify_one();
        0
    }

    fn cond_broadcast(&self, cond: LockAddr) -> c_int {
        let cond = unsafe { object::<TestCondvar>(cond) };
        *cond.generation.lock() += 1;
        cond.changed.notify_all();
        0
    }
}

pub struct EngineHarness {
    pub engine: &'static Engine,
    pub rx: mpsc::Receiver<CycleInfo>,
}

impl EngineHarness {
    /// An instrumented front to the real primitives; cheap to create per thread
    pub fn interposer(&self) -> Interposer<'static, ParkingLotProvider> {
        Interposer::with_enabled(self.engine, ParkingLotProvider, true)
    }
}

/// A private engine (leaked so spawned threads can borrow it) reporting every
/// denial on `rx`
pub fn start_engine() -> EngineHarness {
    let (tx, rx) = mpsc::channel::<CycleInfo>();
    let tx = Mutex::new(tx);
    let engine: &'static Engine = Box::leak(Box::new(Engine::new()));
    engine.set_callback(move |info| {
        let _ = tx.lock().send(info);
    });
    EngineHarness { engine, rx }
}

#[allow(dead_code)]
pub fn expect_deadlock(h: &EngineHarness, timeout: Duration) -> CycleInfo {
    match h.rx.recv_timeout(timeout) {
        Ok(info) => info,
        Err(_) => panic!("No deadlock detected within {timeout:?}"),
    }
}

#[allow(dead_code)]
pub fn assert_no_deadlock(h: &EngineHarness, timeout: Duration) {
    assert!(
        h.rx.recv_timeout(timeout).is_err(),
        "Unexpected deadlock detected"
    );
}
