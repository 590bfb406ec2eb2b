//! Process-shared synchronisation primitives.
//!
//! The queue header lives in one shared mapping, so its lock and condition
//! variables must be pthread objects initialised with
//! `PTHREAD_PROCESS_SHARED`. These wrappers are deliberately minimal: they
//! are always placed inside a mapping by this crate, never on the Rust heap,
//! and the mapping outlives every guard.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::platform::Mapping;
use crate::ShmError;

/// A `PTHREAD_PROCESS_SHARED` mutex embedded in shared memory.
#[repr(C)]
pub(crate) struct RawMutex {
    inner: UnsafeCell<libc::pthread_mutex_t>,
}

// Safety: pthread mutexes are exactly the cross-thread/cross-process
// synchronisation object; all state is behind the UnsafeCell.
unsafe impl Send for RawMutex {}
unsafe impl Sync for RawMutex {}

impl RawMutex {
    /// Initialise the mutex in place.
    ///
    /// # Safety
    /// `this` must point into a live shared mapping, and no other process may
    /// touch the object before initialisation completes.
    pub(crate) unsafe fn init_at(this: *mut Self) -> Result<(), ShmError> {
        let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
        let rc = libc::pthread_mutexattr_init(&mut attr);
        if rc != 0 {
            return Err(ShmError::pthread("pthread_mutexattr_init", rc));
        }
        let rc = libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
        if rc != 0 {
            libc::pthread_mutexattr_destroy(&mut attr);
            return Err(ShmError::pthread("pthread_mutexattr_setpshared", rc));
        }
        let rc = libc::pthread_mutex_init((*this).inner.get(), &attr);
        libc::pthread_mutexattr_destroy(&mut attr);
        if rc != 0 {
            return Err(ShmError::pthread("pthread_mutex_init", rc));
        }
        Ok(())
    }

    /// Lock, returning a guard that unlocks on drop.
    pub(crate) fn lock(&self) -> MutexGuard<'_> {
        // SAFETY: the mutex was initialised by init_at and lives as long as
        // the mapping backing &self.
        let rc = unsafe { libc::pthread_mutex_lock(self.inner.get()) };
        assert_eq!(rc, 0, "pthread_mutex_lock failed: {rc}");
        MutexGuard { mutex: self }
    }
}

/// RAII guard over a locked [`RawMutex`].
pub(crate) struct MutexGuard<'a> {
    mutex: &'a RawMutex,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: the guard proves this thread holds the lock.
        let rc = unsafe { libc::pthread_mutex_unlock(self.mutex.inner.get()) };
        debug_assert_eq!(rc, 0, "pthread_mutex_unlock failed: {rc}");
    }
}

/// A `PTHREAD_PROCESS_SHARED` condition variable embedded in shared memory.
#[repr(C)]
pub(crate) struct RawCondvar {
    inner: UnsafeCell<libc::pthread_cond_t>,
}

unsafe impl Send for RawCondvar {}
unsafe impl Sync for RawCondvar {}

impl RawCondvar {
    /// Initialise the condvar in place. Same contract as [`RawMutex::init_at`].
    ///
    /// # Safety
    /// See [`RawMutex::init_at`].
    pub(crate) unsafe fn init_at(this: *mut Self) -> Result<(), ShmError> {
        let mut attr: libc::pthread_condattr_t = std::mem::zeroed();
        let rc = libc::pthread_condattr_init(&mut attr);
        if rc != 0 {
            return Err(ShmError::pthread("pthread_condattr_init", rc));
        }
        let rc = libc::pthread_condattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
        if rc != 0 {
            libc::pthread_condattr_destroy(&mut attr);
            return Err(ShmError::pthread("pthread_condattr_setpshared", rc));
        }
        let rc = libc::pthread_cond_init((*this).inner.get(), &attr);
        libc::pthread_condattr_destroy(&mut attr);
        if rc != 0 {
            return Err(ShmError::pthread("pthread_cond_init", rc));
        }
        Ok(())
    }

    /// Block on the condvar, releasing `guard`'s mutex while waiting.
    ///
    /// There is deliberately no timed variant: timed waits are built from the
    /// heartbeat broadcast plus a deadline check in the caller's loop, so the
    /// wake path never depends on a platform timed wait.
    pub(crate) fn wait(&self, guard: &mut MutexGuard<'_>) {
        // SAFETY: guard proves the associated mutex is held by this thread.
        let rc = unsafe { libc::pthread_cond_wait(self.inner.get(), guard.mutex.inner.get()) };
        assert_eq!(rc, 0, "pthread_cond_wait failed: {rc}");
    }

    pub(crate) fn notify_one(&self) {
        // SAFETY: signalling an initialised condvar.
        let rc = unsafe { libc::pthread_cond_signal(self.inner.get()) };
        debug_assert_eq!(rc, 0, "pthread_cond_signal failed: {rc}");
    }

    pub(crate) fn notify_all(&self) {
        // SAFETY: broadcasting an initialised condvar.
        let rc = unsafe { libc::pthread_cond_broadcast(self.inner.get()) };
        debug_assert_eq!(rc, 0, "pthread_cond_broadcast failed: {rc}");
    }
}

/// A set-once flag shared with forked children.
///
/// Backed by a single anonymous shared page, so clones in the parent and the
/// inherited copies in worker processes all observe the same byte.
#[derive(Clone)]
pub struct SharedEvent {
    map: Arc<Mapping>,
}

impl SharedEvent {
    pub fn new() -> Result<Self, ShmError> {
        let map = Mapping::anonymous(std::mem::size_of::<AtomicU8>().max(1))?;
        let event = Self { map: Arc::new(map) };
        event.flag().store(0, Ordering::Release);
        Ok(event)
    }

    fn flag(&self) -> &AtomicU8 {
        // SAFETY: the mapping is at least one byte and lives as long as self;
        // AtomicU8 has no alignment requirement beyond 1.
        unsafe { &*self.map.as_ptr().cast::<AtomicU8>() }
    }

    /// Latch the event. Idempotent.
    pub fn set(&self) {
        self.flag().store(1, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.flag().load(Ordering::Acquire) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_is_latched_across_clones() {
        let ev = SharedEvent::new().unwrap();
        let ev2 = ev.clone();
        assert!(!ev2.is_set());
        ev.set();
        assert!(ev2.is_set());
    }

    #[test]
    fn mutex_and_condvar_round_trip() {
        use std::sync::atomic::{AtomicBool, Ordering};

        #[repr(C)]
        struct Pad {
            mutex: RawMutex,
            cond: RawCondvar,
        }

        let map = Mapping::anonymous(std::mem::size_of::<Pad>()).unwrap();
        let pad = map.as_ptr().cast::<Pad>();
        unsafe {
            RawMutex::init_at(std::ptr::addr_of_mut!((*pad).mutex)).unwrap();
            RawCondvar::init_at(std::ptr::addr_of_mut!((*pad).cond)).unwrap();
        }
        let pad: &Pad = unsafe { &*pad };

        static WOKE: AtomicBool = AtomicBool::new(false);
        std::thread::scope(|s| {
            s.spawn(|| {
                let mut guard = pad.mutex.lock();
                while !WOKE.load(Ordering::Acquire) {
                    pad.cond.wait(&mut guard);
                }
            });
            std::thread::sleep(std::time::Duration::from_millis(20));
            let _guard = pad.mutex.lock();
            WOKE.store(true, Ordering::Release);
            pad.cond.notify_all();
        });
    }
}
