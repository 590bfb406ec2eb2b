//! Stages: single-tenant handles over shared-memory result buffers.
//!
//! A [`Stage`] wraps one [`SharedBuffer`] sized for one result. Acquisition
//! is a try-lock: a stage fielding one request cannot field another until
//! the first result is consumed. A [`StagePool`] is a fixed bag of stages
//! plus a condition variable; `acquire` blocks until one is free or the
//! pool's timeout expires.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use shmring::SharedBuffer;

use crate::error::{Error, Result};

pub(crate) struct StageInner {
    buf: SharedBuffer,
    held: AtomicBool,
    /// Set when the stage belongs to a pool; releasing the hold returns the
    /// stage there.
    pool: Mutex<Option<Weak<PoolInner>>>,
}

impl StageInner {
    fn new(size_nbytes: usize) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            buf: SharedBuffer::create(size_nbytes)?,
            held: AtomicBool::new(false),
            pool: Mutex::new(None),
        }))
    }

    fn try_hold(this: &Arc<Self>) -> Result<StageHold> {
        if this.buf.is_closed() {
            return Err(Error::StageClosed);
        }
        if this
            .held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::StageBusy);
        }
        Ok(StageHold {
            inner: Arc::clone(this),
        })
    }
}

/// A single-tenant handle over one shared result buffer.
pub struct Stage {
    inner: Arc<StageInner>,
}

impl Stage {
    /// Create a stage able to host any result of up to `size_nbytes` bytes.
    pub fn new(size_nbytes: usize) -> Result<Self> {
        Ok(Self {
            inner: StageInner::new(size_nbytes)?,
        })
    }

    /// Payload capacity in bytes.
    pub fn size_nbytes(&self) -> usize {
        self.inner.buf.size_nbytes()
    }

    /// Release the underlying shared memory. Outstanding requests against
    /// this stage will fail when they touch the buffer.
    pub fn close(&self) {
        self.inner.buf.close();
    }
}

/// An exclusive hold on a stage for the lifetime of one request. Dropping
/// the hold releases the stage (back to its pool, when pooled).
pub struct StageHold {
    inner: Arc<StageInner>,
}

impl StageHold {
    pub(crate) fn buffer(&self) -> &SharedBuffer {
        &self.inner.buf
    }
}

impl Drop for StageHold {
    fn drop(&mut self) {
        self.inner.held.store(false, Ordering::Release);
        let pool = self.inner.pool.lock().unwrap().clone();
        if let Some(pool) = pool.and_then(|weak| weak.upgrade()) {
            pool.give_back(Arc::clone(&self.inner));
        }
    }
}

pub(crate) struct PoolInner {
    free: Mutex<VecDeque<Arc<StageInner>>>,
    cvar: Condvar,
    timeout: Option<Duration>,
}

impl PoolInner {
    fn give_back(&self, stage: Arc<StageInner>) {
        self.free.lock().unwrap().push_back(stage);
        self.cvar.notify_one();
    }
}

/// A fixed-size bag of stages.
pub struct StagePool {
    inner: Arc<PoolInner>,
    /// Every stage, free or not, for closing.
    stages: Vec<Arc<StageInner>>,
}

impl StagePool {
    /// Allocate `count` stages of `size_nbytes` each. With a timeout,
    /// acquisition gives up with [`Error::Empty`] once it expires; without
    /// one it blocks indefinitely.
    pub fn new(size_nbytes: usize, count: usize, timeout: Option<Duration>) -> Result<Self> {
        let inner = Arc::new(PoolInner {
            free: Mutex::new(VecDeque::with_capacity(count)),
            cvar: Condvar::new(),
            timeout,
        });
        let mut stages = Vec::with_capacity(count);
        for _ in 0..count {
            let stage = StageInner::new(size_nbytes)?;
            *stage.pool.lock().unwrap() = Some(Arc::downgrade(&inner));
            inner.free.lock().unwrap().push_back(Arc::clone(&stage));
            stages.push(stage);
        }
        Ok(Self { inner, stages })
    }

    /// Number of stages in the pool.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Close every stage's shared memory.
    pub fn close(&self) {
        for stage in &self.stages {
            stage.buf.close();
        }
    }

    fn acquire(&self) -> Result<StageHold> {
        let deadline = self.inner.timeout.map(|t| Instant::now() + t);
        let mut free = self.inner.free.lock().unwrap();
        loop {
            if let Some(stage) = free.pop_front() {
                drop(free);
                match StageInner::try_hold(&stage) {
                    Ok(hold) => return Ok(hold),
                    // A closed stage drops out of circulation; keep looking.
                    Err(Error::StageClosed) => {
                        free = self.inner.free.lock().unwrap();
                        continue;
                    }
                    Err(e) => {
                        self.inner.give_back(stage);
                        return Err(e);
                    }
                }
            }
            match deadline {
                None => free = self.inner.cvar.wait(free).unwrap(),
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Err(Error::Empty);
                    }
                    let (guard, _) = self.inner.cvar.wait_timeout(free, d - now).unwrap();
                    free = guard;
                }
            }
        }
    }
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::Stage {}
    impl Sealed for super::StagePool {}
}

/// Anything a request can stage its result in: a single [`Stage`] (fails
/// fast when busy) or a [`StagePool`] (blocks until one frees up).
pub trait StageSource: sealed::Sealed {
    #[doc(hidden)]
    fn acquire_hold(&self) -> Result<StageHold>;
}

impl StageSource for Stage {
    fn acquire_hold(&self) -> Result<StageHold> {
        StageInner::try_hold(&self.inner)
    }
}

impl StageSource for StagePool {
    fn acquire_hold(&self) -> Result<StageHold> {
        self.acquire()
    }
}
