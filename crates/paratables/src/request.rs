//! Caller-side request handles.
//!
//! A [`Request`] is the future-like object returned by `Reader::request`.
//! The dispatch thread wakes it with result metadata (or a failure); the
//! caller then consumes the result through exactly one accessor. Consuming
//! releases the stage hold — for pooled stages, that is what hands the
//! stage to the next request — so the result must be copied out or finished
//! with before the accessor's scope ends.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use crate::array::{ArrayView, Element, OwnedArray};
use crate::dtype::DType;
use crate::error::{Error, RemoteKind, Result, SubprocessError};
use crate::stage::StageHold;

/// A failure as it travels to a pending request.
#[derive(Debug, Clone)]
pub(crate) struct FailureNote {
    pub kind: RemoteKind,
    pub message: String,
    pub trace: String,
}

impl FailureNote {
    pub(crate) fn queue_closed() -> Self {
        Self {
            kind: RemoteKind::QueueClosed,
            message: "this reader has been closed".into(),
            trace: String::new(),
        }
    }

    pub(crate) fn into_error(self) -> Error {
        if self.kind == RemoteKind::QueueClosed {
            Error::QueueClosed
        } else {
            Error::Worker(SubprocessError {
                kind: self.kind,
                message: self.message,
                trace: self.trace,
            })
        }
    }
}

#[derive(Debug, Clone)]
enum Outcome {
    Ready { dtype: DType, shape: Vec<usize> },
    Failed(FailureNote),
}

struct RequestInner {
    req_id: u64,
    outcome: Mutex<Option<Outcome>>,
    ready: Condvar,
    hold: Mutex<Option<StageHold>>,
}

/// A future-like handle for one queued read operation.
#[derive(Clone)]
pub struct Request {
    inner: Arc<RequestInner>,
}

impl Request {
    pub(crate) fn new(req_id: u64, hold: StageHold) -> Self {
        Self {
            inner: Arc::new(RequestInner {
                req_id,
                outcome: Mutex::new(None),
                ready: Condvar::new(),
                hold: Mutex::new(Some(hold)),
            }),
        }
    }

    /// The reader-assigned request id.
    pub fn req_id(&self) -> u64 {
        self.inner.req_id
    }

    /// Has the result (or a failure) arrived?
    pub fn is_ready(&self) -> bool {
        self.inner.outcome.lock().unwrap().is_some()
    }

    pub(crate) fn fulfill(&self, dtype: DType, shape: Vec<usize>) {
        self.settle(Outcome::Ready { dtype, shape });
    }

    pub(crate) fn fail(&self, note: FailureNote) {
        self.settle(Outcome::Failed(note));
    }

    fn settle(&self, outcome: Outcome) {
        let mut slot = self.inner.outcome.lock().unwrap();
        // Notifications for a request happen exactly once; a second one is a
        // dispatch bug.
        debug_assert!(slot.is_none(), "request {} notified twice", self.inner.req_id);
        if slot.is_none() {
            *slot = Some(outcome);
            self.inner.ready.notify_all();
        }
    }

    fn wait(&self) -> Outcome {
        let mut slot = self.inner.outcome.lock().unwrap();
        while slot.is_none() {
            slot = self.inner.ready.wait(slot).unwrap();
        }
        slot.clone().unwrap()
    }

    /// Wait for readiness and take the stage hold. A failure releases the
    /// stage before it surfaces; a second access reports the result as
    /// consumed.
    fn take_ready(&self) -> Result<(DType, Vec<usize>, StageHold)> {
        let outcome = self.wait();
        let hold = self.inner.hold.lock().unwrap().take();
        match outcome {
            Outcome::Failed(note) => {
                drop(hold);
                Err(note.into_error())
            }
            Outcome::Ready { dtype, shape } => {
                let hold = hold.ok_or(Error::ResultConsumed)?;
                Ok((dtype, shape, hold))
            }
        }
    }

    /// Wait and return an owned copy of the result.
    pub fn copy(&self) -> Result<OwnedArray> {
        self.with_direct(|view| view.to_owned_array())
    }

    /// Wait and run `f` over a scoped view of the result. The view (and the
    /// shared memory behind it) is only valid during the call.
    pub fn with_direct<R>(&self, f: impl FnOnce(ArrayView<'_>) -> R) -> Result<R> {
        let (dtype, shape, hold) = self.take_ready()?;
        let nbytes = dtype.nbytes(&shape);
        let guard = hold.buffer().get_direct()?;
        let bytes = guard.as_slice();
        if bytes.len() < nbytes {
            return Err(Error::SharedMemory {
                needed: nbytes,
                capacity: bytes.len(),
            });
        }
        let out = f(ArrayView::new(&dtype, &shape, &bytes[..nbytes]));
        drop(guard);
        drop(hold);
        Ok(out)
    }

    /// Wait and return a guard over the raw result view.
    ///
    /// The guard pins the stage for its whole lifetime: nothing else can use
    /// the stage, and the pool (if any) gets it back only when the guard
    /// drops. Prefer [`copy`](Self::copy) or [`with_direct`](Self::with_direct)
    /// unless the copy genuinely matters.
    pub fn scoped_unsafe(&self) -> Result<ResultGuard> {
        let (dtype, shape, hold) = self.take_ready()?;
        let nbytes = dtype.nbytes(&shape);
        let guard = hold.buffer().get_direct_owned()?;
        if guard.len() < nbytes {
            return Err(Error::SharedMemory {
                needed: nbytes,
                capacity: guard.len(),
            });
        }
        Ok(ResultGuard {
            dtype,
            shape,
            nbytes,
            guard,
            _hold: hold,
        })
    }

    /// As [`scoped_unsafe`](Self::scoped_unsafe), wrapped in a releasable
    /// proxy: after `release()` (or drop) every accessor reports
    /// [`Error::Released`].
    pub fn scoped_proxy(&self) -> Result<ResultProxy> {
        Ok(ResultProxy {
            slot: Mutex::new(Some(self.scoped_unsafe()?)),
        })
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("req_id", &self.inner.req_id)
            .field("ready", &self.is_ready())
            .finish()
    }
}

/// A scoped view over a completed result, pinning its stage.
pub struct ResultGuard {
    dtype: DType,
    shape: Vec<usize>,
    nbytes: usize,
    guard: shmring::OwnedPayloadGuard,
    _hold: StageHold,
}

impl ResultGuard {
    pub fn dtype(&self) -> &DType {
        &self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.guard.as_slice()[..self.nbytes]
    }

    pub fn view(&self) -> ArrayView<'_> {
        ArrayView::new(&self.dtype, &self.shape, self.as_bytes())
    }

    pub fn to_owned_array(&self) -> OwnedArray {
        self.view().to_owned_array()
    }

    pub fn scalar_at<T: Element>(&self, flat: usize) -> Result<T> {
        self.view().scalar_at(flat)
    }
}

/// A releasable wrapper over a [`ResultGuard`].
pub struct ResultProxy {
    slot: Mutex<Option<ResultGuard>>,
}

impl ResultProxy {
    fn with_guard<R>(&self, f: impl FnOnce(&ResultGuard) -> R) -> Result<R> {
        let slot = self.slot.lock().unwrap();
        match slot.as_ref() {
            Some(guard) => Ok(f(guard)),
            None => Err(Error::Released),
        }
    }

    /// Drop the underlying view and stage hold. Further access errors.
    pub fn release(&self) {
        self.slot.lock().unwrap().take();
    }

    pub fn is_released(&self) -> bool {
        self.slot.lock().unwrap().is_none()
    }

    pub fn dtype(&self) -> Result<DType> {
        self.with_guard(|g| g.dtype().clone())
    }

    pub fn shape(&self) -> Result<Vec<usize>> {
        self.with_guard(|g| g.shape().to_vec())
    }

    pub fn copy(&self) -> Result<OwnedArray> {
        self.with_guard(ResultGuard::to_owned_array)
    }

    pub fn with_view<R>(&self, f: impl FnOnce(ArrayView<'_>) -> R) -> Result<R> {
        self.with_guard(|g| f(g.view()))
    }

    pub fn scalar_at<T: Element>(&self, flat: usize) -> Result<T> {
        self.with_guard(|g| g.scalar_at(flat))?
    }
}

/// A FIFO of completed (or, in ordered mode, submitted) requests plus the
/// closed sentinel.
pub(crate) enum PoolItem {
    Request(Request),
    Closed,
}

pub(crate) struct RequestPool {
    queue: Mutex<VecDeque<PoolItem>>,
    cvar: Condvar,
}

impl RequestPool {
    pub(crate) fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            cvar: Condvar::new(),
        }
    }

    pub(crate) fn add(&self, item: PoolItem) {
        self.queue.lock().unwrap().push_back(item);
        self.cvar.notify_one();
    }

    /// Blocks until an item is available.
    pub(crate) fn next(&self) -> PoolItem {
        let mut queue = self.queue.lock().unwrap();
        loop {
            if let Some(item) = queue.pop_front() {
                return item;
            }
            queue = self.cvar.wait(queue).unwrap();
        }
    }
}
