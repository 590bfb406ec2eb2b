//! The reader front end.
//!
//! A [`Reader`] owns the request and notification queues, a pool of forked
//! worker processes, the pending-request table, and the dispatch thread that
//! wakes requests as notifications arrive. A monitor thread joins the
//! workers and pushes the closed sentinel once they have all exited, which
//! is what lets the dispatch thread drain and stop.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, error, warn};
use shmring::{SharedEvent, SharedQueue};

use crate::adapter::{DataNode, FileAdapter};
use crate::dataset::Dataset;
use crate::error::{Error, Result};
use crate::ops::Op;
use crate::request::{FailureNote, Request};
use crate::stage::StageSource;
use crate::wire::{self, Notification, RequestDetails, RequestMsg};
use crate::worker::{self, WorkerContext, KEY_TAIL_BYTES};

/// Conservative allowance for descriptor framing when deciding whether a
/// key still fits a request-queue slot alongside its descriptor.
const DESCRIPTOR_SLACK: usize = 50;

/// Queue geometry and worker-pool settings.
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// Number of worker processes.
    pub n_procs: usize,
    /// Blocks per shared queue.
    pub queue_slots: usize,
    /// Payload bytes per queue block.
    pub queue_elem: usize,
    /// Consumer-side heartbeat period.
    pub heartbeat: Duration,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            n_procs: 4,
            queue_slots: 50,
            queue_elem: 1024,
            heartbeat: Duration::from_millis(100),
        }
    }
}

impl ReaderConfig {
    pub fn with_n_procs(mut self, n_procs: usize) -> Self {
        self.n_procs = n_procs;
        self
    }

    pub fn with_queue_slots(mut self, slots: usize) -> Self {
        self.queue_slots = slots;
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }
}

/// Events delivered to the completion callback from the dispatch thread.
pub enum ReaderEvent {
    /// A request completed; its result is ready to consume.
    Completed(Request),
    /// The reader is shutting down; no further events will arrive.
    Closed,
}

/// Completion callback type.
pub type NotifyFn = dyn Fn(ReaderEvent) + Send + Sync;

struct ReaderCore<A: FileAdapter> {
    path: PathBuf,
    opts: A::Options,
    requests: SharedQueue,
    notifications: SharedQueue,
    next_req_id: AtomicU64,
    closed: AtomicBool,
    stop: SharedEvent,
    pending: Mutex<HashMap<u64, Request>>,
    notify_cb: Option<Box<NotifyFn>>,
    pids: Vec<libc::pid_t>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl<A: FileAdapter> ReaderCore<A> {
    /// Mark closed and push the sentinel, once. The put is bounded so a
    /// wedged queue (every worker gone, queue full) cannot hang teardown.
    fn close_queues(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let closed = wire::encode_request(&RequestMsg::QueueClosed);
            if let Err(e) = self.requests.put(&closed, true, Some(Duration::from_secs(5))) {
                warn!("could not enqueue the closed sentinel: {e}");
            }
        }
    }

    fn drain_pending(&self) -> Vec<Request> {
        self.pending
            .lock()
            .unwrap()
            .drain()
            .map(|(_, req)| req)
            .collect()
    }
}

/// Provides parallel random access to datasets in one container file.
pub struct Reader<A: FileAdapter> {
    core: Arc<ReaderCore<A>>,
}

impl<A: FileAdapter> Reader<A> {
    /// Open a reader over `path` with default settings.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_config(path, ReaderConfig::default(), None, A::Options::default())
    }

    /// Open a reader with explicit configuration, an optional completion
    /// callback, and adapter open options.
    pub fn with_config(
        path: impl AsRef<Path>,
        config: ReaderConfig,
        notify_cb: Option<Box<NotifyFn>>,
        opts: A::Options,
    ) -> Result<Self> {
        let path = path.as_ref().to_owned();
        let requests =
            SharedQueue::with_heartbeat(config.queue_elem, config.queue_slots, config.heartbeat)?;
        let notifications =
            SharedQueue::with_heartbeat(config.queue_elem, config.queue_slots, config.heartbeat)?;
        let stop = SharedEvent::new()?;

        let ctx = WorkerContext::<A> {
            path: path.clone(),
            opts: opts.clone(),
            requests: requests.clone(),
            notifications: notifications.clone(),
            stop: stop.clone(),
        };

        let mut pids = Vec::with_capacity(config.n_procs);
        for _ in 0..config.n_procs {
            // SAFETY: the child only runs the worker loop over fork-inherited
            // queue handles and exits without unwinding into parent state.
            let pid = unsafe { libc::fork() };
            if pid < 0 {
                // Children forked so far must still wind down.
                stop.set();
                return Err(std::io::Error::last_os_error().into());
            }
            if pid == 0 {
                // A panicking worker must not unwind into the parent's state
                // the child inherited.
                let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    worker::run::<A>(&ctx);
                }));
                // SAFETY: child process exit; parent destructors must not run.
                unsafe { libc::_exit(0) };
            }
            debug!("started worker process {pid}");
            pids.push(pid);
        }

        // The monitor joins every worker, then tells the dispatch thread the
        // notification stream is over.
        let monitor = {
            let notifications = notifications.clone();
            let pids = pids.clone();
            std::thread::Builder::new()
                .name("paratables-monitor".into())
                .spawn(move || {
                    for pid in pids {
                        let mut status = 0;
                        // SAFETY: pid is a child of this process.
                        let rc = unsafe { libc::waitpid(pid, &mut status, 0) };
                        if rc != pid {
                            warn!("waitpid({pid}) returned {rc}");
                        }
                    }
                    let closed = wire::encode_notification(&Notification::QueueClosed);
                    if let Err(e) = notifications.put(&closed, true, None) {
                        warn!("monitor could not push the closed sentinel: {e}");
                    }
                })?
        };

        let core = Arc::new(ReaderCore {
            path,
            opts,
            requests,
            notifications,
            next_req_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            stop,
            pending: Mutex::new(HashMap::new()),
            notify_cb,
            pids,
            dispatch: Mutex::new(None),
            monitor: Mutex::new(Some(monitor)),
        });

        let dispatch = {
            let core = Arc::clone(&core);
            std::thread::Builder::new()
                .name("paratables-dispatch".into())
                .spawn(move || dispatch_loop(&core))?
        };
        *core.dispatch.lock().unwrap() = Some(dispatch);

        Ok(Self { core })
    }

    /// Probe a dataset and return a proxy for building ops against it.
    pub fn get_dataset(&self, path: &str) -> Result<Dataset> {
        let mut file = A::open(&self.core.path, &self.core.opts)?;
        let node = file.node(path)?;
        Ok(Dataset::new(
            path,
            node.dtype().clone(),
            node.shape().to_vec(),
            node.is_table(),
        ))
    }

    /// Queue a read operation. The result lands in a stage acquired from
    /// `stage` (a [`Stage`](crate::Stage) fails fast when busy; a
    /// [`StagePool`](crate::StagePool) blocks until one frees up).
    pub fn request(&self, op: impl Into<Op>, stage: &impl StageSource) -> Result<Request> {
        if self.core.closed.load(Ordering::Acquire) {
            return Err(Error::ReaderClosed);
        }
        let op = op.into();
        let hold = stage.acquire_hold()?;

        let key = wire::encode_op(&op);
        let stage_size = hold.buffer().size_nbytes();
        // Key placement rule: a key too large for a queue slot (plus
        // descriptor framing) but small enough for the stage travels in the
        // stage's trailing bytes instead of the side channel.
        let key_in_stage = self.core.requests.elem_size() < key.len() + DESCRIPTOR_SLACK
            && key.len() + KEY_TAIL_BYTES <= stage_size;

        let req_id = self.core.next_req_id.fetch_add(1, Ordering::SeqCst);
        let details = RequestDetails {
            req_id,
            map_id: hold.buffer().name().to_owned(),
            size_nbytes: stage_size as u64,
            key: if key_in_stage { None } else { Some(key.clone()) },
        };

        if key_in_stage {
            let mut guard = hold.buffer().get_direct()?;
            let bytes = guard.as_mut_slice();
            let end = bytes.len() - KEY_TAIL_BYTES;
            bytes[end..].copy_from_slice(&(key.len() as u32).to_ne_bytes());
            bytes[end - key.len()..end].copy_from_slice(&key);
        }

        let req = Request::new(req_id, hold);
        self.core
            .pending
            .lock()
            .unwrap()
            .insert(req_id, req.clone());
        self.core
            .requests
            .put_async(&wire::encode_request(&RequestMsg::Details(details)));
        Ok(req)
    }

    /// Close the reader: no new requests, in-flight requests still complete.
    /// With `wait`, block until the dispatch thread has drained.
    pub fn close(&self, wait: bool) {
        self.core.close_queues();
        if wait {
            if let Some(handle) = self.core.dispatch.lock().unwrap().take() {
                let _ = handle.join();
            }
        }
    }

    /// Stop the reader: close, then make workers exit at their next request
    /// timeout. Pending requests fail with the queue-closed error.
    pub fn stop(&self) {
        self.close(false);
        self.core.stop.set();
    }

    /// Worker process ids, for monitoring.
    pub fn worker_pids(&self) -> &[libc::pid_t] {
        &self.core.pids
    }
}

impl<A: FileAdapter> Drop for Reader<A> {
    fn drop(&mut self) {
        self.stop();
        if let Some(handle) = self.core.monitor.lock().unwrap().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.core.dispatch.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

/// The dispatch loop: pop notifications, wake requests.
fn dispatch_loop<A: FileAdapter>(core: &Arc<ReaderCore<A>>) {
    loop {
        let decoded = match core.notifications.get_direct(true, None) {
            Ok(slot) => wire::decode_notification(slot.bytes()),
            Err(e) => {
                error!("notification queue failed: {e}");
                for req in core.drain_pending() {
                    req.fail(FailureNote::queue_closed());
                }
                return;
            }
        };
        let msg = match decoded {
            Ok(msg) => msg,
            Err(e) => {
                warn!("undecodable notification: {e}");
                continue;
            }
        };

        match msg {
            Notification::Done {
                req_id,
                dtype,
                shape,
            } => {
                let req = core.pending.lock().unwrap().remove(&req_id);
                match req {
                    Some(req) => {
                        req.fulfill(dtype, shape);
                        if let Some(cb) = &core.notify_cb {
                            cb(ReaderEvent::Completed(req));
                        }
                    }
                    None => warn!("completion for unknown request {req_id}"),
                }
            }
            Notification::Failed {
                req_id: Some(req_id),
                kind,
                message,
                trace,
            } => {
                let req = core.pending.lock().unwrap().remove(&req_id);
                match req {
                    Some(req) => req.fail(FailureNote {
                        kind,
                        message,
                        trace,
                    }),
                    None => warn!("failure for unknown request {req_id}: {message}"),
                }
            }
            Notification::Failed {
                req_id: None,
                kind,
                message,
                trace,
            } => {
                // A worker died before it could tie the failure to a
                // request. Nothing can complete reliably after this.
                error!("worker failed outside request handling: {message}");
                for req in core.drain_pending() {
                    req.fail(FailureNote {
                        kind,
                        message: message.clone(),
                        trace: trace.clone(),
                    });
                }
                core.close_queues();
            }
            Notification::QueueClosed => {
                if let Some(cb) = &core.notify_cb {
                    cb(ReaderEvent::Closed);
                }
                for req in core.drain_pending() {
                    req.fail(FailureNote::queue_closed());
                }
                return;
            }
        }
    }
}
