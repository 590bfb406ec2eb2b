//! Block streaming over a dataset.
//!
//! The streamer layers a scan on top of the reader: a submitter thread
//! issues a rolling sequence of block requests against a stage pool, and a
//! [`StreamQueue`] hands the blocks to consumers. Unordered mode delivers
//! blocks as they complete (the reader's completion callback feeds the
//! queue); ordered mode binds delivery order to submission order instead.
//! Cyclic mode wraps past the end of the dataset, joining tail and head
//! into one block.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, warn};

use crate::adapter::{DataNode, FileAdapter};
use crate::array::OwnedArray;
use crate::error::{Error, Result};
use crate::ops::Op;
use crate::reader::{Reader, ReaderConfig, ReaderEvent};
use crate::request::{PoolItem, Request, RequestPool};
use crate::stage::StagePool;

/// Block target for unchunked datasets: roughly this many bytes per block.
const DEFAULT_BLOCK_NBYTES: usize = 128 * 1024;

/// How long the submitter waits for a free stage before retrying; the
/// timeout is the scan's backpressure.
const STAGE_TIMEOUT: Duration = Duration::from_millis(100);

/// Options for [`Streamer::get_queue`] and [`Streamer::get_generator`].
#[derive(Debug, Clone, Default)]
pub struct QueueOptions {
    /// Worker processes. Default 4.
    pub n_procs: Option<usize>,
    /// Stages in the read-ahead pool. Default `2 * n_procs + 1`.
    pub read_ahead: Option<usize>,
    /// Wrap past the end of the dataset, joining tail and head blocks.
    pub cyclic: bool,
    /// Rows per block. Defaults to the chunk length, or a block of roughly
    /// 128 KiB when the dataset is not chunked.
    pub block_size: Option<usize>,
    /// Deliver blocks in on-disk order instead of completion order.
    pub ordered: bool,
    /// Restrict the scan to one field of a table.
    pub field: Option<String>,
    /// Also deliver the final short block when the block size does not
    /// divide the dataset. Queues default to skipping it, generators to
    /// delivering it.
    pub remainder: Option<bool>,
}

impl QueueOptions {
    pub fn with_n_procs(mut self, n_procs: usize) -> Self {
        self.n_procs = Some(n_procs);
        self
    }

    pub fn with_read_ahead(mut self, read_ahead: usize) -> Self {
        self.read_ahead = Some(read_ahead);
        self
    }

    pub fn cyclic(mut self, cyclic: bool) -> Self {
        self.cyclic = cyclic;
        self
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = Some(block_size);
        self
    }

    pub fn ordered(mut self, ordered: bool) -> Self {
        self.ordered = ordered;
        self
    }

    pub fn with_field(mut self, field: &str) -> Self {
        self.field = Some(field.to_owned());
        self
    }

    pub fn with_remainder(mut self, remainder: bool) -> Self {
        self.remainder = Some(remainder);
        self
    }
}

/// Streams blocks of a dataset through a pool of reader processes.
pub struct Streamer<A: FileAdapter> {
    path: PathBuf,
    opts: A::Options,
    closed: Arc<AtomicBool>,
}

struct Probe {
    len: usize,
    block_size: usize,
    /// Bytes of one result row (field-restricted when a field is set).
    row_nbytes: usize,
}

impl<A: FileAdapter> Streamer<A> {
    /// A streamer over the container at `path` with default open options.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self::with_options(path, A::Options::default())
    }

    pub fn with_options(path: impl AsRef<Path>, opts: A::Options) -> Self {
        Self {
            path: path.as_ref().to_owned(),
            opts,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Probe the dataset for its length, the effective block size, and the
    /// per-row result size.
    fn probe(&self, path: &str, field: Option<&str>, block_size: Option<usize>) -> Result<Probe> {
        let mut file = A::open(&self.path, &self.opts)?;
        let node = file.node(path)?;
        let shape = node.shape();
        let len = shape.first().copied().unwrap_or(0);
        if len == 0 {
            return Err(Error::adapter("cannot read from an empty dataset"));
        }

        let (row_dtype, row_shape) = match field {
            Some(name) => {
                let fref = node.dtype().field(name)?;
                (fref.dtype.clone(), fref.shape.to_vec())
            }
            None => (node.dtype().clone(), shape[1..].to_vec()),
        };
        let row_nbytes = row_dtype.nbytes(&row_shape).max(1);

        let block_size = match block_size {
            Some(requested) => requested.min(len),
            None => match node.chunkshape().and_then(|c| c.first().copied()) {
                Some(chunk) if chunk > 0 => chunk.min(len),
                _ => (DEFAULT_BLOCK_NBYTES / row_nbytes).max(1).min(len),
            },
        };

        Ok(Probe {
            len,
            block_size,
            row_nbytes,
        })
    }

    /// Start a scan and return the queue its blocks arrive on.
    pub fn get_queue(&self, path: &str, options: &QueueOptions) -> Result<StreamQueue<A>> {
        let remainder = options.remainder.unwrap_or(false);
        self.start(path, options, remainder)
    }

    /// Start a scan and return a row-by-row iterator over it. Unlike the
    /// queue, the generator delivers remainder rows by default.
    pub fn get_generator(&self, path: &str, options: &QueueOptions) -> Result<RowIter<A>> {
        let remainder = options.remainder.unwrap_or(true);
        Ok(RowIter {
            queue: self.start(path, options, remainder)?,
            rows: VecDeque::new(),
            done: false,
        })
    }

    /// Read the remainder rows directly: the rows a non-cyclic scan with
    /// this block size would skip.
    pub fn get_remainder(&self, path: &str, block_size: Option<usize>) -> Result<OwnedArray> {
        let probe = self.probe(path, None, block_size)?;
        let start = probe.block_size * (probe.len / probe.block_size);
        let mut file = A::open(&self.path, &self.opts)?;
        let mut node = file.node(path)?;
        node.read(Some(start as i64), Some(probe.len as i64), None, None)
    }

    /// Stop every scan started from this streamer.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn start(&self, path: &str, options: &QueueOptions, remainder: bool) -> Result<StreamQueue<A>> {
        let field = options.field.clone();
        let probe = self.probe(path, field.as_deref(), options.block_size)?;
        let n_procs = options.n_procs.unwrap_or(4);
        let read_ahead = options.read_ahead.unwrap_or(2 * n_procs + 1);
        if read_ahead == 0 {
            return Err(Error::invalid_op(
                "read_ahead must be a strictly positive number",
            ));
        }

        let pool = Arc::new(RequestPool::new());
        let ordered = options.ordered;
        // Unordered delivery: completion order is delivery order, so the
        // dispatch callback feeds the queue. Ordered delivery pools at
        // submission time and ignores completions.
        let notify: Option<Box<crate::reader::NotifyFn>> = if ordered {
            None
        } else {
            let pool = Arc::clone(&pool);
            Some(Box::new(move |event| match event {
                ReaderEvent::Completed(req) => pool.add(PoolItem::Request(req)),
                ReaderEvent::Closed => pool.add(PoolItem::Closed),
            }))
        };

        let reader = Arc::new(Reader::<A>::with_config(
            &self.path,
            ReaderConfig::default().with_n_procs(n_procs),
            notify,
            self.opts.clone(),
        )?);

        let stage_pool = Arc::new(StagePool::new(
            probe.row_nbytes * probe.block_size,
            read_ahead,
            Some(STAGE_TIMEOUT),
        )?);

        let stop = Arc::new(AtomicBool::new(false));
        let submitter = {
            let reader = Arc::clone(&reader);
            let stage_pool = Arc::clone(&stage_pool);
            let pool = Arc::clone(&pool);
            let stop = Arc::clone(&stop);
            let streamer_closed = Arc::clone(&self.closed);
            let path = path.to_owned();
            let cyclic = options.cyclic;
            let (len, block_size) = (probe.len, probe.block_size);
            std::thread::Builder::new()
                .name("paratables-submitter".into())
                .spawn(move || {
                    submit_loop(&SubmitArgs {
                        reader: &reader,
                        stage_pool: &stage_pool,
                        pool: &pool,
                        stop: &stop,
                        streamer_closed: &streamer_closed,
                        path: &path,
                        field: field.as_deref(),
                        len,
                        block_size,
                        cyclic,
                        ordered,
                        remainder,
                    });
                })?
        };

        Ok(StreamQueue {
            pool,
            stop,
            block_size: probe.block_size,
            reader,
            _stage_pool: stage_pool,
            submitter: Mutex::new(Some(submitter)),
        })
    }
}

impl<A: FileAdapter> Drop for Streamer<A> {
    fn drop(&mut self) {
        self.close();
    }
}

struct SubmitArgs<'a, A: FileAdapter> {
    reader: &'a Reader<A>,
    stage_pool: &'a StagePool,
    pool: &'a RequestPool,
    stop: &'a AtomicBool,
    streamer_closed: &'a AtomicBool,
    path: &'a str,
    field: Option<&'a str>,
    len: usize,
    block_size: usize,
    cyclic: bool,
    ordered: bool,
    remainder: bool,
}

/// The rolling request loop: `[i, i + block_size)` blocks, wrapping or
/// finishing at the end of the dataset.
fn submit_loop<A: FileAdapter>(args: &SubmitArgs<'_, A>) {
    let read_op = |start: usize, stop: usize| Op::Read {
        path: args.path.to_owned(),
        col: args.field.map(str::to_owned),
        start: Some(start as i64),
        stop: Some(stop as i64),
        step: None,
        index: vec![],
    };

    let mut i = 0usize;
    while !args.stop.load(Ordering::Acquire) && !args.streamer_closed.load(Ordering::Acquire) {
        let (op, next) = {
            let (start, stop) = (i, i + args.block_size);
            if stop > args.len {
                if args.cyclic {
                    let wrapped = stop - args.len;
                    let op = Op::JoinedSlices {
                        path: args.path.to_owned(),
                        col: args.field.map(str::to_owned),
                        start1: start as i64,
                        stop1: args.len as i64,
                        step1: None,
                        start2: 0,
                        stop2: wrapped as i64,
                        step2: None,
                        index: vec![],
                    };
                    (op, wrapped)
                } else if args.remainder && start < args.len {
                    (read_op(start, args.len), args.len)
                } else {
                    break;
                }
            } else {
                (read_op(start, stop), stop)
            }
        };

        match args.reader.request(op, args.stage_pool) {
            // Stage pool exhausted: the scan is ahead of the consumer.
            Err(Error::Empty) => continue,
            Err(e) => {
                warn!("stream submitter stopping: {e}");
                break;
            }
            Ok(req) => {
                if args.ordered {
                    args.pool.add(PoolItem::Request(req));
                }
                i = next;
            }
        }
    }

    if args.ordered {
        args.pool.add(PoolItem::Closed);
    }
    args.reader.close(false);
    debug!("stream submitter finished");
}

/// One delivered block, or the end of the stream.
pub enum StreamItem {
    /// The next block's request handle.
    Block(Request),
    /// The stream is closed; `get` will keep returning this.
    Closed,
}

/// Consumer side of a scan.
pub struct StreamQueue<A: FileAdapter> {
    pool: Arc<RequestPool>,
    stop: Arc<AtomicBool>,
    block_size: usize,
    reader: Arc<Reader<A>>,
    _stage_pool: Arc<StagePool>,
    submitter: Mutex<Option<JoinHandle<()>>>,
}

impl<A: FileAdapter> StreamQueue<A> {
    /// Rows per block.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Next block, blocking until one is available. A closed stream keeps
    /// answering [`StreamItem::Closed`]: the sentinel is re-enqueued on
    /// every observation so sibling consumers see it too.
    pub fn get(&self) -> StreamItem {
        match self.pool.next() {
            PoolItem::Closed => {
                self.pool.add(PoolItem::Closed);
                StreamItem::Closed
            }
            PoolItem::Request(req) => StreamItem::Block(req),
        }
    }

    /// Iterate blocks until the stream closes.
    pub fn iter(&self) -> impl Iterator<Item = Request> + '_ {
        std::iter::from_fn(move || match self.get() {
            StreamItem::Block(req) => Some(req),
            StreamItem::Closed => None,
        })
    }

    /// Stop the scan. The submitter winds down, closes the reader, and the
    /// closed sentinel reaches every consumer.
    pub fn close(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Worker process ids of the scan's reader, for monitoring.
    pub fn worker_pids(&self) -> &[libc::pid_t] {
        self.reader.worker_pids()
    }
}

impl<A: FileAdapter> Drop for StreamQueue<A> {
    fn drop(&mut self) {
        self.close();
        if let Some(handle) = self.submitter.lock().unwrap().take() {
            let _ = handle.join();
        }
        // Wake any consumer still blocked on the pool.
        self.pool.add(PoolItem::Closed);
        self.reader.close(false);
    }
}

/// Row-by-row iterator over a scan. Each item is one row of a block copied
/// out of shared memory.
pub struct RowIter<A: FileAdapter> {
    queue: StreamQueue<A>,
    rows: VecDeque<OwnedArray>,
    done: bool,
}

impl<A: FileAdapter> RowIter<A> {
    /// The underlying queue.
    pub fn queue(&self) -> &StreamQueue<A> {
        &self.queue
    }
}

impl<A: FileAdapter> Iterator for RowIter<A> {
    type Item = Result<OwnedArray>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(row) = self.rows.pop_front() {
                return Some(Ok(row));
            }
            if self.done {
                return None;
            }
            match self.queue.get() {
                StreamItem::Closed => {
                    self.done = true;
                    self.queue.close();
                    return None;
                }
                StreamItem::Block(req) => match req.copy() {
                    Ok(block) => self.rows.extend(block.rows()),
                    Err(e) => {
                        self.done = true;
                        self.queue.close();
                        return Some(Err(e));
                    }
                },
            }
        }
    }
}
