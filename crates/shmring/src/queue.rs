//! A bounded multi-producer/multi-consumer queue of byte messages backed by
//! one shared mapping.
//!
//! The mapping holds a header (lock, two condition variables, tail index,
//! occupancy) followed by `queue_len` equally sized blocks with layout
//! `[payload(elem_size) | size:u64 | flag:u8]`. Messages that fit in a block
//! are written in place with `flag = 0`; oversize messages enqueue a block
//! with `flag = 1` and travel through a pipe side channel, length-prefixed.
//! The flagged slot is recorded under the same lock that orders block
//! messages, so side-channel messages keep their FIFO position.
//!
//! Timed waits never rely on a platform timed condvar: a heartbeat thread in
//! the creating process periodically broadcasts the consumer condition
//! variable, and waiters re-check their deadline on every wake.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use crossbeam_utils::Backoff;
use log::{debug, warn};

use crate::platform::{self, Mapping};
use crate::sync::{MutexGuard, RawCondvar, RawMutex};
use crate::ShmError;

/// Default heartbeat period for consumer-side timed waits.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_millis(100);

const SIZE_BYTES: usize = std::mem::size_of::<u64>();
const FLAG_BYTES: usize = 1;

#[repr(C)]
struct Header {
    mutex: RawMutex,
    putters: RawCondvar,
    getters: RawCondvar,
    /// Serialises side-channel frame writes so frames never interleave.
    side_tx: RawMutex,
    /// Index of the next block to read.
    tail: UnsafeCell<u64>,
    /// Number of occupied blocks. head = (tail + count) % queue_len.
    count: UnsafeCell<u64>,
}

/// In-process overflow state for [`SharedQueue::put_async`].
struct Overflow {
    /// Held across queue insertion so buffered messages keep their order
    /// relative to direct puts.
    order: Mutex<()>,
    state: Mutex<OverflowState>,
    cvar: Condvar,
}

struct OverflowState {
    buf: VecDeque<Vec<u8>>,
    /// Pid that owns the running drain thread; a forked child inherits the
    /// parent's state but not its threads, so the pid mismatch restarts it.
    drainer_pid: u32,
}

struct QueueShared {
    map: Mapping,
    elem_size: usize,
    queue_len: usize,
    blocks_offset: usize,
    side_r: i32,
    side_w: i32,
    heartbeat: Duration,
    overflow: Overflow,
}

unsafe impl Send for QueueShared {}
unsafe impl Sync for QueueShared {}

impl QueueShared {
    #[inline]
    fn header(&self) -> &Header {
        // SAFETY: the header was initialised in place at construction and the
        // mapping is alive for &self.
        unsafe { &*self.map.as_ptr().cast::<Header>() }
    }

    #[inline]
    fn block_size(&self) -> usize {
        self.elem_size + SIZE_BYTES + FLAG_BYTES
    }

    #[inline]
    fn block_ptr(&self, idx: usize) -> *mut u8 {
        debug_assert!(idx < self.queue_len);
        // SAFETY: blocks_offset + queue_len * block_size fits the mapping by
        // construction.
        unsafe { self.map.as_ptr().add(self.blocks_offset + idx * self.block_size()) }
    }

    /// Occupancy, header lock held.
    #[inline]
    fn count(&self, _guard: &MutexGuard<'_>) -> usize {
        // SAFETY: guarded by the header mutex.
        (unsafe { *self.header().count.get() }) as usize
    }

    #[inline]
    fn tail(&self, _guard: &MutexGuard<'_>) -> usize {
        // SAFETY: guarded by the header mutex.
        (unsafe { *self.header().tail.get() }) as usize
    }

    /// Write one block at the head position. Header lock held.
    fn place_block(&self, guard: &MutexGuard<'_>, bytes: &[u8], side: bool) {
        let count = self.count(guard);
        debug_assert!(count < self.queue_len);
        let head = (self.tail(guard) + count) % self.queue_len;
        let ptr = self.block_ptr(head);

        // SAFETY: ptr addresses one whole block; all offsets below stay
        // within it, and the header lock serialises block access.
        unsafe {
            *ptr.add(self.elem_size + SIZE_BYTES) = u8::from(side);
            if !side {
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len());
                let size = (bytes.len() as u64).to_ne_bytes();
                std::ptr::copy_nonoverlapping(size.as_ptr(), ptr.add(self.elem_size), SIZE_BYTES);
            }
            *self.header().count.get() = (count + 1) as u64;
        }
        self.header().getters.notify_one();
    }

    /// Reserve a block and fill it, waiting for space if asked to.
    fn put_shared(
        &self,
        bytes: &[u8],
        side: bool,
        block: bool,
        timeout: Option<Duration>,
    ) -> Result<(), ShmError> {
        debug_assert!(bytes.len() <= self.elem_size);
        let deadline = timeout.map(|t| Instant::now() + t);

        // Brief spin before parking; contended puts usually find space as a
        // consumer advances.
        let backoff = Backoff::new();
        let mut guard = self.header().mutex.lock();
        while self.count(&guard) >= self.queue_len {
            if !block {
                return Err(ShmError::Full);
            }
            if let Some(d) = deadline {
                if Instant::now() >= d {
                    return Err(ShmError::Full);
                }
            }
            if backoff.is_completed() {
                self.header().putters.wait(&mut guard);
            } else {
                drop(guard);
                backoff.snooze();
                guard = self.header().mutex.lock();
            }
        }
        self.place_block(&guard, bytes, side);
        Ok(())
    }

    /// Synchronous put: block message or flagged slot + side-channel frame.
    fn put_sync(
        &self,
        bytes: &[u8],
        block: bool,
        timeout: Option<Duration>,
    ) -> Result<(), ShmError> {
        if bytes.len() > self.elem_size {
            // Slot commit and frame write happen under one lock, so two
            // oversize messages keep their slots and frames in the same
            // order. A consumer hitting the flagged slot first blocks on the
            // pipe until the frame lands.
            let _tx = self.header().side_tx.lock();
            self.put_shared(&[], true, block, timeout)?;
            let len = (bytes.len() as u64).to_ne_bytes();
            write_full(self.side_w, &len)?;
            write_full(self.side_w, bytes)?;
            Ok(())
        } else {
            self.put_shared(bytes, false, block, timeout)
        }
    }

    /// Drain buffered overflow messages in order. The caller holds the
    /// overflow order lock.
    fn drain_overflow(&self, block: bool) -> Result<(), ShmError> {
        loop {
            let front = { self.overflow.state.lock().unwrap().buf.pop_front() };
            let Some(msg) = front else { return Ok(()) };
            if let Err(e) = self.put_sync(&msg, block, None) {
                // Put the message back at the front; order is still intact
                // because the order lock is held.
                self.overflow.state.lock().unwrap().buf.push_front(msg);
                return Err(e);
            }
        }
    }

    fn read_side_frame(&self) -> Result<Vec<u8>, ShmError> {
        let mut len = [0u8; SIZE_BYTES];
        read_full(self.side_r, &mut len)?;
        let len = u64::from_ne_bytes(len) as usize;
        let mut buf = vec![0u8; len];
        read_full(self.side_r, &mut buf)?;
        Ok(buf)
    }
}

impl Drop for QueueShared {
    fn drop(&mut self) {
        platform::close_fd(self.side_r);
        platform::close_fd(self.side_w);
    }
}

/// Bounded shared-memory queue of byte messages. Cloning yields another
/// handle onto the same queue; handles inherited over `fork` keep working.
#[derive(Clone)]
pub struct SharedQueue {
    inner: Arc<QueueShared>,
}

impl SharedQueue {
    /// Allocate a queue of `queue_len` blocks of `elem_size` payload bytes.
    pub fn new(elem_size: usize, queue_len: usize) -> Result<Self, ShmError> {
        Self::with_heartbeat(elem_size, queue_len, DEFAULT_HEARTBEAT)
    }

    /// As [`SharedQueue::new`] with an explicit heartbeat period.
    pub fn with_heartbeat(
        elem_size: usize,
        queue_len: usize,
        heartbeat: Duration,
    ) -> Result<Self, ShmError> {
        assert!(elem_size > 0 && queue_len > 0);
        let header_len = std::mem::size_of::<Header>().next_multiple_of(8);
        let block_size = elem_size + SIZE_BYTES + FLAG_BYTES;
        let map = Mapping::anonymous(header_len + block_size * queue_len)?;

        let header = map.as_ptr().cast::<Header>();
        // SAFETY: the mapping is fresh and private to this constructor; the
        // pthread objects are initialised exactly once, in place.
        unsafe {
            RawMutex::init_at(std::ptr::addr_of_mut!((*header).mutex))?;
            RawCondvar::init_at(std::ptr::addr_of_mut!((*header).putters))?;
            RawCondvar::init_at(std::ptr::addr_of_mut!((*header).getters))?;
            RawMutex::init_at(std::ptr::addr_of_mut!((*header).side_tx))?;
            *(*header).tail.get() = 0;
            *(*header).count.get() = 0;
        }

        let mut fds = [0i32; 2];
        // SAFETY: plain pipe(2); checked below.
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        if rc != 0 {
            return Err(io::Error::last_os_error().into());
        }

        let inner = Arc::new(QueueShared {
            map,
            elem_size,
            queue_len,
            blocks_offset: header_len,
            side_r: fds[0],
            side_w: fds[1],
            heartbeat,
            overflow: Overflow {
                order: Mutex::new(()),
                state: Mutex::new(OverflowState {
                    buf: VecDeque::new(),
                    drainer_pid: 0,
                }),
                cvar: Condvar::new(),
            },
        });

        spawn_heartbeat(&inner);
        Ok(Self { inner })
    }

    /// Payload capacity of one block, i.e. the largest message that avoids
    /// the side channel.
    #[inline]
    pub fn elem_size(&self) -> usize {
        self.inner.elem_size
    }

    /// Number of blocks.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.inner.queue_len
    }

    /// Enqueue a message, blocking while the queue is full (unless
    /// `block = false`, which fails fast with [`ShmError::Full`]).
    ///
    /// Messages larger than [`elem_size`](Self::elem_size) spill to the side
    /// channel but keep their queue position. Earlier `put_async` overflow is
    /// drained first so FIFO order holds across both entry points.
    pub fn put(
        &self,
        bytes: &[u8],
        block: bool,
        timeout: Option<Duration>,
    ) -> Result<(), ShmError> {
        let _order = self.inner.overflow.order.lock().unwrap();
        self.inner.drain_overflow(block)?;
        self.inner.put_sync(bytes, block, timeout)
    }

    /// Non-blocking enqueue. A full queue buffers the message in-process; a
    /// drain thread feeds it in once space opens up.
    pub fn put_async(&self, bytes: &[u8]) {
        match self.put(bytes, false, None) {
            Ok(()) => {}
            Err(ShmError::Full) => {
                {
                    let mut state = self.inner.overflow.state.lock().unwrap();
                    state.buf.push_back(bytes.to_vec());
                    let pid = std::process::id();
                    if state.drainer_pid != pid {
                        state.drainer_pid = pid;
                        spawn_drainer(&self.inner);
                    }
                }
                self.inner.overflow.cvar.notify_one();
            }
            Err(e) => warn!("put_async dropped a message: {e}"),
        }
    }

    /// Dequeue the next message as a scoped view. The slot is released (and
    /// producers signalled) when the guard drops.
    ///
    /// Returns [`ShmError::Empty`] immediately when `block = false`, or after
    /// `timeout` when one is supplied.
    pub fn get_direct(
        &self,
        block: bool,
        timeout: Option<Duration>,
    ) -> Result<QueueSlot<'_>, ShmError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let q = &*self.inner;
        let header = q.header();

        let mut guard = header.mutex.lock();
        while q.count(&guard) == 0 {
            if !block {
                return Err(ShmError::Empty);
            }
            if let Some(d) = deadline {
                if Instant::now() >= d {
                    return Err(ShmError::Empty);
                }
            }
            // Woken by producers or by the heartbeat broadcast.
            header.getters.wait(&mut guard);
        }

        let tail = q.tail(&guard);
        let ptr = q.block_ptr(tail);
        // SAFETY: the header lock is held and tail addresses an occupied
        // block.
        let side = unsafe { *ptr.add(q.elem_size + SIZE_BYTES) } != 0;
        let data = if side {
            // The real bytes travel through the pipe; the read is serialised
            // by the header lock we already hold.
            SlotData::Owned(q.read_side_frame()?)
        } else {
            let mut size = [0u8; SIZE_BYTES];
            // SAFETY: as above; size field sits at elem_size within the block.
            unsafe {
                std::ptr::copy_nonoverlapping(ptr.add(q.elem_size), size.as_mut_ptr(), SIZE_BYTES);
            }
            SlotData::Borrowed {
                ptr,
                len: u64::from_ne_bytes(size) as usize,
            }
        };

        Ok(QueueSlot {
            queue: q,
            guard: Some(guard),
            data,
        })
    }
}

enum SlotData {
    Borrowed { ptr: *const u8, len: usize },
    Owned(Vec<u8>),
}

/// Scoped view of the message at the queue tail. Dropping the guard advances
/// the tail and signals producers.
pub struct QueueSlot<'a> {
    queue: &'a QueueShared,
    guard: Option<MutexGuard<'a>>,
    data: SlotData,
}

impl std::fmt::Debug for QueueSlot<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueSlot").field("bytes", &self.bytes()).finish()
    }
}

impl QueueSlot<'_> {
    /// The message bytes.
    pub fn bytes(&self) -> &[u8] {
        match &self.data {
            // SAFETY: the block stays valid while the guard (still held by
            // this slot) pins the tail.
            SlotData::Borrowed { ptr, len } => unsafe { std::slice::from_raw_parts(*ptr, *len) },
            SlotData::Owned(v) => v,
        }
    }
}

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        let header = self.queue.header();
        if let Some(guard) = &self.guard {
            let tail = self.queue.tail(guard);
            let count = self.queue.count(guard);
            // SAFETY: the guard is still held; this is the tail advance that
            // frees the consumed block.
            unsafe {
                *header.tail.get() = ((tail + 1) % self.queue.queue_len) as u64;
                *header.count.get() = (count - 1) as u64;
            }
            header.putters.notify_one();
        }
        // Unlock after the advance.
        self.guard = None;
    }
}

fn spawn_heartbeat(inner: &Arc<QueueShared>) {
    let weak: Weak<QueueShared> = Arc::downgrade(inner);
    let spawned = std::thread::Builder::new()
        .name("shmring-heartbeat".into())
        .spawn(move || loop {
            let Some(q) = weak.upgrade() else { return };
            {
                let _guard = q.header().mutex.lock();
                q.header().getters.notify_all();
            }
            let period = q.heartbeat;
            drop(q);
            std::thread::sleep(period);
        });
    if let Err(e) = spawned {
        warn!("failed to spawn heartbeat thread: {e}");
    }
}

fn spawn_drainer(inner: &Arc<QueueShared>) {
    let weak: Weak<QueueShared> = Arc::downgrade(inner);
    let spawned = std::thread::Builder::new()
        .name("shmring-overflow".into())
        .spawn(move || loop {
            let Some(q) = weak.upgrade() else { return };
            {
                let _order = q.overflow.order.lock().unwrap();
                if let Err(e) = q.drain_overflow(true) {
                    warn!("overflow drain failed: {e}");
                }
            }
            let state = q.overflow.state.lock().unwrap();
            if state.buf.is_empty() {
                // Park until more overflow arrives; wake periodically so the
                // thread can exit once the queue is gone.
                let (state, _timeout) = q
                    .overflow
                    .cvar
                    .wait_timeout(state, Duration::from_millis(500))
                    .unwrap();
                drop(state);
            }
        });
    match spawned {
        Ok(_) => debug!("overflow drain thread started"),
        Err(e) => warn!("failed to spawn overflow drain thread: {e}"),
    }
}

fn write_full(fd: i32, mut buf: &[u8]) -> Result<(), ShmError> {
    while !buf.is_empty() {
        // SAFETY: fd is a pipe owned by the queue; buf is a live slice.
        let n = unsafe { libc::write(fd, buf.as_ptr().cast::<libc::c_void>(), buf.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err.into());
        }
        buf = &buf[n as usize..];
    }
    Ok(())
}

fn read_full(fd: i32, mut buf: &mut [u8]) -> Result<(), ShmError> {
    while !buf.is_empty() {
        // SAFETY: fd is a pipe owned by the queue; buf is a live slice.
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast::<libc::c_void>(), buf.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err.into());
        }
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "side channel closed").into());
        }
        let n = n as usize;
        buf = &mut buf[n..];
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_round_trip() {
        let q = SharedQueue::new(64, 4).unwrap();
        q.put(b"hello", true, None).unwrap();
        let slot = q.get_direct(true, None).unwrap();
        assert_eq!(slot.bytes(), b"hello");
    }

    #[test]
    fn fifo_order_is_preserved() {
        let q = SharedQueue::new(16, 8).unwrap();
        for i in 0u8..8 {
            q.put(&[i], true, None).unwrap();
        }
        for i in 0u8..8 {
            let slot = q.get_direct(true, None).unwrap();
            assert_eq!(slot.bytes(), &[i]);
        }
    }

    #[test]
    fn oversize_spills_to_side_channel() {
        let q = SharedQueue::new(8, 4).unwrap();
        let big = vec![0xCDu8; 100];
        q.put(b"small", true, None).unwrap();
        q.put(&big, true, None).unwrap();
        q.put(b"after", true, None).unwrap();

        assert_eq!(q.get_direct(true, None).unwrap().bytes(), b"small");
        assert_eq!(q.get_direct(true, None).unwrap().bytes(), &big[..]);
        assert_eq!(q.get_direct(true, None).unwrap().bytes(), b"after");
    }

    #[test]
    fn full_and_empty_fail_fast() {
        let q = SharedQueue::new(8, 2).unwrap();
        q.put(b"a", true, None).unwrap();
        q.put(b"b", true, None).unwrap();
        assert!(matches!(q.put(b"c", false, None), Err(ShmError::Full)));

        drop(q.get_direct(true, None).unwrap());
        drop(q.get_direct(true, None).unwrap());
        assert!(matches!(q.get_direct(false, None), Err(ShmError::Empty)));
    }

    #[test]
    fn timed_get_expires_via_heartbeat() {
        let q = SharedQueue::with_heartbeat(8, 2, Duration::from_millis(10)).unwrap();
        let start = Instant::now();
        let err = q.get_direct(true, Some(Duration::from_millis(50))).unwrap_err();
        assert!(matches!(err, ShmError::Empty));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn put_async_overflow_drains_in_order() {
        let q = SharedQueue::new(8, 2).unwrap();
        for i in 0u8..6 {
            q.put_async(&[i]);
        }
        for i in 0u8..6 {
            let slot = q
                .get_direct(true, Some(Duration::from_secs(5)))
                .unwrap_or_else(|_| panic!("message {i} never arrived"));
            assert_eq!(slot.bytes(), &[i]);
        }
    }

    #[test]
    fn concurrent_producers_and_consumers() {
        let q = SharedQueue::new(16, 4).unwrap();
        let total = 200u64;

        std::thread::scope(|s| {
            for t in 0..4u64 {
                let q = q.clone();
                s.spawn(move || {
                    for i in 0..total / 4 {
                        let v = (t * 1000 + i).to_ne_bytes();
                        q.put(&v, true, None).unwrap();
                    }
                });
            }

            let mut seen = Vec::new();
            for _ in 0..total {
                let slot = q.get_direct(true, Some(Duration::from_secs(10))).unwrap();
                let mut v = [0u8; 8];
                v.copy_from_slice(slot.bytes());
                seen.push(u64::from_ne_bytes(v));
            }
            assert_eq!(seen.len() as u64, total);
            // Per-producer order must hold even though producers interleave.
            for t in 0..4u64 {
                let per: Vec<u64> = seen
                    .iter()
                    .copied()
                    .filter(|v| v / 1000 == t)
                    .collect();
                assert!(per.windows(2).all(|w| w[0] < w[1]));
            }
        });
    }
}
