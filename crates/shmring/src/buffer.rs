//! Named shared-memory buffers.
//!
//! A [`SharedBuffer`] is one named segment holding a one-byte liveness flag
//! followed by the payload. Exactly one handle is the *master*: it created
//! the segment and is the only handle allowed to unlink it. Any number of
//! *attachers* map the same name. The master's teardown order is what lets
//! attachers notice the unlink before their own mapping goes away:
//! set flag, release views, close descriptor, unlink name.

use std::mem::ManuallyDrop;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::warn;

use crate::platform::{self, Mapping};
use crate::ShmError;

/// Offset of the payload within the mapping; byte 0 is the liveness flag.
const PAYLOAD_OFFSET: usize = 1;

const FLAG_LIVE: u8 = 0;
const FLAG_UNLINKED: u8 = 1;

struct BufState {
    map: Option<Mapping>,
    fd: i32,
    closed: bool,
}

impl BufState {
    fn flag(&self) -> Option<&AtomicU8> {
        // SAFETY: byte 0 of a live mapping is the flag; AtomicU8 is
        // alignment-free and the mapping outlives the returned borrow.
        self.map.as_ref().map(|m| unsafe { &*m.as_ptr().cast::<AtomicU8>() })
    }

    fn payload_ptr(&self) -> Option<*mut u8> {
        // SAFETY: the payload starts one byte into the mapping.
        self.map.as_ref().map(|m| unsafe { m.as_ptr().add(PAYLOAD_OFFSET) })
    }
}

struct BufShared {
    name: String,
    size_nbytes: usize,
    master: bool,
    state: Mutex<BufState>,
}

impl BufShared {
    /// Release the segment. For the master the order is load-bearing:
    /// flag first, then the mapping, then the descriptor, then the name.
    fn close(&self) {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return;
        }
        state.closed = true;
        if self.master {
            if let Some(flag) = state.flag() {
                flag.store(FLAG_UNLINKED, Ordering::Release);
            }
        }
        state.map = None;
        platform::close_fd(state.fd);
        state.fd = -1;
        if self.master {
            if let Err(e) = platform::shm_unlink(&self.name) {
                warn!("shm_unlink({}) failed: {e}", self.name);
            }
        }
    }
}

impl Drop for BufShared {
    fn drop(&mut self) {
        self.close();
    }
}

/// One named region of shared memory.
pub struct SharedBuffer {
    shared: Arc<BufShared>,
}

impl SharedBuffer {
    /// Create a fresh segment under a random name, retrying on collisions.
    ///
    /// `size_nbytes` is the payload size; the segment itself is one byte
    /// larger to carry the liveness flag.
    pub fn create(size_nbytes: usize) -> Result<Self, ShmError> {
        let alloc = size_nbytes + PAYLOAD_OFFSET;
        loop {
            let name = format!("/pt-{:016x}", rand::random::<u64>());
            let fd = match platform::shm_create_excl(&name, alloc) {
                Ok(fd) => fd,
                Err(e) if platform::is_eexist(&e) => continue,
                Err(e) => return Err(e),
            };
            let map = match Mapping::from_fd(fd, alloc) {
                Ok(map) => map,
                Err(e) => {
                    platform::close_fd(fd);
                    let _ = platform::shm_unlink(&name);
                    return Err(e);
                }
            };
            let state = BufState {
                map: Some(map),
                fd,
                closed: false,
            };
            state
                .flag()
                .expect("fresh mapping")
                .store(FLAG_LIVE, Ordering::Release);
            return Ok(Self {
                shared: Arc::new(BufShared {
                    name,
                    size_nbytes,
                    master: true,
                    state: Mutex::new(state),
                }),
            });
        }
    }

    /// Attach to an existing segment by name. The payload size must match the
    /// size the master created it with.
    pub fn open(name: &str, size_nbytes: usize) -> Result<Self, ShmError> {
        let alloc = size_nbytes + PAYLOAD_OFFSET;
        let fd = platform::shm_open_rw(name)?;
        let map = match Mapping::from_fd(fd, alloc) {
            Ok(map) => map,
            Err(e) => {
                platform::close_fd(fd);
                return Err(e);
            }
        };
        Ok(Self {
            shared: Arc::new(BufShared {
                name: name.to_owned(),
                size_nbytes,
                master: false,
                state: Mutex::new(BufState {
                    map: Some(map),
                    fd,
                    closed: false,
                }),
            }),
        })
    }

    /// The system-wide segment name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Payload size in bytes.
    #[inline]
    pub fn size_nbytes(&self) -> usize {
        self.shared.size_nbytes
    }

    /// True for the handle that created (and will unlink) the segment.
    #[inline]
    pub fn is_master(&self) -> bool {
        self.shared.master
    }

    /// Lock-guarded direct access to the payload bytes.
    pub fn get_direct(&self) -> Result<PayloadGuard<'_>, ShmError> {
        let state = self.shared.state.lock().unwrap();
        if state.closed {
            return Err(ShmError::Closed);
        }
        let ptr = state.payload_ptr().ok_or(ShmError::Closed)?;
        Ok(PayloadGuard {
            _state: state,
            ptr,
            len: self.shared.size_nbytes,
        })
    }

    /// As [`get_direct`](Self::get_direct), but the guard owns its handle and
    /// carries no borrow, so it can live inside result objects that outlive
    /// the call frame. The per-handle lock is held until the guard drops.
    pub fn get_direct_owned(&self) -> Result<OwnedPayloadGuard, ShmError> {
        let state = self.shared.state.lock().unwrap();
        if state.closed {
            return Err(ShmError::Closed);
        }
        let ptr = state.payload_ptr().ok_or(ShmError::Closed)?;
        // SAFETY: the guard's lifetime is tied to the Mutex inside
        // BufShared; the Arc held alongside keeps that Mutex alive for as
        // long as the transmuted guard exists, and the field drop order in
        // OwnedPayloadGuard releases the guard first.
        let state: MutexGuard<'static, BufState> = unsafe { std::mem::transmute(state) };
        Ok(OwnedPayloadGuard {
            guard: ManuallyDrop::new(state),
            _shared: Arc::clone(&self.shared),
            ptr,
            len: self.shared.size_nbytes,
        })
    }

    /// Has the master unlinked the segment (or this handle been closed)?
    pub fn is_unlinked(&self) -> bool {
        let state = self.shared.state.lock().unwrap();
        if state.closed {
            return true;
        }
        match state.flag() {
            Some(flag) => flag.load(Ordering::Acquire) == FLAG_UNLINKED,
            None => true,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().unwrap().closed
    }

    /// Release this handle's segment. Idempotent.
    pub fn close(&self) {
        self.shared.close();
    }
}

/// Scoped view over a buffer's payload. Holds the per-handle lock.
pub struct PayloadGuard<'a> {
    _state: MutexGuard<'a, BufState>,
    ptr: *mut u8,
    len: usize,
}

impl PayloadGuard<'_> {
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr/len describe the payload of a mapping kept alive by
        // the held lock.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above; &mut self gives unique access through this guard.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// An owning payload guard: keeps the buffer (and its lock) alive without
/// borrowing from the handle.
pub struct OwnedPayloadGuard {
    guard: ManuallyDrop<MutexGuard<'static, BufState>>,
    _shared: Arc<BufShared>,
    ptr: *mut u8,
    len: usize,
}

impl OwnedPayloadGuard {
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the held lock pins the mapping for the guard's lifetime.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above; &mut self gives unique access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for OwnedPayloadGuard {
    fn drop(&mut self) {
        // The lock must release before the Arc (and with it the Mutex) can
        // go away.
        // SAFETY: dropped exactly once, here.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_open_share_bytes() {
        let master = SharedBuffer::create(64).unwrap();
        let attacher = SharedBuffer::open(master.name(), 64).unwrap();

        master.get_direct().unwrap().as_mut_slice()[..4].copy_from_slice(b"abcd");
        assert_eq!(&attacher.get_direct().unwrap().as_slice()[..4], b"abcd");
        assert!(!attacher.is_unlinked());
    }

    #[test]
    fn attacher_sees_unlink_flag() {
        let master = SharedBuffer::create(16).unwrap();
        let attacher = SharedBuffer::open(master.name(), 16).unwrap();
        master.close();
        assert!(attacher.is_unlinked());
        // The name is gone: a new open must fail.
        assert!(SharedBuffer::open(attacher.name(), 16).is_err());
    }

    #[test]
    fn closed_handle_refuses_access() {
        let buf = SharedBuffer::create(16).unwrap();
        buf.close();
        assert!(matches!(buf.get_direct(), Err(ShmError::Closed)));
        assert!(buf.is_unlinked());
    }

    #[test]
    fn owned_guard_outlives_the_call_frame() {
        let buf = SharedBuffer::create(8).unwrap();
        let guard = {
            let mut g = buf.get_direct_owned().unwrap();
            g.as_mut_slice().copy_from_slice(b"12345678");
            g
        };
        assert_eq!(guard.as_slice(), b"12345678");
        drop(guard);
        // The lock is free again.
        assert!(buf.get_direct().is_ok());
    }
}
