//! Thin POSIX seam for the raw shared-memory machinery.
//!
//! Everything the crate needs from the OS goes through here: named segments
//! (`shm_open`/`ftruncate`/`shm_unlink`), anonymous shared mappings for
//! fork-inherited state, and the mapping lifecycle itself. Keeping the
//! surface this narrow is what would let a named-file-mapping backend slot
//! in for another platform.

#[cfg(not(unix))]
compile_error!("shmring requires a POSIX platform (shm_open/mmap/fork)");

use std::ffi::CString;
use std::io;
use std::ptr::NonNull;

use crate::ShmError;

/// An owned `mmap`ed region. Unmapped on drop.
pub struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
}

// Safety: the mapping is plain shared memory; all access synchronisation is
// the responsibility of the structures placed inside it.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    /// Map `len` bytes of the object behind `fd` (shared, read-write).
    pub fn from_fd(fd: i32, len: usize) -> Result<Self, ShmError> {
        // SAFETY: standard mmap call; the result is checked below.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error().into());
        }
        Ok(Self {
            ptr: NonNull::new(ptr.cast::<u8>()).expect("mmap returned null without MAP_FAILED"),
            len,
        })
    }

    /// An anonymous shared mapping: visible to children of a later `fork`,
    /// but to nobody else.
    pub fn anonymous(len: usize) -> Result<Self, ShmError> {
        // SAFETY: as above, with no backing object.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error().into());
        }
        Ok(Self {
            ptr: NonNull::new(ptr.cast::<u8>()).expect("mmap returned null without MAP_FAILED"),
            len,
        })
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
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

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a successful mmap and are unmapped once.
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast::<libc::c_void>(), self.len);
        }
    }
}

fn to_cstring(name: &str) -> Result<CString, ShmError> {
    CString::new(name)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "NUL in shm name").into())
}

/// Create a named segment exclusively. Fails with `AlreadyExists` when the
/// name is taken, which callers use to retry with a fresh random name.
pub fn shm_create_excl(name: &str, len: usize) -> Result<i32, ShmError> {
    let c_name = to_cstring(name)?;
    // SAFETY: plain shm_open; the fd is checked and owned by the caller.
    let fd = unsafe {
        libc::shm_open(
            c_name.as_ptr(),
            libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
            0o600 as libc::mode_t,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error().into());
    }
    // SAFETY: fd is valid; on failure the segment must not leak its name.
    let rc = unsafe { libc::ftruncate(fd, len as libc::off_t) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        unsafe {
            libc::close(fd);
            libc::shm_unlink(c_name.as_ptr());
        }
        return Err(err.into());
    }
    Ok(fd)
}

/// Open an existing named segment read-write.
pub fn shm_open_rw(name: &str) -> Result<i32, ShmError> {
    let c_name = to_cstring(name)?;
    // SAFETY: plain shm_open; the fd is checked and owned by the caller.
    let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0o600 as libc::mode_t) };
    if fd < 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(fd)
}

/// Remove a segment name. The backing memory lives until the last mapping
/// goes away.
pub fn shm_unlink(name: &str) -> Result<(), ShmError> {
    let c_name = to_cstring(name)?;
    // SAFETY: plain shm_unlink on a caller-owned name.
    let rc = unsafe { libc::shm_unlink(c_name.as_ptr()) };
    if rc != 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(())
}

/// Close a file descriptor, ignoring EBADF from double closes on teardown
/// paths that already tore the fd down.
pub fn close_fd(fd: i32) {
    if fd >= 0 {
        // SAFETY: fd was obtained from shm_open/pipe by this crate.
        unsafe {
            libc::close(fd);
        }
    }
}

/// Was the `AlreadyExists` condition the cause of this error?
pub fn is_eexist(err: &ShmError) -> bool {
    matches!(err, ShmError::Os(e) if e.raw_os_error() == Some(libc::EEXIST))
}
