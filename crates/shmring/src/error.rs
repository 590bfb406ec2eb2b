//! Error types for shared-memory operations.

use thiserror::Error;

/// Errors raised by shared buffers, queues and the process-shared primitives.
#[derive(Debug, Error)]
pub enum ShmError {
    /// An underlying OS call failed (shm_open, mmap, pipe, ...).
    #[error("os error: {0}")]
    Os(#[from] std::io::Error),

    /// A pthread primitive could not be initialised or operated on.
    #[error("pthread error: {op} returned {code}")]
    Pthread {
        /// The pthread call that failed.
        op: &'static str,
        /// Its raw return code.
        code: i32,
    },

    /// Non-blocking put on a full queue, or a blocking put that timed out.
    #[error("queue is full")]
    Full,

    /// Non-blocking get on an empty queue, or a blocking get that timed out.
    #[error("queue is empty")]
    Empty,

    /// The handle was used after `close()`.
    #[error("shared buffer has been closed")]
    Closed,

    /// A message exceeded what the queue and its side channel can carry.
    #[error("message of {len} bytes exceeds the side-channel frame limit")]
    Oversize {
        /// The offending message length.
        len: usize,
    },
}

impl ShmError {
    /// True when the error is transient backpressure rather than a fault.
    #[inline]
    pub fn is_would_block(&self) -> bool {
        matches!(self, Self::Full | Self::Empty)
    }

    pub(crate) fn pthread(op: &'static str, code: i32) -> Self {
        Self::Pthread { op, code }
    }
}
