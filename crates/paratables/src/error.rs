//! Error types for the read engine.

use thiserror::Error;

use crate::wire::WireError;

/// Classification of a failure that happened inside a worker process.
///
/// Failures cross the process boundary as `(kind, message, trace)`; the kind
/// survives so callers can still match on what originally went wrong, the way
/// they would have matched on the error itself had it been raised locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteKind {
    /// The result would not fit the stage ([`Error::SharedMemory`]).
    SharedMemory,
    /// The reader was closed while the request was pending.
    QueueClosed,
    /// An I/O failure in the worker.
    Io,
    /// The file adapter rejected the operation.
    Adapter,
    /// The op was structurally invalid for the target node.
    InvalidOp,
    /// A named column does not exist.
    MissingColumn,
    /// The wire format could not be decoded.
    Wire,
    /// Anything else.
    Other,
}

impl RemoteKind {
    pub(crate) fn code(self) -> u8 {
        match self {
            Self::SharedMemory => 0,
            Self::QueueClosed => 1,
            Self::Io => 2,
            Self::Adapter => 3,
            Self::InvalidOp => 4,
            Self::MissingColumn => 5,
            Self::Wire => 6,
            Self::Other => 7,
        }
    }

    pub(crate) fn from_code(code: u8) -> Self {
        match code {
            0 => Self::SharedMemory,
            1 => Self::QueueClosed,
            2 => Self::Io,
            3 => Self::Adapter,
            4 => Self::InvalidOp,
            5 => Self::MissingColumn,
            6 => Self::Wire,
            _ => Self::Other,
        }
    }
}

/// A failure raised inside a worker process, carried back to the request
/// that caused it.
#[derive(Debug, Clone, Error)]
#[error("worker error ({kind:?}): {message}\n\nthe above error was caused by the following remote failure:\n\n{trace}")]
pub struct SubprocessError {
    /// What kind of error the worker hit.
    pub kind: RemoteKind,
    /// The worker-side error message.
    pub message: String,
    /// The formatted error chain from the worker.
    pub trace: String,
}

/// Errors raised by the read engine.
#[derive(Debug, Error)]
pub enum Error {
    /// A result (or view) would exceed the stage's payload capacity.
    #[error("stage is smaller than requested array: {capacity} < {needed}")]
    SharedMemory {
        /// Bytes the result needs.
        needed: usize,
        /// Bytes the stage holds.
        capacity: usize,
    },

    /// The reader closed before (or while) the request was pending.
    #[error("this reader has been closed")]
    QueueClosed,

    /// Access through a proxy that has been released.
    #[error("this resource has been released and is no longer accessible")]
    Released,

    /// The request's result was already consumed by an earlier accessor.
    #[error("request result has already been consumed")]
    ResultConsumed,

    /// The stage is already fielding another request.
    #[error("stage already fielding another request")]
    StageBusy,

    /// The stage has been closed.
    #[error("stage has already been closed")]
    StageClosed,

    /// A stage-pool acquire timed out. Streamer submitters treat this as
    /// backpressure and retry.
    #[error("no stage available")]
    Empty,

    /// A request was made on a closed reader.
    #[error("attempt to request data from a closed reader")]
    ReaderClosed,

    /// The wire format could not be encoded or decoded.
    #[error("wire format error: {0}")]
    Wire(#[from] WireError),

    /// A shared-memory primitive failed.
    #[error(transparent)]
    Shm(#[from] shmring::ShmError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The file adapter rejected an operation.
    #[error("adapter error: {message}")]
    Adapter {
        /// What the adapter complained about.
        message: String,
    },

    /// The op cannot be applied to the target node.
    #[error("invalid operation: {message}")]
    InvalidOp {
        /// Why the op was rejected.
        message: String,
    },

    /// A named column does not exist in the dataset's row type.
    #[error("specified column name '{name}' not in dataset")]
    MissingColumn {
        /// The missing column.
        name: String,
    },

    /// A failure forwarded from a worker process.
    #[error(transparent)]
    Worker(#[from] SubprocessError),
}

impl Error {
    pub(crate) fn adapter(message: impl Into<String>) -> Self {
        Self::Adapter {
            message: message.into(),
        }
    }

    pub(crate) fn invalid_op(message: impl Into<String>) -> Self {
        Self::InvalidOp {
            message: message.into(),
        }
    }

    /// The remote kind this error would be classified as when crossing the
    /// worker boundary.
    pub(crate) fn remote_kind(&self) -> RemoteKind {
        match self {
            Self::SharedMemory { .. } => RemoteKind::SharedMemory,
            Self::QueueClosed | Self::ReaderClosed => RemoteKind::QueueClosed,
            Self::Io(_) | Self::Shm(_) => RemoteKind::Io,
            Self::Adapter { .. } => RemoteKind::Adapter,
            Self::InvalidOp { .. } => RemoteKind::InvalidOp,
            Self::MissingColumn { .. } => RemoteKind::MissingColumn,
            Self::Wire(_) => RemoteKind::Wire,
            Self::Worker(w) => w.kind,
            _ => RemoteKind::Other,
        }
    }

    /// True when this error is (or wraps a worker-side) stage-capacity
    /// violation.
    pub fn is_shared_memory(&self) -> bool {
        matches!(self, Self::SharedMemory { .. })
            || matches!(self, Self::Worker(w) if w.kind == RemoteKind::SharedMemory)
    }

    /// True when this error reports the reader as closed, locally or from a
    /// worker.
    pub fn is_queue_closed(&self) -> bool {
        matches!(self, Self::QueueClosed | Self::ReaderClosed)
            || matches!(self, Self::Worker(w) if w.kind == RemoteKind::QueueClosed)
    }

    /// Format the full source chain, the closest thing a native error has to
    /// a traceback. This is what travels in failure notifications.
    pub(crate) fn chain(&self) -> String {
        use std::error::Error as _;
        let mut out = self.to_string();
        let mut source = self.source();
        while let Some(s) = source {
            out.push_str("\n  caused by: ");
            out.push_str(&s.to_string());
            source = s.source();
        }
        out
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_wrapper_preserves_kind() {
        let remote = Error::SharedMemory {
            needed: 100,
            capacity: 10,
        };
        let forwarded = Error::Worker(SubprocessError {
            kind: remote.remote_kind(),
            message: remote.to_string(),
            trace: remote.chain(),
        });
        assert!(forwarded.is_shared_memory());
        assert!(!forwarded.is_queue_closed());
        let text = forwarded.to_string();
        assert!(text.contains("remote failure"));
        assert!(text.contains("stage is smaller"));
    }

    #[test]
    fn remote_kind_codes_round_trip() {
        for kind in [
            RemoteKind::SharedMemory,
            RemoteKind::QueueClosed,
            RemoteKind::Io,
            RemoteKind::Adapter,
            RemoteKind::InvalidOp,
            RemoteKind::MissingColumn,
            RemoteKind::Wire,
            RemoteKind::Other,
        ] {
            assert_eq!(RemoteKind::from_code(kind.code()), kind);
        }
    }
}
