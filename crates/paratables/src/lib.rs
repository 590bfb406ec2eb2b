//! Parallel shared-memory reads of columnar container files.
//!
//! The engine offloads dataset reads to a pool of cooperating worker
//! processes that deliver results through named shared-memory regions,
//! bypassing the serialization cost a conventional inter-process queue
//! would impose on array payloads.
//!
//! # Pieces
//!
//! - [`Reader`]: random access. Build an op against a [`Dataset`] proxy,
//!   stage it in a [`Stage`] or [`StagePool`], and wait on the returned
//!   [`Request`].
//! - [`Streamer`]: scans. A rolling sequence of block requests with
//!   unordered or on-disk-ordered delivery, optional cyclic wrap-around,
//!   and optional remainder handling.
//! - [`FileAdapter`]/[`DataNode`]: the seam to the container format. The
//!   bundled [`colfile`] adapter implements it for a small native
//!   container, so the engine runs end to end without an external format
//!   library.
//!
//! # Example
//!
//! ```ignore
//! use paratables::{colfile::ColFile, Reader};
//!
//! let reader = Reader::<ColFile>::open("data.ptc")?;
//! let dataset = reader.get_dataset("/test_array")?;
//! let stage = dataset.create_stage(&[2])?;
//!
//! let req = reader.request(dataset.slice(40..42), &stage)?;
//! let rows = req.copy()?;
//! reader.close(true);
//! ```

mod adapter;
mod array;
pub mod colfile;
mod dataset;
mod dtype;
mod error;
mod ops;
mod reader;
mod request;
mod stage;
mod streamer;
mod wire;
mod worker;

pub use adapter::{DataNode, FileAdapter};
pub use array::{ArrayView, Element, OwnedArray, ScalarValue};
pub use dataset::{Dataset, OpBuilder};
pub use dtype::{DType, Field, FieldRef, ScalarKind};
pub use error::{Error, RemoteKind, Result, SubprocessError};
pub use ops::{IndexKey, Op, SliceArg};
pub use reader::{NotifyFn, Reader, ReaderConfig, ReaderEvent};
pub use request::{Request, ResultGuard, ResultProxy};
pub use stage::{Stage, StageHold, StagePool, StageSource};
pub use streamer::{QueueOptions, RowIter, StreamItem, StreamQueue, Streamer};
pub use wire::WireError;
