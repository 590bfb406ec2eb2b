//! Process-shared building blocks for staging array payloads between
//! cooperating processes.
//!
//! Two primitives make up the crate:
//!
//! - [`SharedBuffer`]: a named segment of shared memory with a one-byte
//!   liveness flag, a master/attacher lifecycle, and lock-guarded scoped
//!   views. Results are written into these by reader processes and consumed
//!   in place by the requesting process, so array payloads never cross a
//!   serialising channel.
//! - [`SharedQueue`]: a bounded MPMC queue of byte messages laid out in one
//!   shared mapping, with a pipe side channel for messages that exceed the
//!   block size and a heartbeat thread standing in for platform timed waits.
//!
//! Both survive `fork`: anonymous mappings are inherited by children, and
//! named buffers are re-attached by name. [`SharedEvent`] is the matching
//! fork-inherited stop flag.

mod buffer;
mod error;
mod platform;
mod queue;
mod sync;

pub use buffer::{OwnedPayloadGuard, PayloadGuard, SharedBuffer};
pub use error::ShmError;
pub use queue::{QueueSlot, SharedQueue, DEFAULT_HEARTBEAT};
pub use sync::SharedEvent;
