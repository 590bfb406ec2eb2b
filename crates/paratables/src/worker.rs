//! The worker-process loop.
//!
//! Each worker is a forked process running the same loop: pop a request
//! descriptor, attach (or reuse) the stage buffer it names, execute the op
//! against the file, and push the result metadata on the notification
//! queue. Timeouts double as housekeeping ticks: any cached buffer whose
//! master has unlinked it is closed and dropped.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use log::{debug, warn};
use shmring::{SharedBuffer, SharedEvent, SharedQueue, ShmError};

use crate::adapter::FileAdapter;
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::ops::ResultSink;
use crate::wire::{self, Notification, RequestDetails, RequestMsg};

/// How long a worker waits on the request queue before a housekeeping pass.
const POP_TIMEOUT: Duration = Duration::from_millis(100);

/// The bytes at the very end of a stage that carry a staged key's length.
pub(crate) const KEY_TAIL_BYTES: usize = 4;

/// Everything a worker needs, built before the fork so children inherit it.
pub(crate) struct WorkerContext<A: FileAdapter> {
    pub path: PathBuf,
    pub opts: A::Options,
    pub requests: SharedQueue,
    pub notifications: SharedQueue,
    pub stop: SharedEvent,
}

/// The worker main loop. Runs in the child process until the stop event is
/// set or the queue-closed sentinel arrives.
pub(crate) fn run<A: FileAdapter>(ctx: &WorkerContext<A>) {
    let mut file = match A::open(&ctx.path, &ctx.opts) {
        Ok(file) => file,
        Err(e) => {
            // Nothing request-specific went wrong yet, so this is fatal for
            // the reader as a whole.
            push_failure(&ctx.notifications, None, &e);
            return;
        }
    };

    let mut nodes: HashMap<String, A::Node> = HashMap::new();
    let mut bufs: HashMap<String, SharedBuffer> = HashMap::new();

    while !ctx.stop.is_set() {
        let msg = match ctx.requests.get_direct(true, Some(POP_TIMEOUT)) {
            Err(ShmError::Empty) => {
                // Idle tick: reclaim buffers whose owning stage has died.
                bufs.retain(|name, buf| {
                    if buf.is_unlinked() {
                        debug!("worker releasing unlinked buffer {name}");
                        buf.close();
                        false
                    } else {
                        true
                    }
                });
                continue;
            }
            Err(e) => {
                push_failure(&ctx.notifications, None, &e.into());
                return;
            }
            Ok(slot) => match wire::decode_request(slot.bytes()) {
                Ok(msg) => msg,
                Err(e) => {
                    drop(slot);
                    push_failure(&ctx.notifications, None, &Error::Wire(e));
                    continue;
                }
            },
        };

        match msg {
            RequestMsg::QueueClosed => {
                // Re-enqueue the sentinel so peer workers see it too.
                let closed = wire::encode_request(&RequestMsg::QueueClosed);
                if let Err(e) = ctx.requests.put(&closed, true, None) {
                    warn!("worker could not re-enqueue the closed sentinel: {e}");
                }
                break;
            }
            RequestMsg::Details(details) => {
                let req_id = details.req_id;
                match serve::<A>(&mut file, &mut nodes, &mut bufs, details) {
                    Ok((dtype, shape)) => {
                        let note = Notification::Done {
                            req_id,
                            dtype,
                            shape,
                        };
                        if let Err(e) =
                            ctx.notifications.put(&wire::encode_notification(&note), true, None)
                        {
                            warn!("worker could not push a completion: {e}");
                        }
                    }
                    Err(e) => push_failure(&ctx.notifications, Some(req_id), &e),
                }
            }
        }
    }
}

/// Field one request: attach the stage, recover the key, run the op.
fn serve<A: FileAdapter>(
    file: &mut A,
    nodes: &mut HashMap<String, A::Node>,
    bufs: &mut HashMap<String, SharedBuffer>,
    details: RequestDetails,
) -> Result<(DType, Vec<usize>)> {
    let buf = match bufs.entry(details.map_id.clone()) {
        Entry::Occupied(entry) => entry.into_mut(),
        Entry::Vacant(entry) => entry.insert(SharedBuffer::open(
            &details.map_id,
            details.size_nbytes as usize,
        )?),
    };

    let key_bytes = match details.key {
        Some(key) => key,
        // No inline key: it sits in the trailing bytes of the stage, with
        // the last 4 bytes holding its length.
        None => {
            let guard = buf.get_direct()?;
            let bytes = guard.as_slice();
            if bytes.len() < KEY_TAIL_BYTES {
                return Err(Error::invalid_op("stage too small to carry a staged key"));
            }
            let mut raw = [0u8; KEY_TAIL_BYTES];
            raw.copy_from_slice(&bytes[bytes.len() - KEY_TAIL_BYTES..]);
            let keysize = u32::from_ne_bytes(raw) as usize;
            if keysize + KEY_TAIL_BYTES > bytes.len() {
                return Err(Error::invalid_op("staged key length exceeds the stage"));
            }
            let end = bytes.len() - KEY_TAIL_BYTES;
            bytes[end - keysize..end].to_vec()
        }
    };

    let op = wire::decode_op(&key_bytes)?;
    let node = match nodes.entry(op.path().to_owned()) {
        Entry::Occupied(entry) => entry.into_mut(),
        Entry::Vacant(entry) => entry.insert(file.node(op.path())?),
    };

    let sink = ResultSink::new(buf);
    op.execute(node, &sink)
}

/// Wrap a failure with its originating request id (if known) and the
/// formatted error chain, and push it as a failure notification.
fn push_failure(notifications: &SharedQueue, req_id: Option<u64>, e: &Error) {
    let note = Notification::Failed {
        req_id,
        kind: e.remote_kind(),
        message: e.to_string(),
        trace: e.chain(),
    };
    if let Err(err) = notifications.put(&wire::encode_notification(&note), true, None) {
        warn!("worker could not push a failure notification: {err}");
    }
}
