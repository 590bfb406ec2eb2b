//! Compact tagged wire format for request descriptors, ops, and
//! notifications.
//!
//! The format exists because the op algebra is sensitive to details generic
//! serializers flatten away: tuples must stay tuples (lists mean point
//! selection), slices encode only their non-null members, and scalars keep
//! their exact dtype character. Small index arrays (up to 10 elements)
//! travel as plain typed lists; larger ones as `(descr, shape, raw bytes)`.
//!
//! Everything is native-endian: messages never leave the machine.

use thiserror::Error;

use crate::array::ScalarValue;
use crate::dtype::{DType, Field, ScalarKind};
use crate::error::RemoteKind;
use crate::ops::{IndexKey, Op, SliceArg};

/// Decode failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    /// The message ended before the value did.
    #[error("truncated message")]
    Truncated,

    /// An unknown tag byte.
    #[error("unexpected tag byte 0x{0:02x}")]
    Tag(u8),

    /// A string field was not valid UTF-8.
    #[error("invalid utf-8 in string field")]
    Utf8,

    /// An unknown dtype descriptor.
    #[error("unknown dtype descriptor '{0}'")]
    Descr(String),

    /// A length field exceeded the remaining message.
    #[error("length field out of range")]
    Length,
}

type WireResult<T> = std::result::Result<T, WireError>;

// Value tags.
const T_NONE: u8 = 0x00;
const T_FALSE: u8 = 0x01;
const T_TRUE: u8 = 0x02;
const T_I64: u8 = 0x03;
const T_STR: u8 = 0x05;
const T_BYTES: u8 = 0x06;
const T_TUPLE: u8 = 0x07;
const T_LIST: u8 = 0x08;
const T_SLICE: u8 = 0x09;
const T_ELLIPSIS: u8 = 0x0A;
const T_SCALAR: u8 = 0x0B;
const T_ARRAY_RAW: u8 = 0x0D;
/// The process-wide queue-closed sentinel, serialized explicitly rather than
/// compared by identity across address spaces.
const T_QUEUE_CLOSED: u8 = 0x0E;

// Message tags.
const T_OP: u8 = 0x20;
const T_DESCRIPTOR: u8 = 0x30;
const T_NOTIFY_DONE: u8 = 0x40;
const T_NOTIFY_FAILED: u8 = 0x41;

// Op variant codes.
const OP_INDEX: u8 = 0;
const OP_COL: u8 = 1;
const OP_READ: u8 = 2;
const OP_READ_SCALAR: u8 = 3;
const OP_JOINED: u8 = 4;
const OP_COORD: u8 = 5;
const OP_SORT: u8 = 6;
const OP_WHERE: u8 = 7;

/// Arrays up to this many elements encode as typed lists.
const SMALL_ARRAY: usize = 10;

// ---------------------------------------------------------------------
// ENCODER / DECODER PRIMITIVES
// ---------------------------------------------------------------------

#[derive(Default)]
struct Enc {
    buf: Vec<u8>,
}

impl Enc {
    #[inline]
    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    #[inline]
    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_ne_bytes());
    }

    #[inline]
    fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_ne_bytes());
    }

    #[inline]
    fn i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_ne_bytes());
    }

    fn str(&mut self, s: &str) {
        self.u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
    }

    fn bytes(&mut self, b: &[u8]) {
        self.u32(b.len() as u32);
        self.buf.extend_from_slice(b);
    }

    fn opt_i64(&mut self, v: Option<i64>) {
        match v {
            None => self.u8(T_NONE),
            Some(v) => {
                self.u8(T_I64);
                self.i64(v);
            }
        }
    }

    fn opt_str(&mut self, v: Option<&str>) {
        match v {
            None => self.u8(T_NONE),
            Some(s) => {
                self.u8(T_STR);
                self.str(s);
            }
        }
    }

    fn shape(&mut self, shape: &[usize]) {
        self.u8(shape.len() as u8);
        for &d in shape {
            self.u64(d as u64);
        }
    }
}

struct Dec<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Dec<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> WireResult<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(WireError::Truncated);
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> WireResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> WireResult<u32> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(u32::from_ne_bytes(raw))
    }

    fn u64(&mut self) -> WireResult<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_ne_bytes(raw))
    }

    fn i64(&mut self) -> WireResult<i64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(i64::from_ne_bytes(raw))
    }

    fn str(&mut self) -> WireResult<String> {
        let len = self.u32()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| WireError::Utf8)
    }

    fn bytes(&mut self) -> WireResult<Vec<u8>> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn opt_i64(&mut self) -> WireResult<Option<i64>> {
        match self.u8()? {
            T_NONE => Ok(None),
            T_I64 => Ok(Some(self.i64()?)),
            t => Err(WireError::Tag(t)),
        }
    }

    fn opt_str(&mut self) -> WireResult<Option<String>> {
        match self.u8()? {
            T_NONE => Ok(None),
            T_STR => Ok(Some(self.str()?)),
            t => Err(WireError::Tag(t)),
        }
    }

    fn shape(&mut self) -> WireResult<Vec<usize>> {
        let ndim = self.u8()? as usize;
        let mut out = Vec::with_capacity(ndim);
        for _ in 0..ndim {
            out.push(self.u64()? as usize);
        }
        Ok(out)
    }

    fn finished(&self) -> bool {
        self.pos == self.data.len()
    }
}

// ---------------------------------------------------------------------
// DTYPE & SCALARS
// ---------------------------------------------------------------------

fn put_dtype(e: &mut Enc, dtype: &DType) {
    match dtype {
        DType::Scalar(kind) => {
            e.u8(T_STR);
            e.str(kind.descr());
        }
        DType::Compound(fields) => {
            e.u8(T_LIST);
            e.u32(fields.len() as u32);
            for field in fields {
                e.u8(T_TUPLE);
                e.u32(3);
                e.u8(T_STR);
                e.str(&field.name);
                put_dtype(e, &field.dtype);
                e.shape(&field.shape);
            }
        }
    }
}

fn get_dtype(d: &mut Dec<'_>) -> WireResult<DType> {
    match d.u8()? {
        T_STR => {
            let descr = d.str()?;
            let kind = ScalarKind::from_descr(&descr).map_err(|_| WireError::Descr(descr))?;
            Ok(DType::Scalar(kind))
        }
        T_LIST => {
            let count = d.u32()? as usize;
            let mut fields = Vec::with_capacity(count);
            for _ in 0..count {
                if d.u8()? != T_TUPLE {
                    return Err(WireError::Tag(T_TUPLE));
                }
                if d.u32()? != 3 {
                    return Err(WireError::Length);
                }
                if d.u8()? != T_STR {
                    return Err(WireError::Tag(T_STR));
                }
                let name = d.str()?;
                let dtype = get_dtype(d)?;
                let shape = d.shape()?;
                fields.push(Field { name, dtype, shape });
            }
            Ok(DType::Compound(fields))
        }
        t => Err(WireError::Tag(t)),
    }
}

fn put_scalar(e: &mut Enc, v: &ScalarValue) {
    e.u8(T_SCALAR);
    e.str(v.kind().descr());
    let raw = v.to_raw();
    e.buf.extend_from_slice(&raw);
}

fn get_scalar(d: &mut Dec<'_>) -> WireResult<ScalarValue> {
    if d.u8()? != T_SCALAR {
        return Err(WireError::Tag(T_SCALAR));
    }
    let descr = d.str()?;
    let kind = ScalarKind::from_descr(&descr).map_err(|_| WireError::Descr(descr))?;
    let raw = d.take(kind.itemsize())?;
    Ok(ScalarValue::from_raw(kind, raw))
}

// ---------------------------------------------------------------------
// INDEX KEYS
// ---------------------------------------------------------------------

fn put_key(e: &mut Enc, key: &IndexKey) {
    match key {
        IndexKey::Int(v) => {
            e.u8(T_I64);
            e.i64(*v);
        }
        IndexKey::Slice(s) => {
            e.u8(T_SLICE);
            // Only the non-null members travel.
            let mask = u8::from(s.start.is_some())
                | u8::from(s.stop.is_some()) << 1
                | u8::from(s.step.is_some()) << 2;
            e.u8(mask);
            for v in [s.start, s.stop, s.step].into_iter().flatten() {
                e.i64(v);
            }
        }
        IndexKey::Coords(coords) => {
            if coords.len() <= SMALL_ARRAY {
                e.u8(T_LIST);
                e.u32(coords.len() as u32);
                for &c in coords {
                    e.u8(T_I64);
                    e.i64(c);
                }
            } else {
                e.u8(T_ARRAY_RAW);
                e.str(ScalarKind::Int64.descr());
                e.shape(&[coords.len()]);
                for &c in coords {
                    e.i64(c);
                }
            }
        }
        IndexKey::Mask(mask) => {
            if mask.len() <= SMALL_ARRAY {
                e.u8(T_LIST);
                e.u32(mask.len() as u32);
                for &m in mask {
                    e.u8(if m { T_TRUE } else { T_FALSE });
                }
            } else {
                e.u8(T_ARRAY_RAW);
                e.str(ScalarKind::Bool.descr());
                e.shape(&[mask.len()]);
                for &m in mask {
                    e.u8(u8::from(m));
                }
            }
        }
        IndexKey::Field(name) => {
            e.u8(T_STR);
            e.str(name);
        }
        IndexKey::Ellipsis => e.u8(T_ELLIPSIS),
        IndexKey::Tuple(keys) => {
            e.u8(T_TUPLE);
            e.u32(keys.len() as u32);
            for k in keys {
                put_key(e, k);
            }
        }
    }
}

fn get_key(d: &mut Dec<'_>) -> WireResult<IndexKey> {
    match d.u8()? {
        T_I64 => Ok(IndexKey::Int(d.i64()?)),
        T_SLICE => {
            let mask = d.u8()?;
            let mut member = |bit: u8| -> WireResult<Option<i64>> {
                if mask & bit != 0 {
                    Ok(Some(d.i64()?))
                } else {
                    Ok(None)
                }
            };
            let start = member(1)?;
            let stop = member(2)?;
            let step = member(4)?;
            Ok(IndexKey::Slice(SliceArg::new(start, stop, step)))
        }
        T_LIST => {
            let count = d.u32()? as usize;
            if count == 0 {
                return Ok(IndexKey::Coords(Vec::new()));
            }
            // The list's element tag decides whether this is point selection
            // or a boolean mask.
            let mut coords = Vec::new();
            let mut mask = Vec::new();
            for _ in 0..count {
                match d.u8()? {
                    T_I64 => coords.push(d.i64()?),
                    T_TRUE => mask.push(true),
                    T_FALSE => mask.push(false),
                    t => return Err(WireError::Tag(t)),
                }
            }
            if mask.is_empty() {
                Ok(IndexKey::Coords(coords))
            } else if coords.is_empty() {
                Ok(IndexKey::Mask(mask))
            } else {
                Err(WireError::Tag(T_LIST))
            }
        }
        T_ARRAY_RAW => {
            let descr = d.str()?;
            let kind = ScalarKind::from_descr(&descr).map_err(|_| WireError::Descr(descr))?;
            let shape = d.shape()?;
            let count: usize = shape.iter().product();
            match kind {
                ScalarKind::Int64 => {
                    let mut coords = Vec::with_capacity(count);
                    for _ in 0..count {
                        coords.push(d.i64()?);
                    }
                    Ok(IndexKey::Coords(coords))
                }
                ScalarKind::Bool => {
                    let raw = d.take(count)?;
                    Ok(IndexKey::Mask(raw.iter().map(|&b| b != 0).collect()))
                }
                _ => Err(WireError::Tag(T_ARRAY_RAW)),
            }
        }
        T_STR => Ok(IndexKey::Field(d.str()?)),
        T_ELLIPSIS => Ok(IndexKey::Ellipsis),
        T_TUPLE => {
            let count = d.u32()? as usize;
            let mut keys = Vec::with_capacity(count);
            for _ in 0..count {
                keys.push(get_key(d)?);
            }
            Ok(IndexKey::Tuple(keys))
        }
        t => Err(WireError::Tag(t)),
    }
}

fn put_keys(e: &mut Enc, keys: &[IndexKey]) {
    e.u32(keys.len() as u32);
    for k in keys {
        put_key(e, k);
    }
}

fn get_keys(d: &mut Dec<'_>) -> WireResult<Vec<IndexKey>> {
    let count = d.u32()? as usize;
    let mut keys = Vec::with_capacity(count);
    for _ in 0..count {
        keys.push(get_key(d)?);
    }
    Ok(keys)
}

// ---------------------------------------------------------------------
// OPS
// ---------------------------------------------------------------------

/// Serialize an op into key bytes.
pub(crate) fn encode_op(op: &Op) -> Vec<u8> {
    let mut e = Enc::default();
    e.u8(T_OP);
    match op {
        Op::Index { path, index } => {
            e.u8(OP_INDEX);
            e.str(path);
            put_keys(&mut e, index);
        }
        Op::Col { path, col, index } => {
            e.u8(OP_COL);
            e.str(path);
            e.str(col);
            put_keys(&mut e, index);
        }
        Op::Read {
            path,
            col,
            start,
            stop,
            step,
            index,
        } => {
            e.u8(OP_READ);
            e.str(path);
            e.opt_str(col.as_deref());
            e.opt_i64(*start);
            e.opt_i64(*stop);
            e.opt_i64(*step);
            put_keys(&mut e, index);
        }
        Op::ReadScalar {
            path,
            col,
            idx,
            index,
        } => {
            e.u8(OP_READ_SCALAR);
            e.str(path);
            e.opt_str(col.as_deref());
            e.i64(*idx);
            put_keys(&mut e, index);
        }
        Op::JoinedSlices {
            path,
            col,
            start1,
            stop1,
            step1,
            start2,
            stop2,
            step2,
            index,
        } => {
            e.u8(OP_JOINED);
            e.str(path);
            e.opt_str(col.as_deref());
            e.i64(*start1);
            e.i64(*stop1);
            e.opt_i64(*step1);
            e.i64(*start2);
            e.i64(*stop2);
            e.opt_i64(*step2);
            put_keys(&mut e, index);
        }
        Op::Coord {
            path,
            col,
            coords,
            index,
        } => {
            e.u8(OP_COORD);
            e.str(path);
            e.opt_str(col.as_deref());
            e.u32(coords.len() as u32);
            for &c in coords {
                e.i64(c);
            }
            put_keys(&mut e, index);
        }
        Op::Sort {
            path,
            sortby,
            check_csi,
            col,
            start,
            stop,
            step,
            index,
        } => {
            e.u8(OP_SORT);
            e.str(path);
            e.str(sortby);
            e.u8(u8::from(*check_csi));
            e.opt_str(col.as_deref());
            e.opt_i64(*start);
            e.opt_i64(*stop);
            e.opt_i64(*step);
            put_keys(&mut e, index);
        }
        Op::Where {
            path,
            condition,
            condvars,
            start,
            stop,
            step,
            index,
        } => {
            e.u8(OP_WHERE);
            e.str(path);
            e.str(condition);
            e.u32(condvars.len() as u32);
            for (name, value) in condvars {
                e.str(name);
                put_scalar(&mut e, value);
            }
            e.opt_i64(*start);
            e.opt_i64(*stop);
            e.opt_i64(*step);
            put_keys(&mut e, index);
        }
    }
    e.buf
}

/// Decode key bytes back into an op.
pub(crate) fn decode_op(data: &[u8]) -> WireResult<Op> {
    let mut d = Dec::new(data);
    if d.u8()? != T_OP {
        return Err(WireError::Tag(T_OP));
    }
    let op = match d.u8()? {
        OP_INDEX => Op::Index {
            path: d.str()?,
            index: get_keys(&mut d)?,
        },
        OP_COL => Op::Col {
            path: d.str()?,
            col: d.str()?,
            index: get_keys(&mut d)?,
        },
        OP_READ => Op::Read {
            path: d.str()?,
            col: d.opt_str()?,
            start: d.opt_i64()?,
            stop: d.opt_i64()?,
            step: d.opt_i64()?,
            index: get_keys(&mut d)?,
        },
        OP_READ_SCALAR => Op::ReadScalar {
            path: d.str()?,
            col: d.opt_str()?,
            idx: d.i64()?,
            index: get_keys(&mut d)?,
        },
        OP_JOINED => Op::JoinedSlices {
            path: d.str()?,
            col: d.opt_str()?,
            start1: d.i64()?,
            stop1: d.i64()?,
            step1: d.opt_i64()?,
            start2: d.i64()?,
            stop2: d.i64()?,
            step2: d.opt_i64()?,
            index: get_keys(&mut d)?,
        },
        OP_COORD => {
            let path = d.str()?;
            let col = d.opt_str()?;
            let count = d.u32()? as usize;
            let mut coords = Vec::with_capacity(count);
            for _ in 0..count {
                coords.push(d.i64()?);
            }
            Op::Coord {
                path,
                col,
                coords,
                index: get_keys(&mut d)?,
            }
        }
        OP_SORT => Op::Sort {
            path: d.str()?,
            sortby: d.str()?,
            check_csi: d.u8()? != 0,
            col: d.opt_str()?,
            start: d.opt_i64()?,
            stop: d.opt_i64()?,
            step: d.opt_i64()?,
            index: get_keys(&mut d)?,
        },
        OP_WHERE => {
            let path = d.str()?;
            let condition = d.str()?;
            let count = d.u32()? as usize;
            let mut condvars = Vec::with_capacity(count);
            for _ in 0..count {
                let name = d.str()?;
                let value = get_scalar(&mut d)?;
                condvars.push((name, value));
            }
            Op::Where {
                path,
                condition,
                condvars,
                start: d.opt_i64()?,
                stop: d.opt_i64()?,
                step: d.opt_i64()?,
                index: get_keys(&mut d)?,
            }
        }
        code => return Err(WireError::Tag(code)),
    };
    if !d.finished() {
        return Err(WireError::Length);
    }
    Ok(op)
}

// ---------------------------------------------------------------------
// REQUEST DESCRIPTORS
// ---------------------------------------------------------------------

/// The descriptor that travels on the request queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RequestDetails {
    pub req_id: u64,
    /// Name of the stage's shared buffer.
    pub map_id: String,
    /// Payload size of that buffer.
    pub size_nbytes: u64,
    /// Serialized op. Absent means "read the key from the tail of the
    /// stage payload, where the last 4 bytes are its length".
    pub key: Option<Vec<u8>>,
}

/// A message on the request queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RequestMsg {
    Details(RequestDetails),
    QueueClosed,
}

pub(crate) fn encode_request(msg: &RequestMsg) -> Vec<u8> {
    let mut e = Enc::default();
    match msg {
        RequestMsg::QueueClosed => e.u8(T_QUEUE_CLOSED),
        RequestMsg::Details(details) => {
            e.u8(T_DESCRIPTOR);
            e.u64(details.req_id);
            e.str(&details.map_id);
            e.u64(details.size_nbytes);
            match &details.key {
                None => e.u8(T_NONE),
                Some(key) => {
                    e.u8(T_BYTES);
                    e.bytes(key);
                }
            }
        }
    }
    e.buf
}

pub(crate) fn decode_request(data: &[u8]) -> WireResult<RequestMsg> {
    let mut d = Dec::new(data);
    match d.u8()? {
        T_QUEUE_CLOSED => Ok(RequestMsg::QueueClosed),
        T_DESCRIPTOR => {
            let req_id = d.u64()?;
            let map_id = d.str()?;
            let size_nbytes = d.u64()?;
            let key = match d.u8()? {
                T_NONE => None,
                T_BYTES => Some(d.bytes()?),
                t => return Err(WireError::Tag(t)),
            };
            Ok(RequestMsg::Details(RequestDetails {
                req_id,
                map_id,
                size_nbytes,
                key,
            }))
        }
        t => Err(WireError::Tag(t)),
    }
}

// ---------------------------------------------------------------------
// NOTIFICATIONS
// ---------------------------------------------------------------------

/// A message on the notification queue.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Notification {
    /// The request completed; the result sits in its stage.
    Done {
        req_id: u64,
        dtype: DType,
        shape: Vec<usize>,
    },
    /// A worker failed. With a `req_id`, only that request fails; without
    /// one, the failure predates request handling and is fatal.
    Failed {
        req_id: Option<u64>,
        kind: RemoteKind,
        message: String,
        trace: String,
    },
    /// All workers have exited.
    QueueClosed,
}

pub(crate) fn encode_notification(msg: &Notification) -> Vec<u8> {
    let mut e = Enc::default();
    match msg {
        Notification::QueueClosed => e.u8(T_QUEUE_CLOSED),
        Notification::Done {
            req_id,
            dtype,
            shape,
        } => {
            e.u8(T_NOTIFY_DONE);
            e.u64(*req_id);
            put_dtype(&mut e, dtype);
            e.shape(shape);
        }
        Notification::Failed {
            req_id,
            kind,
            message,
            trace,
        } => {
            e.u8(T_NOTIFY_FAILED);
            match req_id {
                None => e.u8(T_NONE),
                Some(id) => {
                    e.u8(T_I64);
                    e.u64(*id);
                }
            }
            e.u8(kind.code());
            e.str(message);
            e.str(trace);
        }
    }
    e.buf
}

pub(crate) fn decode_notification(data: &[u8]) -> WireResult<Notification> {
    let mut d = Dec::new(data);
    match d.u8()? {
        T_QUEUE_CLOSED => Ok(Notification::QueueClosed),
        T_NOTIFY_DONE => Ok(Notification::Done {
            req_id: d.u64()?,
            dtype: get_dtype(&mut d)?,
            shape: d.shape()?,
        }),
        T_NOTIFY_FAILED => {
            let req_id = match d.u8()? {
                T_NONE => None,
                T_I64 => Some(d.u64()?),
                t => return Err(WireError::Tag(t)),
            };
            Ok(Notification::Failed {
                req_id,
                kind: RemoteKind::from_code(d.u8()?),
                message: d.str()?,
                trace: d.str()?,
            })
        }
        t => Err(WireError::Tag(t)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(op: &Op) {
        let bytes = encode_op(op);
        let back = decode_op(&bytes).unwrap();
        assert_eq!(&back, op);
    }

    #[test]
    fn ops_round_trip_structurally() {
        round_trip(&Op::Read {
            path: "/test_array".into(),
            col: Some("A".into()),
            start: Some(30),
            stop: Some(35),
            step: None,
            index: vec![],
        });
        round_trip(&Op::ReadScalar {
            path: "/t".into(),
            col: None,
            idx: 7,
            index: vec![IndexKey::Field("B".into())],
        });
        round_trip(&Op::JoinedSlices {
            path: "/t".into(),
            col: None,
            start1: 990,
            stop1: 1000,
            step1: None,
            start2: 0,
            stop2: 35,
            step2: None,
            index: vec![],
        });
        round_trip(&Op::Sort {
            path: "/t".into(),
            sortby: "col_C".into(),
            check_csi: true,
            col: None,
            start: None,
            stop: Some(100),
            step: Some(2),
            index: vec![],
        });
        round_trip(&Op::Where {
            path: "/t".into(),
            condition: "col_C > x".into(),
            condvars: vec![("x".into(), ScalarValue::Float32(0.5))],
            start: None,
            stop: None,
            step: None,
            index: vec![],
        });
    }

    #[test]
    fn tuples_stay_tuples() {
        let op = Op::Index {
            path: "/a".into(),
            index: vec![IndexKey::Tuple(vec![
                IndexKey::Int(3),
                IndexKey::Slice(SliceArg::full()),
                IndexKey::Ellipsis,
            ])],
        };
        let back = decode_op(&encode_op(&op)).unwrap();
        let Op::Index { index, .. } = back else {
            panic!("variant changed across the wire")
        };
        assert!(matches!(index[0], IndexKey::Tuple(ref t) if t.len() == 3));
    }

    #[test]
    fn slice_nulls_round_trip() {
        for slice in [
            SliceArg::new(None, None, None),
            SliceArg::new(Some(3), None, None),
            SliceArg::new(None, Some(-1), Some(2)),
            SliceArg::new(Some(0), Some(10), Some(3)),
        ] {
            let op = Op::Index {
                path: "/a".into(),
                index: vec![IndexKey::Slice(slice)],
            };
            let back = decode_op(&encode_op(&op)).unwrap();
            let Op::Index { index, .. } = back else { unreachable!() };
            assert_eq!(index[0], IndexKey::Slice(slice));
        }
    }

    #[test]
    fn small_and_large_arrays_round_trip() {
        let small = IndexKey::Coords(vec![1, 2, 3]);
        let large = IndexKey::Coords((0..100).collect());
        let mask_small = IndexKey::Mask(vec![true, false, true]);
        let mask_large = IndexKey::Mask((0..64).map(|i| i % 3 == 0).collect());
        for key in [small, large, mask_small, mask_large] {
            let op = Op::Index {
                path: "/a".into(),
                index: vec![key.clone()],
            };
            let back = decode_op(&encode_op(&op)).unwrap();
            let Op::Index { index, .. } = back else { unreachable!() };
            assert_eq!(index[0], key);
        }
    }

    #[test]
    fn scalars_keep_their_dtype() {
        let op = Op::Where {
            path: "/t".into(),
            condition: "a < x".into(),
            condvars: vec![
                ("x".into(), ScalarValue::UInt16(9)),
                ("y".into(), ScalarValue::Float64(1.5)),
                ("b".into(), ScalarValue::Bool(true)),
            ],
            start: None,
            stop: None,
            step: None,
            index: vec![],
        };
        let Op::Where { condvars, .. } = decode_op(&encode_op(&op)).unwrap() else {
            unreachable!()
        };
        assert_eq!(condvars[0].1, ScalarValue::UInt16(9));
        assert_eq!(condvars[1].1, ScalarValue::Float64(1.5));
        assert_eq!(condvars[2].1, ScalarValue::Bool(true));
    }

    #[test]
    fn descriptor_and_notifications_round_trip() {
        let msg = RequestMsg::Details(RequestDetails {
            req_id: 42,
            map_id: "/pt-00aabb".into(),
            size_nbytes: 4096,
            key: None,
        });
        assert_eq!(decode_request(&encode_request(&msg)).unwrap(), msg);

        let msg = RequestMsg::QueueClosed;
        assert_eq!(decode_request(&encode_request(&msg)).unwrap(), msg);

        let done = Notification::Done {
            req_id: 7,
            dtype: DType::Scalar(ScalarKind::Int64),
            shape: vec![2, 10, 10],
        };
        assert_eq!(decode_notification(&encode_notification(&done)).unwrap(), done);

        let failed = Notification::Failed {
            req_id: Some(9),
            kind: RemoteKind::SharedMemory,
            message: "stage is smaller than requested array: 80 < 800".into(),
            trace: "stage is smaller than requested array: 80 < 800".into(),
        };
        assert_eq!(
            decode_notification(&encode_notification(&failed)).unwrap(),
            failed
        );
    }
}
