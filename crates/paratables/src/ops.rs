//! The op algebra: serializable descriptions of read operations.
//!
//! An [`Op`] is a tagged variant with one match point per algorithm: execute
//! against a node, predict the result metadata, and (in `wire`) serialize.
//! The slice-shaped variants (`Read`, `ReadScalar`, `JoinedSlices`) can write
//! their result directly into the target buffer; every other variant
//! materialises and copies in. Attaching post-indexing to a direct-capable
//! op demotes it to the materialising path.

use shmring::SharedBuffer;

use crate::adapter::DataNode;
use crate::array::{resolve_index, resolve_slice, OwnedArray, ScalarValue};
use crate::dtype::{predict_col, DType};
use crate::error::{Error, Result};

/// One subscript in an indexing chain.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexKey {
    /// A single row (drops axis 0).
    Int(i64),
    /// A slice along axis 0.
    Slice(SliceArg),
    /// Point selection: a list of row indices.
    Coords(Vec<i64>),
    /// Boolean mask along axis 0.
    Mask(Vec<bool>),
    /// Column selection by name.
    Field(String),
    /// `...` — selects everything.
    Ellipsis,
    /// A tuple subscript. Tuples are not lists: downstream indexing is
    /// tuple-sensitive, and the wire format keeps them distinct.
    Tuple(Vec<IndexKey>),
}

/// Slice bounds; `None` members mean "unspecified".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SliceArg {
    pub start: Option<i64>,
    pub stop: Option<i64>,
    pub step: Option<i64>,
}

impl SliceArg {
    pub fn new(start: Option<i64>, stop: Option<i64>, step: Option<i64>) -> Self {
        Self { start, stop, step }
    }

    /// The full slice `:`.
    pub fn full() -> Self {
        Self::default()
    }

    pub fn is_full(&self) -> bool {
        self.start.is_none() && self.stop.is_none() && self.step.is_none()
    }
}

impl From<std::ops::Range<i64>> for SliceArg {
    fn from(r: std::ops::Range<i64>) -> Self {
        Self::new(Some(r.start), Some(r.end), None)
    }
}

impl IndexKey {
    /// `:` or `...` — a subscript that selects everything.
    pub(crate) fn is_trivial(&self) -> bool {
        match self {
            Self::Ellipsis => true,
            Self::Slice(s) => s.is_full(),
            _ => false,
        }
    }
}

/// A tuple whose head is a slice and whose tail is all `:` / `...` reduces
/// to the head slice.
pub(crate) fn as_simple_slice(keys: &[IndexKey]) -> Option<SliceArg> {
    match keys.split_first() {
        Some((IndexKey::Slice(s), rest)) if rest.iter().all(IndexKey::is_trivial) => Some(*s),
        _ => None,
    }
}

/// A serializable description of one read operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// Arbitrary chained subscripts applied to the node.
    Index { path: String, index: Vec<IndexKey> },
    /// Column selection on a table row type.
    Col {
        path: String,
        col: String,
        index: Vec<IndexKey>,
    },
    /// Contiguous slice along axis 0.
    Read {
        path: String,
        col: Option<String>,
        start: Option<i64>,
        stop: Option<i64>,
        step: Option<i64>,
        index: Vec<IndexKey>,
    },
    /// Single-element specialisation of `Read`.
    ReadScalar {
        path: String,
        col: Option<String>,
        idx: i64,
        index: Vec<IndexKey>,
    },
    /// Two slices concatenated along axis 0 (cyclic wrap-around).
    JoinedSlices {
        path: String,
        col: Option<String>,
        start1: i64,
        stop1: i64,
        step1: Option<i64>,
        start2: i64,
        stop2: i64,
        step2: Option<i64>,
        index: Vec<IndexKey>,
    },
    /// Point selection by row index list.
    Coord {
        path: String,
        col: Option<String>,
        coords: Vec<i64>,
        index: Vec<IndexKey>,
    },
    /// Sorted scan over an indexed column.
    Sort {
        path: String,
        sortby: String,
        check_csi: bool,
        col: Option<String>,
        start: Option<i64>,
        stop: Option<i64>,
        step: Option<i64>,
        index: Vec<IndexKey>,
    },
    /// Predicate scan.
    Where {
        path: String,
        condition: String,
        condvars: Vec<(String, ScalarValue)>,
        start: Option<i64>,
        stop: Option<i64>,
        step: Option<i64>,
        index: Vec<IndexKey>,
    },
}

impl Op {
    /// The dataset path this op targets.
    pub fn path(&self) -> &str {
        match self {
            Op::Index { path, .. }
            | Op::Col { path, .. }
            | Op::Read { path, .. }
            | Op::ReadScalar { path, .. }
            | Op::JoinedSlices { path, .. }
            | Op::Coord { path, .. }
            | Op::Sort { path, .. }
            | Op::Where { path, .. } => path,
        }
    }

    pub(crate) fn post_index(&self) -> &[IndexKey] {
        match self {
            Op::Index { index, .. }
            | Op::Col { index, .. }
            | Op::Read { index, .. }
            | Op::ReadScalar { index, .. }
            | Op::JoinedSlices { index, .. }
            | Op::Coord { index, .. }
            | Op::Sort { index, .. }
            | Op::Where { index, .. } => index,
        }
    }

    pub(crate) fn post_index_mut(&mut self) -> &mut Vec<IndexKey> {
        match self {
            Op::Index { index, .. }
            | Op::Col { index, .. }
            | Op::Read { index, .. }
            | Op::ReadScalar { index, .. }
            | Op::JoinedSlices { index, .. }
            | Op::Coord { index, .. }
            | Op::Sort { index, .. }
            | Op::Where { index, .. } => index,
        }
    }

    /// Append a post-indexing subscript, demoting a direct op to the
    /// materialising path.
    pub fn push_index(&mut self, key: IndexKey) {
        self.post_index_mut().push(key);
    }

    /// Can the result be written straight into the target buffer?
    pub fn is_direct(&self) -> bool {
        self.post_index().is_empty()
            && matches!(
                self,
                Op::Read { .. } | Op::ReadScalar { .. } | Op::JoinedSlices { .. }
            )
    }

    /// Predict `(dtype, shape)` for a direct-capable op from dataset
    /// metadata alone. For `ReadScalar` this is the one-row slice shape; the
    /// reported result shape drops the leading axis after the write.
    pub fn predict(&self, dtype: &DType, shape: &[usize]) -> Result<(DType, Vec<usize>)> {
        match self {
            Op::Read {
                col,
                start,
                stop,
                step,
                ..
            } => predict_slice(dtype, shape, col.as_deref(), *start, *stop, *step),
            Op::ReadScalar { col, idx, .. } => {
                predict_slice(dtype, shape, col.as_deref(), Some(*idx), Some(idx + 1), None)
            }
            Op::JoinedSlices {
                col,
                start1,
                stop1,
                step1,
                start2,
                stop2,
                step2,
                ..
            } => {
                let (dtype1, shape1) = predict_slice(
                    dtype,
                    shape,
                    col.as_deref(),
                    Some(*start1),
                    Some(*stop1),
                    *step1,
                )?;
                let (_, shape2) = predict_slice(
                    dtype,
                    shape,
                    col.as_deref(),
                    Some(*start2),
                    Some(*stop2),
                    *step2,
                )?;
                let mut out = shape1;
                out[0] += shape2[0];
                Ok((dtype1, out))
            }
            _ => Err(Error::invalid_op(
                "result shape of this op cannot be predicted from metadata",
            )),
        }
    }

    /// Execute against a live node, leaving the result in `out`'s buffer.
    /// Returns the result `(dtype, shape)` for the completion notification.
    pub(crate) fn execute<N: DataNode>(
        &self,
        node: &mut N,
        out: &ResultSink<'_>,
    ) -> Result<(DType, Vec<usize>)> {
        match self {
            Op::Read {
                col,
                start,
                stop,
                step,
                index,
                ..
            } => {
                if index.is_empty() {
                    let (dtype, shape) = self.predict(node.dtype(), node.shape())?;
                    out.with_view(&dtype, &shape, |dst| {
                        node.read_into(*start, *stop, *step, col.as_deref(), dst)
                    })?;
                    Ok((dtype, shape))
                } else {
                    let base = node.read(*start, *stop, *step, col.as_deref())?;
                    materialize(out, base, index)
                }
            }
            Op::ReadScalar {
                col, idx, index, ..
            } => {
                let (start, stop) = (Some(*idx), Some(idx + 1));
                if index.is_empty() {
                    let (dtype, shape) = self.predict(node.dtype(), node.shape())?;
                    out.with_view(&dtype, &shape, |dst| {
                        node.read_into(start, stop, None, col.as_deref(), dst)
                    })?;
                    // The written slice is one row; the result is that row.
                    Ok((dtype, shape[1..].to_vec()))
                } else {
                    let rows = node.read(start, stop, None, col.as_deref())?;
                    if rows.is_empty() {
                        return Err(Error::invalid_op(format!("scalar index {idx} out of range")));
                    }
                    materialize(out, rows.row_array(0), index)
                }
            }
            Op::JoinedSlices {
                col,
                start1,
                stop1,
                step1,
                start2,
                stop2,
                step2,
                index,
                ..
            } => {
                let col = col.as_deref();
                if index.is_empty() {
                    let (dtype, shape) = self.predict(node.dtype(), node.shape())?;
                    let row_nbytes = dtype.nbytes(&shape[1..]);
                    let (_, _, _, count1) =
                        resolve_slice(node.shape()[0], Some(*start1), Some(*stop1), *step1)?;
                    let split = count1 * row_nbytes;
                    out.with_view(&dtype, &shape, |dst| {
                        node.read_into(Some(*start1), Some(*stop1), *step1, col, &mut dst[..split])?;
                        node.read_into(Some(*start2), Some(*stop2), *step2, col, &mut dst[split..])
                    })?;
                    Ok((dtype, shape))
                } else {
                    let first = node.read(Some(*start1), Some(*stop1), *step1, col)?;
                    let second = node.read(Some(*start2), Some(*stop2), *step2, col)?;
                    materialize(out, first.concat(&second)?, index)
                }
            }
            Op::Index { index, .. } => {
                let Some((head, rest)) = index.split_first() else {
                    return Err(Error::invalid_op("index op carries no subscript"));
                };
                let base = node.index(head)?;
                materialize(out, base, rest)
            }
            Op::Col { col, index, .. } => {
                let base = node.col(col)?;
                materialize(out, base, index)
            }
            Op::Coord {
                col, coords, index, ..
            } => {
                let base = node.read_coordinates(coords, col.as_deref())?;
                materialize(out, base, index)
            }
            Op::Sort {
                sortby,
                check_csi,
                col,
                start,
                stop,
                step,
                index,
                ..
            } => {
                let base = node.read_sorted(
                    sortby,
                    *check_csi,
                    col.as_deref(),
                    *start,
                    *stop,
                    *step,
                )?;
                materialize(out, base, index)
            }
            Op::Where {
                condition,
                condvars,
                start,
                stop,
                step,
                index,
                ..
            } => {
                let base = node.read_where(condition, condvars, *start, *stop, *step)?;
                materialize(out, base, index)
            }
        }
    }
}

fn predict_slice(
    dtype: &DType,
    shape: &[usize],
    col: Option<&str>,
    start: Option<i64>,
    stop: Option<i64>,
    step: Option<i64>,
) -> Result<(DType, Vec<usize>)> {
    let (dtype, shape) = match col {
        Some(name) => predict_col(dtype, shape, name)?,
        None => (dtype.clone(), shape.to_vec()),
    };
    let (_, _, _, count) = resolve_slice(shape[0], start, stop, step)?;
    let mut out = shape;
    out[0] = count;
    Ok((dtype, out))
}

/// Apply remaining subscripts, then copy the result into the target buffer.
fn materialize(
    out: &ResultSink<'_>,
    base: OwnedArray,
    index: &[IndexKey],
) -> Result<(DType, Vec<usize>)> {
    let result = apply_index(base, index)?;
    out.set_to(&result)?;
    Ok((result.dtype().clone(), result.shape().to_vec()))
}

/// Fold a chain of subscripts over an owned array.
pub(crate) fn apply_index(mut arr: OwnedArray, keys: &[IndexKey]) -> Result<OwnedArray> {
    for key in keys {
        arr = apply_key(arr, key)?;
    }
    Ok(arr)
}

fn apply_key(arr: OwnedArray, key: &IndexKey) -> Result<OwnedArray> {
    match key {
        IndexKey::Int(i) => {
            let i = resolve_index(*i, arr.len())?;
            Ok(arr.row_array(i))
        }
        IndexKey::Slice(s) => {
            let (start, _, step, count) = resolve_slice(arr.len(), s.start, s.stop, s.step)?;
            if step == 1 {
                Ok(arr.slice_rows(start, count))
            } else {
                let indices: Vec<usize> = (0..count).map(|k| start + k * step).collect();
                Ok(arr.select_rows(&indices))
            }
        }
        IndexKey::Coords(coords) => {
            let indices = coords
                .iter()
                .map(|&c| resolve_index(c, arr.len()))
                .collect::<Result<Vec<_>>>()?;
            Ok(arr.select_rows(&indices))
        }
        IndexKey::Mask(mask) => arr.filter_rows(mask),
        IndexKey::Field(name) => arr.field(name),
        IndexKey::Ellipsis => Ok(arr),
        IndexKey::Tuple(keys) => match keys.split_first() {
            None => Ok(arr),
            Some((head, rest)) if rest.iter().all(IndexKey::is_trivial) => apply_key(arr, head),
            _ => Err(Error::invalid_op(
                "only the leading element of a tuple subscript may select",
            )),
        },
    }
}

/// Write target for op execution: the shared buffer the request staged.
pub(crate) struct ResultSink<'a> {
    buf: &'a SharedBuffer,
}

impl<'a> ResultSink<'a> {
    pub(crate) fn new(buf: &'a SharedBuffer) -> Self {
        Self { buf }
    }

    /// A typed view over the prefix of the payload sized for the result.
    /// Fails when the result would exceed the stage capacity.
    pub(crate) fn with_view<R>(
        &self,
        dtype: &DType,
        shape: &[usize],
        f: impl FnOnce(&mut [u8]) -> Result<R>,
    ) -> Result<R> {
        let needed = dtype.nbytes(shape);
        let mut guard = self.buf.get_direct()?;
        let capacity = guard.len();
        if capacity < needed {
            return Err(Error::SharedMemory { needed, capacity });
        }
        f(&mut guard.as_mut_slice()[..needed])
    }

    /// Copy a materialised result in.
    pub(crate) fn set_to(&self, value: &OwnedArray) -> Result<()> {
        self.with_view(value.dtype(), value.shape(), |dst| {
            dst.copy_from_slice(value.data());
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::ScalarKind;

    fn arange(rows: usize, cols: usize) -> OwnedArray {
        let values: Vec<i64> = (0..(rows * cols) as i64).collect();
        OwnedArray::from_vec(vec![rows, cols], &values).unwrap()
    }

    #[test]
    fn predict_read_shapes() {
        let op = Op::Read {
            path: "/a".into(),
            col: None,
            start: Some(10),
            stop: Some(20),
            step: None,
            index: vec![],
        };
        let (dtype, shape) = op
            .predict(&DType::scalar(ScalarKind::Int64), &[100, 7])
            .unwrap();
        assert_eq!(dtype, DType::scalar(ScalarKind::Int64));
        assert_eq!(shape, vec![10, 7]);
    }

    #[test]
    fn predict_joined_slices_adds_counts() {
        let op = Op::JoinedSlices {
            path: "/a".into(),
            col: None,
            start1: 90,
            stop1: 100,
            step1: None,
            start2: 0,
            stop2: 35,
            step2: None,
            index: vec![],
        };
        let (_, shape) = op
            .predict(&DType::scalar(ScalarKind::Int64), &[100, 3])
            .unwrap();
        assert_eq!(shape, vec![45, 3]);
    }

    #[test]
    fn direct_flag_demotes_on_post_index() {
        let mut op = Op::Read {
            path: "/a".into(),
            col: None,
            start: None,
            stop: None,
            step: None,
            index: vec![],
        };
        assert!(op.is_direct());
        op.push_index(IndexKey::Int(0));
        assert!(!op.is_direct());
    }

    #[test]
    fn apply_key_tuple_with_trivial_tail() {
        let arr = arange(6, 2);
        let key = IndexKey::Tuple(vec![
            IndexKey::Slice(SliceArg::from(1..3)),
            IndexKey::Slice(SliceArg::full()),
        ]);
        let out = apply_key(arr, &key).unwrap();
        assert_eq!(out.shape(), &[2, 2]);
        assert_eq!(out.to_vec::<i64>().unwrap(), vec![2, 3, 4, 5]);

        let arr = arange(6, 2);
        let bad = IndexKey::Tuple(vec![
            IndexKey::Slice(SliceArg::from(1..3)),
            IndexKey::Int(0),
        ]);
        assert!(apply_key(arr, &bad).is_err());
    }

    #[test]
    fn apply_index_chains() {
        let arr = arange(8, 2);
        let keys = [
            IndexKey::Slice(SliceArg::from(2..8)),
            IndexKey::Coords(vec![0, 2, 4]),
            IndexKey::Int(1),
        ];
        let out = apply_index(arr, &keys).unwrap();
        assert_eq!(out.shape(), &[2]);
        assert_eq!(out.to_vec::<i64>().unwrap(), vec![8, 9]);
    }

    #[test]
    fn sink_rejects_oversize_results() {
        let buf = SharedBuffer::create(16).unwrap();
        let sink = ResultSink::new(&buf);
        let arr = arange(4, 4); // 128 bytes
        let err = sink.set_to(&arr).unwrap_err();
        assert!(err.is_shared_memory());

        let small = OwnedArray::from_vec(vec![2], &[1i64, 2]).unwrap();
        sink.set_to(&small).unwrap();
        let guard = buf.get_direct().unwrap();
        assert_eq!(&guard.as_slice()[..8], &1i64.to_ne_bytes());
    }
}
