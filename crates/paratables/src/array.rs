//! Owned arrays and scoped typed views over staged payload bytes.
//!
//! Results live in shared memory, where the payload begins one byte into the
//! mapping (after the liveness flag). Typed element access therefore never
//! assumes alignment: every scalar read/write goes through an explicit byte
//! copy. [`OwnedArray`] is the aligned, owned counterpart produced by
//! `copy()`-style accessors.

use crate::dtype::{DType, ScalarKind};
use crate::error::{Error, Result};

mod sealed {
    pub trait Sealed {}
}

/// Plain-old-data element types that can be read out of payload bytes.
pub trait Element: sealed::Sealed + Copy + PartialEq + std::fmt::Debug {
    /// The scalar kind this element corresponds to.
    const KIND: ScalarKind;

    /// Decode one element from exactly `size_of::<Self>()` bytes.
    fn read(bytes: &[u8]) -> Self;

    /// Encode into exactly `size_of::<Self>()` bytes.
    fn write(self, out: &mut [u8]);
}

macro_rules! impl_element {
    ($($ty:ty => $kind:ident),* $(,)?) => {
        $(
            impl sealed::Sealed for $ty {}
            impl Element for $ty {
                const KIND: ScalarKind = ScalarKind::$kind;

                #[inline]
                fn read(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(bytes);
                    <$ty>::from_ne_bytes(raw)
                }

                #[inline]
                fn write(self, out: &mut [u8]) {
                    out.copy_from_slice(&self.to_ne_bytes());
                }
            }
        )*
    };
}

impl_element! {
    i8 => Int8, i16 => Int16, i32 => Int32, i64 => Int64,
    u8 => UInt8, u16 => UInt16, u32 => UInt32, u64 => UInt64,
    f32 => Float32, f64 => Float64,
}

impl sealed::Sealed for bool {}
impl Element for bool {
    const KIND: ScalarKind = ScalarKind::Bool;

    #[inline]
    fn read(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }

    #[inline]
    fn write(self, out: &mut [u8]) {
        out[0] = u8::from(self);
    }
}

/// A typed scalar that remembers its exact kind. Used for wire scalars and
/// predicate variables, where the dtype character must survive a round trip.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScalarValue {
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
}

impl ScalarValue {
    pub fn kind(&self) -> ScalarKind {
        match self {
            Self::Bool(_) => ScalarKind::Bool,
            Self::Int8(_) => ScalarKind::Int8,
            Self::Int16(_) => ScalarKind::Int16,
            Self::Int32(_) => ScalarKind::Int32,
            Self::Int64(_) => ScalarKind::Int64,
            Self::UInt8(_) => ScalarKind::UInt8,
            Self::UInt16(_) => ScalarKind::UInt16,
            Self::UInt32(_) => ScalarKind::UInt32,
            Self::UInt64(_) => ScalarKind::UInt64,
            Self::Float32(_) => ScalarKind::Float32,
            Self::Float64(_) => ScalarKind::Float64,
        }
    }

    /// Numeric value widened to f64 (used by predicate evaluation).
    pub fn as_f64(&self) -> f64 {
        match *self {
            Self::Bool(v) => f64::from(u8::from(v)),
            Self::Int8(v) => f64::from(v),
            Self::Int16(v) => f64::from(v),
            Self::Int32(v) => f64::from(v),
            Self::Int64(v) => v as f64,
            Self::UInt8(v) => f64::from(v),
            Self::UInt16(v) => f64::from(v),
            Self::UInt32(v) => f64::from(v),
            Self::UInt64(v) => v as f64,
            Self::Float32(v) => f64::from(v),
            Self::Float64(v) => v,
        }
    }

    pub(crate) fn to_raw(self) -> Vec<u8> {
        let mut out = vec![0u8; self.kind().itemsize()];
        match self {
            Self::Bool(v) => v.write(&mut out),
            Self::Int8(v) => v.write(&mut out),
            Self::Int16(v) => v.write(&mut out),
            Self::Int32(v) => v.write(&mut out),
            Self::Int64(v) => v.write(&mut out),
            Self::UInt8(v) => v.write(&mut out),
            Self::UInt16(v) => v.write(&mut out),
            Self::UInt32(v) => v.write(&mut out),
            Self::UInt64(v) => v.write(&mut out),
            Self::Float32(v) => v.write(&mut out),
            Self::Float64(v) => v.write(&mut out),
        }
        out
    }

    pub(crate) fn from_raw(kind: ScalarKind, bytes: &[u8]) -> Self {
        match kind {
            ScalarKind::Bool => Self::Bool(bool::read(bytes)),
            ScalarKind::Int8 => Self::Int8(i8::read(bytes)),
            ScalarKind::Int16 => Self::Int16(i16::read(bytes)),
            ScalarKind::Int32 => Self::Int32(i32::read(bytes)),
            ScalarKind::Int64 => Self::Int64(i64::read(bytes)),
            ScalarKind::UInt8 => Self::UInt8(u8::read(bytes)),
            ScalarKind::UInt16 => Self::UInt16(u16::read(bytes)),
            ScalarKind::UInt32 => Self::UInt32(u32::read(bytes)),
            ScalarKind::UInt64 => Self::UInt64(u64::read(bytes)),
            ScalarKind::Float32 => Self::Float32(f32::read(bytes)),
            ScalarKind::Float64 => Self::Float64(f64::read(bytes)),
        }
    }
}

/// Resolve a possibly-negative index against an axis length.
pub(crate) fn resolve_index(idx: i64, len: usize) -> Result<usize> {
    let resolved = if idx < 0 { idx + len as i64 } else { idx };
    if resolved < 0 || resolved as usize >= len {
        return Err(Error::invalid_op(format!(
            "index {idx} out of bounds for axis of length {len}"
        )));
    }
    Ok(resolved as usize)
}

/// Resolve `(start, stop, step)` the way sequence slicing does (positive
/// steps only): negatives count from the end, bounds clamp, and the result
/// is `(start, stop, step, count)`.
pub(crate) fn resolve_slice(
    len: usize,
    start: Option<i64>,
    stop: Option<i64>,
    step: Option<i64>,
) -> Result<(usize, usize, usize, usize)> {
    let step = step.unwrap_or(1);
    if step <= 0 {
        return Err(Error::invalid_op(format!("slice step must be positive, got {step}")));
    }
    let step = step as usize;
    let clamp = |v: i64| -> usize {
        let v = if v < 0 { v + len as i64 } else { v };
        v.clamp(0, len as i64) as usize
    };
    let start = clamp(start.unwrap_or(0));
    let stop = clamp(stop.unwrap_or(len as i64));
    let count = if stop > start {
        (stop - start).div_ceil(step)
    } else {
        0
    };
    Ok((start, stop, step, count))
}

/// An owned, aligned array: dtype, shape, and row-major bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct OwnedArray {
    dtype: DType,
    shape: Vec<usize>,
    data: Vec<u8>,
}

impl OwnedArray {
    /// A zero-filled array.
    pub fn zeroed(dtype: DType, shape: Vec<usize>) -> Self {
        let nbytes = dtype.nbytes(&shape);
        Self {
            dtype,
            shape,
            data: vec![0; nbytes],
        }
    }

    /// Wrap raw bytes; the byte count must match the dtype and shape.
    pub fn from_bytes(dtype: DType, shape: Vec<usize>, data: Vec<u8>) -> Result<Self> {
        let expect = dtype.nbytes(&shape);
        if data.len() != expect {
            return Err(Error::invalid_op(format!(
                "array data is {} bytes, dtype and shape require {expect}",
                data.len()
            )));
        }
        Ok(Self { dtype, shape, data })
    }

    /// Build a typed array from a vector of elements.
    pub fn from_vec<T: Element>(shape: Vec<usize>, values: &[T]) -> Result<Self> {
        let count: usize = shape.iter().product();
        if values.len() != count {
            return Err(Error::invalid_op(format!(
                "{} values for shape requiring {count}",
                values.len()
            )));
        }
        let itemsize = T::KIND.itemsize();
        let mut data = vec![0u8; count * itemsize];
        for (chunk, v) in data.chunks_exact_mut(itemsize).zip(values) {
            v.write(chunk);
        }
        Ok(Self {
            dtype: DType::scalar(T::KIND),
            shape,
            data,
        })
    }

    #[inline]
    pub fn dtype(&self) -> &DType {
        &self.dtype
    }

    #[inline]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    #[inline]
    pub fn nbytes(&self) -> usize {
        self.data.len()
    }

    /// Length along axis 0. A zero-dimensional array has no rows.
    pub fn len(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes of one row (everything below axis 0).
    pub fn row_nbytes(&self) -> usize {
        match self.shape.split_first() {
            Some((_, inner)) => self.dtype.nbytes(inner),
            None => self.dtype.itemsize(),
        }
    }

    /// Raw bytes of row `i`.
    pub fn row(&self, i: usize) -> &[u8] {
        let rn = self.row_nbytes();
        &self.data[i * rn..(i + 1) * rn]
    }

    /// Row `i` as its own array of shape `shape[1..]`.
    pub fn row_array(&self, i: usize) -> Self {
        Self {
            dtype: self.dtype.clone(),
            shape: self.shape[1..].to_vec(),
            data: self.row(i).to_vec(),
        }
    }

    /// Iterate rows as arrays of shape `shape[1..]`.
    pub fn rows(&self) -> impl Iterator<Item = Self> + '_ {
        (0..self.len()).map(|i| self.row_array(i))
    }

    /// Contiguous row range `[start, start+count)`.
    pub fn slice_rows(&self, start: usize, count: usize) -> Self {
        let rn = self.row_nbytes();
        let mut shape = self.shape.clone();
        shape[0] = count;
        Self {
            dtype: self.dtype.clone(),
            shape,
            data: self.data[start * rn..(start + count) * rn].to_vec(),
        }
    }

    /// Gather rows by index (already resolved, in gather order).
    pub fn select_rows(&self, indices: &[usize]) -> Self {
        let rn = self.row_nbytes();
        let mut data = Vec::with_capacity(indices.len() * rn);
        for &i in indices {
            data.extend_from_slice(self.row(i));
        }
        let mut shape = self.shape.clone();
        shape[0] = indices.len();
        Self {
            dtype: self.dtype.clone(),
            shape,
            data,
        }
    }

    /// Keep the rows whose mask entry is true.
    pub fn filter_rows(&self, mask: &[bool]) -> Result<Self> {
        if mask.len() != self.len() {
            return Err(Error::invalid_op(format!(
                "boolean mask of length {} against axis of length {}",
                mask.len(),
                self.len()
            )));
        }
        let keep: Vec<usize> = mask
            .iter()
            .enumerate()
            .filter_map(|(i, &m)| m.then_some(i))
            .collect();
        Ok(self.select_rows(&keep))
    }

    /// Concatenate along axis 0. Shapes below axis 0 must agree.
    pub fn concat(&self, other: &Self) -> Result<Self> {
        if self.dtype != other.dtype || self.shape.get(1..) != other.shape.get(1..) {
            return Err(Error::invalid_op(
                "cannot concatenate arrays of mismatched dtype or inner shape",
            ));
        }
        let mut shape = self.shape.clone();
        shape[0] = self.len() + other.len();
        let mut data = self.data.clone();
        data.extend_from_slice(&other.data);
        Ok(Self {
            dtype: self.dtype.clone(),
            shape,
            data,
        })
    }

    /// Extract a named field of a compound array. The field's per-row shape
    /// is appended to the outer shape.
    pub fn field(&self, name: &str) -> Result<Self> {
        let fref = self.dtype.field(name)?;
        let itemsize = self.dtype.itemsize();
        let count: usize = self.shape.iter().product();
        let mut data = Vec::with_capacity(count * fref.nbytes);
        for i in 0..count {
            let base = i * itemsize + fref.offset;
            data.extend_from_slice(&self.data[base..base + fref.nbytes]);
        }
        let mut shape = self.shape.clone();
        shape.extend_from_slice(fref.shape);
        Ok(Self {
            dtype: fref.dtype.clone(),
            shape,
            data,
        })
    }

    /// Copy out as a typed vector. The dtype must match `T` exactly.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        if self.dtype.as_scalar() != Some(T::KIND) {
            return Err(Error::invalid_op(format!(
                "typed copy of {:?} array as {:?}",
                self.dtype,
                T::KIND
            )));
        }
        let itemsize = T::KIND.itemsize();
        Ok(self.data.chunks_exact(itemsize).map(T::read).collect())
    }

    /// Copy out as f64s, whatever the scalar kind. Used by sorted and
    /// predicate scans, which compare values numerically.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        let Some(kind) = self.dtype.as_scalar() else {
            return Err(Error::invalid_op("numeric copy of a compound array"));
        };
        let itemsize = kind.itemsize();
        Ok(self
            .data
            .chunks_exact(itemsize)
            .map(|chunk| ScalarValue::from_raw(kind, chunk).as_f64())
            .collect())
    }

    /// Element at a flat (row-major) position.
    pub fn scalar_at<T: Element>(&self, flat: usize) -> Result<T> {
        if self.dtype.as_scalar() != Some(T::KIND) {
            return Err(Error::invalid_op("typed access with mismatched element type"));
        }
        let itemsize = T::KIND.itemsize();
        let offset = flat * itemsize;
        if offset + itemsize > self.data.len() {
            return Err(Error::invalid_op(format!("flat index {flat} out of bounds")));
        }
        Ok(T::read(&self.data[offset..offset + itemsize]))
    }
}

/// A borrowed typed view over payload bytes, shaped to a result.
///
/// Views are handed out scoped (inside an accessor) because the bytes belong
/// to a stage that will be reused for the next request.
pub struct ArrayView<'a> {
    dtype: &'a DType,
    shape: &'a [usize],
    bytes: &'a [u8],
}

impl<'a> ArrayView<'a> {
    pub(crate) fn new(dtype: &'a DType, shape: &'a [usize], bytes: &'a [u8]) -> Self {
        debug_assert_eq!(dtype.nbytes(shape), bytes.len());
        Self { dtype, shape, bytes }
    }

    #[inline]
    pub fn dtype(&self) -> &DType {
        self.dtype
    }

    #[inline]
    pub fn shape(&self) -> &[usize] {
        self.shape
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        self.bytes
    }

    /// Element at a flat position, read unaligned out of the payload.
    pub fn scalar_at<T: Element>(&self, flat: usize) -> Result<T> {
        if self.dtype.as_scalar() != Some(T::KIND) {
            return Err(Error::invalid_op("typed access with mismatched element type"));
        }
        let itemsize = T::KIND.itemsize();
        let offset = flat * itemsize;
        if offset + itemsize > self.bytes.len() {
            return Err(Error::invalid_op(format!("flat index {flat} out of bounds")));
        }
        Ok(T::read(&self.bytes[offset..offset + itemsize]))
    }

    /// An owned, aligned copy of the viewed data.
    pub fn to_owned_array(&self) -> OwnedArray {
        OwnedArray {
            dtype: self.dtype.clone(),
            shape: self.shape.to_vec(),
            data: self.bytes.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::Field;

    fn arange(rows: usize, cols: usize) -> OwnedArray {
        let values: Vec<i64> = (0..(rows * cols) as i64).collect();
        OwnedArray::from_vec(vec![rows, cols], &values).unwrap()
    }

    #[test]
    fn rows_and_slices() {
        let a = arange(4, 3);
        assert_eq!(a.row_nbytes(), 24);
        let r1 = a.row_array(1);
        assert_eq!(r1.to_vec::<i64>().unwrap(), vec![3, 4, 5]);
        let s = a.slice_rows(1, 2);
        assert_eq!(s.shape(), &[2, 3]);
        assert_eq!(s.to_vec::<i64>().unwrap(), vec![3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn select_and_filter() {
        let a = arange(4, 2);
        let picked = a.select_rows(&[3, 0]);
        assert_eq!(picked.to_vec::<i64>().unwrap(), vec![6, 7, 0, 1]);
        let filtered = a.filter_rows(&[true, false, false, true]).unwrap();
        assert_eq!(filtered.to_vec::<i64>().unwrap(), vec![0, 1, 6, 7]);
        assert!(a.filter_rows(&[true]).is_err());
    }

    #[test]
    fn concat_checks_inner_shape() {
        let a = arange(2, 3);
        let b = arange(1, 3);
        let joined = a.concat(&b).unwrap();
        assert_eq!(joined.shape(), &[3, 3]);
        let c = arange(1, 4);
        assert!(a.concat(&c).is_err());
    }

    #[test]
    fn field_extraction() {
        let dtype = DType::Compound(vec![
            Field {
                name: "x".into(),
                dtype: ScalarKind::Int64.into(),
                shape: vec![],
            },
            Field {
                name: "y".into(),
                dtype: ScalarKind::UInt8.into(),
                shape: vec![2],
            },
        ]);
        // Two rows: (1, [10, 11]), (2, [20, 21])
        let mut data = Vec::new();
        for (x, y) in [(1i64, [10u8, 11]), (2, [20, 21])] {
            data.extend_from_slice(&x.to_ne_bytes());
            data.extend_from_slice(&y);
        }
        let a = OwnedArray::from_bytes(dtype, vec![2], data).unwrap();
        assert_eq!(a.field("x").unwrap().to_vec::<i64>().unwrap(), vec![1, 2]);
        let y = a.field("y").unwrap();
        assert_eq!(y.shape(), &[2, 2]);
        assert_eq!(y.to_vec::<u8>().unwrap(), vec![10, 11, 20, 21]);
    }

    #[test]
    fn slice_resolution_matches_sequence_semantics() {
        assert_eq!(resolve_slice(10, None, None, None).unwrap(), (0, 10, 1, 10));
        assert_eq!(resolve_slice(10, Some(-3), None, None).unwrap(), (7, 10, 1, 3));
        assert_eq!(resolve_slice(10, Some(2), Some(100), None).unwrap(), (2, 10, 1, 8));
        assert_eq!(resolve_slice(10, Some(0), Some(10), Some(3)).unwrap(), (0, 10, 3, 4));
        assert_eq!(resolve_slice(10, Some(8), Some(4), None).unwrap().3, 0);
        assert!(resolve_slice(10, None, None, Some(0)).is_err());
    }

    #[test]
    fn view_reads_unaligned_payloads() {
        let dtype = DType::scalar(ScalarKind::Int64);
        let shape = [2usize];
        // Deliberately misaligned window into a byte buffer.
        let mut backing = vec![0u8; 17];
        backing[1..9].copy_from_slice(&42i64.to_ne_bytes());
        backing[9..17].copy_from_slice(&(-7i64).to_ne_bytes());
        let view = ArrayView::new(&dtype, &shape, &backing[1..17]);
        assert_eq!(view.scalar_at::<i64>(0).unwrap(), 42);
        assert_eq!(view.scalar_at::<i64>(1).unwrap(), -7);
        assert_eq!(view.to_owned_array().to_vec::<i64>().unwrap(), vec![42, -7]);
    }
}
