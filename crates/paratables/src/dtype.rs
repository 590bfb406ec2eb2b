//! Element types for dataset payloads.
//!
//! A [`DType`] is either a scalar element or a compound row type (named,
//! optionally shaped fields), mirroring the type model of the columnar
//! containers this engine reads. Descriptor strings follow the conventional
//! `<i8` / `|u1` notation so they survive the wire unambiguously.

use crate::error::{Error, Result};

/// Scalar element kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarKind {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
}

impl ScalarKind {
    /// Size of one element in bytes.
    #[inline]
    pub fn itemsize(self) -> usize {
        match self {
            Self::Bool | Self::Int8 | Self::UInt8 => 1,
            Self::Int16 | Self::UInt16 => 2,
            Self::Int32 | Self::UInt32 | Self::Float32 => 4,
            Self::Int64 | Self::UInt64 | Self::Float64 => 8,
        }
    }

    /// Descriptor string, e.g. `<i8` for a little-endian 8-byte integer.
    pub fn descr(self) -> &'static str {
        match self {
            Self::Bool => "|b1",
            Self::Int8 => "|i1",
            Self::Int16 => "<i2",
            Self::Int32 => "<i4",
            Self::Int64 => "<i8",
            Self::UInt8 => "|u1",
            Self::UInt16 => "<u2",
            Self::UInt32 => "<u4",
            Self::UInt64 => "<u8",
            Self::Float32 => "<f4",
            Self::Float64 => "<f8",
        }
    }

    /// Parse a descriptor string. The byte-order prefix is optional.
    pub fn from_descr(s: &str) -> Result<Self> {
        let body = s.strip_prefix(['<', '|', '=']).unwrap_or(s);
        Ok(match body {
            "b1" => Self::Bool,
            "i1" => Self::Int8,
            "i2" => Self::Int16,
            "i4" => Self::Int32,
            "i8" => Self::Int64,
            "u1" => Self::UInt8,
            "u2" => Self::UInt16,
            "u4" => Self::UInt32,
            "u8" => Self::UInt64,
            "f4" => Self::Float32,
            "f8" => Self::Float64,
            _ => return Err(Error::adapter(format!("unknown dtype descriptor '{s}'"))),
        })
    }
}

/// One field of a compound row type. The field may itself carry a shape
/// (a fixed-size inner array per row).
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub dtype: DType,
    pub shape: Vec<usize>,
}

impl Field {
    /// Bytes this field occupies within one row.
    pub fn nbytes(&self) -> usize {
        self.dtype.itemsize() * self.shape.iter().product::<usize>()
    }
}

/// Element type of a dataset: a scalar, or a compound row of named fields.
#[derive(Debug, Clone, PartialEq)]
pub enum DType {
    Scalar(ScalarKind),
    Compound(Vec<Field>),
}

impl DType {
    pub fn scalar(kind: ScalarKind) -> Self {
        Self::Scalar(kind)
    }

    /// Bytes occupied by one element (for compound types, one row).
    pub fn itemsize(&self) -> usize {
        match self {
            Self::Scalar(kind) => kind.itemsize(),
            Self::Compound(fields) => fields.iter().map(Field::nbytes).sum(),
        }
    }

    /// Total bytes of an array of this dtype with the given shape.
    pub fn nbytes(&self, shape: &[usize]) -> usize {
        self.itemsize() * shape.iter().product::<usize>()
    }

    /// The scalar kind, when this is a scalar type.
    pub fn as_scalar(&self) -> Option<ScalarKind> {
        match self {
            Self::Scalar(kind) => Some(*kind),
            Self::Compound(_) => None,
        }
    }

    pub fn is_compound(&self) -> bool {
        matches!(self, Self::Compound(_))
    }

    /// Look up a field: its dtype, per-row shape, and byte offset within
    /// a row.
    pub fn field(&self, name: &str) -> Result<FieldRef<'_>> {
        let Self::Compound(fields) = self else {
            return Err(Error::invalid_op(format!(
                "column access '{name}' on a non-compound dtype"
            )));
        };
        let mut offset = 0;
        for field in fields {
            if field.name == name {
                return Ok(FieldRef {
                    dtype: &field.dtype,
                    shape: &field.shape,
                    offset,
                    nbytes: field.nbytes(),
                });
            }
            offset += field.nbytes();
        }
        Err(Error::MissingColumn {
            name: name.to_owned(),
        })
    }
}

impl From<ScalarKind> for DType {
    fn from(kind: ScalarKind) -> Self {
        Self::Scalar(kind)
    }
}

/// Resolved location of a field within a compound row.
#[derive(Debug, Clone, Copy)]
pub struct FieldRef<'a> {
    pub dtype: &'a DType,
    pub shape: &'a [usize],
    /// Byte offset of the field within one row.
    pub offset: usize,
    /// Bytes the field occupies within one row.
    pub nbytes: usize,
}

/// Predict the dtype and shape of a column selection: the outer dims stay,
/// the field's per-row shape is appended.
pub(crate) fn predict_col(dtype: &DType, shape: &[usize], name: &str) -> Result<(DType, Vec<usize>)> {
    let field = dtype.field(name)?;
    let mut out = shape.to_vec();
    out.extend_from_slice(field.shape);
    Ok((field.dtype.clone(), out))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row_type() -> DType {
        DType::Compound(vec![
            Field {
                name: "a".into(),
                dtype: ScalarKind::UInt8.into(),
                shape: vec![4, 2],
            },
            Field {
                name: "b".into(),
                dtype: ScalarKind::Float64.into(),
                shape: vec![],
            },
        ])
    }

    #[test]
    fn itemsize_sums_fields() {
        assert_eq!(row_type().itemsize(), 4 * 2 + 8);
        assert_eq!(DType::scalar(ScalarKind::Int64).nbytes(&[3, 4]), 8 * 12);
    }

    #[test]
    fn field_offsets() {
        let row = row_type();
        let b = row.field("b").unwrap();
        assert_eq!(b.offset, 8);
        assert_eq!(b.nbytes, 8);
        assert!(matches!(
            row.field("missing"),
            Err(Error::MissingColumn { .. })
        ));
    }

    #[test]
    fn descr_round_trip() {
        for kind in [
            ScalarKind::Bool,
            ScalarKind::Int8,
            ScalarKind::Int16,
            ScalarKind::Int32,
            ScalarKind::Int64,
            ScalarKind::UInt8,
            ScalarKind::UInt16,
            ScalarKind::UInt32,
            ScalarKind::UInt64,
            ScalarKind::Float32,
            ScalarKind::Float64,
        ] {
            assert_eq!(ScalarKind::from_descr(kind.descr()).unwrap(), kind);
        }
    }

    #[test]
    fn predict_col_appends_field_shape() {
        let (dtype, shape) = predict_col(&row_type(), &[10], "a").unwrap();
        assert_eq!(dtype, DType::scalar(ScalarKind::UInt8));
        assert_eq!(shape, vec![10, 4, 2]);
    }
}
