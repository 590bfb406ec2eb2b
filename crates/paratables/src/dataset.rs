//! Dataset proxies and op builders.
//!
//! A [`Dataset`] carries the probed metadata of one node (dtype, shape,
//! table-ness) and turns subscripts into [`Op`]s. The builder applies the
//! fusion rules: a column selection followed by a scalar, slice, or
//! coordinate subscript collapses into the specialised read op, and a
//! column name applied to an unbound read rebinds its column. Anything else
//! chains on as post-indexing and rides the materialising path.

use std::time::Duration;

use crate::array::ScalarValue;
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::ops::{as_simple_slice, IndexKey, Op, SliceArg};
use crate::stage::{Stage, StagePool};

/// Proxy over one dataset of the container.
#[derive(Debug, Clone)]
pub struct Dataset {
    path: String,
    dtype: DType,
    shape: Vec<usize>,
    table: bool,
}

impl Dataset {
    pub(crate) fn new(path: &str, dtype: DType, shape: Vec<usize>, table: bool) -> Self {
        Self {
            path: path.to_owned(),
            dtype,
            shape,
            table,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn dtype(&self) -> &DType {
        &self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn is_table(&self) -> bool {
        self.table
    }

    /// Rows along axis 0.
    pub fn len(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Complete a partial shape with this dataset's own dimensions:
    /// missing or negative entries take the dataset's size on that axis.
    fn fill_shape(&self, partial: &[i64]) -> Vec<usize> {
        let mut filled: Vec<i64> = partial.to_vec();
        while filled.len() < self.shape.len() {
            filled.push(-1);
        }
        filled
            .iter()
            .enumerate()
            .map(|(axis, &dim)| {
                if dim < 0 {
                    self.shape.get(axis).copied().unwrap_or(1)
                } else {
                    dim as usize
                }
            })
            .collect()
    }

    /// A stage sized for results of the given (possibly partial) shape.
    pub fn create_stage(&self, shape: &[i64]) -> Result<Stage> {
        Stage::new(self.dtype.nbytes(&self.fill_shape(shape)))
    }

    /// A stage sized by element count rather than shape.
    pub fn create_stage_natoms(&self, natoms: usize) -> Result<Stage> {
        Stage::new(self.dtype.itemsize() * natoms)
    }

    /// A pool of `count` stages, each sized for the given shape.
    pub fn create_stage_pool(
        &self,
        shape: &[i64],
        count: usize,
        timeout: Option<Duration>,
    ) -> Result<StagePool> {
        StagePool::new(self.dtype.nbytes(&self.fill_shape(shape)), count, timeout)
    }

    /// Column selection (table nodes).
    pub fn col(&self, name: &str) -> OpBuilder {
        OpBuilder {
            op: Op::Col {
                path: self.path.clone(),
                col: name.to_owned(),
                index: vec![],
            },
        }
    }

    /// Contiguous slice read.
    pub fn read(
        &self,
        start: Option<i64>,
        stop: Option<i64>,
        step: Option<i64>,
    ) -> OpBuilder {
        OpBuilder {
            op: Op::Read {
                path: self.path.clone(),
                col: None,
                start,
                stop,
                step,
                index: vec![],
            },
        }
    }

    /// Point selection.
    pub fn read_coordinates(&self, coords: &[i64]) -> OpBuilder {
        OpBuilder {
            op: Op::Coord {
                path: self.path.clone(),
                col: None,
                coords: coords.to_vec(),
                index: vec![],
            },
        }
    }

    /// Sorted scan over an indexed column.
    pub fn read_sorted(
        &self,
        sortby: &str,
        check_csi: bool,
        start: Option<i64>,
        stop: Option<i64>,
        step: Option<i64>,
    ) -> OpBuilder {
        OpBuilder {
            op: Op::Sort {
                path: self.path.clone(),
                sortby: sortby.to_owned(),
                check_csi,
                col: None,
                start,
                stop,
                step,
                index: vec![],
            },
        }
    }

    /// Predicate scan.
    pub fn where_(
        &self,
        condition: &str,
        condvars: &[(&str, ScalarValue)],
        start: Option<i64>,
        stop: Option<i64>,
        step: Option<i64>,
    ) -> OpBuilder {
        OpBuilder {
            op: Op::Where {
                path: self.path.clone(),
                condition: condition.to_owned(),
                condvars: condvars
                    .iter()
                    .map(|(name, value)| ((*name).to_owned(), *value))
                    .collect(),
                start,
                stop,
                step,
                index: vec![],
            },
        }
    }

    /// Subscript the dataset, fusing into the specialised op where possible.
    pub fn index(&self, key: IndexKey) -> Result<OpBuilder> {
        let op = match key {
            IndexKey::Ellipsis => {
                return Err(Error::invalid_op("a bare ellipsis subscript is not supported"))
            }
            IndexKey::Field(name) if self.table => return Ok(self.col(&name)),
            IndexKey::Int(idx) => Op::ReadScalar {
                path: self.path.clone(),
                col: None,
                idx,
                index: vec![],
            },
            IndexKey::Slice(s) => Op::Read {
                path: self.path.clone(),
                col: None,
                start: s.start,
                stop: s.stop,
                step: s.step,
                index: vec![],
            },
            IndexKey::Tuple(ref keys) if as_simple_slice(keys).is_some() => {
                let s = as_simple_slice(keys).unwrap();
                Op::Read {
                    path: self.path.clone(),
                    col: None,
                    start: s.start,
                    stop: s.stop,
                    step: s.step,
                    index: vec![],
                }
            }
            IndexKey::Coords(coords) if self.table => Op::Coord {
                path: self.path.clone(),
                col: None,
                coords,
                index: vec![],
            },
            other => Op::Index {
                path: self.path.clone(),
                index: vec![other],
            },
        };
        Ok(OpBuilder { op })
    }

    /// `dataset[start..stop]`.
    pub fn slice(&self, range: std::ops::Range<i64>) -> OpBuilder {
        self.read(Some(range.start), Some(range.end), None)
    }

    /// `dataset[i]`.
    pub fn row(&self, idx: i64) -> OpBuilder {
        OpBuilder {
            op: Op::ReadScalar {
                path: self.path.clone(),
                col: None,
                idx,
                index: vec![],
            },
        }
    }
}

/// Chains subscripts onto an op, applying the fusion rules.
#[derive(Debug, Clone)]
pub struct OpBuilder {
    op: Op,
}

impl OpBuilder {
    /// Apply one more subscript.
    pub fn index(mut self, key: IndexKey) -> Self {
        self.op = fuse(self.op, key);
        self
    }

    /// Select a column or field by name.
    pub fn field(self, name: &str) -> Self {
        self.index(IndexKey::Field(name.to_owned()))
    }

    /// Slice along axis 0.
    pub fn slice(self, range: std::ops::Range<i64>) -> Self {
        self.index(IndexKey::Slice(SliceArg::from(range)))
    }

    /// Select one row.
    pub fn row(self, idx: i64) -> Self {
        self.index(IndexKey::Int(idx))
    }

    /// Point selection.
    pub fn coords(self, coords: &[i64]) -> Self {
        self.index(IndexKey::Coords(coords.to_vec()))
    }

    /// The finished op.
    pub fn build(self) -> Op {
        self.op
    }
}

impl From<OpBuilder> for Op {
    fn from(builder: OpBuilder) -> Self {
        builder.op
    }
}

/// The fusion rules. Specialisations only fire on an op with no post-index
/// chain yet; once an op has been demoted, further keys just append.
fn fuse(op: Op, key: IndexKey) -> Op {
    match (op, key) {
        // Column selection followed by a scalar, slice, or coordinate
        // subscript becomes the specialised read.
        (Op::Col { path, col, index }, IndexKey::Int(idx)) if index.is_empty() => Op::ReadScalar {
            path,
            col: Some(col),
            idx,
            index,
        },
        (Op::Col { path, col, index }, IndexKey::Slice(s)) if index.is_empty() => Op::Read {
            path,
            col: Some(col),
            start: s.start,
            stop: s.stop,
            step: s.step,
            index,
        },
        (Op::Col { path, col, index }, IndexKey::Tuple(keys))
            if index.is_empty() && as_simple_slice(&keys).is_some() =>
        {
            let s = as_simple_slice(&keys).unwrap();
            Op::Read {
                path,
                col: Some(col),
                start: s.start,
                stop: s.stop,
                step: s.step,
                index,
            }
        }
        (Op::Col { path, col, index }, IndexKey::Coords(coords)) if index.is_empty() => Op::Coord {
            path,
            col: Some(col),
            coords,
            index,
        },

        // A field name applied to an op with no bound column rebinds it.
        (
            Op::Read {
                path,
                col: None,
                start,
                stop,
                step,
                index,
            },
            IndexKey::Field(name),
        ) if index.is_empty() => Op::Read {
            path,
            col: Some(name),
            start,
            stop,
            step,
            index,
        },
        (
            Op::ReadScalar {
                path,
                col: None,
                idx,
                index,
            },
            IndexKey::Field(name),
        ) if index.is_empty() => Op::ReadScalar {
            path,
            col: Some(name),
            idx,
            index,
        },
        (
            Op::Coord {
                path,
                col: None,
                coords,
                index,
            },
            IndexKey::Field(name),
        ) if index.is_empty() => Op::Coord {
            path,
            col: Some(name),
            coords,
            index,
        },
        (
            Op::Sort {
                path,
                sortby,
                check_csi,
                col: None,
                start,
                stop,
                step,
                index,
            },
            IndexKey::Field(name),
        ) if index.is_empty() => Op::Sort {
            path,
            sortby,
            check_csi,
            col: Some(name),
            start,
            stop,
            step,
            index,
        },

        // Everything else chains on as post-indexing.
        (mut op, key) => {
            op.push_index(key);
            op
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::{Field, ScalarKind};

    fn table() -> Dataset {
        Dataset::new(
            "/t",
            DType::Compound(vec![
                Field {
                    name: "A".into(),
                    dtype: ScalarKind::Int64.into(),
                    shape: vec![],
                },
                Field {
                    name: "B".into(),
                    dtype: ScalarKind::Float64.into(),
                    shape: vec![],
                },
            ]),
            vec![100],
            true,
        )
    }

    fn array() -> Dataset {
        Dataset::new("/a", ScalarKind::Int64.into(), vec![1000, 10, 10], false)
    }

    #[test]
    fn the_three_column_slice_spellings_fuse_identically() {
        let expected = Op::Read {
            path: "/t".into(),
            col: Some("A".into()),
            start: Some(30),
            stop: Some(35),
            step: None,
            index: vec![],
        };
        // D.col('A')[30:35]
        assert_eq!(table().col("A").slice(30..35).build(), expected);
        // D[30:35]['A']
        assert_eq!(table().slice(30..35).field("A").build(), expected);
        // D['A'][30:35]
        assert_eq!(
            table()
                .index(IndexKey::Field("A".into()))
                .unwrap()
                .slice(30..35)
                .build(),
            expected
        );
    }

    #[test]
    fn col_int_fuses_to_scalar_read() {
        let op = table().col("B").row(7).build();
        assert_eq!(
            op,
            Op::ReadScalar {
                path: "/t".into(),
                col: Some("B".into()),
                idx: 7,
                index: vec![],
            }
        );
    }

    #[test]
    fn col_coords_fuses_to_coord_op() {
        let op = table().col("A").coords(&[5, 1, 9]).build();
        assert_eq!(
            op,
            Op::Coord {
                path: "/t".into(),
                col: Some("A".into()),
                coords: vec![5, 1, 9],
                index: vec![],
            }
        );
    }

    #[test]
    fn simple_slice_tuple_reduces_to_read() {
        let key = IndexKey::Tuple(vec![
            IndexKey::Slice(SliceArg::from(0..2)),
            IndexKey::Slice(SliceArg::full()),
            IndexKey::Ellipsis,
        ]);
        let op = array().index(key).unwrap().build();
        assert!(matches!(op, Op::Read { start: Some(0), stop: Some(2), .. }));
    }

    #[test]
    fn non_simple_keys_demote_to_index_op() {
        let key = IndexKey::Tuple(vec![IndexKey::Int(0), IndexKey::Int(3)]);
        let op = array().index(key).unwrap().build();
        assert!(matches!(op, Op::Index { .. }));

        // Post-indexing a fused read demotes it from the direct path.
        let op = table().col("A").slice(0..10).row(2).build();
        assert!(!op.is_direct());
    }

    #[test]
    fn fill_shape_completes_from_dataset_dims() {
        let d = array();
        assert_eq!(d.fill_shape(&[2]), vec![2, 10, 10]);
        assert_eq!(d.fill_shape(&[2, -1, 5]), vec![2, 10, 5]);
        assert_eq!(d.fill_shape(&[]), vec![1000, 10, 10]);
    }

    #[test]
    fn bare_ellipsis_is_rejected() {
        assert!(array().index(IndexKey::Ellipsis).is_err());
    }
}
