//! A small self-contained columnar container, plus its adapter.
//!
//! The engine's real targets are the established scientific container
//! formats, consumed through the [`adapter`](crate::adapter) traits. This
//! module provides a minimal native container implementing the same
//! contract, so the engine, its tests, and its demos run without an external
//! format library.
//!
//! Layout: magic, version, a JSON header describing the datasets (path,
//! dtype, shape, chunk shape, sort indexes, payload offset), then the
//! row-major payload blobs.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::adapter::{DataNode, FileAdapter};
use crate::array::{resolve_index, resolve_slice, OwnedArray, ScalarValue};
use crate::dtype::{DType, Field, ScalarKind};
use crate::error::{Error, Result};
use crate::ops::{apply_index, IndexKey};

const MAGIC: &[u8; 4] = b"PTCF";
const VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum DTypeMeta {
    Scalar { descr: String },
    Compound { fields: Vec<FieldMeta> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FieldMeta {
    name: String,
    descr: String,
    shape: Vec<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DatasetMeta {
    path: String,
    dtype: DTypeMeta,
    shape: Vec<usize>,
    #[serde(default)]
    chunkshape: Option<Vec<usize>>,
    /// Byte offset within the data section (which starts after the header,
    /// so blob placement never feeds back into the header's own length).
    offset: u64,
    nbytes: u64,
    #[serde(default)]
    table: bool,
    /// Columns carrying a completely sorted index.
    #[serde(default)]
    sort_indexes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileHeader {
    datasets: Vec<DatasetMeta>,
}

fn dtype_to_meta(dtype: &DType) -> Result<DTypeMeta> {
    match dtype {
        DType::Scalar(kind) => Ok(DTypeMeta::Scalar {
            descr: kind.descr().to_owned(),
        }),
        DType::Compound(fields) => {
            let fields = fields
                .iter()
                .map(|f| {
                    let DType::Scalar(kind) = f.dtype else {
                        return Err(Error::adapter("nested compound fields are not supported"));
                    };
                    Ok(FieldMeta {
                        name: f.name.clone(),
                        descr: kind.descr().to_owned(),
                        shape: f.shape.clone(),
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(DTypeMeta::Compound { fields })
        }
    }
}

fn meta_to_dtype(meta: &DTypeMeta) -> Result<DType> {
    match meta {
        DTypeMeta::Scalar { descr } => Ok(DType::Scalar(ScalarKind::from_descr(descr)?)),
        DTypeMeta::Compound { fields } => Ok(DType::Compound(
            fields
                .iter()
                .map(|f| {
                    Ok(Field {
                        name: f.name.clone(),
                        dtype: DType::Scalar(ScalarKind::from_descr(&f.descr)?),
                        shape: f.shape.clone(),
                    })
                })
                .collect::<Result<Vec<_>>>()?,
        )),
    }
}

// ---------------------------------------------------------------------
// WRITER
// ---------------------------------------------------------------------

/// Builds a container file in memory, then writes it out in one pass.
#[derive(Default)]
pub struct ColFileBuilder {
    datasets: Vec<(DatasetMeta, Vec<u8>)>,
}

impl ColFileBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(
        &mut self,
        path: &str,
        dtype: &DType,
        shape: &[usize],
        data: &[u8],
        chunkshape: Option<&[usize]>,
        table: bool,
        sort_indexes: &[&str],
    ) -> Result<&mut Self> {
        let expect = dtype.nbytes(shape);
        if data.len() != expect {
            return Err(Error::adapter(format!(
                "dataset '{path}': {} bytes of data for a shape requiring {expect}",
                data.len()
            )));
        }
        self.datasets.push((
            DatasetMeta {
                path: path.to_owned(),
                dtype: dtype_to_meta(dtype)?,
                shape: shape.to_vec(),
                chunkshape: chunkshape.map(<[usize]>::to_vec),
                offset: 0,
                nbytes: expect as u64,
                table,
                sort_indexes: sort_indexes.iter().map(|&s| s.to_owned()).collect(),
            },
            data.to_vec(),
        ));
        Ok(self)
    }

    /// Add a homogeneous array dataset.
    pub fn add_array(
        &mut self,
        path: &str,
        kind: ScalarKind,
        shape: &[usize],
        data: &[u8],
    ) -> Result<&mut Self> {
        self.push(path, &DType::Scalar(kind), shape, data, None, false, &[])
    }

    /// Add an array with an on-disk chunk shape (streamers pick their block
    /// size from it).
    pub fn add_array_chunked(
        &mut self,
        path: &str,
        kind: ScalarKind,
        shape: &[usize],
        chunkshape: &[usize],
        data: &[u8],
    ) -> Result<&mut Self> {
        self.push(
            path,
            &DType::Scalar(kind),
            shape,
            data,
            Some(chunkshape),
            false,
            &[],
        )
    }

    /// Add a table (compound rows). `sort_indexes` names columns carrying a
    /// completely sorted index.
    pub fn add_table(
        &mut self,
        path: &str,
        dtype: &DType,
        nrows: usize,
        data: &[u8],
        sort_indexes: &[&str],
    ) -> Result<&mut Self> {
        if !dtype.is_compound() {
            return Err(Error::adapter("table datasets require a compound dtype"));
        }
        self.push(path, dtype, &[nrows], data, None, true, sort_indexes)
    }

    /// Write the container.
    pub fn write(&self, path: &Path) -> Result<()> {
        let mut header = FileHeader {
            datasets: self.datasets.iter().map(|(m, _)| m.clone()).collect(),
        };
        let mut offset = 0;
        for meta in &mut header.datasets {
            meta.offset = offset;
            offset += meta.nbytes;
        }
        let rendered = serde_json::to_vec(&header).map_err(io_from_json)?;

        let mut file = File::create(path)?;
        file.write_all(MAGIC)?;
        file.write_all(&VERSION.to_ne_bytes())?;
        file.write_all(&(rendered.len() as u64).to_ne_bytes())?;
        file.write_all(&rendered)?;
        for (_, data) in &self.datasets {
            file.write_all(data)?;
        }
        file.sync_all()?;
        Ok(())
    }
}

fn io_from_json(e: serde_json::Error) -> Error {
    Error::adapter(format!("container header: {e}"))
}

// ---------------------------------------------------------------------
// ADAPTER
// ---------------------------------------------------------------------

/// Adapter over the native columnar container.
pub struct ColFile {
    path: PathBuf,
    header: FileHeader,
    /// Absolute file offset where the data section begins.
    data_base: u64,
}

impl FileAdapter for ColFile {
    type Options = ();
    type Node = ColNode;

    fn open(path: &Path, _opts: &Self::Options) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(Error::adapter(format!(
                "{} is not a columnar container",
                path.display()
            )));
        }
        let mut word = [0u8; 4];
        file.read_exact(&mut word)?;
        let version = u32::from_ne_bytes(word);
        if version != VERSION {
            return Err(Error::adapter(format!("unsupported container version {version}")));
        }
        let mut len = [0u8; 8];
        file.read_exact(&mut len)?;
        let header_len = u64::from_ne_bytes(len);
        let mut raw = vec![0u8; header_len as usize];
        file.read_exact(&mut raw)?;
        let header: FileHeader = serde_json::from_slice(&raw).map_err(io_from_json)?;
        Ok(Self {
            path: path.to_owned(),
            header,
            data_base: (MAGIC.len() + 4 + 8) as u64 + header_len,
        })
    }

    fn node(&mut self, node_path: &str) -> Result<Self::Node> {
        let meta = self
            .header
            .datasets
            .iter()
            .find(|d| d.path == node_path)
            .ok_or_else(|| Error::adapter(format!("no dataset at path '{node_path}'")))?
            .clone();
        let dtype = meta_to_dtype(&meta.dtype)?;
        Ok(ColNode {
            file: File::open(&self.path)?,
            dtype,
            data_base: self.data_base,
            meta,
        })
    }
}

/// One dataset of the container. Owns its own file handle, so nodes cached
/// by different workers never share descriptors.
pub struct ColNode {
    file: File,
    dtype: DType,
    data_base: u64,
    meta: DatasetMeta,
}

impl ColNode {
    fn row_nbytes(&self) -> usize {
        self.dtype.nbytes(&self.meta.shape[1..])
    }

    fn len(&self) -> usize {
        self.meta.shape.first().copied().unwrap_or(0)
    }

    fn seek_row(&mut self, row: usize) -> Result<()> {
        let rn = self.row_nbytes() as u64;
        self.file.seek(SeekFrom::Start(
            self.data_base + self.meta.offset + row as u64 * rn,
        ))?;
        Ok(())
    }

    fn read_rows_raw(&mut self, start: usize, count: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; count * self.row_nbytes()];
        self.seek_row(start)?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn result_shape(&self, count: usize) -> Vec<usize> {
        let mut shape = self.meta.shape.clone();
        shape[0] = count;
        shape
    }

    /// Rows of the resolved range, before any field extraction.
    fn read_range(
        &mut self,
        start: Option<i64>,
        stop: Option<i64>,
        step: Option<i64>,
    ) -> Result<OwnedArray> {
        let (start, _, step, count) = resolve_slice(self.len(), start, stop, step)?;
        let data = if step == 1 {
            self.read_rows_raw(start, count)?
        } else {
            let rn = self.row_nbytes();
            let mut data = Vec::with_capacity(count * rn);
            for k in 0..count {
                data.extend_from_slice(&self.read_rows_raw(start + k * step, 1)?);
            }
            data
        };
        OwnedArray::from_bytes(self.dtype.clone(), self.result_shape(count), data)
    }

    fn require_sort_index(&self, sortby: &str) -> Result<()> {
        if self.meta.sort_indexes.iter().any(|c| c == sortby) {
            Ok(())
        } else {
            Err(Error::adapter(format!(
                "no completely sorted index on column '{sortby}'"
            )))
        }
    }

    /// Sorted row permutation of the whole dataset by `sortby`.
    fn sort_permutation(&mut self, sortby: &str) -> Result<Vec<usize>> {
        let all = self.read_range(None, None, None)?;
        let keys = all.field(sortby)?.to_f64_vec()?;
        let mut perm: Vec<usize> = (0..keys.len()).collect();
        perm.sort_by(|&a, &b| keys[a].total_cmp(&keys[b]));
        Ok(perm)
    }
}

impl DataNode for ColNode {
    fn dtype(&self) -> &DType {
        &self.dtype
    }

    fn shape(&self) -> &[usize] {
        &self.meta.shape
    }

    fn chunkshape(&self) -> Option<&[usize]> {
        self.meta.chunkshape.as_deref()
    }

    fn is_table(&self) -> bool {
        self.meta.table
    }

    fn read(
        &mut self,
        start: Option<i64>,
        stop: Option<i64>,
        step: Option<i64>,
        field: Option<&str>,
    ) -> Result<OwnedArray> {
        let rows = self.read_range(start, stop, step)?;
        match field {
            Some(name) => rows.field(name),
            None => Ok(rows),
        }
    }

    fn read_into(
        &mut self,
        start: Option<i64>,
        stop: Option<i64>,
        step: Option<i64>,
        field: Option<&str>,
        out: &mut [u8],
    ) -> Result<()> {
        if field.is_none() && step.unwrap_or(1) == 1 {
            // The fast path: rows land straight in the caller's buffer.
            let (start, _, _, count) = resolve_slice(self.len(), start, stop, step)?;
            let rn = self.row_nbytes();
            if out.len() != count * rn {
                return Err(Error::adapter(format!(
                    "output buffer is {} bytes, slice needs {}",
                    out.len(),
                    count * rn
                )));
            }
            self.seek_row(start)?;
            self.file.read_exact(out)?;
            Ok(())
        } else {
            let result = self.read(start, stop, step, field)?;
            if out.len() != result.nbytes() {
                return Err(Error::adapter(format!(
                    "output buffer is {} bytes, result needs {}",
                    out.len(),
                    result.nbytes()
                )));
            }
            out.copy_from_slice(result.data());
            Ok(())
        }
    }

    fn index(&mut self, key: &IndexKey) -> Result<OwnedArray> {
        match key {
            IndexKey::Slice(s) => self.read(s.start, s.stop, s.step, None),
            IndexKey::Int(i) => {
                let i = resolve_index(*i, self.len())?;
                Ok(self
                    .read(Some(i as i64), Some(i as i64 + 1), None, None)?
                    .row_array(0))
            }
            other => {
                let all = self.read_range(None, None, None)?;
                apply_index(all, std::slice::from_ref(other))
            }
        }
    }

    fn col(&mut self, name: &str) -> Result<OwnedArray> {
        self.read(None, None, None, Some(name))
    }

    fn read_coordinates(&mut self, coords: &[i64], field: Option<&str>) -> Result<OwnedArray> {
        let rn = self.row_nbytes();
        let len = self.len();
        let mut data = Vec::with_capacity(coords.len() * rn);
        for &c in coords {
            let i = resolve_index(c, len)?;
            data.extend_from_slice(&self.read_rows_raw(i, 1)?);
        }
        let rows =
            OwnedArray::from_bytes(self.dtype.clone(), self.result_shape(coords.len()), data)?;
        match field {
            Some(name) => rows.field(name),
            None => Ok(rows),
        }
    }

    fn read_sorted(
        &mut self,
        sortby: &str,
        check_csi: bool,
        field: Option<&str>,
        start: Option<i64>,
        stop: Option<i64>,
        step: Option<i64>,
    ) -> Result<OwnedArray> {
        // A sort index is required either way; check_csi insists it is a
        // *completely* sorted one, which is the only kind this container
        // records, so both paths check the same declaration.
        let _ = check_csi;
        self.dtype.field(sortby)?;
        self.require_sort_index(sortby)?;
        let perm = self.sort_permutation(sortby)?;
        let (s, _, st, count) = resolve_slice(perm.len(), start, stop, step)?;
        let picked: Vec<usize> = (0..count).map(|k| perm[s + k * st]).collect();
        let all = self.read_range(None, None, None)?;
        let rows = all.select_rows(&picked);
        match field {
            Some(name) => rows.field(name),
            None => Ok(rows),
        }
    }

    fn read_where(
        &mut self,
        condition: &str,
        condvars: &[(String, ScalarValue)],
        start: Option<i64>,
        stop: Option<i64>,
        step: Option<i64>,
    ) -> Result<OwnedArray> {
        let predicate = Predicate::parse(condition, condvars)?;
        let rows = self.read_range(start, stop, step)?;
        let keys = rows.field(&predicate.column)?.to_f64_vec()?;
        let mask: Vec<bool> = keys.iter().map(|&v| predicate.eval(v)).collect();
        rows.filter_rows(&mask)
    }
}

/// A single-comparison predicate: `column OP (literal | variable)`.
struct Predicate {
    column: String,
    op: CmpOp,
    rhs: f64,
}

#[derive(Clone, Copy)]
enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Predicate {
    fn parse(condition: &str, condvars: &[(String, ScalarValue)]) -> Result<Self> {
        let trimmed = condition.trim().trim_start_matches('(').trim_end_matches(')');
        let (op, symbol) = [
            (CmpOp::Le, "<="),
            (CmpOp::Ge, ">="),
            (CmpOp::Eq, "=="),
            (CmpOp::Ne, "!="),
            (CmpOp::Lt, "<"),
            (CmpOp::Gt, ">"),
        ]
        .into_iter()
        .find(|(_, s)| trimmed.contains(s))
        .ok_or_else(|| Error::adapter(format!("unsupported condition '{condition}'")))?;
        let (lhs, rhs) = trimmed.split_once(symbol).unwrap();
        let column = lhs.trim().to_owned();
        let rhs = rhs.trim();
        let rhs = match rhs.parse::<f64>() {
            Ok(v) => v,
            Err(_) => condvars
                .iter()
                .find(|(name, _)| name == rhs)
                .map(|(_, v)| v.as_f64())
                .ok_or_else(|| {
                    Error::adapter(format!("condition variable '{rhs}' not supplied"))
                })?,
        };
        Ok(Self { column, op, rhs })
    }

    fn eval(&self, lhs: f64) -> bool {
        match self.op {
            CmpOp::Lt => lhs < self.rhs,
            CmpOp::Le => lhs <= self.rhs,
            CmpOp::Gt => lhs > self.rhs,
            CmpOp::Ge => lhs >= self.rhs,
            CmpOp::Eq => lhs == self.rhs,
            CmpOp::Ne => lhs != self.rhs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn i64_bytes(values: &[i64]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_ne_bytes()).collect()
    }

    fn build_fixture(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("fixture.ptc");
        let array: Vec<i64> = (0..60).collect();

        let row_type = DType::Compound(vec![
            Field {
                name: "a".into(),
                dtype: ScalarKind::Int64.into(),
                shape: vec![],
            },
            Field {
                name: "b".into(),
                dtype: ScalarKind::Float64.into(),
                shape: vec![],
            },
        ]);
        let mut table = Vec::new();
        for i in 0..10i64 {
            table.extend_from_slice(&i.to_ne_bytes());
            table.extend_from_slice(&(f64::from(9 - i as i32)).to_ne_bytes());
        }

        let mut builder = ColFileBuilder::new();
        builder
            .add_array("/ints", ScalarKind::Int64, &[20, 3], &i64_bytes(&array))
            .unwrap()
            .add_table("/rows", &row_type, 10, &table, &["b"])
            .unwrap()
            .write(&path)
            .unwrap();
        path
    }

    #[test]
    fn read_slices_and_rows() {
        let dir = TempDir::new().unwrap();
        let path = build_fixture(&dir);
        let mut file = ColFile::open(&path, &()).unwrap();
        let mut node = file.node("/ints").unwrap();

        assert_eq!(node.shape(), &[20, 3]);
        let slab = node.read(Some(2), Some(4), None, None).unwrap();
        assert_eq!(slab.shape(), &[2, 3]);
        assert_eq!(slab.to_vec::<i64>().unwrap(), vec![6, 7, 8, 9, 10, 11]);

        let strided = node.read(Some(0), Some(6), Some(2), None).unwrap();
        assert_eq!(strided.shape(), &[3, 3]);
        assert_eq!(strided.to_vec::<i64>().unwrap(), vec![0, 1, 2, 6, 7, 8, 12, 13, 14]);
    }

    #[test]
    fn read_into_matches_read() {
        let dir = TempDir::new().unwrap();
        let path = build_fixture(&dir);
        let mut file = ColFile::open(&path, &()).unwrap();
        let mut node = file.node("/ints").unwrap();

        let direct = node.read(Some(5), Some(9), None, None).unwrap();
        let mut buf = vec![0u8; direct.nbytes()];
        node.read_into(Some(5), Some(9), None, None, &mut buf).unwrap();
        assert_eq!(buf, direct.data());
    }

    #[test]
    fn table_columns_and_coordinates() {
        let dir = TempDir::new().unwrap();
        let path = build_fixture(&dir);
        let mut file = ColFile::open(&path, &()).unwrap();
        let mut node = file.node("/rows").unwrap();

        assert!(node.is_table());
        let a = node.col("a").unwrap();
        assert_eq!(a.to_vec::<i64>().unwrap(), (0..10).collect::<Vec<_>>());

        let picked = node.read_coordinates(&[9, 0, 3], Some("a")).unwrap();
        assert_eq!(picked.to_vec::<i64>().unwrap(), vec![9, 0, 3]);
    }

    #[test]
    fn sorted_reads_follow_the_index() {
        let dir = TempDir::new().unwrap();
        let path = build_fixture(&dir);
        let mut file = ColFile::open(&path, &()).unwrap();
        let mut node = file.node("/rows").unwrap();

        // Column b holds 9, 8, ..., 0; sorted order reverses the rows.
        let sorted = node.read_sorted("b", true, Some("a"), None, None, None).unwrap();
        assert_eq!(sorted.to_vec::<i64>().unwrap(), (0..10).rev().collect::<Vec<_>>());

        assert!(node
            .read_sorted("a", true, None, None, None, None)
            .is_err());
    }

    #[test]
    fn where_filters_rows() {
        let dir = TempDir::new().unwrap();
        let path = build_fixture(&dir);
        let mut file = ColFile::open(&path, &()).unwrap();
        let mut node = file.node("/rows").unwrap();

        let hits = node
            .read_where(
                "a >= x",
                &[("x".into(), ScalarValue::Int64(7))],
                None,
                None,
                None,
            )
            .unwrap();
        assert_eq!(hits.field("a").unwrap().to_vec::<i64>().unwrap(), vec![7, 8, 9]);

        let none = node
            .read_where("b > 100", &[], None, None, None)
            .unwrap();
        assert_eq!(none.len(), 0);
    }
}
