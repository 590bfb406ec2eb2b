//! The file-adapter contract.
//!
//! The engine never talks to the container format directly; everything goes
//! through these two traits. The adapter is opened inside each worker
//! process (several libraries of this class are not fork-safe, so nothing is
//! opened before the workers exist), and once more in the front end to probe
//! dataset metadata.

use std::path::Path;

use crate::array::{OwnedArray, ScalarValue};
use crate::dtype::DType;
use crate::error::Result;
use crate::ops::IndexKey;

/// A handle on one container file.
///
/// `'static` because adapters are owned handles threaded through worker
/// processes and background threads.
pub trait FileAdapter: Sized + 'static {
    /// Format-specific open options.
    type Options: Clone + Send + Sync + Default + 'static;
    /// Handle on one dataset within the file.
    type Node: DataNode;

    /// Open the container for reading.
    fn open(path: &Path, opts: &Self::Options) -> Result<Self>;

    /// Resolve a dataset by its internal path.
    fn node(&mut self, path: &str) -> Result<Self::Node>;
}

/// A handle on one dataset.
///
/// `read_into` is the zero-copy path: it writes rows straight into a caller
/// buffer (in practice, a shared-memory stage). Everything else materialises
/// an [`OwnedArray`].
pub trait DataNode {
    fn dtype(&self) -> &DType;

    fn shape(&self) -> &[usize];

    /// Chunk shape when the dataset is chunked on disk.
    fn chunkshape(&self) -> Option<&[usize]>;

    /// True for compound-row (table) nodes.
    fn is_table(&self) -> bool;

    /// Contiguous slice along axis 0, optionally restricted to one field.
    fn read(
        &mut self,
        start: Option<i64>,
        stop: Option<i64>,
        step: Option<i64>,
        field: Option<&str>,
    ) -> Result<OwnedArray>;

    /// As [`read`](Self::read), writing the rows into `out`. `out` must be
    /// exactly the byte size of the result.
    fn read_into(
        &mut self,
        start: Option<i64>,
        stop: Option<i64>,
        step: Option<i64>,
        field: Option<&str>,
        out: &mut [u8],
    ) -> Result<()>;

    /// Arbitrary subscript, for keys the slice fast paths cannot express.
    fn index(&mut self, key: &IndexKey) -> Result<OwnedArray>;

    /// One column of a table node.
    fn col(&mut self, name: &str) -> Result<OwnedArray>;

    /// Point selection by row index.
    fn read_coordinates(&mut self, coords: &[i64], field: Option<&str>) -> Result<OwnedArray>;

    /// Rows in sorted order of `sortby`. With `check_csi`, require a
    /// completely sorted index on that column.
    fn read_sorted(
        &mut self,
        sortby: &str,
        check_csi: bool,
        field: Option<&str>,
        start: Option<i64>,
        stop: Option<i64>,
        step: Option<i64>,
    ) -> Result<OwnedArray>;

    /// Rows matching a predicate over the range.
    fn read_where(
        &mut self,
        condition: &str,
        condvars: &[(String, ScalarValue)],
        start: Option<i64>,
        stop: Option<i64>,
        step: Option<i64>,
    ) -> Result<OwnedArray>;
}
