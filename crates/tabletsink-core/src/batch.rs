//! Shared Row Batches
//!
//! A `RowBatch` is the unit the upstream pipeline hands to the sink. It is
//! reference-counted: the same batch is fanned out to every replica of every
//! tablet it touches, and each of those writes only carries a `RowSelection`
//! (the row indices that belong to that tablet) plus a clone of the `Arc`.
//!
//! ## Design Decisions
//! - Columnar `arrow` batches, handed to writers whole; each writer reads only
//!   the rows of its selection
//! - Selections are `Arc<[u32]>` so every replica of a tablet shares one index list
//! - Byte sizes are estimates derived from the batch's array memory, used for metrics

use arrow::array::RecordBatch;
use std::sync::Arc;

/// A reference-counted input batch.
#[derive(Debug, Clone)]
pub struct RowBatch {
    inner: Arc<RecordBatch>,
}

/// Row indices of a batch that belong to one tablet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowSelection(Arc<[u32]>);

impl RowBatch {
    pub fn new(batch: RecordBatch) -> Self {
        Self {
            inner: Arc::new(batch),
        }
    }

    pub fn record_batch(&self) -> &RecordBatch {
        &self.inner
    }

    pub fn num_rows(&self) -> usize {
        self.inner.num_rows()
    }

    /// Estimated in-memory size of the whole batch.
    pub fn estimated_bytes(&self) -> usize {
        self.inner.get_array_memory_size()
    }

    /// Estimated size of the given rows, assuming evenly sized rows.
    pub fn estimated_bytes_for(&self, selection: &RowSelection) -> usize {
        let rows = self.num_rows();
        if rows == 0 {
            return 0;
        }
        self.estimated_bytes() * selection.len() / rows
    }
}

impl From<RecordBatch> for RowBatch {
    fn from(batch: RecordBatch) -> Self {
        Self::new(batch)
    }
}

impl RowSelection {
    pub fn new(rows: Vec<u32>) -> Self {
        Self(rows.into())
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u32>> for RowSelection {
    fn from(rows: Vec<u32>) -> Self {
        Self::new(rows)
    }
}
