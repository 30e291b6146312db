//! Row Distribution
//!
//! Maps a row to the partition it belongs to and to a distribution bucket inside
//! that partition. The resolver turns `(partition, bucket)` into concrete tablets.
//!
//! ## HashDistributor
//!
//! - **Partition key**: the rendered value of the partition column, or a constant key
//!   for unpartitioned tables. A null partition key cannot be routed.
//! - **Bucket**: SipHash of the rendered distribution column values, so the same key
//!   columns always land in the same bucket.
//!
//! ```text
//! row ──► partition column ──► PartitionKey("2024-01-01")
//!     └─► [user_id, region] ──► SipHash ──► bucket
//! ```

use arrow::array::{Array, ArrayRef, RecordBatch};
use arrow::util::display::array_value_to_string;
use siphasher::sip::SipHasher;
use std::hash::{Hash, Hasher};
use tabletsink_core::PartitionKey;

use crate::error::{Result, SinkError};

/// Key used by tables without a partition column.
pub const UNPARTITIONED_KEY: &str = "__unpartitioned__";

const NULL_MARKER: &str = "\\N";

/// Where a single row goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowTarget {
    pub partition_key: PartitionKey,
    pub bucket: u64,
}

/// Computes the target of each row.
///
/// Row errors are per row: a row that cannot be routed is filtered by the resolver
/// and the rest of the batch continues. A batch that does not carry the columns the
/// distributor needs fails as a whole with [`SinkError::Schema`].
pub trait RowDistributor: Send + Sync {
    fn compute_target(&self, batch: &RecordBatch, row: usize) -> std::result::Result<RowTarget, String>;

    /// Targets for every row of `batch`, in row order.
    fn compute_targets(
        &self,
        batch: &RecordBatch,
    ) -> Result<Vec<std::result::Result<RowTarget, String>>> {
        Ok((0..batch.num_rows())
            .map(|row| self.compute_target(batch, row))
            .collect())
    }
}

/// Hash distribution over named columns.
#[derive(Debug, Clone)]
pub struct HashDistributor {
    partition_column: Option<String>,
    distribution_columns: Vec<String>,
}

impl HashDistributor {
    /// Distribute by `distribution_columns`, partitioning by `partition_column`.
    pub fn new(partition_column: impl Into<String>, distribution_columns: Vec<String>) -> Self {
        Self {
            partition_column: Some(partition_column.into()),
            distribution_columns,
        }
    }

    /// Every row belongs to the single partition keyed [`UNPARTITIONED_KEY`].
    pub fn unpartitioned(distribution_columns: Vec<String>) -> Self {
        Self {
            partition_column: None,
            distribution_columns,
        }
    }

    /// Check that every referenced column exists in `batch`'s schema.
    pub fn validate_schema(&self, batch: &RecordBatch) -> Result<()> {
        let schema = batch.schema();
        for name in self.partition_column.iter().chain(&self.distribution_columns) {
            if schema.index_of(name).is_err() {
                return Err(SinkError::Schema(format!(
                    "column '{}' not found in batch schema",
                    name
                )));
            }
        }
        Ok(())
    }

    fn column(batch: &RecordBatch, name: &str) -> std::result::Result<ArrayRef, String> {
        batch
            .column_by_name(name)
            .cloned()
            .ok_or_else(|| format!("column '{}' not found", name))
    }

    fn target_for(
        &self,
        partition: Option<&ArrayRef>,
        distribution: &[ArrayRef],
        row: usize,
    ) -> std::result::Result<RowTarget, String> {
        let partition_key = match partition {
            Some(column) => {
                if column.is_null(row) {
                    return Err(format!("row {} has a null partition key", row));
                }
                let value = array_value_to_string(column, row).map_err(|e| e.to_string())?;
                PartitionKey::new(value)
            }
            None => PartitionKey::new(UNPARTITIONED_KEY),
        };

        let mut hasher = SipHasher::new();
        for column in distribution {
            if column.is_null(row) {
                NULL_MARKER.hash(&mut hasher);
            } else {
                array_value_to_string(column, row)
                    .map_err(|e| e.to_string())?
                    .hash(&mut hasher);
            }
        }

        Ok(RowTarget {
            partition_key,
            bucket: hasher.finish(),
        })
    }
}

impl RowDistributor for HashDistributor {
    fn compute_target(&self, batch: &RecordBatch, row: usize) -> std::result::Result<RowTarget, String> {
        let partition = self
            .partition_column
            .as_deref()
            .map(|name| Self::column(batch, name))
            .transpose()?;
        let distribution = self
            .distribution_columns
            .iter()
            .map(|name| Self::column(batch, name))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        self.target_for(partition.as_ref(), &distribution, row)
    }

    fn compute_targets(
        &self,
        batch: &RecordBatch,
    ) -> Result<Vec<std::result::Result<RowTarget, String>>> {
        self.validate_schema(batch)?;

        // Column lookup once per batch instead of once per row.
        let partition = self
            .partition_column
            .as_deref()
            .map(|name| Self::column(batch, name))
            .transpose()
            .map_err(SinkError::Schema)?;
        let distribution = self
            .distribution_columns
            .iter()
            .map(|name| Self::column(batch, name))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(SinkError::Schema)?;

        Ok((0..batch.num_rows())
            .map(|row| self.target_for(partition.as_ref(), &distribution, row))
            .collect())
    }
}
