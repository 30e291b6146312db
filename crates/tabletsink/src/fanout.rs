//! Write Fan-out
//!
//! Delivers one batch's row groups to every replica of every tablet they target.
//!
//! ## Two phases
//!
//! 1. **Plan** (under the routing read lock): for each tablet, turn its replica
//!    routes into write targets. Remote targets pick their stream here.
//! 2. **Dispatch** (lock released): issue every append concurrently.
//!
//! ```text
//! t300 [rows 0,2] ──► Local                 ──► LocalTabletWriter.append
//!                 └─► Remote(node-2) / s1   ──► ReplicaStream.append
//! t301 [rows 1]   ──► Remote(node-2) / s0   ──► ReplicaStream.append
//!                 └─► Remote(node-3) / s0   ──► ReplicaStream.append
//! ```
//!
//! Every append shares the same `RowBatch`; only the row selection differs per
//! tablet. Replication is to all replicas: a failed append to any one of them
//! fails the whole dispatch.

use futures::future::join_all;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tabletsink_core::{NodeId, ReplicaError, RowBatch, RowSelection, TabletDescriptor, TabletId};
use tabletsink_observability::metrics::{
    SINK_APPENDS_TOTAL, SINK_BYTES_SENT_TOTAL, SINK_SEND_LATENCY,
};
use tracing::warn;

use crate::error::{Result, SinkError};
use crate::local_writer::LocalWriterMap;
use crate::resolver::RowsForTablet;
use crate::stats::SinkStats;
use crate::stream_pool::{record_replica_error, StreamPool};
use crate::topology::{ReplicaRoute, ReplicaTopology};
use crate::transport::ReplicaStream;

/// Where one replica's copy of a row group goes.
#[derive(Clone)]
pub enum WriteTarget {
    Local,
    Remote {
        node: NodeId,
        stream: Arc<dyn ReplicaStream>,
    },
}

impl std::fmt::Debug for WriteTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteTarget::Local => write!(f, "Local"),
            WriteTarget::Remote { stream, .. } => write!(f, "Remote({})", stream.stream_id()),
        }
    }
}

/// The row group for one tablet and every replica it must reach.
#[derive(Debug, Clone)]
pub struct TabletWrite {
    pub tablet: TabletDescriptor,
    pub rows: RowSelection,
    pub targets: Vec<WriteTarget>,
}

/// Resolve write targets for every tablet of `rows_for_tablet`.
pub fn plan(
    rows_for_tablet: &RowsForTablet,
    topology: &ReplicaTopology,
    pool: &StreamPool,
) -> Result<Vec<TabletWrite>> {
    let mut writes = Vec::with_capacity(rows_for_tablet.len());

    for (&tablet_id, group) in rows_for_tablet {
        let placement = topology.tablet(tablet_id).ok_or_else(|| {
            SinkError::Internal(format!("tablet {} is not in the topology", tablet_id))
        })?;

        let mut targets = Vec::with_capacity(placement.routes.len());
        for route in &placement.routes {
            match *route {
                ReplicaRoute::Local => targets.push(WriteTarget::Local),
                ReplicaRoute::Remote(node) => {
                    let stream = pool.select(node).ok_or_else(|| {
                        SinkError::ReplicaUnavailable {
                            node,
                            message: format!("no open stream for tablet {}", tablet_id),
                        }
                    })?;
                    targets.push(WriteTarget::Remote { node, stream });
                }
            }
        }

        writes.push(TabletWrite {
            tablet: placement.descriptor.clone(),
            rows: group.selection(),
            targets,
        });
    }

    Ok(writes)
}

/// Issue every planned append and wait for all of them.
///
/// Returns the tablets that received rows.
pub async fn dispatch(
    batch: &RowBatch,
    writes: &[TabletWrite],
    locals: &LocalWriterMap,
    stats: &SinkStats,
) -> Result<BTreeSet<TabletId>> {
    let start = Instant::now();

    let appends = writes.iter().flat_map(move |write| {
        write.targets.iter().map(move |target| {
            let batch = batch.clone();
            let rows = write.rows.clone();
            async move {
                match target {
                    WriteTarget::Local => {
                        locals.append(&write.tablet, batch, rows).await?;
                        stats.record_local_append();
                        SINK_APPENDS_TOTAL.with_label_values(&["local"]).inc();
                    }
                    WriteTarget::Remote { stream, .. } => {
                        let bytes = batch.estimated_bytes_for(&rows);
                        stream.append(write.tablet.tablet_id, batch, rows).await?;
                        stats.record_remote_append(bytes);
                        SINK_APPENDS_TOTAL.with_label_values(&["remote"]).inc();
                        SINK_BYTES_SENT_TOTAL
                            .with_label_values(&["remote"])
                            .inc_by(bytes as u64);
                    }
                }
                Ok::<_, ReplicaError>(())
            }
        })
    });

    let results = join_all(appends).await;

    let elapsed = start.elapsed();
    stats.add_send_data_time(elapsed);
    SINK_SEND_LATENCY
        .with_label_values(&["dispatch"])
        .observe(elapsed.as_secs_f64());

    let mut first_error = None;
    for err in results.into_iter().filter_map(|result| result.err()) {
        warn!(node_id = %err.node, error = %err, "Replica append failed");
        record_replica_error("append", &err);
        first_error.get_or_insert(err);
    }
    if let Some(err) = first_error {
        return Err(err.into());
    }

    Ok(writes.iter().map(|write| write.tablet.tablet_id).collect())
}
