//! Local Tablet Writers
//!
//! Replicas hosted on this node bypass the network: rows go straight into the
//! in-process storage engine. The map holds exactly one writer per local tablet per
//! load, opened on the first append that reaches the tablet.
//!
//! ## Get-or-open
//!
//! ```text
//! append(t300) ──► read lock: writer exists? ──yes──► append
//!                         │
//!                         no
//!                         ▼
//!                  write lock: exists now? ──yes──► append
//!                         │
//!                         no ──► engine.open(t300) ──► insert ──► append
//! ```

use futures::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tabletsink_core::{
    LoadId, NodeId, ReplicaError, RowBatch, RowSelection, TabletCommitInfo, TabletDescriptor,
    TabletId,
};
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::transport::{LocalStorageEngine, LocalTabletWriter};

struct LocalWriterEntry {
    writer: Arc<dyn LocalTabletWriter>,
    finished: AtomicBool,
}

pub struct LocalWriterMap {
    engine: Option<Arc<dyn LocalStorageEngine>>,
    local_node_id: NodeId,
    load_id: LoadId,
    txn_id: i64,
    writers: RwLock<HashMap<TabletId, Arc<LocalWriterEntry>>>,
}

impl LocalWriterMap {
    pub fn new(
        engine: Option<Arc<dyn LocalStorageEngine>>,
        local_node_id: NodeId,
        load_id: LoadId,
        txn_id: i64,
    ) -> Self {
        Self {
            engine,
            local_node_id,
            load_id,
            txn_id,
            writers: RwLock::new(HashMap::new()),
        }
    }

    /// Get the writer for `tablet`, opening it on first use.
    pub async fn get_or_open(
        &self,
        tablet: &TabletDescriptor,
    ) -> Result<Arc<dyn LocalTabletWriter>, ReplicaError> {
        // Fast path
        {
            let writers = self.writers.read().await;
            if let Some(entry) = writers.get(&tablet.tablet_id) {
                return Ok(Arc::clone(&entry.writer));
            }
        }

        let mut writers = self.writers.write().await;

        // Double-check in case another append opened it while we waited
        if let Some(entry) = writers.get(&tablet.tablet_id) {
            return Ok(Arc::clone(&entry.writer));
        }

        let engine = self.engine.as_ref().ok_or_else(|| {
            ReplicaError::internal(
                self.local_node_id,
                format!(
                    "tablet {} has a local replica but no storage engine is configured",
                    tablet.tablet_id
                ),
            )
        })?;

        debug!(
            tablet_id = %tablet.tablet_id,
            load_id = %self.load_id,
            "Opening local tablet writer"
        );
        let writer = engine.open(tablet, self.load_id, self.txn_id).await?;
        writers.insert(
            tablet.tablet_id,
            Arc::new(LocalWriterEntry {
                writer: Arc::clone(&writer),
                finished: AtomicBool::new(false),
            }),
        );

        Ok(writer)
    }

    /// Append `rows` of `batch` to the local replica of `tablet`.
    pub async fn append(
        &self,
        tablet: &TabletDescriptor,
        batch: RowBatch,
        rows: RowSelection,
    ) -> Result<(), ReplicaError> {
        let writer = self.get_or_open(tablet).await?;
        writer.append(batch, rows).await
    }

    /// Number of local tablets opened by this load.
    pub async fn len(&self) -> usize {
        self.writers.read().await.len()
    }

    async fn entries(&self) -> Vec<(TabletId, Arc<LocalWriterEntry>)> {
        self.writers
            .read()
            .await
            .iter()
            .map(|(&tablet, entry)| (tablet, Arc::clone(entry)))
            .collect()
    }

    /// Tell every writer not yet told that no more rows will arrive.
    pub async fn finish_all(&self) -> Result<(), ReplicaError> {
        let entries = self.entries().await;
        let pending = entries
            .iter()
            .filter(|(_, entry)| !entry.finished.swap(true, Ordering::AcqRel))
            .map(|(_, entry)| entry.writer.finish());

        join_all(pending)
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?;
        Ok(())
    }

    /// Close every writer and collect one commit acknowledgement per tablet.
    ///
    /// Acknowledgements are attributed to the local node whatever the engine put in
    /// them, so the commit ledger matches them against `ReplicaRoute::Local`.
    pub async fn close_all(
        &self,
        close_timeout: Duration,
        retry: &RetryPolicy,
    ) -> Result<Vec<TabletCommitInfo>, ReplicaError> {
        let entries = self.entries().await;
        let node = self.local_node_id;

        let closes = entries.iter().map(|(tablet, entry)| {
            let writer = Arc::clone(&entry.writer);
            let tablet = *tablet;
            async move {
                retry_with_backoff(retry, || {
                    let writer = Arc::clone(&writer);
                    async move {
                        match timeout(close_timeout, writer.close()).await {
                            Ok(result) => result,
                            Err(_) => Err(ReplicaError::timeout(
                                node,
                                format!(
                                    "local writer for {} did not commit within {:?}",
                                    tablet, close_timeout
                                ),
                            )),
                        }
                    }
                })
                .await
                .map(|mut info| {
                    info.node_id = node;
                    info
                })
            }
        });

        join_all(closes).await.into_iter().collect()
    }

    /// Abort every writer. Each abort is bounded by `budget`.
    pub async fn abort_all(&self, reason: &str, budget: Duration) {
        let entries = self.entries().await;
        let aborts = entries.iter().map(|(tablet, entry)| async move {
            if timeout(budget, entry.writer.abort(reason)).await.is_err() {
                warn!(tablet_id = %tablet, "Local abort did not finish in time, ignoring");
            }
        });
        join_all(aborts).await;
    }
}
