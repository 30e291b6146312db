//! Load Transaction Coordinator
//!
//! `LoadSink` drives one all-or-nothing load: it routes every batch to its tablets,
//! replicates each row group to every replica, creates partitions on demand, and
//! commits only if every replica of every touched tablet acknowledges.
//!
//! ## Architecture
//!
//! ```text
//! send(batch)
//!   │
//!   ├─► RowDistributor ──► resolver::resolve ──► unresolved? ──► PartitionSync
//!   │                                                            │
//!   │                                 on_partitions_created ◄────┘
//!   │                                 (topology swap + stream open/announce,
//!   │                                  under the routing write lock)
//!   │
//!   └─► fanout::plan (read lock) ──► fanout::dispatch ──► LocalWriterMap / StreamPool
//!
//! close(Ok)  ──► end-of-stream ──► close every stream/writer ──► verify every ack
//! close(Err) / any fatal error ──► cancel ──► abort every stream/writer
//! ```
//!
//! ## Routing state
//!
//! The topology snapshot and the stream pool sit behind one `RwLock`. Readers
//! (resolution, fan-out planning) hold the read lock only long enough to clone an
//! `Arc` or pick streams; the network I/O of a dispatch runs without it. Only
//! `open` and `on_partitions_created` take the write lock.
//!
//! ## Failure model
//!
//! Partial replication is never acceptable. Any error that touches a replica or
//! the topology cancels the whole load before it is returned. `cancel` is
//! idempotent and best effort; individual abort failures are ignored.
//!
//! ## Examples
//!
//! ```ignore
//! let sink = LoadSinkBuilder::new(config)
//!     .transport(transport)
//!     .local_engine(engine)
//!     .partition_creator(metadata)
//!     .distributor(Arc::new(HashDistributor::new("day", vec!["user_id".into()])))
//!     .partitions(static_partitions)
//!     .build()?;
//!
//! sink.open().await?;
//! for batch in batches {
//!     sink.send(batch, false).await?;
//! }
//! let summary = sink.close(Ok(())).await?;
//! ```

use arrow::array::RecordBatch;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tabletsink_core::{
    CommitLedger, LoadId, NodeId, PartitionDescriptor, RowBatch, TabletCommitInfo, TabletId,
};
use tabletsink_observability::metrics::{
    SINK_FILTERED_ROWS_TOTAL, SINK_INPUT_ROWS_TOTAL, SINK_LOADS_TOTAL, SINK_OUTPUT_ROWS_TOTAL,
    SINK_PHASE_LATENCY, SINK_SEND_LATENCY,
};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SinkConfig;
use crate::distribution::RowDistributor;
use crate::error::{Result, SinkError};
use crate::fanout;
use crate::local_writer::LocalWriterMap;
use crate::partition_sync::{CreationOutcome, PartitionCreator, PartitionSync};
use crate::resolver;
use crate::state::LoadState;
use crate::stats::{SinkStats, SinkStatsSnapshot};
use crate::stream_pool::StreamPool;
use crate::topology::{ReplicaRoute, ReplicaTopology, TopologyDelta};
use crate::transport::{LocalStorageEngine, ReplicaTransport, StreamOpenParams};

/// Result of a committed load.
#[derive(Debug, Clone, Serialize)]
pub struct LoadSummary {
    pub load_id: LoadId,
    pub txn_id: i64,
    /// One entry per replica per committed tablet.
    pub commit_infos: Vec<TabletCommitInfo>,
    pub stats: SinkStatsSnapshot,
}

struct Routing {
    topology: Arc<ReplicaTopology>,
    streams: StreamPool,
}

pub struct LoadSink {
    config: SinkConfig,
    distributor: Arc<dyn RowDistributor>,
    static_partitions: Vec<PartitionDescriptor>,
    routing: RwLock<Routing>,
    locals: LocalWriterMap,
    partition_sync: PartitionSync,
    state: Mutex<LoadState>,
    cancel_reason: Mutex<Option<String>>,
    cancel_token: CancellationToken,
    touched: Mutex<BTreeSet<TabletId>>,
    stats: Arc<SinkStats>,
}

impl LoadSink {
    pub fn builder(config: SinkConfig) -> LoadSinkBuilder {
        LoadSinkBuilder::new(config)
    }

    pub fn load_id(&self) -> LoadId {
        self.config.load_id
    }

    pub fn config(&self) -> &SinkConfig {
        &self.config
    }

    pub async fn state(&self) -> LoadState {
        *self.state.lock().await
    }

    pub fn stats(&self) -> SinkStatsSnapshot {
        self.stats.snapshot()
    }

    /// Current topology snapshot.
    pub async fn topology(&self) -> Arc<ReplicaTopology> {
        Arc::clone(&self.routing.read().await.topology)
    }

    pub async fn open_stream_count(&self) -> usize {
        self.routing.read().await.streams.open_stream_count()
    }

    /// Tablets that received at least one row.
    pub async fn touched_tablets(&self) -> BTreeSet<TabletId> {
        self.touched.lock().await.clone()
    }

    /// Build the topology of the static partitions and open streams to every
    /// remote node they reference.
    pub async fn open(&self) -> Result<()> {
        let start = Instant::now();
        {
            let state = *self.state.lock().await;
            if state != LoadState::Created {
                return Err(self.state_error(state).await);
            }
        }

        info!(
            load_id = %self.config.load_id,
            txn_id = self.config.txn_id,
            sender_id = self.config.sender_id,
            num_senders = self.config.num_senders,
            partitions = self.static_partitions.len(),
            "Opening load"
        );

        if let Err(err) = self.open_routing().await {
            error!(load_id = %self.config.load_id, error = %err, "Failed to open load");
            self.abort_load(err.to_string(), "failed").await;
            return Err(err);
        }

        {
            let mut state = self.state.lock().await;
            if *state != LoadState::Created {
                let current = *state;
                drop(state);
                return Err(self.state_error(current).await);
            }
            state.transition(LoadState::Opened)?;
        }

        SINK_PHASE_LATENCY
            .with_label_values(&["open"])
            .observe(start.elapsed().as_secs_f64());
        info!(
            load_id = %self.config.load_id,
            streams = self.open_stream_count().await,
            "Load opened"
        );
        Ok(())
    }

    async fn open_routing(&self) -> Result<()> {
        let topology = ReplicaTopology::build(
            self.config.local_node_id,
            self.config.num_replicas,
            &self.static_partitions,
        )?;

        let mut routing = self.routing.write().await;
        let plans = topology
            .remote_nodes()
            .into_iter()
            .map(|node| {
                (
                    node,
                    topology.tablet_descriptors_for_node(node),
                    topology.indexes_for_node(node),
                )
            })
            .collect();
        routing.streams.open_nodes(plans).await?;
        routing.topology = Arc::new(topology);
        Ok(())
    }

    /// Route and replicate one batch.
    ///
    /// Blocks while partitions the batch needs are being created. A fatal error
    /// cancels the load before it is returned. With `is_last`, every stream and
    /// local writer is told that no more rows will arrive.
    pub async fn send(&self, batch: RecordBatch, is_last: bool) -> Result<()> {
        self.ensure_open().await?;

        let result = self.send_inner(batch, is_last).await;
        if let Err(err) = &result {
            if err.is_fatal() {
                error!(load_id = %self.config.load_id, error = %err, "Send failed, cancelling load");
                self.abort_load(err.to_string(), "failed").await;
            }
        }
        result
    }

    async fn send_inner(&self, batch: RecordBatch, is_last: bool) -> Result<()> {
        let batch = RowBatch::new(batch);
        let num_rows = batch.num_rows();
        self.stats.record_batch(num_rows);
        SINK_INPUT_ROWS_TOTAL.inc_by(num_rows as u64);

        if num_rows > 0 {
            self.route_and_dispatch(&batch).await?;
        }

        if self.cancel_token.is_cancelled() {
            return Err(self.cancelled_error().await);
        }
        if is_last {
            self.finish_all().await?;
        }
        Ok(())
    }

    async fn route_and_dispatch(&self, batch: &RowBatch) -> Result<()> {
        let start = Instant::now();
        let targets = self.distributor.compute_targets(batch.record_batch())?;
        let topology = self.topology().await;
        let mut resolution = resolver::resolve(&targets, &topology);

        let elapsed = start.elapsed();
        self.stats.add_distribute_time(elapsed);
        SINK_SEND_LATENCY
            .with_label_values(&["distribute"])
            .observe(elapsed.as_secs_f64());

        if let Some((row, reason)) = resolution.filtered.first() {
            let filtered = resolution.filtered.len();
            self.stats.record_filtered(filtered);
            SINK_FILTERED_ROWS_TOTAL.inc_by(filtered as u64);
            debug!(
                load_id = %self.config.load_id,
                filtered,
                first_row = row,
                reason = %reason,
                "Filtered rows that could not be routed"
            );
        }

        if !resolution.unresolved.is_empty() {
            let keys = resolution.missing_keys();
            debug!(
                load_id = %self.config.load_id,
                partitions = keys.len(),
                rows = resolution.unresolved_rows(),
                "Batch waits on partition creation"
            );
            let pending = std::mem::take(&mut resolution.unresolved);

            let partitions = match self.partition_sync.ensure_partitions(&keys).await {
                Ok(partitions) => partitions,
                Err(SinkError::Cancelled(_)) => return Err(self.cancelled_error().await),
                Err(err) => return Err(err),
            };
            self.apply_partitions(partitions).await?;

            let topology = self.topology().await;
            let late = resolver::resolve_pending(pending, &topology);
            if let Some(key) = late.unresolved.keys().next() {
                return Err(SinkError::PartitionCreation(format!(
                    "partition '{}' is still missing after creation",
                    key
                )));
            }
            resolution.merge(late);
        }

        let writes = {
            let routing = self.routing.read().await;
            fanout::plan(&resolution.rows_for_tablet, &routing.topology, &routing.streams)?
        };
        let touched = fanout::dispatch(batch, &writes, &self.locals, &self.stats).await?;
        self.touched.lock().await.extend(touched);

        let output = resolution.routed_rows();
        self.stats.record_output(output);
        SINK_OUTPUT_ROWS_TOTAL.inc_by(output as u64);
        Ok(())
    }

    async fn finish_all(&self) -> Result<()> {
        let routing = self.routing.read().await;
        routing.streams.finish_all().await?;
        self.locals.finish_all().await?;
        Ok(())
    }

    /// Apply a partition creation result to the running load.
    ///
    /// On success the new partitions are merged into the topology: streams are
    /// opened to nodes the load has not seen yet, and the new tablets are announced
    /// to nodes already connected. A failed result, or a failure applying it,
    /// cancels the load. A result arriving after cancel is discarded.
    pub async fn on_partitions_created(&self, result: CreationOutcome) -> Result<TopologyDelta> {
        let outcome = match result {
            Ok(partitions) => self.apply_partitions(partitions).await,
            Err(reason) => Err(SinkError::PartitionCreation(reason)),
        };
        if let Err(err) = &outcome {
            if err.is_fatal() {
                self.abort_load(err.to_string(), "failed").await;
            }
        }
        outcome
    }

    async fn apply_partitions(&self, partitions: Vec<PartitionDescriptor>) -> Result<TopologyDelta> {
        if self.cancel_token.is_cancelled() {
            debug!(load_id = %self.config.load_id, "Ignoring created partitions, load cancelled");
            return Err(self.cancelled_error().await);
        }

        let mut routing = self.routing.write().await;
        let (next, delta) = routing.topology.with_partitions(&partitions)?;
        if delta.is_empty() {
            return Ok(delta);
        }

        let plans = delta
            .new_nodes
            .iter()
            .map(|&node| {
                (
                    node,
                    next.tablet_descriptors_for_node(node),
                    next.indexes_for_node(node),
                )
            })
            .collect();
        routing.streams.open_nodes(plans).await?;

        for (node, tablets) in &delta.remote_tablets {
            if !delta.new_nodes.contains(node) {
                routing.streams.announce(*node, tablets).await?;
            }
        }

        routing.topology = Arc::new(next);
        info!(
            load_id = %self.config.load_id,
            partitions = ?delta.partitions,
            new_nodes = delta.new_nodes.len(),
            local_tablets = delta.local_tablets.len(),
            "Applied created partitions"
        );
        Ok(delta)
    }

    /// Finish the load.
    ///
    /// With `Err(status)` the load is cancelled and the status returned. Otherwise
    /// every stream and local writer is drained and closed, and the load commits
    /// only if every replica of every touched tablet acknowledged.
    pub async fn close(&self, incoming: Result<()>) -> Result<LoadSummary> {
        let start = Instant::now();

        if let Err(status) = incoming {
            let state = *self.state.lock().await;
            if state == LoadState::Closed {
                return Err(SinkError::AlreadyClosed(state));
            }
            info!(load_id = %self.config.load_id, status = %status, "Close with failed status");
            self.abort_load(status.to_string(), "failed").await;
            return Err(status);
        }

        {
            let mut state = self.state.lock().await;
            if *state != LoadState::Opened {
                let current = *state;
                drop(state);
                return Err(self.state_error(current).await);
            }
            state.transition(LoadState::Closing)?;
        }

        let commit_infos = match self.commit().await {
            Ok(infos) => infos,
            Err(err) => {
                error!(load_id = %self.config.load_id, error = %err, "Close failed, cancelling load");
                self.abort_load(err.to_string(), "failed").await;
                return Err(err);
            }
        };

        {
            let mut state = self.state.lock().await;
            if *state != LoadState::Closing {
                let current = *state;
                drop(state);
                return Err(self.state_error(current).await);
            }
            state.transition(LoadState::Closed)?;
        }

        SINK_LOADS_TOTAL.with_label_values(&["committed"]).inc();
        SINK_PHASE_LATENCY
            .with_label_values(&["close"])
            .observe(start.elapsed().as_secs_f64());

        let stats = self.stats.snapshot();
        info!(
            load_id = %self.config.load_id,
            txn_id = self.config.txn_id,
            tablets = commit_infos.len(),
            input_rows = stats.input_rows,
            output_rows = stats.output_rows,
            filtered_rows = stats.filtered_rows,
            "Load committed"
        );

        Ok(LoadSummary {
            load_id: self.config.load_id,
            txn_id: self.config.txn_id,
            commit_infos,
            stats,
        })
    }

    async fn commit(&self) -> Result<Vec<TabletCommitInfo>> {
        let routing = self.routing.read().await;
        routing.streams.finish_all().await?;
        self.locals.finish_all().await?;

        let touched = self.touched.lock().await.clone();
        let topology = Arc::clone(&routing.topology);

        let mut tablets_to_commit: BTreeMap<NodeId, Vec<TabletId>> = BTreeMap::new();
        for &tablet in &touched {
            for route in topology.routes(tablet) {
                if let ReplicaRoute::Remote(node) = route {
                    tablets_to_commit.entry(*node).or_default().push(tablet);
                }
            }
        }

        debug!(
            load_id = %self.config.load_id,
            remote_nodes = tablets_to_commit.len(),
            local_tablets = self.locals.len().await,
            "Closing replicas"
        );

        let retry = self.config.retry_policy();
        let close_timeout = self.config.close_timeout();
        let (remote, local) = tokio::join!(
            routing
                .streams
                .close_all(&tablets_to_commit, close_timeout, &retry),
            self.locals.close_all(close_timeout, &retry),
        );

        let mut infos = remote.map_err(|e| SinkError::Commit(e.to_string()))?;
        infos.extend(local.map_err(|e| SinkError::Commit(e.to_string()))?);

        let mut ledger = CommitLedger::new();
        ledger.extend(&infos);
        let local_node = self.config.local_node_id;
        for &tablet in &touched {
            let expected: Vec<NodeId> = topology
                .routes(tablet)
                .iter()
                .map(|route| match route {
                    ReplicaRoute::Local => local_node,
                    ReplicaRoute::Remote(node) => *node,
                })
                .collect();
            let missing = ledger.missing(tablet, &expected);
            if !missing.is_empty() {
                let missing: Vec<String> = missing.iter().map(ToString::to_string).collect();
                return Err(SinkError::Commit(format!(
                    "tablet {} not acknowledged by {}",
                    tablet,
                    missing.join(", ")
                )));
            }
        }

        Ok(infos)
    }

    /// Abort the load on every stream and local writer.
    ///
    /// Idempotent and best effort: a second call, or a call after the load
    /// committed, does nothing.
    pub async fn cancel(&self, reason: impl Into<String>) {
        self.abort_load(reason.into(), "cancelled").await;
    }

    async fn abort_load(&self, reason: String, outcome: &'static str) {
        let start = Instant::now();
        {
            let mut state = self.state.lock().await;
            if !state.can_transition_to(LoadState::Cancelling) {
                debug!(
                    load_id = %self.config.load_id,
                    state = %*state,
                    "Cancel ignored"
                );
                return;
            }
            *self.cancel_reason.lock().await = Some(reason.clone());
            state.transition(LoadState::Cancelling).ok();
        }

        warn!(load_id = %self.config.load_id, reason = %reason, "Cancelling load");
        self.cancel_token.cancel();

        let budget = self.config.close_timeout();
        {
            let routing = self.routing.read().await;
            tokio::join!(
                routing.streams.abort_all(&reason, budget),
                self.locals.abort_all(&reason, budget),
            );
        }

        self.state
            .lock()
            .await
            .transition(LoadState::Cancelled)
            .ok();

        SINK_LOADS_TOTAL.with_label_values(&[outcome]).inc();
        SINK_PHASE_LATENCY
            .with_label_values(&["cancel"])
            .observe(start.elapsed().as_secs_f64());
        info!(load_id = %self.config.load_id, "Load cancelled");
    }

    async fn ensure_open(&self) -> Result<()> {
        let state = *self.state.lock().await;
        if state == LoadState::Opened {
            return Ok(());
        }
        Err(self.state_error(state).await)
    }

    /// The error a call gets when the load is not in the state it needs.
    async fn state_error(&self, state: LoadState) -> SinkError {
        match state {
            LoadState::Created => SinkError::NotOpen(state),
            LoadState::Cancelling | LoadState::Cancelled => self.cancelled_error().await,
            LoadState::Opened => SinkError::InvalidState {
                from: state,
                to: LoadState::Opened,
            },
            LoadState::Closing | LoadState::Closed => SinkError::AlreadyClosed(state),
        }
    }

    async fn cancelled_error(&self) -> SinkError {
        let reason = self.cancel_reason.lock().await.clone();
        SinkError::Cancelled(reason.unwrap_or_else(|| "load cancelled".to_string()))
    }
}

/// Builder for [`LoadSink`].
///
/// `transport` and `distributor` are required. Without a `local_engine`, a tablet
/// with a replica on `local_node_id` fails the load on its first row; without a
/// `partition_creator`, rows for unknown partitions do.
pub struct LoadSinkBuilder {
    config: SinkConfig,
    transport: Option<Arc<dyn ReplicaTransport>>,
    local_engine: Option<Arc<dyn LocalStorageEngine>>,
    partition_creator: Option<Arc<dyn PartitionCreator>>,
    distributor: Option<Arc<dyn RowDistributor>>,
    partitions: Vec<PartitionDescriptor>,
}

impl LoadSinkBuilder {
    pub fn new(config: SinkConfig) -> Self {
        Self {
            config,
            transport: None,
            local_engine: None,
            partition_creator: None,
            distributor: None,
            partitions: Vec::new(),
        }
    }

    pub fn transport(mut self, transport: Arc<dyn ReplicaTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn local_engine(mut self, engine: Arc<dyn LocalStorageEngine>) -> Self {
        self.local_engine = Some(engine);
        self
    }

    pub fn partition_creator(mut self, creator: Arc<dyn PartitionCreator>) -> Self {
        self.partition_creator = Some(creator);
        self
    }

    pub fn distributor(mut self, distributor: Arc<dyn RowDistributor>) -> Self {
        self.distributor = Some(distributor);
        self
    }

    /// Partitions known when the load starts.
    pub fn partitions(mut self, partitions: Vec<PartitionDescriptor>) -> Self {
        self.partitions = partitions;
        self
    }

    pub fn build(self) -> Result<LoadSink> {
        self.config.validate()?;
        let transport = self
            .transport
            .ok_or_else(|| SinkError::Config("transport is required".to_string()))?;
        let distributor = self
            .distributor
            .ok_or_else(|| SinkError::Config("distributor is required".to_string()))?;

        let config = self.config;
        let stats = Arc::new(SinkStats::new());
        let cancel_token = CancellationToken::new();

        let params = StreamOpenParams {
            load_id: config.load_id,
            txn_id: config.txn_id,
            sender_id: config.sender_id,
            num_senders: config.num_senders,
            stream_index: 0,
            indexes: Vec::new(),
            high_priority: config.high_priority,
            write_file_cache: config.write_file_cache,
        };
        let streams = StreamPool::new(
            transport,
            params,
            config.streams_per_node,
            config.open_timeout(),
            config.retry_policy(),
        );
        let locals = LocalWriterMap::new(
            self.local_engine,
            config.local_node_id,
            config.load_id,
            config.txn_id,
        );
        let partition_sync = PartitionSync::new(
            self.partition_creator,
            config.load_id,
            config.txn_id,
            config.partition_creation_timeout(),
            cancel_token.clone(),
            Arc::clone(&stats),
        );

        Ok(LoadSink {
            routing: RwLock::new(Routing {
                topology: Arc::new(ReplicaTopology::new(
                    config.local_node_id,
                    config.num_replicas,
                )),
                streams,
            }),
            distributor,
            static_partitions: self.partitions,
            locals,
            partition_sync,
            state: Mutex::new(LoadState::Created),
            cancel_reason: Mutex::new(None),
            cancel_token,
            touched: Mutex::new(BTreeSet::new()),
            stats,
            config,
        })
    }
}
