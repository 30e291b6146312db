//! In-memory collaborators for the sink integration tests.
//!
//! Every call the sink makes on a stream, a local writer or the metadata service is
//! appended to a shared [`CallLog`], so tests can assert on exactly what was sent
//! where. Faults are injected per node through [`Faults`].

#![allow(dead_code)]

use arrow::array::{Int64Array, RecordBatch, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tabletsink::{
    CreatePartitionRequest, CreationCompletion, CreationOutcome, HashDistributor, LoadSink,
    LoadSinkBuilder, LocalStorageEngine, LocalTabletWriter, PartitionCreator, ReplicaStream,
    ReplicaTransport, RetryConfig, SinkConfig, StreamOpenParams,
};
use tabletsink_core::{
    IndexId, LoadId, NodeId, PartitionDescriptor, PartitionKey, ReplicaError, RowBatch,
    RowSelection, StreamId, TabletCommitInfo, TabletDescriptor, TabletId,
};

pub const LOCAL_NODE: NodeId = NodeId(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Open {
        stream: StreamId,
        indexes: Vec<IndexId>,
    },
    Announce {
        stream: StreamId,
        tablets: Vec<TabletId>,
    },
    Append {
        stream: StreamId,
        tablet: TabletId,
        rows: Vec<u32>,
    },
    EndOfStream {
        stream: StreamId,
    },
    Close {
        stream: StreamId,
        tablets: Vec<TabletId>,
    },
    Abort {
        stream: StreamId,
    },
    LocalOpen {
        tablet: TabletId,
    },
    LocalAppend {
        tablet: TabletId,
        rows: Vec<u32>,
    },
    LocalClose {
        tablet: TabletId,
    },
    LocalAbort {
        tablet: TabletId,
    },
}

#[derive(Debug, Default)]
pub struct CallLog {
    calls: Mutex<Vec<Call>>,
}

impl CallLog {
    pub fn push(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|call| pred(call)).count()
    }

    pub fn opens(&self) -> Vec<StreamId> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Open { stream, .. } => Some(stream),
                _ => None,
            })
            .collect()
    }

    pub fn aborts(&self) -> Vec<StreamId> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Abort { stream } => Some(stream),
                _ => None,
            })
            .collect()
    }

    /// `(node, tablet, rows)` for every remote append, sorted.
    pub fn remote_appends(&self) -> Vec<(NodeId, TabletId, Vec<u32>)> {
        let mut appends: Vec<_> = self
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Append {
                    stream,
                    tablet,
                    rows,
                } => Some((stream.node, tablet, rows)),
                _ => None,
            })
            .collect();
        appends.sort();
        appends
    }

    /// Announced tablets per node, in announce order.
    pub fn announced(&self, node: NodeId) -> Vec<TabletId> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Announce { stream, tablets } if stream.node == node => Some(tablets),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// Tablet lists carried by the closes to `node`, one entry per stream.
    pub fn closes(&self, node: NodeId) -> Vec<(usize, Vec<TabletId>)> {
        let mut closes: Vec<_> = self
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Close { stream, tablets } if stream.node == node => {
                    Some((stream.index, tablets))
                }
                _ => None,
            })
            .collect();
        closes.sort();
        closes
    }
}

/// Per-node fault injection.
#[derive(Debug, Default)]
pub struct Faults {
    pub fail_open: Mutex<HashSet<NodeId>>,
    pub fail_announce: Mutex<HashSet<NodeId>>,
    pub fail_append: Mutex<HashSet<NodeId>>,
    pub hang_close: Mutex<HashSet<NodeId>>,
    pub drop_ack: Mutex<HashSet<NodeId>>,
    pub hang_abort: Mutex<HashSet<NodeId>>,
}

impl Faults {
    fn has(set: &Mutex<HashSet<NodeId>>, node: NodeId) -> bool {
        set.lock().unwrap().contains(&node)
    }

    pub fn fail_open(&self, node: NodeId) {
        self.fail_open.lock().unwrap().insert(node);
    }

    pub fn fail_announce(&self, node: NodeId) {
        self.fail_announce.lock().unwrap().insert(node);
    }

    pub fn fail_append(&self, node: NodeId) {
        self.fail_append.lock().unwrap().insert(node);
    }

    pub fn hang_close(&self, node: NodeId) {
        self.hang_close.lock().unwrap().insert(node);
    }

    pub fn drop_ack(&self, node: NodeId) {
        self.drop_ack.lock().unwrap().insert(node);
    }

    pub fn hang_abort(&self, node: NodeId) {
        self.hang_abort.lock().unwrap().insert(node);
    }
}

pub struct MockTransport {
    log: Arc<CallLog>,
    faults: Arc<Faults>,
    params: Mutex<Vec<StreamOpenParams>>,
}

impl MockTransport {
    pub fn new(log: Arc<CallLog>, faults: Arc<Faults>) -> Self {
        Self {
            log,
            faults,
            params: Mutex::new(Vec::new()),
        }
    }

    pub fn open_params(&self) -> Vec<StreamOpenParams> {
        self.params.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReplicaTransport for MockTransport {
    async fn open_stream(
        &self,
        node: NodeId,
        params: &StreamOpenParams,
    ) -> Result<Arc<dyn ReplicaStream>, ReplicaError> {
        if Faults::has(&self.faults.fail_open, node) {
            return Err(ReplicaError::rejected(node, "node refused the load"));
        }
        let stream = StreamId {
            node,
            index: params.stream_index,
        };
        self.params.lock().unwrap().push(params.clone());
        self.log.push(Call::Open {
            stream,
            indexes: params.indexes.clone(),
        });
        Ok(Arc::new(MockStream {
            id: stream,
            log: Arc::clone(&self.log),
            faults: Arc::clone(&self.faults),
            rows: Mutex::new(HashMap::new()),
        }))
    }
}

struct MockStream {
    id: StreamId,
    log: Arc<CallLog>,
    faults: Arc<Faults>,
    rows: Mutex<HashMap<TabletId, u64>>,
}

#[async_trait]
impl ReplicaStream for MockStream {
    fn stream_id(&self) -> StreamId {
        self.id
    }

    async fn announce(&self, tablets: &[TabletDescriptor]) -> Result<(), ReplicaError> {
        if Faults::has(&self.faults.fail_announce, self.id.node) {
            return Err(ReplicaError::rejected(self.id.node, "unknown tablet schema"));
        }
        self.log.push(Call::Announce {
            stream: self.id,
            tablets: tablets.iter().map(|tablet| tablet.tablet_id).collect(),
        });
        Ok(())
    }

    async fn append(
        &self,
        tablet: TabletId,
        _batch: RowBatch,
        rows: RowSelection,
    ) -> Result<(), ReplicaError> {
        if Faults::has(&self.faults.fail_append, self.id.node) {
            return Err(ReplicaError::rejected(self.id.node, "disk full"));
        }
        *self.rows.lock().unwrap().entry(tablet).or_default() += rows.len() as u64;
        self.log.push(Call::Append {
            stream: self.id,
            tablet,
            rows: rows.as_slice().to_vec(),
        });
        Ok(())
    }

    async fn end_of_stream(&self) -> Result<(), ReplicaError> {
        self.log.push(Call::EndOfStream { stream: self.id });
        Ok(())
    }

    async fn close(&self, tablets: &[TabletId]) -> Result<Vec<TabletCommitInfo>, ReplicaError> {
        self.log.push(Call::Close {
            stream: self.id,
            tablets: tablets.to_vec(),
        });
        if Faults::has(&self.faults.hang_close, self.id.node) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if Faults::has(&self.faults.drop_ack, self.id.node) {
            return Ok(Vec::new());
        }
        // Rows may have arrived on any of the node's streams; the count here is
        // only what this stream saw.
        let rows = self.rows.lock().unwrap();
        Ok(tablets
            .iter()
            .map(|&tablet| {
                TabletCommitInfo::new(tablet, self.id.node, rows.get(&tablet).copied().unwrap_or(0))
            })
            .collect())
    }

    async fn abort(&self, _reason: &str) {
        self.log.push(Call::Abort { stream: self.id });
        if Faults::has(&self.faults.hang_abort, self.id.node) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
    }
}

pub struct MockEngine {
    log: Arc<CallLog>,
}

impl MockEngine {
    pub fn new(log: Arc<CallLog>) -> Self {
        Self { log }
    }
}

#[async_trait]
impl LocalStorageEngine for MockEngine {
    async fn open(
        &self,
        tablet: &TabletDescriptor,
        _load_id: LoadId,
        _txn_id: i64,
    ) -> Result<Arc<dyn LocalTabletWriter>, ReplicaError> {
        self.log.push(Call::LocalOpen {
            tablet: tablet.tablet_id,
        });
        Ok(Arc::new(MockWriter {
            tablet: tablet.tablet_id,
            log: Arc::clone(&self.log),
            rows: Mutex::new(0),
        }))
    }
}

struct MockWriter {
    tablet: TabletId,
    log: Arc<CallLog>,
    rows: Mutex<u64>,
}

#[async_trait]
impl LocalTabletWriter for MockWriter {
    async fn append(&self, _batch: RowBatch, rows: RowSelection) -> Result<(), ReplicaError> {
        *self.rows.lock().unwrap() += rows.len() as u64;
        self.log.push(Call::LocalAppend {
            tablet: self.tablet,
            rows: rows.as_slice().to_vec(),
        });
        Ok(())
    }

    async fn close(&self) -> Result<TabletCommitInfo, ReplicaError> {
        self.log.push(Call::LocalClose {
            tablet: self.tablet,
        });
        Ok(TabletCommitInfo::new(self.tablet, LOCAL_NODE, *self.rows.lock().unwrap()).with_version(2))
    }

    async fn abort(&self, _reason: &str) {
        self.log.push(Call::LocalAbort {
            tablet: self.tablet,
        });
    }
}

/// How the mock metadata service answers.
pub enum CreatorMode {
    /// Complete inline with the partitions it knows.
    Immediate,
    /// Keep the completion until the test resolves it.
    Hold,
    /// Complete inline with an error.
    Refuse(String),
}

pub struct MockCreator {
    mode: CreatorMode,
    partitions: HashMap<PartitionKey, PartitionDescriptor>,
    requests: Mutex<Vec<CreatePartitionRequest>>,
    held: Mutex<Vec<CreationCompletion>>,
}

impl MockCreator {
    pub fn new(mode: CreatorMode, partitions: Vec<PartitionDescriptor>) -> Self {
        Self {
            mode,
            partitions: partitions
                .into_iter()
                .map(|partition| (partition.key.clone(), partition))
                .collect(),
            requests: Mutex::new(Vec::new()),
            held: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<CreatePartitionRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn take_held(&self) -> Vec<CreationCompletion> {
        std::mem::take(&mut *self.held.lock().unwrap())
    }

    pub fn outcome_for(&self, keys: &[PartitionKey]) -> CreationOutcome {
        Ok(keys
            .iter()
            .filter_map(|key| self.partitions.get(key).cloned())
            .collect())
    }

    /// Wait until `n` requests have arrived.
    pub async fn wait_for_requests(&self, n: usize) {
        for _ in 0..500 {
            if self.requests.lock().unwrap().len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("expected {} partition creation requests", n);
    }
}

#[async_trait]
impl PartitionCreator for MockCreator {
    async fn request_partition_creation(
        &self,
        request: CreatePartitionRequest,
        completion: CreationCompletion,
    ) -> Result<(), String> {
        self.requests.lock().unwrap().push(request.clone());
        match &self.mode {
            CreatorMode::Immediate => {
                completion.complete(self.outcome_for(&request.keys));
            }
            CreatorMode::Hold => self.held.lock().unwrap().push(completion),
            CreatorMode::Refuse(reason) => {
                completion.complete(Err(reason.clone()));
            }
        }
        Ok(())
    }
}

/// Everything a test needs to drive and inspect one load.
pub struct Harness {
    pub log: Arc<CallLog>,
    pub faults: Arc<Faults>,
    pub transport: Arc<MockTransport>,
    pub creator: Option<Arc<MockCreator>>,
}

impl Harness {
    pub fn new() -> Self {
        let log = Arc::new(CallLog::default());
        let faults = Arc::new(Faults::default());
        let transport = Arc::new(MockTransport::new(Arc::clone(&log), Arc::clone(&faults)));
        Self {
            log,
            faults,
            transport,
            creator: None,
        }
    }

    pub fn with_creator(mut self, mode: CreatorMode, partitions: Vec<PartitionDescriptor>) -> Self {
        self.creator = Some(Arc::new(MockCreator::new(mode, partitions)));
        self
    }

    pub fn creator(&self) -> &MockCreator {
        self.creator.as_deref().expect("harness has no creator")
    }

    pub fn sink(&self, config: SinkConfig, partitions: Vec<PartitionDescriptor>) -> LoadSink {
        let mut builder = LoadSinkBuilder::new(config)
            .transport(self.transport.clone())
            .local_engine(Arc::new(MockEngine::new(Arc::clone(&self.log))))
            .distributor(Arc::new(HashDistributor::new(
                "day",
                vec!["user_id".to_string()],
            )))
            .partitions(partitions);
        if let Some(creator) = &self.creator {
            builder = builder.partition_creator(creator.clone());
        }
        builder.build().unwrap()
    }
}

/// Two replicas, two streams per node, no retries and short budgets.
pub fn config() -> SinkConfig {
    SinkConfig {
        txn_id: 7,
        local_node_id: LOCAL_NODE,
        num_replicas: 2,
        streams_per_node: 2,
        open_timeout_ms: 1_000,
        close_timeout_ms: 200,
        partition_creation_timeout_ms: 2_000,
        retry: RetryConfig {
            max_retries: 0,
            initial_backoff_ms: 1,
            max_backoff_ms: 1,
            backoff_multiplier: 1.0,
        },
        ..Default::default()
    }
}

/// A single-index, single-tablet partition.
pub fn partition(id: i64, key: &str, tablet: i64, replicas: &[u64]) -> PartitionDescriptor {
    PartitionDescriptor::single_index(
        id,
        key,
        10,
        vec![(tablet, replicas.iter().copied().map(NodeId).collect())],
    )
}

/// Rows of `(day, user_id)`; a `None` day is a null partition key.
pub fn batch(rows: &[(Option<&str>, i64)]) -> RecordBatch {
    let schema = Arc::new(Schema::new(vec![
        Field::new("day", DataType::Utf8, true),
        Field::new("user_id", DataType::Int64, false),
    ]));
    let days: StringArray = rows.iter().map(|(day, _)| *day).collect();
    let users = Int64Array::from(rows.iter().map(|(_, user)| *user).collect::<Vec<_>>());
    RecordBatch::try_new(schema, vec![Arc::new(days), Arc::new(users)]).unwrap()
}

/// Rows that carry `user_id` but no `day` column.
pub fn batch_without_day(users: &[i64]) -> RecordBatch {
    let schema = Arc::new(Schema::new(vec![Field::new("user_id", DataType::Int64, false)]));
    RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(users.to_vec()))]).unwrap()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
