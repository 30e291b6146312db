//! Replica Stream Pool
//!
//! Owns every stream a load keeps open to remote nodes.
//!
//! ## Design
//!
//! Each remote node gets `streams_per_node` parallel streams, opened together the
//! first time the node appears in the topology. Tablets are announced on the node's
//! first stream, and each tablet is announced to a node at most once per load no
//! matter how many partition creations touch it.
//!
//! ```text
//! StreamPool
//!   ├── node-2: [s0, s1]  next=7  announced={t100, t200}
//!   └── node-3: [s0, s1]  next=4  announced={t100}
//! ```
//!
//! Writes pick a stream of the replica node with a per-node round-robin counter, so
//! consecutive writes spread across the node's streams.
//!
//! ## Thread Safety
//!
//! Opening and announcing take `&mut self` and run under the coordinator's routing
//! write lock. Selection, draining, closing and aborting take `&self`.
//!
//! ## Close
//!
//! ```text
//! node-2 s0 ── close([t100, t200]) ──► commit infos
//! node-2 s1 ── close([])           ──► drain only
//! ```

use futures::future::join_all;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tabletsink_core::{
    IndexId, NodeId, ReplicaError, TabletCommitInfo, TabletDescriptor, TabletId,
};
use tabletsink_observability::metrics::{SINK_REPLICA_ERRORS_TOTAL, SINK_STREAMS_OPEN};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::retry::{retry_with_backoff, retry_with_jittered_backoff, RetryPolicy};
use crate::transport::{ReplicaStream, ReplicaTransport, StreamOpenParams};

/// The streams of one remote node.
pub struct NodeStreams {
    node: NodeId,
    streams: Vec<Arc<dyn ReplicaStream>>,
    next: AtomicUsize,
    announced: HashSet<TabletId>,
    eos_sent: AtomicBool,
}

impl NodeStreams {
    fn new(node: NodeId, streams: Vec<Arc<dyn ReplicaStream>>) -> Self {
        Self {
            node,
            streams,
            next: AtomicUsize::new(0),
            announced: HashSet::new(),
            eos_sent: AtomicBool::new(false),
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Next stream in round-robin order.
    pub fn select(&self) -> Option<Arc<dyn ReplicaStream>> {
        if self.streams.is_empty() {
            return None;
        }
        let slot = self.next.fetch_add(1, Ordering::Relaxed) % self.streams.len();
        Some(Arc::clone(&self.streams[slot]))
    }

    pub fn is_announced(&self, tablet: TabletId) -> bool {
        self.announced.contains(&tablet)
    }
}

pub struct StreamPool {
    transport: Arc<dyn ReplicaTransport>,
    params: StreamOpenParams,
    streams_per_node: usize,
    open_timeout: Duration,
    retry: RetryPolicy,
    nodes: BTreeMap<NodeId, NodeStreams>,
    released: AtomicBool,
}

impl StreamPool {
    /// `params` is the template for every stream open; its `stream_index` and
    /// `indexes` are filled in per stream.
    pub fn new(
        transport: Arc<dyn ReplicaTransport>,
        params: StreamOpenParams,
        streams_per_node: usize,
        open_timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            params,
            streams_per_node,
            open_timeout,
            retry,
            nodes: BTreeMap::new(),
            released: AtomicBool::new(false),
        }
    }

    /// Open streams to `node` and announce `tablets` on them.
    pub async fn open_node(
        &mut self,
        node: NodeId,
        tablets: Vec<TabletDescriptor>,
        indexes: Vec<IndexId>,
    ) -> Result<(), ReplicaError> {
        self.open_nodes(vec![(node, tablets, indexes)]).await
    }

    /// Open several nodes concurrently.
    ///
    /// Streams that did open are kept even when another open fails, so a later abort
    /// reaches them.
    pub async fn open_nodes(
        &mut self,
        plans: Vec<(NodeId, Vec<TabletDescriptor>, Vec<IndexId>)>,
    ) -> Result<(), ReplicaError> {
        let plans: Vec<_> = plans
            .into_iter()
            .filter(|(node, _, _)| !self.nodes.contains_key(node))
            .collect();
        if plans.is_empty() {
            return Ok(());
        }

        let results = {
            let this = &*self;
            join_all(
                plans
                    .into_iter()
                    .map(|(node, tablets, indexes)| this.connect(node, tablets, indexes)),
            )
            .await
        };

        let mut first_error = None;
        for (streams, result) in results {
            SINK_STREAMS_OPEN.add(streams.len() as i64);
            if let Err(err) = result {
                record_replica_error("open", &err);
                first_error.get_or_insert(err);
            }
            self.nodes.insert(streams.node, streams);
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn connect(
        &self,
        node: NodeId,
        tablets: Vec<TabletDescriptor>,
        indexes: Vec<IndexId>,
    ) -> (NodeStreams, Result<(), ReplicaError>) {
        let mut streams = Vec::with_capacity(self.streams_per_node);

        for stream_index in 0..self.streams_per_node {
            let params = StreamOpenParams {
                stream_index,
                indexes: indexes.clone(),
                ..self.params.clone()
            };
            let params = &params;
            let transport = &self.transport;
            let budget = self.open_timeout;
            let opened = retry_with_jittered_backoff(&self.retry, || async move {
                match timeout(budget, transport.open_stream(node, params)).await {
                    Ok(result) => result,
                    Err(_) => Err(ReplicaError::timeout(
                        node,
                        format!("stream open timed out after {:?}", budget),
                    )),
                }
            })
            .await;

            match opened {
                Ok(stream) => streams.push(stream),
                Err(err) => {
                    warn!(
                        node_id = %node,
                        stream_index,
                        error = %err,
                        "Failed to open replica stream"
                    );
                    return (NodeStreams::new(node, streams), Err(err));
                }
            }
        }

        let mut node_streams = NodeStreams::new(node, streams);
        let result = Self::announce_to(&mut node_streams, &tablets).await.map(|_| ());
        if result.is_ok() {
            info!(
                node_id = %node,
                streams = node_streams.len(),
                tablets = tablets.len(),
                "Opened replica streams"
            );
        }
        (node_streams, result)
    }

    /// Announce `tablets` to an already connected node.
    ///
    /// Tablets the node already knows are skipped. Returns how many were announced.
    pub async fn announce(
        &mut self,
        node: NodeId,
        tablets: &[TabletDescriptor],
    ) -> Result<usize, ReplicaError> {
        let node_streams = self.nodes.get_mut(&node).ok_or_else(|| {
            ReplicaError::internal(node, "announce to a node without streams")
        })?;
        let result = Self::announce_to(node_streams, tablets).await;
        if let Err(err) = &result {
            record_replica_error("announce", err);
        }
        result
    }

    async fn announce_to(
        node_streams: &mut NodeStreams,
        tablets: &[TabletDescriptor],
    ) -> Result<usize, ReplicaError> {
        let fresh: Vec<TabletDescriptor> = tablets
            .iter()
            .filter(|tablet| !node_streams.announced.contains(&tablet.tablet_id))
            .cloned()
            .collect();
        if fresh.is_empty() {
            return Ok(0);
        }

        let first = node_streams.streams.first().ok_or_else(|| {
            ReplicaError::unavailable(node_streams.node, "no open stream to announce on")
        })?;
        first.announce(&fresh).await?;

        node_streams
            .announced
            .extend(fresh.iter().map(|tablet| tablet.tablet_id));
        debug!(node_id = %node_streams.node, tablets = fresh.len(), "Announced tablets");
        Ok(fresh.len())
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.nodes.contains_key(&node)
    }

    pub fn node(&self, node: NodeId) -> Option<&NodeStreams> {
        self.nodes.get(&node)
    }

    /// Pick the next stream to `node`.
    pub fn select(&self, node: NodeId) -> Option<Arc<dyn ReplicaStream>> {
        self.nodes.get(&node).and_then(NodeStreams::select)
    }

    pub fn open_stream_count(&self) -> usize {
        self.nodes.values().map(NodeStreams::len).sum()
    }

    /// Signal end-of-stream on every stream that has not been signalled yet.
    pub async fn finish_all(&self) -> Result<(), ReplicaError> {
        let pending: Vec<Arc<dyn ReplicaStream>> = self
            .nodes
            .values()
            .filter(|node| !node.eos_sent.swap(true, Ordering::AcqRel))
            .flat_map(|node| node.streams.iter().cloned())
            .collect();

        let results = join_all(pending.iter().map(|stream| stream.end_of_stream())).await;
        results.into_iter().collect::<Result<Vec<_>, _>>()?;
        Ok(())
    }

    /// Close every stream and collect the commit acknowledgements.
    ///
    /// `tablets_to_commit` goes on each node's first stream. Every close is bounded by
    /// `close_timeout` and retried per `retry`.
    pub async fn close_all(
        &self,
        tablets_to_commit: &BTreeMap<NodeId, Vec<TabletId>>,
        close_timeout: Duration,
        retry: &RetryPolicy,
    ) -> Result<Vec<TabletCommitInfo>, ReplicaError> {
        let mut closes = Vec::new();
        for node in self.nodes.values() {
            for (index, stream) in node.streams.iter().enumerate() {
                let tablets: &[TabletId] = if index == 0 {
                    tablets_to_commit
                        .get(&node.node)
                        .map(Vec::as_slice)
                        .unwrap_or(&[])
                } else {
                    &[]
                };
                closes.push(Self::close_stream(
                    node.node,
                    Arc::clone(stream),
                    tablets,
                    close_timeout,
                    retry,
                ));
            }
        }

        let results = join_all(closes).await;
        self.release();

        let mut infos = Vec::new();
        let mut first_error = None;
        for result in results {
            match result {
                Ok(mut committed) => infos.append(&mut committed),
                Err(err) => {
                    record_replica_error("close", &err);
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(infos),
        }
    }

    async fn close_stream(
        node: NodeId,
        stream: Arc<dyn ReplicaStream>,
        tablets: &[TabletId],
        close_timeout: Duration,
        retry: &RetryPolicy,
    ) -> Result<Vec<TabletCommitInfo>, ReplicaError> {
        retry_with_backoff(retry, || {
            let stream = Arc::clone(&stream);
            async move {
                match timeout(close_timeout, stream.close(tablets)).await {
                    Ok(result) => result,
                    Err(_) => Err(ReplicaError::timeout(
                        node,
                        format!(
                            "{} did not acknowledge within {:?}",
                            stream.stream_id(),
                            close_timeout
                        ),
                    )),
                }
            }
        })
        .await
    }

    /// Abort every stream. Each abort is bounded by `budget`; stragglers are ignored.
    pub async fn abort_all(&self, reason: &str, budget: Duration) {
        let aborts = self.nodes.values().flat_map(move |node| {
            node.streams.iter().map(move |stream| {
                let stream = Arc::clone(stream);
                async move {
                    if timeout(budget, stream.abort(reason)).await.is_err() {
                        warn!(
                            node_id = %node.node,
                            stream = %stream.stream_id(),
                            "Abort did not finish in time, ignoring"
                        );
                    }
                }
            })
        });
        join_all(aborts).await;
        self.release();
    }

    fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            SINK_STREAMS_OPEN.sub(self.open_stream_count() as i64);
        }
    }
}

pub(crate) fn record_replica_error(operation: &str, err: &ReplicaError) {
    let kind = err.kind.to_string();
    SINK_REPLICA_ERRORS_TOTAL
        .with_label_values(&[operation, kind.as_str()])
        .inc();
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tabletsink_core::{LoadId, RowBatch, RowSelection, StreamId};

    #[derive(Default)]
    struct Log {
        opens: Mutex<Vec<(NodeId, usize, Vec<IndexId>)>>,
        announces: Mutex<Vec<(StreamId, Vec<TabletId>)>>,
        closes: Mutex<Vec<(StreamId, Vec<TabletId>)>>,
        aborts: AtomicUsize,
        eos: AtomicUsize,
    }

    struct FakeStream {
        id: StreamId,
        log: Arc<Log>,
    }

    #[async_trait]
    impl ReplicaStream for FakeStream {
        fn stream_id(&self) -> StreamId {
            self.id
        }

        async fn announce(&self, tablets: &[TabletDescriptor]) -> Result<(), ReplicaError> {
            self.log.announces.lock().unwrap().push((
                self.id,
                tablets.iter().map(|tablet| tablet.tablet_id).collect(),
            ));
            Ok(())
        }

        async fn append(
            &self,
            _tablet: TabletId,
            _batch: RowBatch,
            _rows: RowSelection,
        ) -> Result<(), ReplicaError> {
            Ok(())
        }

        async fn end_of_stream(&self) -> Result<(), ReplicaError> {
            self.log.eos.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn close(
            &self,
            tablets_to_commit: &[TabletId],
        ) -> Result<Vec<TabletCommitInfo>, ReplicaError> {
            self.log
                .closes
                .lock()
                .unwrap()
                .push((self.id, tablets_to_commit.to_vec()));
            Ok(tablets_to_commit
                .iter()
                .map(|&tablet| TabletCommitInfo::new(tablet, self.id.node, 0))
                .collect())
        }

        async fn abort(&self, _reason: &str) {
            self.log.aborts.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FakeTransport {
        log: Arc<Log>,
        refuse: Option<NodeId>,
    }

    #[async_trait]
    impl ReplicaTransport for FakeTransport {
        async fn open_stream(
            &self,
            node: NodeId,
            params: &StreamOpenParams,
        ) -> Result<Arc<dyn ReplicaStream>, ReplicaError> {
            if self.refuse == Some(node) {
                return Err(ReplicaError::rejected(node, "refused"));
            }
            self.log
                .opens
                .lock()
                .unwrap()
                .push((node, params.stream_index, params.indexes.clone()));
            Ok(Arc::new(FakeStream {
                id: StreamId {
                    node,
                    index: params.stream_index,
                },
                log: Arc::clone(&self.log),
            }))
        }
    }

    fn params() -> StreamOpenParams {
        StreamOpenParams {
            load_id: LoadId::new(),
            txn_id: 1,
            sender_id: 0,
            num_senders: 1,
            stream_index: 0,
            indexes: vec![],
            high_priority: false,
            write_file_cache: false,
        }
    }

    fn pool(log: &Arc<Log>, refuse: Option<NodeId>) -> StreamPool {
        let transport = Arc::new(FakeTransport {
            log: Arc::clone(log),
            refuse,
        });
        StreamPool::new(
            transport,
            params(),
            2,
            Duration::from_secs(1),
            RetryPolicy::no_retry(),
        )
    }

    fn tablet(id: i64, node: u64) -> TabletDescriptor {
        TabletDescriptor::new(id, 1, 10, vec![NodeId(node)])
    }

    #[tokio::test]
    async fn test_open_node_opens_streams_and_announces_once() {
        let log = Arc::new(Log::default());
        let mut pool = pool(&log, None);

        pool.open_node(NodeId(2), vec![tablet(100, 2)], vec![IndexId(10)])
            .await
            .unwrap();

        assert_eq!(pool.open_stream_count(), 2);
        let opens = log.opens.lock().unwrap().clone();
        assert_eq!(opens.len(), 2);
        assert!(opens.iter().all(|(_, _, indexes)| indexes == &vec![IndexId(10)]));

        // Re-announcing a known tablet is a no-op; a new one goes on stream 0.
        let announced = pool
            .announce(NodeId(2), &[tablet(100, 2), tablet(101, 2)])
            .await
            .unwrap();
        assert_eq!(announced, 1);

        let announces = log.announces.lock().unwrap().clone();
        assert_eq!(announces.len(), 2);
        assert_eq!(announces[0].1, vec![TabletId(100)]);
        assert_eq!(announces[1].1, vec![TabletId(101)]);
        assert!(announces.iter().all(|(id, _)| id.index == 0));
        assert!(pool.node(NodeId(2)).unwrap().is_announced(TabletId(101)));
    }

    #[tokio::test]
    async fn test_select_round_robin_visits_every_stream() {
        let log = Arc::new(Log::default());
        let mut pool = pool(&log, None);
        pool.open_node(NodeId(2), vec![], vec![]).await.unwrap();

        let first = pool.select(NodeId(2)).unwrap().stream_id();
        let second = pool.select(NodeId(2)).unwrap().stream_id();
        let third = pool.select(NodeId(2)).unwrap().stream_id();

        assert_ne!(first, second);
        assert_eq!(first, third);
        assert!(pool.select(NodeId(9)).is_none());
    }

    #[tokio::test]
    async fn test_failed_open_keeps_opened_streams_for_abort() {
        let log = Arc::new(Log::default());
        let mut pool = pool(&log, Some(NodeId(3)));

        let err = pool
            .open_nodes(vec![
                (NodeId(2), vec![tablet(100, 2)], vec![]),
                (NodeId(3), vec![tablet(100, 3)], vec![]),
            ])
            .await
            .unwrap_err();
        assert_eq!(err.node, NodeId(3));
        assert!(pool.contains(NodeId(2)));

        pool.abort_all("test", Duration::from_secs(1)).await;
        assert_eq!(log.aborts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_close_sends_tablets_on_first_stream_only() {
        let log = Arc::new(Log::default());
        let mut pool = pool(&log, None);
        pool.open_node(NodeId(2), vec![tablet(100, 2)], vec![])
            .await
            .unwrap();

        pool.finish_all().await.unwrap();
        pool.finish_all().await.unwrap();
        assert_eq!(log.eos.load(Ordering::SeqCst), 2);

        let mut commit = BTreeMap::new();
        commit.insert(NodeId(2), vec![TabletId(100)]);
        let infos = pool
            .close_all(&commit, Duration::from_secs(1), &RetryPolicy::no_retry())
            .await
            .unwrap();

        assert_eq!(infos, vec![TabletCommitInfo::new(TabletId(100), NodeId(2), 0)]);
        let mut closes = log.closes.lock().unwrap().clone();
        closes.sort_by_key(|(id, _)| *id);
        assert_eq!(closes[0].1, vec![TabletId(100)]);
        assert!(closes[1].1.is_empty());
    }
}
