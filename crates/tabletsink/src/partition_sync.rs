//! Partition Creation Synchronizer
//!
//! Rows may target partitions that do not exist yet. The producer asks the metadata
//! service to create them and waits for the answer before routing those rows.
//!
//! ## State per partition key
//!
//! ```text
//! none ──request──► Requested ──completion Ok──► Granted
//!                       │
//!                       └──completion Err / timeout / dropped──► Failed
//! ```
//!
//! A key is requested at most once per load. A second caller that needs a key
//! already in `Requested` waits on the same outcome instead of sending another
//! request.
//!
//! ## Completion
//!
//! The metadata service answers through a [`CreationCompletion`], from any task. The
//! completion only delivers the outcome; merging the new partitions into the
//! topology and opening streams is done by the coordinator once the waiting
//! producer wakes up. A completion that arrives after the load was cancelled is
//! discarded.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tabletsink_core::{LoadId, PartitionDescriptor, PartitionKey};
use tabletsink_observability::metrics::{SINK_PARTITION_CREATIONS_TOTAL, SINK_PHASE_LATENCY};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, SinkError};
use crate::stats::SinkStats;

/// What the metadata service answers: the created partitions, or why it could not.
pub type CreationOutcome = std::result::Result<Vec<PartitionDescriptor>, String>;

/// A request to create the partitions for `keys`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatePartitionRequest {
    pub load_id: LoadId,
    pub txn_id: i64,
    pub keys: Vec<PartitionKey>,
}

/// One-shot handle the metadata service resolves when creation finishes.
pub struct CreationCompletion {
    tx: oneshot::Sender<CreationOutcome>,
    cancel: CancellationToken,
    keys: Vec<PartitionKey>,
}

impl CreationCompletion {
    pub fn keys(&self) -> &[PartitionKey] {
        &self.keys
    }

    /// Whether the load this completion belongs to was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Deliver the outcome. Returns `false` if it was discarded.
    pub fn complete(self, outcome: CreationOutcome) -> bool {
        if self.cancel.is_cancelled() {
            debug!(keys = ?self.keys, "Discarding partition creation result for cancelled load");
            SINK_PARTITION_CREATIONS_TOTAL
                .with_label_values(&["discarded"])
                .inc();
            return false;
        }
        self.tx.send(outcome).is_ok()
    }
}

/// The metadata service that creates partitions on demand.
#[async_trait]
pub trait PartitionCreator: Send + Sync {
    /// Submit a creation request. The outcome is delivered later through
    /// `completion`; an `Err` here means the request was not accepted at all.
    async fn request_partition_creation(
        &self,
        request: CreatePartitionRequest,
        completion: CreationCompletion,
    ) -> std::result::Result<(), String>;
}

enum KeyState {
    Requested(watch::Receiver<Option<CreationOutcome>>),
    Granted(PartitionDescriptor),
    Failed(String),
}

pub struct PartitionSync {
    creator: Option<Arc<dyn PartitionCreator>>,
    load_id: LoadId,
    txn_id: i64,
    wait_timeout: Duration,
    cancel: CancellationToken,
    stats: Arc<SinkStats>,
    states: Mutex<HashMap<PartitionKey, KeyState>>,
}

impl PartitionSync {
    pub fn new(
        creator: Option<Arc<dyn PartitionCreator>>,
        load_id: LoadId,
        txn_id: i64,
        wait_timeout: Duration,
        cancel: CancellationToken,
        stats: Arc<SinkStats>,
    ) -> Self {
        Self {
            creator,
            load_id,
            txn_id,
            wait_timeout,
            cancel,
            stats,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Make sure partitions exist for every key, requesting the missing ones.
    ///
    /// Blocks until every key is granted or one fails. Returns the descriptors of
    /// all `keys`.
    pub async fn ensure_partitions(
        &self,
        keys: &[PartitionKey],
    ) -> Result<Vec<PartitionDescriptor>> {
        let start = Instant::now();
        let mut granted = Vec::new();
        let mut waits = Vec::new();
        let mut to_request = Vec::new();

        let own = {
            let mut states = self.states.lock().await;
            for key in keys {
                match states.get(key) {
                    Some(KeyState::Granted(partition)) => granted.push(partition.clone()),
                    Some(KeyState::Failed(reason)) => {
                        return Err(SinkError::PartitionCreation(format!(
                            "partition '{}': {}",
                            key, reason
                        )));
                    }
                    Some(KeyState::Requested(rx)) => waits.push(rx.clone()),
                    None => to_request.push(key.clone()),
                }
            }

            if to_request.is_empty() {
                None
            } else {
                let (tx, rx) = watch::channel(None);
                for key in &to_request {
                    states.insert(key.clone(), KeyState::Requested(rx.clone()));
                }
                Some(tx)
            }
        };

        if let Some(tx) = own {
            let outcome = self.request(to_request.clone()).await;
            self.settle(&to_request, &outcome).await;
            // Receivers may all be gone; the outcome is recorded in `states` anyway.
            let _ = tx.send(Some(outcome.clone()));
            if self.cancel.is_cancelled() {
                return Err(SinkError::Cancelled("load cancelled while waiting".to_string()));
            }
            granted.extend(Self::accept(&to_request, outcome)?);
        }

        for mut rx in waits {
            let outcome = self.wait_shared(&mut rx).await?;
            granted.extend(outcome.map_err(SinkError::PartitionCreation)?);
        }

        SINK_PHASE_LATENCY
            .with_label_values(&["partition_creation"])
            .observe(start.elapsed().as_secs_f64());
        self.stats.add_wait_partition_time(start.elapsed());

        granted.retain(|partition| keys.contains(&partition.key));
        Ok(granted)
    }

    async fn request(&self, keys: Vec<PartitionKey>) -> CreationOutcome {
        let Some(creator) = self.creator.as_ref() else {
            return Err("no partition creator configured".to_string());
        };

        self.stats.record_partition_requests(keys.len());
        info!(
            load_id = %self.load_id,
            txn_id = self.txn_id,
            keys = ?keys,
            "Requesting partition creation"
        );

        let (tx, rx) = oneshot::channel();
        let completion = CreationCompletion {
            tx,
            cancel: self.cancel.clone(),
            keys: keys.clone(),
        };
        let request = CreatePartitionRequest {
            load_id: self.load_id,
            txn_id: self.txn_id,
            keys,
        };

        creator
            .request_partition_creation(request, completion)
            .await?;

        tokio::select! {
            _ = self.cancel.cancelled() => Err("load cancelled while waiting".to_string()),
            received = timeout(self.wait_timeout, rx) => match received {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_)) => Err("creation request dropped without an answer".to_string()),
                Err(_) => Err(format!("timed out after {:?}", self.wait_timeout)),
            },
        }
    }

    async fn wait_shared(
        &self,
        rx: &mut watch::Receiver<Option<CreationOutcome>>,
    ) -> Result<CreationOutcome> {
        let waited = tokio::select! {
            _ = self.cancel.cancelled() => {
                return Err(SinkError::Cancelled("load cancelled while waiting".to_string()));
            }
            waited = timeout(self.wait_timeout, rx.wait_for(Option::is_some)) => waited,
        };

        match waited {
            Ok(Ok(outcome)) => Ok(outcome
                .clone()
                .unwrap_or_else(|| Err("no outcome".to_string()))),
            Ok(Err(_)) => Err(SinkError::PartitionCreation(
                "creation request abandoned".to_string(),
            )),
            Err(_) => Err(SinkError::Timeout {
                operation: "partition creation",
                after: self.wait_timeout,
            }),
        }
    }

    /// Record the outcome for every requested key.
    async fn settle(&self, keys: &[PartitionKey], outcome: &CreationOutcome) {
        let mut states = self.states.lock().await;
        for key in keys {
            let state = match outcome {
                Ok(partitions) => match partitions.iter().find(|p| &p.key == key) {
                    Some(partition) => {
                        SINK_PARTITION_CREATIONS_TOTAL
                            .with_label_values(&["granted"])
                            .inc();
                        KeyState::Granted(partition.clone())
                    }
                    None => {
                        SINK_PARTITION_CREATIONS_TOTAL
                            .with_label_values(&["failed"])
                            .inc();
                        KeyState::Failed("not included in creation result".to_string())
                    }
                },
                Err(reason) => {
                    SINK_PARTITION_CREATIONS_TOTAL
                        .with_label_values(&["failed"])
                        .inc();
                    warn!(partition_key = %key, reason = %reason, "Partition creation failed");
                    KeyState::Failed(reason.clone())
                }
            };
            states.insert(key.clone(), state);
        }
    }

    fn accept(keys: &[PartitionKey], outcome: CreationOutcome) -> Result<Vec<PartitionDescriptor>> {
        let partitions = outcome.map_err(SinkError::PartitionCreation)?;
        if let Some(missing) = keys
            .iter()
            .find(|key| !partitions.iter().any(|p| &p.key == *key))
        {
            return Err(SinkError::PartitionCreation(format!(
                "partition '{}' not included in creation result",
                missing
            )));
        }
        Ok(partitions)
    }
}
