//! Per-load counters.
//!
//! The prometheus families in `tabletsink-observability` aggregate across every load
//! in the process; these counters belong to one load and end up in its
//! [`LoadSummary`](crate::sink::LoadSummary).

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct SinkStats {
    input_rows: AtomicU64,
    output_rows: AtomicU64,
    filtered_rows: AtomicU64,
    batches: AtomicU64,
    local_appends: AtomicU64,
    remote_appends: AtomicU64,
    bytes_sent: AtomicU64,
    partition_creation_requests: AtomicU64,
    distribute_nanos: AtomicU64,
    send_data_nanos: AtomicU64,
    wait_partition_nanos: AtomicU64,
}

/// Point-in-time copy of [`SinkStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkStatsSnapshot {
    pub input_rows: u64,
    pub output_rows: u64,
    pub filtered_rows: u64,
    pub batches: u64,
    pub local_appends: u64,
    pub remote_appends: u64,
    pub bytes_sent: u64,
    pub partition_creation_requests: u64,
    pub distribute_time_ms: u64,
    pub send_data_time_ms: u64,
    pub wait_partition_time_ms: u64,
}

impl SinkStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_batch(&self, rows: usize) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.input_rows.fetch_add(rows as u64, Ordering::Relaxed);
    }

    pub fn record_output(&self, rows: usize) {
        self.output_rows.fetch_add(rows as u64, Ordering::Relaxed);
    }

    pub fn record_filtered(&self, rows: usize) {
        self.filtered_rows.fetch_add(rows as u64, Ordering::Relaxed);
    }

    pub fn record_local_append(&self) {
        self.local_appends.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_remote_append(&self, bytes: usize) {
        self.remote_appends.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_partition_requests(&self, keys: usize) {
        self.partition_creation_requests
            .fetch_add(keys as u64, Ordering::Relaxed);
    }

    pub fn add_distribute_time(&self, elapsed: Duration) {
        self.distribute_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn add_send_data_time(&self, elapsed: Duration) {
        self.send_data_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn add_wait_partition_time(&self, elapsed: Duration) {
        self.wait_partition_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SinkStatsSnapshot {
        let millis = |nanos: &AtomicU64| nanos.load(Ordering::Relaxed) / 1_000_000;
        SinkStatsSnapshot {
            input_rows: self.input_rows.load(Ordering::Relaxed),
            output_rows: self.output_rows.load(Ordering::Relaxed),
            filtered_rows: self.filtered_rows.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            local_appends: self.local_appends.load(Ordering::Relaxed),
            remote_appends: self.remote_appends.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            partition_creation_requests: self.partition_creation_requests.load(Ordering::Relaxed),
            distribute_time_ms: millis(&self.distribute_nanos),
            send_data_time_ms: millis(&self.send_data_nanos),
            wait_partition_time_ms: millis(&self.wait_partition_nanos),
        }
    }
}
