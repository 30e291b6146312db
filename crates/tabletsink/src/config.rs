//! Sink Configuration
//!
//! This module defines the per-load configuration the upstream pipeline hands to
//! the sink.
//!
//! ## SinkConfig
//!
//! - **load_id / txn_id**: identity of the load transaction
//! - **sender_id / num_senders**: position of this sink among coordinated senders of one load
//! - **local_node_id**: the node this process runs on; replicas hosted here bypass the network
//! - **num_replicas**: replica factor; a tablet listing fewer replicas is unsatisfiable
//! - **streams_per_node**: parallel streams opened to each remote node (default: 2)
//! - **high_priority / write_file_cache**: passed through to every stream open
//! - **open_timeout_ms / close_timeout_ms**: per-replica bounded wait (defaults: 60s / 10 min)
//! - **partition_creation_timeout_ms**: wait for on-demand partition creation (default: 60s)
//! - **retry**: retry budget for replica open and close (see [`RetryConfig`])
//!
//! ## Usage
//!
//! ```ignore
//! use tabletsink::SinkConfig;
//!
//! let config = SinkConfig {
//!     txn_id: 42,
//!     local_node_id: NodeId(1),
//!     num_replicas: 3,
//!     ..Default::default()
//! };
//! config.validate()?;
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tabletsink_core::{LoadId, NodeId};

use crate::error::{Result, SinkError};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Globally unique load id (default: random UUID)
    #[serde(default)]
    pub load_id: LoadId,

    /// Transaction id assigned by the coordinator
    pub txn_id: i64,

    /// Index of this sender among `num_senders`
    #[serde(default)]
    pub sender_id: u32,

    /// Number of senders participating in the load (default: 1)
    #[serde(default = "default_num_senders")]
    pub num_senders: u32,

    /// Node hosting this process
    pub local_node_id: NodeId,

    /// Replica factor of the target table (default: 3)
    #[serde(default = "default_num_replicas")]
    pub num_replicas: usize,

    /// Parallel streams per remote node (default: 2)
    #[serde(default = "default_streams_per_node")]
    pub streams_per_node: usize,

    /// Schedule the load on high-priority replica workers
    #[serde(default)]
    pub high_priority: bool,

    /// Ask replicas to populate their file cache while writing
    #[serde(default)]
    pub write_file_cache: bool,

    /// Bounded wait for opening a stream, in milliseconds (default: 60s)
    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,

    /// Bounded wait for one replica's commit acknowledgement, in milliseconds (default: 10 min)
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,

    /// Bounded wait for an on-demand partition creation, in milliseconds (default: 60s)
    #[serde(default = "default_partition_creation_timeout_ms")]
    pub partition_creation_timeout_ms: u64,

    /// Retry budget for replica open and close
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Serializable form of [`RetryPolicy`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt (default: 3)
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// First backoff, in milliseconds (default: 100ms)
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Backoff cap, in milliseconds (default: 5s)
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Exponential growth factor (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            load_id: LoadId::new(),
            txn_id: 0,
            sender_id: 0,
            num_senders: default_num_senders(),
            local_node_id: NodeId(0),
            num_replicas: default_num_replicas(),
            streams_per_node: default_streams_per_node(),
            high_priority: false,
            write_file_cache: false,
            open_timeout_ms: default_open_timeout_ms(),
            close_timeout_ms: default_close_timeout_ms(),
            partition_creation_timeout_ms: default_partition_creation_timeout_ms(),
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl SinkConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.num_senders == 0 {
            return Err(SinkError::Config(
                "num_senders must be greater than zero".to_string(),
            ));
        }
        if self.sender_id >= self.num_senders {
            return Err(SinkError::Config(format!(
                "sender_id {} out of range for {} senders",
                self.sender_id, self.num_senders
            )));
        }
        if self.num_replicas == 0 {
            return Err(SinkError::Config(
                "num_replicas must be greater than zero".to_string(),
            ));
        }
        if self.streams_per_node == 0 {
            return Err(SinkError::Config(
                "streams_per_node must be greater than zero".to_string(),
            ));
        }
        if self.open_timeout_ms == 0 || self.close_timeout_ms == 0 {
            return Err(SinkError::Config(
                "open and close timeouts must be greater than zero".to_string(),
            ));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(SinkError::Config(
                "retry backoff_multiplier must be at least 1.0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn partition_creation_timeout(&self) -> Duration {
        Duration::from_millis(self.partition_creation_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.retry)
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        RetryPolicy::new(
            config.max_retries,
            Duration::from_millis(config.initial_backoff_ms),
            Duration::from_millis(config.max_backoff_ms),
            config.backoff_multiplier,
        )
    }
}

fn default_num_senders() -> u32 {
    1
}

fn default_num_replicas() -> usize {
    3
}

fn default_streams_per_node() -> usize {
    2
}

fn default_open_timeout_ms() -> u64 {
    60 * 1000 // 60 seconds
}

fn default_close_timeout_ms() -> u64 {
    10 * 60 * 1000 // 10 minutes
}

fn default_partition_creation_timeout_ms() -> u64 {
    60 * 1000 // 60 seconds
}

fn default_max_retries() -> usize {
    3
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    5 * 1000 // 5 seconds
}

fn default_backoff_multiplier() -> f64 {
    2.0
}
