//! Hub configuration.
//!
//! Configuration is plain data handed to [`NotificationHub::new`](crate::NotificationHub::new).
//! Where it comes from is up to the caller.

use serde::{Deserialize, Serialize};

use crate::Result;
use crate::dispatcher::DispatcherConfig;
use crate::queue::{QueueConfig, WorkerPoolConfig};
use crate::receipt::AggregationConfig;
use crate::retry::RetryConfig;

/// Default number of days dead letters are kept.
pub const DEFAULT_DEAD_LETTER_RETENTION_DAYS: u32 = 7;

/// Complete configuration of a [`NotificationHub`](crate::NotificationHub).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub queue: QueueConfig,
    pub workers: WorkerPoolConfig,
    pub retry: RetryConfig,
    pub aggregation: AggregationConfig,
    pub dispatcher: DispatcherConfig,
    /// Days after which dead letters are dropped by `cleanup_dead_letters`.
    pub dead_letter_retention_days: u32,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            workers: WorkerPoolConfig::default(),
            retry: RetryConfig::default(),
            aggregation: AggregationConfig::default(),
            dispatcher: DispatcherConfig::default(),
            dead_letter_retention_days: DEFAULT_DEAD_LETTER_RETENTION_DAYS,
        }
    }
}

impl HubConfig {
    /// Parse a JSON document. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers.workers = workers;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_aggregation(mut self, aggregation: AggregationConfig) -> Self {
        self.aggregation = aggregation;
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: DispatcherConfig) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    /// Reject values no hub can run with.
    pub fn validate(&self) -> Result<()> {
        self.queue.validate()?;
        self.workers.validate()?;
        self.retry.validate()?;
        self.aggregation.validate()?;
        self.dispatcher.validate()?;
        Ok(())
    }
}
