//! Delivery results and receipts.
//!
//! Adapters produce one [`PlatformResult`] per target per attempt. The
//! [`ReceiptAggregator`] folds the results for one message into a [`Receipt`].

mod aggregator;

pub use aggregator::{AggregationConfig, ReceiptAggregator};

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PlatformError;
use crate::message::Target;

/// Outcome of delivering a message to one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformResult {
    /// The target this result is for.
    pub target: Target,
    /// Platform that handled (or should have handled) the target.
    pub platform: String,
    /// Whether delivery succeeded.
    pub success: bool,
    /// Message id assigned by the platform, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_message_id: Option<String>,
    /// Classified failure, set when `success` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PlatformError>,
    /// 1-based attempt that produced this result.
    pub attempt: u32,
    /// When the result was recorded.
    pub timestamp: DateTime<Utc>,
    /// Time spent on the send, in milliseconds.
    pub duration_ms: u64,
}

impl PlatformResult {
    /// A successful delivery.
    pub fn success(target: Target, platform: impl Into<String>) -> Self {
        Self {
            target,
            platform: platform.into(),
            success: true,
            platform_message_id: None,
            error: None,
            attempt: 1,
            timestamp: Utc::now(),
            duration_ms: 0,
        }
    }

    /// A failed delivery.
    pub fn failure(target: Target, platform: impl Into<String>, error: PlatformError) -> Self {
        Self {
            target,
            platform: platform.into(),
            success: false,
            platform_message_id: None,
            error: Some(error),
            attempt: 1,
            timestamp: Utc::now(),
            duration_ms: 0,
        }
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.platform_message_id = Some(id.into());
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = duration.as_millis() as u64;
        self
    }

    pub(crate) fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

/// Overall outcome of one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Success,
    Partial,
    Failed,
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Partial => write!(f, "partial"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Aggregated delivery outcome for one message.
///
/// Receipts are only built by the [`ReceiptAggregator`] and are not mutated
/// afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    message_id: String,
    status: DeliveryStatus,
    results: Vec<PlatformResult>,
    successful: usize,
    failed: usize,
    total: usize,
    timestamp: DateTime<Utc>,
}

impl Receipt {
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn status(&self) -> DeliveryStatus {
        self.status
    }

    pub fn results(&self) -> &[PlatformResult] {
        &self.results
    }

    pub fn successful(&self) -> usize {
        self.successful
    }

    pub fn failed(&self) -> usize {
        self.failed
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Results that did not succeed.
    pub fn failures(&self) -> impl Iterator<Item = &PlatformResult> {
        self.results.iter().filter(|r| !r.success)
    }

    /// Results handled by one platform.
    pub fn for_platform<'a>(
        &'a self,
        platform: &'a str,
    ) -> impl Iterator<Item = &'a PlatformResult> {
        self.results.iter().filter(move |r| r.platform == platform)
    }
}
