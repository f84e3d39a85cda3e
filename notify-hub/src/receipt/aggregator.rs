//! Receipt aggregation policy.

use std::collections::HashSet;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::{DeliveryStatus, PlatformResult, Receipt};
use crate::{Error, Result};

/// Policy that turns per-target results into an overall status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationConfig {
    /// Minimum success ratio for a mixed outcome to count as `partial`.
    pub partial_failure_threshold: f64,
    /// Maximum number of failed targets tolerated before the message is
    /// `failed`. `None` means no absolute limit.
    #[serde(default)]
    pub failure_tolerance: Option<usize>,
    /// Platforms whose results must all succeed.
    #[serde(default)]
    pub required_platforms: Vec<String>,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            partial_failure_threshold: 0.5,
            failure_tolerance: None,
            required_platforms: Vec::new(),
        }
    }
}

impl AggregationConfig {
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.partial_failure_threshold = threshold;
        self
    }

    pub fn with_failure_tolerance(mut self, tolerance: usize) -> Self {
        self.failure_tolerance = Some(tolerance);
        self
    }

    pub fn with_required_platform(mut self, platform: impl Into<String>) -> Self {
        self.required_platforms.push(platform.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.partial_failure_threshold) {
            return Err(Error::config(format!(
                "partial_failure_threshold must be within [0, 1], got {}",
                self.partial_failure_threshold
            )));
        }
        Ok(())
    }
}

/// Folds per-target results into a [`Receipt`].
///
/// Holds nothing but its configuration, so one instance can be shared freely.
#[derive(Debug, Clone, Default)]
pub struct ReceiptAggregator {
    config: AggregationConfig,
}

impl ReceiptAggregator {
    pub fn new(config: AggregationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AggregationConfig {
        &self.config
    }

    /// Build the receipt for `message_id` from its results.
    pub fn aggregate(&self, message_id: &str, results: Vec<PlatformResult>) -> Receipt {
        let total = results.len();
        let successful = results.iter().filter(|r| r.success).count();
        let failed = total - successful;
        let status = self.status(&results, successful, failed);

        Receipt {
            message_id: message_id.to_string(),
            status,
            results,
            successful,
            failed,
            total,
            timestamp: Utc::now(),
        }
    }

    fn status(
        &self,
        results: &[PlatformResult],
        successful: usize,
        failed: usize,
    ) -> DeliveryStatus {
        let total = successful + failed;
        if total == 0 {
            return DeliveryStatus::Failed;
        }
        if failed == 0 {
            return DeliveryStatus::Success;
        }
        if successful == 0 {
            return DeliveryStatus::Failed;
        }

        // A required platform with any unsuccessful result vetoes the message.
        if !self.config.required_platforms.is_empty() {
            let required: HashSet<&str> = self
                .config
                .required_platforms
                .iter()
                .map(String::as_str)
                .collect();
            let vetoed = results
                .iter()
                .any(|r| !r.success && required.contains(r.platform.as_str()));
            if vetoed {
                return DeliveryStatus::Failed;
            }
        }

        if let Some(tolerance) = self.config.failure_tolerance
            && failed > tolerance
        {
            return DeliveryStatus::Failed;
        }

        let success_rate = successful as f64 / total as f64;
        if success_rate >= self.config.partial_failure_threshold {
            DeliveryStatus::Partial
        } else {
            DeliveryStatus::Failed
        }
    }
}
