//! Dead letters: async items that ended `failed`.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::message::{Message, Target};
use crate::receipt::Receipt;

/// A failed async item kept for inspection or a later retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Item id of the failed delivery.
    pub id: String,
    /// The original message, with every target.
    pub message: Message,
    /// Number of attempts made.
    pub attempts: u32,
    /// Last error message.
    pub error: String,
    /// Targets that did not get the message.
    pub failed_targets: Vec<Target>,
    /// When the item was first submitted.
    pub created_at: DateTime<Utc>,
    /// When it was moved to dead letter.
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub(crate) fn new(
        id: &str,
        message: Message,
        attempts: u32,
        receipt: Option<&Receipt>,
        error: String,
        created_at: DateTime<Utc>,
    ) -> Self {
        let failed_targets = match receipt {
            Some(receipt) => receipt.failures().map(|r| r.target.clone()).collect(),
            None => message.targets().to_vec(),
        };
        Self {
            id: id.to_string(),
            message,
            attempts,
            error,
            failed_targets,
            created_at,
            dead_lettered_at: Utc::now(),
        }
    }

    /// The message narrowed to the targets that failed.
    pub fn retry_message(&self) -> Message {
        if self.failed_targets.is_empty() {
            self.message.clone()
        } else {
            self.message.retarget(self.failed_targets.clone())
        }
    }
}

/// Dead-letter list keyed by item id.
#[derive(Debug, Default)]
pub struct DeadLetterQueue {
    entries: DashMap<String, DeadLetterEntry>,
}

impl DeadLetterQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, entry: DeadLetterEntry) {
        info!(item_id = %entry.id, attempts = entry.attempts, "Item dead-lettered");
        self.entries.insert(entry.id.clone(), entry);
    }

    /// Snapshot, oldest first.
    pub fn list(&self) -> Vec<DeadLetterEntry> {
        let mut entries: Vec<DeadLetterEntry> =
            self.entries.iter().map(|e| e.value().clone()).collect();
        entries.sort_by_key(|e| e.dead_lettered_at);
        entries
    }

    pub fn get(&self, id: &str) -> Option<DeadLetterEntry> {
        self.entries.get(id).map(|e| e.value().clone())
    }

    pub(crate) fn take(&self, id: &str) -> Option<DeadLetterEntry> {
        self.entries.remove(id).map(|(_, entry)| entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop entries dead-lettered more than `retention_days` ago.
    pub fn cleanup(&self, retention_days: u32) -> usize {
        let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.dead_lettered_at > cutoff);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed, "Cleaned up dead letters");
        }
        removed
    }
}
