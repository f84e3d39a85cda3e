//! Hub lifecycle events.

use serde::{Deserialize, Serialize};

use crate::message::Priority;
use crate::receipt::DeliveryStatus;

/// Broadcast channel capacity for hub events.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Something that happened to an async item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubEvent {
    Enqueued {
        item_id: String,
        message_id: String,
        priority: Priority,
    },
    Claimed {
        item_id: String,
        message_id: String,
        attempt: u32,
    },
    RetryScheduled {
        item_id: String,
        message_id: String,
        attempt: u32,
        delay_ms: u64,
        pending_targets: usize,
    },
    Completed {
        item_id: String,
        message_id: String,
        status: DeliveryStatus,
    },
    Failed {
        item_id: String,
        message_id: String,
        error: String,
    },
    Cancelled {
        item_id: String,
        message_id: String,
    },
    DeadLettered {
        item_id: String,
        message_id: String,
    },
}

impl HubEvent {
    pub fn item_id(&self) -> &str {
        match self {
            Self::Enqueued { item_id, .. }
            | Self::Claimed { item_id, .. }
            | Self::RetryScheduled { item_id, .. }
            | Self::Completed { item_id, .. }
            | Self::Failed { item_id, .. }
            | Self::Cancelled { item_id, .. }
            | Self::DeadLettered { item_id, .. } => item_id,
        }
    }

    /// Whether this event ends the item's life.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Failed { .. } | Self::Cancelled { .. }
        )
    }
}
