//! Backing-store contract for queued items.
//!
//! The in-memory [`AsyncQueue`](super::AsyncQueue) is always authoritative for
//! scheduling. A [`QueueStore`] only mirrors admitted items so they survive a
//! hard stop: items are written on admission and acked once they reach a
//! terminal state. Whatever is still unacked can be re-admitted later.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::message::{Message, Target};
use crate::receipt::PlatformResult;

/// Serializable part of a queued item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemRecord {
    pub id: String,
    pub message: Message,
    /// Attempts already made.
    #[serde(default)]
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
    /// Targets still awaiting delivery. Empty means every target.
    #[serde(default)]
    pub pending: Vec<Target>,
    /// Final results from earlier attempts.
    #[serde(default)]
    pub settled: Vec<PlatformResult>,
}

/// A serialized item as held by a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredItem {
    pub id: String,
    /// JSON-encoded [`ItemRecord`].
    pub payload: String,
}

impl StoredItem {
    pub fn from_record(record: &ItemRecord) -> Result<Self> {
        Ok(Self {
            id: record.id.clone(),
            payload: serde_json::to_string(record)?,
        })
    }

    pub fn decode(&self) -> Result<ItemRecord> {
        Ok(serde_json::from_str(&self.payload)?)
    }
}

/// Counts reported by a store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    /// Stored and not yet handed out by `dequeue`.
    pub pending: usize,
    /// Handed out by `dequeue` and not yet acked.
    pub in_flight: usize,
}

/// Persistence contract for queued items.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Persist an item. Storing an id that is already present replaces it.
    async fn enqueue(&self, item: StoredItem) -> Result<()>;

    /// Hand out the oldest pending item, if any.
    async fn dequeue(&self) -> Result<Option<StoredItem>>;

    /// Forget an item for good. Unknown ids are ignored.
    async fn ack(&self, id: &str) -> Result<()>;

    async fn stats(&self) -> Result<StoreStats>;
}

#[derive(Default)]
struct MemoryState {
    pending: VecDeque<StoredItem>,
    in_flight: HashMap<String, StoredItem>,
}

/// In-process [`QueueStore`].
#[derive(Default)]
pub struct MemoryQueueStore {
    state: Mutex<MemoryState>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of items not yet acked.
    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.pending.len() + state.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of every unacked item.
    pub fn ids(&self) -> Vec<String> {
        let state = self.state.lock();
        state
            .pending
            .iter()
            .map(|item| item.id.clone())
            .chain(state.in_flight.keys().cloned())
            .collect()
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn enqueue(&self, item: StoredItem) -> Result<()> {
        let mut state = self.state.lock();
        state.in_flight.remove(&item.id);
        match state.pending.iter_mut().find(|p| p.id == item.id) {
            Some(existing) => *existing = item,
            None => state.pending.push_back(item),
        }
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<StoredItem>> {
        let mut state = self.state.lock();
        let item = state.pending.pop_front();
        if let Some(item) = &item {
            state.in_flight.insert(item.id.clone(), item.clone());
        }
        Ok(item)
    }

    async fn ack(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.pending.retain(|item| item.id != id);
        state.in_flight.remove(id);
        Ok(())
    }

    async fn stats(&self) -> Result<StoreStats> {
        let state = self.state.lock();
        Ok(StoreStats {
            pending: state.pending.len(),
            in_flight: state.in_flight.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored(id: &str) -> StoredItem {
        StoredItem {
            id: id.to_string(),
            payload: "{}".to_string(),
        }
    }

    #[tokio::test]
    async fn test_memory_store_lifecycle() {
        let store = MemoryQueueStore::new();
        store.enqueue(stored("a")).await.unwrap();
        store.enqueue(stored("b")).await.unwrap();
        assert_eq!(
            store.stats().await.unwrap(),
            StoreStats {
                pending: 2,
                in_flight: 0
            }
        );

        let first = store.dequeue().await.unwrap().unwrap();
        assert_eq!(first.id, "a");
        assert_eq!(
            store.stats().await.unwrap(),
            StoreStats {
                pending: 1,
                in_flight: 1
            }
        );

        store.ack("a").await.unwrap();
        store.ack("b").await.unwrap();
        store.ack("missing").await.unwrap();
        assert!(store.is_empty());
        assert!(store.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_enqueue_replaces_same_id() {
        let store = MemoryQueueStore::new();
        store.enqueue(stored("a")).await.unwrap();
        store
            .enqueue(StoredItem {
                id: "a".to_string(),
                payload: "{\"v\":2}".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.dequeue().await.unwrap().unwrap().payload, "{\"v\":2}");
    }

    #[test]
    fn test_record_round_trip() {
        let record = ItemRecord {
            id: "item-1".to_string(),
            message: Message::new("t", "b").with_target(Target::email("a@example.com")),
            attempt: 2,
            enqueued_at: Utc::now(),
            pending: vec![Target::email("a@example.com")],
            settled: Vec::new(),
        };
        let decoded = StoredItem::from_record(&record).unwrap().decode().unwrap();
        assert_eq!(decoded.id, "item-1");
        assert_eq!(decoded.attempt, 2);
        assert_eq!(decoded.pending, record.pending);
        assert_eq!(decoded.message.id(), record.message.id());
    }

    #[test]
    fn test_record_without_progress_fields() {
        let message = Message::new("t", "b").with_target(Target::email("a@example.com"));
        let payload = serde_json::json!({
            "id": "item-1",
            "message": message,
            "enqueued_at": Utc::now(),
        });
        let stored = StoredItem {
            id: "item-1".to_string(),
            payload: payload.to_string(),
        };
        let decoded = stored.decode().unwrap();
        assert_eq!(decoded.attempt, 0);
        assert!(decoded.pending.is_empty());
        assert!(decoded.settled.is_empty());
    }
}
