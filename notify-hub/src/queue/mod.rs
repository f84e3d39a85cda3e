//! Bounded priority queue for async delivery.
//!
//! Items are held in one FIFO band per [`Priority`]; higher bands are always
//! drained first. Admission is bounded by `capacity` and fails fast with
//! [`Error::QueueFull`] instead of blocking. Retries and recovered items
//! re-enter without the capacity check since they were admitted once already.

mod dead_letter;
mod store;
mod worker_pool;

pub use dead_letter::{DeadLetterEntry, DeadLetterQueue};
pub use store::{ItemRecord, MemoryQueueStore, QueueStore, StoreStats, StoredItem};
pub use worker_pool::{ShutdownReport, WorkerPool, WorkerPoolConfig};
pub(crate) use worker_pool::WorkerContext;

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::handle::AsyncHandle;
use crate::message::{Message, Priority, Target};
use crate::receipt::PlatformResult;
use crate::{Error, Result};

const BANDS: usize = Priority::ALL.len();

/// Configuration for the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of queued items.
    pub capacity: usize,
    /// Warning threshold for queue depth.
    pub warning_threshold: usize,
    /// Critical threshold for queue depth.
    pub critical_threshold: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            warning_threshold: 100,
            critical_threshold: 500,
        }
    }
}

impl QueueConfig {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            warning_threshold: capacity.saturating_mul(7) / 10,
            critical_threshold: capacity.saturating_mul(9) / 10,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(Error::config("queue.capacity must be at least 1"));
        }
        if self.warning_threshold > self.critical_threshold {
            return Err(Error::config(
                "queue.warning_threshold must not exceed queue.critical_threshold",
            ));
        }
        Ok(())
    }
}

/// Status of queue depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueDepthStatus {
    /// Queue depth is normal.
    Normal,
    /// Queue depth is at warning level.
    Warning,
    /// Queue depth is at critical level.
    Critical,
}

/// Queue statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub depth: usize,
    pub capacity: usize,
    pub by_priority: BTreeMap<Priority, usize>,
    pub depth_status: QueueDepthStatus,
    pub closed: bool,
}

/// One async delivery in flight.
pub struct QueueItem {
    pub(crate) handle: AsyncHandle,
    pub(crate) message: Message,
    /// Targets still awaiting delivery.
    pub(crate) pending: Vec<Target>,
    /// Attempts already made.
    pub(crate) attempt: u32,
    pub(crate) enqueued_at: DateTime<Utc>,
    /// Final results carried over from earlier attempts.
    pub(crate) settled: Vec<PlatformResult>,
    /// Retryable failures from the last attempt, one per pending target.
    pub(crate) retrying: Vec<PlatformResult>,
}

impl std::fmt::Debug for QueueItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueItem")
            .field("id", &self.id())
            .field("message_id", &self.message.id())
            .field("priority", &self.message.priority())
            .field("attempt", &self.attempt)
            .finish()
    }
}

impl QueueItem {
    pub(crate) fn new(message: Message, handle: AsyncHandle) -> Self {
        Self {
            handle,
            pending: message.targets().to_vec(),
            message,
            attempt: 0,
            enqueued_at: Utc::now(),
            settled: Vec::new(),
            retrying: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        self.handle.id()
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn handle(&self) -> &AsyncHandle {
        &self.handle
    }

    /// Rebuild an item from its stored record, keeping earlier progress.
    pub(crate) fn from_record(record: ItemRecord, handle: AsyncHandle) -> Self {
        let pending = if record.pending.is_empty() {
            record.message.targets().to_vec()
        } else {
            record.pending
        };
        Self {
            handle,
            message: record.message,
            pending,
            attempt: record.attempt,
            enqueued_at: record.enqueued_at,
            settled: record.settled,
            retrying: Vec::new(),
        }
    }

    pub(crate) fn record(&self) -> ItemRecord {
        ItemRecord {
            id: self.id().to_string(),
            message: self.message.clone(),
            attempt: self.attempt,
            enqueued_at: self.enqueued_at,
            pending: self.pending.clone(),
            settled: self.settled.clone(),
        }
    }
}

/// Bounded, priority-ordered queue shared by the hub and its workers.
pub struct AsyncQueue {
    config: QueueConfig,
    bands: Mutex<[VecDeque<QueueItem>; BANDS]>,
    /// Queued items plus admissions still being persisted.
    depth: AtomicUsize,
    notify: Notify,
    closed: AtomicBool,
    store: Option<Arc<dyn QueueStore>>,
}

impl std::fmt::Debug for AsyncQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncQueue")
            .field("depth", &self.depth())
            .field("capacity", &self.config.capacity)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl AsyncQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self::with_store(config, None)
    }

    pub fn with_store(config: QueueConfig, store: Option<Arc<dyn QueueStore>>) -> Self {
        Self {
            config,
            bands: Mutex::new(Default::default()),
            depth: AtomicUsize::new(0),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            store,
        }
    }

    pub fn store(&self) -> Option<&Arc<dyn QueueStore>> {
        self.store.as_ref()
    }

    /// Admit one item, or fail with `QueueFull` / `QueueClosed`.
    pub async fn enqueue(&self, item: QueueItem) -> Result<()> {
        self.ensure_open()?;
        self.reserve(1)?;

        if let Err(e) = self.persist(&item).await {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            return Err(e);
        }

        debug!(item_id = %item.id(), priority = %item.message.priority(), "Enqueued item");
        self.push(item);
        Ok(())
    }

    /// Admit every item or none of them.
    pub async fn enqueue_batch(&self, items: Vec<QueueItem>) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        self.ensure_open()?;
        self.reserve(items.len())?;

        for (idx, item) in items.iter().enumerate() {
            if let Err(e) = self.persist(item).await {
                for written in &items[..idx] {
                    self.ack(written.id()).await;
                }
                self.depth.fetch_sub(items.len(), Ordering::SeqCst);
                return Err(e);
            }
        }

        debug!(count = items.len(), "Enqueued batch");
        for item in items {
            self.push(item);
        }
        Ok(())
    }

    /// Put a retried item back, bypassing capacity and the closed flag.
    pub(crate) fn requeue(&self, item: QueueItem) {
        debug!(item_id = %item.id(), attempt = item.attempt, "Requeued item");
        self.depth.fetch_add(1, Ordering::SeqCst);
        self.push(item);
    }

    /// Re-admit an item that is already in the backing store.
    pub(crate) fn enqueue_existing(&self, item: QueueItem) -> Result<()> {
        self.ensure_open()?;
        info!(item_id = %item.id(), "Re-admitted stored item");
        self.depth.fetch_add(1, Ordering::SeqCst);
        self.push(item);
        Ok(())
    }

    /// Take the next item, waiting until one arrives or `cancel` fires.
    ///
    /// Fails with `QueueClosed` once the queue is closed and empty.
    pub async fn dequeue(&self, cancel: &CancellationToken) -> Result<QueueItem> {
        loop {
            // Register interest before checking, so a push in between is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.try_dequeue() {
                return Ok(item);
            }
            if self.is_closed() {
                return Err(Error::QueueClosed);
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    // Hand a possibly consumed wakeup on to another waiter.
                    if !self.is_empty() {
                        self.notify.notify_one();
                    }
                    return Err(Error::Cancelled);
                }
                _ = &mut notified => {}
            }
        }
    }

    /// Take the next item without waiting.
    pub fn try_dequeue(&self) -> Option<QueueItem> {
        let item = {
            let mut bands = self.bands.lock();
            bands.iter_mut().rev().find_map(|band| band.pop_front())
        };
        if item.is_some() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
        }
        item
    }

    /// Remove a queued item by id.
    pub fn remove(&self, item_id: &str) -> Option<QueueItem> {
        let removed = {
            let mut bands = self.bands.lock();
            bands.iter_mut().find_map(|band| {
                band.iter()
                    .position(|item| item.id() == item_id)
                    .and_then(|pos| band.remove(pos))
            })
        };

        if let Some(item) = &removed {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            debug!(item_id = %item.id(), "Removed item from queue");
            if let Some(store) = self.store.clone()
                && let Ok(runtime) = tokio::runtime::Handle::try_current()
            {
                let id = item.id().to_string();
                runtime.spawn(async move {
                    if let Err(e) = store.ack(&id).await {
                        warn!(item_id = %id, error = %e, "Failed to ack removed item");
                    }
                });
            }
        }
        removed
    }

    /// Take every queued item, highest priority first.
    pub fn drain(&self) -> Vec<QueueItem> {
        let drained: Vec<QueueItem> = {
            let mut bands = self.bands.lock();
            bands
                .iter_mut()
                .rev()
                .flat_map(|band| band.drain(..))
                .collect()
        };
        self.depth.fetch_sub(drained.len(), Ordering::SeqCst);
        drained
    }

    /// Stop admitting new items and wake every waiter.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(depth = self.depth(), "Queue closed");
        }
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Rewrite the stored record of an item that stays in play.
    pub(crate) async fn checkpoint(&self, item: &QueueItem) {
        if let Err(e) = self.persist(item).await {
            warn!(
                item_id = %item.id(),
                attempt = item.attempt,
                error = %e,
                "Failed to checkpoint item"
            );
        }
    }

    /// Forget a finished item in the backing store.
    pub(crate) async fn ack(&self, item_id: &str) {
        if let Some(store) = &self.store
            && let Err(e) = store.ack(item_id).await
        {
            warn!(item_id = %item_id, error = %e, "Failed to ack item");
        }
    }

    /// Get the current queue depth.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.bands.lock().iter().all(VecDeque::is_empty)
    }

    /// Get the queue depth status.
    pub fn depth_status(&self) -> QueueDepthStatus {
        let depth = self.depth();
        if depth >= self.config.critical_threshold {
            QueueDepthStatus::Critical
        } else if depth >= self.config.warning_threshold {
            QueueDepthStatus::Warning
        } else {
            QueueDepthStatus::Normal
        }
    }

    pub fn stats(&self) -> QueueStats {
        let by_priority = {
            let bands = self.bands.lock();
            Priority::ALL
                .iter()
                .map(|p| (*p, bands[p.band()].len()))
                .collect()
        };
        QueueStats {
            depth: self.depth(),
            capacity: self.config.capacity,
            by_priority,
            depth_status: self.depth_status(),
            closed: self.is_closed(),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::QueueClosed)
        } else {
            Ok(())
        }
    }

    fn reserve(&self, n: usize) -> Result<()> {
        let capacity = self.config.capacity;
        self.depth
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |depth| {
                (depth + n <= capacity).then_some(depth + n)
            })
            .map(|_| ())
            .map_err(|depth| {
                warn!(depth, capacity, "Queue full, rejecting");
                Error::QueueFull { capacity }
            })
    }

    async fn persist(&self, item: &QueueItem) -> Result<()> {
        match &self.store {
            Some(store) => store.enqueue(StoredItem::from_record(&item.record())?).await,
            None => Ok(()),
        }
    }

    fn push(&self, item: QueueItem) {
        let band = item.message.priority().band();
        self.bands.lock()[band].push_back(item);
        self.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{CallbackExecutor, SendOptions};
    use std::sync::Weak;
    use std::time::Duration;

    fn item(id: &str, priority: Priority) -> QueueItem {
        let message = Message::new(id, "body")
            .with_priority(priority)
            .with_target(Target::email("a@example.com"));
        let handle = AsyncHandle::new(
            id.to_string(),
            message.id(),
            SendOptions::default(),
            CallbackExecutor::spawn(),
            Weak::new(),
            Vec::new(),
        );
        QueueItem::new(message, handle)
    }

    #[test]
    fn test_queue_config_default() {
        let config = QueueConfig::default();
        assert_eq!(config.capacity, 1000);
        assert_eq!(config.warning_threshold, 100);
        assert_eq!(config.critical_threshold, 500);
        assert!(config.validate().is_ok());
        assert!(QueueConfig::with_capacity(0).validate().is_err());
    }

    #[tokio::test]
    async fn test_priority_then_fifo() {
        let queue = AsyncQueue::new(QueueConfig::default());
        queue.enqueue(item("low-1", Priority::Low)).await.unwrap();
        queue.enqueue(item("normal-1", Priority::Normal)).await.unwrap();
        queue.enqueue(item("low-2", Priority::Low)).await.unwrap();
        queue.enqueue(item("critical-1", Priority::Critical)).await.unwrap();
        queue.enqueue(item("normal-2", Priority::Normal)).await.unwrap();

        let order: Vec<String> = std::iter::from_fn(|| queue.try_dequeue())
            .map(|item| item.id().to_string())
            .collect();
        assert_eq!(
            order,
            vec!["critical-1", "normal-1", "normal-2", "low-1", "low-2"]
        );
        assert_eq!(queue.depth(), 0);
    }

    #[tokio::test]
    async fn test_queue_full() {
        let queue = AsyncQueue::new(QueueConfig::with_capacity(2));
        queue.enqueue(item("a", Priority::Normal)).await.unwrap();
        queue.enqueue(item("b", Priority::Normal)).await.unwrap();

        let result = tokio::time::timeout(
            Duration::from_secs(1),
            queue.enqueue(item("c", Priority::Normal)),
        )
        .await
        .expect("enqueue must not block");
        assert!(matches!(result, Err(Error::QueueFull { capacity: 2 })));
        assert_eq!(queue.depth(), 2);

        // Retries bypass the bound.
        queue.requeue(item("retry", Priority::Normal));
        assert_eq!(queue.depth(), 3);
    }

    #[tokio::test]
    async fn test_batch_is_all_or_nothing() {
        let queue = AsyncQueue::new(QueueConfig::with_capacity(3));
        queue.enqueue(item("a", Priority::Normal)).await.unwrap();
        let batch = vec![
            item("b", Priority::Normal),
            item("c", Priority::Normal),
            item("d", Priority::Normal),
        ];
        assert!(matches!(
            queue.enqueue_batch(batch).await,
            Err(Error::QueueFull { .. })
        ));
        assert_eq!(queue.depth(), 1);

        let batch = vec![item("b", Priority::Normal), item("c", Priority::Normal)];
        queue.enqueue_batch(batch).await.unwrap();
        assert_eq!(queue.depth(), 3);
    }

    #[tokio::test]
    async fn test_dequeue_waits_for_item() {
        let queue = Arc::new(AsyncQueue::new(QueueConfig::default()));
        let cancel = CancellationToken::new();

        let waiter = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.dequeue(&cancel).await.map(|i| i.id().to_string()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue(item("late", Priority::Normal)).await.unwrap();

        assert_eq!(waiter.await.unwrap().unwrap(), "late");
    }

    #[tokio::test]
    async fn test_dequeue_cancelled() {
        let queue = AsyncQueue::new(QueueConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            queue.dequeue(&cancel).await,
            Err(Error::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_closed_queue() {
        let queue = AsyncQueue::new(QueueConfig::default());
        queue.enqueue(item("a", Priority::Normal)).await.unwrap();
        queue.close();

        assert!(matches!(
            queue.enqueue(item("b", Priority::Normal)).await,
            Err(Error::QueueClosed)
        ));
        let cancel = CancellationToken::new();
        assert_eq!(queue.dequeue(&cancel).await.unwrap().id(), "a");
        assert!(matches!(
            queue.dequeue(&cancel).await,
            Err(Error::QueueClosed)
        ));
    }

    #[tokio::test]
    async fn test_remove_and_stats() {
        let queue = AsyncQueue::new(QueueConfig {
            capacity: 10,
            warning_threshold: 2,
            critical_threshold: 3,
        });
        queue.enqueue(item("a", Priority::High)).await.unwrap();
        assert_eq!(queue.depth_status(), QueueDepthStatus::Normal);
        queue.enqueue(item("b", Priority::Low)).await.unwrap();
        assert_eq!(queue.depth_status(), QueueDepthStatus::Warning);
        queue.enqueue(item("c", Priority::Low)).await.unwrap();
        assert_eq!(queue.depth_status(), QueueDepthStatus::Critical);

        assert!(queue.remove("b").is_some());
        assert!(queue.remove("b").is_none());

        let stats = queue.stats();
        assert_eq!(stats.depth, 2);
        assert_eq!(stats.by_priority[&Priority::High], 1);
        assert_eq!(stats.by_priority[&Priority::Low], 1);
        assert_eq!(stats.by_priority[&Priority::Normal], 0);

        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].id(), "a");
        assert_eq!(queue.depth(), 0);
    }

    #[tokio::test]
    async fn test_store_mirrors_admissions() {
        let store = Arc::new(MemoryQueueStore::new());
        let queue = AsyncQueue::with_store(
            QueueConfig::default(),
            Some(store.clone() as Arc<dyn QueueStore>),
        );
        queue.enqueue(item("a", Priority::Normal)).await.unwrap();
        queue.enqueue(item("b", Priority::Normal)).await.unwrap();
        assert_eq!(store.len(), 2);

        let taken = queue.try_dequeue().unwrap();
        // Dequeuing does not forget the item; only acking does.
        assert_eq!(store.len(), 2);
        queue.ack(taken.id()).await;
        assert_eq!(store.ids(), vec!["b".to_string()]);

        let record = store.dequeue().await.unwrap().unwrap().decode().unwrap();
        assert_eq!(record.id, "b");
    }

    #[tokio::test]
    async fn test_checkpoint_keeps_progress() {
        let store = Arc::new(MemoryQueueStore::new());
        let queue = AsyncQueue::with_store(
            QueueConfig::default(),
            Some(store.clone() as Arc<dyn QueueStore>),
        );
        let mut first = item("a", Priority::Normal);
        first.pending.push(Target::email("b@example.com"));
        queue.enqueue(first).await.unwrap();

        let mut taken = queue.try_dequeue().unwrap();
        taken.attempt = 1;
        taken.settled.push(PlatformResult::success(taken.pending.remove(0), "email"));
        queue.checkpoint(&taken).await;
        assert_eq!(store.len(), 1);

        let record = store.dequeue().await.unwrap().unwrap().decode().unwrap();
        assert_eq!(record.attempt, 1);
        assert_eq!(record.settled.len(), 1);
        let handle = taken.handle.clone();
        let restored = QueueItem::from_record(record, handle);
        assert_eq!(restored.attempt, 1);
        assert_eq!(restored.pending.len(), 1);
        assert_eq!(restored.pending[0].value, "b@example.com");
        assert_eq!(restored.settled[0].target.value, "a@example.com");
    }
}
