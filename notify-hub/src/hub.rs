//! The caller-facing notification hub.
//!
//! A [`NotificationHub`] owns one platform registry, one dispatcher, one queue
//! and one worker pool. Nothing is shared between hubs, so several differently
//! configured hubs can live in the same process.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::HubConfig;
use crate::dispatcher::Dispatcher;
use crate::events::{EVENT_CHANNEL_CAPACITY, HubEvent};
use crate::handle::{
    AsyncHandle, BatchHandle, BatchOptions, BatchTracker, CallbackExecutor, HandleSnapshot,
    HandleStatus, SendOptions, TerminalObserver,
};
use crate::message::{Message, Priority};
use crate::platform::{Platform, PlatformHealth, PlatformRegistry};
use crate::queue::{
    AsyncQueue, DeadLetterEntry, DeadLetterQueue, QueueItem, QueueStats, QueueStore,
    ShutdownReport, WorkerContext, WorkerPool,
};
use crate::receipt::{DeliveryStatus, Receipt, ReceiptAggregator};
use crate::retry::RetryPolicy;
use crate::{Error, Result};

/// Point-in-time statistics of a hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubStats {
    pub queue: QueueStats,
    /// Items currently held by a worker.
    pub in_flight: usize,
    /// Async items not yet terminal, scheduled ones included.
    pub live: usize,
    pub workers: usize,
    pub platforms: usize,
    pub dead_letters: usize,
}

/// Builder for [`NotificationHub`].
pub struct NotificationHubBuilder {
    config: HubConfig,
    platforms: Vec<Arc<dyn Platform>>,
    store: Option<Arc<dyn QueueStore>>,
    retry_policy: Option<RetryPolicy>,
}

impl NotificationHubBuilder {
    fn new(config: HubConfig) -> Self {
        Self {
            config,
            platforms: Vec::new(),
            store: None,
            retry_policy: None,
        }
    }

    /// Register a platform at construction time.
    pub fn platform(mut self, platform: Arc<dyn Platform>) -> Self {
        self.platforms.push(platform);
        self
    }

    /// Mirror admitted items into `store`.
    pub fn store(mut self, store: Arc<dyn QueueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use `policy` instead of the one built from `config.retry`.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Build the hub and start its workers. Must be called inside a Tokio
    /// runtime.
    pub fn build(self) -> Result<NotificationHub> {
        let config = self.config;
        config.validate()?;

        let registry = Arc::new(PlatformRegistry::new());
        for platform in self.platforms {
            registry.register_instance(platform)?;
        }

        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            &config.dispatcher,
            ReceiptAggregator::new(config.aggregation.clone()),
        ));
        let queue = Arc::new(AsyncQueue::with_store(config.queue.clone(), self.store));
        let dead_letters = Arc::new(DeadLetterQueue::new());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let retry = self
            .retry_policy
            .unwrap_or_else(|| RetryPolicy::from(&config.retry));

        let ctx = Arc::new(WorkerContext::new(
            queue.clone(),
            dispatcher.clone(),
            retry,
            dead_letters.clone(),
            events.clone(),
            Duration::from_secs(config.workers.item_timeout_secs),
        ));
        let pool = WorkerPool::new(ctx);
        pool.start(config.workers.workers);

        info!(
            platforms = registry.len(),
            workers = config.workers.workers,
            capacity = config.queue.capacity,
            "Notification hub started"
        );

        Ok(NotificationHub {
            config,
            registry,
            dispatcher,
            queue,
            pool,
            executor: CallbackExecutor::spawn(),
            events,
            dead_letters,
            live: Arc::new(DashMap::new()),
            timers: Mutex::new(Some(JoinSet::new())),
            shutdown: CancellationToken::new(),
        })
    }
}

/// Multi-platform notification hub.
///
/// # Example
///
/// ```ignore
/// let hub = NotificationHub::builder(HubConfig::default())
///     .platform(Arc::new(WebhookPlatform::new(WebhookConfig::default())))
///     .build()?;
///
/// let message = Message::new("Deploy finished", "v1.4.2 is live")
///     .with_target(Target::webhook("https://hooks.example.com/deploys"));
/// let receipt = hub.send(&message).await?;
///
/// let handle = hub.send_async(message, SendOptions::default()).await?;
/// let receipt = handle.wait().await?;
/// ```
pub struct NotificationHub {
    config: HubConfig,
    registry: Arc<PlatformRegistry>,
    dispatcher: Arc<Dispatcher>,
    queue: Arc<AsyncQueue>,
    pool: WorkerPool,
    executor: CallbackExecutor,
    events: broadcast::Sender<HubEvent>,
    dead_letters: Arc<DeadLetterQueue>,
    /// Async items that are not terminal yet.
    live: Arc<DashMap<String, AsyncHandle>>,
    /// Timers of scheduled sends.
    timers: Mutex<Option<JoinSet<()>>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for NotificationHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationHub")
            .field("registry", &self.registry)
            .field("queue", &self.queue)
            .field("pool", &self.pool)
            .field("live", &self.live.len())
            .finish()
    }
}

impl NotificationHub {
    /// Build a hub with no platforms registered yet.
    pub fn new(config: HubConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: HubConfig) -> NotificationHubBuilder {
        NotificationHubBuilder::new(config)
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<PlatformRegistry> {
        &self.registry
    }

    pub fn register_platform(&self, platform: Arc<dyn Platform>) -> Result<()> {
        self.registry.register_instance(platform)
    }

    pub fn unregister_platform(&self, name: &str) -> Result<Arc<dyn Platform>> {
        self.registry.unregister(name)
    }

    /// Names of the registered platforms.
    pub fn platforms(&self) -> Vec<String> {
        self.registry.list()
    }

    /// Health of every registered platform.
    pub async fn health(&self) -> HashMap<String, PlatformHealth> {
        self.registry.health().await
    }

    /// Deliver `message` right away and return its receipt.
    ///
    /// A `scheduled_at` on the message is ignored here. Per-target failures are
    /// reported inside the receipt; only an invalid message is an error.
    pub async fn send(&self, message: &Message) -> Result<Receipt> {
        self.ensure_running()?;
        self.dispatcher.dispatch(message).await
    }

    /// Queue `message` for async delivery.
    ///
    /// Returns as soon as the item is admitted. Fails with `QueueFull` when
    /// the queue is at capacity. A message scheduled in the future stays
    /// pending until its time comes, then enters the queue.
    pub async fn send_async(&self, message: Message, options: SendOptions) -> Result<AsyncHandle> {
        self.ensure_running()?;
        message.validate()?;

        let handle = self.new_handle(Uuid::new_v4().to_string(), &message, options, Vec::new());
        match message.remaining_delay() {
            Some(delay) => self.schedule(message, handle.clone(), delay),
            None => self.enqueue(message, handle.clone()).await?,
        }
        Ok(handle)
    }

    /// Queue several messages at once.
    ///
    /// Either every unscheduled message is admitted or none is. The batch
    /// handle reports progress after each child finishes.
    pub async fn send_async_batch(
        &self,
        messages: Vec<Message>,
        options: BatchOptions,
    ) -> Result<BatchHandle> {
        self.ensure_running()?;
        if messages.is_empty() {
            return Err(Error::validation("batch contains no messages"));
        }
        for message in &messages {
            message.validate()?;
        }

        let item_options = options.item.clone();
        let tracker = BatchTracker::new(
            Uuid::new_v4().to_string(),
            messages.len(),
            options,
            self.executor.clone(),
        );

        let mut children = Vec::with_capacity(messages.len());
        let mut immediate = Vec::new();
        let mut scheduled = Vec::new();
        for message in messages {
            let handle = self.new_handle(
                Uuid::new_v4().to_string(),
                &message,
                item_options.clone(),
                vec![tracker.observer()],
            );
            children.push(handle.clone());
            match message.remaining_delay() {
                Some(delay) => scheduled.push((message, handle, delay)),
                None => immediate.push(QueueItem::new(message, handle)),
            }
        }

        let admitted: Vec<(String, String, Priority)> = immediate
            .iter()
            .map(|item| {
                (
                    item.id().to_string(),
                    item.message().id().to_string(),
                    item.message().priority(),
                )
            })
            .collect();
        for item in &immediate {
            self.live.insert(item.id().to_string(), item.handle().clone());
        }
        if let Err(e) = self.queue.enqueue_batch(immediate).await {
            for (item_id, _, _) in &admitted {
                self.live.remove(item_id);
            }
            return Err(e);
        }
        for (item_id, message_id, priority) in admitted {
            self.emit(HubEvent::Enqueued {
                item_id,
                message_id,
                priority,
            });
        }
        for (message, handle, delay) in scheduled {
            self.schedule(message, handle, delay);
        }

        let batch = BatchHandle::new(tracker, children);
        debug!(batch_id = %batch.id(), size = batch.len(), "Batch submitted");
        Ok(batch)
    }

    /// Hub lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.events.subscribe()
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            queue: self.queue.stats(),
            in_flight: self.pool.in_flight(),
            live: self.live.len(),
            workers: self.pool.worker_count(),
            platforms: self.registry.len(),
            dead_letters: self.dead_letters.len(),
        }
    }

    /// Change the number of workers. In-flight items are never dropped.
    pub fn resize_workers(&self, workers: usize) -> Result<()> {
        self.ensure_running()?;
        if workers == 0 {
            return Err(Error::config("worker count must be at least 1"));
        }
        self.pool.resize(workers);
        Ok(())
    }

    /// Async items that ended failed, oldest first.
    pub fn dead_letters(&self) -> Vec<DeadLetterEntry> {
        self.dead_letters.list()
    }

    /// Re-submit the failed targets of a dead letter as a new async item.
    ///
    /// The entry is removed once the new item is admitted.
    pub async fn retry_dead_letter(&self, id: &str, options: SendOptions) -> Result<AsyncHandle> {
        let entry = self
            .dead_letters
            .take(id)
            .ok_or_else(|| Error::not_found("dead letter", id))?;

        match self.send_async(entry.retry_message(), options).await {
            Ok(handle) => {
                info!(dead_letter = %id, item_id = %handle.id(), "Retrying dead letter");
                Ok(handle)
            }
            Err(e) => {
                self.dead_letters.insert(entry);
                Err(e)
            }
        }
    }

    /// Drop dead letters older than the configured retention.
    pub fn cleanup_dead_letters(&self) -> usize {
        self.dead_letters
            .cleanup(self.config.dead_letter_retention_days)
    }

    /// Re-admit items left in the backing store, for example after a crash.
    ///
    /// Items this hub is already tracking are skipped. Returns a fresh handle
    /// per recovered item.
    pub async fn recover_pending(&self) -> Result<Vec<AsyncHandle>> {
        self.ensure_running()?;
        let Some(store) = self.queue.store().cloned() else {
            return Ok(Vec::new());
        };

        let mut recovered = Vec::new();
        while let Some(stored) = store.dequeue().await? {
            if self.live.contains_key(&stored.id) {
                continue;
            }
            let record = match stored.decode() {
                Ok(record) => record,
                Err(e) => {
                    warn!(item_id = %stored.id, error = %e, "Skipping undecodable stored item");
                    continue;
                }
            };

            let item_id = record.id.clone();
            let handle = self.new_handle(
                item_id.clone(),
                &record.message,
                SendOptions::default(),
                Vec::new(),
            );
            let priority = record.message.priority();
            let message_id = record.message.id().to_string();
            let item = QueueItem::from_record(record, handle.clone());

            self.live.insert(item_id.clone(), handle.clone());
            if let Err(e) = self.queue.enqueue_existing(item) {
                self.live.remove(&item_id);
                return Err(e);
            }
            self.emit(HubEvent::Enqueued {
                item_id,
                message_id,
                priority,
            });
            recovered.push(handle);
        }

        if !recovered.is_empty() {
            info!(count = recovered.len(), "Recovered stored items");
        }
        Ok(recovered)
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    /// Stop the hub.
    ///
    /// Workers get up to `grace` to finish what they hold. Everything that
    /// does not finish, including queued and scheduled items, ends failed and
    /// is listed in the report. Platforms are closed last.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        if self.shutdown.is_cancelled() {
            return ShutdownReport {
                completed_gracefully: true,
                ..Default::default()
            };
        }
        info!(grace = ?grace, "Shutting down notification hub");
        self.shutdown.cancel();

        let mut report = self.pool.stop(grace).await;

        let timers = self.timers.lock().take();
        if let Some(mut timers) = timers {
            while timers.join_next().await.is_some() {}
        }

        let leftovers: Vec<AsyncHandle> = self
            .live
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for handle in leftovers {
            if handle.finish(HandleStatus::Failed, None, Some(Error::QueueClosed)) {
                report.undelivered.push(handle.id().to_string());
            }
        }

        if let Err(e) = self.registry.close().await {
            report.close_error = Some(e.to_string());
        }
        self.executor.flush().await;

        info!(
            graceful = report.completed_gracefully,
            undelivered = report.undelivered.len(),
            "Notification hub stopped"
        );
        report
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(Error::QueueClosed)
        }
    }

    fn emit(&self, event: HubEvent) {
        let _ = self.events.send(event);
    }

    fn new_handle(
        &self,
        id: String,
        message: &Message,
        options: SendOptions,
        mut observers: Vec<TerminalObserver>,
    ) -> AsyncHandle {
        observers.push(hub_observer(self.events.clone(), Arc::downgrade(&self.live)));
        AsyncHandle::new(
            id,
            message.id(),
            options,
            self.executor.clone(),
            Arc::downgrade(&self.queue),
            observers,
        )
    }

    async fn enqueue(&self, message: Message, handle: AsyncHandle) -> Result<()> {
        let id = handle.id().to_string();
        let message_id = message.id().to_string();
        let priority = message.priority();

        self.live.insert(id.clone(), handle.clone());
        if let Err(e) = self.queue.enqueue(QueueItem::new(message, handle)).await {
            self.live.remove(&id);
            return Err(e);
        }
        self.emit(HubEvent::Enqueued {
            item_id: id,
            message_id,
            priority,
        });
        Ok(())
    }

    /// Hold `message` back for `delay`, then enqueue it.
    fn schedule(&self, message: Message, handle: AsyncHandle, delay: Duration) {
        debug!(item_id = %handle.id(), delay = ?delay, "Scheduled item");
        self.live.insert(handle.id().to_string(), handle.clone());

        let queue = self.queue.clone();
        let events = self.events.clone();
        let cancel = handle.cancel_token().clone();
        let shutdown = self.shutdown.clone();
        let timer = async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                // Cancelling a pending handle already made it terminal.
                _ = cancel.cancelled() => return,
                // Shutdown finalizes whatever is still live.
                _ = shutdown.cancelled() => return,
            }

            let id = handle.id().to_string();
            let message_id = message.id().to_string();
            let priority = message.priority();
            match queue.enqueue(QueueItem::new(message, handle.clone())).await {
                Ok(()) => {
                    let _ = events.send(HubEvent::Enqueued {
                        item_id: id,
                        message_id,
                        priority,
                    });
                }
                Err(e) => {
                    warn!(item_id = %id, error = %e, "Scheduled item could not be enqueued");
                    handle.finish(HandleStatus::Failed, None, Some(e));
                }
            }
        };

        let mut timers = self.timers.lock();
        if let Some(set) = timers.as_mut() {
            while set.try_join_next().is_some() {}
            set.spawn(timer);
        }
    }
}

impl Drop for NotificationHub {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Publishes the terminal event of a handle and stops tracking it.
fn hub_observer(
    events: broadcast::Sender<HubEvent>,
    live: Weak<DashMap<String, AsyncHandle>>,
) -> TerminalObserver {
    Arc::new(move |handle: &AsyncHandle, snapshot: &HandleSnapshot| {
        if let Some(live) = live.upgrade() {
            live.remove(handle.id());
        }

        let item_id = handle.id().to_string();
        let message_id = handle.message_id().to_string();
        let event = match snapshot.status {
            HandleStatus::Completed => HubEvent::Completed {
                item_id,
                message_id,
                status: snapshot
                    .receipt
                    .as_ref()
                    .map(Receipt::status)
                    .unwrap_or(DeliveryStatus::Success),
            },
            HandleStatus::Cancelled => HubEvent::Cancelled {
                item_id,
                message_id,
            },
            _ => HubEvent::Failed {
                item_id,
                message_id,
                error: snapshot
                    .error
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "delivery failed".to_string()),
            },
        };
        let _ = events.send(event);
    })
}
