//! Worker pool for async delivery.
//!
//! Each worker pulls from the shared [`AsyncQueue`], runs one delivery attempt
//! through the [`Dispatcher`] and either finalizes the item or hands it to a
//! retry timer. Retry delays never block a worker: the timer task puts the item
//! back into the queue once the delay has elapsed.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{AsyncQueue, DeadLetterEntry, DeadLetterQueue, QueueItem};
use crate::dispatcher::Dispatcher;
use crate::error::PlatformError;
use crate::events::HubEvent;
use crate::handle::{AsyncHandle, HandleStatus};
use crate::message::TargetKey;
use crate::receipt::{DeliveryStatus, PlatformResult};
use crate::retry::RetryPolicy;
use crate::utils::panic_message;
use crate::{Error, Result};

/// Configuration for a worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Number of concurrent workers.
    pub workers: usize,
    /// Upper bound for one delivery attempt, in seconds.
    pub item_timeout_secs: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            item_timeout_secs: 300,
        }
    }
}

impl WorkerPoolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::config("workers.workers must be at least 1"));
        }
        if self.item_timeout_secs == 0 {
            return Err(Error::config("workers.item_timeout_secs must be positive"));
        }
        Ok(())
    }
}

/// What happened during shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    /// Every in-flight item finished within the grace period.
    pub completed_gracefully: bool,
    /// Items that were finalized as failed without being delivered.
    pub undelivered: Vec<String>,
    /// Last error reported while closing platforms.
    pub close_error: Option<String>,
}

/// State shared by every worker and retry timer.
pub(crate) struct WorkerContext {
    pub(crate) queue: Arc<AsyncQueue>,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) retry: RetryPolicy,
    pub(crate) dead_letters: Arc<DeadLetterQueue>,
    pub(crate) events: broadcast::Sender<HubEvent>,
    pub(crate) item_timeout: Duration,
    in_flight: DashMap<String, AsyncHandle>,
    retries: Mutex<Option<JoinSet<()>>>,
    shutdown: CancellationToken,
}

impl WorkerContext {
    pub(crate) fn new(
        queue: Arc<AsyncQueue>,
        dispatcher: Arc<Dispatcher>,
        retry: RetryPolicy,
        dead_letters: Arc<DeadLetterQueue>,
        events: broadcast::Sender<HubEvent>,
        item_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            dispatcher,
            retry,
            dead_letters,
            events,
            item_timeout,
            in_flight: DashMap::new(),
            retries: Mutex::new(Some(JoinSet::new())),
            shutdown: CancellationToken::new(),
        }
    }

    fn emit(&self, event: HubEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Run one attempt for `item`.
    async fn process(self: &Arc<Self>, mut item: QueueItem) {
        let handle = item.handle.clone();
        if !handle.claim() {
            debug!(
                item_id = %handle.id(),
                status = %handle.status(),
                "Skipping item that can no longer run"
            );
            self.queue.ack(handle.id()).await;
            return;
        }
        if handle.is_cancel_requested() {
            self.finalize(item).await;
            return;
        }

        item.attempt += 1;
        let attempt = item.attempt;
        handle.record_attempt(attempt);
        self.emit(HubEvent::Claimed {
            item_id: handle.id().to_string(),
            message_id: handle.message_id().to_string(),
            attempt,
        });
        debug!(
            item_id = %handle.id(),
            message_id = %handle.message_id(),
            attempt,
            targets = item.pending.len(),
            "Processing item"
        );

        let message = item.message.retarget(item.pending.clone());
        let delivery = tokio::time::timeout(
            self.item_timeout,
            self.dispatcher
                .deliver(&message, handle.cancel_token(), attempt),
        );
        let results = match AssertUnwindSafe(delivery).catch_unwind().await {
            Ok(Ok(Ok(results))) => results,
            Ok(Ok(Err(e))) => {
                warn!(item_id = %handle.id(), error = %e, "Item rejected by dispatcher");
                self.fail_without_receipt(item, e).await;
                return;
            }
            Ok(Err(_)) => {
                warn!(
                    item_id = %handle.id(),
                    timeout = ?self.item_timeout,
                    "Delivery attempt timed out"
                );
                fail_targets(
                    &item,
                    PlatformError::timeout(format!(
                        "attempt did not finish within {:?}",
                        self.item_timeout
                    )),
                )
            }
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                error!(item_id = %handle.id(), panic = %reason, "Delivery attempt panicked");
                fail_targets(
                    &item,
                    PlatformError::internal(format!("delivery panicked: {}", reason)),
                )
            }
        };

        let cancelled = handle.is_cancel_requested();
        let mut retry_delay = Duration::ZERO;
        item.retrying.clear();
        for result in results {
            let delay = match &result.error {
                Some(err)
                    if !result.success && !cancelled && self.retry.should_retry(err, attempt) =>
                {
                    Some(self.retry.next_delay(attempt, err))
                }
                _ => None,
            };
            match delay {
                Some(delay) => {
                    retry_delay = retry_delay.max(delay);
                    item.retrying.push(result);
                }
                None => item.settled.push(result),
            }
        }

        if item.retrying.is_empty() {
            self.finalize(item).await;
        } else {
            item.pending = item.retrying.iter().map(|r| r.target.clone()).collect();
            // A restart must resume from here, not from the first attempt.
            self.queue.checkpoint(&item).await;
            self.schedule_retry(item, retry_delay);
        }
    }

    fn schedule_retry(self: &Arc<Self>, item: QueueItem, delay: Duration) {
        info!(
            item_id = %item.id(),
            attempt = item.attempt,
            delay_ms = delay.as_millis() as u64,
            pending = item.pending.len(),
            "Scheduling retry"
        );
        self.emit(HubEvent::RetryScheduled {
            item_id: item.id().to_string(),
            message_id: item.message.id().to_string(),
            attempt: item.attempt,
            delay_ms: delay.as_millis() as u64,
            pending_targets: item.pending.len(),
        });

        enum Wake {
            Due,
            Cancelled,
            Shutdown,
        }

        let mut retries = self.retries.lock();
        let Some(set) = retries.as_mut() else {
            // Timers were already drained by `stop`; let the final drain see it.
            drop(retries);
            self.queue.requeue(item);
            return;
        };
        while set.try_join_next().is_some() {}

        let ctx = self.clone();
        let cancel = item.handle.cancel_token().clone();
        let shutdown = self.shutdown.clone();
        set.spawn(async move {
            let wake = tokio::select! {
                _ = tokio::time::sleep(delay) => Wake::Due,
                _ = cancel.cancelled() => Wake::Cancelled,
                _ = shutdown.cancelled() => Wake::Shutdown,
            };
            match wake {
                Wake::Due | Wake::Shutdown => ctx.queue.requeue(item),
                Wake::Cancelled => ctx.finalize(item).await,
            }
        });
    }

    /// Aggregate the settled results and move the handle to its final state.
    async fn finalize(&self, mut item: QueueItem) {
        let handle = item.handle.clone();
        let cancelled = handle.is_cancel_requested();

        let mut results = std::mem::take(&mut item.settled);
        results.append(&mut item.retrying);
        sort_by_target_order(&mut results, &item);

        let receipt = self
            .dispatcher
            .aggregator()
            .aggregate(item.message.id(), results);

        let (status, error) = match receipt.status() {
            DeliveryStatus::Success => (HandleStatus::Completed, None),
            _ if cancelled => (HandleStatus::Cancelled, Some(Error::Cancelled)),
            DeliveryStatus::Partial => (HandleStatus::Completed, None),
            DeliveryStatus::Failed => (
                HandleStatus::Failed,
                Some(Error::DeliveryFailed {
                    message_id: receipt.message_id().to_string(),
                    failed: receipt.failed(),
                    total: receipt.total(),
                }),
            ),
        };

        if status == HandleStatus::Failed {
            let last_error = receipt
                .failures()
                .filter_map(|r| r.error.as_ref())
                .last()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "delivery failed".to_string());
            self.dead_letters.insert(DeadLetterEntry::new(
                handle.id(),
                item.message.clone(),
                item.attempt,
                Some(&receipt),
                last_error,
                handle.created_at(),
            ));
            self.emit(HubEvent::DeadLettered {
                item_id: handle.id().to_string(),
                message_id: handle.message_id().to_string(),
            });
        }

        info!(
            item_id = %handle.id(),
            message_id = %handle.message_id(),
            attempts = item.attempt,
            status = %status,
            successful = receipt.successful(),
            failed = receipt.failed(),
            "Item finished"
        );

        self.queue.ack(handle.id()).await;
        handle.finish(status, Some(receipt), error);
    }

    async fn fail_without_receipt(&self, item: QueueItem, error: Error) {
        let handle = item.handle.clone();
        self.dead_letters.insert(DeadLetterEntry::new(
            handle.id(),
            item.message.clone(),
            item.attempt,
            None,
            error.to_string(),
            handle.created_at(),
        ));
        self.emit(HubEvent::DeadLettered {
            item_id: handle.id().to_string(),
            message_id: handle.message_id().to_string(),
        });
        self.queue.ack(handle.id()).await;
        handle.finish(HandleStatus::Failed, None, Some(error));
    }
}

/// One failure per pending target.
fn fail_targets(item: &QueueItem, error: PlatformError) -> Vec<PlatformResult> {
    let mut seen = HashSet::new();
    item.pending
        .iter()
        .filter(|target| seen.insert(target.key()))
        .map(|target| {
            let platform = target.platform.clone().unwrap_or_default();
            PlatformResult::failure(target.clone(), platform, error.clone())
                .with_attempt(item.attempt)
        })
        .collect()
}

fn sort_by_target_order(results: &mut [PlatformResult], item: &QueueItem) {
    let order: HashMap<TargetKey, usize> = item
        .message
        .targets()
        .iter()
        .enumerate()
        .rev()
        .map(|(idx, target)| (target.key(), idx))
        .collect();
    results.sort_by_key(|r| order.get(&r.target.key()).copied().unwrap_or(usize::MAX));
}

async fn run_worker(ctx: Arc<WorkerContext>, worker_id: usize, token: CancellationToken) {
    debug!(worker = worker_id, "Worker started");

    loop {
        if token.is_cancelled() {
            break;
        }

        let item = match ctx.queue.dequeue(&token).await {
            Ok(item) => item,
            Err(Error::Cancelled) | Err(Error::QueueClosed) => break,
            Err(e) => {
                error!(worker = worker_id, error = %e, "Error dequeuing item");
                continue;
            }
        };

        let item_id = item.id().to_string();
        ctx.in_flight.insert(item_id.clone(), item.handle.clone());
        ctx.process(item).await;
        ctx.in_flight.remove(&item_id);
    }

    debug!(worker = worker_id, "Worker stopped");
}

/// A resizable set of workers draining one queue.
pub struct WorkerPool {
    ctx: Arc<WorkerContext>,
    /// Cancellation token for each running worker.
    workers: Mutex<Vec<CancellationToken>>,
    /// Task set for workers.
    tasks: Mutex<Option<JoinSet<()>>>,
    next_worker_id: AtomicUsize,
}

impl WorkerPool {
    pub(crate) fn new(ctx: Arc<WorkerContext>) -> Self {
        Self {
            ctx,
            workers: Mutex::new(Vec::new()),
            tasks: Mutex::new(Some(JoinSet::new())),
            next_worker_id: AtomicUsize::new(0),
        }
    }

    /// Start `workers` workers.
    pub fn start(&self, workers: usize) {
        info!(workers, "Starting worker pool");
        self.resize(workers);
    }

    /// Adjust the number of workers.
    ///
    /// Removed workers finish the item they are processing before exiting.
    pub fn resize(&self, workers: usize) {
        if !self.is_running() {
            warn!("Ignoring resize of a stopped worker pool");
            return;
        }

        let mut tokens = self.workers.lock();
        let current = tokens.len();
        if workers > current {
            let mut tasks = self.tasks.lock();
            if let Some(join_set) = tasks.as_mut() {
                while join_set.try_join_next().is_some() {}
                for _ in current..workers {
                    let worker_id = self.next_worker_id.fetch_add(1, Ordering::SeqCst);
                    let token = self.ctx.shutdown.child_token();
                    tokens.push(token.clone());
                    join_set.spawn(run_worker(self.ctx.clone(), worker_id, token));
                }
            }
        } else {
            for token in tokens.drain(workers..) {
                token.cancel();
            }
        }

        if workers != current {
            info!(from = current, to = workers, "Resized worker pool");
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    /// Items currently being processed by a worker.
    pub fn in_flight(&self) -> usize {
        self.ctx.in_flight.len()
    }

    pub fn is_running(&self) -> bool {
        !self.ctx.shutdown.is_cancelled()
    }

    /// Stop the pool.
    ///
    /// Workers stop taking new items and get up to `grace` to finish the ones
    /// they hold; stragglers are aborted. Every item that did not finish, and
    /// everything still queued, is finalized as failed and listed in the
    /// report. Those items are not acked, so a backing store keeps them.
    pub async fn stop(&self, grace: Duration) -> ShutdownReport {
        info!(grace = ?grace, "Stopping worker pool");
        self.ctx.queue.close();
        self.ctx.shutdown.cancel();
        self.workers.lock().clear();

        // Take the join set out of the mutex before awaiting
        let tasks = self.tasks.lock().take();
        let mut completed_gracefully = true;
        if let Some(mut join_set) = tasks {
            let joined = tokio::time::timeout(grace, async {
                while join_set.join_next().await.is_some() {}
            })
            .await;
            if joined.is_err() {
                warn!("Workers did not finish within the grace period, aborting");
                completed_gracefully = false;
                join_set.abort_all();
                while join_set.join_next().await.is_some() {}
            }
        }

        // Pending retry timers requeue as soon as they see the shutdown.
        let retries = self.ctx.retries.lock().take();
        if let Some(mut join_set) = retries {
            while join_set.join_next().await.is_some() {}
        }

        let mut undelivered = Vec::new();
        let aborted: Vec<AsyncHandle> = self
            .ctx
            .in_flight
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.ctx.in_flight.clear();
        for handle in aborted {
            if handle.finish(
                HandleStatus::Failed,
                None,
                Some(Error::Timeout("aborted during shutdown".to_string())),
            ) {
                undelivered.push(handle.id().to_string());
            }
        }

        for item in self.ctx.queue.drain() {
            if item.handle.finish(HandleStatus::Failed, None, Some(Error::QueueClosed)) {
                undelivered.push(item.id().to_string());
            }
        }

        if !undelivered.is_empty() {
            warn!(count = undelivered.len(), "Items left undelivered at shutdown");
        }
        info!("Worker pool stopped");

        ShutdownReport {
            completed_gracefully,
            undelivered,
            close_error: None,
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.ctx.shutdown.cancel();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.worker_count())
            .field("in_flight", &self.in_flight())
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::DispatcherConfig;
    use crate::events::EVENT_CHANNEL_CAPACITY;
    use crate::handle::{CallbackExecutor, SendOptions};
    use crate::message::{Message, Target};
    use crate::platform::PlatformRegistry;
    use crate::queue::QueueConfig;
    use crate::receipt::{AggregationConfig, ReceiptAggregator};
    use crate::testing::MockPlatform;

    struct Fixture {
        ctx: Arc<WorkerContext>,
        pool: WorkerPool,
        executor: CallbackExecutor,
    }

    fn fixture(platform: Arc<MockPlatform>, retry: RetryPolicy, item_timeout: Duration) -> Fixture {
        let registry = Arc::new(PlatformRegistry::new());
        registry.register_instance(platform).unwrap();
        let dispatcher = Arc::new(Dispatcher::new(
            registry,
            &DispatcherConfig::default(),
            ReceiptAggregator::new(AggregationConfig::default()),
        ));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let ctx = Arc::new(WorkerContext::new(
            Arc::new(AsyncQueue::new(QueueConfig::default())),
            dispatcher,
            retry,
            Arc::new(DeadLetterQueue::new()),
            events,
            item_timeout,
        ));
        Fixture {
            pool: WorkerPool::new(ctx.clone()),
            ctx,
            executor: CallbackExecutor::spawn(),
        }
    }

    impl Fixture {
        async fn submit(&self, message: Message) -> AsyncHandle {
            let handle = AsyncHandle::new(
                uuid::Uuid::new_v4().to_string(),
                message.id(),
                SendOptions::default(),
                self.executor.clone(),
                Arc::downgrade(&self.ctx.queue),
                Vec::new(),
            );
            self.ctx
                .queue
                .enqueue(QueueItem::new(message, handle.clone()))
                .await
                .unwrap();
            handle
        }
    }

    fn email_message() -> Message {
        Message::new("Hi", "there").with_target(Target::email("a@example.com"))
    }

    #[test]
    fn test_worker_pool_config_default() {
        let config = WorkerPoolConfig::default();
        assert_eq!(config.workers, 4);
        assert_eq!(config.item_timeout_secs, 300);
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_processes_item() {
        let platform = Arc::new(MockPlatform::new("email"));
        let f = fixture(platform.clone(), RetryPolicy::no_retry(), Duration::from_secs(5));
        f.pool.start(2);
        assert_eq!(f.pool.worker_count(), 2);

        let handle = f.submit(email_message()).await;
        let receipt = handle.wait_timeout(Duration::from_secs(5)).await.unwrap();
        assert_eq!(receipt.status(), DeliveryStatus::Success);
        assert_eq!(handle.poll().attempts, 1);
        assert_eq!(platform.calls(), 1);

        let report = f.pool.stop(Duration::from_secs(1)).await;
        assert!(report.completed_gracefully);
        assert!(report.undelivered.is_empty());
    }

    #[tokio::test]
    async fn test_retries_only_failed_targets() {
        let platform = Arc::new(MockPlatform::new("email").failing_target("b@example.com"));
        let retry = RetryPolicy::fixed(Duration::from_millis(10)).with_max_attempts(3);
        let f = fixture(platform.clone(), retry, Duration::from_secs(5));
        f.pool.start(1);

        let message = Message::new("Hi", "there")
            .with_target(Target::email("a@example.com"))
            .with_target(Target::email("b@example.com"));
        let handle = f.submit(message).await;
        let receipt = handle.wait_timeout(Duration::from_secs(5)).await.unwrap();

        assert_eq!(receipt.status(), DeliveryStatus::Partial);
        assert_eq!(receipt.results()[0].target.value, "a@example.com");
        assert_eq!(receipt.results()[0].attempt, 1);
        assert_eq!(receipt.results()[1].attempt, 3);
        assert_eq!(platform.calls(), 3);
        // a@ was only delivered once.
        let sent_a = platform
            .sent_targets()
            .iter()
            .filter(|t| t.value == "a@example.com")
            .count();
        assert_eq!(sent_a, 1);
        assert_eq!(handle.status(), HandleStatus::Completed);
        assert!(f.ctx.dead_letters.is_empty());
    }

    #[tokio::test]
    async fn test_failed_item_is_dead_lettered() {
        let platform =
            Arc::new(MockPlatform::new("email").failing_with(PlatformError::auth("denied")));
        let retry = RetryPolicy::fixed(Duration::from_millis(10)).with_max_attempts(3);
        let f = fixture(platform.clone(), retry, Duration::from_secs(5));
        f.pool.start(1);

        let handle = f.submit(email_message()).await;
        let receipt = handle.wait_timeout(Duration::from_secs(5)).await.unwrap();
        assert_eq!(receipt.status(), DeliveryStatus::Failed);
        assert_eq!(handle.status(), HandleStatus::Failed);
        // Auth failures are never retried.
        assert_eq!(platform.calls(), 1);

        let entry = f.ctx.dead_letters.get(handle.id()).unwrap();
        assert_eq!(entry.attempts, 1);
        assert!(entry.error.contains("denied"));
    }

    #[tokio::test]
    async fn test_item_timeout_is_retryable() {
        let platform = Arc::new(MockPlatform::new("email").with_delay(Duration::from_millis(300)));
        let retry = RetryPolicy::fixed(Duration::from_millis(10)).with_max_attempts(2);
        let f = fixture(platform.clone(), retry, Duration::from_millis(50));
        f.pool.start(1);

        let handle = f.submit(email_message()).await;
        let receipt = handle.wait_timeout(Duration::from_secs(5)).await.unwrap();
        assert_eq!(receipt.status(), DeliveryStatus::Failed);
        assert_eq!(platform.calls(), 2);
        assert_eq!(
            receipt.results()[0].error.as_ref().unwrap().category,
            crate::error::ErrorCategory::Timeout
        );
    }

    #[tokio::test]
    async fn test_cancel_during_retry_delay() {
        let platform = Arc::new(MockPlatform::new("email").failing_network());
        let retry = RetryPolicy::fixed(Duration::from_secs(30)).with_max_attempts(3);
        let f = fixture(platform.clone(), retry, Duration::from_secs(5));
        let mut events = f.ctx.events.subscribe();
        f.pool.start(1);

        let handle = f.submit(email_message()).await;
        loop {
            if let HubEvent::RetryScheduled { .. } = events.recv().await.unwrap() {
                break;
            }
        }
        assert!(handle.cancel());
        assert!(matches!(
            handle.wait_timeout(Duration::from_secs(5)).await,
            Err(Error::Cancelled)
        ));
        assert_eq!(platform.calls(), 1);
        let snapshot = handle.poll();
        assert_eq!(snapshot.status, HandleStatus::Cancelled);
        assert_eq!(snapshot.receipt.unwrap().failed(), 1);
    }

    #[tokio::test]
    async fn test_resize() {
        let f = fixture(
            Arc::new(MockPlatform::new("email")),
            RetryPolicy::no_retry(),
            Duration::from_secs(5),
        );
        f.pool.start(2);
        f.pool.resize(5);
        assert_eq!(f.pool.worker_count(), 5);
        f.pool.resize(1);
        assert_eq!(f.pool.worker_count(), 1);

        let handle = f.submit(email_message()).await;
        assert!(handle.wait_timeout(Duration::from_secs(5)).await.is_ok());
    }

    #[tokio::test]
    async fn test_shrink_keeps_in_flight_item() {
        let platform = Arc::new(MockPlatform::new("email").with_delay(Duration::from_millis(200)));
        let f = fixture(platform.clone(), RetryPolicy::no_retry(), Duration::from_secs(5));
        f.pool.start(3);

        let handle = f.submit(email_message()).await;
        while handle.status() != HandleStatus::Processing {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        f.pool.resize(1);
        assert_eq!(f.pool.worker_count(), 1);

        let receipt = handle.wait_timeout(Duration::from_secs(5)).await.unwrap();
        assert_eq!(receipt.status(), DeliveryStatus::Success);
        assert_eq!(handle.status(), HandleStatus::Completed);
        assert_eq!(platform.calls(), 1);

        // The remaining worker still serves the queue.
        let next = f.submit(email_message()).await;
        assert!(next.wait_timeout(Duration::from_secs(5)).await.is_ok());
    }

    #[tokio::test]
    async fn test_stop_waits_for_in_flight_item() {
        let platform = Arc::new(MockPlatform::new("email").with_delay(Duration::from_millis(200)));
        let f = fixture(platform.clone(), RetryPolicy::no_retry(), Duration::from_secs(5));
        f.pool.start(2);

        let handle = f.submit(email_message()).await;
        while handle.status() != HandleStatus::Processing {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let report = f.pool.stop(Duration::from_secs(2)).await;
        assert!(report.completed_gracefully);
        assert!(report.undelivered.is_empty());
        assert_eq!(handle.status(), HandleStatus::Completed);
        assert_eq!(
            handle.poll().receipt.unwrap().status(),
            DeliveryStatus::Success
        );
        assert_eq!(platform.calls(), 1);
    }

    #[tokio::test]
    async fn test_stop_reports_leftovers() {
        let platform = Arc::new(MockPlatform::new("email").with_delay(Duration::from_secs(10)));
        let f = fixture(platform, RetryPolicy::no_retry(), Duration::from_secs(60));
        f.pool.start(1);

        let busy = f.submit(email_message()).await;
        // Wait for the worker to pick up the first item.
        while busy.status() != HandleStatus::Processing {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let queued = f.submit(email_message()).await;

        let report = f.pool.stop(Duration::from_millis(50)).await;
        assert!(!report.completed_gracefully);
        assert_eq!(report.undelivered.len(), 2);
        assert!(report.undelivered.contains(&busy.id().to_string()));
        assert!(report.undelivered.contains(&queued.id().to_string()));
        assert_eq!(busy.status(), HandleStatus::Failed);
        assert!(matches!(queued.wait().await, Err(Error::QueueClosed)));
        assert!(!f.pool.is_running());
    }

    #[tokio::test]
    async fn test_cancelled_before_claim_is_skipped() {
        let platform = Arc::new(MockPlatform::new("email"));
        let f = fixture(platform.clone(), RetryPolicy::no_retry(), Duration::from_secs(5));

        let handle = f.submit(email_message()).await;
        assert!(handle.cancel());
        assert_eq!(f.ctx.queue.depth(), 0);

        f.pool.start(1);
        let other = f.submit(email_message()).await;
        other.wait_timeout(Duration::from_secs(5)).await.unwrap();
        assert_eq!(platform.calls(), 1);
        assert_eq!(handle.status(), HandleStatus::Cancelled);
    }
}
