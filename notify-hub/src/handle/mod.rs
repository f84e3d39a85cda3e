//! Async handles.
//!
//! Every asynchronously submitted message gets an [`AsyncHandle`]. The handle
//! is a small state machine:
//!
//! ```text
//! pending ──► processing ──► completed | failed | cancelled
//!    └──────────────────────────────────────────► cancelled
//! ```
//!
//! Terminal states are sinks. All transitions go through a single
//! `tokio::sync::watch` channel, so readers always see a consistent snapshot
//! and waiters are woken exactly when the state changes.

mod batch;
mod callbacks;

pub use batch::{BatchHandle, BatchProgress};
pub(crate) use batch::BatchTracker;
pub use callbacks::{
    BatchOptions, CallbackExecutor, CompleteCallback, ErrorCallback, ProgressCallback,
    ResultCallback, SendOptions,
};

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::queue::AsyncQueue;
use crate::receipt::Receipt;
use crate::{Error, Result};

/// Lifecycle state of an async item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandleStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl HandleStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for HandleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Processing => write!(f, "processing"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Point-in-time view of a handle.
#[derive(Debug, Clone)]
pub struct HandleSnapshot {
    pub status: HandleStatus,
    /// Delivery attempts made so far.
    pub attempts: u32,
    /// Final receipt, once one was produced.
    pub receipt: Option<Receipt>,
    /// Terminal error for failed or cancelled items.
    pub error: Option<Error>,
    pub updated_at: DateTime<Utc>,
}

impl HandleSnapshot {
    fn pending() -> Self {
        Self {
            status: HandleStatus::Pending,
            attempts: 0,
            receipt: None,
            error: None,
            updated_at: Utc::now(),
        }
    }

    /// Outcome as a result: the receipt when one exists, otherwise the error.
    ///
    /// A failed item that produced a receipt still yields `Ok`, so callers can
    /// inspect per-target errors; check `Receipt::status`.
    pub fn into_result(self) -> Result<Receipt> {
        match (self.status, self.receipt, self.error) {
            (HandleStatus::Cancelled, _, error) => Err(error.unwrap_or(Error::Cancelled)),
            (_, Some(receipt), _) => Ok(receipt),
            (_, None, Some(error)) => Err(error),
            (status, None, None) => Err(Error::InvalidStateTransition {
                from: status.to_string(),
                to: "terminal".to_string(),
            }),
        }
    }
}

/// Internal hook invoked once, right after a handle turns terminal.
pub(crate) type TerminalObserver = Arc<dyn Fn(&AsyncHandle, &HandleSnapshot) + Send + Sync>;

struct Inner {
    id: String,
    message_id: String,
    created_at: DateTime<Utc>,
    state: watch::Sender<HandleSnapshot>,
    cancel: CancellationToken,
    queue: Weak<AsyncQueue>,
    options: SendOptions,
    executor: CallbackExecutor,
    observers: Vec<TerminalObserver>,
}

/// Caller-held reference to an asynchronously delivered message.
#[derive(Clone)]
pub struct AsyncHandle {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for AsyncHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncHandle")
            .field("id", &self.inner.id)
            .field("message_id", &self.inner.message_id)
            .field("status", &self.status())
            .finish()
    }
}

impl AsyncHandle {
    pub(crate) fn new(
        id: String,
        message_id: &str,
        options: SendOptions,
        executor: CallbackExecutor,
        queue: Weak<AsyncQueue>,
        observers: Vec<TerminalObserver>,
    ) -> Self {
        let (state, _) = watch::channel(HandleSnapshot::pending());
        Self {
            inner: Arc::new(Inner {
                id,
                message_id: message_id.to_string(),
                created_at: Utc::now(),
                state,
                cancel: CancellationToken::new(),
                queue,
                options,
                executor,
                observers,
            }),
        }
    }

    /// Item id; also the backing-store key.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn message_id(&self) -> &str {
        &self.inner.message_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    pub fn status(&self) -> HandleStatus {
        self.inner.state.borrow().status
    }

    /// Non-blocking snapshot of the current state.
    pub fn poll(&self) -> HandleSnapshot {
        self.inner.state.borrow().clone()
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// Watch state changes.
    pub fn subscribe(&self) -> watch::Receiver<HandleSnapshot> {
        self.inner.state.subscribe()
    }

    /// Wait for a terminal state.
    pub async fn wait(&self) -> Result<Receipt> {
        self.wait_terminal().await.into_result()
    }

    /// Wait for a terminal state, giving up after `timeout`.
    pub async fn wait_timeout(&self, timeout: Duration) -> Result<Receipt> {
        match tokio::time::timeout(timeout, self.wait_terminal()).await {
            Ok(snapshot) => snapshot.into_result(),
            Err(_) => Err(Error::Timeout(format!(
                "item {} not finished after {:?}",
                self.inner.id, timeout
            ))),
        }
    }

    /// Wait for a terminal state unless `token` is cancelled first.
    ///
    /// Cancelling `token` only stops the wait; the item keeps going.
    pub async fn wait_with_token(&self, token: &CancellationToken) -> Result<Receipt> {
        tokio::select! {
            snapshot = self.wait_terminal() => snapshot.into_result(),
            _ = token.cancelled() => Err(Error::Cancelled),
        }
    }

    pub(crate) async fn wait_terminal(&self) -> HandleSnapshot {
        let mut rx = self.inner.state.subscribe();
        match rx.wait_for(|s| s.status.is_terminal()).await {
            Ok(snapshot) => HandleSnapshot::clone(&snapshot),
            // The sender lives as long as `self`, so this is only reachable
            // while tearing down.
            Err(_) => self.poll(),
        }
    }

    /// Best-effort cancellation.
    ///
    /// A pending item is removed from the queue and never dispatched. An item
    /// a worker already claimed only gets a cooperative cancellation signal and
    /// still reaches a terminal state on its own. Returns `false` when the item
    /// was already terminal.
    pub fn cancel(&self) -> bool {
        enum Action {
            Dequeue(HandleSnapshot),
            Signal,
            Nothing,
        }

        let mut action = Action::Nothing;
        self.inner.state.send_if_modified(|state| match state.status {
            HandleStatus::Pending => {
                state.status = HandleStatus::Cancelled;
                state.error = Some(Error::Cancelled);
                state.updated_at = Utc::now();
                action = Action::Dequeue(state.clone());
                true
            }
            HandleStatus::Processing => {
                action = Action::Signal;
                false
            }
            _ => false,
        });

        match action {
            Action::Dequeue(snapshot) => {
                self.inner.cancel.cancel();
                if let Some(queue) = self.inner.queue.upgrade() {
                    queue.remove(&self.inner.id);
                }
                info!(item_id = %self.inner.id, "Cancelled pending item");
                self.after_terminal(&snapshot);
                true
            }
            Action::Signal => {
                debug!(item_id = %self.inner.id, "Cancellation requested for claimed item");
                self.inner.cancel.cancel();
                true
            }
            Action::Nothing => false,
        }
    }

    /// Whether cancellation was requested.
    pub fn is_cancel_requested(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    /// Move to `processing`. Returns `false` when the item must not run.
    ///
    /// Re-claiming an item that is already processing (a retry) succeeds.
    pub(crate) fn claim(&self) -> bool {
        let mut claimed = false;
        self.inner.state.send_if_modified(|state| match state.status {
            HandleStatus::Pending => {
                state.status = HandleStatus::Processing;
                state.updated_at = Utc::now();
                claimed = true;
                true
            }
            HandleStatus::Processing => {
                claimed = true;
                false
            }
            _ => false,
        });
        claimed
    }

    pub(crate) fn record_attempt(&self, attempt: u32) {
        self.inner.state.send_if_modified(|state| {
            if state.status.is_terminal() || state.attempts == attempt {
                return false;
            }
            state.attempts = attempt;
            state.updated_at = Utc::now();
            true
        });
    }

    /// Move to a terminal state. Only the first call has any effect.
    pub(crate) fn finish(
        &self,
        status: HandleStatus,
        receipt: Option<Receipt>,
        error: Option<Error>,
    ) -> bool {
        debug_assert!(status.is_terminal());

        let mut published = None;
        self.inner.state.send_if_modified(|state| {
            if state.status.is_terminal() {
                return false;
            }
            state.status = status;
            state.receipt = receipt;
            state.error = error;
            state.updated_at = Utc::now();
            published = Some(state.clone());
            true
        });

        match published {
            Some(snapshot) => {
                if status == HandleStatus::Cancelled {
                    self.inner.cancel.cancel();
                }
                self.after_terminal(&snapshot);
                true
            }
            None => false,
        }
    }

    fn after_terminal(&self, snapshot: &HandleSnapshot) {
        self.fire_callbacks(snapshot);
        for observer in &self.inner.observers {
            observer(self, snapshot);
        }
    }

    fn fire_callbacks(&self, snapshot: &HandleSnapshot) {
        let options = &self.inner.options;
        if options.is_empty() {
            return;
        }
        let executor = &self.inner.executor;

        if let Some(callback) = &options.on_result
            && let Some(receipt) = &snapshot.receipt
        {
            for result in receipt.results() {
                let callback = callback.clone();
                let result = result.clone();
                executor.submit("on_result", move || callback(&result));
            }
        }

        if matches!(
            snapshot.status,
            HandleStatus::Failed | HandleStatus::Cancelled
        ) && let Some(callback) = &options.on_error
        {
            let callback = callback.clone();
            let error = snapshot.error.clone().unwrap_or(Error::Cancelled);
            executor.submit("on_error", move || callback(&error));
        }

        if let Some(callback) = &options.on_complete {
            let callback = callback.clone();
            let snapshot = snapshot.clone();
            executor.submit("on_complete", move || callback(&snapshot));
        }
    }
}
