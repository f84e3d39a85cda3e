//! Batch handles.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

use super::{
    AsyncHandle, BatchOptions, CallbackExecutor, HandleSnapshot, HandleStatus, TerminalObserver,
};
use crate::receipt::Receipt;
use crate::{Error, Result};

/// Completion counts for a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl BatchProgress {
    fn new(total: usize) -> Self {
        Self {
            total,
            ..Default::default()
        }
    }

    /// Children in a terminal state.
    pub fn finished(&self) -> usize {
        self.completed + self.failed + self.cancelled
    }

    pub fn is_done(&self) -> bool {
        self.finished() >= self.total
    }

    fn record(&mut self, status: HandleStatus) {
        match status {
            HandleStatus::Completed => self.completed += 1,
            HandleStatus::Failed => self.failed += 1,
            HandleStatus::Cancelled => self.cancelled += 1,
            HandleStatus::Pending | HandleStatus::Processing => {}
        }
    }
}

/// Shared progress state for the children of one batch.
pub(crate) struct BatchTracker {
    id: String,
    progress: watch::Sender<BatchProgress>,
    options: BatchOptions,
    executor: CallbackExecutor,
}

impl BatchTracker {
    pub(crate) fn new(
        id: String,
        total: usize,
        options: BatchOptions,
        executor: CallbackExecutor,
    ) -> Arc<Self> {
        let (progress, _) = watch::channel(BatchProgress::new(total));
        Arc::new(Self {
            id,
            progress,
            options,
            executor,
        })
    }

    /// Observer to install on every child handle.
    pub(crate) fn observer(self: &Arc<Self>) -> TerminalObserver {
        let tracker = self.clone();
        Arc::new(move |_handle: &AsyncHandle, snapshot: &HandleSnapshot| {
            tracker.child_finished(snapshot.status);
        })
    }

    fn child_finished(&self, status: HandleStatus) {
        let mut current = BatchProgress::default();
        self.progress.send_modify(|progress| {
            progress.record(status);
            current = *progress;
        });

        debug!(
            batch_id = %self.id,
            finished = current.finished(),
            total = current.total,
            "Batch progress"
        );

        if let Some(callback) = &self.options.on_progress {
            let callback = callback.clone();
            self.executor
                .submit("on_progress", move || callback(&current));
        }
        // Each child reports exactly once, so only the last one sees `done`.
        if current.is_done()
            && let Some(callback) = &self.options.on_complete
        {
            let callback = callback.clone();
            self.executor
                .submit("on_batch_complete", move || callback(&current));
        }
    }
}

/// Handle over a batch of async items.
pub struct BatchHandle {
    tracker: Arc<BatchTracker>,
    children: Vec<AsyncHandle>,
}

impl std::fmt::Debug for BatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchHandle")
            .field("id", &self.tracker.id)
            .field("progress", &self.progress())
            .finish()
    }
}

impl BatchHandle {
    pub(crate) fn new(tracker: Arc<BatchTracker>, children: Vec<AsyncHandle>) -> Self {
        Self { tracker, children }
    }

    pub fn id(&self) -> &str {
        &self.tracker.id
    }

    /// Child handles, in submission order.
    pub fn handles(&self) -> &[AsyncHandle] {
        &self.children
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn progress(&self) -> BatchProgress {
        *self.tracker.progress.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<BatchProgress> {
        self.tracker.progress.subscribe()
    }

    /// Wait until every child is terminal and return the final counts.
    pub async fn wait(&self) -> BatchProgress {
        let mut rx = self.tracker.progress.subscribe();
        match rx.wait_for(|p| p.is_done()).await {
            Ok(progress) => *progress,
            Err(_) => self.progress(),
        }
    }

    pub async fn wait_timeout(&self, timeout: Duration) -> Result<BatchProgress> {
        tokio::time::timeout(timeout, self.wait()).await.map_err(|_| {
            Error::Timeout(format!(
                "batch {} not finished after {:?}",
                self.id(),
                timeout
            ))
        })
    }

    /// Wait for every child and collect their outcomes in submission order.
    pub async fn results(&self) -> Vec<Result<Receipt>> {
        let waits = self.children.iter().map(|child| child.wait());
        futures::future::join_all(waits).await
    }

    /// Cancel every child; returns how many accepted the request.
    pub fn cancel(&self) -> usize {
        self.children.iter().filter(|child| child.cancel()).count()
    }
}
