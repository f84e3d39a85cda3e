//! User callbacks and the executor that runs them off the worker path.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::{BatchProgress, HandleSnapshot};
use crate::Error;
use crate::receipt::PlatformResult;
use crate::utils::panic_message;

pub type ResultCallback = Arc<dyn Fn(&PlatformResult) -> anyhow::Result<()> + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&Error) -> anyhow::Result<()> + Send + Sync>;
pub type CompleteCallback = Arc<dyn Fn(&HandleSnapshot) -> anyhow::Result<()> + Send + Sync>;
pub type ProgressCallback = Arc<dyn Fn(&BatchProgress) -> anyhow::Result<()> + Send + Sync>;

/// Per-item callbacks.
///
/// `on_result` fires once per final target result, `on_error` when the item
/// ends failed or cancelled, and `on_complete` once the item is terminal,
/// whatever the outcome.
#[derive(Clone, Default)]
pub struct SendOptions {
    pub on_result: Option<ResultCallback>,
    pub on_error: Option<ErrorCallback>,
    pub on_complete: Option<CompleteCallback>,
}

impl std::fmt::Debug for SendOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendOptions")
            .field("on_result", &self.on_result.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_complete", &self.on_complete.is_some())
            .finish()
    }
}

impl SendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_result<F>(mut self, f: F) -> Self
    where
        F: Fn(&PlatformResult) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_result = Some(Arc::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&Error) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub fn on_complete<F>(mut self, f: F) -> Self
    where
        F: Fn(&HandleSnapshot) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_complete = Some(Arc::new(f));
        self
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.on_result.is_none() && self.on_error.is_none() && self.on_complete.is_none()
    }
}

/// Callbacks for a batch submission.
///
/// `item` applies to every child. `on_progress` fires after every child
/// reaches a terminal state and `on_complete` once all of them have.
#[derive(Clone, Default)]
pub struct BatchOptions {
    pub item: SendOptions,
    pub on_progress: Option<ProgressCallback>,
    pub on_complete: Option<ProgressCallback>,
}

impl std::fmt::Debug for BatchOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchOptions")
            .field("item", &self.item)
            .field("on_progress", &self.on_progress.is_some())
            .field("on_complete", &self.on_complete.is_some())
            .finish()
    }
}

impl BatchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_item_options(mut self, item: SendOptions) -> Self {
        self.item = item;
        self
    }

    pub fn on_progress<F>(mut self, f: F) -> Self
    where
        F: Fn(&BatchProgress) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_progress = Some(Arc::new(f));
        self
    }

    pub fn on_complete<F>(mut self, f: F) -> Self
    where
        F: Fn(&BatchProgress) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_complete = Some(Arc::new(f));
        self
    }
}

type Job = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

enum Command {
    Run { name: &'static str, job: Job },
    Flush(oneshot::Sender<()>),
}

/// Runs callbacks one at a time on the blocking thread pool.
///
/// Submitting never blocks, and a callback that blocks its thread only
/// delays the callbacks queued behind it. A callback that errors or panics is
/// logged and the executor moves on to the next one.
#[derive(Clone)]
pub struct CallbackExecutor {
    tx: mpsc::UnboundedSender<Command>,
}

impl std::fmt::Debug for CallbackExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackExecutor")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl CallbackExecutor {
    /// Spawn the executor task. Must be called inside a Tokio runtime.
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Command>();

        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    Command::Run { name, job } => {
                        match tokio::task::spawn_blocking(job).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => {
                                warn!(callback = name, error = %e, "Callback returned an error");
                            }
                            Err(e) if e.is_panic() => {
                                warn!(
                                    callback = name,
                                    panic = %panic_message(e.into_panic().as_ref()),
                                    "Callback panicked"
                                );
                            }
                            Err(e) => {
                                warn!(callback = name, error = %e, "Callback task failed");
                            }
                        }
                    }
                    Command::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("Callback executor stopped");
        });

        Self { tx }
    }

    /// Queue a callback invocation.
    pub(crate) fn submit<F>(&self, name: &'static str, job: F)
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        if self
            .tx
            .send(Command::Run {
                name,
                job: Box::new(job),
            })
            .is_err()
        {
            debug!(callback = name, "Callback executor closed, dropping callback");
        }
    }

    /// Wait until every callback submitted before this call has run.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_callbacks_run_in_order() {
        let executor = CallbackExecutor::spawn();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));

        for i in 0..5 {
            let seen = seen.clone();
            executor.submit("test", move || {
                seen.lock().push(i);
                Ok(())
            });
        }
        executor.flush().await;
        assert_eq!(*seen.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_failing_callbacks_are_contained() {
        let executor = CallbackExecutor::spawn();
        let ran = Arc::new(AtomicUsize::new(0));

        executor.submit("err", || Err(anyhow::anyhow!("callback broke")));
        executor.submit("panic", || panic!("callback exploded"));
        let counter = ran.clone();
        executor.submit("ok", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        executor.flush().await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_blocking_callback_does_not_stall_runtime() {
        let executor = CallbackExecutor::spawn();
        executor.submit("slow", || {
            std::thread::sleep(std::time::Duration::from_millis(500));
            Ok(())
        });

        // Let the executor pick up the slow job.
        tokio::task::yield_now().await;
        let started = std::time::Instant::now();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(started.elapsed() < std::time::Duration::from_millis(200));

        executor.flush().await;
    }

    #[test]
    fn test_send_options_builder() {
        let options = SendOptions::new().on_error(|_| Ok(()));
        assert!(options.on_error.is_some());
        assert!(options.on_result.is_none());
        assert!(!options.is_empty());
        assert!(SendOptions::default().is_empty());
    }
}
