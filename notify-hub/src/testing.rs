//! Test doubles shared by unit tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::PlatformError;
use crate::message::{Message, Target};
use crate::platform::{Platform, PlatformCapabilities};
use crate::receipt::PlatformResult;

/// Scriptable in-memory platform.
pub(crate) struct MockPlatform {
    name: String,
    calls: AtomicU32,
    closed: AtomicBool,
    healthy: bool,
    close_fails: bool,
    panics: bool,
    delay: Option<Duration>,
    /// Fail every call while `calls <= fail_first`.
    fail_first: u32,
    fail_error: PlatformError,
    /// Targets that always fail, by value.
    failing_values: HashSet<String>,
    capabilities: PlatformCapabilities,
    sent: Mutex<Vec<(Instant, Vec<Target>)>>,
}

impl MockPlatform {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            calls: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            healthy: true,
            close_fails: false,
            panics: false,
            delay: None,
            fail_first: 0,
            fail_error: PlatformError::network("connection reset"),
            failing_values: HashSet::new(),
            capabilities: PlatformCapabilities::default(),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn failing_network(self) -> Self {
        self.failing_with(PlatformError::network("connection reset"))
    }

    pub(crate) fn failing_with(mut self, error: PlatformError) -> Self {
        self.fail_first = u32::MAX;
        self.fail_error = error;
        self
    }

    pub(crate) fn fail_first(mut self, n: u32, error: PlatformError) -> Self {
        self.fail_first = n;
        self.fail_error = error;
        self
    }

    pub(crate) fn failing_target(mut self, value: &str) -> Self {
        self.failing_values.insert(value.to_string());
        self
    }

    pub(crate) fn unhealthy(mut self) -> Self {
        self.healthy = false;
        self
    }

    pub(crate) fn failing_close(mut self) -> Self {
        self.close_fails = true;
        self
    }

    pub(crate) fn panicking(mut self) -> Self {
        self.panics = true;
        self
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn with_capabilities(mut self, capabilities: PlatformCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub(crate) fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn sent_targets(&self) -> Vec<Target> {
        self.sent
            .lock()
            .iter()
            .flat_map(|(_, targets)| targets.iter().cloned())
            .collect()
    }

    pub(crate) fn call_times(&self) -> Vec<Instant> {
        self.sent.lock().iter().map(|(at, _)| *at).collect()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Platform for MockPlatform {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(
        &self,
        _message: &Message,
        targets: &[Target],
    ) -> Result<Vec<PlatformResult>, PlatformError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.sent.lock().push((Instant::now(), targets.to_vec()));

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.panics {
            panic!("mock platform {} exploded", self.name);
        }
        if call <= self.fail_first {
            return Err(self.fail_error.clone());
        }

        Ok(targets
            .iter()
            .map(|target| {
                if self.failing_values.contains(&target.value) {
                    PlatformResult::failure(target.clone(), &self.name, self.fail_error.clone())
                } else {
                    PlatformResult::success(target.clone(), &self.name)
                        .with_message_id(format!("{}-{}", self.name, call))
                }
            })
            .collect())
    }

    fn validate_target(&self, target: &Target) -> Result<(), PlatformError> {
        if target.value.starts_with("invalid") {
            return Err(PlatformError::validation(format!(
                "{} rejects {}",
                self.name, target.value
            )));
        }
        Ok(())
    }

    fn capabilities(&self) -> PlatformCapabilities {
        self.capabilities.clone()
    }

    async fn is_healthy(&self) -> Result<(), PlatformError> {
        if self.healthy {
            Ok(())
        } else {
            Err(PlatformError::unavailable(format!("{} is down", self.name)))
        }
    }

    async fn close(&self) -> Result<(), PlatformError> {
        self.closed.store(true, Ordering::SeqCst);
        if self.close_fails {
            return Err(PlatformError::internal(format!(
                "{} failed to close",
                self.name
            )));
        }
        Ok(())
    }
}
