#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use notify_hub::{
    Message, Platform, PlatformCapabilities, PlatformError, PlatformResult, Target,
};
use parking_lot::Mutex;

/// Platform double driven by a small script.
pub struct ScriptedPlatform {
    name: String,
    calls: AtomicU32,
    fail_first: u32,
    error: PlatformError,
    failing_values: HashSet<String>,
    delay: Option<Duration>,
    panics: bool,
    sent: Mutex<Vec<(Instant, Vec<Target>)>>,
}

impl ScriptedPlatform {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            calls: AtomicU32::new(0),
            fail_first: 0,
            error: PlatformError::network("connection reset"),
            failing_values: HashSet::new(),
            delay: None,
            panics: false,
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Fail the first `n` calls with `error`.
    pub fn fail_first(mut self, n: u32, error: PlatformError) -> Self {
        self.fail_first = n;
        self.error = error;
        self
    }

    /// Fail every call with `error`.
    pub fn always_failing(self, error: PlatformError) -> Self {
        self.fail_first(u32::MAX, error)
    }

    /// Fail one target value on every call.
    pub fn failing_target(mut self, value: &str) -> Self {
        self.failing_values.insert(value.to_string());
        self
    }

    pub fn with_error(mut self, error: PlatformError) -> Self {
        self.error = error;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn panicking(mut self) -> Self {
        self.panics = true;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.sent.lock().iter().map(|(at, _)| *at).collect()
    }

    pub fn sent_values(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .flat_map(|(_, targets)| targets.iter().map(|t| t.value.clone()))
            .collect()
    }
}

#[async_trait]
impl Platform for ScriptedPlatform {
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
            panic!("{} blew up", self.name);
        }
        if call <= self.fail_first {
            return Err(self.error.clone());
        }

        Ok(targets
            .iter()
            .map(|target| {
                if self.failing_values.contains(&target.value) {
                    PlatformResult::failure(target.clone(), &self.name, self.error.clone())
                } else {
                    PlatformResult::success(target.clone(), &self.name)
                        .with_message_id(format!("{}-{}", self.name, call))
                }
            })
            .collect())
    }

    fn validate_target(&self, _target: &Target) -> Result<(), PlatformError> {
        Ok(())
    }

    fn capabilities(&self) -> PlatformCapabilities {
        PlatformCapabilities::default()
    }

    async fn is_healthy(&self) -> Result<(), PlatformError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), PlatformError> {
        Ok(())
    }
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
