//! Target routing and fan-out.
//!
//! The [`Dispatcher`] resolves every target of a message to a platform, groups
//! the targets by platform and sends each group concurrently. Every target gets
//! exactly one [`PlatformResult`], including targets that could not be routed
//! or whose platform is missing, misconfigured or panicked. The dispatcher never
//! retries; retries belong to the worker pool.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use futures::FutureExt;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::PlatformError;
use crate::message::{Message, Target, TargetKey, TargetType};
use crate::platform::{Platform, PlatformRegistry};
use crate::receipt::{PlatformResult, Receipt, ReceiptAggregator};
use crate::utils::panic_message;
use crate::{Error, Result};

/// Platform name recorded on results for targets no platform could take.
pub const UNRESOLVED_PLATFORM: &str = "unresolved";

static EMAIL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap());
static PHONE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\+?[0-9][0-9 ()\-.]{5,}$").unwrap());
static URL_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^https?://\S+$").unwrap());

/// Dispatcher configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Platform used when nothing else matches.
    pub default_platform: Option<String>,
    /// Platform per target type, used for auto-resolution.
    pub routes: HashMap<TargetType, String>,
    /// Maximum platform groups sent concurrently for one message.
    pub max_concurrent_groups: usize,
    /// Upper bound for a single adapter `send` call, in milliseconds.
    pub send_timeout_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        let routes = HashMap::from([
            (TargetType::Email, "email".to_string()),
            (TargetType::Phone, "sms".to_string()),
            (TargetType::ChannelWebhook, "webhook".to_string()),
        ]);
        Self {
            default_platform: None,
            routes,
            max_concurrent_groups: 8,
            send_timeout_ms: 30_000,
        }
    }
}

impl DispatcherConfig {
    pub fn with_default_platform(mut self, platform: impl Into<String>) -> Self {
        self.default_platform = Some(platform.into());
        self
    }

    pub fn with_route(mut self, target_type: TargetType, platform: impl Into<String>) -> Self {
        self.routes.insert(target_type, platform.into());
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_groups == 0 {
            return Err(Error::config(
                "dispatcher.max_concurrent_groups must be at least 1",
            ));
        }
        if self.send_timeout_ms == 0 {
            return Err(Error::config("dispatcher.send_timeout_ms must be positive"));
        }
        if matches!(&self.default_platform, Some(p) if p.trim().is_empty()) {
            return Err(Error::config("dispatcher.default_platform must not be empty"));
        }
        Ok(())
    }
}

/// Guess the target type from the shape of a value.
pub fn detect_target_type(value: &str) -> Option<TargetType> {
    let value = value.trim();
    if URL_REGEX.is_match(value) {
        Some(TargetType::ChannelWebhook)
    } else if EMAIL_REGEX.is_match(value) {
        Some(TargetType::Email)
    } else if PHONE_REGEX.is_match(value) {
        Some(TargetType::Phone)
    } else {
        None
    }
}

/// Maps targets to platform names.
#[derive(Debug, Clone)]
pub struct TargetResolver {
    routes: HashMap<TargetType, String>,
    default_platform: Option<String>,
}

impl TargetResolver {
    pub fn new(config: &DispatcherConfig) -> Self {
        Self {
            routes: config.routes.clone(),
            default_platform: config.default_platform.clone(),
        }
    }

    /// Resolve the platform for `target`.
    ///
    /// An explicit platform always wins. Otherwise the route for the type
    /// detected from the value is tried, then the route for the declared type,
    /// preferring whichever is registered, then the default platform. A
    /// candidate that is not registered is still returned when there is no
    /// default, so the target fails as unavailable rather than unroutable.
    pub fn resolve(&self, target: &Target, registry: &PlatformRegistry) -> Option<String> {
        if let Some(platform) = &target.platform {
            return Some(platform.clone());
        }

        let mut candidates: Vec<&String> = Vec::with_capacity(2);
        if let Some(detected) = detect_target_type(&target.value)
            && let Some(route) = self.routes.get(&detected)
        {
            candidates.push(route);
        }
        if let Some(route) = self.routes.get(&target.target_type)
            && !candidates.contains(&route)
        {
            candidates.push(route);
        }

        if let Some(registered) = candidates.iter().find(|name| registry.contains(name)) {
            return Some((*registered).clone());
        }
        if let Some(default) = &self.default_platform {
            return Some(default.clone());
        }
        candidates.first().map(|name| (*name).clone())
    }
}

/// Routes a message to its platforms and collects one result per target.
pub struct Dispatcher {
    registry: Arc<PlatformRegistry>,
    resolver: TargetResolver,
    aggregator: ReceiptAggregator,
    max_concurrent_groups: usize,
    send_timeout: Duration,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("resolver", &self.resolver)
            .field("max_concurrent_groups", &self.max_concurrent_groups)
            .field("send_timeout", &self.send_timeout)
            .finish()
    }
}

impl Dispatcher {
    pub fn new(
        registry: Arc<PlatformRegistry>,
        config: &DispatcherConfig,
        aggregator: ReceiptAggregator,
    ) -> Self {
        Self {
            registry,
            resolver: TargetResolver::new(config),
            aggregator,
            max_concurrent_groups: config.max_concurrent_groups.max(1),
            send_timeout: Duration::from_millis(config.send_timeout_ms.max(1)),
        }
    }

    pub fn registry(&self) -> &Arc<PlatformRegistry> {
        &self.registry
    }

    pub fn aggregator(&self) -> &ReceiptAggregator {
        &self.aggregator
    }

    /// Resolve the platform for one target.
    pub fn resolve(&self, target: &Target) -> Option<String> {
        self.resolver.resolve(target, &self.registry)
    }

    /// Deliver `message` once and aggregate the outcome.
    ///
    /// Fails only when the message itself is invalid; every delivery problem
    /// is reported inside the receipt.
    pub async fn dispatch(&self, message: &Message) -> Result<Receipt> {
        self.dispatch_with_cancel(message, &CancellationToken::new())
            .await
    }

    /// Like [`dispatch`](Self::dispatch), checking `cancel` before each
    /// platform group is sent.
    pub async fn dispatch_with_cancel(
        &self,
        message: &Message,
        cancel: &CancellationToken,
    ) -> Result<Receipt> {
        let results = self.deliver(message, cancel, 1).await?;
        Ok(self.aggregator.aggregate(message.id(), results))
    }

    /// One delivery attempt, results in target order.
    pub(crate) async fn deliver(
        &self,
        message: &Message,
        cancel: &CancellationToken,
        attempt: u32,
    ) -> Result<Vec<PlatformResult>> {
        message.validate()?;

        let mut seen: HashSet<TargetKey> = HashSet::new();
        let mut groups: BTreeMap<String, Vec<(usize, Target)>> = BTreeMap::new();
        let mut results: Vec<(usize, PlatformResult)> = Vec::new();

        for (idx, target) in message.targets().iter().enumerate() {
            if !seen.insert(target.key()) {
                debug!(message_id = %message.id(), target = %target, "Skipping duplicate target");
                continue;
            }
            match self.resolve(target) {
                Some(platform) => groups.entry(platform).or_default().push((idx, target.clone())),
                None => {
                    warn!(message_id = %message.id(), target = %target, "No platform for target");
                    results.push((
                        idx,
                        PlatformResult::failure(
                            target.clone(),
                            UNRESOLVED_PLATFORM,
                            PlatformError::validation(format!(
                                "no platform can handle {} target {}",
                                target.target_type, target.value
                            )),
                        ),
                    ));
                }
            }
        }

        debug!(
            message_id = %message.id(),
            groups = groups.len(),
            attempt,
            "Dispatching message"
        );

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_groups));
        let sends = groups.into_iter().map(|(platform, entries)| {
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore.acquire_owned().await.ok();
                self.send_group(&platform, message, entries, cancel).await
            }
        });
        for group in futures::future::join_all(sends).await {
            results.extend(group);
        }

        results.sort_by_key(|(idx, _)| *idx);
        Ok(results
            .into_iter()
            .map(|(_, result)| result.with_attempt(attempt))
            .collect())
    }

    async fn send_group(
        &self,
        platform_name: &str,
        message: &Message,
        entries: Vec<(usize, Target)>,
        cancel: &CancellationToken,
    ) -> Vec<(usize, PlatformResult)> {
        if cancel.is_cancelled() {
            return fail_all(
                entries,
                platform_name,
                PlatformError::cancelled("delivery cancelled before send"),
            );
        }

        let platform = match self.registry.get(platform_name) {
            Ok(platform) => platform,
            Err(_) => {
                warn!(platform = %platform_name, "Platform not registered");
                return fail_all(
                    entries,
                    platform_name,
                    PlatformError::unavailable(format!(
                        "platform {} is not registered",
                        platform_name
                    )),
                );
            }
        };

        let capabilities = platform.capabilities();
        if let Err(e) = capabilities.check_message(message) {
            return fail_all(entries, platform_name, e);
        }

        let mut results = Vec::new();
        let mut valid = Vec::new();
        for (idx, target) in entries {
            let check = if capabilities.supports_target_type(target.target_type) {
                platform.validate_target(&target)
            } else {
                Err(PlatformError::validation(format!(
                    "platform {} does not support {} targets",
                    platform_name, target.target_type
                )))
            };
            match check {
                Ok(()) => valid.push((idx, target)),
                Err(e) => {
                    debug!(
                        platform = %platform_name,
                        target = %target,
                        error = %e,
                        "Target rejected"
                    );
                    results.push((idx, PlatformResult::failure(target, platform_name, e)));
                }
            }
        }
        if valid.is_empty() {
            return results;
        }

        let chunks: Vec<Vec<(usize, Target)>> = if capabilities.supports_batch {
            vec![valid]
        } else {
            valid.into_iter().map(|entry| vec![entry]).collect()
        };
        let calls = chunks
            .into_iter()
            .map(|chunk| self.call_platform(platform.as_ref(), platform_name, message, chunk));
        for chunk in futures::future::join_all(calls).await {
            results.extend(chunk);
        }
        results
    }

    /// Invoke the adapter once, isolating panics and hangs.
    async fn call_platform(
        &self,
        platform: &dyn Platform,
        platform_name: &str,
        message: &Message,
        chunk: Vec<(usize, Target)>,
    ) -> Vec<(usize, PlatformResult)> {
        let targets: Vec<Target> = chunk.iter().map(|(_, t)| t.clone()).collect();
        let started = Instant::now();

        let send = AssertUnwindSafe(platform.send(message, &targets)).catch_unwind();
        let outcome = tokio::time::timeout(self.send_timeout, send).await;
        let elapsed = started.elapsed();

        let returned = match outcome {
            Ok(Ok(Ok(results))) => results,
            Ok(Ok(Err(e))) => {
                warn!(platform = %platform_name, error = %e, "Platform send failed");
                return fail_all(chunk, platform_name, e)
                    .into_iter()
                    .map(|(idx, r)| (idx, r.with_duration(elapsed)))
                    .collect();
            }
            Ok(Err(panic)) => {
                let reason = panic_message(panic.as_ref());
                warn!(platform = %platform_name, panic = %reason, "Platform panicked during send");
                return fail_all(
                    chunk,
                    platform_name,
                    PlatformError::internal(format!("platform panicked: {}", reason)),
                );
            }
            Err(_) => {
                warn!(
                    platform = %platform_name,
                    timeout = ?self.send_timeout,
                    "Platform send timed out"
                );
                return fail_all(
                    chunk,
                    platform_name,
                    PlatformError::timeout(format!(
                        "send did not finish within {:?}",
                        self.send_timeout
                    )),
                );
            }
        };

        let mut by_key: HashMap<TargetKey, PlatformResult> = HashMap::new();
        for result in returned {
            by_key.entry(result.target.key()).or_insert(result);
        }

        chunk
            .into_iter()
            .map(|(idx, target)| {
                let mut result = match by_key.remove(&target.key()) {
                    Some(result) => result,
                    None => PlatformResult::failure(
                        target.clone(),
                        platform_name,
                        PlatformError::internal("platform reported no result for target"),
                    ),
                };
                result.target = target;
                result.platform = platform_name.to_string();
                if result.duration_ms == 0 {
                    result = result.with_duration(elapsed);
                }
                (idx, result)
            })
            .collect()
    }
}

fn fail_all(
    entries: Vec<(usize, Target)>,
    platform: &str,
    error: PlatformError,
) -> Vec<(usize, PlatformResult)> {
    entries
        .into_iter()
        .map(|(idx, target)| (idx, PlatformResult::failure(target, platform, error.clone())))
        .collect()
}
