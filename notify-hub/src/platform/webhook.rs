//! Generic webhook platform.
//!
//! Posts a JSON rendering of the message to every `channel_webhook` target,
//! where the target value is the endpoint URL.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, StatusCode, header::HeaderMap};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use super::{Platform, PlatformCapabilities};
use crate::error::PlatformError;
use crate::message::{Message, Target, TargetType};
use crate::receipt::PlatformResult;

/// Webhook platform configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Registry name.
    #[serde(default = "default_name")]
    pub name: String,
    /// Whether the platform accepts sends.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// HTTP method (default: POST).
    #[serde(default = "default_method")]
    pub method: String,
    /// Custom headers.
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_name() -> String {
    "webhook".to_string()
}

fn default_enabled() -> bool {
    true
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_timeout() -> u64 {
    30
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            enabled: default_enabled(),
            method: default_method(),
            headers: Vec::new(),
            timeout_secs: default_timeout(),
        }
    }
}

/// Generic webhook platform.
pub struct WebhookPlatform {
    config: WebhookConfig,
    client: Client,
}

impl WebhookPlatform {
    pub fn new(config: WebhookConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();

        Self { config, client }
    }

    fn build_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.config.headers {
            if let (Ok(name), Ok(value)) = (
                name.parse::<reqwest::header::HeaderName>(),
                value.parse::<reqwest::header::HeaderValue>(),
            ) {
                headers.insert(name, value);
            } else {
                warn!(header = %name, "Ignoring invalid webhook header");
            }
        }
        headers
    }

    fn build_payload(&self, message: &Message, target: &Target) -> serde_json::Value {
        json!({
            "message_id": message.id(),
            "title": message.title(),
            "body": message.body(),
            "format": message.format(),
            "priority": message.priority(),
            "metadata": message.metadata(),
            "variables": message.variables(),
            "created_at": message.created_at().to_rfc3339(),
            "target": {
                "type": target.target_type,
                "value": target.value,
                "metadata": target.metadata,
            },
        })
    }

    async fn post(&self, message: &Message, target: &Target) -> PlatformResult {
        let started = Instant::now();
        let payload = self.build_payload(message, target);

        let request = match self.config.method.to_uppercase().as_str() {
            "PUT" => self.client.put(&target.value),
            _ => self.client.post(&target.value),
        };

        let result = match request
            .headers(self.build_headers())
            .json(&payload)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                let id = response
                    .headers()
                    .get("x-message-id")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                debug!(url = %target.value, status = %response.status(), "Webhook delivered");
                let result = PlatformResult::success(target.clone(), &self.config.name);
                match id {
                    Some(id) => result.with_message_id(id),
                    None => result,
                }
            }
            Ok(response) => {
                let status = response.status();
                let retry_after = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_retry_after);
                let body = response.text().await.unwrap_or_default();
                warn!(url = %target.value, %status, "Webhook failed");
                PlatformResult::failure(
                    target.clone(),
                    &self.config.name,
                    classify_status(status, retry_after, &body),
                )
            }
            Err(e) => PlatformResult::failure(
                target.clone(),
                &self.config.name,
                classify_request_error(&e),
            ),
        };

        result.with_duration(started.elapsed())
    }
}

/// Map a non-success HTTP status onto the error taxonomy.
///
/// 503 means the endpoint says it is down, so it is reported as unavailable
/// rather than as a generic network failure. Both are retryable.
fn classify_status(
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> PlatformError {
    let detail = if body.is_empty() {
        format!("webhook returned {}", status)
    } else {
        format!("webhook returned {} - {}", status, body)
    };

    match status {
        StatusCode::TOO_MANY_REQUESTS => PlatformError::rate_limited(detail, retry_after),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => PlatformError::auth(detail),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => PlatformError::timeout(detail),
        StatusCode::SERVICE_UNAVAILABLE => PlatformError::unavailable(detail),
        s if s.is_client_error() => PlatformError::validation(detail),
        _ => PlatformError::network(detail),
    }
}

fn classify_request_error(e: &reqwest::Error) -> PlatformError {
    if e.is_timeout() {
        PlatformError::timeout(format!("webhook request timed out: {}", e))
    } else if e.is_connect() {
        PlatformError::unavailable(format!("webhook endpoint unreachable: {}", e))
    } else if e.is_builder() {
        PlatformError::validation(format!("invalid webhook request: {}", e))
    } else {
        PlatformError::network(format!("webhook request failed: {}", e))
    }
}

/// Parse a `Retry-After` header given in seconds.
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

#[async_trait]
impl Platform for WebhookPlatform {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn send(
        &self,
        message: &Message,
        targets: &[Target],
    ) -> Result<Vec<PlatformResult>, PlatformError> {
        if !self.config.enabled {
            return Err(PlatformError::unavailable(format!(
                "platform {} is disabled",
                self.config.name
            )));
        }

        let sends = targets.iter().map(|target| self.post(message, target));
        Ok(futures::future::join_all(sends).await)
    }

    fn validate_target(&self, target: &Target) -> Result<(), PlatformError> {
        if target.target_type != TargetType::ChannelWebhook {
            return Err(PlatformError::validation(format!(
                "webhook platform cannot address {} targets",
                target.target_type
            )));
        }
        let url = url::Url::parse(&target.value).map_err(|e| {
            PlatformError::validation(format!("invalid webhook url {}: {}", target.value, e))
        })?;
        match url.scheme() {
            "http" | "https" => Ok(()),
            other => Err(PlatformError::validation(format!(
                "unsupported webhook scheme: {}",
                other
            ))),
        }
    }

    fn capabilities(&self) -> PlatformCapabilities {
        PlatformCapabilities {
            target_types: vec![TargetType::ChannelWebhook],
            ..Default::default()
        }
    }

    async fn is_healthy(&self) -> Result<(), PlatformError> {
        if self.config.enabled {
            Ok(())
        } else {
            Err(PlatformError::unavailable(format!(
                "platform {} is disabled",
                self.config.name
            )))
        }
    }

    async fn close(&self) -> Result<(), PlatformError> {
        Ok(())
    }
}
