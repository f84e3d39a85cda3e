//! Platform adapters.
//!
//! A platform knows how to deliver a [`Message`] to one kind of destination.
//! Adapters are registered by name in a per-hub [`PlatformRegistry`] and picked
//! by the dispatcher at send time.
//!
//! # Example
//!
//! ```ignore
//! use notify_hub::platform::{PlatformRegistry, WebhookConfig, WebhookPlatform};
//!
//! let registry = PlatformRegistry::new();
//! registry.register_instance(Arc::new(WebhookPlatform::new(WebhookConfig::default())))?;
//! ```

mod registry;
mod webhook;

pub use registry::{PlatformHealth, PlatformRegistry};
pub use webhook::{WebhookConfig, WebhookPlatform};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::PlatformError;
use crate::message::{Message, MessageFormat, Target, TargetType};
use crate::receipt::PlatformResult;

/// Contract every destination adapter satisfies.
#[async_trait]
pub trait Platform: Send + Sync {
    /// Registry name of this platform.
    fn name(&self) -> &str;

    /// Deliver `message` to `targets`.
    ///
    /// Should return one result per target. A top-level error means the whole
    /// call failed and applies to every target.
    async fn send(
        &self,
        message: &Message,
        targets: &[Target],
    ) -> std::result::Result<Vec<PlatformResult>, PlatformError>;

    /// Check that this platform can address `target`.
    fn validate_target(&self, target: &Target) -> std::result::Result<(), PlatformError>;

    /// What this platform supports.
    fn capabilities(&self) -> PlatformCapabilities;

    /// Report whether the platform is currently usable.
    async fn is_healthy(&self) -> std::result::Result<(), PlatformError>;

    /// Release any held resources.
    async fn close(&self) -> std::result::Result<(), PlatformError>;
}

/// Static description of what a platform can deliver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformCapabilities {
    /// Target types the platform accepts. Empty means any.
    pub target_types: Vec<TargetType>,
    /// Body formats the platform renders. Empty means any.
    pub formats: Vec<MessageFormat>,
    /// Maximum title + body size in bytes.
    pub max_message_size: Option<usize>,
    /// Whether one call can carry several targets.
    pub supports_batch: bool,
}

impl Default for PlatformCapabilities {
    fn default() -> Self {
        Self {
            target_types: Vec::new(),
            formats: Vec::new(),
            max_message_size: None,
            supports_batch: true,
        }
    }
}

impl PlatformCapabilities {
    pub fn supports_target_type(&self, target_type: TargetType) -> bool {
        self.target_types.is_empty() || self.target_types.contains(&target_type)
    }

    pub fn supports_format(&self, format: MessageFormat) -> bool {
        self.formats.is_empty() || self.formats.contains(&format)
    }

    /// Check a message against these capabilities.
    pub fn check_message(&self, message: &Message) -> std::result::Result<(), PlatformError> {
        if !self.supports_format(message.format()) {
            return Err(PlatformError::validation(format!(
                "format {} is not supported",
                message.format()
            )));
        }
        if let Some(max) = self.max_message_size
            && message.content_len() > max
        {
            return Err(PlatformError::validation(format!(
                "message size {} exceeds limit {}",
                message.content_len(),
                max
            )));
        }
        Ok(())
    }
}
