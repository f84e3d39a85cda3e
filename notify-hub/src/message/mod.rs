//! Message and target model.
//!
//! A [`Message`] is what a caller wants delivered; its [`Target`]s say where.
//! Both are plain values: once a message is handed to the hub it is only ever
//! read, and its id never changes.

mod target;

pub use target::{Target, TargetKey, TargetType};

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{Error, Result};

/// Body format of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageFormat {
    #[default]
    Text,
    Markdown,
    Html,
}

impl std::fmt::Display for MessageFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Markdown => write!(f, "markdown"),
            Self::Html => write!(f, "html"),
        }
    }
}

/// Priority level for messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Low priority - informational only.
    Low,
    /// Normal priority - standard notifications.
    #[default]
    Normal,
    /// High priority - important events.
    High,
    /// Critical priority - requires immediate attention.
    Critical,
}

impl Priority {
    /// All priorities, lowest first.
    pub const ALL: [Priority; 4] = [Self::Low, Self::Normal, Self::High, Self::Critical];

    pub(crate) fn band(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Normal => write!(f, "normal"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// A logical message addressed to one or more targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    id: String,
    title: String,
    body: String,
    #[serde(default)]
    format: MessageFormat,
    #[serde(default)]
    priority: Priority,
    targets: Vec<Target>,
    #[serde(default)]
    metadata: HashMap<String, Value>,
    #[serde(default)]
    variables: HashMap<String, Value>,
    created_at: DateTime<Utc>,
    #[serde(default)]
    scheduled_at: Option<DateTime<Utc>>,
}

impl Message {
    /// Create a new message with a fresh id.
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title: title.into(),
            body: body.into(),
            format: MessageFormat::Text,
            priority: Priority::Normal,
            targets: Vec::new(),
            metadata: HashMap::new(),
            variables: HashMap::new(),
            created_at: Utc::now(),
            scheduled_at: None,
        }
    }

    pub fn with_format(mut self, format: MessageFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_target(mut self, target: Target) -> Self {
        self.targets.push(target);
        self
    }

    pub fn with_targets(mut self, targets: impl IntoIterator<Item = Target>) -> Self {
        self.targets.extend(targets);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    pub fn with_scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// Schedule delivery `delay` from now.
    pub fn with_delay(self, delay: Duration) -> Self {
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        let at = Utc::now()
            .checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.with_scheduled_at(at)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn format(&self) -> MessageFormat {
        self.format
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    pub fn metadata(&self) -> &HashMap<String, Value> {
        &self.metadata
    }

    pub fn variables(&self) -> &HashMap<String, Value> {
        &self.variables
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn scheduled_at(&self) -> Option<DateTime<Utc>> {
        self.scheduled_at
    }

    /// Time left until the scheduled send time, if it lies in the future.
    pub fn remaining_delay(&self) -> Option<Duration> {
        let at = self.scheduled_at?;
        (at - Utc::now()).to_std().ok().filter(|d| !d.is_zero())
    }

    /// Size of the rendered content in bytes.
    pub fn content_len(&self) -> usize {
        self.title.len() + self.body.len()
    }

    /// A copy of this message (same id) addressed to a subset of targets.
    pub(crate) fn retarget(&self, targets: Vec<Target>) -> Self {
        Self {
            targets,
            ..self.clone()
        }
    }

    /// Check the message can be dispatched at all.
    pub fn validate(&self) -> Result<()> {
        if self.targets.is_empty() {
            return Err(Error::validation(format!(
                "message {} has no targets",
                self.id
            )));
        }
        if self.title.trim().is_empty() && self.body.trim().is_empty() {
            return Err(Error::validation(format!(
                "message {} has neither title nor body",
                self.id
            )));
        }
        for (idx, target) in self.targets.iter().enumerate() {
            if target.value.trim().is_empty() {
                return Err(Error::validation(format!(
                    "target #{} of message {} has an empty value",
                    idx, self.id
                )));
            }
            if matches!(&target.platform, Some(p) if p.trim().is_empty()) {
                return Err(Error::validation(format!(
                    "target #{} of message {} names an empty platform",
                    idx, self.id
                )));
            }
        }
        Ok(())
    }
}
