//! Message targets.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of recipient a target addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    Email,
    Phone,
    User,
    Group,
    ChannelWebhook,
}

impl std::fmt::Display for TargetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Email => write!(f, "email"),
            Self::Phone => write!(f, "phone"),
            Self::User => write!(f, "user"),
            Self::Group => write!(f, "group"),
            Self::ChannelWebhook => write!(f, "channel_webhook"),
        }
    }
}

/// One addressed recipient within a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    /// Recipient kind.
    #[serde(rename = "type")]
    pub target_type: TargetType,
    /// Address, number, id or URL, depending on the type.
    pub value: String,
    /// Explicit platform name. `None` lets the dispatcher resolve one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    /// Per-target metadata, passed through untouched.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

/// Deduplication identity of a target: `(type, value, platform)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetKey {
    pub target_type: TargetType,
    pub value: String,
    pub platform: Option<String>,
}

impl Target {
    pub fn new(target_type: TargetType, value: impl Into<String>) -> Self {
        Self {
            target_type,
            value: value.into(),
            platform: None,
            metadata: HashMap::new(),
        }
    }

    pub fn email(address: impl Into<String>) -> Self {
        Self::new(TargetType::Email, address)
    }

    pub fn phone(number: impl Into<String>) -> Self {
        Self::new(TargetType::Phone, number)
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self::new(TargetType::User, id)
    }

    pub fn group(id: impl Into<String>) -> Self {
        Self::new(TargetType::Group, id)
    }

    pub fn webhook(url: impl Into<String>) -> Self {
        Self::new(TargetType::ChannelWebhook, url)
    }

    /// Pin this target to a named platform.
    pub fn via(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn key(&self) -> TargetKey {
        TargetKey {
            target_type: self.target_type,
            value: self.value.clone(),
            platform: self.platform.clone(),
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.platform {
            Some(platform) => write!(f, "{}:{}@{}", self.target_type, self.value, platform),
            None => write!(f, "{}:{}", self.target_type, self.value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_ignores_metadata() {
        let a = Target::email("a@example.com").with_metadata("lang", "en");
        let b = Target::email("a@example.com");
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn test_key_includes_platform() {
        let a = Target::email("a@example.com").via("smtp");
        let b = Target::email("a@example.com").via("ses");
        assert_ne!(a.key(), b.key());
    }

    #[test]
    fn test_display() {
        assert_eq!(Target::phone("+1555").to_string(), "phone:+1555");
        assert_eq!(
            Target::group("ops").via("slack").to_string(),
            "group:ops@slack"
        );
    }

    #[test]
    fn test_target_serde_uses_type_field() {
        let json = serde_json::to_value(Target::webhook("https://hooks.example.com/x")).unwrap();
        assert_eq!(json["type"], "channel_webhook");
        assert!(json.get("platform").is_none());
    }
}
