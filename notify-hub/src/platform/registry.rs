//! Per-hub platform registry.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::Platform;
use crate::{Error, Result};

/// Health of one registered platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformHealth {
    /// Whether the platform reported itself usable.
    pub healthy: bool,
    /// Failure detail when unhealthy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the check ran.
    pub checked_at: DateTime<Utc>,
}

/// Thread-safe table of platform name → adapter.
///
/// Every hub owns its own registry; two registries never see each other's
/// entries.
#[derive(Default)]
pub struct PlatformRegistry {
    platforms: RwLock<HashMap<String, Arc<dyn Platform>>>,
}

impl std::fmt::Debug for PlatformRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformRegistry")
            .field("platforms", &self.list())
            .finish()
    }
}

impl PlatformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the platform built by `factory` under `name`.
    ///
    /// The factory is only invoked when the name is free, and runs without
    /// the registry lock held so it may read the registry itself.
    pub fn register<F>(&self, name: impl Into<String>, factory: F) -> Result<()>
    where
        F: FnOnce() -> Result<Arc<dyn Platform>>,
    {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::validation("platform name must not be empty"));
        }

        if self.contains(&name) {
            return Err(Error::DuplicateName(name));
        }
        let platform = factory()?;

        // Another caller may have taken the name while the factory ran.
        let mut platforms = self.platforms.write();
        if platforms.contains_key(&name) {
            return Err(Error::DuplicateName(name));
        }
        platforms.insert(name.clone(), platform);
        drop(platforms);

        info!(platform = %name, "Registered platform");
        Ok(())
    }

    /// Register an already-built platform under its own name.
    pub fn register_instance(&self, platform: Arc<dyn Platform>) -> Result<()> {
        let name = platform.name().to_string();
        self.register(name, move || Ok(platform))
    }

    /// Remove a platform without closing it.
    pub fn unregister(&self, name: &str) -> Result<Arc<dyn Platform>> {
        let removed = self.platforms.write().remove(name);
        match removed {
            Some(platform) => {
                info!(platform = %name, "Unregistered platform");
                Ok(platform)
            }
            None => Err(Error::not_found("Platform", name)),
        }
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Platform>> {
        self.platforms
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found("Platform", name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.platforms.read().contains_key(name)
    }

    /// Snapshot of registered names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.platforms.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.platforms.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.platforms.read().is_empty()
    }

    /// Ask every platform for its health, concurrently.
    pub async fn health(&self) -> HashMap<String, PlatformHealth> {
        let snapshot: Vec<(String, Arc<dyn Platform>)> = self
            .platforms
            .read()
            .iter()
            .map(|(name, platform)| (name.clone(), platform.clone()))
            .collect();

        let checks = snapshot.into_iter().map(|(name, platform)| async move {
            let health = match platform.is_healthy().await {
                Ok(()) => PlatformHealth {
                    healthy: true,
                    error: None,
                    checked_at: Utc::now(),
                },
                Err(e) => {
                    debug!(platform = %name, error = %e, "Platform reported unhealthy");
                    PlatformHealth {
                        healthy: false,
                        error: Some(e.to_string()),
                        checked_at: Utc::now(),
                    }
                }
            };
            (name, health)
        });

        futures::future::join_all(checks).await.into_iter().collect()
    }

    /// Close and remove every platform.
    ///
    /// All platforms are closed even when some fail; the last failure is
    /// returned.
    pub async fn close(&self) -> Result<()> {
        let drained: Vec<(String, Arc<dyn Platform>)> =
            self.platforms.write().drain().collect();

        let mut last_error = None;
        for (name, platform) in drained {
            match platform.close().await {
                Ok(()) => debug!(platform = %name, "Closed platform"),
                Err(e) => {
                    warn!(platform = %name, error = %e, "Failed to close platform");
                    last_error = Some(Error::Platform(e));
                }
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
