//! Platform id to adapter lookup

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::{Config, PlatformKind};
use crate::error::{PlatformError, PlatformResult, Result};
use crate::platforms::http::HttpPlatform;
use crate::platforms::mock::MockPlatform;
use crate::platforms::Platform;

/// Adapters keyed by platform id
///
/// Populated once at startup and read-only afterwards; the engine clones
/// the `Arc` handles it needs.
#[derive(Clone, Default)]
pub struct PlatformRegistry {
    platforms: BTreeMap<String, Arc<dyn Platform>>,
}

impl PlatformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build adapters for every enabled `[platforms.<id>]` section
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut registry = Self::new();

        for (name, platform) in &config.platforms {
            if !platform.enabled {
                tracing::debug!(platform = %name, "Skipping disabled platform");
                continue;
            }

            let adapter: Arc<dyn Platform> = match platform.kind {
                PlatformKind::Http => Arc::new(HttpPlatform::from_config(name, platform)?),
                PlatformKind::DryRun => Arc::new(MockPlatform::new(name.clone())),
            };

            tracing::info!(platform = %name, kind = ?platform.kind, "Registered platform");
            registry.register(name.clone(), adapter);
        }

        Ok(registry)
    }

    /// Add or replace the adapter for `id`
    pub fn register(&mut self, id: impl Into<String>, platform: Arc<dyn Platform>) {
        self.platforms.insert(id.into(), platform);
    }

    /// Look up an adapter; unknown ids are a validation failure
    pub fn get(&self, id: &str) -> PlatformResult<Arc<dyn Platform>> {
        self.platforms
            .get(id)
            .cloned()
            .ok_or_else(|| PlatformError::Unsupported(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.platforms.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.platforms.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.platforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.platforms.is_empty()
    }
}
