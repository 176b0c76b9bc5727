use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use serde::Deserialize;

use crate::storage::{BackendKind, RunStore, StoreConfig};

/// Store settings loaded from `runstore.yaml`.
/// All fields are optional; missing fields fall back to CLI/env/defaults.
#[derive(Debug, Clone, PartialEq, Deserialize, Default)]
#[serde(default)]
pub struct RunStoreSettings {
    /// `memory` or `redis`.
    pub backend: Option<String>,
    pub redis_url: Option<String>,
    pub prefix: Option<String>,
    /// Run expiry in seconds; 0 disables expiry.
    pub ttl_secs: Option<u64>,
    pub event_max_len: Option<usize>,
    pub subscriber_buffer: Option<usize>,
    pub pool_size: Option<usize>,
    pub op_timeout_ms: Option<u64>,
}

impl RunStoreSettings {
    /// Load settings from a YAML file.
    ///
    /// - If `path` is `Some`, load that specific file (error if missing).
    /// - If `path` is `None`, auto-detect `runstore.yaml` in cwd; return defaults if absent.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file_path = match path {
            Some(p) => {
                if !p.exists() {
                    anyhow::bail!("Config file not found: {}", p.display());
                }
                p
            }
            None => {
                let default_path = Path::new("runstore.yaml");
                if !default_path.exists() {
                    return Ok(Self::default());
                }
                default_path
            }
        };

        let contents = std::fs::read_to_string(file_path)
            .with_context(|| format!("Failed to read config file: {}", file_path.display()))?;

        serde_yml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", file_path.display()))
    }

    /// Layer `overrides` on top of these settings; set fields win.
    pub fn merge(self, overrides: RunStoreSettings) -> Self {
        Self {
            backend: overrides.backend.or(self.backend),
            redis_url: overrides.redis_url.or(self.redis_url),
            prefix: overrides.prefix.or(self.prefix),
            ttl_secs: overrides.ttl_secs.or(self.ttl_secs),
            event_max_len: overrides.event_max_len.or(self.event_max_len),
            subscriber_buffer: overrides.subscriber_buffer.or(self.subscriber_buffer),
            pool_size: overrides.pool_size.or(self.pool_size),
            op_timeout_ms: overrides.op_timeout_ms.or(self.op_timeout_ms),
        }
    }

    /// Configured backend, `memory` when none is set.
    pub fn backend(&self) -> Result<BackendKind> {
        match self.backend.as_deref() {
            Some(name) => name.parse().map_err(anyhow::Error::msg),
            None => Ok(BackendKind::Memory),
        }
    }

    pub fn store_config(&self) -> StoreConfig {
        let defaults = StoreConfig::default();
        StoreConfig {
            event_max_len: self.event_max_len.unwrap_or(defaults.event_max_len),
            ttl: match self.ttl_secs {
                Some(0) => None,
                Some(secs) => Some(Duration::from_secs(secs)),
                None => defaults.ttl,
            },
            subscriber_buffer: self.subscriber_buffer.unwrap_or(defaults.subscriber_buffer),
        }
        .normalized()
    }

    #[cfg(feature = "redis")]
    pub fn redis_config(&self) -> crate::storage::redis::RedisStoreConfig {
        let defaults = crate::storage::redis::RedisStoreConfig::default();
        crate::storage::redis::RedisStoreConfig {
            url: self.redis_url.clone().unwrap_or(defaults.url),
            prefix: self.prefix.clone().unwrap_or(defaults.prefix),
            pool_size: self.pool_size.unwrap_or(defaults.pool_size),
            op_timeout: self
                .op_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.op_timeout),
            store: self.store_config(),
            ..defaults
        }
    }

    /// Open the configured backend.
    pub async fn open(&self) -> Result<Arc<dyn RunStore>> {
        let kind = self.backend()?;
        #[cfg(feature = "redis")]
        let store = crate::storage::open_store(kind, self.store_config(), self.redis_config()).await;
        #[cfg(not(feature = "redis"))]
        let store = crate::storage::open_store(kind, self.store_config()).await;
        store.with_context(|| format!("Failed to open {} run store", kind))
    }
}
