// Bridge configuration: defaults, environment overrides, optional TOML file
use crate::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};
use weft_core::RetryPolicy;

const DEFAULT_CONFIG_FILE: &str = "weft_bridge.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Client reconnect period while disconnected.
    pub reconnect_interval_ms: u64,
    pub connect_timeout_ms: u64,
    /// Startup fails if the listener is not bound within this window.
    pub bind_timeout_ms: u64,
    /// Workers retrying failed sends.
    pub delivery_workers: usize,
    pub max_frame_length: usize,
    pub retry: RetryPolicy,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            reconnect_interval_ms: 5_000,
            connect_timeout_ms: 5_000,
            bind_timeout_ms: 5_000,
            delivery_workers: 4,
            max_frame_length: 16 * 1024 * 1024,
            retry: RetryPolicy::default(),
        }
    }
}

impl BridgeConfig {
    /// Defaults overridden by `WEFT_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// File from `WEFT_BRIDGE_CONFIG` (or `weft_bridge.toml` if present),
    /// then environment overrides. Problems with the file are logged and
    /// the defaults kept.
    pub fn load() -> Self {
        let path = std::env::var("WEFT_BRIDGE_CONFIG")
            .unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());

        let mut config = if Path::new(&path).exists() {
            match Self::from_file(&path) {
                Ok(config) => {
                    info!(target: "bridge", path = %path, "loaded bridge config");
                    config
                }
                Err(e) => {
                    warn!(target: "bridge", path = %path, "ignoring bridge config: {}", e);
                    Self::default()
                }
            }
        } else {
            Self::default()
        };
        config.apply_env();
        config
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| BridgeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.delivery_workers == 0 {
            return Err(BridgeError::Config(
                "delivery_workers must be at least 1".into(),
            ));
        }
        if self.max_frame_length == 0 {
            return Err(BridgeError::Config("max_frame_length must be positive".into()));
        }
        if self.reconnect_interval_ms == 0 {
            return Err(BridgeError::Config("reconnect_interval_ms must be positive".into()));
        }
        if self.connect_timeout_ms == 0 {
            return Err(BridgeError::Config("connect_timeout_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn bind_timeout(&self) -> Duration {
        Duration::from_millis(self.bind_timeout_ms)
    }

    fn apply_env(&mut self) {
        override_from_env("WEFT_RECONNECT_INTERVAL_MS", &mut self.reconnect_interval_ms);
        override_from_env("WEFT_CONNECT_TIMEOUT_MS", &mut self.connect_timeout_ms);
        override_from_env("WEFT_BIND_TIMEOUT_MS", &mut self.bind_timeout_ms);
        override_from_env("WEFT_DELIVERY_WORKERS", &mut self.delivery_workers);
        override_from_env("WEFT_MAX_FRAME_LENGTH", &mut self.max_frame_length);
        override_from_env("WEFT_RETRY_MAX_ATTEMPTS", &mut self.retry.max_attempts);
        override_from_env("WEFT_RETRY_BASE_DELAY_MS", &mut self.retry.base_delay_ms);
    }
}

fn override_from_env<T: std::str::FromStr>(key: &str, slot: &mut T) {
    if let Ok(raw) = std::env::var(key) {
        match raw.parse() {
            Ok(value) => *slot = value,
            Err(_) => warn!(target: "bridge", key, value = %raw, "ignoring unparsable setting"),
        }
    }
}
