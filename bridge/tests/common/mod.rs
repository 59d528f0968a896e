//! Shared helpers for the bridge integration tests

#![allow(dead_code)]

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use weft_bridge::BridgeConfig;
use weft_core::TypeRegistry;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note(pub String);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ask(pub u32);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Answer(pub u32);

pub fn registry() -> Arc<TypeRegistry> {
    Arc::new(
        TypeRegistry::builder()
            .register::<Note>("test.note")
            .register::<Ask>("test.ask")
            .register::<Answer>("test.answer")
            .build()
            .expect("valid registry"),
    )
}

/// Short intervals so reconnect and retry paths finish quickly.
pub fn fast_config() -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.reconnect_interval_ms = 100;
    config.connect_timeout_ms = 1_000;
    config.retry.base_delay_ms = 50;
    config.retry.max_delay_ms = 500;
    config
}

/// Polls `check` until it holds or `limit` passes.
pub async fn eventually<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
