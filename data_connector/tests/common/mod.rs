//! Shared helpers for connector integration tests

#![allow(dead_code)]

use std::time::Duration;

use data_auth_connector::{
    ChannelRealtimeStoreConfig, ConnectorConfig, PollingRestStoreConfig, PushAuthStoreConfig,
    RecordData,
};
use serde_json::Value;

/// Base64 of `key`
pub const POLLING_KEY: &str = "a2V5";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("data_auth_connector=debug")
        .with_test_writer()
        .try_init();
}

pub fn data(value: Value) -> RecordData {
    match value {
        Value::Object(map) => map,
        other => panic!("expected an object, got {other}"),
    }
}

pub fn push_config(server_uri: &str) -> ConnectorConfig {
    let mut cfg = PushAuthStoreConfig::new("test-api-key", server_uri);
    cfg.auth_url = server_uri.to_string();
    cfg.reconnect_delay_ms = 20;
    ConnectorConfig::push_auth_store(cfg)
}

pub fn channel_config(server_uri: &str) -> ConnectorConfig {
    ConnectorConfig::channel_realtime_store(ChannelRealtimeStoreConfig::new(server_uri, "anon-key"))
}

pub fn polling_config(server_uri: &str, poll_interval_ms: u64) -> ConnectorConfig {
    let mut cfg = PollingRestStoreConfig::new(server_uri, POLLING_KEY, "main");
    cfg.poll_interval_ms = poll_interval_ms;
    ConnectorConfig::polling_rest_store(cfg)
}

/// Poll `check` until it returns true or `limit` elapses.
pub async fn eventually(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
