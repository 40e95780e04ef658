//! Connector configuration types.

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    core::Provider,
    error::{ConnectorResult, NormalizedError},
};

/// Raw connector configuration: a `provider` tag plus one sub-config per provider.
///
/// The tag and the matching sub-config are checked by [`ConnectorConfig::validate`]
/// before any adapter is constructed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_auth_store_config: Option<PushAuthStoreConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_realtime_store_config: Option<ChannelRealtimeStoreConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub polling_rest_store_config: Option<PollingRestStoreConfig>,
}

/// Validated configuration: exactly one provider with its sub-config
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderConfig {
    PushAuthStore(PushAuthStoreConfig),
    ChannelRealtimeStore(ChannelRealtimeStoreConfig),
    PollingRestStore(PollingRestStoreConfig),
}

impl ProviderConfig {
    pub fn provider(&self) -> Provider {
        match self {
            ProviderConfig::PushAuthStore(_) => Provider::PushAuthStore,
            ProviderConfig::ChannelRealtimeStore(_) => Provider::ChannelRealtimeStore,
            ProviderConfig::PollingRestStore(_) => Provider::PollingRestStore,
        }
    }
}

impl ConnectorConfig {
    pub fn push_auth_store(config: PushAuthStoreConfig) -> Self {
        Self {
            provider: Some(Provider::PushAuthStore.as_str().to_string()),
            push_auth_store_config: Some(config),
            ..Self::default()
        }
    }

    pub fn channel_realtime_store(config: ChannelRealtimeStoreConfig) -> Self {
        Self {
            provider: Some(Provider::ChannelRealtimeStore.as_str().to_string()),
            channel_realtime_store_config: Some(config),
            ..Self::default()
        }
    }

    pub fn polling_rest_store(config: PollingRestStoreConfig) -> Self {
        Self {
            provider: Some(Provider::PollingRestStore.as_str().to_string()),
            polling_rest_store_config: Some(config),
            ..Self::default()
        }
    }

    pub fn from_json_str(raw: &str) -> ConnectorResult<Self> {
        serde_json::from_str(raw)
            .map_err(|e| NormalizedError::invalid_config(format!("invalid JSON config: {e}")))
    }

    pub fn from_yaml_str(raw: &str) -> ConnectorResult<Self> {
        serde_yaml::from_str(raw)
            .map_err(|e| NormalizedError::invalid_config(format!("invalid YAML config: {e}")))
    }

    /// Resolve the tag and its sub-config. Performs no I/O.
    pub fn validate(&self) -> ConnectorResult<ProviderConfig> {
        let tag = self
            .provider
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| NormalizedError::invalid_config("config.provider is required"))?;

        let provider: Provider = tag.parse()?;
        let missing = || {
            NormalizedError::invalid_config(format!("missing {tag}Config for provider '{tag}'"))
                .with_context("provider", tag)
        };
        let invalid = |reason: String| {
            NormalizedError::invalid_config(format!("invalid {tag}Config: {reason}"))
                .with_context("provider", tag)
        };

        match provider {
            Provider::PushAuthStore => {
                let cfg = self.push_auth_store_config.as_ref().ok_or_else(missing)?;
                cfg.validate().map_err(invalid)?;
                Ok(ProviderConfig::PushAuthStore(cfg.clone()))
            }
            Provider::ChannelRealtimeStore => {
                let cfg = self
                    .channel_realtime_store_config
                    .as_ref()
                    .ok_or_else(missing)?;
                cfg.validate().map_err(invalid)?;
                Ok(ProviderConfig::ChannelRealtimeStore(cfg.clone()))
            }
            Provider::PollingRestStore => {
                let cfg = self.polling_rest_store_config.as_ref().ok_or_else(missing)?;
                cfg.validate().map_err(invalid)?;
                Ok(ProviderConfig::PollingRestStore(cfg.clone()))
            }
        }
    }
}

// ============================================================================
// Push-auth store (document store + push auth state)
// ============================================================================

#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PushAuthStoreConfig {
    /// Web API key used for the auth endpoints
    pub api_key: String,
    /// Database root, e.g. `https://<project>.firebaseio.com`
    pub database_url: String,
    #[serde(default = "default_push_auth_url")]
    pub auth_url: String,
    /// Upper bound on the initial session resolution in `connect()`; 0 waits forever
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
    /// Delay before a dropped event stream is reopened
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

fn default_push_auth_url() -> String {
    "https://identitytoolkit.googleapis.com".to_string()
}

fn default_session_timeout_ms() -> u64 {
    30_000
}

fn default_reconnect_delay_ms() -> u64 {
    1_000
}

impl PushAuthStoreConfig {
    pub fn new(api_key: impl Into<String>, database_url: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            database_url: database_url.into(),
            auth_url: default_push_auth_url(),
            session_timeout_ms: default_session_timeout_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
        }
    }

    pub fn session_timeout(&self) -> Option<Duration> {
        (self.session_timeout_ms > 0).then(|| Duration::from_millis(self.session_timeout_ms))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.api_key.trim().is_empty() {
            return Err("apiKey should not be empty".to_string());
        }
        validate_http_url(&self.database_url, "databaseUrl")?;
        validate_http_url(&self.auth_url, "authUrl")?;
        Ok(())
    }
}

impl std::fmt::Debug for PushAuthStoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushAuthStoreConfig")
            .field("database_url", &self.database_url)
            .field("auth_url", &self.auth_url)
            .field("session_timeout_ms", &self.session_timeout_ms)
            .field("reconnect_delay_ms", &self.reconnect_delay_ms)
            .finish()
    }
}

// ============================================================================
// Channel-realtime store (relational + realtime channels)
// ============================================================================

#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRealtimeStoreConfig {
    /// Project URL, e.g. `https://<ref>.supabase.co`
    pub url: String,
    pub anon_key: String,
    #[serde(default = "default_schema")]
    pub schema: String,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Realtime socket base; derived from `url` (`ws`/`wss`) when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realtime_url: Option<String>,
}

fn default_schema() -> String {
    "public".to_string()
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

impl ChannelRealtimeStoreConfig {
    pub fn new(url: impl Into<String>, anon_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            anon_key: anon_key.into(),
            schema: default_schema(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            realtime_url: None,
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_http_url(&self.url, "url")?;
        if self.anon_key.trim().is_empty() {
            return Err("anonKey should not be empty".to_string());
        }
        if self.schema.trim().is_empty() {
            return Err("schema should not be empty".to_string());
        }
        if self.heartbeat_interval_ms == 0 {
            return Err("heartbeatIntervalMs must be greater than 0".to_string());
        }
        if let Some(realtime_url) = &self.realtime_url {
            validate_url(realtime_url, "realtimeUrl", &["ws", "wss", "http", "https"])?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ChannelRealtimeStoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRealtimeStoreConfig")
            .field("url", &self.url)
            .field("schema", &self.schema)
            .field("heartbeat_interval_ms", &self.heartbeat_interval_ms)
            .field("realtime_url", &self.realtime_url)
            .finish()
    }
}

// ============================================================================
// Polling REST store (key-signed REST + SQL)
// ============================================================================

#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PollingRestStoreConfig {
    /// Account endpoint, e.g. `https://<account>.documents.azure.com:443/`
    pub endpoint: String,
    /// Base64 master key
    pub key: String,
    pub database: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

impl PollingRestStoreConfig {
    pub fn new(
        endpoint: impl Into<String>,
        key: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            key: key.into(),
            database: database.into(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }

    pub fn default_poll_interval_ms() -> u64 {
        default_poll_interval_ms()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_http_url(&self.endpoint, "endpoint")?;
        if self.key.trim().is_empty() {
            return Err("key should not be empty".to_string());
        }
        STANDARD
            .decode(self.key.trim())
            .map_err(|e| format!("key must be base64: {e}"))?;
        if self.database.trim().is_empty() {
            return Err("database should not be empty".to_string());
        }
        if self.poll_interval_ms == 0 {
            return Err("pollIntervalMs must be greater than 0".to_string());
        }
        Ok(())
    }
}

impl std::fmt::Debug for PollingRestStoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingRestStoreConfig")
            .field("endpoint", &self.endpoint)
            .field("database", &self.database)
            .field("poll_interval_ms", &self.poll_interval_ms)
            .finish()
    }
}

fn validate_http_url(raw: &str, field: &str) -> Result<(), String> {
    validate_url(raw, field, &["http", "https"])
}

fn validate_url(raw: &str, field: &str, schemes: &[&str]) -> Result<(), String> {
    let s = raw.trim();
    if s.is_empty() {
        return Err(format!("{field} should not be empty"));
    }

    let url = Url::parse(s).map_err(|e| format!("invalid {field}: {e}"))?;

    let scheme = url.scheme();
    if !schemes.contains(&scheme) {
        return Err(format!("unsupported URL scheme for {field}: {scheme}"));
    }

    if url.host().is_none() {
        return Err(format!("{field} must have a host"));
    }

    Ok(())
}
