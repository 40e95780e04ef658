//! Uniform error envelope for every failure surfaced by the connector.
//!
//! Adapters work with [`NativeError`] internally and convert exactly once at
//! the trait boundary through [`NormalizedError::from_native`], so no
//! transport or decode error ever reaches a caller unwrapped.

use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value};
use thiserror::Error;

use crate::core::{Operation, Provider};

pub const INVALID_CONFIG: &str = "INVALID_CONFIG";
pub const UNSUPPORTED_PROVIDER: &str = "UNSUPPORTED_PROVIDER";
pub const UNSUPPORTED_OPERATOR: &str = "UNSUPPORTED_OPERATOR";

/// Provider label used for errors raised before an adapter exists.
pub const CONNECTOR_PROVIDER_LABEL: &str = "connector";

/// Result alias used across the façade and the adapters
pub type ConnectorResult<T> = Result<T, NormalizedError>;

/// Backend-agnostic failure envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("[{provider}] {code}: {message}")]
pub struct NormalizedError {
    pub code: String,
    pub message: String,
    pub provider: String,
    #[serde(default)]
    pub context: JsonMap<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl NormalizedError {
    pub fn new(
        code: impl Into<String>,
        message: impl Into<String>,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            provider: provider.into(),
            context: JsonMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::new(INVALID_CONFIG, message, CONNECTOR_PROVIDER_LABEL)
    }

    pub fn unsupported_provider(tag: &str) -> Self {
        Self::new(
            UNSUPPORTED_PROVIDER,
            format!("unsupported provider: {tag}"),
            CONNECTOR_PROVIDER_LABEL,
        )
        .with_context("provider", tag)
    }

    pub fn unsupported_operator(provider: Provider, message: impl Into<String>) -> Self {
        Self::new(UNSUPPORTED_OPERATOR, message, provider.as_str())
    }

    /// Wrap a provider-native failure as `<PREFIX>_<OP>_ERROR`.
    pub fn from_native(provider: Provider, operation: Operation, native: NativeError) -> Self {
        let mut err = Self::new(
            provider.error_code(operation),
            native.to_string(),
            provider.as_str(),
        )
        .with_context("native", native.to_string());
        if let Some(status) = native.status() {
            err = err.with_context("status", status);
        }
        err
    }

    pub fn with_context(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.context.insert(key.to_string(), value.into());
        self
    }

    /// Merge an operation context (path, id, query) into the envelope.
    pub fn with_context_map(mut self, context: &JsonMap<String, Value>) -> Self {
        for (key, value) in context {
            self.context.insert(key.clone(), value.clone());
        }
        self
    }
}

/// Failures as the backends report them, before normalization.
#[derive(Debug, Error)]
pub enum NativeError {
    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("backend returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("{0}")]
    Normalized(Box<NormalizedError>),
}

impl NativeError {
    pub fn protocol(message: impl Display) -> Self {
        Self::Protocol(message.to_string())
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }
}

impl From<NormalizedError> for NativeError {
    fn from(value: NormalizedError) -> Self {
        Self::Normalized(Box::new(value))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for NativeError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(value))
    }
}

/// Normalize a native failure at the adapter boundary.
///
/// Errors that are already normalized keep their code and gain the operation context.
pub(crate) fn normalize(
    provider: Provider,
    operation: Operation,
    native: NativeError,
    context: &JsonMap<String, Value>,
) -> NormalizedError {
    let err = match native {
        NativeError::Normalized(err) => err.with_context_map(context),
        other => NormalizedError::from_native(provider, operation, other).with_context_map(context),
    };
    tracing::warn!(
        provider = %provider,
        code = %err.code,
        error = %err.message,
        "Connector operation failed"
    );
    err
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn from_native_builds_prefixed_code_and_status_context() {
        let native = NativeError::Status {
            status: 503,
            body: "unavailable".to_string(),
        };
        let err = NormalizedError::from_native(Provider::PollingRestStore, Operation::Read, native);

        assert_eq!(err.code, "POLLING_REST_STORE_READ_ERROR");
        assert_eq!(err.provider, "pollingRestStore");
        assert_eq!(err.context["status"], 503);
        assert!(err.message.contains("unavailable"));
    }

    #[test]
    fn normalize_keeps_code_of_already_normalized_errors() {
        let inner = NormalizedError::unsupported_operator(Provider::PushAuthStore, "bad op");
        let mut ctx = JsonMap::new();
        ctx.insert("path".to_string(), json!("companies"));

        let err = normalize(
            Provider::PushAuthStore,
            Operation::Read,
            NativeError::from(inner),
            &ctx,
        );
        assert_eq!(err.code, UNSUPPORTED_OPERATOR);
        assert_eq!(err.context["path"], "companies");
    }

    #[test]
    fn normalize_merges_operation_context() {
        let mut ctx = JsonMap::new();
        ctx.insert("path".to_string(), json!("companies"));
        ctx.insert("id".to_string(), json!("c1"));

        let err = normalize(
            Provider::ChannelRealtimeStore,
            Operation::Delete,
            NativeError::protocol("boom"),
            &ctx,
        );
        assert_eq!(err.code, "CHANNEL_REALTIME_STORE_DELETE_ERROR");
        assert_eq!(err.context["path"], "companies");
        assert_eq!(err.context["id"], "c1");
        assert_eq!(err.context["native"], "protocol error: boom");
    }

    #[test]
    fn serializes_with_rfc3339_timestamp() {
        let err = NormalizedError::invalid_config("missing provider");
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["code"], INVALID_CONFIG);
        assert_eq!(value["provider"], CONNECTOR_PROVIDER_LABEL);
        let ts = value["timestamp"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(ts).is_ok());
    }

    #[test]
    fn not_found_detection_uses_status() {
        let missing = NativeError::Status {
            status: 404,
            body: String::new(),
        };
        assert!(missing.is_not_found());
        assert!(!NativeError::protocol("x").is_not_found());
    }
}
