// core.rs
//
// Core types for the data connector.
// Contains the provider tags, record/session types, and the capability trait
// every backend adapter implements.
//
// Structure:
// 1. Provider + operation tags
// 2. Record, user and session types
// 3. Adapter capability trait

use std::{
    fmt::{Display, Formatter},
    str::FromStr,
};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value};

use crate::{
    error::{ConnectorResult, NormalizedError},
    query::QueryPredicate,
    subscription::SnapshotStream,
};

// ============================================================================
// PART 1: Provider + operation tags
// ============================================================================

/// Backend paradigm selected by the `provider` config tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Provider {
    /// Document store with push-based auth state and native change events
    PushAuthStore,
    /// Relational store with channel-based change notifications
    ChannelRealtimeStore,
    /// REST/SQL-over-HTTP store without any push primitive
    PollingRestStore,
}

impl Provider {
    pub const ALL: [Provider; 3] = [
        Provider::PushAuthStore,
        Provider::ChannelRealtimeStore,
        Provider::PollingRestStore,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::PushAuthStore => "pushAuthStore",
            Provider::ChannelRealtimeStore => "channelRealtimeStore",
            Provider::PollingRestStore => "pollingRestStore",
        }
    }

    /// Prefix for every operation error code raised by this provider.
    pub fn code_prefix(&self) -> &'static str {
        match self {
            Provider::PushAuthStore => "PUSH_AUTH_STORE",
            Provider::ChannelRealtimeStore => "CHANNEL_REALTIME_STORE",
            Provider::PollingRestStore => "POLLING_REST_STORE",
        }
    }

    pub fn error_code(&self, operation: Operation) -> String {
        format!("{}_{}_ERROR", self.code_prefix(), operation.suffix())
    }

    /// Key the provider's session is persisted under.
    pub fn session_key(&self) -> String {
        format!("{}_token", self.as_str())
    }
}

impl Display for Provider {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = NormalizedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Provider::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| NormalizedError::unsupported_provider(s))
    }
}

/// Operation an error is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Connect,
    Auth,
    SignOut,
    Read,
    Write,
    Update,
    Delete,
    Snapshot,
    SnapshotSetup,
}

impl Operation {
    pub fn suffix(&self) -> &'static str {
        match self {
            Operation::Connect => "CONNECT",
            Operation::Auth => "AUTH",
            Operation::SignOut => "SIGNOUT",
            Operation::Read => "READ",
            Operation::Write => "WRITE",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
            Operation::Snapshot => "SNAPSHOT",
            Operation::SnapshotSetup => "SNAPSHOT_SETUP",
        }
    }
}

// ============================================================================
// PART 2: Record, user and session types
// ============================================================================

/// Field map carried by a record or passed to write/update
pub type RecordData = JsonMap<String, Value>;

/// A backend-owned record: `{ id, ...fields }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    #[serde(flatten)]
    pub fields: RecordData,
}

impl Record {
    pub fn new(id: impl Into<String>, fields: RecordData) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    /// Build a record from a backend object, pulling `id` out of the field map.
    ///
    /// Non-object values are kept under a `value` field.
    pub fn from_value(fallback_id: &str, value: Value) -> Self {
        match value {
            Value::Object(mut fields) => {
                let id = match fields.remove("id") {
                    Some(Value::String(s)) => s,
                    Some(Value::Number(n)) => n.to_string(),
                    _ => fallback_id.to_string(),
                };
                Self { id, fields }
            }
            other => {
                let mut fields = JsonMap::new();
                fields.insert("value".to_string(), other);
                Self {
                    id: fallback_id.to_string(),
                    fields,
                }
            }
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }
}

/// Result of a delete; always `deleted: true` once the call resolves
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deleted {
    pub id: String,
    pub deleted: bool,
}

impl Deleted {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            deleted: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(flatten)]
    pub attributes: JsonMap<String, Value>,
}

impl User {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attributes: JsonMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }
}

/// Authenticated session returned by `sign_in`
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub user: User,
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("user", &self.user)
            .field("token", &"<redacted>")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .finish()
    }
}

/// Options for a read
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadOptions {
    /// A single predicate; conjunctions are not supported.
    pub filter: Option<QueryPredicate>,
}

impl ReadOptions {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn filtered(predicate: QueryPredicate) -> Self {
        Self {
            filter: Some(predicate),
        }
    }
}

/// Current UTC time in the format stamped on written records.
pub(crate) fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Diagnostic context attached to normalized errors.
pub(crate) fn op_context(
    path: &str,
    id: Option<&str>,
    filter: Option<&QueryPredicate>,
) -> JsonMap<String, Value> {
    let mut ctx = JsonMap::new();
    ctx.insert("path".to_string(), Value::String(path.to_string()));
    if let Some(id) = id {
        ctx.insert("id".to_string(), Value::String(id.to_string()));
    }
    if let Some(predicate) = filter {
        ctx.insert("query".to_string(), predicate.to_json());
    }
    ctx
}

// ============================================================================
// PART 3: Adapter capability trait
// ============================================================================

/// Capability set every backend adapter implements.
///
/// Reads are unpaginated: a read without a filter returns the whole
/// collection, table or container, so callers must treat results as
/// potentially unbounded.
#[async_trait]
pub trait ProviderAdapter: Send + Sync + 'static {
    fn provider(&self) -> Provider;

    async fn connect(&self) -> ConnectorResult<()>;

    async fn sign_in(&self) -> ConnectorResult<Session>;

    /// Clears the stored session even when the backend call fails.
    async fn sign_out(&self) -> ConnectorResult<()>;

    async fn current_user(&self) -> Option<User>;

    async fn read(&self, path: &str, options: ReadOptions) -> ConnectorResult<Vec<Record>>;

    /// Upsert; stamps the last-modified field.
    async fn write(&self, path: &str, id: &str, data: RecordData) -> ConnectorResult<Record>;

    /// Partial merge; stamps the last-modified field.
    async fn update(&self, path: &str, id: &str, data: RecordData) -> ConnectorResult<Record>;

    /// Deleting an absent id succeeds.
    async fn delete(&self, path: &str, id: &str) -> ConnectorResult<Deleted>;

    /// Open a stream of full snapshots of `path`.
    fn snapshots(&self, path: &str) -> ConnectorResult<SnapshotStream>;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn provider_tags_round_trip_through_from_str() {
        for provider in Provider::ALL {
            assert_eq!(provider.as_str().parse::<Provider>().unwrap(), provider);
        }
        let err = "mongoStore".parse::<Provider>().unwrap_err();
        assert_eq!(err.code, "UNSUPPORTED_PROVIDER");
    }

    #[test]
    fn error_codes_use_prefix_and_operation_suffix() {
        assert_eq!(
            Provider::PushAuthStore.error_code(Operation::SnapshotSetup),
            "PUSH_AUTH_STORE_SNAPSHOT_SETUP_ERROR"
        );
        assert_eq!(
            Provider::ChannelRealtimeStore.error_code(Operation::SignOut),
            "CHANNEL_REALTIME_STORE_SIGNOUT_ERROR"
        );
    }

    #[test]
    fn session_keys_are_namespaced_per_provider() {
        assert_eq!(Provider::PushAuthStore.session_key(), "pushAuthStore_token");
        assert_ne!(
            Provider::PollingRestStore.session_key(),
            Provider::ChannelRealtimeStore.session_key()
        );
    }

    #[test]
    fn record_from_value_extracts_id() {
        let record = Record::from_value("fallback", json!({"id": "c1", "name": "Acme"}));
        assert_eq!(record.id, "c1");
        assert_eq!(record.get("name"), Some(&json!("Acme")));
        assert!(record.get("id").is_none());

        let numeric = Record::from_value("fallback", json!({"id": 7}));
        assert_eq!(numeric.id, "7");

        let keyed = Record::from_value("k1", json!({"name": "x"}));
        assert_eq!(keyed.id, "k1");
    }

    #[test]
    fn record_from_scalar_wraps_value() {
        let record = Record::from_value("k", json!(42));
        assert_eq!(record.id, "k");
        assert_eq!(record.get("value"), Some(&json!(42)));
    }

    #[test]
    fn record_serializes_flat() {
        let mut fields = RecordData::new();
        fields.insert("a".to_string(), json!(1));
        let value = serde_json::to_value(Record::new("r1", fields)).unwrap();
        assert_eq!(value, json!({"id": "r1", "a": 1}));
    }

    #[test]
    fn session_debug_redacts_token() {
        let session = Session {
            user: User::new("u1"),
            token: "secret-token".to_string(),
            refresh_token: None,
        };
        let rendered = format!("{session:?}");
        assert!(!rendered.contains("secret-token"));
        assert!(rendered.contains("u1"));
    }
}
