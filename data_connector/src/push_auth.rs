//! Push-auth store adapter.
//!
//! Document tree over REST (`{databaseUrl}/{path}.json`), anonymous auth via
//! the identity toolkit endpoints, and change events over a server-sent event
//! stream. Auth state is published on a watch channel; `connect()` waits for
//! its first resolution.
//!
//! Structure:
//! 1. Auth state + wire types
//! 2. Snapshot tree
//! 3. PushAuthClient helper
//! 4. PushAuthStoreAdapter

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Method, RequestBuilder};
use serde::Deserialize;
use serde_json::{json, Map as JsonMap, Value};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    common::{
        build_http_client, check_status, join_url, json_body, parse_base_url, records_from_keyed,
        require_segment, stamped, SseDecoder, DEFAULT_REQUEST_TIMEOUT,
    },
    config::PushAuthStoreConfig,
    core::{
        op_context, Deleted, Operation, Provider, ProviderAdapter, ReadOptions, Record,
        RecordData, Session, User,
    },
    error::{normalize, ConnectorResult, NativeError, NormalizedError},
    query::{translate, NativeFilter, QueryPredicate},
    session::SessionStore,
    subscription::{SnapshotSink, SnapshotStream},
};

const PROVIDER: Provider = Provider::PushAuthStore;

pub(crate) const UPDATED_AT_FIELD: &str = "updatedAt";

// ============================================================================
// PART 1: Auth state + wire types
// ============================================================================

/// Auth state as pushed to listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthState {
    /// No resolution has happened yet
    Unresolved,
    SignedOut,
    SignedIn(User),
}

impl AuthState {
    pub fn is_resolved(&self) -> bool {
        !matches!(self, AuthState::Unresolved)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignUpResponse {
    id_token: String,
    local_id: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    #[serde(default)]
    users: Vec<LookupUser>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LookupUser {
    local_id: String,
}

#[derive(Debug, Deserialize)]
struct EventPayload {
    path: String,
    #[serde(default)]
    data: Value,
}

// ============================================================================
// PART 2: Snapshot tree
// ============================================================================

fn ensure_object(node: &mut Value) -> &mut JsonMap<String, Value> {
    if !node.is_object() {
        *node = Value::Object(JsonMap::new());
    }
    match node {
        Value::Object(map) => map,
        _ => unreachable!("node was just replaced with an object"),
    }
}

/// Drop nulls and empty objects; returns whether `node` itself is now empty.
fn prune(node: &mut Value) -> bool {
    match node {
        Value::Object(map) => {
            map.retain(|_, child| !prune(child));
            map.is_empty()
        }
        Value::Null => true,
        _ => false,
    }
}

/// Local copy of the subscribed node, kept current from `put`/`patch` events.
#[derive(Debug, Default)]
pub(crate) struct SnapshotTree {
    root: Value,
}

impl SnapshotTree {
    /// Replace the value at `path` (relative to the subscribed node).
    pub fn put(&mut self, path: &str, data: Value) {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        match segments.split_last() {
            None => self.root = data,
            Some((last, parents)) => {
                let mut node = &mut self.root;
                for segment in parents {
                    node = ensure_object(node)
                        .entry(segment.to_string())
                        .or_insert(Value::Null);
                }
                let map = ensure_object(node);
                if data.is_null() {
                    map.remove(*last);
                } else {
                    map.insert(last.to_string(), data);
                }
            }
        }
        if prune(&mut self.root) {
            self.root = Value::Null;
        }
    }

    /// Merge each child of `data` into the node at `path`.
    pub fn patch(&mut self, path: &str, data: Value) {
        let Value::Object(children) = data else {
            self.put(path, data);
            return;
        };
        let base = path.trim_end_matches('/');
        for (key, value) in children {
            self.put(&format!("{base}/{key}"), value);
        }
    }

    pub fn records(&self) -> Vec<Record> {
        records_from_keyed(self.root.clone())
    }
}

/// Record for a node whose id is dictated by its key.
fn keyed_record(id: &str, value: Value) -> Record {
    let mut record = Record::from_value(id, value);
    record.id = id.to_string();
    record
}

// ============================================================================
// PART 3: PushAuthClient helper
// ============================================================================

struct ClientInner {
    config: PushAuthStoreConfig,
    http: reqwest::Client,
    database: Url,
    auth: Url,
    sessions: SessionStore,
    auth_state: watch::Sender<AuthState>,
}

#[derive(Clone)]
pub(crate) struct PushAuthClient {
    inner: Arc<ClientInner>,
}

impl PushAuthClient {
    pub fn new(config: PushAuthStoreConfig, sessions: SessionStore) -> Result<Self, String> {
        config.validate()?;
        let database = parse_base_url(&config.database_url).map_err(|e| e.to_string())?;
        let auth = parse_base_url(&config.auth_url).map_err(|e| e.to_string())?;
        let http = build_http_client().map_err(|e| e.to_string())?;
        let (auth_state, _) = watch::channel(AuthState::Unresolved);
        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                http,
                database,
                auth,
                sessions,
                auth_state,
            }),
        })
    }

    fn publish(&self, state: AuthState) {
        debug!(provider = %PROVIDER, state = ?state, "Auth state changed");
        self.inner.auth_state.send_replace(state);
    }

    /// URL of a node: `{databaseUrl}/{path}[/{id}].json?auth=<token>`.
    fn node_url(&self, path: &str, id: Option<&str>) -> Result<Url, NativeError> {
        require_segment("path", path)?;
        let mut segments: Vec<String> = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if let Some(id) = id {
            require_segment("id", id)?;
            segments.push(id.to_string());
        }
        if let Some(last) = segments.last_mut() {
            last.push_str(".json");
        }
        let refs: Vec<&str> = segments.iter().map(String::as_str).collect();
        let mut url = join_url(&self.inner.database, &refs)?;
        if let Some(token) = self.inner.sessions.token(PROVIDER) {
            url.query_pairs_mut().append_pair("auth", &token);
        }
        Ok(url)
    }

    fn auth_url(&self, endpoint: &str) -> Result<Url, NativeError> {
        let mut url = join_url(&self.inner.auth, &["v1", endpoint])?;
        url.query_pairs_mut()
            .append_pair("key", &self.inner.config.api_key);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.inner
            .http
            .request(method, url)
            .timeout(DEFAULT_REQUEST_TIMEOUT)
    }

    /// Resolve the persisted session (if any) and publish the outcome.
    async fn resolve_session(&self) -> Result<AuthState, NativeError> {
        let Some(session) = self.inner.sessions.get(PROVIDER) else {
            self.publish(AuthState::SignedOut);
            return Ok(AuthState::SignedOut);
        };

        let url = self.auth_url("accounts:lookup")?;
        let response = self
            .request(Method::POST, url)
            .json(&json!({ "idToken": session.token }))
            .send()
            .await?;
        let state = match check_status(response).await {
            Ok(response) => {
                let lookup: LookupResponse = serde_json::from_value(json_body(response).await?)?;
                match lookup.users.into_iter().next() {
                    Some(user) if user.local_id == session.user.id => {
                        AuthState::SignedIn(session.user)
                    }
                    Some(user) => AuthState::SignedIn(User::new(user.local_id)),
                    None => AuthState::SignedOut,
                }
            }
            // The token was rejected: the persisted session is stale.
            Err(NativeError::Status { status: 400, .. }) => AuthState::SignedOut,
            Err(e) => return Err(e),
        };

        if !matches!(state, AuthState::SignedIn(_)) {
            warn!(provider = %PROVIDER, "Persisted session rejected, clearing it");
            self.inner.sessions.remove(PROVIDER);
        }
        self.publish(state.clone());
        Ok(state)
    }

    async fn await_resolution(&self) -> Result<AuthState, NativeError> {
        let mut rx = self.inner.auth_state.subscribe();
        let state = rx
            .wait_for(AuthState::is_resolved)
            .await
            .map_err(|e| NativeError::protocol(format!("auth state channel closed: {e}")))?;
        Ok(state.clone())
    }

    async fn sign_up(&self) -> Result<Session, NativeError> {
        let url = self.auth_url("accounts:signUp")?;
        let response = self
            .request(Method::POST, url)
            .json(&json!({ "returnSecureToken": true }))
            .send()
            .await?;
        let body = json_body(check_status(response).await?).await?;
        let created: SignUpResponse = serde_json::from_value(body)?;

        let mut user = User::new(created.local_id).with_attribute("anonymous", true);
        if let Some(expires_in) = created.expires_in {
            user = user.with_attribute("expiresIn", expires_in);
        }
        Ok(Session {
            user,
            token: created.id_token,
            refresh_token: created.refresh_token,
        })
    }

    async fn read_records(
        &self,
        path: &str,
        filter: Option<&QueryPredicate>,
    ) -> Result<Vec<Record>, NativeError> {
        let mut url = self.node_url(path, None)?;
        if let Some(predicate) = filter {
            match translate(predicate, PROVIDER)? {
                NativeFilter::DocumentParams(params) => {
                    let mut pairs = url.query_pairs_mut();
                    for (name, value) in &params {
                        pairs.append_pair(name, value);
                    }
                }
                other => {
                    return Err(NativeError::protocol(format!(
                        "unexpected filter for {PROVIDER}: {other:?}"
                    )))
                }
            }
        }

        let response = check_status(self.request(Method::GET, url).send().await?).await?;
        let records = records_from_keyed(json_body(response).await?);
        debug!(provider = %PROVIDER, path = %path, count = records.len(), "Read nodes");
        Ok(records)
    }

    async fn put_node(
        &self,
        path: &str,
        id: &str,
        data: RecordData,
    ) -> Result<Record, NativeError> {
        let url = self.node_url(path, Some(id))?;
        let body = stamped(data, UPDATED_AT_FIELD);
        let request = self.request(Method::PUT, url).json(&body);
        let response = check_status(request.send().await?).await?;
        let stored = json_body(response).await?;
        debug!(provider = %PROVIDER, path = %path, id = %id, "Wrote node");
        Ok(match stored {
            Value::Null => keyed_record(id, Value::Object(body)),
            value => keyed_record(id, value),
        })
    }

    async fn patch_node(
        &self,
        path: &str,
        id: &str,
        data: RecordData,
    ) -> Result<Record, NativeError> {
        let url = self.node_url(path, Some(id))?;
        let body = stamped(data, UPDATED_AT_FIELD);
        check_status(
            self.request(Method::PATCH, url.clone())
                .json(&body)
                .send()
                .await?,
        )
        .await?;

        let response = check_status(self.request(Method::GET, url).send().await?).await?;
        let merged = json_body(response).await?;
        debug!(provider = %PROVIDER, path = %path, id = %id, "Patched node");
        Ok(match merged {
            Value::Null => keyed_record(id, Value::Object(body)),
            value => keyed_record(id, value),
        })
    }

    async fn delete_node(&self, path: &str, id: &str) -> Result<(), NativeError> {
        let url = self.node_url(path, Some(id))?;
        match check_status(self.request(Method::DELETE, url).send().await?).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                debug!(provider = %PROVIDER, path = %path, id = %id, "Node already absent");
            }
            Err(e) => return Err(e),
        }
        debug!(provider = %PROVIDER, path = %path, id = %id, "Deleted node");
        Ok(())
    }

    /// Follow one event stream until it ends, fails, or the consumer leaves.
    async fn stream_once(&self, sink: &SnapshotSink) -> Result<(), NativeError> {
        let url = self.node_url(sink.path(), None)?;
        let response = self
            .inner
            .http
            .get(url)
            .header("accept", "text/event-stream")
            .send()
            .await?;
        let response = check_status(response).await?;

        let mut tree = SnapshotTree::default();
        let mut decoder = SseDecoder::new();
        let mut body = response.bytes_stream();

        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            for (event, data) in decoder.push(&chunk)? {
                match event.as_str() {
                    "put" | "patch" => {
                        let payload: EventPayload = serde_json::from_str(&data)?;
                        if event == "put" {
                            tree.put(&payload.path, payload.data);
                        } else {
                            tree.patch(&payload.path, payload.data);
                        }
                        if !sink.deliver_records(tree.records()).await {
                            return Ok(());
                        }
                    }
                    "keep-alive" => {}
                    "cancel" => {
                        return Err(NativeError::protocol(format!(
                            "event stream cancelled by server: {data}"
                        )))
                    }
                    "auth_revoked" => {
                        return Err(NativeError::protocol("auth token revoked"));
                    }
                    other => {
                        debug!(provider = %PROVIDER, event = %other, "Ignoring unknown event");
                    }
                }
            }
        }
        Err(NativeError::protocol("event stream closed by server"))
    }
}

// ============================================================================
// PART 4: PushAuthStoreAdapter
// ============================================================================

pub struct PushAuthStoreAdapter {
    client: PushAuthClient,
}

impl PushAuthStoreAdapter {
    pub fn new(config: PushAuthStoreConfig, sessions: SessionStore) -> ConnectorResult<Self> {
        let client = PushAuthClient::new(config, sessions).map_err(|e| {
            NormalizedError::invalid_config(e).with_context("provider", PROVIDER.as_str())
        })?;
        Ok(Self { client })
    }

    /// Receiver for auth state changes; starts out [`AuthState::Unresolved`].
    pub fn auth_state(&self) -> watch::Receiver<AuthState> {
        self.client.inner.auth_state.subscribe()
    }

    fn sessions(&self) -> &SessionStore {
        &self.client.inner.sessions
    }
}

#[async_trait]
impl ProviderAdapter for PushAuthStoreAdapter {
    fn provider(&self) -> Provider {
        PROVIDER
    }

    async fn connect(&self) -> ConnectorResult<()> {
        let resolution = async {
            self.client.resolve_session().await?;
            self.client.await_resolution().await
        };
        let outcome = match self.client.inner.config.session_timeout() {
            Some(limit) => match tokio::time::timeout(limit, resolution).await {
                Ok(outcome) => outcome,
                Err(_) => Err(NativeError::Timeout(format!(
                    "session resolution exceeded {}ms",
                    limit.as_millis()
                ))),
            },
            None => resolution.await,
        };

        let state = outcome
            .map_err(|e| normalize(PROVIDER, Operation::Connect, e, &JsonMap::new()))?;
        let signed_in = matches!(state, AuthState::SignedIn(_));
        info!(provider = %PROVIDER, signed_in, "Connected");
        Ok(())
    }

    async fn sign_in(&self) -> ConnectorResult<Session> {
        let session = self
            .client
            .sign_up()
            .await
            .map_err(|e| normalize(PROVIDER, Operation::Auth, e, &JsonMap::new()))?;
        self.sessions().put(PROVIDER, session.clone());
        self.client.publish(AuthState::SignedIn(session.user.clone()));
        info!(provider = %PROVIDER, user = %session.user.id, "Signed in");
        Ok(session)
    }

    /// Anonymous sessions have no server-side sign-out; this is local only.
    async fn sign_out(&self) -> ConnectorResult<()> {
        self.sessions().remove(PROVIDER);
        self.client.publish(AuthState::SignedOut);
        info!(provider = %PROVIDER, "Signed out");
        Ok(())
    }

    async fn current_user(&self) -> Option<User> {
        self.sessions().user(PROVIDER)
    }

    async fn read(&self, path: &str, options: ReadOptions) -> ConnectorResult<Vec<Record>> {
        self.client
            .read_records(path, options.filter.as_ref())
            .await
            .map_err(|e| {
                let ctx = op_context(path, None, options.filter.as_ref());
                normalize(PROVIDER, Operation::Read, e, &ctx)
            })
    }

    async fn write(&self, path: &str, id: &str, data: RecordData) -> ConnectorResult<Record> {
        self.client
            .put_node(path, id, data)
            .await
            .map_err(|e| {
                normalize(PROVIDER, Operation::Write, e, &op_context(path, Some(id), None))
            })
    }

    async fn update(&self, path: &str, id: &str, data: RecordData) -> ConnectorResult<Record> {
        self.client
            .patch_node(path, id, data)
            .await
            .map_err(|e| {
                normalize(PROVIDER, Operation::Update, e, &op_context(path, Some(id), None))
            })
    }

    async fn delete(&self, path: &str, id: &str) -> ConnectorResult<Deleted> {
        self.client
            .delete_node(path, id)
            .await
            .map_err(|e| {
                normalize(PROVIDER, Operation::Delete, e, &op_context(path, Some(id), None))
            })?;
        Ok(Deleted::new(id))
    }

    fn snapshots(&self, path: &str) -> ConnectorResult<SnapshotStream> {
        let client = self.client.clone();
        let reconnect_delay = client.inner.config.reconnect_delay();

        SnapshotStream::spawn(PROVIDER, path, move |sink| async move {
            loop {
                if let Err(e) = client.stream_once(&sink).await {
                    if !sink.deliver_error(e).await {
                        break;
                    }
                }
                if sink.is_closed() || !sink.sleep(reconnect_delay).await {
                    break;
                }
                debug!(provider = %PROVIDER, path = %sink.path(), "Reopening event stream");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_put_replaces_the_tree() {
        let mut tree = SnapshotTree::default();
        tree.put("/", json!({"c1": {"name": "Acme"}, "c2": {"name": "Beta"}}));
        let records = tree.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, "c1");

        tree.put("/", Value::Null);
        assert!(tree.records().is_empty());
    }

    #[test]
    fn nested_put_updates_and_removes_children() {
        let mut tree = SnapshotTree::default();
        tree.put("/", json!({"c1": {"name": "Acme"}}));
        tree.put("/c2", json!({"name": "Beta"}));
        tree.put("/c1/name", json!("Acme Corp"));

        let records = tree.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get("name"), Some(&json!("Acme Corp")));

        tree.put("/c1/name", Value::Null);
        let records = tree.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "c2");
    }

    #[test]
    fn patch_merges_children() {
        let mut tree = SnapshotTree::default();
        tree.put("/", json!({"c1": {"name": "Acme", "size": 3}}));
        tree.patch("/c1", json!({"size": 4, "city": "Oslo"}));
        tree.patch("/", json!({"c2": {"name": "Beta"}}));

        let records = tree.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get("name"), Some(&json!("Acme")));
        assert_eq!(records[0].get("size"), Some(&json!(4)));
        assert_eq!(records[0].get("city"), Some(&json!("Oslo")));
    }

    #[test]
    fn keyed_record_uses_the_node_key() {
        let record = keyed_record("c1", json!({"id": "other", "name": "Acme"}));
        assert_eq!(record.id, "c1");
    }

    #[test]
    fn auth_state_resolution() {
        assert!(!AuthState::Unresolved.is_resolved());
        assert!(AuthState::SignedOut.is_resolved());
        assert!(AuthState::SignedIn(User::new("u")).is_resolved());
    }

    #[tokio::test]
    async fn connect_without_stored_session_resolves_signed_out() {
        let config = PushAuthStoreConfig::new("api-key", "http://127.0.0.1:9");
        let adapter = PushAuthStoreAdapter::new(config, SessionStore::new()).unwrap();
        let rx = adapter.auth_state();
        assert_eq!(*rx.borrow(), AuthState::Unresolved);

        adapter.connect().await.unwrap();
        assert_eq!(*rx.borrow(), AuthState::SignedOut);
        assert!(adapter.current_user().await.is_none());
    }

    #[tokio::test]
    async fn node_urls_carry_the_session_token() {
        let sessions = SessionStore::new();
        let config = PushAuthStoreConfig::new("api-key", "https://demo.example.com");
        let client = PushAuthClient::new(config, sessions.clone()).unwrap();

        let url = client.node_url("companies", Some("c1")).unwrap();
        assert_eq!(url.as_str(), "https://demo.example.com/companies/c1.json");

        sessions.put(
            PROVIDER,
            Session {
                user: User::new("u1"),
                token: "tok".to_string(),
                refresh_token: None,
            },
        );
        let url = client.node_url("orgs/acme/companies", None).unwrap();
        assert_eq!(
            url.as_str(),
            "https://demo.example.com/orgs/acme/companies.json?auth=tok"
        );
        assert!(client.node_url("", None).is_err());
    }

    #[test]
    fn empty_api_key_is_rejected_at_construction() {
        let config = PushAuthStoreConfig::new(" ", "http://127.0.0.1:9");
        let Err(err) = PushAuthStoreAdapter::new(config, SessionStore::new()) else {
            panic!("adapter accepted an empty api key");
        };
        assert_eq!(err.code, crate::error::INVALID_CONFIG);
        assert_eq!(err.context["provider"], "pushAuthStore");
    }
}
