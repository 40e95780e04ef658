//! Channel-realtime store adapter.
//!
//! Rows over a PostgREST-style API (`/rest/v1/{table}`), sessions through the
//! auth service (`/auth/v1/*`), and change notifications over a Phoenix
//! channel socket (`/realtime/v1/websocket`). A change event only signals that
//! the table moved; every notification triggers a full re-read.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use reqwest::{Method, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map as JsonMap, Value};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};
use ulid::Ulid;
use url::Url;

use crate::{
    common::{
        build_http_client, check_status, join_url, json_body, parse_base_url, records_from_rows,
        require_segment, stamped, DEFAULT_REQUEST_TIMEOUT,
    },
    config::ChannelRealtimeStoreConfig,
    core::{
        op_context, Deleted, Operation, Provider, ProviderAdapter, ReadOptions, Record,
        RecordData, Session, User,
    },
    error::{normalize, ConnectorResult, NativeError, NormalizedError},
    query::{translate, NativeFilter, QueryPredicate},
    session::SessionStore,
    subscription::{SnapshotSink, SnapshotStream},
};

const PROVIDER: Provider = Provider::ChannelRealtimeStore;

pub(crate) const UPDATED_AT_FIELD: &str = "updated_at";

const PHOENIX_VSN: &str = "1.0.0";

/// Pause between a failed channel and the next join attempt.
const REJOIN_DELAY: Duration = Duration::from_secs(1);

/// Phoenix channel frame (`vsn=1.0.0` JSON serializer).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PhoenixMessage {
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
    #[serde(rename = "ref", default)]
    reference: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    user: Value,
}

/// Build a [`User`] from an auth-service user object.
fn user_from_value(value: Value) -> Result<User, NativeError> {
    match value {
        Value::Object(mut attributes) => match attributes.remove("id") {
            Some(Value::String(id)) => Ok(User { id, attributes }),
            _ => Err(NativeError::protocol("user object has no id")),
        },
        other => Err(NativeError::protocol(format!(
            "expected a user object, got {other}"
        ))),
    }
}

/// `http(s)` base to `ws(s)://…/realtime/v1/websocket?apikey=…&vsn=1.0.0`.
fn realtime_socket_url(base: &Url, api_key: &str) -> Result<Url, NativeError> {
    let mut url = join_url(base, &["realtime", "v1", "websocket"])?;
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => other,
    }
    .to_string();
    url.set_scheme(&scheme)
        .map_err(|_| NativeError::protocol(format!("cannot use scheme {scheme} for realtime")))?;
    url.query_pairs_mut()
        .append_pair("apikey", api_key)
        .append_pair("vsn", PHOENIX_VSN);
    Ok(url)
}

// ============================================================================
// ChannelRealtimeClient helper
// ============================================================================

struct ClientInner {
    config: ChannelRealtimeStoreConfig,
    http: reqwest::Client,
    base: Url,
    realtime: Url,
    sessions: SessionStore,
    next_ref: AtomicU64,
}

#[derive(Clone)]
pub(crate) struct ChannelRealtimeClient {
    inner: Arc<ClientInner>,
}

impl ChannelRealtimeClient {
    pub fn new(config: ChannelRealtimeStoreConfig, sessions: SessionStore) -> Result<Self, String> {
        config.validate()?;
        let base = parse_base_url(&config.url).map_err(|e| e.to_string())?;
        let realtime_base = match &config.realtime_url {
            Some(raw) => parse_base_url(raw).map_err(|e| e.to_string())?,
            None => base.clone(),
        };
        let realtime =
            realtime_socket_url(&realtime_base, &config.anon_key).map_err(|e| e.to_string())?;
        let http = build_http_client().map_err(|e| e.to_string())?;
        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                http,
                base,
                realtime,
                sessions,
                next_ref: AtomicU64::new(1),
            }),
        })
    }

    fn next_ref(&self) -> String {
        self.inner.next_ref.fetch_add(1, Ordering::Relaxed).to_string()
    }

    /// Session token when signed in, the anon key otherwise.
    fn bearer(&self) -> String {
        self.inner
            .sessions
            .token(PROVIDER)
            .unwrap_or_else(|| self.inner.config.anon_key.clone())
    }

    fn request(&self, method: Method, url: Url, bearer: &str) -> RequestBuilder {
        self.inner
            .http
            .request(method, url)
            .header("apikey", &self.inner.config.anon_key)
            .bearer_auth(bearer)
            .timeout(DEFAULT_REQUEST_TIMEOUT)
    }

    fn rest(&self, method: Method, url: Url) -> RequestBuilder {
        let schema = self.inner.config.schema.clone();
        self.request(method, url, &self.bearer())
            .header("accept-profile", schema.as_str())
            .header("content-profile", schema)
    }

    fn table_url(&self, table: &str) -> Result<Url, NativeError> {
        require_segment("path", table)?;
        join_url(&self.inner.base, &["rest", "v1", table])
    }

    fn row_url(&self, table: &str, id: &str) -> Result<Url, NativeError> {
        require_segment("id", id)?;
        let mut url = self.table_url(table)?;
        url.query_pairs_mut().append_pair("id", &format!("eq.{id}"));
        Ok(url)
    }

    fn auth_url(&self, endpoint: &str) -> Result<Url, NativeError> {
        join_url(&self.inner.base, &["auth", "v1", endpoint])
    }

    async fn probe(&self) -> Result<(), NativeError> {
        let url = join_url(&self.inner.base, &["rest", "v1", ""])?;
        check_status(self.rest(Method::GET, url).send().await?).await?;
        Ok(())
    }

    async fn sign_up(&self) -> Result<Session, NativeError> {
        let url = self.auth_url("signup")?;
        let response = self
            .request(Method::POST, url, &self.inner.config.anon_key)
            .json(&json!({}))
            .send()
            .await?;
        let body = json_body(check_status(response).await?).await?;
        let auth: AuthResponse = serde_json::from_value(body)?;
        Ok(Session {
            user: user_from_value(auth.user)?,
            token: auth.access_token,
            refresh_token: auth.refresh_token,
        })
    }

    async fn logout(&self, token: &str) -> Result<(), NativeError> {
        let url = self.auth_url("logout")?;
        check_status(self.request(Method::POST, url, token).send().await?).await?;
        Ok(())
    }

    async fn fetch_user(&self, token: &str) -> Result<User, NativeError> {
        let url = self.auth_url("user")?;
        let response = check_status(self.request(Method::GET, url, token).send().await?).await?;
        user_from_value(json_body(response).await?)
    }

    async fn read_rows(
        &self,
        table: &str,
        filter: Option<&QueryPredicate>,
    ) -> Result<Vec<Record>, NativeError> {
        let mut url = self.table_url(table)?;
        url.query_pairs_mut().append_pair("select", "*");
        if let Some(predicate) = filter {
            match translate(predicate, PROVIDER)? {
                NativeFilter::RestFilter { column, expr } => {
                    url.query_pairs_mut().append_pair(&column, &expr);
                }
                other => {
                    return Err(NativeError::protocol(format!(
                        "unexpected filter for {PROVIDER}: {other:?}"
                    )))
                }
            }
        }

        let response = check_status(self.rest(Method::GET, url).send().await?).await?;
        let records = records_from_rows(json_body(response).await?)?;
        debug!(provider = %PROVIDER, path = %table, count = records.len(), "Read rows");
        Ok(records)
    }

    async fn upsert_row(
        &self,
        table: &str,
        id: &str,
        data: RecordData,
    ) -> Result<Record, NativeError> {
        require_segment("id", id)?;
        let url = self.table_url(table)?;
        let mut row = stamped(data, UPDATED_AT_FIELD);
        row.insert("id".to_string(), Value::String(id.to_string()));

        let response = self
            .rest(Method::POST, url)
            .header("prefer", "return=representation,resolution=merge-duplicates")
            .json(&row)
            .send()
            .await?;
        let returned = records_from_rows(json_body(check_status(response).await?).await?)?;
        debug!(provider = %PROVIDER, path = %table, id = %id, "Upserted row");
        Ok(returned
            .into_iter()
            .next()
            .unwrap_or_else(|| Record::from_value(id, Value::Object(row))))
    }

    /// Missing rows are an error: the filter matched nothing.
    async fn patch_row(
        &self,
        table: &str,
        id: &str,
        data: RecordData,
    ) -> Result<Record, NativeError> {
        let url = self.row_url(table, id)?;
        let patch = stamped(data, UPDATED_AT_FIELD);
        let response = self
            .rest(Method::PATCH, url)
            .header("prefer", "return=representation")
            .json(&patch)
            .send()
            .await?;
        let returned = records_from_rows(json_body(check_status(response).await?).await?)?;
        debug!(provider = %PROVIDER, path = %table, id = %id, "Patched row");
        returned.into_iter().next().ok_or_else(|| NativeError::Status {
            status: 404,
            body: format!("no row in {table} with id {id}"),
        })
    }

    /// A filter matching no row already answers 2xx, so a 404 means the
    /// table itself is unknown and is reported.
    async fn delete_row(&self, table: &str, id: &str) -> Result<(), NativeError> {
        let url = self.row_url(table, id)?;
        check_status(self.rest(Method::DELETE, url).send().await?).await?;
        debug!(provider = %PROVIDER, path = %table, id = %id, "Deleted row");
        Ok(())
    }

    async fn deliver_full_read(&self, sink: &SnapshotSink) -> bool {
        match self.read_rows(sink.path(), None).await {
            Ok(records) => sink.deliver_records(records).await,
            Err(e) => sink.deliver_error(e).await,
        }
    }

    /// Join a channel for the sink's table and re-read on every change.
    ///
    /// Returns `Ok(())` once the consumer is gone; any socket or channel
    /// failure is returned for the caller to deliver.
    async fn run_channel(&self, sink: &SnapshotSink) -> Result<(), NativeError> {
        let table = sink.path().to_string();
        let (socket, _) = tokio_tungstenite::connect_async(self.inner.realtime.as_str()).await?;
        let (mut write, mut read) = socket.split();

        let topic = format!("realtime:{}-{}", table, Ulid::new().to_string().to_lowercase());
        let join_ref = self.next_ref();
        let join = PhoenixMessage {
            topic: topic.clone(),
            event: "phx_join".to_string(),
            payload: json!({
                "config": {
                    "broadcast": { "self": false },
                    "presence": { "key": "" },
                    "postgres_changes": [{
                        "event": "*",
                        "schema": self.inner.config.schema,
                        "table": table,
                    }],
                },
                "access_token": self.bearer(),
            }),
            reference: Some(join_ref.clone()),
        };
        send_frame(&mut write, &join).await?;

        let reply = match tokio::time::timeout(
            DEFAULT_REQUEST_TIMEOUT,
            await_reply(&mut read, &topic, &join_ref),
        )
        .await
        {
            Ok(reply) => reply?,
            Err(_) => return Err(NativeError::Timeout("channel join reply".to_string())),
        };
        if reply.get("status").and_then(Value::as_str) != Some("ok") {
            let response = reply.get("response").cloned().unwrap_or(Value::Null);
            return Err(NativeError::protocol(format!(
                "channel join rejected: {response}"
            )));
        }
        debug!(provider = %PROVIDER, path = %table, topic = %topic, "Joined channel");

        if !self.deliver_full_read(sink).await {
            return Ok(());
        }

        let period = self.inner.config.heartbeat_interval();
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    let beat = PhoenixMessage {
                        topic: "phoenix".to_string(),
                        event: "heartbeat".to_string(),
                        payload: json!({}),
                        reference: Some(self.next_ref()),
                    };
                    send_frame(&mut write, &beat).await?;
                }
                message = read.next() => {
                    let message = match message {
                        Some(message) => message?,
                        None => return Err(NativeError::protocol("realtime socket closed")),
                    };
                    let text = match message {
                        Message::Text(text) => text,
                        Message::Close(frame) => {
                            return Err(NativeError::protocol(format!(
                                "realtime socket closed: {frame:?}"
                            )))
                        }
                        _ => continue,
                    };
                    let frame: PhoenixMessage = serde_json::from_str(&text)?;
                    if frame.topic != topic {
                        continue;
                    }
                    match frame.event.as_str() {
                        "postgres_changes" => {
                            debug!(provider = %PROVIDER, path = %table, "Change notification");
                            if !self.deliver_full_read(sink).await {
                                return Ok(());
                            }
                        }
                        "phx_error" => {
                            return Err(NativeError::protocol(format!(
                                "channel error: {}",
                                frame.payload
                            )))
                        }
                        "phx_close" => {
                            return Err(NativeError::protocol("channel closed by server"))
                        }
                        _ => {}
                    }
                }
            }
        }
    }
}

async fn send_frame<S>(write: &mut S, frame: &PhoenixMessage) -> Result<(), NativeError>
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    write.send(Message::Text(serde_json::to_string(frame)?)).await?;
    Ok(())
}

/// Wait for the `phx_reply` to `reference` on `topic`; returns its payload.
async fn await_reply<S>(read: &mut S, topic: &str, reference: &str) -> Result<Value, NativeError>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    while let Some(message) = read.next().await {
        let Message::Text(text) = message? else {
            continue;
        };
        let frame: PhoenixMessage = serde_json::from_str(&text)?;
        if frame.topic == topic
            && frame.event == "phx_reply"
            && frame.reference.as_deref() == Some(reference)
        {
            return Ok(frame.payload);
        }
    }
    Err(NativeError::protocol("realtime socket closed before join reply"))
}

// ============================================================================
// ChannelRealtimeStoreAdapter
// ============================================================================

pub struct ChannelRealtimeStoreAdapter {
    client: ChannelRealtimeClient,
}

impl ChannelRealtimeStoreAdapter {
    pub fn new(
        config: ChannelRealtimeStoreConfig,
        sessions: SessionStore,
    ) -> ConnectorResult<Self> {
        let client = ChannelRealtimeClient::new(config, sessions).map_err(|e| {
            NormalizedError::invalid_config(e).with_context("provider", PROVIDER.as_str())
        })?;
        Ok(Self { client })
    }

    fn sessions(&self) -> &SessionStore {
        &self.client.inner.sessions
    }
}

#[async_trait]
impl ProviderAdapter for ChannelRealtimeStoreAdapter {
    fn provider(&self) -> Provider {
        PROVIDER
    }

    async fn connect(&self) -> ConnectorResult<()> {
        self.client
            .probe()
            .await
            .map_err(|e| normalize(PROVIDER, Operation::Connect, e, &JsonMap::new()))?;
        info!(provider = %PROVIDER, url = %self.client.inner.base, "Connected");
        Ok(())
    }

    async fn sign_in(&self) -> ConnectorResult<Session> {
        let session = self
            .client
            .sign_up()
            .await
            .map_err(|e| normalize(PROVIDER, Operation::Auth, e, &JsonMap::new()))?;
        self.sessions().put(PROVIDER, session.clone());
        info!(provider = %PROVIDER, user = %session.user.id, "Signed in");
        Ok(session)
    }

    async fn sign_out(&self) -> ConnectorResult<()> {
        let Some(session) = self.sessions().remove(PROVIDER) else {
            debug!(provider = %PROVIDER, "Sign-out without a session");
            return Ok(());
        };
        info!(provider = %PROVIDER, user = %session.user.id, "Signed out");
        self.client
            .logout(&session.token)
            .await
            .map_err(|e| normalize(PROVIDER, Operation::SignOut, e, &JsonMap::new()))
    }

    async fn current_user(&self) -> Option<User> {
        let token = self.sessions().token(PROVIDER)?;
        match self.client.fetch_user(&token).await {
            Ok(user) => Some(user),
            Err(e) => {
                warn!(provider = %PROVIDER, error = %e, "Failed to fetch current user");
                None
            }
        }
    }

    async fn read(&self, path: &str, options: ReadOptions) -> ConnectorResult<Vec<Record>> {
        self.client
            .read_rows(path, options.filter.as_ref())
            .await
            .map_err(|e| {
                let ctx = op_context(path, None, options.filter.as_ref());
                normalize(PROVIDER, Operation::Read, e, &ctx)
            })
    }

    async fn write(&self, path: &str, id: &str, data: RecordData) -> ConnectorResult<Record> {
        self.client
            .upsert_row(path, id, data)
            .await
            .map_err(|e| {
                normalize(PROVIDER, Operation::Write, e, &op_context(path, Some(id), None))
            })
    }

    async fn update(&self, path: &str, id: &str, data: RecordData) -> ConnectorResult<Record> {
        self.client
            .patch_row(path, id, data)
            .await
            .map_err(|e| {
                normalize(PROVIDER, Operation::Update, e, &op_context(path, Some(id), None))
            })
    }

    async fn delete(&self, path: &str, id: &str) -> ConnectorResult<Deleted> {
        self.client
            .delete_row(path, id)
            .await
            .map_err(|e| {
                normalize(PROVIDER, Operation::Delete, e, &op_context(path, Some(id), None))
            })?;
        Ok(Deleted::new(id))
    }

    fn snapshots(&self, path: &str) -> ConnectorResult<SnapshotStream> {
        let client = self.client.clone();

        SnapshotStream::spawn(PROVIDER, path, move |sink| async move {
            loop {
                if let Err(e) = client.run_channel(&sink).await {
                    if !sink.deliver_error(e).await {
                        break;
                    }
                }
                if sink.is_closed() || !sink.sleep(REJOIN_DELAY).await {
                    break;
                }
                debug!(provider = %PROVIDER, path = %sink.path(), "Rejoining channel");
            }
        })
    }
}
