//! Polling REST store adapter.
//!
//! Talks to a key-signed document REST API (databases, containers and
//! documents addressed as `dbs/{db}/colls/{container}/docs/{id}`). The store
//! has no push primitive, so snapshots are produced by a sequential polling
//! task.
//!
//! Structure:
//! 1. Request signing
//! 2. PollingRestClient helper
//! 3. PollingRestStoreAdapter

use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Method, RequestBuilder};
use serde_json::{json, Value};
use sha2::Sha256;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};
use ulid::Ulid;
use url::Url;

use crate::{
    common::{
        build_http_client, check_status, join_url, json_body, parse_base_url, require_segment,
        stamped, strip_fields, DEFAULT_REQUEST_TIMEOUT,
    },
    config::PollingRestStoreConfig,
    core::{
        op_context, Deleted, Operation, Provider, ProviderAdapter, ReadOptions, Record,
        RecordData, Session, User,
    },
    error::{normalize, ConnectorResult, NativeError, NormalizedError},
    query::{translate, NativeFilter, QueryPredicate},
    session::SessionStore,
    subscription::{SnapshotSink, SnapshotStream},
};

const PROVIDER: Provider = Provider::PollingRestStore;

const API_VERSION: &str = "2018-12-31";

pub(crate) const UPDATED_AT_FIELD: &str = "updatedAt";

/// Server-maintained properties removed from every returned document.
const SYSTEM_PROPERTIES: &[&str] = &["_rid", "_self", "_etag", "_attachments", "_ts"];

const CONTINUATION_HEADER: &str = "x-ms-continuation";

// ============================================================================
// PART 1: Request signing
// ============================================================================

type HmacSha256 = Hmac<Sha256>;

/// Current time in the RFC 1123 form the `x-ms-date` header expects.
fn rfc1123_now() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Build the url-encoded master-key `Authorization` header value.
///
/// The signed payload is `verb\nresourceType\nresourceLink\ndate\n\n` with
/// everything but the resource link lowercased.
fn authorization(
    key: &[u8],
    verb: &str,
    resource_type: &str,
    resource_link: &str,
    date: &str,
) -> Result<String, NativeError> {
    let payload = format!(
        "{}\n{}\n{}\n{}\n\n",
        verb.to_lowercase(),
        resource_type.to_lowercase(),
        resource_link,
        date.to_lowercase()
    );
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| NativeError::protocol(format!("invalid signing key: {e}")))?;
    mac.update(payload.as_bytes());
    let signature = STANDARD.encode(mac.finalize().into_bytes());
    let token = format!("type=master&ver=1.0&sig={signature}");
    Ok(url::form_urlencoded::byte_serialize(token.as_bytes()).collect())
}

/// Turn a returned document into a record, dropping system properties.
fn document_to_record(document: Value) -> Record {
    match document {
        Value::Object(mut map) => {
            strip_fields(&mut map, SYSTEM_PROPERTIES);
            Record::from_value("", Value::Object(map))
        }
        other => Record::from_value("", other),
    }
}

/// Pull `Documents` out of a list or query response page.
fn documents_from_page(page: Value) -> Result<Vec<Record>, NativeError> {
    match page {
        Value::Object(mut map) => match map.remove("Documents") {
            Some(Value::Array(docs)) => Ok(docs.into_iter().map(document_to_record).collect()),
            Some(Value::Null) | None => Ok(Vec::new()),
            Some(other) => Err(NativeError::protocol(format!(
                "expected Documents to be an array, got {other}"
            ))),
        },
        Value::Null => Ok(Vec::new()),
        other => Err(NativeError::protocol(format!(
            "unexpected document page: {other}"
        ))),
    }
}

fn partition_key(id: &str) -> Result<String, NativeError> {
    Ok(serde_json::to_string(&[id])?)
}

// ============================================================================
// PART 2: PollingRestClient helper
// ============================================================================

struct ClientInner {
    config: PollingRestStoreConfig,
    http: reqwest::Client,
    base: Url,
    key: Vec<u8>,
    sessions: SessionStore,
}

/// Shared HTTP client for one account; cheap to clone into polling tasks.
#[derive(Clone)]
pub(crate) struct PollingRestClient {
    inner: Arc<ClientInner>,
}

impl PollingRestClient {
    pub fn new(config: PollingRestStoreConfig, sessions: SessionStore) -> Result<Self, String> {
        config.validate()?;
        let base = parse_base_url(&config.endpoint).map_err(|e| e.to_string())?;
        let key = STANDARD
            .decode(config.key.trim())
            .map_err(|e| format!("key must be base64: {e}"))?;
        let http = build_http_client().map_err(|e| e.to_string())?;
        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                http,
                base,
                key,
                sessions,
            }),
        })
    }

    fn database(&self) -> &str {
        &self.inner.config.database
    }

    fn container_link(&self, container: &str) -> String {
        format!("dbs/{}/colls/{}", self.database(), container)
    }

    fn signed(
        &self,
        method: Method,
        url: Url,
        resource_type: &str,
        resource_link: &str,
    ) -> Result<RequestBuilder, NativeError> {
        let date = rfc1123_now();
        let auth = authorization(
            &self.inner.key,
            method.as_str(),
            resource_type,
            resource_link,
            &date,
        )?;
        Ok(self
            .inner
            .http
            .request(method, url)
            .header("authorization", auth)
            .header("x-ms-date", date)
            .header("x-ms-version", API_VERSION)
            .timeout(DEFAULT_REQUEST_TIMEOUT))
    }

    fn docs_url(&self, container: &str) -> Result<Url, NativeError> {
        join_url(
            &self.inner.base,
            &["dbs", self.database(), "colls", container, "docs"],
        )
    }

    fn doc_url(&self, container: &str, id: &str) -> Result<Url, NativeError> {
        join_url(
            &self.inner.base,
            &["dbs", self.database(), "colls", container, "docs", id],
        )
    }

    /// Probe the configured database.
    async fn probe(&self) -> Result<(), NativeError> {
        let url = join_url(&self.inner.base, &["dbs", self.database()])?;
        let link = format!("dbs/{}", self.database());
        let request = self.signed(Method::GET, url, "dbs", &link)?;
        check_status(request.send().await?).await?;
        Ok(())
    }

    /// Read every document of `container`, following continuation tokens.
    async fn read_records(
        &self,
        container: &str,
        filter: Option<&QueryPredicate>,
    ) -> Result<Vec<Record>, NativeError> {
        require_segment("path", container)?;
        let query = match filter {
            Some(predicate) => match translate(predicate, PROVIDER)? {
                NativeFilter::SqlWhere(clause) => Some(serde_json::to_vec(&json!({
                    "query": format!("SELECT * FROM c WHERE {clause}"),
                    "parameters": [],
                }))?),
                other => {
                    return Err(NativeError::protocol(format!(
                        "unexpected filter for {PROVIDER}: {other:?}"
                    )))
                }
            },
            None => None,
        };

        let url = self.docs_url(container)?;
        let link = self.container_link(container);
        let mut records = Vec::new();
        let mut continuation: Option<String> = None;
        let mut pages = 0usize;

        loop {
            let mut request = match &query {
                Some(body) => self
                    .signed(Method::POST, url.clone(), "docs", &link)?
                    .header("content-type", "application/query+json")
                    .header("x-ms-documentdb-isquery", "True")
                    .header("x-ms-documentdb-query-enablecrosspartition", "True")
                    .body(body.clone()),
                None => self.signed(Method::GET, url.clone(), "docs", &link)?,
            };
            if let Some(token) = &continuation {
                request = request.header(CONTINUATION_HEADER, token);
            }

            let response = check_status(request.send().await?).await?;
            continuation = response
                .headers()
                .get(CONTINUATION_HEADER)
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty())
                .map(str::to_string);
            records.extend(documents_from_page(json_body(response).await?)?);
            pages += 1;

            if continuation.is_none() {
                break;
            }
        }

        debug!(
            provider = %PROVIDER,
            path = %container,
            pages,
            count = records.len(),
            "Read documents"
        );
        Ok(records)
    }

    async fn upsert(
        &self,
        container: &str,
        id: &str,
        data: RecordData,
    ) -> Result<Record, NativeError> {
        require_segment("path", container)?;
        require_segment("id", id)?;

        let mut body = stamped(data, UPDATED_AT_FIELD);
        body.insert("id".to_string(), Value::String(id.to_string()));

        let url = self.docs_url(container)?;
        let link = self.container_link(container);
        let request = self
            .signed(Method::POST, url, "docs", &link)?
            .header("x-ms-documentdb-is-upsert", "True")
            .header("x-ms-documentdb-partitionkey", partition_key(id)?)
            .json(&body);
        let response = check_status(request.send().await?).await?;
        let stored = json_body(response).await?;

        debug!(provider = %PROVIDER, path = %container, id = %id, "Upserted document");
        Ok(returned_or_sent(stored, body))
    }

    async fn fetch(&self, container: &str, id: &str) -> Result<Record, NativeError> {
        let url = self.doc_url(container, id)?;
        let link = format!("{}/docs/{}", self.container_link(container), id);
        let request = self
            .signed(Method::GET, url, "docs", &link)?
            .header("x-ms-documentdb-partitionkey", partition_key(id)?);
        let response = check_status(request.send().await?).await?;
        Ok(document_to_record(json_body(response).await?))
    }

    /// Read, merge locally, then replace.
    ///
    /// Not atomic: a concurrent writer between the read and the replace loses
    /// its change.
    async fn merge(
        &self,
        container: &str,
        id: &str,
        data: RecordData,
    ) -> Result<Record, NativeError> {
        require_segment("path", container)?;
        require_segment("id", id)?;

        let existing = self.fetch(container, id).await?;
        let mut merged = existing.fields;
        merged.extend(data);
        let mut body = stamped(merged, UPDATED_AT_FIELD);
        body.insert("id".to_string(), Value::String(id.to_string()));

        let url = self.doc_url(container, id)?;
        let link = format!("{}/docs/{}", self.container_link(container), id);
        let request = self
            .signed(Method::PUT, url, "docs", &link)?
            .header("x-ms-documentdb-partitionkey", partition_key(id)?)
            .json(&body);
        let response = check_status(request.send().await?).await?;
        let stored = json_body(response).await?;

        debug!(provider = %PROVIDER, path = %container, id = %id, "Replaced document");
        Ok(returned_or_sent(stored, body))
    }

    async fn remove(&self, container: &str, id: &str) -> Result<(), NativeError> {
        require_segment("path", container)?;
        require_segment("id", id)?;

        let url = self.doc_url(container, id)?;
        let link = format!("{}/docs/{}", self.container_link(container), id);
        let request = self
            .signed(Method::DELETE, url, "docs", &link)?
            .header("x-ms-documentdb-partitionkey", partition_key(id)?);
        match check_status(request.send().await?).await {
            Ok(_) => {
                debug!(provider = %PROVIDER, path = %container, id = %id, "Deleted document");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!(
                    provider = %PROVIDER,
                    path = %container,
                    id = %id,
                    "Document already absent"
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// The static key acts as the session; the user is the account host.
    fn local_session(&self) -> Session {
        let host = self.inner.base.host_str().unwrap_or("localhost");
        Session {
            user: User::new(host).with_attribute("database", self.database()),
            token: Ulid::new().to_string(),
            refresh_token: None,
        }
    }
}

/// Prefer the document echoed by the server; fall back to what was sent.
fn returned_or_sent(stored: Value, sent: RecordData) -> Record {
    if stored.is_object() {
        document_to_record(stored)
    } else {
        Record::from_value("", Value::Object(sent))
    }
}

// ============================================================================
// PART 3: PollingRestStoreAdapter
// ============================================================================

pub struct PollingRestStoreAdapter {
    client: PollingRestClient,
}

impl PollingRestStoreAdapter {
    pub fn new(config: PollingRestStoreConfig, sessions: SessionStore) -> ConnectorResult<Self> {
        let client = PollingRestClient::new(config, sessions).map_err(|e| {
            NormalizedError::invalid_config(e).with_context("provider", PROVIDER.as_str())
        })?;
        Ok(Self { client })
    }

    fn sessions(&self) -> &SessionStore {
        &self.client.inner.sessions
    }
}

#[async_trait]
impl ProviderAdapter for PollingRestStoreAdapter {
    fn provider(&self) -> Provider {
        PROVIDER
    }

    async fn connect(&self) -> ConnectorResult<()> {
        let ctx = op_context(self.client.database(), None, None);
        self.client
            .probe()
            .await
            .map_err(|e| normalize(PROVIDER, Operation::Connect, e, &ctx))?;
        info!(provider = %PROVIDER, database = %self.client.database(), "Connected");
        Ok(())
    }

    async fn sign_in(&self) -> ConnectorResult<Session> {
        let session = self.client.local_session();
        self.sessions().put(PROVIDER, session.clone());
        info!(provider = %PROVIDER, user = %session.user.id, "Signed in");
        Ok(session)
    }

    async fn sign_out(&self) -> ConnectorResult<()> {
        self.sessions().remove(PROVIDER);
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
            .upsert(path, id, data)
            .await
            .map_err(|e| {
                normalize(PROVIDER, Operation::Write, e, &op_context(path, Some(id), None))
            })
    }

    async fn update(&self, path: &str, id: &str, data: RecordData) -> ConnectorResult<Record> {
        self.client
            .merge(path, id, data)
            .await
            .map_err(|e| {
                normalize(PROVIDER, Operation::Update, e, &op_context(path, Some(id), None))
            })
    }

    async fn delete(&self, path: &str, id: &str) -> ConnectorResult<Deleted> {
        self.client
            .remove(path, id)
            .await
            .map_err(|e| {
                normalize(PROVIDER, Operation::Delete, e, &op_context(path, Some(id), None))
            })?;
        Ok(Deleted::new(id))
    }

    fn snapshots(&self, path: &str) -> ConnectorResult<SnapshotStream> {
        let client = self.client.clone();
        let every = client.inner.config.poll_interval();
        let container = path.to_string();

        SnapshotStream::spawn(PROVIDER, path, move |sink| {
            poll_every(sink, every, move || {
                let client = client.clone();
                let container = container.clone();
                async move { client.read_records(&container, None).await }
            })
        })
    }
}

/// Run `read` immediately, then once per `every`, until the sink closes.
///
/// Reads never overlap: a slow read pushes the next tick back.
async fn poll_every<F, Fut>(sink: SnapshotSink, every: Duration, mut read: F)
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Vec<Record>, NativeError>> + Send + 'static,
{
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = sink.cancel_token().cancelled() => break,
            _ = ticker.tick() => {}
        }
        let delivered = match read().await {
            Ok(records) => sink.deliver_records(records).await,
            Err(e) => sink.deliver_error(e).await,
        };
        if !delivered {
            break;
        }
    }
    debug!(provider = %PROVIDER, path = %sink.path(), "Polling stopped");
}
