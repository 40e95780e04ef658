//! Polling REST store against a mocked document API

mod common;

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use common::{data, eventually, init_tracing, polling_config};
use data_auth_connector::{
    create_connector, ConnectedClient, Operator, QueryPredicate, ReadOptions,
};
use futures::StreamExt;
use serde_json::json;
use wiremock::{
    matchers::{body_json, body_partial_json, header, header_exists, method, path},
    Mock, MockServer, ResponseTemplate,
};

const DOCS: &str = "/dbs/main/colls/companies/docs";

#[tokio::test]
async fn test_connect_probes_database_with_signed_headers() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/dbs/main"))
        .and(header_exists("authorization"))
        .and(header_exists("x-ms-date"))
        .and(header("x-ms-version", "2018-12-31"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "main"})))
        .expect(1)
        .mount(&server)
        .await;

    let connector = create_connector(&polling_config(&server.uri(), 5_000)).unwrap();
    connector.connect().await.unwrap();

    let requests = server.received_requests().await.unwrap();
    let auth = requests[0].headers.get("authorization").unwrap().to_str().unwrap();
    assert!(auth.starts_with("type%3Dmaster%26ver%3D1.0%26sig%3D"));
}

#[tokio::test]
async fn test_connect_failure_is_normalized() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/dbs/main"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad signature"))
        .mount(&server)
        .await;

    let connector = create_connector(&polling_config(&server.uri(), 5_000)).unwrap();
    let err = connector.connect().await.unwrap_err();
    assert_eq!(err.code, "POLLING_REST_STORE_CONNECT_ERROR");
    assert_eq!(err.provider, "pollingRestStore");
    assert_eq!(err.context["status"], 401);
}

async fn connected(server: &MockServer) -> ConnectedClient {
    connected_polling_every(server, 5_000).await
}

async fn connected_polling_every(server: &MockServer, poll_interval_ms: u64) -> ConnectedClient {
    Mock::given(method("GET"))
        .and(path("/dbs/main"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "main"})))
        .mount(server)
        .await;
    create_connector(&polling_config(&server.uri(), poll_interval_ms))
        .unwrap()
        .connect()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_read_follows_continuation_tokens() {
    let server = MockServer::start().await;
    let client = connected(&server).await;

    // Registered first so it wins for the follow-up page.
    Mock::given(method("GET"))
        .and(path(DOCS))
        .and(header("x-ms-continuation", "page-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "Documents": [{"id": "c2", "name": "Beta", "_ts": 2}],
            "_count": 1
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(DOCS))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-ms-continuation", "page-2")
                .set_body_json(json!({
                    "Documents": [{"id": "c1", "name": "Acme", "_rid": "r", "_etag": "e"}],
                    "_count": 1
                })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let records = client.db.read("companies", ReadOptions::all()).await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].id, "c1");
    assert_eq!(records[1].id, "c2");
    assert!(records[0].get("_rid").is_none());
    assert!(records[0].get("_etag").is_none());
    assert!(records[1].get("_ts").is_none());
}

#[tokio::test]
async fn test_filtered_read_posts_sql_query() {
    let server = MockServer::start().await;
    let client = connected(&server).await;

    Mock::given(method("POST"))
        .and(path(DOCS))
        .and(header("content-type", "application/query+json"))
        .and(header("x-ms-documentdb-isquery", "True"))
        .and(body_json(json!({
            "query": "SELECT * FROM c WHERE c['city'] = 'Oslo'",
            "parameters": []
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "Documents": [{"id": "c1", "city": "Oslo"}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let predicate = QueryPredicate::new("city", Operator::Eq, "Oslo");
    let records = client.db.query("companies", predicate).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].get("city"), Some(&json!("Oslo")));
}

#[tokio::test]
async fn test_unsupported_literal_is_rejected_without_a_request() {
    let server = MockServer::start().await;
    let client = connected(&server).await;

    let predicate = QueryPredicate::new("active", Operator::Eq, true);
    let err = client.db.query("companies", predicate).await.unwrap_err();
    assert_eq!(err.code, "UNSUPPORTED_OPERATOR");
    assert_eq!(err.context["path"], "companies");

    let requests = server.received_requests().await.unwrap();
    assert!(requests.iter().all(|r| r.url.path() != DOCS));
}

#[tokio::test]
async fn test_write_upserts_and_stamps_updated_at() {
    let server = MockServer::start().await;
    let client = connected(&server).await;

    Mock::given(method("POST"))
        .and(path(DOCS))
        .and(header("x-ms-documentdb-is-upsert", "True"))
        .and(header("x-ms-documentdb-partitionkey", "[\"c1\"]"))
        .and(body_partial_json(json!({"id": "c1", "name": "Acme"})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": "c1",
            "name": "Acme",
            "updatedAt": "2030-01-01T00:00:00.000Z",
            "_etag": "\"1\""
        })))
        .expect(1)
        .mount(&server)
        .await;

    let record = client
        .db
        .write("companies", "c1", data(json!({"name": "Acme"})))
        .await
        .unwrap();
    assert_eq!(record.id, "c1");
    assert!(record.get("_etag").is_none());

    let requests = server.received_requests().await.unwrap();
    let sent: serde_json::Value = requests
        .iter()
        .find(|r| r.method.as_str() == "POST")
        .map(|r| serde_json::from_slice(&r.body).unwrap())
        .unwrap();
    assert!(sent["updatedAt"].as_str().unwrap().ends_with('Z'));
}

#[tokio::test]
async fn test_update_reads_merges_and_replaces() {
    let server = MockServer::start().await;
    let client = connected(&server).await;

    Mock::given(method("GET"))
        .and(path(format!("{DOCS}/c1")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "c1",
            "name": "Acme",
            "size": 3,
            "_rid": "r",
            "_ts": 10
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path(format!("{DOCS}/c1")))
        .and(body_partial_json(json!({"id": "c1", "name": "Acme", "size": 4, "city": "Oslo"})))
        .respond_with(|req: &wiremock::Request| {
            let body: serde_json::Value = serde_json::from_slice(&req.body).unwrap();
            ResponseTemplate::new(200).set_body_json(body)
        })
        .expect(1)
        .mount(&server)
        .await;

    let record = client
        .db
        .update("companies", "c1", data(json!({"size": 4, "city": "Oslo"})))
        .await
        .unwrap();
    assert_eq!(record.get("name"), Some(&json!("Acme")));
    assert_eq!(record.get("size"), Some(&json!(4)));
    assert_eq!(record.get("city"), Some(&json!("Oslo")));
    assert!(record.get("updatedAt").is_some());
    assert!(record.get("_rid").is_none());
}

#[tokio::test]
async fn test_update_of_missing_document_fails() {
    let server = MockServer::start().await;
    let client = connected(&server).await;

    Mock::given(method("GET"))
        .and(path(format!("{DOCS}/ghost")))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let err = client
        .db
        .update("companies", "ghost", data(json!({"size": 1})))
        .await
        .unwrap_err();
    assert_eq!(err.code, "POLLING_REST_STORE_UPDATE_ERROR");
    assert_eq!(err.context["id"], "ghost");
    assert_eq!(err.context["status"], 404);
}

#[tokio::test]
async fn test_delete_swallows_not_found() {
    let server = MockServer::start().await;
    let client = connected(&server).await;

    Mock::given(method("DELETE"))
        .and(path(format!("{DOCS}/c1")))
        .respond_with(ResponseTemplate::new(204))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path(format!("{DOCS}/c1")))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let first = client.db.delete("companies", "c1").await.unwrap();
    let second = client.db.delete("companies", "c1").await.unwrap();
    assert!(first.deleted);
    assert_eq!(second.id, "c1");
    assert!(second.deleted);
}

#[tokio::test]
async fn test_backend_failures_map_to_operation_codes() {
    let server = MockServer::start().await;
    let client = connected(&server).await;

    Mock::given(path(DOCS))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    Mock::given(path(format!("{DOCS}/c1")))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let read = client.db.read("companies", ReadOptions::all()).await.unwrap_err();
    assert_eq!(read.code, "POLLING_REST_STORE_READ_ERROR");
    let write = client
        .db
        .write("companies", "c1", data(json!({"a": 1})))
        .await
        .unwrap_err();
    assert_eq!(write.code, "POLLING_REST_STORE_WRITE_ERROR");
    let update = client
        .db
        .update("companies", "c1", data(json!({"a": 1})))
        .await
        .unwrap_err();
    assert_eq!(update.code, "POLLING_REST_STORE_UPDATE_ERROR");
    let delete = client.db.delete("companies", "c1").await.unwrap_err();
    assert_eq!(delete.code, "POLLING_REST_STORE_DELETE_ERROR");

    for err in [&read, &write, &update, &delete] {
        assert_eq!(err.context["path"], "companies");
        assert_eq!(err.context["status"], 503);
    }
}

#[tokio::test]
async fn test_polling_subscription_reads_until_unsubscribed() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(DOCS))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "Documents": [{"id": "c1"}, {"id": "c2"}]
        })))
        .mount(&server)
        .await;

    let client = connected_polling_every(&server, 1_000).await;
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let subscription = client
        .db
        .on_snapshot("companies", move |result| {
            if matches!(result, Ok(ref records) if records.len() == 2) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();

    // The first read does not wait for the interval.
    assert!(eventually(Duration::from_millis(500), || calls.load(Ordering::SeqCst) == 1).await);

    subscription.unsubscribe();
    subscription.unsubscribe();
    tokio::time::sleep(Duration::from_millis(1_200)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failed_poll_delivers_error_and_keeps_polling() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(DOCS))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(DOCS))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"Documents": []})))
        .mount(&server)
        .await;

    let client = connected_polling_every(&server, 30).await;
    let mut stream = client.db.snapshots("companies").unwrap();

    let first = stream.next().await.unwrap().unwrap_err();
    assert_eq!(first.code, "POLLING_REST_STORE_SNAPSHOT_ERROR");
    assert_eq!(first.context["path"], "companies");
    let second = stream.next().await.unwrap().unwrap();
    assert!(second.is_empty());

    stream.close();
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn test_empty_subscription_path_is_a_setup_error() {
    let server = MockServer::start().await;
    let client = connected(&server).await;
    let err = client.db.on_snapshot("", |_| {}).unwrap_err();
    assert_eq!(err.code, "POLLING_REST_STORE_SNAPSHOT_SETUP_ERROR");
}
