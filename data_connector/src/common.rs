//! Helpers shared by the HTTP-based adapters.

use std::time::Duration;

use serde_json::{Map as JsonMap, Value};
use url::Url;

use crate::{
    core::{now_rfc3339, Record, RecordData},
    error::NativeError,
};

/// Bodies longer than this are truncated in error messages.
const MAX_ERROR_BODY_CHARS: usize = 512;

/// Maximum SSE buffer size (1 MB) before a stream is considered malformed.
const MAX_SSE_BUFFER_SIZE: usize = 1024 * 1024;

pub(crate) const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) fn build_http_client() -> Result<reqwest::Client, NativeError> {
    Ok(reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()?)
}

/// Parse a configured base URL (already validated by the config layer).
pub(crate) fn parse_base_url(raw: &str) -> Result<Url, NativeError> {
    Url::parse(raw.trim()).map_err(|e| NativeError::protocol(format!("invalid base URL: {e}")))
}

/// Append percent-encoded path segments to `base`.
pub(crate) fn join_url(base: &Url, segments: &[&str]) -> Result<Url, NativeError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| NativeError::protocol(format!("{base} cannot be a base URL")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Reject empty collection/table/container names and ids before any request.
pub(crate) fn require_segment(kind: &str, value: &str) -> Result<(), NativeError> {
    if value.trim().is_empty() {
        return Err(NativeError::protocol(format!("{kind} must not be empty")));
    }
    Ok(())
}

/// Fail with [`NativeError::Status`] when the response is not a 2xx.
pub(crate) async fn check_status(
    response: reqwest::Response,
) -> Result<reqwest::Response, NativeError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(NativeError::Status {
        status: status.as_u16(),
        body: truncate(&body),
    })
}

fn truncate(body: &str) -> String {
    if body.chars().count() <= MAX_ERROR_BODY_CHARS {
        return body.to_string();
    }
    let mut out: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
    out.push_str("...");
    out
}

/// Read a JSON body, treating an empty body as `null`.
pub(crate) async fn json_body(response: reqwest::Response) -> Result<Value, NativeError> {
    let bytes = response.bytes().await?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_slice(&bytes)?)
}

/// Copy `data` and stamp the last-modified field.
pub(crate) fn stamped(data: RecordData, field: &str) -> RecordData {
    let mut data = data;
    data.insert(field.to_string(), Value::String(now_rfc3339()));
    data
}

/// Materialize a keyed object (`{id: {...}, ...}`) into records.
///
/// `null` becomes an empty set; arrays are keyed by index and `null` holes are skipped.
pub(crate) fn records_from_keyed(value: Value) -> Vec<Record> {
    match value {
        Value::Null => Vec::new(),
        Value::Object(map) => map
            .into_iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(key, v)| Record::from_value(&key, v))
            .collect(),
        Value::Array(items) => items
            .into_iter()
            .enumerate()
            .filter(|(_, v)| !v.is_null())
            .map(|(i, v)| Record::from_value(&i.to_string(), v))
            .collect(),
        other => vec![Record::from_value("value", other)],
    }
}

/// Materialize a JSON array of row objects into records.
pub(crate) fn records_from_rows(value: Value) -> Result<Vec<Record>, NativeError> {
    match value {
        Value::Array(rows) => Ok(rows
            .into_iter()
            .enumerate()
            .map(|(i, row)| Record::from_value(&i.to_string(), row))
            .collect()),
        Value::Null => Ok(Vec::new()),
        other => Err(NativeError::protocol(format!(
            "expected an array of rows, got {other}"
        ))),
    }
}

/// Remove fields from an object in place.
pub(crate) fn strip_fields(map: &mut JsonMap<String, Value>, fields: &[&str]) {
    for field in fields {
        map.remove(*field);
    }
}

/// Incremental `text/event-stream` decoder.
///
/// Frames look like:
/// ```text
/// event: put
/// data: {"path":"/","data":{...}}
/// ```
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    buffer: String,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain every complete frame as `(event, data)`.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<(String, String)>, NativeError> {
        let text = String::from_utf8_lossy(chunk);
        self.buffer.push_str(&text.replace("\r\n", "\n"));

        if self.buffer.len() > MAX_SSE_BUFFER_SIZE {
            return Err(NativeError::protocol(format!(
                "SSE buffer exceeded maximum size ({MAX_SSE_BUFFER_SIZE} bytes)"
            )));
        }

        let mut frames = Vec::new();
        while let Some(frame_end) = self.buffer.find("\n\n") {
            let frame: String = self.buffer.drain(..frame_end + 2).collect();
            if let Some(parsed) = parse_sse_frame(&frame[..frame.len() - 2]) {
                frames.push(parsed);
            }
        }
        Ok(frames)
    }
}

fn parse_sse_frame(frame: &str) -> Option<(String, String)> {
    let mut event_type = String::new();
    let mut data_lines = Vec::new();

    for line in frame.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        if let Some(value) = line.strip_prefix("event:") {
            event_type = value.trim().to_string();
        } else if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.trim().to_string());
        }
    }

    if event_type.is_empty() {
        return None;
    }
    Some((event_type, data_lines.join("\n")))
}
