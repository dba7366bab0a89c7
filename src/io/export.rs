//! Batched JSON export to the remote analytics endpoint
//!
//! Records are posted in chunks of `CHUNK_SIZE` as a flat JSON array with an
//! `X-Api-Key` header. Any failed chunk fails the whole call; there is no
//! partial success, so the caller keeps the session queued and retries it
//! later. Chunks already accepted before the failure are sent again on retry.

use reqwest::header::{CONTENT_TYPE, HeaderValue};
use reqwest::Client;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Records per POST
pub const CHUNK_SIZE: usize = 20;

/// Per-request timeout
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Header carrying the API key
pub const API_KEY_HEADER: &str = "X-Api-Key";

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("unable to marshal chunk {chunk} as JSON: {source}")]
    Marshal {
        chunk: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("POST {uri} failed: {source}")]
    Request {
        uri: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("POST {uri} returned status {status}")]
    Status { uri: String, status: u16 },

    #[error("unexpected response from {uri}: {reason}")]
    Response { uri: String, reason: String },
}

/// Chunked HTTP exporter
///
/// Holds the correlation counter; it only ever increases for the lifetime of
/// the exporter.
pub struct BatchExporter {
    client: Client,
    api_key: String,
    chunk_size: usize,
    exports: AtomicU64,
    slash_warned: AtomicBool,
}

impl BatchExporter {
    pub fn new(api_key: &str) -> Result<Self, ExportError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(ExportError::Client)?;

        Ok(Self {
            client,
            api_key: api_key.to_string(),
            chunk_size: CHUNK_SIZE,
            exports: AtomicU64::new(0),
            slash_warned: AtomicBool::new(false),
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Correlation index of the last successful export (0 before any)
    pub fn last_index(&self) -> u64 {
        self.exports.load(Ordering::Relaxed)
    }

    /// POST `records` to `endpoint` in chunks
    ///
    /// Returns the correlation index for this export. An empty slice sends
    /// nothing and still counts as a successful export.
    pub async fn export<R>(&self, endpoint: &str, records: &[R]) -> Result<u64, ExportError>
    where
        R: Serialize + Sync,
    {
        self.check_trailing_slash(endpoint);

        // Marshal everything before the first request goes out
        let bodies = records
            .chunks(self.chunk_size)
            .enumerate()
            .map(|(chunk, slice)| {
                serde_json::to_vec(slice).map_err(|source| ExportError::Marshal { chunk, source })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let total_chunks = bodies.len();
        for (chunk, body) in bodies.into_iter().enumerate() {
            let records_in_chunk =
                (records.len() - chunk * self.chunk_size).min(self.chunk_size);
            self.post_chunk(endpoint, body).await?;
            debug!(
                endpoint = %endpoint,
                chunk = chunk,
                chunks = total_chunks,
                records = records_in_chunk,
                "export_chunk_sent"
            );
        }

        let index = self.exports.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            endpoint = %endpoint,
            records = records.len(),
            chunks = total_chunks,
            index = index,
            "export_complete"
        );
        Ok(index)
    }

    async fn post_chunk(&self, endpoint: &str, body: Vec<u8>) -> Result<(), ExportError> {
        let response = self
            .client
            .post(endpoint)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .header(API_KEY_HEADER, &self.api_key)
            .body(body)
            .send()
            .await
            .map_err(|source| ExportError::Request { uri: endpoint.to_string(), source })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ExportError::Status { uri: endpoint.to_string(), status: status.as_u16() });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|source| ExportError::Request { uri: endpoint.to_string(), source })?;

        match serde_json::from_slice::<serde_json::Value>(&bytes) {
            Ok(serde_json::Value::Object(reply)) => {
                debug!(endpoint = %endpoint, keys = reply.len(), "export_reply");
                Ok(())
            }
            Ok(other) => Err(ExportError::Response {
                uri: endpoint.to_string(),
                reason: format!("expected a JSON object, got {}", json_kind(&other)),
            }),
            Err(e) => Err(ExportError::Response { uri: endpoint.to_string(), reason: e.to_string() }),
        }
    }

    fn check_trailing_slash(&self, endpoint: &str) {
        if !endpoint.ends_with('/') && !self.slash_warned.swap(true, Ordering::Relaxed) {
            warn!(endpoint = %endpoint, "export_endpoint_missing_trailing_slash");
        }
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::Record;
    use crate::io::mock_collector::{serve, CollectorState};
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio::sync::watch;

    async fn collector(state: CollectorState) -> (String, Arc<CollectorState>, watch::Sender<bool>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(state);
        let (kill_tx, kill_rx) = watch::channel(false);
        tokio::spawn(serve(listener, state.clone(), kill_rx));
        (format!("http://{addr}/durations/"), state, kill_tx)
    }

    fn records(n: usize) -> Vec<Record> {
        (0..n)
            .map(|i| {
                let mut record = Record::new();
                record.insert("patron_index".to_string(), i.to_string());
                record
            })
            .collect()
    }

    struct Unmarshalable;

    impl Serialize for Unmarshalable {
        fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("refusing to serialize"))
        }
    }

    #[tokio::test]
    async fn test_chunks_of_twenty() {
        let (endpoint, state, _kill) = collector(CollectorState::new(Some("secret"))).await;
        let exporter = BatchExporter::new("secret").unwrap();

        let index = exporter.export(&endpoint, &records(45)).await.unwrap();
        assert_eq!(index, 1);
        assert_eq!(state.chunk_sizes(), vec![20, 20, 5]);

        let index = exporter.export(&endpoint, &records(3)).await.unwrap();
        assert_eq!(index, 2);
        assert_eq!(exporter.last_index(), 2);
    }

    #[tokio::test]
    async fn test_non_2xx_fails_whole_export() {
        let (endpoint, state, _kill) =
            collector(CollectorState::new(Some("secret")).failing_on(2)).await;
        let exporter = BatchExporter::new("secret").unwrap();

        let err = exporter.export(&endpoint, &records(45)).await.unwrap_err();
        assert!(matches!(err, ExportError::Status { status: 500, .. }));
        // Third chunk never sent
        assert_eq!(state.chunk_sizes(), vec![20, 20]);
        assert_eq!(exporter.last_index(), 0);
    }

    #[tokio::test]
    async fn test_wrong_key_rejected() {
        let (endpoint, _state, _kill) = collector(CollectorState::new(Some("secret"))).await;
        let exporter = BatchExporter::new("guess").unwrap();

        let err = exporter.export(&endpoint, &records(1)).await.unwrap_err();
        assert!(matches!(err, ExportError::Status { status: 401, .. }));
    }

    #[tokio::test]
    async fn test_non_object_reply_fails() {
        let (endpoint, _state, _kill) =
            collector(CollectorState::new(None).replying_with_array()).await;
        let exporter = BatchExporter::new("secret").unwrap();

        let err = exporter.export(&endpoint, &records(2)).await.unwrap_err();
        assert!(matches!(err, ExportError::Response { .. }));
    }

    #[tokio::test]
    async fn test_marshal_failure_sends_nothing() {
        let (endpoint, state, _kill) = collector(CollectorState::new(None)).await;
        let exporter = BatchExporter::new("secret").unwrap();

        let err = exporter.export(&endpoint, &[Unmarshalable]).await.unwrap_err();
        assert!(matches!(err, ExportError::Marshal { chunk: 0, .. }));
        assert!(state.chunk_sizes().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_request_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let exporter = BatchExporter::new("secret").unwrap();
        let err = exporter.export(&format!("http://{addr}/"), &records(1)).await.unwrap_err();
        assert!(matches!(err, ExportError::Request { .. }));
    }

    #[test]
    fn test_trailing_slash_warning_latches() {
        let exporter = BatchExporter::new("secret").unwrap();
        exporter.check_trailing_slash("https://example.org/durations/");
        assert!(!exporter.slash_warned.load(Ordering::Relaxed));
        exporter.check_trailing_slash("https://example.org/durations");
        assert!(exporter.slash_warned.load(Ordering::Relaxed));
    }
}
