//! Local stand-in for the remote analytics endpoint
//!
//! Accepts `POST` of a JSON array of records, checks the API key when one is
//! configured, remembers each chunk's size and answers with a JSON object.
//! Used by the `mock-collector` binary and the export tests.
//!
//! Routes:
//! - `POST <any path>` - accept a chunk
//! - `GET /health` - liveness

use crate::io::export::API_KEY_HEADER;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Shared collector state
pub struct CollectorState {
    api_key: Option<String>,
    fail_on_request: Option<usize>,
    reply_with_array: bool,
    chunks: Mutex<Vec<usize>>,
    records_total: AtomicU64,
}

impl CollectorState {
    /// `api_key: None` accepts any key
    pub fn new(api_key: Option<&str>) -> Self {
        Self {
            api_key: api_key.map(str::to_string),
            fail_on_request: None,
            reply_with_array: false,
            chunks: Mutex::new(Vec::new()),
            records_total: AtomicU64::new(0),
        }
    }

    /// Answer 500 to the nth accepted chunk (1-based)
    pub fn failing_on(mut self, request: usize) -> Self {
        self.fail_on_request = Some(request);
        self
    }

    /// Answer with a JSON array instead of an object
    pub fn replying_with_array(mut self) -> Self {
        self.reply_with_array = true;
        self
    }

    /// Sizes of the chunks received so far, in arrival order
    pub fn chunk_sizes(&self) -> Vec<usize> {
        self.chunks.lock().clone()
    }

    pub fn records_total(&self) -> u64 {
        self.records_total.load(Ordering::Relaxed)
    }
}

fn respond(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .expect("static response should not fail")
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<CollectorState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    match req.method() {
        &Method::GET if req.uri().path() == "/health" => {
            return Ok(respond(StatusCode::OK, r#"{"ok":true}"#.to_string()));
        }
        &Method::POST => {}
        _ => return Ok(respond(StatusCode::NOT_FOUND, r#"{"error":"not_found"}"#.to_string())),
    }

    if let Some(expected) = &state.api_key {
        let presented = req.headers().get(API_KEY_HEADER).and_then(|v| v.to_str().ok());
        if presented != Some(expected.as_str()) {
            warn!(path = %req.uri().path(), "collector_bad_api_key");
            return Ok(respond(StatusCode::UNAUTHORIZED, r#"{"error":"bad_api_key"}"#.to_string()));
        }
    }

    let path = req.uri().path().to_string();
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(error = %e, "collector_body_read_failed");
            return Ok(respond(StatusCode::BAD_REQUEST, r#"{"error":"body"}"#.to_string()));
        }
    };

    let records: Vec<serde_json::Map<String, serde_json::Value>> =
        match serde_json::from_slice(&body) {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "collector_bad_payload");
                return Ok(respond(
                    StatusCode::BAD_REQUEST,
                    r#"{"error":"expected a JSON array of objects"}"#.to_string(),
                ));
            }
        };

    let request_no = {
        let mut chunks = state.chunks.lock();
        chunks.push(records.len());
        chunks.len()
    };
    let total = state.records_total.fetch_add(records.len() as u64, Ordering::Relaxed)
        + records.len() as u64;
    info!(path = %path, request = request_no, records = records.len(), total = total, "collector_chunk");

    if state.fail_on_request == Some(request_no) {
        return Ok(respond(StatusCode::INTERNAL_SERVER_ERROR, r#"{"error":"injected"}"#.to_string()));
    }
    if state.reply_with_array {
        return Ok(respond(StatusCode::OK, "[]".to_string()));
    }
    Ok(respond(
        StatusCode::OK,
        format!(r#"{{"result":"ok","received":{},"magic_index":{}}}"#, records.len(), request_no),
    ))
}

/// Serve on `listener` until the shutdown signal flips to true
pub async fn serve(
    listener: TcpListener,
    state: Arc<CollectorState>,
    mut shutdown: watch::Receiver<bool>,
) {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "collector_started");
    }

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let state = state.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let state = state.clone();
                                async move { handle_request(req, state).await }
                            });

                            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                                error!(error = %e, "collector_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "collector_accept_error");
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("collector_shutdown");
                    return;
                }
            }
        }
    }
}
