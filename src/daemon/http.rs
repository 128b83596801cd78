//! Plain HTTP batch endpoint.
//!
//! - `POST /predict[?k=..&threshold=..&model=..]` with a JSON array of texts
//!   answers a JSON array of `[labels, probs]` pairs in input order.
//! - `GET /health` answers the health status as JSON.
//!
//! One request per connection (`Connection: close`). Requests share the
//! session limiter with the streaming front end.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::core::{SHUTDOWN_GRACE, ServerState};
use super::protocol::ErrorResponse;
use super::session::cancelled;
use crate::error::ServeError;
use crate::inference::{self, DEFAULT_K, DEFAULT_THRESHOLD, PredictionResult};

const MAX_HEADER_BYTES: usize = 16 * 1024;
const READ_TIMEOUT: Duration = Duration::from_secs(30);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    query: Vec<(String, String)>,
    body: Vec<u8>,
}

/// A request refused before routing.
#[derive(Debug)]
struct Rejection {
    status: u16,
    message: String,
}

impl Rejection {
    fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<io::Error> for Rejection {
    fn from(e: io::Error) -> Self {
        Self::new(400, format!("failed to read request: {e}"))
    }
}

struct Response {
    status: u16,
    body: Vec<u8>,
}

impl Response {
    fn json<T: Serialize>(status: u16, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self { status, body },
            Err(e) => Self::error(500, "internal", &e.to_string()),
        }
    }

    fn error(status: u16, code: &str, message: &str) -> Self {
        let body = serde_json::json!({ "code": code, "message": message });
        Self {
            status,
            body: body.to_string().into_bytes(),
        }
    }

    fn from_serve_error(e: &ServeError) -> Self {
        Self::json(status_for(e), &ErrorResponse::from(e))
    }

    fn into_bytes(self) -> Vec<u8> {
        build_response(self.status, "application/json", self.body)
    }
}

fn status_for(e: &ServeError) -> u16 {
    match e {
        ServeError::InvalidArgument(_) | ServeError::VersionMismatch { .. } => 400,
        ServeError::NotFound(_) => 404,
        ServeError::ModelUnavailable(_)
        | ServeError::ResourceExhausted(_)
        | ServeError::Cancelled => 503,
        ServeError::DeadlineExceeded(_) => 504,
        ServeError::Load(_) | ServeError::Transport(_) | ServeError::Internal(_) => 500,
    }
}

/// Build an HTTP response with the given status code, content type, and body.
fn build_response(status: u16, content_type: &str, body: Vec<u8>) -> Vec<u8> {
    let status_text = match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    };

    let headers = format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: {}\r\n\
         Content-Length: {}\r\n\
         Cache-Control: no-cache\r\n\
         Connection: close\r\n\
         \r\n",
        status,
        status_text,
        content_type,
        body.len()
    );

    let mut response = headers.into_bytes();
    response.extend(body);
    response
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => spaced,
    }
}

fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (decode_component(key), decode_component(value))
        })
        .collect()
}

/// Read one request. `Ok(None)` when the peer closed without sending one.
async fn read_request<R>(reader: &mut R, max_body: usize) -> Result<Option<HttpRequest>, Rejection>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        if let Some(pos) = find_header_end(&buf) {
            break pos;
        }
        if buf.len() > MAX_HEADER_BYTES {
            return Err(Rejection::new(400, "request headers too large"));
        }
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(Rejection::new(400, "connection closed mid-request"));
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = std::str::from_utf8(&buf[..header_end])
        .map_err(|_| Rejection::new(400, "request head is not UTF-8"))?;
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next().unwrap_or("").split_whitespace();
    let (Some(method), Some(target)) = (request_line.next(), request_line.next()) else {
        return Err(Rejection::new(400, "malformed request line"));
    };

    let mut content_length = 0usize;
    for line in lines {
        if let Some((name, value)) = line.split_once(':')
            && name.trim().eq_ignore_ascii_case("content-length")
        {
            content_length = value
                .trim()
                .parse()
                .map_err(|_| Rejection::new(400, "invalid Content-Length"))?;
        }
    }
    if content_length > max_body {
        return Err(Rejection::new(
            413,
            format!("body of {content_length} bytes exceeds limit of {max_body} bytes"),
        ));
    }

    let mut body = buf[header_end + 4..].to_vec();
    if body.len() < content_length {
        let start = body.len();
        body.resize(content_length, 0);
        reader.read_exact(&mut body[start..]).await?;
    }
    body.truncate(content_length);

    let (path, query) = target.split_once('?').unwrap_or((target, ""));
    Ok(Some(HttpRequest {
        method: method.to_string(),
        path: path.to_string(),
        query: parse_query(query),
        body,
    }))
}

#[derive(Debug, PartialEq)]
struct PredictParams {
    k: i32,
    threshold: f32,
    model: Option<String>,
}

impl PredictParams {
    fn from_query(query: &[(String, String)]) -> Result<Self, ServeError> {
        let mut params = Self {
            k: DEFAULT_K,
            threshold: DEFAULT_THRESHOLD,
            model: None,
        };
        for (key, value) in query {
            match key.as_str() {
                "k" => {
                    params.k = value
                        .parse()
                        .map_err(|_| ServeError::InvalidArgument(format!("k is not an integer: {value:?}")))?;
                }
                "threshold" => {
                    params.threshold = value.parse().map_err(|_| {
                        ServeError::InvalidArgument(format!("threshold is not a number: {value:?}"))
                    })?;
                }
                "model" if !value.is_empty() => params.model = Some(value.clone()),
                _ => {}
            }
        }
        Ok(params)
    }
}

async fn predict(
    state: &ServerState,
    req: &HttpRequest,
) -> Result<Vec<(Vec<String>, Vec<f32>)>, ServeError> {
    let PredictParams {
        k,
        threshold,
        model,
    } = PredictParams::from_query(&req.query)?;
    inference::validate(k, threshold)?;
    let texts: Vec<String> = serde_json::from_slice(&req.body).map_err(|e| {
        ServeError::InvalidArgument(format!("body must be a JSON array of strings: {e}"))
    })?;

    let _permit = state.limiter().try_admit().ok_or_else(|| {
        ServeError::ResourceExhausted(format!(
            "server is at its limit of {} sessions",
            state.limiter().max()
        ))
    })?;
    let handle = state.store().resolve(model.as_deref())?;

    let count = texts.len() as u64;
    debug!(model = %handle.name(), texts = count, k, threshold, "HTTP batch predict");
    let task = tokio::task::spawn_blocking(move || {
        inference::predict_batch(&handle, &texts, k, threshold)
    });
    let joined = match state.options().request_timeout {
        Some(limit) => tokio::time::timeout(limit, task)
            .await
            .map_err(|_| ServeError::DeadlineExceeded(limit))?,
        None => task.await,
    };
    let results = joined.map_err(|e| ServeError::Internal(format!("inference task failed: {e}")))??;

    state.record_predictions(count);
    Ok(results.into_iter().map(PredictionResult::into_pair).collect())
}

async fn route(state: &ServerState, req: HttpRequest) -> Response {
    match (req.method.as_str(), req.path.as_str()) {
        ("GET", "/health") => Response::json(200, &state.health()),
        ("POST", "/predict") => match predict(state, &req).await {
            Ok(results) => Response::json(200, &results),
            Err(e) => {
                debug!(code = %e.code(), error = %e, "HTTP predict failed");
                Response::from_serve_error(&e)
            }
        },
        (_, "/health" | "/predict") => Response::error(
            405,
            "method_not_allowed",
            &format!("{} is not allowed on {}", req.method, req.path),
        ),
        _ => Response::error(404, "not_found", &format!("no route for {}", req.path)),
    }
}

async fn handle_connection(state: Arc<ServerState>, mut stream: TcpStream, peer: SocketAddr) {
    let max = state.options().max_message_bytes;
    let (response, rejected) =
        match tokio::time::timeout(READ_TIMEOUT, read_request(&mut stream, max)).await {
            Err(_) => {
                debug!(peer = %peer, "Timed out reading HTTP request");
                return;
            }
            Ok(Ok(None)) => return,
            Ok(Ok(Some(req))) => (route(&state, req).await, false),
            Ok(Err(rejection)) => {
                debug!(peer = %peer, status = rejection.status, reason = %rejection.message, "Rejected HTTP request");
                let code = if rejection.status == 413 {
                    "resource_exhausted"
                } else {
                    "invalid_argument"
                };
                (Response::error(rejection.status, code, &rejection.message), true)
            }
        };

    let status = response.status;
    if let Err(e) = stream.write_all(&response.into_bytes()).await {
        debug!(peer = %peer, error = %e, "Failed to write HTTP response");
        return;
    }
    let _ = stream.shutdown().await;
    if rejected {
        // Unread body bytes would otherwise turn the close into a reset.
        let mut sink = vec![0u8; 64 * 1024];
        let _ = tokio::time::timeout(DRAIN_TIMEOUT, async {
            loop {
                match stream.read(&mut sink).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;
    }
    debug!(peer = %peer, status, "HTTP request served");
}

/// Serve HTTP requests until the server's shutdown signal fires, then wait
/// for in-flight requests.
pub async fn serve_http(state: Arc<ServerState>, listener: TcpListener) -> io::Result<()> {
    let local = listener.local_addr()?;
    info!(addr = %local, "HTTP endpoint listening");

    let mut shutdown = state.shutdown_signal();
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = cancelled(&mut shutdown) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    connections.spawn(handle_connection(Arc::clone(&state), stream, peer));
                }
                Err(e) => {
                    warn!(error = %e, "HTTP accept error");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
    drop(listener);

    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(open = connections.len(), "Aborting HTTP requests after grace period");
        connections.abort_all();
    }
    info!("HTTP endpoint stopped");
    Ok(())
}
