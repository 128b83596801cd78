//! Serving front end.
//!
//! [`ModelServer`] accepts TCP connections and runs each one on its own task:
//! handshake, any number of health/status probes, then at most one
//! prediction [`Session`]. Failures are reported to the offending connection
//! only.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::frame::{FrameError, read_frame, write_frame};
use super::protocol::{
    ClientMessage, ErrorResponse, FramedMessage, HealthStatus, PROTOCOL_VERSION, ServerMessage,
    StatusResponse, decode_message, encode_message,
};
use super::resource::{ResourceMonitor, SessionLimiter};
use super::session::{Session, SessionInput, SessionOptions, SessionOutput, cancelled};
use super::transport::{FrameOpener, FrameSealer, TransportSecurity, accept_handshake};
use crate::error::ServeError;
use crate::model::ModelStore;

/// How long a failed connection keeps draining input after its error frame.
const LINGER: Duration = Duration::from_secs(2);

/// How long shutdown waits for open connections before aborting them.
pub(crate) const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Runtime settings of the front end.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Largest frame body accepted or produced.
    pub max_message_bytes: usize,
    /// Concurrently admitted sessions.
    pub max_sessions: usize,
    /// Capacity of each session's inbound and outbound queue.
    pub queue_depth: usize,
    /// Per-inference deadline.
    pub request_timeout: Option<Duration>,
    pub security: TransportSecurity,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            max_message_bytes: 10 * 1024 * 1024,
            max_sessions: 16,
            queue_depth: 32,
            request_timeout: None,
            security: TransportSecurity::Plaintext,
        }
    }
}

/// State shared by every connection of one server.
pub struct ServerState {
    options: ServerOptions,
    store: Arc<ModelStore>,
    limiter: SessionLimiter,
    resources: ResourceMonitor,
    start_time: Instant,
    total_predictions: AtomicU64,
    next_session: AtomicU64,
    shutdown: watch::Receiver<bool>,
}

impl ServerState {
    pub fn store(&self) -> &ModelStore {
        &self.store
    }

    pub fn limiter(&self) -> &SessionLimiter {
        &self.limiter
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn record_predictions(&self, n: u64) {
        self.total_predictions.fetch_add(n, Ordering::Relaxed);
    }

    /// Receiver that flips to `true` when shutdown starts.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.clone()
    }

    pub fn health(&self) -> HealthStatus {
        HealthStatus {
            uptime_secs: self.uptime_secs(),
            version: PROTOCOL_VERSION,
            ready: !self.store.is_empty(),
            memory_bytes: self.resources.memory_usage(),
        }
    }

    pub fn status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.uptime_secs(),
            version: PROTOCOL_VERSION,
            models: self.store.list(),
            active_sessions: self.limiter.active() as u64,
            max_sessions: self.limiter.max() as u64,
            total_sessions: self.limiter.total_admitted(),
            total_predictions: self.total_predictions.load(Ordering::Relaxed),
            memory_bytes: self.resources.memory_usage(),
            build: build_info(),
        }
    }

    async fn handle_connection(self: Arc<Self>, mut stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
        }
        let (sealer, opener) = match accept_handshake(&mut stream, &self.options.security).await {
            Ok(ciphers) => ciphers,
            Err(e) => {
                debug!(peer = %peer, error = %e, "Handshake failed");
                return;
            }
        };

        let (read_half, write_half) = stream.into_split();
        let mut reader = FrameReader {
            inner: read_half,
            opener,
            max: self.options.max_message_bytes,
        };
        let mut writer = FrameWriter {
            inner: write_half,
            sealer,
            max: self.options.max_message_bytes,
        };

        // Control phase: probes until the client opens a session.
        let model = loop {
            let msg = match reader.next().await {
                Ok(Some(msg)) => msg,
                Ok(None) => {
                    debug!(peer = %peer, "Client disconnected");
                    return;
                }
                Err(e) => return fail(reader, writer, peer, e).await,
            };
            let reply = match msg.payload {
                ClientMessage::Health => ServerMessage::Health(self.health()),
                ClientMessage::Status => ServerMessage::Status(self.status()),
                ClientMessage::Open { model } => break model,
                ClientMessage::Predict(_) | ClientMessage::End => {
                    let e = ServeError::InvalidArgument("no session is open".to_string());
                    return fail(reader, writer, peer, e).await;
                }
            };
            if let Err(e) = writer.send(msg.seq, reply).await {
                debug!(peer = %peer, error = %e, "Failed to answer probe");
                return;
            }
        };

        let Some(_permit) = self.limiter.try_admit() else {
            warn!(
                peer = %peer,
                max = self.limiter.max(),
                "Session limit reached, rejecting"
            );
            let e = ServeError::ResourceExhausted(format!(
                "server is at its limit of {} sessions",
                self.limiter.max()
            ));
            return fail(reader, writer, peer, e).await;
        };

        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let options = SessionOptions {
            deadline: self.options.request_timeout,
        };
        let session = match Session::open(id, &self.store, model.as_deref(), options) {
            Ok(session) => session,
            Err(e) => return fail(reader, writer, peer, e).await,
        };
        if let Err(e) = writer
            .send(0, ServerMessage::Opened(session.model().info()))
            .await
        {
            debug!(peer = %peer, session = id, error = %e, "Failed to confirm session");
            return;
        }

        let depth = self.options.queue_depth;
        let (in_tx, in_rx) = mpsc::channel(depth);
        let (out_tx, mut out_rx) = mpsc::channel(depth);
        let session_task = tokio::spawn(session.run(in_rx, out_tx, self.shutdown_signal()));
        let pump = tokio::spawn(pump_inbound(reader, in_tx));

        let mut failed = false;
        while let Some(output) = out_rx.recv().await {
            let sent = match output {
                SessionOutput::Prediction { seq, result } => {
                    let sent = writer.send(seq, ServerMessage::Prediction(result)).await;
                    if sent.is_ok() {
                        self.record_predictions(1);
                    }
                    sent
                }
                SessionOutput::Closed { served } => {
                    let _ = writer.send(0, ServerMessage::Closed { served }).await;
                    break;
                }
                SessionOutput::Error(e) => {
                    let _ = writer.send_error(&e).await;
                    failed = true;
                    break;
                }
            };
            match sent {
                Ok(()) => {}
                Err(e @ ServeError::ResourceExhausted(_)) => {
                    warn!(peer = %peer, session = id, error = %e, "Result exceeds frame limit");
                    let _ = writer.send_error(&e).await;
                    failed = true;
                    break;
                }
                Err(e) => {
                    debug!(peer = %peer, session = id, error = %e, "Write failed");
                    failed = true;
                    break;
                }
            }
        }
        // The session sees a closed outbound queue and stops.
        drop(out_rx);

        if let Err(e) = session_task.await {
            warn!(peer = %peer, session = id, error = %e, "Session task failed");
        }
        let reader = match pump.await {
            Ok(reader) => reader,
            Err(e) => {
                warn!(peer = %peer, session = id, error = %e, "Inbound task failed");
                return;
            }
        };

        if failed {
            linger(reader, writer).await;
        } else {
            let _ = writer.inner.shutdown().await;
        }
    }
}

/// Build timestamp and target recorded by the build script.
fn build_info() -> Option<String> {
    let timestamp = option_env!("VERGEN_BUILD_TIMESTAMP")?;
    Some(match option_env!("VERGEN_CARGO_TARGET_TRIPLE") {
        Some(target) => format!("{timestamp} ({target})"),
        None => timestamp.to_string(),
    })
}

/// Decrypting, decoding half of a connection.
struct FrameReader {
    inner: OwnedReadHalf,
    opener: FrameOpener,
    max: usize,
}

impl FrameReader {
    async fn next(&mut self) -> Result<Option<FramedMessage<ClientMessage>>, ServeError> {
        let body = match read_frame(&mut self.inner, self.max).await {
            Ok(Some(body)) => body,
            Ok(None) => return Ok(None),
            Err(e @ FrameError::TooLarge { .. }) => {
                return Err(ServeError::ResourceExhausted(e.to_string()));
            }
            Err(e) => return Err(ServeError::Transport(e.to_string())),
        };
        let body = self
            .opener
            .open(body)
            .map_err(|e| ServeError::Transport(e.to_string()))?;
        let msg: FramedMessage<ClientMessage> =
            decode_message(&body).map_err(|e| ServeError::InvalidArgument(e.to_string()))?;
        if msg.version != PROTOCOL_VERSION {
            return Err(ServeError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                found: msg.version,
            });
        }
        Ok(Some(msg))
    }
}

/// Encoding, encrypting half of a connection.
struct FrameWriter {
    inner: OwnedWriteHalf,
    sealer: FrameSealer,
    max: usize,
}

impl FrameWriter {
    async fn send(&mut self, seq: u64, payload: ServerMessage) -> Result<(), ServeError> {
        let body = encode_message(&FramedMessage::new(seq, payload))
            .map_err(|e| ServeError::Internal(e.to_string()))?;
        let len = body.len() + self.sealer.overhead();
        if len > self.max {
            return Err(ServeError::ResourceExhausted(format!(
                "response of {len} bytes exceeds limit of {} bytes",
                self.max
            )));
        }
        let body = self
            .sealer
            .seal(body)
            .map_err(|e| ServeError::Transport(e.to_string()))?;
        write_frame(&mut self.inner, &body, self.max)
            .await
            .map_err(|e| ServeError::Transport(e.to_string()))
    }

    async fn send_error(&mut self, e: &ServeError) -> Result<(), ServeError> {
        self.send(0, ServerMessage::Error(ErrorResponse::from(e)))
            .await
    }
}

/// Feed decoded requests into a session until it stops listening.
///
/// Hands the reader back so the connection can drain it afterwards.
async fn pump_inbound(
    mut reader: FrameReader,
    tx: mpsc::Sender<Result<SessionInput, ServeError>>,
) -> FrameReader {
    loop {
        let next = tokio::select! {
            _ = tx.closed() => break,
            next = reader.next() => next,
        };
        let (item, last) = match next {
            Ok(Some(msg)) => match msg.payload {
                ClientMessage::Predict(request) => (
                    Ok(SessionInput::Predict {
                        seq: msg.seq,
                        request,
                    }),
                    false,
                ),
                ClientMessage::End => (Ok(SessionInput::End), true),
                other => (
                    Err(ServeError::InvalidArgument(format!(
                        "unexpected {other:?} in an open session"
                    ))),
                    true,
                ),
            },
            // Dropping the sender without `End` fails the session.
            Ok(None) => break,
            Err(e) => (Err(e), true),
        };
        if tx.send(item).await.is_err() || last {
            break;
        }
    }
    reader
}

/// Report `e`, then close the connection gracefully.
async fn fail(reader: FrameReader, mut writer: FrameWriter, peer: SocketAddr, e: ServeError) {
    debug!(peer = %peer, code = %e.code(), error = %e, "Closing connection with error");
    if let Err(send_err) = writer.send_error(&e).await {
        debug!(peer = %peer, error = %send_err, "Failed to send error");
    }
    linger(reader, writer).await;
}

/// Half-close and drain the peer's remaining input so it can read our last
/// frame instead of seeing a reset.
async fn linger(mut reader: FrameReader, mut writer: FrameWriter) {
    let _ = writer.inner.shutdown().await;
    let mut sink = vec![0u8; 64 * 1024];
    let _ = tokio::time::timeout(LINGER, async {
        loop {
            match reader.inner.read(&mut sink).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;
}

/// Triggers graceful shutdown of a running [`ModelServer`].
#[derive(Clone)]
pub struct ServerHandle {
    shutdown: Arc<watch::Sender<bool>>,
}

impl ServerHandle {
    pub fn shutdown(&self) {
        info!("Shutdown requested");
        self.shutdown.send_replace(true);
    }
}

/// The prediction server.
pub struct ModelServer {
    state: Arc<ServerState>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl ModelServer {
    pub fn new(options: ServerOptions, store: Arc<ModelStore>) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let limiter = SessionLimiter::new(options.max_sessions);
        Self {
            state: Arc::new(ServerState {
                options,
                store,
                limiter,
                resources: ResourceMonitor::new(),
                start_time: Instant::now(),
                total_predictions: AtomicU64::new(0),
                next_session: AtomicU64::new(1),
                shutdown: shutdown_rx,
            }),
            shutdown: Arc::new(shutdown),
        }
    }

    pub fn state(&self) -> Arc<ServerState> {
        Arc::clone(&self.state)
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shutdown: Arc::clone(&self.shutdown),
        }
    }

    /// Accept connections until shutdown is requested, then wait for open
    /// connections to finish.
    pub async fn serve(&self, listener: TcpListener) -> io::Result<()> {
        let local = listener.local_addr()?;
        info!(
            addr = %local,
            security = self.state.options.security.mode_name(),
            max_sessions = self.state.options.max_sessions,
            max_message_bytes = self.state.options.max_message_bytes,
            models = self.state.store.len(),
            "Prediction server listening"
        );

        let mut shutdown = self.state.shutdown_signal();
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = cancelled(&mut shutdown) => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "Accepted connection");
                        let state = Arc::clone(&self.state);
                        connections.spawn(state.handle_connection(stream, peer));
                    }
                    Err(e) => {
                        warn!(error = %e, "Accept error");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }
        drop(listener);

        info!(open = connections.len(), "Stopping server");
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(open = connections.len(), "Grace period elapsed, aborting connections");
            connections.abort_all();
        }
        info!("Server stopped");
        Ok(())
    }
}
