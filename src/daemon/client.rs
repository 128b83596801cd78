//! Blocking client for the prediction server.
//!
//! [`ServingClient::predict`] opens one session per call. A writer thread
//! streams the input texts (blocking on the socket when the server pushes
//! back) while the caller pulls results from [`Predictions`] in input order.

use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use super::frame::{FrameError, read_frame_blocking, write_frame_blocking};
use super::protocol::{
    ClientMessage, DEFAULT_PORT, ErrorCode, FramedMessage, HealthStatus, ModelInfo,
    PROTOCOL_VERSION, ServerMessage, StatusResponse, decode_message, encode_message,
};
use super::transport::{
    FrameOpener, FrameSealer, SharedKey, TransportError, TransportSecurity, connect_handshake,
};
use crate::inference::{PredictionRequest, PredictionResult};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("server error ({code}): {message}")]
    Server {
        code: ErrorCode,
        message: String,
        retryable: bool,
    },

    #[error("failed to connect to {addr}: {source}")]
    Connect { addr: String, source: io::Error },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl ClientError {
    /// Raised on this side without the server's involvement.
    fn is_local(&self) -> bool {
        matches!(
            self,
            Self::Frame(FrameError::TooLarge { .. }) | Self::Transport(_) | Self::Protocol(_)
        )
    }

    /// Wire code when the server reported the failure.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Server { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Configuration for the client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `host:port` of the server.
    pub address: String,
    /// Model to open; the server's default when `None`.
    pub model: Option<String>,
    pub connect_timeout: Duration,
    /// Socket read timeout; `None` waits indefinitely.
    pub read_timeout: Option<Duration>,
    /// Largest frame sent or accepted.
    pub max_message_bytes: usize,
    pub security: TransportSecurity,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: format!("127.0.0.1:{DEFAULT_PORT}"),
            model: None,
            connect_timeout: Duration::from_secs(2),
            read_timeout: None,
            max_message_bytes: 10 * 1024 * 1024,
            security: TransportSecurity::Plaintext,
        }
    }
}

impl ClientConfig {
    /// Load config from environment variables.
    ///
    /// Fails only when `FASTTEXT_SERVING_KEY_FILE` names an unreadable or
    /// malformed key.
    pub fn from_env() -> Result<Self, ClientError> {
        let mut cfg = Self::default();

        if let Ok(addr) = dotenvy::var("FASTTEXT_SERVING_SERVER") {
            cfg.address = addr;
        }

        if let Ok(model) = dotenvy::var("FASTTEXT_SERVING_MODEL")
            && !model.is_empty()
        {
            cfg.model = Some(model);
        }

        if let Ok(val) = dotenvy::var("FASTTEXT_SERVING_CONNECT_TIMEOUT_MS")
            && let Ok(ms) = val.parse::<u64>()
        {
            cfg.connect_timeout = Duration::from_millis(ms);
        }

        if let Ok(val) = dotenvy::var("FASTTEXT_SERVING_READ_TIMEOUT_MS")
            && let Ok(ms) = val.parse::<u64>()
        {
            cfg.read_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }

        if let Ok(val) = dotenvy::var("FASTTEXT_SERVING_MAX_MESSAGE_BYTES")
            && let Ok(n) = val.parse::<usize>()
        {
            cfg.max_message_bytes = n;
        }

        if let Ok(path) = dotenvy::var("FASTTEXT_SERVING_KEY_FILE")
            && !path.is_empty()
        {
            let key = SharedKey::from_file(&PathBuf::from(path))?;
            cfg.security = TransportSecurity::Encrypted(key);
        }

        Ok(cfg)
    }
}

/// Client for the prediction server.
#[derive(Debug, Clone)]
pub struct ServingClient {
    config: ClientConfig,
}

impl ServingClient {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Liveness probe on a fresh connection.
    pub fn health(&self) -> Result<HealthStatus, ClientError> {
        let mut conn = self.connect()?;
        conn.send(0, ClientMessage::Health)?;
        match conn.recv()?.payload {
            ServerMessage::Health(status) => Ok(status),
            other => Err(unexpected(other)),
        }
    }

    /// Loaded models and counters.
    pub fn status(&self) -> Result<StatusResponse, ClientError> {
        let mut conn = self.connect()?;
        conn.send(0, ClientMessage::Status)?;
        match conn.recv()?.payload {
            ServerMessage::Status(status) => Ok(status),
            other => Err(unexpected(other)),
        }
    }

    /// Stream `texts` through one session.
    ///
    /// The returned iterator yields one item per input text, in input order.
    /// Invalid `k` or `threshold` are reported by the server as an
    /// `InvalidArgument` error item.
    pub fn predict<I, S>(
        &self,
        texts: I,
        k: i32,
        threshold: f32,
    ) -> Result<Predictions, ClientError>
    where
        I: IntoIterator<Item = S>,
        I::IntoIter: Send + 'static,
        S: Into<String>,
    {
        let mut conn = self.connect()?;
        conn.send(
            0,
            ClientMessage::Open {
                model: self.config.model.clone(),
            },
        )?;
        let model = match conn.recv()?.payload {
            ServerMessage::Opened(info) => info,
            other => return Err(unexpected(other)),
        };
        debug!(model = %model.name, labels = model.labels.len(), "Session opened");

        let Conn {
            stream,
            sealer,
            opener,
            max,
        } = conn;
        let write_stream = stream.try_clone()?;
        let inputs = texts.into_iter();
        let writer_error = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&writer_error);
        let writer = thread::Builder::new()
            .name("fasttext-serving-writer".to_string())
            .spawn(move || {
                let mut stream = write_stream;
                match stream_requests(&mut stream, sealer, max, inputs, k, threshold) {
                    Ok(sent) => Some(sent),
                    Err(e) => {
                        debug!(error = %e, "Request writer failed");
                        // Park the error before the half-close; the reader
                        // looks here once the server answers the missing `End`.
                        *slot.lock() = Some(e);
                        let _ = stream.shutdown(Shutdown::Write);
                        None
                    }
                }
            })?;

        Ok(Predictions {
            stream,
            opener,
            max,
            model,
            next_seq: 0,
            writer: Some(writer),
            writer_error,
            done: false,
        })
    }

    fn connect(&self) -> Result<Conn, ClientError> {
        let addr = &self.config.address;
        let candidates: Vec<SocketAddr> = addr
            .to_socket_addrs()
            .map_err(|source| ClientError::Connect {
                addr: addr.clone(),
                source,
            })?
            .collect();

        let mut last_err = None;
        for candidate in candidates {
            match TcpStream::connect_timeout(&candidate, self.config.connect_timeout) {
                Ok(mut stream) => {
                    stream.set_nodelay(true)?;
                    stream.set_read_timeout(self.config.read_timeout)?;
                    let (sealer, opener) = connect_handshake(&mut stream, &self.config.security)?;
                    debug!(addr = %candidate, security = self.config.security.mode_name(), "Connected");
                    return Ok(Conn {
                        stream,
                        sealer,
                        opener,
                        max: self.config.max_message_bytes,
                    });
                }
                Err(e) => {
                    debug!(addr = %candidate, error = %e, "Connect attempt failed");
                    last_err = Some(e);
                }
            }
        }
        Err(ClientError::Connect {
            addr: addr.clone(),
            source: last_err.unwrap_or_else(|| {
                io::Error::new(io::ErrorKind::AddrNotAvailable, "address resolved to nothing")
            }),
        })
    }
}

struct Conn {
    stream: TcpStream,
    sealer: FrameSealer,
    opener: FrameOpener,
    max: usize,
}

impl Conn {
    fn send(&mut self, seq: u64, msg: ClientMessage) -> Result<(), ClientError> {
        write_message(&mut self.stream, &mut self.sealer, self.max, seq, msg)
    }

    fn recv(&mut self) -> Result<FramedMessage<ServerMessage>, ClientError> {
        read_message(&mut self.stream, &mut self.opener, self.max)
    }
}

fn write_message(
    stream: &mut TcpStream,
    sealer: &mut FrameSealer,
    max: usize,
    seq: u64,
    msg: ClientMessage,
) -> Result<(), ClientError> {
    let body = encode_message(&FramedMessage::new(seq, msg))
        .map_err(|e| ClientError::Protocol(e.to_string()))?;
    let body = sealer.seal(body)?;
    write_frame_blocking(stream, &body, max)?;
    Ok(())
}

fn read_message(
    stream: &mut TcpStream,
    opener: &mut FrameOpener,
    max: usize,
) -> Result<FramedMessage<ServerMessage>, ClientError> {
    let Some(body) = read_frame_blocking(stream, max)? else {
        return Err(ClientError::Protocol(
            "connection closed by server".to_string(),
        ));
    };
    let body = opener.open(body)?;
    let msg: FramedMessage<ServerMessage> =
        decode_message(&body).map_err(|e| ClientError::Protocol(e.to_string()))?;
    if msg.version != PROTOCOL_VERSION {
        return Err(ClientError::Protocol(format!(
            "server speaks protocol {}, expected {PROTOCOL_VERSION}",
            msg.version
        )));
    }
    // Errors are surfaced as-is; everything else is left to the caller.
    if let ServerMessage::Error(e) = msg.payload {
        return Err(ClientError::Server {
            code: e.code,
            message: e.message,
            retryable: e.retryable,
        });
    }
    Ok(msg)
}

fn unexpected(msg: ServerMessage) -> ClientError {
    ClientError::Protocol(format!("unexpected reply {msg:?}"))
}

/// Writer thread body: one `Predict` per text, then `End` and a half-close.
///
/// Returns the number of requests sent.
fn stream_requests<I, S>(
    stream: &mut TcpStream,
    mut sealer: FrameSealer,
    max: usize,
    texts: I,
    k: i32,
    threshold: f32,
) -> Result<u64, ClientError>
where
    I: Iterator<Item = S>,
    S: Into<String>,
{
    let mut seq = 0u64;
    for text in texts {
        let request = PredictionRequest::new(text, k, threshold);
        write_message(stream, &mut sealer, max, seq, ClientMessage::Predict(request))?;
        seq += 1;
    }
    write_message(stream, &mut sealer, max, seq, ClientMessage::End)?;
    stream.shutdown(Shutdown::Write)?;
    Ok(seq)
}

/// Results of one [`ServingClient::predict`] call, in input order.
///
/// Dropping it early closes the connection, which cancels the session.
pub struct Predictions {
    stream: TcpStream,
    opener: FrameOpener,
    max: usize,
    model: ModelInfo,
    next_seq: u64,
    writer: Option<JoinHandle<Option<u64>>>,
    writer_error: Arc<Mutex<Option<ClientError>>>,
    done: bool,
}

impl Predictions {
    /// The model the server bound to this session.
    pub fn model(&self) -> &ModelInfo {
        &self.model
    }

    fn join_writer(&mut self) -> Result<u64, ClientError> {
        let Some(handle) = self.writer.take() else {
            return Ok(self.next_seq);
        };
        match handle.join() {
            Ok(Some(sent)) => Ok(sent),
            Ok(None) => Err(self.take_writer_error().unwrap_or_else(|| {
                ClientError::Protocol("request writer failed".to_string())
            })),
            Err(_) => Err(ClientError::Protocol("request writer panicked".to_string())),
        }
    }

    /// The writer's failure, if it stopped early.
    fn take_writer_error(&self) -> Option<ClientError> {
        self.writer_error.lock().take()
    }

    fn finish(&mut self, served: u64) -> Option<Result<PredictionResult, ClientError>> {
        let sent = match self.join_writer() {
            Ok(sent) => sent,
            Err(e) => return Some(Err(e)),
        };
        if served != sent || served != self.next_seq {
            return Some(Err(ClientError::Protocol(format!(
                "server closed after {served} results, {} received, {sent} sent",
                self.next_seq
            ))));
        }
        None
    }
}

impl Iterator for Predictions {
    type Item = Result<PredictionResult, ClientError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let msg = match read_message(&mut self.stream, &mut self.opener, self.max) {
            Ok(msg) => msg,
            Err(e) => {
                self.done = true;
                // A request the writer could not produce explains the
                // server's complaint about the cut-short input stream.
                let cause = self.take_writer_error().filter(ClientError::is_local);
                return Some(Err(cause.unwrap_or(e)));
            }
        };
        match msg.payload {
            ServerMessage::Prediction(result) if msg.seq == self.next_seq => {
                self.next_seq += 1;
                Some(Ok(result))
            }
            ServerMessage::Prediction(_) => {
                self.done = true;
                Some(Err(ClientError::Protocol(format!(
                    "result {} arrived while expecting {}",
                    msg.seq, self.next_seq
                ))))
            }
            ServerMessage::Closed { served } => {
                self.done = true;
                self.finish(served)
            }
            other => {
                self.done = true;
                Some(Err(unexpected(other)))
            }
        }
    }
}

impl Drop for Predictions {
    fn drop(&mut self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Both)
            && e.kind() != io::ErrorKind::NotConnected
        {
            warn!(error = %e, "Failed to close session socket");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::testing::EnvGuard;
    use serial_test::serial;

    #[test]
    fn test_defaults() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.address, "127.0.0.1:8000");
        assert!(cfg.model.is_none());
        assert!(!cfg.security.is_encrypted());
        assert_eq!(cfg.max_message_bytes, 10 * 1024 * 1024);
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        let _env = EnvGuard::set(&[
            ("FASTTEXT_SERVING_SERVER", "10.0.0.5:9000"),
            ("FASTTEXT_SERVING_MODEL", "lid"),
            ("FASTTEXT_SERVING_CONNECT_TIMEOUT_MS", "250"),
            ("FASTTEXT_SERVING_READ_TIMEOUT_MS", "0"),
        ]);
        let cfg = ClientConfig::from_env().unwrap();
        assert_eq!(cfg.address, "10.0.0.5:9000");
        assert_eq!(cfg.model.as_deref(), Some("lid"));
        assert_eq!(cfg.connect_timeout, Duration::from_millis(250));
        assert!(cfg.read_timeout.is_none());
    }

    #[test]
    #[serial]
    fn test_from_env_reads_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("serving.key");
        std::fs::write(&path, SharedKey::generate().to_hex().as_str()).unwrap();

        let _env = EnvGuard::set(&[("FASTTEXT_SERVING_KEY_FILE", path.to_str().unwrap())]);
        assert!(ClientConfig::from_env().unwrap().security.is_encrypted());
    }

    #[test]
    #[serial]
    fn test_from_env_bad_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("serving.key");
        std::fs::write(&path, "not hex").unwrap();

        let _env = EnvGuard::set(&[("FASTTEXT_SERVING_KEY_FILE", path.to_str().unwrap())]);
        assert!(matches!(
            ClientConfig::from_env(),
            Err(ClientError::Transport(TransportError::InvalidKey(_)))
        ));
    }

    #[test]
    fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on.
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let client = ServingClient::new(ClientConfig {
            address: format!("127.0.0.1:{port}"),
            ..ClientConfig::default()
        });
        let err = client.health().unwrap_err();
        assert!(matches!(err, ClientError::Connect { .. }));
        assert!(err.code().is_none());
    }
}
