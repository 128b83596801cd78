//! Streaming prediction daemon.
//!
//! ## Architecture
//!
//! ```text
//!   ServingClient ──TCP──▶ ModelServer (one task per connection)
//!     writer thread          │ handshake (plaintext | encrypted)
//!     Predictions iter ◀──   │ Health / Status probes
//!                            │ Open ─▶ Session ─▶ inference (blocking pool)
//!                            ▼
//!                        ModelStore (Arc<Model> handles)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use fasttext_serving::daemon::{ClientConfig, ServingClient};
//!
//! let client = ServingClient::new(ClientConfig::from_env()?);
//! for prediction in client.predict(vec!["bonjour le monde"], 2, 0.0)? {
//!     let (labels, probs) = prediction?.into_pair();
//!     println!("{labels:?} {probs:?}");
//! }
//! ```

pub mod client;
pub mod core;
pub mod frame;
pub mod http;
pub mod protocol;
pub mod resource;
pub mod session;
pub mod transport;

// Re-export key types for convenience
pub use client::{ClientConfig, ClientError, Predictions, ServingClient};
pub use self::core::{ModelServer, ServerHandle, ServerOptions, ServerState};
pub use protocol::{DEFAULT_PORT, ErrorCode, PROTOCOL_VERSION};
pub use resource::{ResourceMonitor, SessionLimiter};
pub use session::{Session, SessionState};
pub use transport::{SharedKey, TransportSecurity};
