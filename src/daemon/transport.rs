//! Transport security for daemon connections.
//!
//! [`TransportSecurity`] is resolved once at startup. With
//! [`TransportSecurity::Encrypted`] each connection starts with a salt
//! exchange (client first, 16 bytes each way), after which both sides derive
//! one AES-256-GCM key per direction:
//!
//! ```text
//! prk      = HKDF-SHA256(salt = client_salt || server_salt, ikm = shared key)
//! k_c2s    = expand(prk, "fts c2s")     k_s2c = expand(prk, "fts s2c")
//! nonce_n  = 0u32 || n (u64, big endian), n = frame counter per direction
//! ```
//!
//! A frame that fails to open (wrong key, tampering, replay, reordering)
//! ends the connection.

use std::fmt;
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

pub const KEY_LEN: usize = 32;
pub const SALT_LEN: usize = 16;
pub const TAG_LEN: usize = 16;

/// How long the server waits for the client's salt.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const INFO_C2S: &[u8] = b"fts c2s";
const INFO_S2C: &[u8] = b"fts s2c";
const FRAME_AAD: &[u8] = b"fasttext-serving frame v1";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("failed to read key file {path}: {source}")]
    KeyFile {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[error("frame authentication failed (wrong key or tampered stream)")]
    Authentication,

    #[error("frame counter exhausted")]
    CounterExhausted,

    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    #[error("handshake failed: {0}")]
    Handshake(#[from] std::io::Error),
}

/// Pre-shared 256-bit key, wiped from memory on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedKey([u8; KEY_LEN]);

impl SharedKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse a hex-encoded key (surrounding whitespace ignored).
    pub fn from_hex(text: &str) -> Result<Self, TransportError> {
        let decoded = Zeroizing::new(
            hex::decode(text.trim()).map_err(|e| TransportError::InvalidKey(e.to_string()))?,
        );
        let bytes: [u8; KEY_LEN] = decoded.as_slice().try_into().map_err(|_| {
            TransportError::InvalidKey(format!(
                "expected {} hex characters, got {}",
                KEY_LEN * 2,
                text.trim().len()
            ))
        })?;
        Ok(Self(bytes))
    }

    /// Read a hex key file as written by [`SharedKey::to_hex`].
    pub fn from_file(path: &Path) -> Result<Self, TransportError> {
        let text = Zeroizing::new(std::fs::read_to_string(path).map_err(|source| {
            TransportError::KeyFile {
                path: path.to_path_buf(),
                source,
            }
        })?);
        Self::from_hex(&text)
    }

    /// Fresh random key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn to_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(self.0))
    }
}

impl fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedKey(..)")
    }
}

/// How every connection of this process is protected.
#[derive(Debug, Clone, Default)]
pub enum TransportSecurity {
    #[default]
    Plaintext,
    Encrypted(SharedKey),
}

impl TransportSecurity {
    pub fn is_encrypted(&self) -> bool {
        matches!(self, Self::Encrypted(_))
    }

    pub fn mode_name(&self) -> &'static str {
        match self {
            Self::Plaintext => "plaintext",
            Self::Encrypted(_) => "encrypted",
        }
    }
}

/// Which end of the connection derives the ciphers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Outbound half: turns plaintext bodies into wire bodies.
pub struct FrameSealer {
    cipher: Option<Aes256Gcm>,
    counter: u64,
}

/// Inbound half: turns wire bodies back into plaintext bodies.
pub struct FrameOpener {
    cipher: Option<Aes256Gcm>,
    counter: u64,
}

fn nonce_for(counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

impl FrameSealer {
    pub fn plaintext() -> Self {
        Self {
            cipher: None,
            counter: 0,
        }
    }

    /// Bytes added to every body by sealing.
    pub fn overhead(&self) -> usize {
        if self.cipher.is_some() { TAG_LEN } else { 0 }
    }

    pub fn seal(&mut self, body: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        let Some(cipher) = &self.cipher else {
            return Ok(body);
        };
        let nonce = nonce_for(self.counter);
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or(TransportError::CounterExhausted)?;
        cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &body,
                    aad: FRAME_AAD,
                },
            )
            .map_err(|_| TransportError::Authentication)
    }
}

impl FrameOpener {
    pub fn plaintext() -> Self {
        Self {
            cipher: None,
            counter: 0,
        }
    }

    pub fn open(&mut self, body: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        let Some(cipher) = &self.cipher else {
            return Ok(body);
        };
        let nonce = nonce_for(self.counter);
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or(TransportError::CounterExhausted)?;
        cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &body,
                    aad: FRAME_AAD,
                },
            )
            .map_err(|_| TransportError::Authentication)
    }
}

/// Derive the sealer/opener pair for `role` from the exchanged salts.
pub fn derive_ciphers(
    key: &SharedKey,
    client_salt: &[u8; SALT_LEN],
    server_salt: &[u8; SALT_LEN],
    role: Role,
) -> (FrameSealer, FrameOpener) {
    let mut salt = [0u8; SALT_LEN * 2];
    salt[..SALT_LEN].copy_from_slice(client_salt);
    salt[SALT_LEN..].copy_from_slice(server_salt);

    let hk = Hkdf::<Sha256>::new(Some(&salt), &key.0);
    let expand = |info: &[u8]| {
        let mut okm = Zeroizing::new([0u8; KEY_LEN]);
        // 32 bytes is always a valid HKDF-SHA256 output length.
        hk.expand(info, okm.as_mut_slice())
            .expect("hkdf output length is valid");
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(okm.as_slice()))
    };
    let c2s = expand(INFO_C2S);
    let s2c = expand(INFO_S2C);

    let (outbound, inbound) = match role {
        Role::Client => (c2s, s2c),
        Role::Server => (s2c, c2s),
    };
    (
        FrameSealer {
            cipher: Some(outbound),
            counter: 0,
        },
        FrameOpener {
            cipher: Some(inbound),
            counter: 0,
        },
    )
}

fn random_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

/// Server side of the handshake, bounded by [`HANDSHAKE_TIMEOUT`].
pub async fn accept_handshake<S>(
    stream: &mut S,
    security: &TransportSecurity,
) -> Result<(FrameSealer, FrameOpener), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    accept_handshake_within(stream, security, HANDSHAKE_TIMEOUT).await
}

pub(crate) async fn accept_handshake_within<S>(
    stream: &mut S,
    security: &TransportSecurity,
    limit: Duration,
) -> Result<(FrameSealer, FrameOpener), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let TransportSecurity::Encrypted(key) = security else {
        return Ok((FrameSealer::plaintext(), FrameOpener::plaintext()));
    };
    let mut client_salt = [0u8; SALT_LEN];
    tokio::time::timeout(limit, stream.read_exact(&mut client_salt))
        .await
        .map_err(|_| TransportError::HandshakeTimeout(limit))??;
    let server_salt = random_salt();
    stream.write_all(&server_salt).await?;
    stream.flush().await?;
    Ok(derive_ciphers(key, &client_salt, &server_salt, Role::Server))
}

/// Client side of the handshake over a blocking stream.
pub fn connect_handshake<S>(
    stream: &mut S,
    security: &TransportSecurity,
) -> Result<(FrameSealer, FrameOpener), TransportError>
where
    S: Read + Write,
{
    let TransportSecurity::Encrypted(key) = security else {
        return Ok((FrameSealer::plaintext(), FrameOpener::plaintext()));
    };
    let client_salt = random_salt();
    stream.write_all(&client_salt)?;
    stream.flush()?;
    let mut server_salt = [0u8; SALT_LEN];
    stream.read_exact(&mut server_salt)?;
    Ok(derive_ciphers(key, &client_salt, &server_salt, Role::Client))
}
