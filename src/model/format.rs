//! Model file container.
//!
//! ```text
//! 0       4          8        12
//! +-------+----------+--------+---------------------------+
//! | FTSM  | version  | crc32  | MessagePack(ModelParts)   |
//! +-------+----------+--------+---------------------------+
//!          u32 LE     u32 LE   (checksum covers the body)
//! ```

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::{Model, ModelParts};
use crate::error::LoadError;

pub const MAGIC: &[u8; 4] = b"FTSM";
pub const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 12;

/// Encode `parts` into the container layout.
pub fn encode_model(parts: &ModelParts) -> Result<Vec<u8>, rmp_serde::encode::Error> {
    let body = rmp_serde::to_vec(parts)?;
    let mut buf = Vec::with_capacity(HEADER_LEN + body.len());
    buf.extend_from_slice(MAGIC);
    buf.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    buf.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Decode a container; `path` is only used for error messages.
pub fn decode_model(path: &Path, data: &[u8]) -> Result<ModelParts, LoadError> {
    let corrupt = |reason: String| LoadError::Corrupt {
        path: path.to_path_buf(),
        reason,
    };

    if data.len() < HEADER_LEN {
        return Err(corrupt(format!("file is only {} bytes", data.len())));
    }
    if &data[..4] != MAGIC {
        return Err(corrupt("bad magic".to_string()));
    }

    let version = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    if version != FORMAT_VERSION {
        return Err(LoadError::Incompatible {
            path: path.to_path_buf(),
            found: version,
            expected: FORMAT_VERSION,
        });
    }

    let expected_crc = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);
    let body = &data[HEADER_LEN..];
    let actual_crc = crc32fast::hash(body);
    if actual_crc != expected_crc {
        return Err(corrupt(format!(
            "checksum mismatch: header {expected_crc:08x}, body {actual_crc:08x}"
        )));
    }

    rmp_serde::from_slice(body).map_err(|e| corrupt(format!("undecodable body: {e}")))
}

/// Read and validate a model file.
///
/// The model is named after `name` when given, else after the file stem.
pub fn read_model(path: &Path, name: Option<&str>) -> Result<Model, LoadError> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(LoadError::Missing(path.to_path_buf()));
        }
        Err(source) => {
            return Err(LoadError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    let parts = decode_model(path, &data)?;
    let name = name
        .map(str::to_string)
        .unwrap_or_else(|| default_model_name(path));
    debug!(path = %path.display(), name = %name, bytes = data.len(), "Decoded model file");

    Model::from_parts(name, parts).map_err(|reason| LoadError::Corrupt {
        path: path.to_path_buf(),
        reason,
    })
}

/// Write a model file atomically (temp file in the same directory, then rename).
pub fn write_model(path: &Path, parts: &ModelParts) -> std::io::Result<()> {
    let encoded = encode_model(parts).map_err(std::io::Error::other)?;

    let tmp = temp_path(path);
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&encoded)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

/// File stem of `path`, or `"default"` for odd paths.
pub fn default_model_name(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("default")
        .to_string()
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".tmp-{}", std::process::id()));
    path.with_file_name(name)
}
