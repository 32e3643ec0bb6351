//! Streaming content identity for model files.
//!
//! The identity is the SHA-256 of the full file contents rendered as
//! uppercase hex, which is the form the registry's by-hash lookup expects.

use crate::cancel::CancellationToken;
use crate::config::ScanConfig;
use crate::error::{KikoError, Result};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

/// Compute the identity of a file, reading it in fixed-size chunks.
///
/// Cancellation is checked between chunks so that a multi-gigabyte file does
/// not hold up shutdown.
pub fn compute_sha256(path: impl AsRef<Path>, cancel: &CancellationToken) -> Result<String> {
    let path = path.as_ref();
    let mut file = std::fs::File::open(path).map_err(|e| KikoError::io_with_path(e, path))?;

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; ScanConfig::HASH_CHUNK_SIZE];
    loop {
        cancel.check()?;
        let bytes_read = file
            .read(&mut buffer)
            .map_err(|e| KikoError::io_with_path(e, path))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode_upper(hasher.finalize()))
}

/// Async wrapper that runs the hash on the blocking pool.
pub async fn compute_identity(
    path: impl AsRef<Path>,
    cancel: &CancellationToken,
) -> Result<String> {
    let path = path.as_ref().to_path_buf();
    let cancel = cancel.clone();

    // Run in blocking task since file I/O is blocking
    tokio::task::spawn_blocking(move || compute_sha256(&path, &cancel))
        .await
        .map_err(|e| KikoError::Other(format!("Hash computation task failed: {}", e)))?
}
