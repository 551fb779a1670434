//! Content fingerprints for cache invalidation.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;

const READ_CHUNK_BYTES: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum FingerprintError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("fingerprint task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// SHA-256 of the file at `path`, as lowercase hex.
///
/// The file is streamed on a blocking thread. Any read failure is returned;
/// callers must not treat it as "unchanged".
pub async fn fingerprint(path: &Path) -> Result<String, FingerprintError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        hash_file(&path).map_err(|source| FingerprintError::Read { path, source })
    })
    .await?
}

fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_CHUNK_BYTES];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
