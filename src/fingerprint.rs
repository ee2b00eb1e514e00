//! Executable fingerprint binding state records to one build.
//!
//! By default the fingerprint is the SHA-256 of the running executable, so
//! replacing the binary (a patched build, a copied install) invalidates the
//! local state and forces an online check. Deployments where the executable
//! path is not stable can point at another file, pin a fixed value, or turn
//! binding off.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};

use crate::errors::{LicenseError, LicenseResult};

/// Value recorded when binding is switched off.
pub const UNBOUND_FINGERPRINT: &str = "unbound";

const CHUNK_SIZE: usize = 1024 * 1024;

/// Where the fingerprint comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FingerprintSource {
    /// SHA-256 of `std::env::current_exe()`.
    Executable,
    /// SHA-256 of the given file.
    File(PathBuf),
    /// A literal value, e.g. a build id injected at compile time.
    Fixed(String),
    /// No binding.
    Unbound,
}

impl FingerprintSource {
    pub fn is_bound(&self) -> bool {
        !matches!(self, FingerprintSource::Unbound)
    }

    /// Compute the fingerprint. File hashing runs on the blocking pool.
    pub async fn compute(&self) -> LicenseResult<String> {
        match self {
            FingerprintSource::Fixed(value) => Ok(value.clone()),
            FingerprintSource::Unbound => Ok(UNBOUND_FINGERPRINT.to_string()),
            FingerprintSource::Executable => {
                let exe = std::env::current_exe().map_err(|e| {
                    LicenseError::FingerprintUnavailable(format!("cannot locate executable: {e}"))
                })?;
                hash_file_blocking(exe).await
            }
            FingerprintSource::File(path) => hash_file_blocking(path.clone()).await,
        }
    }
}

async fn hash_file_blocking(path: PathBuf) -> LicenseResult<String> {
    tokio::task::spawn_blocking(move || hash_file(&path))
        .await
        .map_err(|e| LicenseError::FingerprintUnavailable(format!("hashing task failed: {e}")))?
}

/// Streaming SHA-256 of a file, hex-encoded.
pub fn hash_file(path: &Path) -> LicenseResult<String> {
    let unavailable =
        |e: std::io::Error| LicenseError::FingerprintUnavailable(format!("{}: {e}", path.display()));

    let mut file = File::open(path).map_err(unavailable)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => hasher.update(&buf[..n]),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(unavailable(e)),
        }
    }
    Ok(hex::encode(hasher.finalize()))
}
