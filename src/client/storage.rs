//! On-disk layout for Warden's local artifacts.
//!
//! All artifacts live in one directory:
//!
//! - `state.json`      last-known-good validation record (HMAC, hash chain)
//! - `clock.json`      clock watermark / grace latch bound to the state record
//! - `credential.enc`  AES-GCM sealed copy of the last verified credential's claims
//! - `secret.key`      per-installation secret authenticating the above
//! - `last_failure.json` MAC'd reason of the most recent blocked decision
//! - `warden.lock`     advisory lock file; writers hold it exclusively
//!
//! Default location:
//! - Windows: `%APPDATA%\warden\`
//! - macOS: `~/Library/Application Support/warden/`
//! - Linux: `~/.local/share/warden/`
//!
//! Writes are atomic: data goes to a temp file in the same directory, is
//! fsynced, then renamed over the target. A crash leaves either the old file
//! or the new one, never a torn mix.
//!
//! Everything here is blocking file I/O on small files. Async callers run it
//! through `tokio::task::spawn_blocking` (see the decision engine).

use crate::errors::{LicenseError, LicenseResult};

use fd_lock::RwLock;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

/// Upper bound for any artifact we read back.
const MAX_ARTIFACT_BYTES: u64 = 64 * 1024;

const LOCK_FILENAME: &str = "warden.lock";

/// Identifies one persisted artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKey {
    State,
    Watermark,
    Credential,
    Secret,
    LastFailure,
}

impl StorageKey {
    pub const ALL: [StorageKey; 5] = [
        StorageKey::State,
        StorageKey::Watermark,
        StorageKey::Credential,
        StorageKey::Secret,
        StorageKey::LastFailure,
    ];

    pub fn filename(&self) -> &'static str {
        match self {
            StorageKey::State => "state.json",
            StorageKey::Watermark => "clock.json",
            StorageKey::Credential => "credential.enc",
            StorageKey::Secret => "secret.key",
            StorageKey::LastFailure => "last_failure.json",
        }
    }
}

/// Directory holding the local artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageDir {
    root: PathBuf,
}

impl StorageDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Platform data directory joined with `warden`.
    pub fn default_location() -> LicenseResult<Self> {
        dirs::data_dir()
            .map(|p| Self::new(p.join("warden")))
            .ok_or_else(|| {
                LicenseError::ConfigError("could not determine app data directory".to_string())
            })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, key: StorageKey) -> PathBuf {
        self.root.join(key.filename())
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join(LOCK_FILENAME)
    }

    /// Lock file for writers, creating the directory if needed.
    ///
    /// Take `.write()` on the result for one exclusive read-modify-write.
    /// The lock is advisory and shared with every process using this directory.
    pub fn lock(&self) -> LicenseResult<RwLock<File>> {
        self.ensure()?;
        Ok(RwLock::new(open_lock_file(&self.lock_path())?))
    }

    /// Lock file for readers. `None` when the directory does not exist (nothing
    /// to read) or the lock file cannot be opened.
    pub fn reader_lock(&self) -> Option<RwLock<File>> {
        if !self.root.is_dir() {
            return None;
        }
        match open_lock_file(&self.lock_path()) {
            Ok(file) => Some(RwLock::new(file)),
            Err(e) => {
                log::debug!("Reading {} without lock: {}", self.root.display(), e);
                None
            }
        }
    }

    /// Delete the lock file. Call only after every guard is dropped.
    pub fn remove_lock(&self) {
        if let Err(e) = fs::remove_file(self.lock_path()) {
            if e.kind() != ErrorKind::NotFound {
                log::debug!("Could not remove {}: {}", self.lock_path().display(), e);
            }
        }
    }

    /// Create the directory (owner-only on unix) if missing.
    pub fn ensure(&self) -> LicenseResult<()> {
        fs::create_dir_all(&self.root)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = fs::set_permissions(&self.root, fs::Permissions::from_mode(0o700)) {
                log::debug!("could not restrict {}: {}", self.root.display(), e);
            }
        }
        Ok(())
    }

    /// Read an artifact. `Ok(None)` if it does not exist.
    pub fn read(&self, key: StorageKey) -> LicenseResult<Option<Vec<u8>>> {
        let path = self.path(key);
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(LicenseError::StorageError(e)),
        };

        let mut data = Vec::new();
        file.take(MAX_ARTIFACT_BYTES + 1).read_to_end(&mut data)?;
        if data.len() as u64 > MAX_ARTIFACT_BYTES {
            return Err(LicenseError::StorageError(std::io::Error::new(
                ErrorKind::InvalidData,
                format!("{} exceeds {} bytes", path.display(), MAX_ARTIFACT_BYTES),
            )));
        }
        log::debug!("Loaded {:?} from {}", key, path.display());
        Ok(Some(data))
    }

    /// Replace an artifact atomically (temp file + fsync + rename).
    pub fn write_atomic(&self, key: StorageKey, data: &[u8]) -> LicenseResult<()> {
        self.ensure()?;
        let target = self.path(key);

        let temp = tempfile::NamedTempFile::new_in(&self.root)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = fs::set_permissions(temp.path(), fs::Permissions::from_mode(0o600)) {
                log::warn!("failed to restrict temp file {}: {}", temp.path().display(), e);
            }
        }

        let mut file = temp.as_file();
        file.write_all(data)?;
        file.sync_all()?;

        temp.persist(&target).map_err(|e| LicenseError::StorageError(e.error))?;
        log::debug!("Saved {:?} to {}", key, target.display());
        Ok(())
    }

    /// Delete an artifact (no-op if absent).
    fn clear(&self, key: StorageKey) -> LicenseResult<()> {
        match fs::remove_file(self.path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LicenseError::StorageError(e)),
        }
    }

    /// Delete every artifact, including the installation secret.
    pub fn wipe(&self) -> LicenseResult<()> {
        for key in StorageKey::ALL {
            self.clear(key)?;
        }
        log::info!("Wiped local license artifacts in {}", self.root.display());
        Ok(())
    }
}

fn open_lock_file(path: &Path) -> std::io::Result<File> {
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_artifact_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageDir::new(dir.path());
        assert!(storage.read(StorageKey::State).unwrap().is_none());
    }

    #[test]
    fn atomic_write_replaces_content_and_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageDir::new(dir.path().join("nested"));

        storage.write_atomic(StorageKey::State, b"first").unwrap();
        storage.write_atomic(StorageKey::State, b"second").unwrap();
        assert_eq!(storage.read(StorageKey::State).unwrap().unwrap(), b"second");

        let entries: Vec<_> = fs::read_dir(storage.root()).unwrap().collect();
        assert_eq!(entries.len(), 1, "only state.json should remain");
    }

    #[test]
    fn oversized_artifact_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageDir::new(dir.path());
        fs::write(
            storage.path(StorageKey::Watermark),
            vec![b'x'; MAX_ARTIFACT_BYTES as usize + 1],
        )
        .unwrap();
        assert!(storage.read(StorageKey::Watermark).is_err());
    }

    #[test]
    fn wipe_removes_everything_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageDir::new(dir.path());
        for key in StorageKey::ALL {
            storage.write_atomic(key, b"x").unwrap();
        }
        storage.wipe().unwrap();
        for key in StorageKey::ALL {
            assert!(storage.read(key).unwrap().is_none());
        }
        storage.wipe().unwrap();
    }

    #[test]
    fn exclusive_lock_excludes_other_handles() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageDir::new(dir.path());

        let mut first = storage.lock().unwrap();
        let mut second = storage.reader_lock().unwrap();
        {
            let _held = first.write().unwrap();
            assert!(second.try_read().is_err(), "reader got in during a write");
            assert!(second.try_write().is_err());
        }
        assert!(second.try_write().is_ok());
    }

    #[test]
    fn reader_lock_needs_an_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageDir::new(dir.path().join("missing"));
        assert!(storage.reader_lock().is_none());
        assert!(!storage.root().exists());
    }

    #[cfg(unix)]
    #[test]
    fn written_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageDir::new(dir.path());
        storage.write_atomic(StorageKey::Secret, b"k").unwrap();
        let mode = fs::metadata(storage.path(StorageKey::Secret))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o077, 0);
    }
}
