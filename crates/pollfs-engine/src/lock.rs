//! Sidecar lock files
//!
//! [`LockFileService`] takes an exclusive lock on `<path>.lock` by creating it with
//! `create_new`. The file holds the id of the acquisition so only the matching
//! [`LockToken`] can release it. Locks are advisory; the engines never consult them.

use pollfs_types::{Error, FileLockService, LockToken, Result};
use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

/// Suffix appended to the locked path
pub const LOCK_SUFFIX: &str = ".lock";

/// Lock service backed by sidecar files
#[derive(Debug, Default, Clone, Copy)]
pub struct LockFileService;

impl LockFileService {
    /// Create a lock service
    pub fn new() -> Self {
        Self
    }

    /// Sidecar path guarding `path`
    pub fn lock_path(path: &Path) -> PathBuf {
        let mut name = OsString::from(path.as_os_str());
        name.push(LOCK_SUFFIX);
        PathBuf::from(name)
    }
}

impl FileLockService for LockFileService {
    fn acquire(&self, path: &Path) -> Result<LockToken> {
        pollfs_types::validate_path(path)?;
        let lock_path = Self::lock_path(path);

        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!("Lock for {} is already held", path.display());
                return Err(Error::Locked {
                    path: path.to_path_buf(),
                });
            }
            Err(e) => return Err(Error::from_io(e, &lock_path)),
        };

        let id = Uuid::new_v4();
        if let Err(e) = file.write_all(id.as_hyphenated().to_string().as_bytes()) {
            drop(file);
            let _ = fs::remove_file(&lock_path);
            return Err(Error::from_io(e, &lock_path));
        }

        debug!("Acquired lock {} on {}", id, path.display());
        Ok(LockToken {
            path: path.to_path_buf(),
            id,
        })
    }

    fn release(&self, token: LockToken) -> Result<()> {
        let lock_path = Self::lock_path(&token.path);
        let holder = fs::read_to_string(&lock_path).map_err(|e| Error::from_io(e, &lock_path))?;

        if Uuid::parse_str(holder.trim()).ok() != Some(token.id) {
            warn!(
                "Refusing to release {}: held by another acquisition",
                token.path.display()
            );
            return Err(Error::invalid_argument(format!(
                "lock token {} does not own {}",
                token.id,
                lock_path.display()
            )));
        }

        fs::remove_file(&lock_path).map_err(|e| Error::from_io(e, &lock_path))?;
        debug!("Released lock {} on {}", token.id, token.path.display());
        Ok(())
    }

    fn is_locked(&self, path: &Path) -> bool {
        Self::lock_path(path).exists()
    }
}
