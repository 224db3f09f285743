//! Durable active and pending records
//!
//! The store keeps two files in the state directory:
//!
//! - `active.json`: the last committed [`ConfigSnapshot`]
//! - `pending.json`: the [`PendingChange`] awaiting confirmation, if any
//! - `routerfw.lock`: held with `flock` by the one process allowed to write
//!
//! Both are wrapped in an envelope carrying a format version and a SHA-256
//! checksum of the payload, and are replaced with [`write_atomic`] so a crash
//! mid-write leaves the previous record intact. A pending record is always
//! written before its rules go live, which is what lets a restarted daemon
//! find and undo an unconfirmed change.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::core::error::{Result, StoreError};
use crate::core::firewall::{ConfigSnapshot, PendingChange};
use crate::utils::{ensure_dir, sync_dir, write_atomic};

/// Current on-disk record format
pub const FORMAT_VERSION: u32 = 1;

const ACTIVE_FILE: &str = "active.json";
const PENDING_FILE: &str = "pending.json";
const LOCK_FILE: &str = "routerfw.lock";

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    version: u32,
    checksum: String,
    written_at: DateTime<Utc>,
    payload: T,
}

/// Computes SHA-256 checksum of a record payload
pub fn compute_checksum(payload: &Value) -> String {
    let json_str = serde_json::to_string(payload).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(json_str.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Exclusive write claim on a state directory, released on drop
pub struct StoreLock {
    path: PathBuf,
    _file: Flock<File>,
}

impl StoreLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for StoreLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreLock")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// File-backed store for the active and pending records
#[derive(Debug, Clone)]
pub struct RuleStore {
    dir: PathBuf,
}

impl RuleStore {
    /// Opens (and creates, if needed) the store directory.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        ensure_dir(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Claims the directory for this process. Fails immediately, without
    /// waiting, when another process holds it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Locked`] if the directory is already claimed, or
    /// an I/O error if the lock file cannot be opened.
    pub fn lock(&self) -> Result<StoreLock> {
        let path = self.dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;

        let mut file = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(file) => file,
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => {
                let holder = std::fs::read_to_string(&path)
                    .ok()
                    .and_then(|pid| pid.trim().parse().ok());
                return Err(StoreError::Locked { path, holder }.into());
            }
            Err((_, errno)) => return Err(std::io::Error::from(errno).into()),
        };

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        debug!(path = %path.display(), "Locked state directory");
        Ok(StoreLock { path, _file: file })
    }

    fn active_path(&self) -> PathBuf {
        self.dir.join(ACTIVE_FILE)
    }

    fn pending_path(&self) -> PathBuf {
        self.dir.join(PENDING_FILE)
    }

    /// Loads the last committed configuration, `None` on first run.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the record exists but cannot be read or trusted.
    pub fn load_active(&self) -> Result<Option<ConfigSnapshot>> {
        read_record(&self.active_path(), "active")
    }

    /// Durably replaces the active record.
    pub fn commit_active(&self, snapshot: &ConfigSnapshot) -> Result<()> {
        write_record(&self.active_path(), snapshot)?;
        info!(
            fingerprint = %short(&snapshot.rules.fingerprint()),
            "Committed active configuration"
        );
        Ok(())
    }

    /// Loads the pending change, `None` when nothing is pending.
    pub fn load_pending(&self) -> Result<Option<PendingChange>> {
        read_record(&self.pending_path(), "pending")
    }

    /// Durably writes the pending change (also used to record state transitions).
    pub fn persist_pending(&self, change: &PendingChange) -> Result<()> {
        write_record(&self.pending_path(), change)?;
        debug!(id = %change.id, state = %change.state, "Persisted pending change");
        Ok(())
    }

    /// Removes the pending record. Succeeds when there is nothing to remove.
    pub fn clear_pending(&self) -> Result<()> {
        match std::fs::remove_file(self.pending_path()) {
            Ok(()) => {
                sync_dir(&self.dir)?;
                debug!("Cleared pending change");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn write_record<T: Serialize>(path: &Path, payload: &T) -> Result<()> {
    let payload = serde_json::to_value(payload)?;
    let envelope = Envelope {
        version: FORMAT_VERSION,
        checksum: compute_checksum(&payload),
        written_at: Utc::now(),
        payload,
    };
    let json = serde_json::to_vec_pretty(&envelope)?;
    write_atomic(path, &json)?;
    Ok(())
}

fn read_record<T: DeserializeOwned>(path: &Path, record: &'static str) -> Result<Option<T>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let envelope: Envelope<Value> =
        serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupted {
            record,
            reason: e.to_string(),
        })?;

    if envelope.version != FORMAT_VERSION {
        return Err(StoreError::VersionMismatch {
            record,
            found: envelope.version,
            expected: FORMAT_VERSION,
        }
        .into());
    }

    let actual = compute_checksum(&envelope.payload);
    if actual != envelope.checksum {
        return Err(StoreError::ChecksumMismatch {
            record,
            expected: envelope.checksum,
            actual,
        }
        .into());
    }

    let payload = serde_json::from_value(envelope.payload).map_err(|e| StoreError::Corrupted {
        record,
        reason: e.to_string(),
    })?;
    Ok(Some(payload))
}

fn short(fingerprint: &str) -> &str {
    fingerprint.get(..12).unwrap_or(fingerprint)
}
