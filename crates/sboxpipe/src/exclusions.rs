//! Persistent exclusion list.
//!
//! The stored form contains only hashed server identifiers plus
//! human-readable hints. Writes are atomic (temp file + rename in the same
//! directory) and guarded by an OS-level lock file carrying pid/hostname.
//! An unparseable file is renamed aside and replaced with an empty list.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use sboxpipe_types::{ExclusionEntry, ExclusionList, ParsedServer};

/// Stale-lock takeover threshold.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Hash of a stable server identifier (`protocol|address|port`).
pub fn id_sha256(identity: &str) -> String {
    hex::encode(Sha256::digest(identity.as_bytes()))
}

/// Hash of one server's identity.
pub fn server_hash(server: &ParsedServer) -> String {
    id_sha256(&server.identity())
}

/// Build an entry for a server, hinting with its display name.
pub fn entry_for(server: &ParsedServer, reason: Option<String>) -> ExclusionEntry {
    ExclusionEntry {
        id_sha256: server_hash(server),
        name: server
            .tag
            .clone()
            .or_else(|| server.meta_str("name").map(str::to_string)),
        reason,
        added_at: Some(Utc::now()),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockInfo {
    pid: u32,
    hostname: String,
    acquired_at: DateTime<Utc>,
}

/// Exclusive writer lock next to the exclusions file; released on drop.
struct StoreLock {
    path: PathBuf,
}

impl StoreLock {
    fn acquire(target: &Path, timeout: Duration) -> Result<Self> {
        let path = lock_path(target);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create dir {}", parent.display()))?;
        }

        if path.exists() {
            match fs::read_to_string(&path)
                .ok()
                .and_then(|raw| serde_json::from_str::<LockInfo>(&raw).ok())
            {
                Some(info) => {
                    let age = Utc::now() - info.acquired_at;
                    if age.num_seconds().unsigned_abs() > timeout.as_secs() {
                        fs::remove_file(&path).with_context(|| {
                            format!("failed to remove stale lock {}", path.display())
                        })?;
                    } else {
                        bail!(
                            "exclusions locked by pid {} on {} since {}",
                            info.pid,
                            info.hostname,
                            info.acquired_at
                        );
                    }
                }
                // Corrupt lock file: treat as stale.
                None => {
                    fs::remove_file(&path).with_context(|| {
                        format!("failed to remove corrupt lock {}", path.display())
                    })?;
                }
            }
        }

        let info = LockInfo {
            pid: std::process::id(),
            hostname: gethostname::gethostname().to_string_lossy().to_string(),
            acquired_at: Utc::now(),
        };
        let json = serde_json::to_string_pretty(&info).context("failed to serialize lock")?;
        atomic_write(&path, json.as_bytes())?;
        Ok(Self { path })
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn lock_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "exclusions.json".to_string());
    name.push_str(".lock");
    target.with_file_name(name)
}

fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp_path)
            .with_context(|| format!("failed to create {}", tmp_path.display()))?;
        file.write_all(data)
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("failed to sync {}", tmp_path.display()))?;
    }
    fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to rename into {}", path.display()))?;
    Ok(())
}

/// On-disk exclusion store.
pub struct ExclusionStore {
    path: PathBuf,
    lock_timeout: Duration,
}

impl ExclusionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock_timeout: LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the list. A missing file is an empty list; a corrupt file is
    /// renamed to `<name>.corrupt.<timestamp>` and replaced by an empty
    /// list (the reset is user-visible via the returned flag).
    pub fn load(&self) -> Result<(ExclusionList, bool)> {
        if !self.path.exists() {
            return Ok((ExclusionList::default(), false));
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        match serde_json::from_str::<ExclusionList>(&raw) {
            Ok(list) => Ok((list, false)),
            Err(_) => {
                let aside = self.path.with_file_name(format!(
                    "{}.corrupt.{}",
                    self.path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| "exclusions.json".to_string()),
                    Utc::now().timestamp()
                ));
                fs::rename(&self.path, &aside).with_context(|| {
                    format!("failed to move corrupt exclusions to {}", aside.display())
                })?;
                Ok((ExclusionList::default(), true))
            }
        }
    }

    /// Persist the list atomically under the store lock.
    pub fn save(&self, list: &ExclusionList) -> Result<()> {
        let _lock = StoreLock::acquire(&self.path, self.lock_timeout)?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create dir {}", parent.display()))?;
        }
        let json =
            serde_json::to_string_pretty(list).context("failed to serialize exclusions")?;
        atomic_write(&self.path, json.as_bytes())
    }

    /// Idempotent add; returns true when the file changed.
    pub fn add(&self, entry: ExclusionEntry) -> Result<bool> {
        let (mut list, _) = self.load()?;
        if !list.add(entry) {
            return Ok(false);
        }
        self.save(&list)?;
        Ok(true)
    }

    /// Remove by hash; returns true when the file changed.
    pub fn remove(&self, id_sha256: &str) -> Result<bool> {
        let (mut list, _) = self.load()?;
        if !list.remove(id_sha256) {
            return Ok(false);
        }
        self.save(&list)?;
        Ok(true)
    }

    /// Drop every entry.
    pub fn clear(&self) -> Result<()> {
        self.save(&ExclusionList::default())
    }
}
