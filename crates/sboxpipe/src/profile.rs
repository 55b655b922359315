//! Profile persistence: one file per profile, an active-profile pointer,
//! a single-writer apply lock, and an append-only activation journal.
//!
//! Profiles may be TOML, YAML or JSON; the extension decides. All writes
//! are temp-file + atomic rename.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use sboxpipe_types::FullProfile;

/// Pointer file naming the active profile.
pub const ACTIVE_FILE: &str = "active_profile.json";

/// Single-writer lock carrying the hash of the last applied profile.
pub const PROFILE_LOCK_FILE: &str = "profile.lock";

/// Line-delimited JSON journal of profile switches.
pub const JOURNAL_FILE: &str = "activation.jsonl";

const EXTENSIONS: [&str; 4] = ["toml", "yaml", "yml", "json"];

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ActivePointer {
    active: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileLock {
    pub pid: u32,
    pub hostname: String,
    pub applied_at: DateTime<Utc>,
    /// SHA-256 of the applied profile document.
    pub content_hash: String,
}

/// One activation journal record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationRecord {
    pub switched_at: DateTime<Utc>,
    pub from: Option<String>,
    pub to: String,
    pub content_hash: String,
}

/// Directory-backed profile store.
pub struct ProfileStore {
    dir: PathBuf,
}

impl ProfileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Profile names present in the directory, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut names: Vec<String> = fs::read_dir(&self.dir)
            .with_context(|| format!("failed to read {}", self.dir.display()))?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy() != ACTIVE_FILE)
            .filter_map(|entry| {
                let path = entry.path();
                let ext = path.extension()?.to_str()?.to_ascii_lowercase();
                if EXTENSIONS.contains(&ext.as_str()) {
                    Some(path.file_stem()?.to_string_lossy().into_owned())
                } else {
                    None
                }
            })
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    fn find(&self, name: &str) -> Option<PathBuf> {
        EXTENSIONS
            .iter()
            .map(|ext| self.dir.join(format!("{name}.{ext}")))
            .find(|path| path.exists())
    }

    /// Load a profile by name; the file extension picks the format.
    pub fn load(&self, name: &str) -> Result<FullProfile> {
        let path = self
            .find(name)
            .with_context(|| format!("profile not found: {name}"))?;
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let mut profile: FullProfile = match ext.as_str() {
            "toml" => toml::from_str(&raw)
                .with_context(|| format!("failed to parse TOML profile {}", path.display()))?,
            "yaml" | "yml" => serde_yaml::from_str(&raw)
                .with_context(|| format!("failed to parse YAML profile {}", path.display()))?,
            "json" => serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse JSON profile {}", path.display()))?,
            other => bail!("unsupported profile extension: {other}"),
        };
        if profile.name.is_empty() {
            profile.name = name.to_string();
        }
        Ok(profile)
    }

    /// Save as JSON (the canonical write format) atomically.
    pub fn save(&self, profile: &FullProfile) -> Result<PathBuf> {
        if profile.name.is_empty() {
            bail!("profile name must not be empty");
        }
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;
        let path = self.dir.join(format!("{}.json", profile.name));
        let json =
            serde_json::to_string_pretty(profile).context("failed to serialize profile")?;
        atomic_write(&path, json.as_bytes())?;
        Ok(path)
    }

    /// Name of the active profile, if a pointer exists.
    pub fn active(&self) -> Result<Option<String>> {
        let path = self.dir.join(ACTIVE_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let pointer: ActivePointer = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(Some(pointer.active))
    }

    /// Load the active profile, or `None` when no pointer is set.
    pub fn load_active(&self) -> Result<Option<FullProfile>> {
        match self.active()? {
            Some(name) => Ok(Some(self.load(&name)?)),
            None => Ok(None),
        }
    }

    /// Switch the active profile: updates the pointer, rewrites the
    /// profile lock with the new content hash, and appends a journal
    /// record. Every file involved is written atomically.
    pub fn switch(&self, name: &str) -> Result<ActivationRecord> {
        let path = self
            .find(name)
            .with_context(|| format!("profile not found: {name}"))?;
        let content = fs::read(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let content_hash = hex::encode(Sha256::digest(&content));

        let previous = self.active()?;

        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;

        let lock = ProfileLock {
            pid: std::process::id(),
            hostname: gethostname::gethostname().to_string_lossy().to_string(),
            applied_at: Utc::now(),
            content_hash: content_hash.clone(),
        };
        atomic_write(
            &self.dir.join(PROFILE_LOCK_FILE),
            serde_json::to_string_pretty(&lock)
                .context("failed to serialize profile lock")?
                .as_bytes(),
        )?;

        let pointer = ActivePointer {
            active: name.to_string(),
        };
        atomic_write(
            &self.dir.join(ACTIVE_FILE),
            serde_json::to_string_pretty(&pointer)
                .context("failed to serialize active pointer")?
                .as_bytes(),
        )?;

        let record = ActivationRecord {
            switched_at: Utc::now(),
            from: previous,
            to: name.to_string(),
            content_hash,
        };
        self.append_journal(&record)?;
        Ok(record)
    }

    /// Content hash recorded by the last switch.
    pub fn profile_lock(&self) -> Result<Option<ProfileLock>> {
        let path = self.dir.join(PROFILE_LOCK_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Ok(Some(serde_json::from_str(&raw).with_context(|| {
            format!("failed to parse {}", path.display())
        })?))
    }

    fn append_journal(&self, record: &ActivationRecord) -> Result<()> {
        let path = self.dir.join(JOURNAL_FILE);
        let line = serde_json::to_string(record).context("failed to serialize journal record")?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        writeln!(file, "{line}").with_context(|| format!("failed to append {}", path.display()))?;
        Ok(())
    }

    /// All journal records, oldest first.
    pub fn journal(&self) -> Result<Vec<ActivationRecord>> {
        let path = self.dir.join(JOURNAL_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut records = Vec::new();
        for line in raw.lines().filter(|l| !l.trim().is_empty()) {
            records.push(
                serde_json::from_str(line)
                    .with_context(|| format!("failed to parse journal line: {line}"))?,
            );
        }
        Ok(records)
    }
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
