//! Durable storage of change-set records.
//!
//! The filesystem store keeps one codec-encoded file per version:
//! `<root>/<definition>/<version:010>.changeset`. Files are written to a
//! staging area, fsynced and renamed into place, so a crash never leaves a
//! half-written record under its final name.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::changeset::ChangeSet;
use crate::codec;
use crate::definition::validate_name;
use crate::errors::{DriftError, Result};

const RECORD_EXTENSION: &str = "changeset";
const STAGING_DIR: &str = ".staging";

/// Persistence capability for ordered change-set records.
pub trait ChangeSetStore: Send + Sync {
    /// Every stored record of `definition`, in version order. An unknown
    /// definition has an empty chain.
    fn load_chain(&self, definition: &str) -> Result<Vec<ChangeSet>>;

    /// Durably store one record. Returns only once the record survives a
    /// crash.
    fn persist(&self, change_set: &ChangeSet) -> Result<()>;

    /// Delete every record of `definition`.
    fn purge(&self, definition: &str) -> Result<()>;

    /// Names of definitions holding at least one record.
    fn definitions(&self) -> Result<Vec<String>>;
}

// ── Filesystem ──────────────────────────────────────────────────────────────

pub struct FsChangeSetStore {
    root: PathBuf,
    staging_root: PathBuf,
}

impl FsChangeSetStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let staging_root = root.join(STAGING_DIR);
        fs::create_dir_all(&staging_root).map_err(|e| DriftError::io(&staging_root, e))?;
        cleanup_staging_dir(&staging_root);
        info!(root = %root.display(), "change-set store opened");
        Ok(Self { root, staging_root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn definition_dir(&self, definition: &str) -> Result<PathBuf> {
        validate_name(definition)?;
        Ok(self.root.join(definition))
    }

    fn record_path(&self, definition: &str, version: u32) -> Result<PathBuf> {
        Ok(self
            .definition_dir(definition)?
            .join(format!("{version:010}.{RECORD_EXTENSION}")))
    }

    fn read_record(path: &Path) -> Result<ChangeSet> {
        let file = File::open(path).map_err(|e| DriftError::io(path, e))?;
        codec::read_change_set(BufReader::new(file)).inspect_err(|e| {
            warn!(path = %path.display(), error = %e, "stored change-set unreadable");
        })
    }
}

impl ChangeSetStore for FsChangeSetStore {
    fn load_chain(&self, definition: &str) -> Result<Vec<ChangeSet>> {
        let dir = self.definition_dir(definition)?;
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(DriftError::io(&dir, e)),
        };

        let mut records = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| DriftError::io(&dir, e))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            let cs = Self::read_record(&path)?;
            let named = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u32>().ok());
            if named != Some(cs.version) || cs.definition != definition {
                return Err(DriftError::ChainCorruption {
                    definition: definition.to_string(),
                    version: cs.version,
                    reason: format!("record {} does not match its name", path.display()),
                });
            }
            records.push(cs);
        }
        records.sort_by_key(|cs| cs.version);
        debug!(definition, records = records.len(), "change-sets loaded");
        Ok(records)
    }

    fn persist(&self, change_set: &ChangeSet) -> Result<()> {
        let encoded = codec::encode(change_set)?;
        let dest = self.record_path(&change_set.definition, change_set.version)?;
        write_atomic(&self.staging_root, &dest, encoded.as_bytes())?;
        debug!(
            definition = %change_set.definition,
            version = change_set.version,
            "change-set persisted"
        );
        Ok(())
    }

    fn purge(&self, definition: &str) -> Result<()> {
        let dir = self.definition_dir(definition)?;
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                fsync_dir(&self.root)?;
                info!(definition, "change-sets purged");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DriftError::io(dir, e)),
        }
    }

    fn definitions(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let entries = fs::read_dir(&self.root).map_err(|e| DriftError::io(&self.root, e))?;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if name != STAGING_DIR && entry.path().is_dir() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}

// ── In-memory ───────────────────────────────────────────────────────────────

/// Non-durable store for tests and embedding.
#[derive(Default)]
pub struct MemoryChangeSetStore {
    records: Mutex<HashMap<String, Vec<ChangeSet>>>,
}

impl MemoryChangeSetStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChangeSetStore for MemoryChangeSetStore {
    fn load_chain(&self, definition: &str) -> Result<Vec<ChangeSet>> {
        Ok(self
            .records
            .lock()
            .get(definition)
            .cloned()
            .unwrap_or_default())
    }

    fn persist(&self, change_set: &ChangeSet) -> Result<()> {
        let mut records = self.records.lock();
        let chain = records.entry(change_set.definition.clone()).or_default();
        chain.retain(|cs| cs.version != change_set.version);
        chain.push(change_set.clone());
        chain.sort_by_key(|cs| cs.version);
        Ok(())
    }

    fn purge(&self, definition: &str) -> Result<()> {
        self.records.lock().remove(definition);
        Ok(())
    }

    fn definitions(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.records.lock().keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

// ── Atomic file helpers ─────────────────────────────────────────────────────

/// Write `bytes` to `dest` through a uuid-named staging file, fsyncing the
/// file and both directories.
pub(crate) fn write_atomic(staging_root: &Path, dest: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| DriftError::io(parent, e))?;
    }
    let staging_path = staging_root.join(format!("{}.staging", Uuid::new_v4()));
    {
        let mut file = File::create(&staging_path).map_err(|e| DriftError::io(&staging_path, e))?;
        file.write_all(bytes)
            .and_then(|_| file.sync_all())
            .map_err(|e| DriftError::io(&staging_path, e))?;
    }
    fsync_dir(staging_root)?;
    fs::rename(&staging_path, dest).map_err(|e| DriftError::io(dest, e))?;
    if let Some(parent) = dest.parent() {
        fsync_dir(parent)?;
    }
    Ok(())
}

/// Remove leftover `.staging` files from a previous crash.
pub(crate) fn cleanup_staging_dir(staging_root: &Path) {
    if let Ok(entries) = fs::read_dir(staging_root) {
        for entry in entries.flatten() {
            if entry.file_name().to_string_lossy().ends_with(".staging") {
                warn!(path = %entry.path().display(), "removing orphaned staging file");
                let _ = fs::remove_file(entry.path());
            }
        }
    }
}

fn fsync_dir(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        let dir = OpenOptions::new()
            .read(true)
            .open(path)
            .map_err(|e| DriftError::io(path, e))?;
        dir.sync_all().map_err(|e| DriftError::io(path, e))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}
