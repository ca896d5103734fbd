//! Hash-chained JSON-lines record of ingested change-sets.
//!
//! Every line carries the SHA-256 of its own content and the hash of the
//! previous line, so truncation or editing in the middle of the file is
//! detectable with [`IngestJournal::verify`].

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::listeners::{ChangeSetListener, ChangeSetReady};

const CHAIN_START: &str = "CHAIN_START";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JournalEntry {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub definition: String,
    pub version: u32,
    pub category: drift_core::Category,
    pub entries: usize,
    pub alertable: bool,
    pub prev_hash: String,
    pub hash: String,
}

pub struct IngestJournal {
    path: PathBuf,
    inner: Mutex<JournalState>,
}

#[derive(Debug)]
struct JournalState {
    last_seq: u64,
    last_hash: String,
}

impl IngestJournal {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create journal dir {}", parent.display()))?;
        }
        let (last_seq, last_hash) = Self::load_state(&path)?;
        Ok(Self {
            path,
            inner: Mutex::new(JournalState {
                last_seq,
                last_hash,
            }),
        })
    }

    fn load_state(path: &Path) -> Result<(u64, String)> {
        match Self::read_entries(path)?.last() {
            Some(entry) => Ok((entry.seq, entry.hash.clone())),
            None => Ok((0, CHAIN_START.to_string())),
        }
    }

    fn read_entries(path: &Path) -> Result<Vec<JournalEntry>> {
        if !path.exists() {
            return Ok(vec![]);
        }
        let reader = BufReader::new(File::open(path)?);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(&line)?);
        }
        Ok(entries)
    }

    fn compute_hash(entry_without_hash: &serde_json::Value) -> String {
        let mut hasher = Sha256::new();
        hasher.update(entry_without_hash.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    fn unhashed_value(entry: &JournalEntry) -> serde_json::Value {
        serde_json::json!({
            "seq": entry.seq,
            "timestamp": entry.timestamp,
            "definition": entry.definition,
            "version": entry.version,
            "category": entry.category,
            "entries": entry.entries,
            "alertable": entry.alertable,
            "prev_hash": entry.prev_hash,
        })
    }

    pub fn append(&self, event: &ChangeSetReady) -> Result<JournalEntry> {
        let mut state = self.inner.lock();
        let mut entry = JournalEntry {
            seq: state.last_seq + 1,
            timestamp: Utc::now(),
            definition: event.definition.clone(),
            version: event.change_set.version,
            category: event.change_set.category,
            entries: event.change_set.entry_count(),
            alertable: event.alertable,
            prev_hash: state.last_hash.clone(),
            hash: String::new(),
        };
        entry.hash = Self::compute_hash(&Self::unhashed_value(&entry));

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", serde_json::to_string(&entry)?)?;
        file.flush()?;

        state.last_seq = entry.seq;
        state.last_hash = entry.hash.clone();
        Ok(entry)
    }

    /// Most recent entries first.
    pub fn read_recent(&self, limit: Option<usize>) -> Result<Vec<JournalEntry>> {
        let mut entries = Self::read_entries(&self.path)?;
        entries.reverse();
        if let Some(lim) = limit {
            entries.truncate(lim);
        }
        Ok(entries)
    }

    /// Walk the whole file and check every hash link.
    pub fn verify(&self) -> Result<usize> {
        let entries = Self::read_entries(&self.path)?;
        let mut prev = CHAIN_START.to_string();
        for entry in &entries {
            if entry.prev_hash != prev {
                bail!("journal chain broken at seq {}", entry.seq);
            }
            if Self::compute_hash(&Self::unhashed_value(entry)) != entry.hash {
                bail!("journal entry {} was modified", entry.seq);
            }
            prev = entry.hash.clone();
        }
        Ok(entries.len())
    }
}

impl ChangeSetListener for IngestJournal {
    fn name(&self) -> &str {
        "journal"
    }

    fn on_change_set_ready(&self, event: &ChangeSetReady) -> Result<()> {
        self.append(event).map(|_| ())
    }
}
