//! Agent-side change-set generation.
//!
//! A scan asks the server which version it expects, snapshots the
//! definition, builds either a coverage or a drift change-set, transmits it,
//! uploads any content the server lacks and only then records the new
//! snapshot as acknowledged.

use anyhow::{Context, Result};
use drift_core::changeset::{Category, ChangeSet};
use drift_core::codec;
use drift_core::definition::Definition;
use drift_core::differ;
use drift_core::errors::DriftError;
use drift_core::hasher::Digest;
use drift_core::settings::TransportSettings;
use drift_core::snapshot::{CancelToken, ScanWarning, Snapshot, Snapshotter, TreeWalker};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::server::{IngestOutcome, IngestReceipt};
use crate::transport::{with_retry, Transport};

/// Last snapshot the server acknowledged for a definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentState {
    pub version: Option<u32>,
    pub snapshot: Snapshot,
}

/// One JSON file per definition under the agent state directory.
pub struct AgentStateStore {
    dir: PathBuf,
}

impl AgentStateStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn path(&self, definition: &str) -> PathBuf {
        self.dir.join(format!("{definition}.json"))
    }

    pub fn load(&self, definition: &str) -> Result<AgentState> {
        let path = self.path(definition);
        if !path.exists() {
            return Ok(AgentState::default());
        }
        let json = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        match serde_json::from_str(&json) {
            Ok(state) => Ok(state),
            Err(e) => {
                // an unreadable state only costs a coverage scan
                warn!(definition, error = %e, "agent state unreadable, starting over");
                Ok(AgentState::default())
            }
        }
    }

    pub fn save(&self, definition: &str, state: &AgentState) -> Result<()> {
        let path = self.path(definition);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(state)?)
            .with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| format!("rename {}", path.display()))?;
        Ok(())
    }

    pub fn clear(&self, definition: &str) -> Result<()> {
        let path = self.path(definition);
        if path.exists() {
            fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
        }
        Ok(())
    }
}

/// Result of one agent scan.
#[derive(Debug, Clone)]
pub struct ScanOutcome {
    pub definition: String,
    pub version: u32,
    pub category: Category,
    pub entries: usize,
    pub outcome: IngestOutcome,
    pub uploaded: usize,
    pub warnings: Vec<ScanWarning>,
}

pub struct DriftAgent<W: TreeWalker + 'static> {
    snapshotter: Arc<Snapshotter<W>>,
    transport: Arc<dyn Transport>,
    state: AgentStateStore,
    retry: TransportSettings,
}

impl<W: TreeWalker + 'static> DriftAgent<W> {
    pub fn new(
        snapshotter: Snapshotter<W>,
        transport: Arc<dyn Transport>,
        state: AgentStateStore,
        retry: TransportSettings,
    ) -> Self {
        Self {
            snapshotter: Arc::new(snapshotter),
            transport,
            state,
            retry,
        }
    }

    pub fn state(&self) -> &AgentStateStore {
        &self.state
    }

    pub async fn run_scan(
        &self,
        definition: &Definition,
        cancel: &CancelToken,
        rebaseline: bool,
    ) -> Result<ScanOutcome> {
        let name = definition.name.as_str();
        let next = with_retry(&self.retry, "next_version", || {
            self.transport.next_version(name)
        })
        .await
        .with_context(|| format!("query next version for {name}"))?;

        let report = {
            let snapshotter = self.snapshotter.clone();
            let def = definition.clone();
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || snapshotter.snapshot_definition(&def, &cancel))
                .await
                .context("snapshot task failed")??
        };
        let mut current = report.snapshot;

        let acked = self.state.load(name)?;
        let in_step = acked.version.map(|v| v + 1) == Some(next);
        if in_step && !report.warnings.is_empty() {
            let carried = current.carry_forward(&acked.snapshot, &report.warnings);
            if carried > 0 {
                warn!(definition = name, carried, "unreadable files keep their acknowledged digest");
            }
        }
        let (category, directories) = if next == 0 || rebaseline || !in_step {
            if next != 0 && !rebaseline {
                info!(definition = name, next, acked = ?acked.version, "agent state out of step, sending coverage");
            }
            (Category::Coverage, differ::coverage(&current))
        } else {
            (Category::Drift, differ::diff(&acked.snapshot, &current))
        };

        let change_set = ChangeSet::new(
            name,
            definition.base_dir_string(),
            category,
            next,
            directories,
        );
        let encoded = codec::encode(&change_set)?;

        if cancel.is_cancelled() {
            return Err(DriftError::Cancelled.into());
        }

        let receipt: IngestReceipt = with_retry(&self.retry, "transmit", || {
            self.transport.transmit(encoded.clone())
        })
        .await
        .with_context(|| format!("transmit {name} v{next}"))?;

        let uploaded = self.upload_missing(definition, &current, &receipt).await?;

        self.state.save(
            name,
            &AgentState {
                version: Some(receipt.version),
                snapshot: current,
            },
        )?;

        info!(
            definition = name,
            version = receipt.version,
            category = ?category,
            entries = change_set.entry_count(),
            outcome = ?receipt.outcome,
            uploaded,
            warnings = report.warnings.len(),
            "scan complete"
        );

        Ok(ScanOutcome {
            definition: name.to_string(),
            version: receipt.version,
            category,
            entries: change_set.entry_count(),
            outcome: receipt.outcome,
            uploaded,
            warnings: report.warnings,
        })
    }

    async fn upload_missing(
        &self,
        definition: &Definition,
        snapshot: &Snapshot,
        receipt: &IngestReceipt,
    ) -> Result<usize> {
        let mut paths: HashMap<&Digest, &str> = HashMap::with_capacity(snapshot.len());
        for (path, digest) in snapshot.iter() {
            paths.entry(digest).or_insert(path);
        }

        let mut uploaded = 0;
        for digest in &receipt.missing_content {
            let Some(&relative) = paths.get(digest) else {
                warn!(digest = %digest, "server asked for content not in snapshot");
                continue;
            };
            let path = definition.base_dir.join(relative);
            let data = match tokio::fs::read(&path).await {
                Ok(data) => data,
                Err(e) => {
                    // file changed or vanished since the scan; next drift covers it
                    warn!(path = %path.display(), error = %e, "cannot read content for upload");
                    continue;
                }
            };
            let result = with_retry(&self.retry, "upload_content", || {
                self.transport.upload_content(*digest, data.clone())
            })
            .await;
            match result {
                Ok(()) => uploaded += 1,
                Err(e) if e.is_retryable() => {
                    return Err(e).with_context(|| format!("upload {}", path.display()))
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "content upload refused");
                }
            }
        }
        debug!(definition = %definition.name, uploaded, "content upload finished");
        Ok(uploaded)
    }
}
