//! Server-side ingestion and reconstruction of change-set chains.
//!
//! Each definition's chain sits behind its own `RwLock`: ingestion takes the
//! write side for validate → persist → append, so at most one append per
//! definition is in flight, while reconstructions share the read side.
//! Listeners run after the lock is released.
//!
//! The `chains` map lock is taken before a `definitions` read or a single
//! chain lock, and nothing takes another lock while holding a chain. A chain
//! removed by a purge is marked so that callers still holding it back off.

use chrono::{DateTime, Utc};
use drift_core::chain::{Admission, ChangeSetChain};
use drift_core::changeset::{Category, ChangeSet, DirectoryEntry};
use drift_core::codec;
use drift_core::content_store::ContentStore;
use drift_core::definition::Definition;
use drift_core::errors::{DriftError, Result};
use drift_core::hasher::Digest;
use drift_core::snapshot::Snapshot;
use drift_core::store::ChangeSetStore;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::listeners::{ChangeSetReady, ListenerRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestOutcome {
    Appended,
    /// Redelivery of a stored version; nothing changed.
    Duplicate,
}

/// Answer to an ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReceipt {
    pub definition: String,
    pub version: u32,
    pub outcome: IngestOutcome,
    /// Digests referenced by the change-set whose content is not stored yet.
    pub missing_content: Vec<Digest>,
}

/// One line of a definition's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionSummary {
    pub version: u32,
    pub category: Category,
    pub created_at: DateTime<Utc>,
    pub entries: usize,
}

struct ChainSlot {
    chain: RwLock<ChangeSetChain>,
    purged: AtomicBool,
}

type SharedChain = Arc<ChainSlot>;

pub struct SyncServer {
    store: Arc<dyn ChangeSetStore>,
    content: ContentStore,
    definitions: RwLock<HashMap<String, Definition>>,
    chains: Mutex<HashMap<String, SharedChain>>,
    listeners: ListenerRegistry,
}

impl SyncServer {
    pub fn new(store: Arc<dyn ChangeSetStore>, content: ContentStore) -> Self {
        Self {
            store,
            content,
            definitions: RwLock::new(HashMap::new()),
            chains: Mutex::new(HashMap::new()),
            listeners: ListenerRegistry::new(),
        }
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }

    /// Register or update a definition. Its identity (name and base
    /// directory) is frozen once change-sets exist.
    pub fn register_definition(&self, definition: Definition) -> Result<()> {
        definition.validate()?;
        let mut definitions = self.definitions.write();
        let identity_changed = definitions
            .get(&definition.name)
            .map_or(true, |existing| !existing.same_identity(&definition));
        if identity_changed {
            // persisted before appended, so the store is authoritative
            if let Some(stored) = self.store.load_chain(&definition.name)?.first() {
                if stored.base_dir != definition.base_dir_string() {
                    return Err(DriftError::DefinitionConflict(definition.name));
                }
            }
        }
        info!(definition = %definition.name, mode = ?definition.handling_mode, "definition registered");
        definitions.insert(definition.name.clone(), definition);
        Ok(())
    }

    pub fn definition(&self, name: &str) -> Option<Definition> {
        self.definitions.read().get(name).cloned()
    }

    pub fn definitions(&self) -> Vec<Definition> {
        let mut defs: Vec<Definition> = self.definitions.read().values().cloned().collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    fn require_definition(&self, name: &str) -> Result<Definition> {
        self.definition(name)
            .ok_or_else(|| DriftError::UnknownDefinition(name.to_string()))
    }

    /// Chain for a registered definition, loaded from the store on first
    /// use. Registration is checked under the `chains` lock so a purge in
    /// progress cannot be raced into reloading deleted records.
    fn chain(&self, name: &str) -> Result<SharedChain> {
        let mut chains = self.chains.lock();
        self.require_definition(name)?;
        if let Some(slot) = chains.get(name) {
            return Ok(slot.clone());
        }
        let chain = ChangeSetChain::from_persisted(name, self.store.load_chain(name)?)?;
        let slot = Arc::new(ChainSlot {
            chain: RwLock::new(chain),
            purged: AtomicBool::new(false),
        });
        chains.insert(name.to_string(), slot.clone());
        Ok(slot)
    }

    fn read_chain<T>(&self, name: &str, read: impl FnOnce(&ChangeSetChain) -> Result<T>) -> Result<T> {
        let slot = self.chain(name)?;
        let chain = slot.chain.read();
        if slot.purged.load(Ordering::Acquire) {
            return Err(DriftError::UnknownDefinition(name.to_string()));
        }
        read(&chain)
    }

    pub fn next_version(&self, definition: &str) -> Result<u32> {
        self.read_chain(definition, |chain| Ok(chain.next_version()))
    }

    /// Decode and ingest a change-set in the line format.
    pub fn ingest(&self, encoded: &str) -> Result<IngestReceipt> {
        let change_set = codec::decode(encoded)?;
        self.ingest_change_set(change_set)
    }

    pub fn ingest_change_set(&self, change_set: ChangeSet) -> Result<IngestReceipt> {
        let definition = self.require_definition(&change_set.definition)?;
        if change_set.base_dir != definition.base_dir_string() {
            return Err(DriftError::DefinitionConflict(definition.name));
        }
        let slot = self.chain(&definition.name)?;
        let version = change_set.version;
        let change_set = Arc::new(change_set);
        let outcome = self.admit_and_persist(&slot, &change_set)?;

        let wanted: Vec<Digest> = change_set
            .entries()
            .filter_map(|(_, e)| e.new_digest)
            .collect();
        let mut missing = self.content.missing(&wanted);
        missing.sort();
        missing.dedup();

        match outcome {
            IngestOutcome::Appended => {
                info!(
                    definition = %definition.name,
                    version,
                    category = ?change_set.category,
                    entries = change_set.entry_count(),
                    missing = missing.len(),
                    "change-set appended"
                );
                self.listeners
                    .notify(&ChangeSetReady::new(change_set, definition.handling_mode));
            }
            IngestOutcome::Duplicate => {
                debug!(definition = %definition.name, version, "duplicate delivery ignored");
            }
        }

        Ok(IngestReceipt {
            definition: definition.name,
            version,
            outcome,
            missing_content: missing,
        })
    }

    /// Validate, persist and append under the chain's write lock.
    fn admit_and_persist(&self, slot: &ChainSlot, change_set: &ChangeSet) -> Result<IngestOutcome> {
        let mut chain = slot.chain.write();
        if slot.purged.load(Ordering::Acquire) {
            return Err(DriftError::UnknownDefinition(change_set.definition.clone()));
        }
        match chain.admit(change_set)? {
            Admission::Duplicate => Ok(IngestOutcome::Duplicate),
            Admission::Append => {
                self.store.persist(change_set)?;
                chain.append(change_set.clone())?;
                Ok(IngestOutcome::Appended)
            }
        }
    }

    /// Reconstructed state of `definition` at `version`.
    pub fn effective_state(&self, definition: &str, version: u32) -> Result<Snapshot> {
        self.read_chain(definition, |chain| chain.reconstruct_baseline(version))
    }

    pub fn latest_state(&self, definition: &str) -> Result<Snapshot> {
        self.read_chain(definition, |chain| chain.latest_baseline())
    }

    /// Net change between two stored versions.
    pub fn drift_between(&self, definition: &str, from: u32, to: u32) -> Result<Vec<DirectoryEntry>> {
        self.read_chain(definition, |chain| chain.drift_between(from, to))
    }

    pub fn change_set(&self, definition: &str, version: u32) -> Result<ChangeSet> {
        self.read_chain(definition, |chain| {
            chain
                .get(version)
                .cloned()
                .ok_or_else(|| DriftError::VersionNotFound {
                    definition: definition.to_string(),
                    version,
                })
        })
    }

    pub fn history(&self, definition: &str) -> Result<Vec<VersionSummary>> {
        self.read_chain(definition, |chain| {
            Ok(chain
                .iter()
                .map(|cs| VersionSummary {
                    version: cs.version,
                    category: cs.category,
                    created_at: cs.created_at,
                    entries: cs.entry_count(),
                })
                .collect())
        })
    }

    /// Accept uploaded file content; the bytes must hash to `digest`.
    pub fn store_content(&self, digest: &Digest, data: &[u8]) -> Result<()> {
        self.content.put(digest, data).inspect_err(|e| {
            warn!(digest = %digest, error = %e, "content upload rejected");
        })
    }

    pub fn content(&self, digest: &Digest) -> Result<Vec<u8>> {
        self.content.get(digest)
    }

    /// Delete the whole chain of `definition` and forget the definition.
    pub fn purge_definition(&self, definition: &str) -> Result<()> {
        self.definitions.write().remove(definition);

        let mut chains = self.chains.lock();
        let purged = match chains.get(definition).cloned() {
            Some(slot) => {
                // waits out any in-flight append
                let _chain = slot.chain.write();
                slot.purged.store(true, Ordering::Release);
                self.store.purge(definition)
            }
            None => self.store.purge(definition),
        };
        chains.remove(definition);
        purged?;
        info!(definition, "definition purged");
        Ok(())
    }
}
