//! Ordered change-set history for one definition.

use tracing::debug;

use crate::changeset::{Category, ChangeKind, ChangeSet, DirectoryEntry};
use crate::differ;
use crate::errors::{DriftError, Result, SequencingIssue};
use crate::snapshot::Snapshot;

/// What [`ChangeSetChain::admit`] decided about an incoming change-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Next version in sequence; persist, then append.
    Append,
    /// Redelivery of a stored version with identical content.
    Duplicate,
}

/// Append-only, strictly sequenced change-sets of one definition.
///
/// Versions are contiguous from 0, so a version doubles as its index.
#[derive(Debug, Clone)]
pub struct ChangeSetChain {
    definition: String,
    change_sets: Vec<ChangeSet>,
}

impl ChangeSetChain {
    pub fn new(definition: impl Into<String>) -> Self {
        Self {
            definition: definition.into(),
            change_sets: Vec::new(),
        }
    }

    /// Rebuild a chain from stored records. Any gap, duplicate or foreign
    /// record means storage is corrupt.
    pub fn from_persisted(
        definition: impl Into<String>,
        mut records: Vec<ChangeSet>,
    ) -> Result<Self> {
        let mut chain = Self::new(definition);
        records.sort_by_key(|cs| cs.version);
        for cs in records {
            let version = cs.version;
            chain.append(cs).map_err(|e| DriftError::ChainCorruption {
                definition: chain.definition.clone(),
                version,
                reason: e.to_string(),
            })?;
        }
        debug!(definition = %chain.definition, versions = chain.len(), "chain loaded");
        Ok(chain)
    }

    pub fn definition(&self) -> &str {
        &self.definition
    }

    pub fn max_version(&self) -> Option<u32> {
        self.change_sets.last().map(|cs| cs.version)
    }

    pub fn next_version(&self) -> u32 {
        self.max_version().map_or(0, |v| v + 1)
    }

    /// Category the next change-set must or should carry.
    pub fn next_category(&self, rebaseline: bool) -> Category {
        if self.change_sets.is_empty() || rebaseline {
            Category::Coverage
        } else {
            Category::Drift
        }
    }

    pub fn len(&self) -> usize {
        self.change_sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.change_sets.is_empty()
    }

    pub fn get(&self, version: u32) -> Option<&ChangeSet> {
        self.change_sets.get(version as usize)
    }

    pub fn latest(&self) -> Option<&ChangeSet> {
        self.change_sets.last()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChangeSet> {
        self.change_sets.iter()
    }

    /// Decide whether `cs` may be appended without mutating the chain.
    ///
    /// A stored version presented again is a [`Admission::Duplicate`] when
    /// its content matches (the creation time is ignored, since a retrying
    /// agent may re-encode) and a conflict otherwise.
    pub fn admit(&self, cs: &ChangeSet) -> Result<Admission> {
        if cs.definition != self.definition {
            return Err(DriftError::sequencing(
                &self.definition,
                SequencingIssue::DefinitionMismatch(cs.definition.clone()),
            ));
        }
        if let Some(stored) = self.get(cs.version) {
            return if same_content(stored, cs) {
                Ok(Admission::Duplicate)
            } else {
                Err(DriftError::sequencing(
                    &self.definition,
                    SequencingIssue::Conflict {
                        version: cs.version,
                    },
                ))
            };
        }
        let expected = self.next_version();
        if cs.version != expected {
            return Err(DriftError::sequencing(
                &self.definition,
                SequencingIssue::OutOfOrder {
                    expected,
                    actual: cs.version,
                },
            ));
        }
        if cs.version == 0 && cs.category != Category::Coverage {
            return Err(DriftError::sequencing(
                &self.definition,
                SequencingIssue::InitialNotCoverage,
            ));
        }
        cs.validate_entries()?;
        Ok(Admission::Append)
    }

    /// Append the next version. Unlike [`admit`](Self::admit), a redelivery
    /// is an error here: the chain itself never holds a version twice.
    pub fn append(&mut self, cs: ChangeSet) -> Result<()> {
        match self.admit(&cs)? {
            Admission::Append => {
                self.change_sets.push(cs);
                Ok(())
            }
            Admission::Duplicate => Err(DriftError::sequencing(
                &self.definition,
                SequencingIssue::Duplicate { version: cs.version },
            )),
        }
    }

    /// Effective snapshot at `version`: the latest coverage at or before it,
    /// with every later drift change-set replayed on top.
    pub fn reconstruct_baseline(&self, version: u32) -> Result<Snapshot> {
        if self.get(version).is_none() {
            return Err(DriftError::VersionNotFound {
                definition: self.definition.clone(),
                version,
            });
        }
        let upto = &self.change_sets[..=version as usize];
        let anchor = upto
            .iter()
            .rposition(|cs| cs.category == Category::Coverage)
            .ok_or_else(|| DriftError::ChainCorruption {
                definition: self.definition.clone(),
                version,
                reason: "no coverage change-set to anchor replay".into(),
            })?;

        let mut state = Snapshot::new();
        for cs in &upto[anchor..] {
            self.apply(&mut state, cs)?;
        }
        Ok(state)
    }

    pub fn latest_baseline(&self) -> Result<Snapshot> {
        match self.max_version() {
            Some(v) => self.reconstruct_baseline(v),
            None => Ok(Snapshot::new()),
        }
    }

    /// Net change between two versions, grouped like a change-set body.
    pub fn drift_between(&self, from: u32, to: u32) -> Result<Vec<DirectoryEntry>> {
        let before = self.reconstruct_baseline(from)?;
        let after = self.reconstruct_baseline(to)?;
        Ok(differ::diff(&before, &after))
    }

    /// Strict replay of one change-set onto `state`.
    pub fn apply(&self, state: &mut Snapshot, cs: &ChangeSet) -> Result<()> {
        let corrupt = |reason: String| DriftError::ChainCorruption {
            definition: self.definition.clone(),
            version: cs.version,
            reason,
        };

        for (path, entry) in cs.entries() {
            if cs.category == Category::Coverage && entry.kind != ChangeKind::Added {
                return Err(corrupt(format!("{path}: coverage entries must be added")));
            }
            match entry.kind {
                ChangeKind::Added => {
                    let digest = entry
                        .new_digest
                        .ok_or_else(|| corrupt(format!("{path}: added without digest")))?;
                    if state.insert(path.clone(), digest).is_some() {
                        return Err(corrupt(format!("{path}: added but already present")));
                    }
                }
                ChangeKind::Changed => {
                    let (old, new) = entry
                        .old_digest
                        .zip(entry.new_digest)
                        .ok_or_else(|| corrupt(format!("{path}: changed without both digests")))?;
                    match state.get(&path).copied() {
                        Some(current) if current == old => {
                            state.insert(path, new);
                        }
                        Some(_) => {
                            return Err(corrupt(format!("{path}: old digest does not match")))
                        }
                        None => return Err(corrupt(format!("{path}: changed but absent"))),
                    }
                }
                ChangeKind::Removed => {
                    let old = entry
                        .old_digest
                        .ok_or_else(|| corrupt(format!("{path}: removed without digest")))?;
                    match state.get(&path).copied() {
                        Some(current) if current == old => {
                            state.remove(&path);
                        }
                        Some(_) => {
                            return Err(corrupt(format!("{path}: old digest does not match")))
                        }
                        None => return Err(corrupt(format!("{path}: removed but absent"))),
                    }
                }
            }
        }
        Ok(())
    }
}

fn same_content(a: &ChangeSet, b: &ChangeSet) -> bool {
    a.definition == b.definition
        && a.base_dir == b.base_dir
        && a.category == b.category
        && a.version == b.version
        && a.directories == b.directories
}
