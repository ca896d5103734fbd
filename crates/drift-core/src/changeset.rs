//! Change-set data model.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{DriftError, FormatIssue, Result};
use crate::hasher::Digest;

/// Directory name used for files sitting directly in the base directory.
pub const ROOT_DIRECTORY: &str = ".";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    Added,
    Changed,
    Removed,
}

impl ChangeKind {
    pub fn code(&self) -> char {
        match self {
            Self::Added => 'A',
            Self::Changed => 'C',
            Self::Removed => 'R',
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "A" => Some(Self::Added),
            "C" => Some(Self::Changed),
            "R" => Some(Self::Removed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// Full inventory, usable as a replay anchor
    Coverage,
    /// Incremental delta against the previous version
    Drift,
}

impl Category {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Coverage => "C",
            Self::Drift => "D",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "C" => Some(Self::Coverage),
            "D" => Some(Self::Drift),
            _ => None,
        }
    }
}

/// One file-level change inside a directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// File name relative to its directory entry
    pub file: String,
    pub kind: ChangeKind,
    pub new_digest: Option<Digest>,
    pub old_digest: Option<Digest>,
}

impl FileEntry {
    pub fn added(file: impl Into<String>, digest: Digest) -> Self {
        Self {
            file: file.into(),
            kind: ChangeKind::Added,
            new_digest: Some(digest),
            old_digest: None,
        }
    }

    pub fn changed(file: impl Into<String>, old: Digest, new: Digest) -> Self {
        Self {
            file: file.into(),
            kind: ChangeKind::Changed,
            new_digest: Some(new),
            old_digest: Some(old),
        }
    }

    pub fn removed(file: impl Into<String>, digest: Digest) -> Self {
        Self {
            file: file.into(),
            kind: ChangeKind::Removed,
            new_digest: None,
            old_digest: Some(digest),
        }
    }

    /// ADDED carries only a new digest, REMOVED only an old one, CHANGED both.
    pub fn is_consistent(&self) -> bool {
        match self.kind {
            ChangeKind::Added => self.new_digest.is_some() && self.old_digest.is_none(),
            ChangeKind::Removed => self.new_digest.is_none() && self.old_digest.is_some(),
            ChangeKind::Changed => self.new_digest.is_some() && self.old_digest.is_some(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub directory: String,
    pub files: Vec<FileEntry>,
}

impl DirectoryEntry {
    pub fn new(directory: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            files: vec![],
        }
    }

    pub fn with_files(directory: impl Into<String>, files: Vec<FileEntry>) -> Self {
        Self {
            directory: directory.into(),
            files,
        }
    }

    /// Number written to the directory line of the change-set format.
    pub fn declared_count(&self) -> usize {
        self.files.len()
    }

    pub fn full_path(&self, entry: &FileEntry) -> String {
        join_path(&self.directory, &entry.file)
    }
}

/// One versioned unit of change for a definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub definition: String,
    pub base_dir: String,
    pub category: Category,
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub directories: Vec<DirectoryEntry>,
}

impl ChangeSet {
    pub fn new(
        definition: impl Into<String>,
        base_dir: impl Into<String>,
        category: Category,
        version: u32,
        directories: Vec<DirectoryEntry>,
    ) -> Self {
        Self {
            definition: definition.into(),
            base_dir: base_dir.into(),
            category,
            version,
            created_at: now_millis(),
            directories,
        }
    }

    pub fn entry_count(&self) -> usize {
        self.directories.iter().map(|d| d.files.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count() == 0
    }

    /// Every entry with its full relative path.
    pub fn entries(&self) -> impl Iterator<Item = (String, &FileEntry)> {
        self.directories
            .iter()
            .flat_map(|d| d.files.iter().map(move |f| (d.full_path(f), f)))
    }

    /// Digests referenced by this change-set, deduplicated.
    pub fn referenced_digests(&self) -> Vec<Digest> {
        let mut out: Vec<Digest> = self
            .entries()
            .flat_map(|(_, e)| e.new_digest.into_iter().chain(e.old_digest))
            .collect();
        out.sort();
        out.dedup();
        out
    }

    /// Digest bookkeeping of every entry. A coverage change-set is a full
    /// inventory, so all of its entries must be ADDED.
    pub fn validate_entries(&self) -> Result<()> {
        for dir in &self.directories {
            for entry in &dir.files {
                let coverage_violation =
                    self.category == Category::Coverage && entry.kind != ChangeKind::Added;
                if coverage_violation || !entry.is_consistent() {
                    return Err(DriftError::format(
                        0,
                        FormatIssue::InvalidEntry {
                            file: dir.full_path(entry),
                            kind: format!("{:?}", entry.kind),
                        },
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Current time truncated to millisecond precision, the resolution the
/// change-set format stores.
pub fn now_millis() -> DateTime<Utc> {
    let millis = Utc::now().timestamp_millis();
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_else(Utc::now)
}

/// Split a relative path into (directory, file name).
pub fn split_path(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(i) => (&path[..i], &path[i + 1..]),
        None => (ROOT_DIRECTORY, path),
    }
}

pub fn join_path(directory: &str, file: &str) -> String {
    if directory == ROOT_DIRECTORY || directory.is_empty() {
        file.to_string()
    } else {
        format!("{directory}/{file}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::ContentHasher;

    #[test]
    fn path_splitting() {
        assert_eq!(split_path("a.txt"), (".", "a.txt"));
        assert_eq!(split_path("conf/a.xml"), ("conf", "a.xml"));
        assert_eq!(split_path("a/b/c"), ("a/b", "c"));
        assert_eq!(join_path(".", "a.txt"), "a.txt");
        assert_eq!(join_path("a/b", "c"), "a/b/c");
    }

    #[test]
    fn entry_consistency() {
        let h = ContentHasher::default().hash_bytes(b"x");
        assert!(FileEntry::added("a", h).is_consistent());
        assert!(FileEntry::removed("a", h).is_consistent());
        assert!(FileEntry::changed("a", h, h).is_consistent());
        let broken = FileEntry {
            file: "a".into(),
            kind: ChangeKind::Added,
            new_digest: None,
            old_digest: None,
        };
        assert!(!broken.is_consistent());
    }

    #[test]
    fn referenced_digests_are_deduplicated() {
        let hasher = ContentHasher::default();
        let (h1, h2) = (hasher.hash_bytes(b"1"), hasher.hash_bytes(b"2"));
        let cs = ChangeSet::new(
            "etc",
            "/etc",
            Category::Drift,
            1,
            vec![DirectoryEntry::with_files(
                ".",
                vec![FileEntry::changed("a", h1, h2), FileEntry::added("b", h2)],
            )],
        );
        let mut expected = vec![h1, h2];
        expected.sort();
        assert_eq!(cs.referenced_digests(), expected);
        assert_eq!(cs.entry_count(), 2);
    }
}
