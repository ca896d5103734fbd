//! Point-in-time snapshots of a definition's tree.
//!
//! The snapshotter walks the base directory through a [`TreeWalker`], hashes
//! every accepted regular file and returns an ordered path → digest map.
//! A single unreadable file becomes a [`ScanWarning`] instead of failing the
//! scan; cancellation is checked between files.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::definition::{Definition, PathFilter};
use crate::errors::{DriftError, Result};
use crate::hasher::{ContentHasher, Digest};

/// Ordered mapping from `/`-separated relative path to content digest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    entries: BTreeMap<String, Digest>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, digest: Digest) -> Option<Digest> {
        self.entries.insert(path.into(), digest)
    }

    pub fn remove(&mut self, path: &str) -> Option<Digest> {
        self.entries.remove(path)
    }

    pub fn get(&self, path: &str) -> Option<&Digest> {
        self.entries.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in lexical path order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Digest)> {
        self.entries.iter().map(|(p, d)| (p.as_str(), d))
    }

    pub fn into_map(self) -> BTreeMap<String, Digest> {
        self.entries
    }

    /// Keep the `previous` digest of every path a warning says could not be
    /// read this time (a file, or everything under a directory), so a
    /// transient failure is not reported as a removal. Returns how many
    /// entries were carried over.
    pub fn carry_forward(&mut self, previous: &Snapshot, warnings: &[ScanWarning]) -> usize {
        let mut carried = 0;
        for warning in warnings {
            let root = warning.path.as_str();
            let covered = previous
                .entries
                .range::<str, _>((Bound::Included(root), Bound::Unbounded))
                .take_while(|(p, _)| p.starts_with(root))
                .filter(|(p, _)| {
                    root.is_empty() || p.len() == root.len() || p[root.len()..].starts_with('/')
                });
            for (path, digest) in covered {
                if !self.entries.contains_key(path) {
                    self.entries.insert(path.clone(), *digest);
                    carried += 1;
                }
            }
        }
        carried
    }
}

impl FromIterator<(String, Digest)> for Snapshot {
    fn from_iter<I: IntoIterator<Item = (String, Digest)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl From<BTreeMap<String, Digest>> for Snapshot {
    fn from(entries: BTreeMap<String, Digest>) -> Self {
        Self { entries }
    }
}

/// A file that could not contribute to a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanWarning {
    pub path: String,
    pub error: String,
}

/// A regular file found by a walker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkedFile {
    /// `/`-separated path relative to the base directory
    pub relative: String,
    pub absolute: PathBuf,
}

#[derive(Debug, Default)]
pub struct WalkOutcome {
    pub files: Vec<WalkedFile>,
    pub warnings: Vec<ScanWarning>,
}

/// Directory-walk capability: lists regular files and opens them.
pub trait TreeWalker: Send + Sync {
    fn walk(&self, base: &Path, filter: &PathFilter) -> Result<WalkOutcome>;

    fn open(&self, file: &WalkedFile) -> std::io::Result<Box<dyn Read + Send>>;
}

/// Walks the local filesystem with `walkdir`. Symlinks are not followed and
/// not recorded.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsWalker;

impl TreeWalker for FsWalker {
    fn walk(&self, base: &Path, filter: &PathFilter) -> Result<WalkOutcome> {
        let meta = std::fs::metadata(base).map_err(|e| DriftError::io(base, e))?;
        if !meta.is_dir() {
            return Err(DriftError::io(
                base,
                std::io::Error::new(std::io::ErrorKind::NotFound, "base directory is not a directory"),
            ));
        }

        let mut outcome = WalkOutcome::default();
        let walker = WalkDir::new(base)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                // never prune the root itself
                entry.depth() == 0
                    || relative_path(base, entry.path())
                        .map(|rel| !filter.is_excluded(&rel))
                        .unwrap_or(true)
            });

        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    let path = e
                        .path()
                        .map(|p| relative_path(base, p).unwrap_or_else(|| p.display().to_string()))
                        .unwrap_or_default();
                    outcome.warnings.push(ScanWarning {
                        path,
                        error: e.to_string(),
                    });
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }

            let Some(relative) = relative_path(base, entry.path()) else {
                outcome.warnings.push(ScanWarning {
                    path: entry.path().display().to_string(),
                    error: "path is not valid UTF-8".into(),
                });
                continue;
            };

            if filter.matches(&relative) {
                outcome.files.push(WalkedFile {
                    relative,
                    absolute: entry.path().to_path_buf(),
                });
            }
        }

        Ok(outcome)
    }

    fn open(&self, file: &WalkedFile) -> std::io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(File::open(&file.absolute)?))
    }
}

fn relative_path(base: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(base).ok()?;
    let parts: Option<Vec<&str>> = rel.components().map(|c| c.as_os_str().to_str()).collect();
    Some(parts?.join("/"))
}

/// Shared cancellation flag, checked by the snapshotter at every file
/// boundary.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SnapshotReport {
    pub snapshot: Snapshot,
    pub warnings: Vec<ScanWarning>,
    pub bytes_hashed: u64,
}

pub struct Snapshotter<W: TreeWalker> {
    walker: W,
    hasher: ContentHasher,
}

impl<W: TreeWalker> Snapshotter<W> {
    pub fn new(walker: W, hasher: ContentHasher) -> Self {
        Self { walker, hasher }
    }

    pub fn hasher(&self) -> &ContentHasher {
        &self.hasher
    }

    pub fn walker(&self) -> &W {
        &self.walker
    }

    pub fn snapshot_definition(
        &self,
        definition: &Definition,
        cancel: &CancelToken,
    ) -> Result<SnapshotReport> {
        let filter = definition.filter()?;
        self.snapshot(&definition.base_dir, &filter, cancel)
    }

    pub fn snapshot(
        &self,
        base: &Path,
        filter: &PathFilter,
        cancel: &CancelToken,
    ) -> Result<SnapshotReport> {
        let WalkOutcome {
            mut files,
            mut warnings,
        } = self.walker.walk(base, filter)?;
        files.sort_by(|a, b| a.relative.cmp(&b.relative));

        let mut snapshot = Snapshot::new();
        let mut bytes_hashed = 0u64;

        for file in files {
            if cancel.is_cancelled() {
                info!(base = %base.display(), "snapshot cancelled");
                return Err(DriftError::Cancelled);
            }

            if file.relative.contains([' ', '\n', '\r']) {
                warn!(path = %file.relative, "skipping path not representable in change-sets");
                warnings.push(ScanWarning {
                    path: file.relative,
                    error: "path contains a space or line break".into(),
                });
                continue;
            }

            let hashed = self
                .walker
                .open(&file)
                .and_then(|reader| {
                    let mut counting = CountingReader { inner: reader, count: 0 };
                    let digest = self.hasher.hash_reader(&mut counting)?;
                    Ok((digest, counting.count))
                });

            match hashed {
                Ok((digest, size)) => {
                    bytes_hashed += size;
                    snapshot.insert(file.relative, digest);
                }
                Err(e) => {
                    warn!(path = %file.relative, error = %e, "cannot hash file, skipping");
                    warnings.push(ScanWarning {
                        path: file.relative,
                        error: e.to_string(),
                    });
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(DriftError::Cancelled);
        }

        debug!(
            base = %base.display(),
            files = snapshot.len(),
            warnings = warnings.len(),
            bytes = bytes_hashed,
            "snapshot complete"
        );

        Ok(SnapshotReport {
            snapshot,
            warnings,
            bytes_hashed,
        })
    }
}

struct CountingReader<R> {
    inner: R,
    count: u64,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::{self, Cursor};
    use tempfile::tempdir;

    /// In-memory walker; `None` content simulates a file that vanished or is
    /// locked between listing and reading.
    struct MemoryWalker {
        files: HashMap<String, Option<Vec<u8>>>,
    }

    impl TreeWalker for MemoryWalker {
        fn walk(&self, base: &Path, filter: &PathFilter) -> Result<WalkOutcome> {
            // HashMap order is arbitrary on purpose
            let files = self
                .files
                .keys()
                .filter(|p| filter.matches(p))
                .map(|p| WalkedFile {
                    relative: p.clone(),
                    absolute: base.join(p),
                })
                .collect();
            Ok(WalkOutcome {
                files,
                warnings: vec![],
            })
        }

        fn open(&self, file: &WalkedFile) -> io::Result<Box<dyn Read + Send>> {
            match self.files.get(&file.relative) {
                Some(Some(data)) => Ok(Box::new(Cursor::new(data.clone()))),
                _ => Err(io::Error::new(io::ErrorKind::PermissionDenied, "locked")),
            }
        }
    }

    fn memory(files: &[(&str, Option<&[u8]>)]) -> Snapshotter<MemoryWalker> {
        let files = files
            .iter()
            .map(|(p, d)| (p.to_string(), d.map(|d| d.to_vec())))
            .collect();
        Snapshotter::new(MemoryWalker { files }, ContentHasher::default())
    }

    #[test]
    fn output_is_lexically_ordered() {
        let snapshotter = memory(&[
            ("b/z.txt", Some(b"z")),
            ("a.txt", Some(b"a")),
            ("b.txt", Some(b"b")),
            ("a/b.txt", Some(b"ab")),
        ]);
        let report = snapshotter
            .snapshot(Path::new("/base"), &PathFilter::accept_all(), &CancelToken::new())
            .unwrap();
        let paths: Vec<&str> = report.snapshot.iter().map(|(p, _)| p).collect();
        assert_eq!(paths, vec!["a.txt", "a/b.txt", "b.txt", "b/z.txt"]);
    }

    #[test]
    fn unreadable_file_becomes_warning() {
        let snapshotter = memory(&[("ok.txt", Some(b"fine")), ("locked.db", None)]);
        let report = snapshotter
            .snapshot(Path::new("/base"), &PathFilter::accept_all(), &CancelToken::new())
            .unwrap();
        assert_eq!(report.snapshot.len(), 1);
        assert!(report.snapshot.contains("ok.txt"));
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].path, "locked.db");
    }

    #[test]
    fn unreadable_paths_keep_their_previous_digest() {
        let hasher = ContentHasher::default();
        let previous: Snapshot = [
            ("conf", "c"),
            ("conf-old/x", "o"),
            ("conf/a", "a"),
            ("conf/b", "b"),
            ("locked.db", "l"),
            ("gone.txt", "g"),
        ]
        .into_iter()
        .map(|(p, d)| (p.to_string(), hasher.hash_bytes(d.as_bytes())))
        .collect();

        let mut current = Snapshot::new();
        current.insert("conf/a", hasher.hash_bytes(b"a2"));
        let warnings = vec![
            ScanWarning {
                path: "locked.db".into(),
                error: "locked".into(),
            },
            ScanWarning {
                path: "conf".into(),
                error: "permission denied".into(),
            },
        ];

        assert_eq!(current.carry_forward(&previous, &warnings), 3);
        assert_eq!(current.get("locked.db"), previous.get("locked.db"));
        assert_eq!(current.get("conf/b"), previous.get("conf/b"));
        assert_eq!(current.get("conf"), previous.get("conf"));
        // freshly hashed entries win
        assert_eq!(current.get("conf/a"), Some(&hasher.hash_bytes(b"a2")));
        assert!(!current.contains("conf-old/x"));
        assert!(!current.contains("gone.txt"));

        let mut everything = Snapshot::new();
        let root = [ScanWarning {
            path: String::new(),
            error: "unreadable".into(),
        }];
        assert_eq!(everything.carry_forward(&previous, &root), previous.len());
    }

    #[test]
    fn unrepresentable_path_becomes_warning() {
        let snapshotter = memory(&[("my file.txt", Some(b"x")), ("ok.txt", Some(b"y"))]);
        let report = snapshotter
            .snapshot(Path::new("/base"), &PathFilter::accept_all(), &CancelToken::new())
            .unwrap();
        assert_eq!(report.snapshot.len(), 1);
        assert_eq!(report.warnings[0].path, "my file.txt");
    }

    #[test]
    fn cancelled_scan_produces_nothing() {
        let snapshotter = memory(&[("a.txt", Some(b"a"))]);
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = snapshotter
            .snapshot(Path::new("/base"), &PathFilter::accept_all(), &cancel)
            .unwrap_err();
        assert!(matches!(err, DriftError::Cancelled));
    }

    #[test]
    fn fs_walker_honours_filters() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("conf/cache")).unwrap();
        std::fs::create_dir_all(root.join("logs")).unwrap();
        std::fs::write(root.join("conf/app.xml"), b"<app/>").unwrap();
        std::fs::write(root.join("conf/cache/tmp.bin"), b"tmp").unwrap();
        std::fs::write(root.join("conf/secret.xml"), b"s").unwrap();
        std::fs::write(root.join("logs/app.log"), b"log").unwrap();

        let definition = Definition::new("app", root)
            .include("conf")
            .exclude("conf/cache")
            .exclude("conf/secret.xml");
        let snapshotter = Snapshotter::new(FsWalker, ContentHasher::default());
        let report = snapshotter
            .snapshot_definition(&definition, &CancelToken::new())
            .unwrap();

        let paths: Vec<&str> = report.snapshot.iter().map(|(p, _)| p).collect();
        assert_eq!(paths, vec!["conf/app.xml"]);
        assert_eq!(
            report.snapshot.get("conf/app.xml"),
            Some(&ContentHasher::default().hash_bytes(b"<app/>"))
        );
        assert_eq!(report.bytes_hashed, 6);
    }

    #[cfg(unix)]
    #[test]
    fn fs_walker_skips_symlinks() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        std::fs::write(root.join("real.txt"), b"data").unwrap();
        std::os::unix::fs::symlink(root.join("real.txt"), root.join("link.txt")).unwrap();

        let snapshotter = Snapshotter::new(FsWalker, ContentHasher::default());
        let report = snapshotter
            .snapshot(root, &PathFilter::accept_all(), &CancelToken::new())
            .unwrap();
        assert_eq!(report.snapshot.len(), 1);
        assert!(report.snapshot.contains("real.txt"));
    }

    #[test]
    fn missing_base_directory_is_io_error() {
        let dir = tempdir().unwrap();
        let snapshotter = Snapshotter::new(FsWalker, ContentHasher::default());
        let err = snapshotter
            .snapshot(
                &dir.path().join("nope"),
                &PathFilter::accept_all(),
                &CancelToken::new(),
            )
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
