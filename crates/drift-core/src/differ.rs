//! Snapshot comparison.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::changeset::{split_path, DirectoryEntry, FileEntry};
use crate::snapshot::Snapshot;

/// Merge-walk `previous` and `current` in lexical order and classify every
/// path that differs. Unchanged files produce nothing, so an identical pair
/// yields no directory entries at all.
pub fn diff(previous: &Snapshot, current: &Snapshot) -> Vec<DirectoryEntry> {
    let mut changes: Vec<(String, FileEntry)> = Vec::new();
    let mut prev = previous.iter().peekable();
    let mut cur = current.iter().peekable();

    loop {
        let order = match (prev.peek(), cur.peek()) {
            (None, None) => break,
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some((p, _)), Some((c, _))) => p.cmp(c),
        };

        match order {
            Ordering::Less => {
                if let Some((path, digest)) = prev.next() {
                    changes.push(entry_for(path, |file| FileEntry::removed(file, *digest)));
                }
            }
            Ordering::Greater => {
                if let Some((path, digest)) = cur.next() {
                    changes.push(entry_for(path, |file| FileEntry::added(file, *digest)));
                }
            }
            Ordering::Equal => {
                if let (Some((path, old)), Some((_, new))) = (prev.next(), cur.next()) {
                    if old != new {
                        changes.push(entry_for(path, |file| FileEntry::changed(file, *old, *new)));
                    }
                }
            }
        }
    }

    group(changes)
}

/// Full inventory of `snapshot`: every file reported as added. This is the
/// body of a coverage change-set.
pub fn coverage(snapshot: &Snapshot) -> Vec<DirectoryEntry> {
    diff(&Snapshot::new(), snapshot)
}

fn entry_for(path: &str, make: impl FnOnce(&str) -> FileEntry) -> (String, FileEntry) {
    let (directory, file) = split_path(path);
    (directory.to_string(), make(file))
}

/// Group entries by parent directory. Files of one directory are not
/// contiguous in lexical path order ("a/b.txt" < "a/b/c.txt" < "a/c.txt"),
/// so bucket through an ordered map.
fn group(changes: Vec<(String, FileEntry)>) -> Vec<DirectoryEntry> {
    let mut buckets: BTreeMap<String, Vec<FileEntry>> = BTreeMap::new();
    for (directory, entry) in changes {
        buckets.entry(directory).or_default().push(entry);
    }
    buckets
        .into_iter()
        .map(|(directory, files)| DirectoryEntry::with_files(directory, files))
        .collect()
}
