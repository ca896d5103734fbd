//! Drift detection core: snapshotting, diffing, the change-set format and
//! versioned change-set chains.

pub mod chain;
pub mod changeset;
pub mod codec;
pub mod content_store;
pub mod definition;
pub mod differ;
pub mod errors;
pub mod hasher;
pub mod paths;
pub mod settings;
pub mod snapshot;
pub mod store;

pub use chain::{Admission, ChangeSetChain};
pub use changeset::{Category, ChangeKind, ChangeSet, DirectoryEntry, FileEntry};
pub use definition::{Definition, HandlingMode, PathFilter};
pub use errors::{DriftError, FormatIssue, Result, SequencingIssue};
pub use hasher::{ContentHasher, Digest, HashAlgorithm};
pub use snapshot::{CancelToken, FsWalker, Snapshot, Snapshotter, TreeWalker};
pub use store::{ChangeSetStore, FsChangeSetStore, MemoryChangeSetStore};
