//! Content-addressed blob store for file content referenced by digests.
//!
//! Blobs live at `<root>/blobs/<2 hex>/<digest>.blob`. Content larger than
//! 4 KiB is zstd-compressed; a one-byte tag in front of every blob records
//! which encoding was used. Reads are verified against the digest.

use parking_lot::Mutex;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::errors::{DriftError, Result};
use crate::hasher::{ContentHasher, Digest};
use crate::store::{cleanup_staging_dir, write_atomic};

const COMPRESSION_THRESHOLD: usize = 4 * 1024; // 4 KiB
const ZSTD_LEVEL: i32 = 3;
const TAG_RAW: u8 = 0;
const TAG_ZSTD: u8 = 1;

pub struct ContentStore {
    blobs_root: PathBuf,
    staging_root: PathBuf,
    hasher: ContentHasher,
    /// Serialises writers so two uploads of one digest don't race the rename.
    write_lock: Mutex<()>,
}

impl ContentStore {
    pub fn open(root: impl AsRef<Path>, hasher: ContentHasher) -> Result<Self> {
        let root = root.as_ref();
        let blobs_root = root.join("blobs");
        let staging_root = root.join("staging");
        for dir in [&blobs_root, &staging_root] {
            fs::create_dir_all(dir).map_err(|e| DriftError::io(dir, e))?;
        }
        cleanup_staging_dir(&staging_root);
        Ok(Self {
            blobs_root,
            staging_root,
            hasher,
            write_lock: Mutex::new(()),
        })
    }

    pub fn has(&self, digest: &Digest) -> bool {
        self.blob_path(digest).exists()
    }

    /// Digests from `wanted` that are not stored yet.
    pub fn missing(&self, wanted: &[Digest]) -> Vec<Digest> {
        wanted.iter().filter(|d| !self.has(d)).copied().collect()
    }

    /// Store `data` under `expected`, refusing bytes that hash differently.
    pub fn put(&self, expected: &Digest, data: &[u8]) -> Result<()> {
        let actual = self.hasher.hash_bytes(data);
        if actual != *expected {
            return Err(DriftError::ContentMismatch {
                expected: expected.to_hex(),
                actual: actual.to_hex(),
            });
        }

        let _guard = self.write_lock.lock();
        let dest = self.blob_path(expected);
        if dest.exists() {
            return Ok(());
        }

        let mut stored = Vec::with_capacity(data.len() + 1);
        if data.len() > COMPRESSION_THRESHOLD {
            stored.push(TAG_ZSTD);
            let compressed = zstd::encode_all(data, ZSTD_LEVEL)
                .map_err(|e| DriftError::io(&dest, e))?;
            stored.extend_from_slice(&compressed);
        } else {
            stored.push(TAG_RAW);
            stored.extend_from_slice(data);
        }
        write_atomic(&self.staging_root, &dest, &stored)?;
        debug!(digest = %expected, size = data.len(), stored = stored.len(), "blob stored");
        Ok(())
    }

    /// Stored content for `digest`, decompressed and verified.
    pub fn get(&self, digest: &Digest) -> Result<Vec<u8>> {
        let path = self.blob_path(digest);
        let mut raw = Vec::new();
        File::open(&path)
            .and_then(|mut f| f.read_to_end(&mut raw))
            .map_err(|e| DriftError::io(&path, e))?;

        let data = match raw.split_first() {
            Some((&TAG_RAW, body)) => body.to_vec(),
            Some((&TAG_ZSTD, body)) => {
                zstd::decode_all(body).map_err(|e| DriftError::io(&path, e))?
            }
            _ => {
                warn!(path = %path.display(), "blob has unknown encoding tag");
                return Err(DriftError::ContentMismatch {
                    expected: digest.to_hex(),
                    actual: "unreadable blob".into(),
                });
            }
        };

        let actual = self.hasher.hash_bytes(&data);
        if actual != *digest {
            warn!(path = %path.display(), "blob content does not match its digest");
            return Err(DriftError::ContentMismatch {
                expected: digest.to_hex(),
                actual: actual.to_hex(),
            });
        }
        Ok(data)
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        let hex = digest.to_hex();
        self.blobs_root.join(&hex[..2]).join(format!("{hex}.blob"))
    }
}
