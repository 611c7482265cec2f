//! Persistent results, keyed by task hash.
//!
//! A storage maps a [`Hash32`] to an opaque blob (the CBOR encoding of a
//! [`Value`](crate::Value)). Entries are only ever added: inserting under a
//! hash that is already present leaves the existing blob untouched. Since a
//! hash determines its result, concurrent writers of the same key agree on
//! the content and the first one wins.
//!
//! The one exception is a blob that can't be decoded. The session calls
//! [`Storage::discard`] on it before recomputing, so that the fresh result
//! can take its place.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use camino::{Utf8Path, Utf8PathBuf};

use crate::core::Hash32;

pub trait Storage: Send + Sync {
    /// Reads the blob stored under `hash`, if any.
    fn get(&self, hash: &Hash32) -> std::io::Result<Option<Vec<u8>>>;

    /// Stores `blob` unless `hash` is already present. Returns whether the
    /// blob was written.
    fn insert(&self, hash: &Hash32, blob: &[u8]) -> std::io::Result<bool>;

    fn contains(&self, hash: &Hash32) -> std::io::Result<bool> {
        Ok(self.get(hash)?.is_some())
    }

    /// Drops the entry under `hash`, which was found to be corrupt. Removing
    /// an absent entry is not an error.
    fn discard(&self, _hash: &Hash32) -> std::io::Result<()> {
        Ok(())
    }
}

impl<S> Storage for Arc<S>
where
    S: Storage + ?Sized,
{
    fn get(&self, hash: &Hash32) -> std::io::Result<Option<Vec<u8>>> {
        (**self).get(hash)
    }

    fn insert(&self, hash: &Hash32, blob: &[u8]) -> std::io::Result<bool> {
        (**self).insert(hash, blob)
    }

    fn contains(&self, hash: &Hash32) -> std::io::Result<bool> {
        (**self).contains(hash)
    }

    fn discard(&self, hash: &Hash32) -> std::io::Result<()> {
        (**self).discard(hash)
    }
}

/// Storage that lives as long as the process. Share it between sessions
/// through an `Arc`.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    blobs: RwLock<HashMap<Hash32, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Storage for MemoryStorage {
    fn get(&self, hash: &Hash32) -> std::io::Result<Option<Vec<u8>>> {
        let blobs = self.blobs.read().unwrap_or_else(|e| e.into_inner());
        Ok(blobs.get(hash).cloned())
    }

    fn insert(&self, hash: &Hash32, blob: &[u8]) -> std::io::Result<bool> {
        let mut blobs = self.blobs.write().unwrap_or_else(|e| e.into_inner());
        if blobs.contains_key(hash) {
            return Ok(false);
        }
        blobs.insert(*hash, blob.to_vec());
        Ok(true)
    }

    fn contains(&self, hash: &Hash32) -> std::io::Result<bool> {
        let blobs = self.blobs.read().unwrap_or_else(|e| e.into_inner());
        Ok(blobs.contains_key(hash))
    }

    fn discard(&self, hash: &Hash32) -> std::io::Result<()> {
        let mut blobs = self.blobs.write().unwrap_or_else(|e| e.into_inner());
        blobs.remove(hash);
        Ok(())
    }
}

/// One file per entry, `<root>/<2 hex>/<64 hex>.cbor`.
///
/// Blobs are written to a temporary file first and then hard linked into
/// place, which fails if the target already exists. Readers therefore never
/// see a partially written entry, and an entry is never replaced.
///
/// Discarded entries are moved aside to `<64 hex>.corrupt` next to where
/// they were, for inspection.
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: Utf8PathBuf,
}

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

impl FileStorage {
    pub fn open(root: impl Into<Utf8PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(FileStorage { root })
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn path(&self, hash: &Hash32) -> Utf8PathBuf {
        let hex = hash.to_hex();
        self.root.join(&hex[..2]).join(hex).with_extension("cbor")
    }
}

impl Storage for FileStorage {
    fn get(&self, hash: &Hash32) -> std::io::Result<Option<Vec<u8>>> {
        match std::fs::read(self.path(hash)) {
            Ok(blob) => Ok(Some(blob)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn insert(&self, hash: &Hash32, blob: &[u8]) -> std::io::Result<bool> {
        let path = self.path(hash);
        if path.exists() {
            return Ok(false);
        }

        let Some(dir) = path.parent() else {
            return Err(std::io::Error::other(format!("no parent for {path}")));
        };
        std::fs::create_dir_all(dir)?;

        let temp = dir.join(format!(
            ".{}.{}.{}.tmp",
            hash.short(),
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::write(&temp, blob)?;

        // hard link with fallback to rename
        let written = match std::fs::hard_link(&temp, &path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(_) if path.exists() => Ok(false),
            Err(_) => std::fs::rename(&temp, &path).map(|()| true),
        };

        match std::fs::remove_file(&temp) {
            Err(e) if e.kind() != ErrorKind::NotFound => {
                tracing::warn!("couldn't remove {temp}: {e}");
            }
            _ => {}
        }

        written
    }

    fn contains(&self, hash: &Hash32) -> std::io::Result<bool> {
        Ok(self.path(hash).exists())
    }

    fn discard(&self, hash: &Hash32) -> std::io::Result<()> {
        let path = self.path(hash);
        match std::fs::rename(&path, path.with_extension("corrupt")) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}
