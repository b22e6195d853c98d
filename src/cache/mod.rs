//! Content-addressed cache of compressed outputs.
//!
//! Keyed purely by a digest of the source bytes, never by file name, so
//! identical images from different files share one entry. Entries live in
//! memory and, when a directory is configured, on disk as one file per digest
//! (`<dir>/<hex digest>`, raw bytes, no framing) so they survive across builds.

mod digest;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;

use crate::{debug, log};

pub use digest::ContentDigest;

/// Cache setup failures. Unlike per-asset errors these abort the session.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache directory `{0}` is not usable")]
    Io(PathBuf, #[source] io::Error),
}

/// Content-addressed store (thread-safe).
#[derive(Debug)]
pub struct ContentCache {
    entries: DashMap<ContentDigest, Arc<[u8]>>,
    dir: Option<PathBuf>,
}

impl ContentCache {
    /// In-memory cache scoped to this process.
    pub fn memory() -> Self {
        Self {
            entries: DashMap::new(),
            dir: None,
        }
    }

    /// Disk-backed cache rooted at `dir`, created if missing.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|err| CacheError::Io(dir.clone(), err))?;
        Ok(Self {
            entries: DashMap::new(),
            dir: Some(dir),
        })
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Look up the compressed output previously stored for `source`.
    pub fn get(&self, source: &[u8]) -> Option<Arc<[u8]>> {
        let digest = ContentDigest::of(source);
        if let Some(hit) = self.entries.get(&digest) {
            return Some(Arc::clone(&hit));
        }

        let path = self.entry_path(&digest)?;
        match fs::read(&path) {
            Ok(bytes) => {
                let bytes: Arc<[u8]> = bytes.into();
                self.entries.insert(digest, Arc::clone(&bytes));
                debug!("cache"; "restored {} from disk", digest);
                Some(bytes)
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => {
                log!("cache"; "failed to read {}: {}", path.display(), err);
                None
            }
        }
    }

    /// Store `output` as the compressed form of `source`.
    ///
    /// Writing an identical value again is a no-op; a different value
    /// overwrites the entry.
    pub fn set(&self, source: &[u8], output: &[u8]) {
        let digest = ContentDigest::of(source);
        if self
            .entries
            .get(&digest)
            .is_some_and(|existing| **existing == *output)
        {
            return;
        }
        self.entries.insert(digest, Arc::from(output));

        if let Some(path) = self.entry_path(&digest)
            && let Err(err) = persist(&path, output)
        {
            log!("cache"; "failed to write {}: {}", path.display(), err);
        }
    }

    /// Number of entries held in memory.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entry_path(&self, digest: &ContentDigest) -> Option<PathBuf> {
        self.dir.as_ref().map(|dir| dir.join(digest.to_hex()))
    }
}

/// Check if file content is the same as new content
fn file_content_matches(path: &Path, content: &[u8]) -> bool {
    path.exists() && fs::read(path).is_ok_and(|existing| existing == content)
}

/// Write `content` via a temporary sibling and rename it into place.
fn persist(path: &Path, content: &[u8]) -> io::Result<()> {
    if file_content_matches(path, content) {
        return Ok(());
    }
    let tmp = path.with_extension(format!("tmp-{}", std::process::id()));
    fs::write(&tmp, content)?;
    fs::rename(&tmp, path).inspect_err(|_| {
        fs::remove_file(&tmp).ok();
    })
}
