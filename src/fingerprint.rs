//! Request fingerprints and the on-disk cache of matcher responses.
//!
//! The cache file is a single JSON object mapping fingerprint to the raw
//! response text. It is read once when configured and rewritten as a whole
//! on every flush.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use sha2::{Digest, Sha256};

use crate::error::CacheError;

/// Deterministic key for a serialized request body.
///
/// The body must already be in canonical form; two bodies that differ in any
/// byte are treated as different requests. Colliding keys are taken as real
/// hits.
pub fn fingerprint(body: &str) -> String {
    let digest = Sha256::digest(body.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix).to_string()
}

/// Response cache keyed by request fingerprint.
///
/// Not synchronized: one process, one thread, one cache file.
#[derive(Debug, Default)]
pub struct FingerprintCache {
    path: Option<PathBuf>,
    entries: BTreeMap<String, String>,
}

impl FingerprintCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a backing file and load its contents if it exists.
    pub fn configure(&mut self, path: impl Into<PathBuf>) -> Result<(), CacheError> {
        let path = path.into();

        if path.is_file() {
            let text = fs::read_to_string(&path).map_err(|source| CacheError::Io {
                path: path.clone(),
                source,
            })?;
            self.entries = serde_json::from_str(&text).map_err(|source| CacheError::Corrupt {
                path: path.clone(),
                source,
            })?;
            info!(
                "Loaded {} cached responses from {}",
                self.entries.len(),
                path.display()
            );
        } else {
            debug!("Cache file {} does not exist yet", path.display());
        }

        self.path = Some(path);
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn put(&mut self, key: impl Into<String>, text: impl Into<String>) {
        self.entries.insert(key.into(), text.into());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write all entries to the backing file. No-op until configured.
    pub fn flush(&self) -> Result<(), CacheError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|source| CacheError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }

        let text = serde_json::to_string(&self.entries)?;
        fs::write(path, text).map_err(|source| CacheError::Io {
            path: path.clone(),
            source,
        })?;
        debug!("Flushed {} cache entries to {}", self.entries.len(), path.display());
        Ok(())
    }
}
