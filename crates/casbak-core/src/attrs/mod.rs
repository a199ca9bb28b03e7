//! Per-file, per-attribute persistent key/value store layered on OS file
//! metadata, with an in-memory cache for repeated reads within a run.
//!
//! Persistent failures never abort a run: a failed read or write is logged
//! and the attribute is treated as absent, so correctness degrades to
//! "re-hash everything" instead of crashing.

mod platform;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use tracing::{debug, warn};

/// Cached content digest of the file.
pub const ATTR_HASH_VALUE: &str = "md5_hash_value";
/// Modified-time at which the digest was computed.
pub const ATTR_HASH_MTIME: &str = "md5_hash_mtime";

/// Per-job backup-confirmed marker name: `<job>_backup_mtime`.
pub fn backup_attr(job_name: &str) -> String {
    format!("{job_name}_backup_mtime")
}

/// Two-layer attribute store: an in-memory map over the platform's
/// persistent per-file metadata slots. Values are UTF-8 strings.
///
/// The in-memory layer caches absence too, so `preload` followed by `get`
/// never touches the persistent store twice for the same key.
#[derive(Default)]
pub struct AttributeCache {
    mem: RwLock<HashMap<PathBuf, HashMap<String, Option<String>>>>,
}

impl AttributeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read an attribute, consulting the in-memory layer first.
    pub fn get(&self, path: &Path, attr: &str) -> Option<String> {
        {
            let mem = self.mem.read().unwrap();
            if let Some(known) = mem.get(path).and_then(|attrs| attrs.get(attr)) {
                return known.clone();
            }
        }
        let value = self.read_persistent(path, attr);
        let mut mem = self.mem.write().unwrap();
        mem.entry(path.to_path_buf())
            .or_default()
            .insert(attr.to_string(), value.clone());
        value
    }

    /// Write an attribute to both layers synchronously. A persistent-store
    /// failure is logged and the attribute is remembered as absent.
    pub fn set(&self, path: &Path, attr: &str, value: &str) {
        let stored = match platform::write_attr(path, attr, value) {
            Ok(()) => Some(value.to_string()),
            Err(e) => {
                warn!(
                    path = %path.display(),
                    attr,
                    error = %e,
                    "failed to persist file attribute"
                );
                None
            }
        };
        let mut mem = self.mem.write().unwrap();
        mem.entry(path.to_path_buf())
            .or_default()
            .insert(attr.to_string(), stored);
    }

    /// Remove an attribute from both layers. Best-effort on the persistent
    /// side; absence afterwards is guaranteed in the in-memory layer.
    pub fn remove(&self, path: &Path, attr: &str) {
        if let Err(e) = platform::remove_attr(path, attr) {
            debug!(
                path = %path.display(),
                attr,
                error = %e,
                "failed to remove file attribute"
            );
        }
        let mut mem = self.mem.write().unwrap();
        mem.entry(path.to_path_buf())
            .or_default()
            .insert(attr.to_string(), None);
    }

    /// Bulk-warm the in-memory layer for all given paths and attributes,
    /// avoiding one persistent-store round trip per later lookup.
    pub fn preload<'a>(&self, paths: impl IntoIterator<Item = &'a Path>, attrs: &[&str]) {
        let mut mem = self.mem.write().unwrap();
        for path in paths {
            let entry = mem.entry(path.to_path_buf()).or_default();
            for attr in attrs {
                if entry.contains_key(*attr) {
                    continue;
                }
                let value = self.read_persistent(path, attr);
                entry.insert((*attr).to_string(), value);
            }
        }
    }

    /// Drop the in-memory layer. Persisted values are unaffected.
    pub fn clear(&self) {
        self.mem.write().unwrap().clear();
    }

    fn read_persistent(&self, path: &Path, attr: &str) -> Option<String> {
        match platform::read_attr(path, attr) {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    path = %path.display(),
                    attr,
                    error = %e,
                    "failed to read file attribute, treating as absent"
                );
                None
            }
        }
    }
}
