//! In-memory storage backends for tests: a plain memory store and a flaky
//! wrapper that fails a configurable number of upload attempts first.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::addr;
use crate::error::Result;
use crate::storage::{StorageBackend, UploadOutcome, MANIFEST_PREFIX};

/// Backend holding everything in a mutex-guarded map, recording every
/// upload call so tests can assert on ordering and dedup behavior.
#[derive(Default)]
pub struct MemoryBackend {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    /// Every `upload_file` call in arrival order, including re-attempts.
    pub upload_log: Mutex<Vec<String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seed a content object, as if an earlier run had uploaded it.
    pub fn seed(&self, key: &str, data: &[u8]) {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), data.to_vec());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn upload_count(&self) -> usize {
        self.upload_log.lock().unwrap().len()
    }
}

impl StorageBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    fn upload_file(&self, path: &Path, key: &str) -> Result<UploadOutcome> {
        self.upload_log.lock().unwrap().push(key.to_string());
        if self.contains(key) {
            return Ok(UploadOutcome::AlreadyPresent);
        }
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(_) => return Ok(UploadOutcome::Failed),
        };
        self.objects.lock().unwrap().insert(key.to_string(), data);
        Ok(UploadOutcome::Uploaded)
    }

    fn put_bytes(&self, key: &str, data: &[u8]) -> Result<()> {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn digest_index(&self) -> Result<HashMap<String, u64>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| !k.starts_with(MANIFEST_PREFIX))
            .filter_map(|(k, v)| addr::digest_from_key(k).map(|d| (d, v.len() as u64)))
            .collect())
    }
}

/// Wraps [`MemoryBackend`], failing the first `fail_first` upload attempts
/// before letting the rest through. Exercises the retry path.
pub struct FlakyBackend {
    pub inner: MemoryBackend,
    fail_first: usize,
    attempts: AtomicUsize,
}

impl FlakyBackend {
    pub fn new(fail_first: usize) -> Self {
        Self {
            inner: MemoryBackend::new(),
            fail_first,
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl StorageBackend for FlakyBackend {
    fn name(&self) -> &str {
        "flaky"
    }

    fn upload_file(&self, path: &Path, key: &str) -> Result<UploadOutcome> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.fail_first {
            return Ok(UploadOutcome::Failed);
        }
        self.inner.upload_file(path, key)
    }

    fn put_bytes(&self, key: &str, data: &[u8]) -> Result<()> {
        self.inner.put_bytes(key, data)
    }

    fn digest_index(&self) -> Result<HashMap<String, u64>> {
        self.inner.digest_index()
    }
}
