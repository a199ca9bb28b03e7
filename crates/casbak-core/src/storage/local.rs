//! Local-directory backend: content objects live as plain files under a
//! destination root, written atomically via a same-directory temp file so a
//! crash never leaves a partial object behind.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::addr;
use crate::error::{CasbakError, Result};
use crate::storage::{validate_key, StorageBackend, UploadOutcome, MANIFEST_PREFIX};

pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    /// Create a backend rooted at `destination`, creating the directory if
    /// it does not exist yet.
    pub fn new(destination: &str) -> Result<Self> {
        let root = PathBuf::from(destination);
        fs::create_dir_all(&root).map_err(|e| {
            CasbakError::Storage(format!("cannot create destination '{destination}': {e}"))
        })?;
        let root = root.canonicalize().map_err(|e| {
            CasbakError::Storage(format!("cannot resolve destination '{destination}': {e}"))
        })?;
        Ok(Self { root })
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    /// Copy a source file into place through a temp file in the target
    /// directory, then rename. Readers never observe a partial object.
    fn atomic_copy(&self, src: &Path, dest: &Path) -> io::Result<()> {
        let dir = dest.parent().unwrap_or(&self.root);
        fs::create_dir_all(dir)?;
        let tmp = tempfile::NamedTempFile::new_in(dir)?;
        let mut reader = fs::File::open(src)?;
        let mut writer = tmp.as_file();
        io::copy(&mut reader, &mut writer)?;
        tmp.persist(dest).map_err(|e| e.error)?;
        Ok(())
    }

    fn atomic_write(&self, dest: &Path, data: &[u8]) -> io::Result<()> {
        use std::io::Write;
        let dir = dest.parent().unwrap_or(&self.root);
        fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(data)?;
        tmp.persist(dest).map_err(|e| e.error)?;
        Ok(())
    }

    /// A single unreadable entry must not lose the rest of the index, so
    /// per-entry failures are logged and skipped; only an unreadable `dir`
    /// itself bubbles up.
    fn collect_digests(&self, dir: &Path, out: &mut HashMap<String, u64>) -> io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            let path = entry.path();
            let file_type = match entry.file_type() {
                Ok(ft) => ft,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            if file_type.is_dir() {
                if let Err(e) = self.collect_digests(&path, out) {
                    warn!(path = %path.display(), error = %e, "skipping unreadable directory");
                }
            } else if file_type.is_file() {
                if let Some(digest) = digest_of_stored(&path) {
                    match entry.metadata() {
                        Ok(meta) => {
                            out.insert(digest, meta.len());
                        }
                        Err(e) => {
                            warn!(path = %path.display(), error = %e, "skipping unreadable entry");
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// Digest of a stored object: the persisted stamp when present, otherwise
/// derived from the content-addressed file name.
fn digest_of_stored(path: &Path) -> Option<String> {
    #[cfg(unix)]
    {
        if let Ok(Some(bytes)) = xattr::get(path, "user.md5_hash_value") {
            if let Ok(value) = String::from_utf8(bytes) {
                return Some(value);
            }
        }
    }
    let name = path.file_name()?.to_str()?;
    addr::digest_from_key(name)
}

/// Stamp the content digest onto a stored object so later index builds can
/// read it without re-deriving from the name. Best-effort.
#[cfg(unix)]
pub fn stamp_local_digest(path: &Path, digest: &str) {
    if let Err(e) = xattr::set(path, "user.md5_hash_value", digest.as_bytes()) {
        debug!(path = %path.display(), error = %e, "cannot stamp stored object digest");
    }
}

impl StorageBackend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    fn upload_file(&self, path: &Path, key: &str) -> Result<UploadOutcome> {
        let dest = self.resolve(key)?;
        if dest.is_file() {
            debug!(key, "destination object already present");
            return Ok(UploadOutcome::AlreadyPresent);
        }
        match self.atomic_copy(path, &dest) {
            Ok(()) => {
                #[cfg(unix)]
                if let Some(digest) = addr::digest_from_key(key) {
                    stamp_local_digest(&dest, &digest);
                }
                Ok(UploadOutcome::Uploaded)
            }
            Err(e) => {
                warn!(key, error = %e, "local copy failed");
                Ok(UploadOutcome::Failed)
            }
        }
    }

    fn put_bytes(&self, key: &str, data: &[u8]) -> Result<()> {
        let dest = self.resolve(key)?;
        self.atomic_write(&dest, data)
            .map_err(|e| CasbakError::Storage(format!("write '{key}': {e}")))
    }

    fn digest_index(&self) -> Result<HashMap<String, u64>> {
        let mut digests = HashMap::new();
        // An unreachable destination root is fatal; anything below it is
        // skipped and logged so one bad entry cannot empty the index.
        for entry in fs::read_dir(&self.root)? {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(root = %self.root.display(), error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            if entry.file_name() == MANIFEST_PREFIX {
                continue;
            }
            let path = entry.path();
            let file_type = match entry.file_type() {
                Ok(ft) => ft,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            if file_type.is_dir() {
                if let Err(e) = self.collect_digests(&path, &mut digests) {
                    warn!(path = %path.display(), error = %e, "skipping unreadable directory");
                }
            } else if file_type.is_file() {
                if let Some(digest) = digest_of_stored(&path) {
                    match entry.metadata() {
                        Ok(meta) => {
                            digests.insert(digest, meta.len());
                        }
                        Err(e) => {
                            warn!(path = %path.display(), error = %e, "skipping unreadable entry");
                        }
                    }
                }
            }
        }
        Ok(digests)
    }
}
