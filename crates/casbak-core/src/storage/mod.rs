//! Destination abstraction. A backend stores content-addressed objects and
//! run manifests; the pipeline only ever talks to the [`StorageBackend`]
//! trait, so local directories, S3-compatible stores, and in-memory test
//! doubles are interchangeable.

mod local;
#[cfg(unix)]
pub use local::stamp_local_digest;
pub use local::LocalBackend;

mod s3;
pub use s3::S3Backend;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::config::StorageConfig;
use crate::error::{CasbakError, Result};

/// Keys under this prefix hold run manifests, not content objects; the
/// digest index skips them.
pub const MANIFEST_PREFIX: &str = "metadata";

/// The outcome of a single upload attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    /// The object was transferred this call.
    Uploaded,
    /// The object was already present; nothing transferred.
    AlreadyPresent,
    /// A transient failure; the caller may retry.
    Failed,
}

pub trait StorageBackend: Send + Sync {
    /// Short label for log lines.
    fn name(&self) -> &str;

    /// Store the file at `path` under the content-addressed `key`.
    /// Idempotent: uploading a key that already exists reports
    /// [`UploadOutcome::AlreadyPresent`] without transferring.
    ///
    /// Transient failures are reported as [`UploadOutcome::Failed`], not as
    /// errors; `Err` is reserved for conditions retrying cannot fix (an
    /// unsafe key, a missing destination root).
    fn upload_file(&self, path: &Path, key: &str) -> Result<UploadOutcome>;

    /// Store raw bytes under `key`, overwriting. Used for run manifests.
    fn put_bytes(&self, key: &str, data: &[u8]) -> Result<()>;

    /// Enumerate the content objects already at the destination, mapping
    /// each recognizable digest to its stored size. Keys under
    /// [`MANIFEST_PREFIX`] and keys that do not look content-addressed are
    /// skipped, never fatal.
    fn digest_index(&self) -> Result<HashMap<String, u64>>;
}

/// Build the configured backend. Unknown `kind` values have already been
/// rejected or downgraded by config validation.
pub fn backend_from_config(cfg: &StorageConfig) -> Result<Arc<dyn StorageBackend>> {
    match cfg.kind.as_str() {
        "s3" => {
            let s3 = cfg
                .s3
                .as_ref()
                .ok_or_else(|| CasbakError::Config("storage.s3 section missing".into()))?;
            Ok(Arc::new(S3Backend::new(s3)?))
        }
        _ => {
            let local = cfg
                .local
                .as_ref()
                .ok_or_else(|| CasbakError::Config("storage.local section missing".into()))?;
            Ok(Arc::new(LocalBackend::new(&local.destination)?))
        }
    }
}

/// Reject keys that could escape the destination root.
pub(crate) fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(CasbakError::Storage("unsafe storage key: empty".into()));
    }
    if key.starts_with('/') || key.starts_with('\\') {
        return Err(CasbakError::Storage(format!(
            "unsafe storage key: absolute path '{key}'"
        )));
    }
    if key.contains('\\') {
        return Err(CasbakError::Storage(format!(
            "unsafe storage key: contains backslash '{key}'"
        )));
    }
    for component in Path::new(key).components() {
        if component == std::path::Component::ParentDir {
            return Err(CasbakError::Storage(format!(
                "unsafe storage key: parent traversal '{key}'"
            )));
        }
    }
    Ok(())
}
