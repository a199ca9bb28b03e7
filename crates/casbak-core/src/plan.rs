//! Change planning: classifies every scanned record as due or already
//! backed up, and turns the due set into deduplicated upload tasks — at
//! most one task per digest per run, no matter how many files share it.

use std::collections::HashMap;
use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::addr;
use crate::attrs::{self, AttributeCache};
use crate::config::JobConfig;
use crate::hash::{self, EMPTY_DIGEST};
use crate::scan::FileRecord;

/// One pending upload. `owners` lists every source file sharing the digest
/// this run, with its scan-time modified time; all of them get their
/// backup-confirmed marker stamped when the single transfer succeeds.
#[derive(Debug, Clone)]
pub struct UploadTask {
    pub digest: String,
    pub key: String,
    /// The first-discovered file with this digest; its bytes are read.
    pub source: PathBuf,
    pub size: u64,
    pub owners: Vec<(PathBuf, i64)>,
    pub attempt: u32,
}

#[derive(Debug, Default)]
pub struct UploadPlan {
    pub tasks: Vec<UploadTask>,
    /// Files flagged queued in the manifest (includes digest sharers).
    pub queued_files: usize,
    /// Unique content bytes to transfer (one count per task).
    pub queued_bytes: u64,
}

/// Classify all records and build the deduplicated task list.
///
/// `remote` is the destination digest index; `Some` in safe mode, `None`
/// in fast mode. Safe mode trusts the remote over local markers: a digest
/// present remotely is recorded as backed up (when the digest is current),
/// a digest present with a different stored size is logged and re-uploaded.
/// Fast mode trusts only the per-job marker and never queries the remote.
pub fn build_plan(
    records: &mut [FileRecord],
    remote: Option<&HashMap<String, u64>>,
    cfg: &JobConfig,
    cache: &AttributeCache,
) -> UploadPlan {
    let backup_attr = attrs::backup_attr(&cfg.name);
    let mut plan = UploadPlan::default();
    let mut task_by_digest: HashMap<String, usize> = HashMap::new();

    for record in records.iter_mut() {
        let Some(digest) = record.digest.clone() else {
            warn!(path = %record.path.display(), "no digest, skipping file");
            continue;
        };

        let due = match remote {
            Some(index) => match index.get(&digest) {
                None => true,
                Some(&stored) if stored != record.size && !hash::is_link_digest(&digest) => {
                    warn!(
                        path = %record.path.display(),
                        digest,
                        local_size = record.size,
                        stored_size = stored,
                        "digest present with mismatched size, re-uploading"
                    );
                    true
                }
                Some(_) => {
                    // Already present remotely. Bring the local marker up to
                    // date so later fast-mode runs skip this file, but only
                    // when the digest is known-current.
                    if record.digest_mtime_ns == Some(record.mtime_ns)
                        && record.backup_mtime_ns != Some(record.mtime_ns)
                    {
                        cache.set(&record.path, &backup_attr, &record.mtime_ns.to_string());
                        record.backup_mtime_ns = Some(record.mtime_ns);
                    }
                    false
                }
            },
            None => record.backup_mtime_ns != Some(record.mtime_ns),
        };
        if !due {
            continue;
        }

        if record.is_symlink {
            // Links carry no uploadable content; the synthetic digest in
            // the cache is their whole backup.
            cache.set(&record.path, &backup_attr, &record.mtime_ns.to_string());
            record.backup_mtime_ns = Some(record.mtime_ns);
            continue;
        }

        // The file needs uploading, so any existing marker is a lie now —
        // even a current-looking one in safe mode, where the remote is the
        // authority. Drop it; it is re-stamped only by a confirmed upload.
        if record.backup_mtime_ns.is_some() {
            cache.remove(&record.path, &backup_attr);
            record.backup_mtime_ns = None;
        }

        if record.size == 0 || digest == EMPTY_DIGEST {
            debug!(path = %record.path.display(), "zero-length file, nothing to upload");
            continue;
        }

        record.queued = true;
        plan.queued_files += 1;

        match task_by_digest.get(&digest) {
            Some(&idx) => {
                plan.tasks[idx]
                    .owners
                    .push((record.path.clone(), record.mtime_ns));
            }
            None => {
                let key = addr::dest_key(&digest, &record.extension, cfg.target_depth);
                task_by_digest.insert(digest.clone(), plan.tasks.len());
                plan.queued_bytes += record.size;
                plan.tasks.push(UploadTask {
                    digest,
                    key,
                    source: record.path.clone(),
                    size: record.size,
                    owners: vec![(record.path.clone(), record.mtime_ns)],
                    attempt: 0,
                });
            }
        }
    }

    info!(
        scanned = records.len(),
        queued = plan.queued_files,
        tasks = plan.tasks.len(),
        bytes = plan.queued_bytes,
        "change plan built"
    );
    plan
}
