//! Content digests. Regular files get a streaming MD5 of their bytes;
//! symbolic links get a synthetic digest derived from their target so they
//! participate in change detection without ever being read or uploaded.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel as channel;
use md5::{Digest, Md5};
use tracing::{debug, warn};

use crate::attrs::{self, AttributeCache};
use crate::error::Result;
use crate::scan::FileRecord;

/// Digest recorded for zero-length files. Never enqueued for upload.
pub const EMPTY_DIGEST: &str = "0";

/// Prefix of synthetic symlink digests: `link:<target>`.
pub const LINK_DIGEST_PREFIX: &str = "link:";

/// Sentinel for a symlink whose target could not be read.
pub const LINK_DIGEST_UNKNOWN: &str = "link:?";

pub fn is_link_digest(digest: &str) -> bool {
    digest.starts_with(LINK_DIGEST_PREFIX)
}

/// Stream a file through MD5 in 64 KiB chunks. Returns the lowercase hex
/// digest, or [`EMPTY_DIGEST`] for zero-length files.
pub fn digest_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Md5::new();
    let mut buf = [0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        total += n as u64;
        hasher.update(&buf[..n]);
    }
    if total == 0 {
        return Ok(EMPTY_DIGEST.to_string());
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Synthetic digest for a symbolic link: its target path, not its content.
/// An unreadable link yields [`LINK_DIGEST_UNKNOWN`] rather than an error.
pub fn link_digest(path: &Path) -> String {
    match std::fs::read_link(path) {
        Ok(target) => format!("{LINK_DIGEST_PREFIX}{}", target.to_string_lossy()),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read symlink target");
            LINK_DIGEST_UNKNOWN.to_string()
        }
    }
}

struct HashJob {
    idx: usize,
    path: std::path::PathBuf,
    is_symlink: bool,
}

struct HashOutcome {
    idx: usize,
    digest: Option<String>,
}

/// Compute digests for every record whose cached digest is missing or whose
/// file changed since it was computed (`digest_mtime != mtime`). Work is
/// spread over `limit` hashing threads; all cache writes happen on the
/// calling thread after each result lands.
///
/// A file that fails to hash keeps `digest = None` and is logged; the
/// planner will skip it.
pub fn hash_pending(
    records: &mut [FileRecord],
    cache: &AttributeCache,
    limit: usize,
    cancel: &AtomicBool,
) -> usize {
    let mut jobs = Vec::new();
    for (idx, record) in records.iter().enumerate() {
        let fresh = record.digest.is_some() && record.digest_mtime_ns == Some(record.mtime_ns);
        if fresh {
            continue;
        }
        jobs.push(HashJob {
            idx,
            path: record.path.clone(),
            is_symlink: record.is_symlink,
        });
    }
    if jobs.is_empty() {
        return 0;
    }

    let limit = limit.max(1);
    debug!(pending = jobs.len(), threads = limit, "hashing changed files");

    let (work_tx, work_rx) = channel::bounded::<HashJob>(limit * 2);
    let (result_tx, result_rx) = channel::unbounded::<HashOutcome>();
    let expected = jobs.len();
    let mut hashed = 0usize;

    std::thread::scope(|scope| {
        for _ in 0..limit {
            let work_rx = work_rx.clone();
            let result_tx = result_tx.clone();
            scope.spawn(move || {
                for job in work_rx {
                    if cancel.load(Ordering::Relaxed) {
                        break;
                    }
                    let digest = if job.is_symlink {
                        Some(link_digest(&job.path))
                    } else {
                        match digest_file(&job.path) {
                            Ok(d) => Some(d),
                            Err(e) => {
                                warn!(
                                    path = %job.path.display(),
                                    error = %e,
                                    "failed to hash file"
                                );
                                None
                            }
                        }
                    };
                    if result_tx.send(HashOutcome { idx: job.idx, digest }).is_err() {
                        break;
                    }
                }
            });
        }
        drop(result_tx);
        // Workers hold the only receivers; once they exit, feeding fails
        // fast instead of blocking on the bounded channel.
        drop(work_rx);

        let feeder = scope.spawn(move || {
            for job in jobs {
                if cancel.load(Ordering::Relaxed) {
                    break;
                }
                if work_tx.send(job).is_err() {
                    break;
                }
            }
            // Dropping work_tx closes the channel and lets workers drain out.
        });

        for _ in 0..expected {
            let Ok(outcome) = result_rx.recv() else {
                break;
            };
            let record = &mut records[outcome.idx];
            if let Some(digest) = outcome.digest {
                cache.set(&record.path, attrs::ATTR_HASH_VALUE, &digest);
                cache.set(
                    &record.path,
                    attrs::ATTR_HASH_MTIME,
                    &record.mtime_ns.to_string(),
                );
                record.digest = Some(digest);
                record.digest_mtime_ns = Some(record.mtime_ns);
                hashed += 1;
            }
        }

        let _ = feeder.join();
    });

    hashed
}
