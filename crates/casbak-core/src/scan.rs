//! Source tree scanning: walks every configured root in order and produces
//! one [`FileRecord`] per regular file or symbolic link encountered.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::UNIX_EPOCH;

use ignore::WalkBuilder;
use tracing::warn;

use crate::attrs::{self, AttributeCache};
use crate::config::JobConfig;
use crate::error::{CasbakError, Result};

/// One scanned filesystem entry. Constructed at scan time, owned by the
/// planner for the duration of the run; the persisted subset (digest and
/// timestamps) lives in the attribute cache keyed by absolute path.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub path: PathBuf,
    /// Parent directory, used for manifest grouping.
    pub dir: PathBuf,
    pub file_name: String,
    /// Original extension including the leading dot, or empty.
    pub extension: String,
    pub size: u64,
    /// Last-modified time as nanoseconds since the Unix epoch.
    pub mtime_ns: i64,
    pub is_symlink: bool,
    /// Content digest, once known (from cache or freshly computed).
    pub digest: Option<String>,
    /// Modified-time at which `digest` was computed, from the cache.
    pub digest_mtime_ns: Option<i64>,
    /// Per-job backup-confirmed timestamp, from the cache.
    pub backup_mtime_ns: Option<i64>,
    /// Set by the planner when this file needs uploading this run.
    pub queued: bool,
}

/// Extension split matching the usual splitext rule: the last dot, unless
/// it is the leading character (dotfiles have no extension).
pub(crate) fn extension_of(file_name: &str) -> String {
    match file_name.rfind('.') {
        Some(0) | None => String::new(),
        Some(idx) => file_name[idx..].to_string(),
    }
}

fn mtime_ns_of(metadata: &std::fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .and_then(|d| i64::try_from(d.as_nanos()).ok())
        .unwrap_or(0)
}

fn build_excludes(root: &Path, patterns: &[String]) -> Result<ignore::gitignore::Gitignore> {
    let mut builder = ignore::gitignore::GitignoreBuilder::new(root);
    for pat in patterns {
        builder
            .add_line(None, pat)
            .map_err(|e| CasbakError::Config(format!("invalid exclude pattern '{pat}': {e}")))?;
    }
    builder
        .build()
        .map_err(|e| CasbakError::Config(format!("exclude matcher build failed: {e}")))
}

/// Walk all source roots in configuration order. Within a root, entries are
/// visited sorted by file name, so directories come out lexicographically
/// grouped — the order the manifest and the dedup tie-break rely on.
///
/// Per-entry walk errors are logged and skipped; a missing source root is a
/// configuration error and fails the run.
pub fn scan_sources(cfg: &JobConfig, cancel: &AtomicBool) -> Result<Vec<FileRecord>> {
    let mut records = Vec::new();

    for source in &cfg.sources {
        let root = Path::new(source);
        if !root.is_dir() {
            return Err(CasbakError::Config(format!(
                "source root does not exist or is not a directory: {source}"
            )));
        }
        let root = root
            .canonicalize()
            .map_err(|e| CasbakError::Config(format!("cannot resolve source '{source}': {e}")))?;

        let excludes = build_excludes(&root, &cfg.exclude_patterns)?;

        let mut walker = WalkBuilder::new(&root);
        walker.follow_links(false);
        walker.hidden(false);
        walker.ignore(false);
        walker.git_ignore(false);
        walker.git_global(false);
        walker.git_exclude(false);
        walker.require_git(false);
        walker.sort_by_file_name(std::ffi::OsStr::cmp);

        let root_for_filter = root.clone();
        walker.filter_entry(move |entry| {
            let path = entry.path();
            if path == root_for_filter {
                return true;
            }
            let rel = path.strip_prefix(&root_for_filter).unwrap_or(path);
            let is_dir = entry.file_type().is_some_and(|ft| ft.is_dir());
            !excludes.matched_path_or_any_parents(rel, is_dir).is_ignore()
        });

        for entry in walker.build() {
            if cancel.load(Ordering::Relaxed) {
                return Ok(records);
            }
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable walk entry");
                    continue;
                }
            };
            let Some(file_type) = entry.file_type() else {
                continue; // stdin entry, cannot happen with path walks
            };
            if file_type.is_dir() {
                continue;
            }

            let path = entry.path();
            let file_name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_string(),
                None => {
                    warn!(path = %path.display(), "skipping file with non-UTF8 name");
                    continue;
                }
            };
            if cfg.ignored_files.iter().any(|ign| ign == &file_name) {
                continue;
            }

            let metadata = match path.symlink_metadata() {
                Ok(m) => m,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unstattable file");
                    continue;
                }
            };

            records.push(FileRecord {
                path: path.to_path_buf(),
                dir: path.parent().unwrap_or(&root).to_path_buf(),
                extension: extension_of(&file_name),
                file_name,
                size: metadata.len(),
                mtime_ns: mtime_ns_of(&metadata),
                is_symlink: file_type.is_symlink(),
                digest: None,
                digest_mtime_ns: None,
                backup_mtime_ns: None,
                queued: false,
            });
        }
    }

    Ok(records)
}

/// Warm the attribute cache for every scanned path and copy the persisted
/// state (digest, digest validity, per-job backup marker) into the records.
pub fn load_cached_state(records: &mut [FileRecord], cache: &AttributeCache, job_name: &str) {
    let backup_attr = attrs::backup_attr(job_name);
    let attr_names = [attrs::ATTR_HASH_VALUE, attrs::ATTR_HASH_MTIME, &backup_attr];
    cache.preload(records.iter().map(|r| r.path.as_path()), &attr_names);

    for record in records.iter_mut() {
        record.digest = cache.get(&record.path, attrs::ATTR_HASH_VALUE);
        record.digest_mtime_ns = cache
            .get(&record.path, attrs::ATTR_HASH_MTIME)
            .and_then(|v| v.parse::<i64>().ok());
        record.backup_mtime_ns = cache
            .get(&record.path, &backup_attr)
            .and_then(|v| v.parse::<i64>().ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JobConfig;

    fn test_job(sources: Vec<String>) -> JobConfig {
        JobConfig {
            sources,
            name: "test".into(),
            safe_mode: false,
            dry_run: false,
            target_depth: 2,
            upload_concurrency: 1,
            hash_concurrency: 1,
            max_retries: 1,
            retry_delay_secs: 0,
            manifest_file: "m.csv".into(),
            lock_file: "l.lock".into(),
            ignored_files: vec![".DS_Store".into()],
            exclude_patterns: vec![],
        }
    }

    #[test]
    fn extension_rules() {
        assert_eq!(extension_of("photo.jpg"), ".jpg");
        assert_eq!(extension_of("archive.tar.gz"), ".gz");
        assert_eq!(extension_of("README"), "");
        assert_eq!(extension_of(".bashrc"), "");
        assert_eq!(extension_of("trailing."), ".");
    }

    #[test]
    fn scan_collects_files_sorted_and_skips_ignored() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("b.txt"), b"b").unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        std::fs::write(dir.path().join(".DS_Store"), b"junk").unwrap();
        std::fs::write(dir.path().join("sub/c.txt"), b"c").unwrap();

        let cfg = test_job(vec![dir.path().to_string_lossy().into_owned()]);
        let cancel = AtomicBool::new(false);
        let records = scan_sources(&cfg, &cancel).unwrap();

        let names: Vec<&str> = records.iter().map(|r| r.file_name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "b.txt", "c.txt"]);
        assert!(records.iter().all(|r| !r.is_symlink));
        assert!(records.iter().all(|r| r.mtime_ns > 0));
    }

    #[test]
    fn scan_respects_exclude_patterns() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("keep.txt"), b"k").unwrap();
        std::fs::write(dir.path().join("skip.tmp"), b"s").unwrap();

        let mut cfg = test_job(vec![dir.path().to_string_lossy().into_owned()]);
        cfg.exclude_patterns = vec!["*.tmp".into()];
        let cancel = AtomicBool::new(false);
        let records = scan_sources(&cfg, &cancel).unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].file_name, "keep.txt");
    }

    #[cfg(unix)]
    #[test]
    fn scan_records_symlinks_without_following() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("target.txt"), b"data").unwrap();
        std::os::unix::fs::symlink("target.txt", dir.path().join("link.txt")).unwrap();

        let cfg = test_job(vec![dir.path().to_string_lossy().into_owned()]);
        let cancel = AtomicBool::new(false);
        let records = scan_sources(&cfg, &cancel).unwrap();

        let link = records.iter().find(|r| r.file_name == "link.txt").unwrap();
        assert!(link.is_symlink);
    }

    #[test]
    fn scan_missing_root_is_config_error() {
        let cfg = test_job(vec!["/nonexistent/casbak-root".into()]);
        let cancel = AtomicBool::new(false);
        assert!(matches!(
            scan_sources(&cfg, &cancel),
            Err(CasbakError::Config(_))
        ));
    }

    #[test]
    fn roots_scanned_in_configuration_order() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        std::fs::write(dir_a.path().join("z.txt"), b"z").unwrap();
        std::fs::write(dir_b.path().join("a.txt"), b"a").unwrap();

        let cfg = test_job(vec![
            dir_a.path().to_string_lossy().into_owned(),
            dir_b.path().to_string_lossy().into_owned(),
        ]);
        let cancel = AtomicBool::new(false);
        let records = scan_sources(&cfg, &cancel).unwrap();
        let names: Vec<&str> = records.iter().map(|r| r.file_name.as_str()).collect();
        // dir_a first even though "z.txt" sorts after "a.txt".
        assert_eq!(names, vec!["z.txt", "a.txt"]);
    }
}
