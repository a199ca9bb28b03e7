//! End-to-end runs against the in-memory backend: scan, hash, plan,
//! manifest, upload, summary.

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use casbak_core::config::{CasbakConfig, JobConfig, StorageConfig};
use casbak_core::run::run_with_backend;
use casbak_core::storage::StorageBackend;
use casbak_core::testutil::{FlakyBackend, MemoryBackend};

fn config_for(dir: &Path, safe_mode: bool) -> CasbakConfig {
    CasbakConfig {
        job: JobConfig {
            sources: vec![dir.join("src").to_string_lossy().into_owned()],
            name: "itest".into(),
            safe_mode,
            dry_run: false,
            target_depth: 2,
            upload_concurrency: 2,
            hash_concurrency: 2,
            max_retries: 2,
            retry_delay_secs: 0,
            manifest_file: dir.join("manifest.csv").to_string_lossy().into_owned(),
            lock_file: dir.join("run.lock").to_string_lossy().into_owned(),
            ignored_files: vec![".DS_Store".into()],
            exclude_patterns: vec![],
        },
        storage: StorageConfig::default(),
    }
}

/// Whether the filesystem under `dir` supports user extended attributes;
/// tests that depend on marker persistence skip themselves when it does not.
#[cfg(unix)]
fn xattr_supported(dir: &Path) -> bool {
    let probe = dir.join("xattr-probe");
    std::fs::write(&probe, b"x").unwrap();
    xattr::set(&probe, "user.casbak_probe", b"1").is_ok()
}

#[test]
fn shared_content_uploads_once_but_flags_every_file() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("src")).unwrap();
    std::fs::write(dir.path().join("src/a.txt"), b"hi").unwrap();
    std::fs::write(dir.path().join("src/b.txt"), b"hi").unwrap();
    std::fs::write(dir.path().join("src/c.txt"), b"bye").unwrap();

    let mem = Arc::new(MemoryBackend::new());
    let backend: Arc<dyn StorageBackend> = mem.clone();
    let cfg = config_for(dir.path(), true);
    let cancel = AtomicBool::new(false);

    let summary = run_with_backend(&cfg, backend, &cancel).unwrap();

    assert_eq!(summary.scanned, 3);
    assert_eq!(summary.queued_files, 3);
    // Two distinct digests, two transfers, three files confirmed saved.
    assert_eq!(mem.upload_count(), 2);
    assert_eq!(summary.saved_files, 3);

    let content_keys: Vec<String> = mem
        .keys()
        .into_iter()
        .filter(|k| !k.starts_with("metadata/"))
        .collect();
    assert_eq!(content_keys.len(), 2);
    for key in &content_keys {
        // depth=2 sharding: "x/y/<digest>.txt"
        let parts: Vec<&str> = key.split('/').collect();
        assert_eq!(parts.len(), 3);
        assert!(parts[2].ends_with(".txt"));
        assert!(parts[2].starts_with(&format!("{}{}", parts[0], parts[1])));
    }

    // Manifest: one line per scanned file, all three flagged queued.
    let manifest = std::fs::read_to_string(dir.path().join("manifest.csv")).unwrap();
    let queued_lines = manifest
        .lines()
        .filter(|l| l.ends_with(",true") && !l.starts_with("dir >> "))
        .count();
    assert_eq!(queued_lines, 3);
}

#[test]
fn second_safe_run_finds_everything_present() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("src")).unwrap();
    std::fs::write(dir.path().join("src/a.txt"), b"hello world").unwrap();

    let mem = Arc::new(MemoryBackend::new());
    let cfg = config_for(dir.path(), true);
    let cancel = AtomicBool::new(false);

    let backend: Arc<dyn StorageBackend> = mem.clone();
    let first = run_with_backend(&cfg, backend, &cancel).unwrap();
    assert_eq!(first.saved_files, 1);

    let backend: Arc<dyn StorageBackend> = mem.clone();
    let second = run_with_backend(&cfg, backend, &cancel).unwrap();
    assert_eq!(second.queued_files, 0);
    assert_eq!(second.saved_files, 0);
    // One content upload total across both runs.
    assert_eq!(mem.upload_count(), 1);
}

#[cfg(unix)]
#[test]
fn fast_mode_marker_survives_between_runs() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("src")).unwrap();
    if !xattr_supported(dir.path()) {
        return;
    }
    std::fs::write(dir.path().join("src/a.txt"), b"hello world").unwrap();

    let mem = Arc::new(MemoryBackend::new());
    let cfg = config_for(dir.path(), false);
    let cancel = AtomicBool::new(false);

    let backend: Arc<dyn StorageBackend> = mem.clone();
    let first = run_with_backend(&cfg, backend, &cancel).unwrap();
    assert_eq!(first.saved_files, 1);
    assert_eq!(first.hashed, 1);

    let backend: Arc<dyn StorageBackend> = mem.clone();
    let second = run_with_backend(&cfg, backend, &cancel).unwrap();
    // Digest and backup marker both come from the attribute cache now.
    assert_eq!(second.hashed, 0);
    assert_eq!(second.queued_files, 0);
    assert_eq!(mem.upload_count(), 1);
}

#[test]
fn transient_failure_recovers_within_retry_budget() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("src")).unwrap();
    std::fs::write(dir.path().join("src/a.txt"), b"hello world").unwrap();

    let flaky = Arc::new(FlakyBackend::new(1));
    let backend: Arc<dyn StorageBackend> = flaky.clone();
    let cfg = config_for(dir.path(), true);
    let cancel = AtomicBool::new(false);

    let summary = run_with_backend(&cfg, backend, &cancel).unwrap();
    assert_eq!(summary.saved_files, 1);
    assert_eq!(summary.failed_tasks, 0);
    assert_eq!(flaky.attempts(), 2);
}

#[test]
fn exhausted_retries_leave_file_unsaved() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("src")).unwrap();
    std::fs::write(dir.path().join("src/a.txt"), b"hello world").unwrap();

    let flaky = Arc::new(FlakyBackend::new(100));
    let backend: Arc<dyn StorageBackend> = flaky.clone();
    let cfg = config_for(dir.path(), true);
    let cancel = AtomicBool::new(false);

    let summary = run_with_backend(&cfg, backend, &cancel).unwrap();
    assert_eq!(summary.saved_files, 0);
    assert_eq!(summary.failed_tasks, 1);
    assert_eq!(flaky.attempts(), cfg.job.max_retries as usize);
}

#[cfg(unix)]
#[test]
fn symlinks_are_never_uploaded() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("src")).unwrap();
    std::fs::write(dir.path().join("src/target.txt"), b"data").unwrap();
    std::os::unix::fs::symlink("target.txt", dir.path().join("src/link.txt")).unwrap();

    let mem = Arc::new(MemoryBackend::new());
    let backend: Arc<dyn StorageBackend> = mem.clone();
    let cfg = config_for(dir.path(), true);
    let cancel = AtomicBool::new(false);

    let summary = run_with_backend(&cfg, backend, &cancel).unwrap();
    assert_eq!(summary.scanned, 2);
    // Only target.txt's content is transferred.
    assert_eq!(mem.upload_count(), 1);
}

#[test]
fn ignored_and_empty_files_produce_no_objects() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("src")).unwrap();
    std::fs::write(dir.path().join("src/.DS_Store"), b"clutter").unwrap();
    std::fs::write(dir.path().join("src/empty.txt"), b"").unwrap();

    let mem = Arc::new(MemoryBackend::new());
    let backend: Arc<dyn StorageBackend> = mem.clone();
    let cfg = config_for(dir.path(), true);
    let cancel = AtomicBool::new(false);

    let summary = run_with_backend(&cfg, backend, &cancel).unwrap();
    // .DS_Store never scanned; the empty file is scanned but not queued.
    assert_eq!(summary.scanned, 1);
    assert_eq!(summary.queued_files, 0);
    assert_eq!(mem.upload_count(), 0);
}
