//! Run orchestration: lock, scan, hash, plan, manifest, upload, summary.
//! The remote index fetch runs on its own thread alongside scanning and
//! hashing and is joined just before planning needs it.

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{info, warn};

use crate::attrs::{self, AttributeCache};
use crate::config::CasbakConfig;
use crate::error::{CasbakError, Result};
use crate::hash::hash_pending;
use crate::lock::InstanceLock;
use crate::manifest;
use crate::pipeline::{self, UploadOptions};
use crate::plan::build_plan;
use crate::scan::{load_cached_state, scan_sources};
use crate::storage::{backend_from_config, StorageBackend};

#[derive(Debug, Default)]
pub struct RunSummary {
    pub scanned: usize,
    pub hashed: usize,
    pub queued_files: usize,
    pub queued_bytes: u64,
    pub saved_files: usize,
    pub saved_bytes: u64,
    pub reused_files: usize,
    pub failed_tasks: usize,
    pub elapsed: Duration,
}

/// Full backup run against the configured backend.
pub fn run_backup(cfg: &CasbakConfig, cancel: &AtomicBool) -> Result<RunSummary> {
    cfg.validate()?;
    let backend = backend_from_config(&cfg.storage)?;
    run_with_backend(cfg, backend, cancel)
}

/// Run against an explicit backend. Split out so tests can inject doubles.
pub fn run_with_backend(
    cfg: &CasbakConfig,
    backend: Arc<dyn StorageBackend>,
    cancel: &AtomicBool,
) -> Result<RunSummary> {
    let _lock = InstanceLock::acquire(Path::new(&cfg.job.lock_file))?;
    let started = Instant::now();

    info!(
        job = %cfg.job.name,
        safe_mode = cfg.job.safe_mode,
        backend = backend.name(),
        "backup run starting"
    );
    if cfg.job.dry_run {
        info!("dry run: no uploads, no attribute changes");
    }

    // Overlap the (potentially slow) destination enumeration with local
    // disk work; the handle is joined right before planning.
    let index_handle = if cfg.job.safe_mode {
        let backend = Arc::clone(&backend);
        Some(std::thread::spawn(move || backend.digest_index()))
    } else {
        None
    };

    let mut records = scan_sources(&cfg.job, cancel)?;
    let cache = AttributeCache::new();
    load_cached_state(&mut records, &cache, &cfg.job.name);
    let hashed = hash_pending(
        &mut records,
        &cache,
        cfg.job.effective_hash_concurrency(),
        cancel,
    );

    let remote = match index_handle {
        Some(handle) => {
            let index = handle
                .join()
                .map_err(|_| CasbakError::Other("remote index fetch panicked".into()))??;
            info!(known_digests = index.len(), "remote index fetched");
            Some(index)
        }
        None => None,
    };

    let plan = build_plan(&mut records, remote.as_ref(), &cfg.job, &cache);
    let queued_files = plan.queued_files;
    let queued_bytes = plan.queued_bytes;

    // Manifest reflects the classification of this run; it is written
    // before uploads begin and uploaded only after they settle.
    let now = Utc::now();
    let doc_lines = cfg.doc_lines(&cfg.redactor());
    let content = manifest::generate(&records, &doc_lines, now)?;
    manifest::persist(Path::new(&cfg.job.manifest_file), &content)?;

    let backup_attr = attrs::backup_attr(&cfg.job.name);
    let opts = UploadOptions {
        concurrency: cfg.job.upload_concurrency,
        max_retries: cfg.job.max_retries,
        retry_delay: cfg.job.retry_delay(),
        dry_run: cfg.job.dry_run,
    };
    let stats = pipeline::run(plan.tasks, &backend, &cache, &backup_attr, &opts, cancel);

    if cfg.job.dry_run {
        info!("dry run: manifest kept local only");
    } else {
        let key = manifest::manifest_key(&cfg.job.name, now);
        manifest::upload(backend.as_ref(), &key, &content);
    }

    let elapsed = started.elapsed();
    let summary = RunSummary {
        scanned: records.len(),
        hashed,
        queued_files,
        queued_bytes,
        saved_files: stats.saved_files,
        saved_bytes: stats.saved_bytes,
        reused_files: stats.reused_files,
        failed_tasks: stats.failed_tasks,
        elapsed,
    };
    let throughput = summary.saved_bytes as f64 / elapsed.as_secs_f64().max(0.001);
    if summary.failed_tasks > 0 {
        warn!(failed = summary.failed_tasks, "some uploads were dropped after retries");
    }
    info!(
        scanned = summary.scanned,
        hashed = summary.hashed,
        queued = summary.queued_files,
        saved_files = summary.saved_files,
        saved_bytes = summary.saved_bytes,
        reused = summary.reused_files,
        elapsed_secs = elapsed.as_secs(),
        throughput_bps = throughput as u64,
        "backup run finished"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{JobConfig, StorageConfig};
    use crate::testutil::MemoryBackend;

    fn config_for(dir: &Path, safe_mode: bool) -> CasbakConfig {
        CasbakConfig {
            job: JobConfig {
                sources: vec![dir.join("src").to_string_lossy().into_owned()],
                name: "test".into(),
                safe_mode,
                dry_run: false,
                target_depth: 2,
                upload_concurrency: 2,
                hash_concurrency: 2,
                max_retries: 2,
                retry_delay_secs: 0,
                manifest_file: dir.join("manifest.csv").to_string_lossy().into_owned(),
                lock_file: dir.join("run.lock").to_string_lossy().into_owned(),
                ignored_files: vec![],
                exclude_patterns: vec![],
            },
            storage: StorageConfig::default(),
        }
    }

    #[test]
    fn safe_mode_run_uploads_missing_content_and_manifest() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/a.txt"), b"hello world").unwrap();

        let mem = Arc::new(MemoryBackend::new());
        let backend: Arc<dyn StorageBackend> = mem.clone();
        let cfg = config_for(dir.path(), true);
        let cancel = AtomicBool::new(false);

        let summary = run_with_backend(&cfg, backend, &cancel).unwrap();
        assert_eq!(summary.scanned, 1);
        assert_eq!(summary.saved_files, 1);
        assert_eq!(summary.saved_bytes, 11);
        assert!(mem.contains("5/e/5eb63bbbe01eeed093cb22bb8f5acdc3.txt"));
        assert!(dir.path().join("manifest.csv").exists());
        // Exactly one manifest object alongside the content.
        let manifests: Vec<String> = mem
            .keys()
            .into_iter()
            .filter(|k| k.starts_with("metadata/test/"))
            .collect();
        assert_eq!(manifests.len(), 1);
    }

    #[test]
    fn seeded_remote_content_is_not_reuploaded() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/a.txt"), b"hello world").unwrap();

        let mem = Arc::new(MemoryBackend::new());
        mem.seed("5/e/5eb63bbbe01eeed093cb22bb8f5acdc3.txt", b"hello world");
        let backend: Arc<dyn StorageBackend> = mem.clone();
        let cfg = config_for(dir.path(), true);
        let cancel = AtomicBool::new(false);

        let summary = run_with_backend(&cfg, backend, &cancel).unwrap();
        assert_eq!(summary.saved_files, 0);
        assert_eq!(summary.queued_files, 0);
        assert_eq!(mem.upload_count(), 0);
    }

    #[test]
    fn dry_run_leaves_backend_untouched() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/a.txt"), b"hello world").unwrap();

        let mem = Arc::new(MemoryBackend::new());
        let backend: Arc<dyn StorageBackend> = mem.clone();
        let mut cfg = config_for(dir.path(), true);
        cfg.job.dry_run = true;
        let cancel = AtomicBool::new(false);

        let summary = run_with_backend(&cfg, backend, &cancel).unwrap();
        assert_eq!(summary.queued_files, 1);
        assert_eq!(summary.saved_files, 0);
        assert!(mem.keys().is_empty());
        // Local manifest is still written for inspection.
        assert!(dir.path().join("manifest.csv").exists());
    }

    #[test]
    fn lock_contention_aborts_before_any_work() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        let cfg = config_for(dir.path(), false);

        let held = InstanceLock::acquire(Path::new(&cfg.job.lock_file)).unwrap();
        let mem = Arc::new(MemoryBackend::new());
        let backend: Arc<dyn StorageBackend> = mem.clone();
        let cancel = AtomicBool::new(false);

        let err = run_with_backend(&cfg, backend, &cancel).unwrap_err();
        assert!(matches!(err, CasbakError::Locked(_)));
        assert!(!dir.path().join("manifest.csv").exists());
        drop(held);
    }
}
