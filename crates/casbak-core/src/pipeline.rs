//! Bounded concurrent upload pipeline: a fixed set of workers drains the
//! task queue, retries transient failures after a fixed delay, stamps
//! backup markers on success, and reports progress at a fixed cadence.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel as channel;
use tracing::{debug, error, info, warn};

use crate::attrs::AttributeCache;
use crate::plan::UploadTask;
use crate::storage::{StorageBackend, UploadOutcome};

const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);
const CANCEL_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy)]
pub struct UploadOptions {
    pub concurrency: usize,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub dry_run: bool,
}

#[derive(Debug, Default)]
pub struct UploadStats {
    /// Source files now confirmed backed up (digest sharers included).
    pub saved_files: usize,
    /// Bytes actually transferred this run.
    pub saved_bytes: u64,
    /// Content already at the destination, confirmed without transfer.
    pub reused_files: usize,
    /// Tasks dropped after exhausting their retry budget.
    pub failed_tasks: usize,
}

/// Sleep in short slices so a raised cancellation signal cuts a pending
/// retry delay short instead of blocking a worker for the full duration.
fn sleep_interruptible(duration: Duration, cancel: &AtomicBool) {
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        if cancel.load(Ordering::Relaxed) {
            return;
        }
        std::thread::sleep(CANCEL_POLL.min(deadline.saturating_duration_since(Instant::now())));
    }
}

struct Shared {
    tx: Mutex<Option<channel::Sender<UploadTask>>>,
    remaining: AtomicUsize,
    done_files: AtomicUsize,
    done_bytes: AtomicU64,
    saved_files: AtomicUsize,
    saved_bytes: AtomicU64,
    reused_files: AtomicUsize,
    failed_tasks: AtomicUsize,
}

impl Shared {
    /// Called once per task reaching a terminal state. The worker that
    /// settles the last task closes the queue, releasing everyone else.
    fn settle(&self) {
        if self.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.close();
        }
    }

    fn close(&self) {
        self.tx.lock().unwrap().take();
    }

    fn requeue(&self, task: UploadTask) -> bool {
        let guard = self.tx.lock().unwrap();
        match guard.as_ref() {
            Some(tx) => tx.send(task).is_ok(),
            None => false,
        }
    }
}

/// Drain the task list with `opts.concurrency` workers. Returns once every
/// task has settled (uploaded, confirmed present, dropped after exhausting
/// retries, or abandoned by cancellation).
pub fn run(
    tasks: Vec<UploadTask>,
    backend: &Arc<dyn StorageBackend>,
    cache: &AttributeCache,
    backup_attr: &str,
    opts: &UploadOptions,
    cancel: &AtomicBool,
) -> UploadStats {
    if tasks.is_empty() {
        return UploadStats::default();
    }

    let total_files = tasks.len();
    let total_bytes: u64 = tasks.iter().map(|t| t.size).sum();
    let (tx, rx) = channel::unbounded::<UploadTask>();
    for task in tasks {
        // Cannot fail: the receiver is alive until the scope below ends.
        let _ = tx.send(task);
    }

    let shared = Shared {
        tx: Mutex::new(Some(tx)),
        remaining: AtomicUsize::new(total_files),
        done_files: AtomicUsize::new(0),
        done_bytes: AtomicU64::new(0),
        saved_files: AtomicUsize::new(0),
        saved_bytes: AtomicU64::new(0),
        reused_files: AtomicUsize::new(0),
        failed_tasks: AtomicUsize::new(0),
    };

    let workers = opts.concurrency.max(1);
    info!(
        tasks = total_files,
        bytes = total_bytes,
        workers,
        backend = backend.name(),
        dry_run = opts.dry_run,
        "starting uploads"
    );
    let started = Instant::now();

    let progress_done = AtomicBool::new(false);
    std::thread::scope(|scope| {
        scope.spawn(|| {
            let mut next_report = Instant::now() + PROGRESS_INTERVAL;
            while !progress_done.load(Ordering::Relaxed) && !cancel.load(Ordering::Relaxed) {
                std::thread::sleep(CANCEL_POLL);
                if Instant::now() >= next_report && !progress_done.load(Ordering::Relaxed) {
                    report_progress(&shared, total_files, total_bytes, started);
                    next_report = Instant::now() + PROGRESS_INTERVAL;
                }
            }
        });

        std::thread::scope(|workers_scope| {
            for _ in 0..workers {
                let rx = rx.clone();
                let shared = &shared;
                workers_scope.spawn(move || {
                    worker_loop(rx, shared, backend, cache, backup_attr, opts, cancel);
                });
            }
        });

        progress_done.store(true, Ordering::Relaxed);
    });

    let stats = UploadStats {
        saved_files: shared.saved_files.load(Ordering::SeqCst),
        saved_bytes: shared.saved_bytes.load(Ordering::SeqCst),
        reused_files: shared.reused_files.load(Ordering::SeqCst),
        failed_tasks: shared.failed_tasks.load(Ordering::SeqCst),
    };
    info!(
        saved_files = stats.saved_files,
        saved_bytes = stats.saved_bytes,
        reused = stats.reused_files,
        failed = stats.failed_tasks,
        elapsed_secs = started.elapsed().as_secs(),
        "uploads settled"
    );
    stats
}

fn worker_loop(
    rx: channel::Receiver<UploadTask>,
    shared: &Shared,
    backend: &Arc<dyn StorageBackend>,
    cache: &AttributeCache,
    backup_attr: &str,
    opts: &UploadOptions,
    cancel: &AtomicBool,
) {
    for task in rx {
        if cancel.load(Ordering::Relaxed) {
            // First worker to observe the signal closes the queue so the
            // remaining tasks drain without new work starting.
            shared.close();
            return;
        }

        if opts.dry_run {
            info!(
                key = %task.key,
                source = %task.source.display(),
                size = task.size,
                "dry run: would upload"
            );
            shared.settle();
            continue;
        }

        match backend.upload_file(&task.source, &task.key) {
            Ok(UploadOutcome::Uploaded) => {
                stamp_owners(&task, cache, backup_attr);
                shared
                    .saved_files
                    .fetch_add(task.owners.len(), Ordering::SeqCst);
                shared.saved_bytes.fetch_add(task.size, Ordering::SeqCst);
                shared.done_files.fetch_add(1, Ordering::SeqCst);
                shared.done_bytes.fetch_add(task.size, Ordering::SeqCst);
                debug!(key = %task.key, size = task.size, "uploaded");
                shared.settle();
            }
            Ok(UploadOutcome::AlreadyPresent) => {
                stamp_owners(&task, cache, backup_attr);
                shared
                    .reused_files
                    .fetch_add(task.owners.len(), Ordering::SeqCst);
                shared.done_files.fetch_add(1, Ordering::SeqCst);
                shared.done_bytes.fetch_add(task.size, Ordering::SeqCst);
                shared.settle();
            }
            Ok(UploadOutcome::Failed) => {
                let next_attempt = task.attempt + 1;
                if next_attempt < opts.max_retries {
                    warn!(
                        key = %task.key,
                        source = %task.source.display(),
                        attempt = next_attempt,
                        max = opts.max_retries,
                        "upload failed, will retry"
                    );
                    sleep_interruptible(opts.retry_delay, cancel);
                    let mut retry = task;
                    retry.attempt = next_attempt;
                    if !shared.requeue(retry) {
                        // Queue already closed by cancellation.
                        shared.settle();
                    }
                } else {
                    error!(
                        source = %task.source.display(),
                        key = %task.key,
                        attempts = next_attempt,
                        "upload failed permanently, will retry next run"
                    );
                    shared.failed_tasks.fetch_add(1, Ordering::SeqCst);
                    shared.done_files.fetch_add(1, Ordering::SeqCst);
                    shared.settle();
                }
            }
            Err(e) => {
                // Not retryable: the key or configuration is wrong.
                error!(key = %task.key, error = %e, "upload rejected");
                shared.failed_tasks.fetch_add(1, Ordering::SeqCst);
                shared.done_files.fetch_add(1, Ordering::SeqCst);
                shared.settle();
            }
        }
    }
}

/// Every file sharing the uploaded digest gets its marker, not only the
/// file whose bytes were read.
fn stamp_owners(task: &UploadTask, cache: &AttributeCache, backup_attr: &str) {
    for (path, mtime_ns) in &task.owners {
        cache.set(path, backup_attr, &mtime_ns.to_string());
    }
}

fn report_progress(shared: &Shared, total_files: usize, total_bytes: u64, started: Instant) {
    let done_files = shared.done_files.load(Ordering::SeqCst);
    let done_bytes = shared.done_bytes.load(Ordering::SeqCst);
    let elapsed = started.elapsed().as_secs_f64().max(0.001);
    let rate = done_bytes as f64 / elapsed;
    let percent = if total_bytes > 0 {
        done_bytes as f64 / total_bytes as f64 * 100.0
    } else {
        done_files as f64 / total_files.max(1) as f64 * 100.0
    };
    let eta_secs = if rate > 0.0 {
        (total_bytes.saturating_sub(done_bytes)) as f64 / rate
    } else {
        0.0
    };
    info!(
        files = format_args!("{done_files}/{total_files}"),
        bytes = done_bytes,
        percent = format_args!("{percent:.1}"),
        rate_bps = rate as u64,
        eta_secs = eta_secs as u64,
        "upload progress"
    );
}
