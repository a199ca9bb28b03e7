mod cli;
mod config_gen;
mod format;
mod signal;

use clap::Parser;

use casbak_core::config;
use casbak_core::error::CasbakError;
use casbak_core::run::run_backup;

use cli::{Cli, Commands};
use config_gen::run_config_generate;
use format::{format_bytes, format_duration};

fn main() {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // Handle `config` early — no config file needed
    if let Some(Commands::Config { dest }) = &cli.command {
        if let Err(e) = run_config_generate(dest.as_deref()) {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
        return;
    }

    let source = match config::resolve_config_path(cli.config.as_deref()) {
        Some(s) => s,
        None => {
            eprintln!("Error: no configuration file found.");
            eprintln!("Searched:");
            for (path, level) in config::default_config_search_paths() {
                eprintln!("  {} ({})", path.display(), level);
            }
            eprintln!();
            eprintln!("Run `casbak config` to generate a starter config file.");
            std::process::exit(1);
        }
    };

    tracing::info!("Using config: {source}");

    let mut cfg = match config::load_config(source.path()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    // Apply per-invocation overrides before the run starts.
    if let Some(Commands::Backup {
        safe,
        dry_run,
        job,
        upload_concurrency,
    }) = &cli.command
    {
        if *safe {
            cfg.job.safe_mode = true;
        }
        if *dry_run {
            cfg.job.dry_run = true;
        }
        if let Some(job) = job {
            cfg.job.name = job.clone();
        }
        if let Some(n) = upload_concurrency {
            cfg.job.upload_concurrency = *n as usize;
        }
    }

    signal::install_signal_handlers();

    match run_backup(&cfg, &signal::SHUTDOWN) {
        Ok(summary) => {
            println!(
                "Scanned {} files, queued {} ({}), saved {} ({}), reused {}, in {}",
                summary.scanned,
                summary.queued_files,
                format_bytes(summary.queued_bytes),
                summary.saved_files,
                format_bytes(summary.saved_bytes),
                summary.reused_files,
                format_duration(summary.elapsed.as_secs()),
            );
            if summary.failed_tasks > 0 {
                eprintln!(
                    "{} upload(s) failed permanently; they will be retried next run",
                    summary.failed_tasks
                );
                std::process::exit(1);
            }
        }
        Err(CasbakError::Locked(lock)) => {
            eprintln!("Error: another instance is already running (lock: {lock})");
            std::process::exit(2);
        }
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}
