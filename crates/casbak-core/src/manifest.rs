//! Audit manifest: one CSV line per scanned file, grouped by directory,
//! behind a header block that documents when and with what configuration
//! the run happened. Persisted locally, then uploaded next to the content
//! under a job- and date-namespaced key.

use std::io::Write;
use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use tracing::{info, warn};

use crate::error::{CasbakError, Result};
use crate::scan::FileRecord;
use crate::storage::{StorageBackend, MANIFEST_PREFIX};

/// Separates the free-form header block from the CSV body.
const HEADER_END_MARKER: &str = "EOF";

const COLUMNS: [&str; 6] = [
    "Filename",
    "Hash",
    "Extension",
    "Size",
    "Modified Time",
    "InQueue",
];

fn format_mtime(mtime_ns: i64) -> String {
    Utc.timestamp_nanos(mtime_ns)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

/// Render the complete manifest. `doc_lines` is the configuration dump
/// (secrets already masked) included in the header for later auditing.
///
/// Lines are sorted by directory then file name, with a `dir >> <path>`
/// marker whenever the directory changes; every scanned file produces
/// exactly one CSV line.
pub fn generate(records: &[FileRecord], doc_lines: &[String], now: DateTime<Utc>) -> Result<Vec<u8>> {
    let mut out = Vec::new();

    writeln!(out, "# Backup run {}", now.format("%Y-%m-%d %H:%M:%S UTC"))?;
    for line in doc_lines {
        writeln!(out, "# {line}")?;
    }
    writeln!(out, "{HEADER_END_MARKER}")?;

    let mut ordered: Vec<&FileRecord> = records.iter().collect();
    ordered.sort_by(|a, b| a.dir.cmp(&b.dir).then_with(|| a.file_name.cmp(&b.file_name)));

    // Directory markers are single-field lines between full-width rows.
    let mut writer = csv::WriterBuilder::new().flexible(true).from_writer(out);
    writer.write_record(COLUMNS)?;

    let mut current_dir: Option<&Path> = None;
    for record in ordered {
        if current_dir != Some(record.dir.as_path()) {
            writer.write_record([format!("dir >> {}", record.dir.display())])?;
            current_dir = Some(record.dir.as_path());
        }
        writer.write_record([
            record.file_name.as_str(),
            record.digest.as_deref().unwrap_or(""),
            record.extension.as_str(),
            &record.size.to_string(),
            &format_mtime(record.mtime_ns),
            if record.queued { "true" } else { "false" },
        ])?;
    }

    writer
        .into_inner()
        .map_err(|e| CasbakError::Other(format!("manifest flush: {e}")))
}

/// Write the manifest next to where the run was started, atomically.
pub fn persist(path: &Path, content: &[u8]) -> Result<()> {
    // The temp file must live on the same filesystem as the target or the
    // rename in persist() fails; a bare file name writes into the cwd.
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
    let mut tmp = match dir {
        Some(dir) => tempfile::NamedTempFile::new_in(dir)?,
        None => tempfile::NamedTempFile::new_in(".")?,
    };
    tmp.write_all(content)?;
    tmp.persist(path).map_err(|e| e.error)?;
    info!(path = %path.display(), bytes = content.len(), "manifest written");
    Ok(())
}

/// Destination key for an uploaded manifest, namespaced by job and date:
/// `metadata/<job>/<year>/<month>/backup_<timestamp>.csv`.
pub fn manifest_key(job_name: &str, now: DateTime<Utc>) -> String {
    format!(
        "{MANIFEST_PREFIX}/{job_name}/{}/backup_{}.csv",
        now.format("%Y/%m"),
        now.format("%Y-%m-%d_%H-%M-%S"),
    )
}

/// Upload the manifest after all content has settled. A failure here is
/// logged, not fatal: the local copy still exists and the next run uploads
/// a fresh manifest anyway.
pub fn upload(backend: &dyn StorageBackend, key: &str, content: &[u8]) {
    match backend.put_bytes(key, content) {
        Ok(()) => info!(key, "manifest uploaded"),
        Err(e) => warn!(key, error = %e, "manifest upload failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn record(dir: &str, name: &str, digest: &str, queued: bool) -> FileRecord {
        FileRecord {
            path: PathBuf::from(format!("{dir}/{name}")),
            dir: PathBuf::from(dir),
            file_name: name.to_string(),
            extension: crate::scan::extension_of(name),
            size: 11,
            mtime_ns: 1_700_000_000_000_000_000,
            is_symlink: false,
            digest: Some(digest.to_string()),
            digest_mtime_ns: None,
            backup_mtime_ns: None,
            queued,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 29, 12, 30, 45).unwrap()
    }

    #[test]
    fn manifest_groups_by_directory() {
        let records = vec![
            record("/src/photos", "b.jpg", "d1", true),
            record("/src/docs", "a.txt", "d2", false),
            record("/src/photos", "a.jpg", "d3", true),
        ];
        let content = generate(&records, &[], now()).unwrap();
        let text = String::from_utf8(content).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        let eof = lines.iter().position(|l| *l == HEADER_END_MARKER).unwrap();
        let body = &lines[eof + 1..];
        assert_eq!(body[0], "Filename,Hash,Extension,Size,Modified Time,InQueue");
        assert_eq!(body[1], "dir >> /src/docs");
        assert!(body[2].starts_with("a.txt,d2,.txt,11,"));
        assert!(body[2].ends_with(",false"));
        assert_eq!(body[3], "dir >> /src/photos");
        assert!(body[4].starts_with("a.jpg,d3,.jpg,11,"));
        assert!(body[5].starts_with("b.jpg,"));
        // One CSV line per scanned file.
        let file_lines = body.iter().filter(|l| !l.starts_with("dir >> ")).count();
        assert_eq!(file_lines - 1, records.len());
    }

    #[test]
    fn header_carries_config_dump_and_end_marker() {
        let doc = vec!["job: photos".to_string(), "safe_mode: true".to_string()];
        let content = generate(&[], &doc, now()).unwrap();
        let text = String::from_utf8(content).unwrap();
        assert!(text.starts_with("# Backup run 2026-08-29 12:30:45 UTC"));
        assert!(text.contains("# job: photos"));
        assert!(text.contains("# safe_mode: true"));
        let eof = text.lines().position(|l| l == HEADER_END_MARKER);
        assert!(eof.is_some());
    }

    #[test]
    fn key_namespaced_by_job_and_date() {
        assert_eq!(
            manifest_key("photos", now()),
            "metadata/photos/2026/08/backup_2026-08-29_12-30-45.csv"
        );
    }

    #[test]
    fn persist_writes_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.csv");
        persist(&path, b"line1\n").unwrap();
        persist(&path, b"line2\n").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"line2\n");
    }

    #[test]
    fn persist_accepts_bare_file_name() {
        // A parentless path must land in the cwd, not in a temp dir on a
        // possibly different filesystem.
        let name = format!("manifest-test-{}.csv", std::process::id());
        persist(Path::new(&name), b"line1\n").unwrap();
        assert_eq!(std::fs::read(&name).unwrap(), b"line1\n");
        std::fs::remove_file(&name).unwrap();
    }

    #[test]
    fn mtime_rendered_human_readable() {
        let rendered = format_mtime(1_700_000_000_000_000_000);
        assert_eq!(rendered, "2023-11-14 22:13:20");
    }
}
