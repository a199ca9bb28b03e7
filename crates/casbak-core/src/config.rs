use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CasbakError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CasbakConfig {
    pub job: JobConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Immutable per-run parameters. Loaded once at startup; CLI flags may
/// override individual fields before the run begins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Source roots, backed up in configuration order.
    pub sources: Vec<String>,
    /// Namespaces the per-file backup marker so independent jobs can track
    /// backup state for the same files.
    #[serde(default = "default_job_name")]
    pub name: String,
    #[serde(default)]
    pub safe_mode: bool,
    #[serde(default)]
    pub dry_run: bool,
    /// Number of single-character shard directories in destination paths.
    #[serde(default = "default_target_depth")]
    pub target_depth: usize,
    #[serde(default = "default_upload_concurrency")]
    pub upload_concurrency: usize,
    /// 0 means auto: available processors minus one.
    #[serde(default)]
    pub hash_concurrency: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_manifest_file")]
    pub manifest_file: String,
    #[serde(default = "default_lock_file")]
    pub lock_file: String,
    /// File names skipped everywhere (OS clutter).
    #[serde(default = "default_ignored_files")]
    pub ignored_files: Vec<String>,
    /// Gitignore-style patterns, relative to each source root.
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// "local" or "s3". Anything else falls back to local with a warning.
    #[serde(default = "default_storage_kind")]
    pub kind: String,
    pub local: Option<LocalStorageConfig>,
    pub s3: Option<S3StorageConfig>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: default_storage_kind(),
            local: None,
            s3: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalStorageConfig {
    pub destination: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3StorageConfig {
    pub endpoint: String,
    pub bucket: String,
    #[serde(default = "default_s3_region")]
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    /// Storage class applied to content objects (e.g. "STANDARD_IA").
    /// Objects uploaded with the "important" hint always use STANDARD.
    pub storage_tier: Option<String>,
}

fn default_job_name() -> String {
    "default".to_string()
}

fn default_target_depth() -> usize {
    3
}

fn default_upload_concurrency() -> usize {
    1
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_secs() -> u64 {
    5
}

fn default_manifest_file() -> String {
    "casbak-manifest.csv".to_string()
}

fn default_lock_file() -> String {
    if cfg!(unix) {
        "/tmp/casbak.lock".to_string()
    } else {
        "casbak.lock".to_string()
    }
}

fn default_ignored_files() -> Vec<String> {
    vec![
        ".DS_Store".to_string(),
        "Thumbs.db".to_string(),
        "desktop.ini".to_string(),
    ]
}

fn default_storage_kind() -> String {
    "local".to_string()
}

fn default_s3_region() -> String {
    "us-east-1".to_string()
}

impl JobConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    /// Hash workers: configured value, or processor count minus one.
    pub fn effective_hash_concurrency(&self) -> usize {
        if self.hash_concurrency > 0 {
            return self.hash_concurrency;
        }
        std::thread::available_parallelism()
            .map(|n| n.get().saturating_sub(1))
            .unwrap_or(1)
            .max(1)
    }
}

impl CasbakConfig {
    /// Startup validation. Failures here are fatal before any mutation.
    pub fn validate(&self) -> Result<()> {
        if self.job.sources.is_empty() {
            return Err(CasbakError::Config(
                "job.sources must list at least one source root".into(),
            ));
        }
        if self.job.upload_concurrency == 0 {
            return Err(CasbakError::Config(
                "job.upload_concurrency must be at least 1".into(),
            ));
        }
        match self.storage.kind.as_str() {
            "local" => {
                if self.storage.local.is_none() {
                    return Err(CasbakError::Config(
                        "storage.local section is required for the local backend".into(),
                    ));
                }
            }
            "s3" => {
                if self.storage.s3.is_none() {
                    return Err(CasbakError::Config(
                        "storage.s3 section is required for the s3 backend".into(),
                    ));
                }
            }
            other => {
                // Unrecognized kinds fall back to local at backend
                // construction time, but only if a local section exists.
                tracing::warn!(kind = other, "unrecognized storage kind, will use local");
                if self.storage.local.is_none() {
                    return Err(CasbakError::Config(format!(
                        "unrecognized storage kind '{other}' and no storage.local fallback"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Secrets that must never appear in logs or the manifest header.
    pub fn redactor(&self) -> Redactor {
        let mut secrets = Vec::new();
        if let Some(s3) = &self.storage.s3 {
            secrets.push(s3.secret_access_key.clone());
            secrets.push(s3.access_key_id.clone());
        }
        Redactor::new(secrets)
    }

    /// Effective configuration dump for the manifest header, one line per
    /// value, with secrets masked.
    pub fn doc_lines(&self, redactor: &Redactor) -> Vec<String> {
        let job = &self.job;
        let mut lines = vec![
            format!("job.name = {}", job.name),
            format!("job.sources = {}", job.sources.join(", ")),
            format!("job.safe_mode = {}", job.safe_mode),
            format!("job.dry_run = {}", job.dry_run),
            format!("job.target_depth = {}", job.target_depth),
            format!("job.upload_concurrency = {}", job.upload_concurrency),
            format!(
                "job.hash_concurrency = {}",
                job.effective_hash_concurrency()
            ),
            format!("job.max_retries = {}", job.max_retries),
            format!("job.retry_delay_secs = {}", job.retry_delay_secs),
            format!("job.manifest_file = {}", job.manifest_file),
            format!("job.lock_file = {}", job.lock_file),
            format!("storage.kind = {}", self.storage.kind),
        ];
        if let Some(local) = &self.storage.local {
            lines.push(format!("storage.local.destination = {}", local.destination));
        }
        if let Some(s3) = &self.storage.s3 {
            lines.push(format!("storage.s3.endpoint = {}", s3.endpoint));
            lines.push(format!("storage.s3.bucket = {}", s3.bucket));
            lines.push(format!("storage.s3.region = {}", s3.region));
            lines.push(format!(
                "storage.s3.access_key_id = {}",
                redactor.mask(&s3.access_key_id)
            ));
            lines.push("storage.s3.secret_access_key = *****".to_string());
            if let Some(tier) = &s3.storage_tier {
                lines.push(format!("storage.s3.storage_tier = {tier}"));
            }
        }
        lines
    }
}

/// Explicit redaction context: knows every secret configured for this run
/// and masks them in output. Built once at startup and passed to whatever
/// produces user-visible text; there is no process-global masking registry.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    secrets: Vec<String>,
}

impl Redactor {
    pub fn new(secrets: Vec<String>) -> Self {
        let secrets = secrets.into_iter().filter(|s| !s.is_empty()).collect();
        Self { secrets }
    }

    /// Replace every occurrence of a known secret in `text` with `*****`.
    pub fn mask(&self, text: &str) -> String {
        let mut out = text.to_string();
        for secret in &self.secrets {
            if out.contains(secret.as_str()) {
                out = out.replace(secret.as_str(), "*****");
            }
        }
        out
    }
}

// --- Config resolution ---

/// Tracks where the config file was found.
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// Explicitly passed via `--config`.
    CliArg(PathBuf),
    /// Set via the `CASBAK_CONFIG` env var.
    EnvVar(PathBuf),
    /// Found by searching standard locations.
    SearchOrder { path: PathBuf, level: &'static str },
}

impl ConfigSource {
    pub fn path(&self) -> &Path {
        match self {
            ConfigSource::CliArg(p) => p,
            ConfigSource::EnvVar(p) => p,
            ConfigSource::SearchOrder { path, .. } => path,
        }
    }
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::CliArg(p) => write!(f, "{} (--config)", p.display()),
            ConfigSource::EnvVar(p) => write!(f, "{} (CASBAK_CONFIG)", p.display()),
            ConfigSource::SearchOrder { path, level } => {
                write!(f, "{} ({})", path.display(), level)
            }
        }
    }
}

/// Returns search locations in priority order: project, user, system.
pub fn default_config_search_paths() -> Vec<(PathBuf, &'static str)> {
    let mut paths = vec![(PathBuf::from("casbak.yaml"), "project")];

    let user_config = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .filter(|p| p.is_absolute())
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .map(|base| base.join("casbak").join("config.yaml"));

    if let Some(p) = user_config {
        paths.push((p, "user"));
    }

    paths.push((PathBuf::from("/etc/casbak/config.yaml"), "system"));

    paths
}

/// Resolve which config file to use.
///
/// Priority: CLI arg > `CASBAK_CONFIG` env var > first existing file from
/// the search paths. Returns `None` if nothing is found.
pub fn resolve_config_path(cli_config: Option<&str>) -> Option<ConfigSource> {
    if let Some(path) = cli_config {
        return Some(ConfigSource::CliArg(PathBuf::from(path)));
    }

    if let Ok(val) = std::env::var("CASBAK_CONFIG") {
        if !val.is_empty() {
            return Some(ConfigSource::EnvVar(PathBuf::from(val)));
        }
    }

    for (path, level) in default_config_search_paths() {
        if path.exists() {
            return Some(ConfigSource::SearchOrder { path, level });
        }
    }

    None
}

/// Load and parse a config file.
pub fn load_config(path: &Path) -> Result<CasbakConfig> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| CasbakError::Config(format!("cannot read '{}': {e}", path.display())))?;
    let config: CasbakConfig = serde_yaml::from_str(&contents)
        .map_err(|e| CasbakError::Config(format!("invalid config '{}': {e}", path.display())))?;
    Ok(config)
}

/// Returns a minimal YAML config template suitable for bootstrapping.
pub fn minimal_config_template() -> &'static str {
    r#"# casbak configuration file

job:
  name: default
  sources:
    - /home/user/documents
  safe_mode: false
  dry_run: false
  target_depth: 3
  upload_concurrency: 4
  max_retries: 3
  retry_delay_secs: 5
  manifest_file: /var/tmp/casbak-manifest.csv
  lock_file: /tmp/casbak.lock
  # exclude_patterns:
  #   - "*.tmp"
  #   - ".cache/**"

storage:
  kind: local
  local:
    destination: /mnt/backup
  # s3:
  #   endpoint: https://s3.example.com
  #   bucket: backups
  #   region: us-east-1
  #   access_key_id: AKIA...
  #   secret_access_key: secret
  #   storage_tier: STANDARD_IA
"#
}
