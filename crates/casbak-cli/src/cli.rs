use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "casbak",
    version,
    about = "Content-addressed, deduplicating file backups",
    after_help = "\
Configuration file lookup order:
  1. --config <path>             (explicit flag)
  2. $CASBAK_CONFIG              (environment variable)
  3. ./casbak.yaml               (project)
  4. Platform user config dir + /casbak/config.yaml (e.g. ~/.config)
  5. Platform system config path (Unix: /etc/casbak/config.yaml)

Environment variables:
  CASBAK_CONFIG     Path to configuration file (overrides default search)"
)]
pub(crate) struct Cli {
    /// Path to configuration file (overrides CASBAK_CONFIG and default search)
    #[arg(short, long)]
    pub config: Option<String>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Scan sources and upload missing content (the default)
    Backup {
        /// Re-check the destination's digest index instead of trusting
        /// local backup markers
        #[arg(long)]
        safe: bool,

        /// Classify files and write the manifest without uploading
        #[arg(long)]
        dry_run: bool,

        /// Override the configured job name
        #[arg(short, long)]
        job: Option<String>,

        /// Max concurrent uploads (overrides config)
        #[arg(long, value_parser = clap::value_parser!(u16).range(1..=64))]
        upload_concurrency: Option<u16>,
    },

    /// Generate a starter configuration file
    Config {
        /// Destination path (default: print to stdout)
        dest: Option<String>,
    },
}
