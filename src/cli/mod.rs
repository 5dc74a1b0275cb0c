use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::VirtfsConfig;
use crate::error::VirtfsError;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Log per-entry progress (sets the default log level to debug).
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// JSON configuration file. Falls back to VIRTFS_CONFIG, then built-in defaults.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Convert one entry into a surrogate file plus sidecar record.
    StageFile {
        #[arg(required = true)]
        path: PathBuf,
    },

    /// Recursively stage every entry below a directory.
    StageDir {
        #[arg(required = true)]
        path: PathBuf,
    },

    /// Collect a staged tree into a reproducible artifact.
    #[command(alias = "c")]
    Collect {
        /// Root of the staged tree.
        #[arg(required = true)]
        root: PathBuf,

        /// The path for the output artifact.
        #[arg(short, long)]
        output: PathBuf,

        /// Write a plain tar stream instead of gzip.
        #[arg(long)]
        no_compress: bool,

        /// Member timestamp, as epoch seconds or RFC 3339. Overrides the configuration.
        #[arg(long, value_parser = parse_timestamp)]
        timestamp: Option<u64>,
    },

    /// Stage an artifact into a directory.
    #[command(alias = "x")]
    StageArtifact {
        /// The artifact to stage.
        #[arg(required = true)]
        archive: PathBuf,

        /// Destination directory.
        #[arg(short, long)]
        output: PathBuf,

        /// The artifact is a plain tar stream.
        #[arg(long)]
        no_compress: bool,
    },

    /// List the members of an artifact.
    #[command(alias = "l")]
    List {
        #[arg(required = true)]
        archive: PathBuf,

        /// The artifact is a plain tar stream.
        #[arg(long)]
        no_compress: bool,
    },
}

/// Accepts epoch seconds or an RFC 3339 instant.
pub fn parse_timestamp(raw: &str) -> Result<u64, String> {
    if let Ok(secs) = raw.parse::<u64>() {
        return Ok(secs);
    }
    let instant = chrono::DateTime::parse_from_rfc3339(raw).map_err(|e| format!("'{raw}': {e}"))?;
    u64::try_from(instant.timestamp()).map_err(|_| format!("'{raw}' is before the epoch"))
}

/// Resolves the configuration.
/// Priority:
/// 1. `--config` command-line argument.
/// 2. `VIRTFS_CONFIG` environment variable.
/// 3. Built-in defaults.
pub fn resolve_config(config_opt: Option<PathBuf>) -> Result<VirtfsConfig, VirtfsError> {
    let path = config_opt.or_else(|| std::env::var_os("VIRTFS_CONFIG").map(PathBuf::from));
    match path {
        Some(path) => VirtfsConfig::from_file(&path),
        None => Ok(VirtfsConfig::default()),
    }
}

/// Parses command-line arguments using `clap`, exiting on `--help` or a usage error.
pub fn run() -> Args {
    Args::parse()
}
