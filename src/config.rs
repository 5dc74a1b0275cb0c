//! Engine configuration.
//!
//! Every component is built from a [`VirtfsConfig`] value, so several
//! configurations can coexist in one process.

use std::fs::File;
use std::io::BufReader;
use std::path::{Component, Path};

use serde::{Deserialize, Serialize};

use crate::error::{IoContext, Result, VirtfsError};

/// Name of the per-directory sidecar directory.
pub const DEFAULT_METADATA_DIR: &str = ".virtfs_metadata";

/// 2011-11-11T11:11:11Z, stamped on every archive member and gzip envelope.
pub const DEFAULT_TIMESTAMP: u64 = 1_321_009_871;

/// gzip level used when collecting compressed artifacts.
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 9;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct VirtfsConfig {
    /// Reserved subdirectory holding sidecar records, excluded from archives.
    pub metadata_dir: String,
    /// Fixed modification time (seconds since the epoch) for collected members.
    pub timestamp: u64,
    /// gzip compression level, 0-9.
    pub compression_level: u32,
}

impl Default for VirtfsConfig {
    fn default() -> Self {
        Self {
            metadata_dir: DEFAULT_METADATA_DIR.to_string(),
            timestamp: DEFAULT_TIMESTAMP,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

impl VirtfsConfig {
    /// Loads a JSON configuration file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let file = File::open(path).at(path)?;
        let config: VirtfsConfig = serde_json::from_reader(BufReader::new(file)).map_err(|e| VirtfsError::Config {
            detail: format!("{}: {}", path.display(), e),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let mut components = Path::new(&self.metadata_dir).components();
        let single_normal = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        );
        if !single_normal {
            return Err(VirtfsError::Config {
                detail: format!("metadata_dir '{}' must be a single path component", self.metadata_dir),
            });
        }
        // The gzip header stores mtime in 32 bits.
        if self.timestamp > u64::from(u32::MAX) {
            return Err(VirtfsError::Config {
                detail: format!("timestamp {} does not fit a gzip header", self.timestamp),
            });
        }
        if self.compression_level > 9 {
            return Err(VirtfsError::Config {
                detail: format!("compression_level {} is outside 0-9", self.compression_level),
            });
        }
        Ok(())
    }
}
