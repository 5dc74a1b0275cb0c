//! # virtfs Core Library
//!
//! Lets an unprivileged process represent, persist and transport filesystem
//! trees containing entries it cannot create or preserve itself (device
//! nodes, fifos, symlinks with arbitrary targets, foreign ownership).
//!
//! A *staged tree* holds only regular files and directories on the host. The
//! true type, permissions, ownership and device number of each entry live in
//! a sidecar record next to it. Staged trees are collected into reproducible
//! tar artifacts and artifacts are staged back into trees.
//!
//! ## Key Modules
//!
//! - [`attrs`]: the sidecar [`AttributeStore`](attrs::AttributeStore).
//! - [`stage`]: converts real entries into surrogates.
//! - [`archive`]: collects a staged tree into an artifact.
//! - [`extract`]: stages an artifact back into a tree.
//!
//! ## Examples
//!
//! ```no_run
//! use std::path::Path;
//!
//! # fn main() -> Result<(), virtfs::VirtfsError> {
//! virtfs::stage_directory(Path::new("/build/chunk-root"))?;
//! virtfs::collect_artifact(Path::new("/cache/chunk.tar.gz"), Path::new("/build/chunk-root"), true, None)?;
//! virtfs::stage_artifact(Path::new("/cache/chunk.tar.gz"), Path::new("/build/next-root"), true)?;
//! # Ok(())
//! # }
//! ```

use std::path::Path;

pub mod archive;
pub mod attrs;
pub mod cli;
pub mod common;
pub mod config;
pub mod error;
pub mod extract;
pub mod stage;

// Host filesystem helpers
pub mod fsx;

pub use archive::{CollectSummary, Collector};
pub use attrs::{AttributeRecord, AttributeStore};
pub use common::{DeviceNumber, EntryKind};
pub use config::VirtfsConfig;
pub use error::{ErrorKind, VirtfsError};
pub use extract::Extractor;
pub use stage::Stager;

/// Stages a single entry in place with the default configuration.
pub fn stage_file(path: &Path) -> Result<(), VirtfsError> {
    Stager::new(&VirtfsConfig::default()).stage_file(path).map(|_| ())
}

/// Recursively stages everything below `path` with the default configuration.
pub fn stage_directory(path: &Path) -> Result<(), VirtfsError> {
    Stager::new(&VirtfsConfig::default()).stage_directory(path).map(|_| ())
}

/// Collects `root_dir` into `archive_path`. `timestamp` defaults to
/// [`config::DEFAULT_TIMESTAMP`].
pub fn collect_artifact(
    archive_path: &Path,
    root_dir: &Path,
    compress: bool,
    timestamp: Option<u64>,
) -> Result<CollectSummary, VirtfsError> {
    let mut config = VirtfsConfig::default();
    if let Some(ts) = timestamp {
        config = config.with_timestamp(ts);
    }
    Collector::new(config).collect(archive_path, root_dir, compress)
}

/// Stages the members of `archive_path` into `dest_dir`.
pub fn stage_artifact(archive_path: &Path, dest_dir: &Path, compress: bool) -> Result<(), VirtfsError> {
    Extractor::new(&VirtfsConfig::default())
        .stage_artifact(archive_path, dest_dir, compress)
        .map(|_| ())
}
