//! # Stager
//!
//! Converts real directory entries into host-safe surrogates. Device nodes
//! and fifos become empty regular files, symlinks become regular files
//! holding the link target, and every surrogate is chmod'ed to 0600 (0700
//! for directories). The true type and permissions go into the
//! [`AttributeStore`].
//!
//! Staged files are not meant to be used on the host; they are read through
//! the virtfs share and later collected with [`crate::archive::Collector`].

use std::ffi::{OsStr, OsString};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::attrs::{AttributeRecord, AttributeStore};
use crate::common::{is_device_mode, EntryKind, SURROGATE_FILE_MODE};
use crate::config::VirtfsConfig;
use crate::error::{IoContext, Result, VirtfsError};
use crate::fsx;

pub struct Stager {
    store: AttributeStore,
}

impl Stager {
    pub fn new(config: &VirtfsConfig) -> Self {
        Self {
            store: AttributeStore::new(config),
        }
    }

    /// Stages a single entry in place.
    pub fn stage_file(&self, path: &Path) -> Result<EntryKind> {
        let (dir, name) = split_entry_path(path)?;
        self.stage_entry(&dir, &name)
    }

    /// Stages every entry below `root`, skipping the reserved metadata
    /// directory. `root` itself is left alone. Returns the number of entries
    /// staged.
    pub fn stage_directory(&self, root: &Path) -> Result<usize> {
        let staged = self.stage_children(root)?;
        info!(root = %root.display(), entries = staged, "staged directory");
        Ok(staged)
    }

    fn stage_children(&self, dir: &Path) -> Result<usize> {
        // Collect first: staging replaces entries while we would be iterating.
        let mut names = Vec::new();
        for entry in fs::read_dir(dir).at(dir)? {
            let entry = entry.at(dir)?;
            let name = entry.file_name();
            if !self.store.is_reserved(&name) {
                names.push(name);
            }
        }
        names.sort();

        let mut staged = 0;
        for name in names {
            let kind = self.stage_entry(dir, &name)?;
            staged += 1;
            if kind == EntryKind::Directory {
                staged += self.stage_children(&dir.join(&name))?;
            }
        }
        Ok(staged)
    }

    fn stage_entry(&self, dir: &Path, name: &OsStr) -> Result<EntryKind> {
        let path = dir.join(name);
        let meta = fs::symlink_metadata(&path).at(&path)?;
        let mode = meta.mode();
        let device = is_device_mode(mode).then(|| fsx::split_dev(meta.rdev()));
        let kind = EntryKind::from_mode(mode, device).ok_or_else(|| VirtfsError::UnsupportedType {
            path: path.clone(),
            mode,
        })?;

        // Staged content is anonymous until collected.
        let record = AttributeRecord::new(kind, mode, 0, 0);
        // Refuse before the real node is destroyed.
        record.validate(&path)?;

        match kind {
            EntryKind::Fifo | EntryKind::CharDevice(_) | EntryKind::BlockDevice(_) => {
                fs::remove_file(&path).at(&path)?;
                write_surrogate(&path, &[])?;
            }
            EntryKind::Symlink => {
                let target = fs::read_link(&path).at(&path)?;
                fs::remove_file(&path).at(&path)?;
                write_surrogate(&path, target.as_os_str().as_bytes())?;
            }
            EntryKind::Regular | EntryKind::Directory => {}
        }
        fsx::set_unix_permissions(&path, kind.surrogate_mode()).at(&path)?;

        self.store.write(dir, name, &record)?;
        debug!(path = %path.display(), kind = kind.name(), mode = record.mode(), "staged");
        Ok(kind)
    }
}

/// Creates a fresh 0600 regular file holding `content`.
pub(crate) fn write_surrogate(path: &Path, content: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(SURROGATE_FILE_MODE)
        .open(path)
        .at(path)?;
    file.write_all(content).at(path)
}

/// Splits an entry path into its directory and basename, ignoring a trailing
/// separator.
fn split_entry_path(path: &Path) -> Result<(PathBuf, OsString)> {
    let name = path.file_name().ok_or_else(|| VirtfsError::io(
        path,
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no final component"),
    ))?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok((dir, name.to_os_string()))
}
