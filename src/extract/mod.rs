//! # Extraction Module
//!
//! Reverses the collector: stages the members of an artifact into a
//! directory as surrogate files plus sidecar records, ready to be consumed
//! directly or re-staged into a sandbox.
//!
//! The archive's uid/gid survive only inside the sidecar records. Every
//! materialized file belongs to the extracting process and is 0600 (0700 for
//! directories), since the extractor may lack the privilege to do otherwise.

use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io::{self, BufReader, Read};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::Path;

use flate2::read::GzDecoder;
use tracing::{debug, info};

use crate::archive::{sanitize_member_path, ArchiveEntry, MemberType};
use crate::attrs::AttributeStore;
use crate::common::{SURROGATE_DIR_MODE, SURROGATE_FILE_MODE};
use crate::config::VirtfsConfig;
use crate::error::{IoContext, Result, VirtfsError};
use crate::fsx;
use crate::stage::write_surrogate;

/// Opens an artifact as a tar stream, unwrapping gzip when `compress` is set.
pub fn open_archive(archive_path: &Path, compress: bool) -> Result<tar::Archive<Box<dyn Read>>> {
    let file = File::open(archive_path).at(archive_path)?;
    let reader = BufReader::new(file);
    let stream: Box<dyn Read> = if compress {
        Box::new(GzDecoder::new(reader))
    } else {
        Box::new(reader)
    };
    Ok(tar::Archive::new(stream))
}

/// Lists the members of an artifact in archive order.
pub fn list_members(archive_path: &Path, compress: bool) -> Result<Vec<ArchiveEntry>> {
    let mut archive = open_archive(archive_path, compress)?;
    let mut members = Vec::new();
    for entry in archive.entries().at(archive_path)? {
        let entry = entry.at(archive_path)?;
        members.push(ArchiveEntry::from_tar(archive_path, &entry)?);
    }
    Ok(members)
}

pub struct Extractor {
    store: AttributeStore,
}

impl Extractor {
    pub fn new(config: &VirtfsConfig) -> Self {
        Self {
            store: AttributeStore::new(config),
        }
    }

    /// Stages every member of `archive_path` below `dest_dir`, in archive
    /// order. Returns the number of members staged.
    ///
    /// On error the destination is left partially populated and should be
    /// discarded.
    pub fn stage_artifact(&self, archive_path: &Path, dest_dir: &Path, compress: bool) -> Result<usize> {
        ensure_directory(dest_dir)?;
        let mut archive = open_archive(archive_path, compress)?;
        let mut staged = 0;

        for entry in archive.entries().at(archive_path)? {
            let mut entry = entry.at(archive_path)?;
            let member = ArchiveEntry::from_tar(archive_path, &entry)?;
            self.reject_reserved(&member)?;
            let (Some(basename), Some(dir)) = (member.name.file_name(), member.name.parent()) else {
                debug!("skipping archive root member");
                continue;
            };
            let dir = dest_dir.join(dir);
            let full = dir.join(basename);

            let record = member.to_record()?;
            ensure_directory(&dir)?;
            self.store.write(&dir, basename, &record)?;
            materialize(&mut entry, &member, &full, dest_dir)?;

            staged += 1;
            debug!(
                member = %member.name.display(),
                kind = member.member_type.name(),
                mode = record.mode(),
                "staged member"
            );
        }

        info!(archive = %archive_path.display(), dest = %dest_dir.display(), members = staged, "staged artifact");
        Ok(staged)
    }

    /// Sidecar records are written only through the store, never from
    /// archive content, so no member or hardlink target may reach into the
    /// reserved directory.
    fn reject_reserved(&self, member: &ArchiveEntry) -> Result<()> {
        let hardlink = match member.member_type {
            MemberType::Hardlink => member.linkname.as_deref(),
            _ => None,
        };
        for path in std::iter::once(member.name.as_path()).chain(hardlink) {
            if path.components().any(|c| self.store.is_reserved(c.as_os_str())) {
                return Err(VirtfsError::InvalidMember {
                    path: path.to_path_buf(),
                    detail: format!("reaches into the reserved '{}' directory", self.store.metadata_dir()),
                });
            }
        }
        Ok(())
    }
}

/// Writes the host surrogate for one member.
fn materialize<R: Read>(entry: &mut tar::Entry<'_, R>, member: &ArchiveEntry, full: &Path, dest_dir: &Path) -> Result<()> {
    match member.member_type {
        MemberType::Directory => {
            ensure_directory(full)?;
            fsx::set_unix_permissions(full, SURROGATE_DIR_MODE).at(full)
        }
        MemberType::Regular => {
            clear_file_slot(full, member.member_type)?;
            let mut file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(SURROGATE_FILE_MODE)
                .open(full)
                .at(full)?;
            io::copy(entry, &mut file).at(full)?;
            fsx::set_unix_permissions(full, SURROGATE_FILE_MODE).at(full)
        }
        MemberType::Hardlink => {
            clear_file_slot(full, member.member_type)?;
            let target = dest_dir.join(sanitize_member_path(link_target(member)?)?);
            fs::hard_link(&target, full).at(full)?;
            fsx::set_unix_permissions(full, SURROGATE_FILE_MODE).at(full)
        }
        MemberType::Symlink => {
            clear_file_slot(full, member.member_type)?;
            write_surrogate(full, link_target(member)?.as_os_str().as_bytes())
        }
        MemberType::Fifo | MemberType::CharDevice | MemberType::BlockDevice => {
            clear_file_slot(full, member.member_type)?;
            write_surrogate(full, &[])
        }
    }
}

fn link_target(member: &ArchiveEntry) -> Result<&Path> {
    member.linkname.as_deref().ok_or_else(|| VirtfsError::InvalidMember {
        path: member.name.clone(),
        detail: format!("{} without a link name", member.member_type.name()),
    })
}

/// Creates `path` (0700, with parents) unless it already is a directory.
fn ensure_directory(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(meta) => Err(VirtfsError::TypeMismatch {
            path: path.to_path_buf(),
            expected: "directory",
            found: fsx::describe(&meta.file_type()),
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => DirBuilder::new()
            .recursive(true)
            .mode(SURROGATE_DIR_MODE)
            .create(path)
            .at(path),
        Err(e) => Err(VirtfsError::io(path, e)),
    }
}

/// Makes room for a file surrogate: an existing file is replaced, an
/// existing directory is a type mismatch.
fn clear_file_slot(path: &Path, member_type: MemberType) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => Err(VirtfsError::TypeMismatch {
            path: path.to_path_buf(),
            expected: member_type.name(),
            found: "directory",
        }),
        Ok(_) => fs::remove_file(path).at(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(VirtfsError::io(path, e)),
    }
}
