//! # Artifact Collector
//!
//! Walks a staged tree and writes a reproducible tar artifact, optionally
//! wrapped in gzip.
//!
//! Each entry's true type, mode and ownership come from its sidecar record.
//! Entries without a record are host-native and are archived from their own
//! `lstat` data. Regular files sharing an `(inode, device)` pair are stored
//! once; later occurrences become hardlink members. Traversal is sorted by
//! basename at every level and every timestamp is pinned, so collecting an
//! unchanged tree twice yields identical bytes.

mod entry;

pub use entry::{sanitize_member_path, ArchiveEntry, MemberType};

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::{self, File, Metadata};
use std::io::{self, BufWriter, Write};
use std::os::unix::ffi::OsStringExt;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use flate2::{Compression, GzBuilder};
use tempfile::NamedTempFile;
use tracing::{debug, info, trace};
use walkdir::WalkDir;

use crate::attrs::{AttributeRecord, AttributeStore};
use crate::common::{is_device_mode, EntryKind};
use crate::config::VirtfsConfig;
use crate::error::{IoContext, Result, VirtfsError};
use crate::fsx::{self, Identity};

/// Host permission of a finished artifact.
const ARTIFACT_MODE: u32 = 0o644;

/// Counts reported by a collection pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectSummary {
    /// Members written, hardlinks included.
    pub members: usize,
    /// Members written as hardlinks to an earlier member.
    pub hardlinks: usize,
    /// Entries archived from host `lstat` data for lack of a sidecar record.
    pub passthrough: usize,
}

/// Canonical member name for every `(inode, device)` seen in one pass.
#[derive(Debug, Default)]
pub struct HardlinkTable {
    canonical: HashMap<(u64, u64), PathBuf>,
}

impl HardlinkTable {
    /// Returns the canonical name when `meta` names an inode already archived
    /// under a different name; otherwise registers `name` as canonical.
    pub fn resolve(&mut self, name: &Path, meta: &Metadata) -> Option<PathBuf> {
        let key = (meta.ino(), meta.dev());
        match self.canonical.get(&key) {
            Some(first) if meta.nlink() > 1 && first != name => Some(first.clone()),
            Some(_) => None,
            None => {
                self.canonical.insert(key, name.to_path_buf());
                None
            }
        }
    }
}

/// State threaded through one collection pass.
struct Pass {
    identity: Identity,
    links: HardlinkTable,
    summary: CollectSummary,
}

pub struct Collector {
    config: VirtfsConfig,
    store: AttributeStore,
}

impl Collector {
    pub fn new(config: VirtfsConfig) -> Self {
        let store = AttributeStore::new(&config);
        Self { config, store }
    }

    /// Collects `root_dir` into `archive_path`. The artifact is written to a
    /// temporary file beside `archive_path` and only moved into place once
    /// complete.
    pub fn collect(&self, archive_path: &Path, root_dir: &Path, compress: bool) -> Result<CollectSummary> {
        self.config.validate()?;
        let parent = match archive_path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let tmp = NamedTempFile::new_in(parent).at(parent)?;
        let writer = BufWriter::new(tmp.as_file());

        let summary = if compress {
            // Checked by validate().
            let mtime = self.config.timestamp as u32;
            let gz = GzBuilder::new()
                .mtime(mtime)
                .write(writer, Compression::new(self.config.compression_level));
            let (gz, summary) = self.write_tree(gz, root_dir)?;
            let mut writer = gz.finish().at(archive_path)?;
            writer.flush().at(archive_path)?;
            summary
        } else {
            let (mut writer, summary) = self.write_tree(writer, root_dir)?;
            writer.flush().at(archive_path)?;
            summary
        };

        tmp.as_file().sync_all().at(tmp.path())?;
        fsx::set_unix_permissions(tmp.path(), ARTIFACT_MODE).at(tmp.path())?;
        tmp.persist(archive_path)
            .map_err(|e| VirtfsError::io(archive_path, e.error))?;

        info!(
            archive = %archive_path.display(),
            root = %root_dir.display(),
            compress,
            members = summary.members,
            hardlinks = summary.hardlinks,
            passthrough = summary.passthrough,
            "collected artifact"
        );
        Ok(summary)
    }

    /// Writes the tar stream for `root` into `writer` and hands the writer back.
    fn write_tree<W: Write>(&self, writer: W, root: &Path) -> Result<(W, CollectSummary)> {
        let mut builder = tar::Builder::new(writer);
        let mut pass = Pass {
            identity: Identity::effective(),
            links: HardlinkTable::default(),
            summary: CollectSummary::default(),
        };

        let walker = WalkDir::new(root)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !self.store.is_reserved(e.file_name()));

        for dent in walker {
            let dent = dent.map_err(|e| walk_error(root, e))?;
            let path = dent.path();
            let name = path
                .strip_prefix(root)
                .map_err(|_| VirtfsError::InvalidMember {
                    path: path.to_path_buf(),
                    detail: format!("not below {}", root.display()),
                })?
                .to_path_buf();
            let dir = path.parent().unwrap_or(root);
            let meta = fs::symlink_metadata(path).at(path)?;

            let mut member = match self.store.read(dir, dent.file_name()) {
                Ok(record) => member_from_record(&record, path, name, &meta, &mut pass)?,
                Err(e) if e.is_not_found() => {
                    trace!(path = %path.display(), "no virtfs record, archiving host metadata");
                    pass.summary.passthrough += 1;
                    member_from_host(path, name, &meta, &mut pass)?
                }
                Err(e) => return Err(e),
            };
            normalize_ownership(&mut member, &pass.identity);
            member.mtime = self.config.timestamp;

            append_member(&mut builder, &member, path)?;
            pass.summary.members += 1;
            if member.member_type == MemberType::Hardlink {
                pass.summary.hardlinks += 1;
            }
            debug!(
                member = %member.name.display(),
                kind = member.member_type.name(),
                mode = member.mode,
                uid = member.uid,
                gid = member.gid,
                "archived"
            );
        }

        let writer = builder.into_inner().at(root)?;
        Ok((writer, pass.summary))
    }
}

/// Rebuilds the true member from a sidecar record. Symlink targets are read
/// from the surrogate file's content, not with `readlink`.
fn member_from_record(
    record: &AttributeRecord,
    path: &Path,
    name: PathBuf,
    meta: &Metadata,
    pass: &mut Pass,
) -> Result<ArchiveEntry> {
    // Every surrogate except a directory is a plain file on the host.
    let surrogate_ok = match record.kind {
        EntryKind::Directory => meta.is_dir(),
        _ => meta.file_type().is_file(),
    };
    if !surrogate_ok {
        return Err(VirtfsError::TypeMismatch {
            path: path.to_path_buf(),
            expected: record.kind.name(),
            found: fsx::describe(&meta.file_type()),
        });
    }

    let mut member = ArchiveEntry {
        member_type: MemberType::from_kind(&record.kind),
        mode: record.permissions,
        uid: record.uid,
        gid: record.gid,
        // Names of guest ids are unknowable on the host.
        uname: record.uid.to_string(),
        gname: record.gid.to_string(),
        linkname: None,
        device: record.kind.device(),
        mtime: 0,
        size: 0,
        name,
    };
    match record.kind {
        EntryKind::Regular => resolve_regular(&mut member, meta, pass),
        EntryKind::Symlink => {
            let target = fs::read(path).at(path)?;
            member.linkname = Some(PathBuf::from(OsString::from_vec(target)));
        }
        EntryKind::Directory | EntryKind::Fifo | EntryKind::CharDevice(_) | EntryKind::BlockDevice(_) => {}
    }
    Ok(member)
}

/// Describes a host-native entry exactly as `lstat` reports it.
fn member_from_host(path: &Path, name: PathBuf, meta: &Metadata, pass: &mut Pass) -> Result<ArchiveEntry> {
    let mode = meta.mode();
    let device = is_device_mode(mode).then(|| fsx::split_dev(meta.rdev()));
    let kind = EntryKind::from_mode(mode, device).ok_or_else(|| VirtfsError::UnsupportedType {
        path: path.to_path_buf(),
        mode,
    })?;
    let mut member = ArchiveEntry {
        member_type: MemberType::from_kind(&kind),
        mode: mode & crate::common::PERMISSION_MASK,
        uid: meta.uid(),
        gid: meta.gid(),
        uname: fsx::user_name_or_id(meta.uid()),
        gname: fsx::group_name_or_id(meta.gid()),
        linkname: None,
        device,
        mtime: 0,
        size: 0,
        name,
    };
    match kind {
        EntryKind::Regular => resolve_regular(&mut member, meta, pass),
        EntryKind::Symlink => member.linkname = Some(fs::read_link(path).at(path)?),
        EntryKind::Directory | EntryKind::Fifo | EntryKind::CharDevice(_) | EntryKind::BlockDevice(_) => {}
    }
    Ok(member)
}

/// A regular file is either the canonical copy of its inode, carrying
/// content, or a hardlink to the member that came first.
fn resolve_regular(member: &mut ArchiveEntry, meta: &Metadata, pass: &mut Pass) {
    match pass.links.resolve(&member.name, meta) {
        Some(canonical) => {
            member.member_type = MemberType::Hardlink;
            member.linkname = Some(canonical);
        }
        None => member.size = meta.len(),
    }
}

/// Entries owned by the collecting process were created on the host, outside
/// the guest, and are attributed to root.
fn normalize_ownership(member: &mut ArchiveEntry, me: &Identity) {
    if member.uid == me.uid && member.gid == me.gid && member.uname == me.uname && member.gname == me.gname {
        member.uid = 0;
        member.gid = 0;
        member.uname = "0".to_string();
        member.gname = "0".to_string();
    }
}

fn append_member<W: Write>(builder: &mut tar::Builder<W>, member: &ArchiveEntry, path: &Path) -> Result<()> {
    let mut header = member.header()?;
    match (member.member_type, &member.linkname) {
        (MemberType::Regular, _) => {
            let file = File::open(path).at(path)?;
            builder.append_data(&mut header, &member.name, file).at(path)
        }
        (MemberType::Hardlink | MemberType::Symlink, Some(target)) => {
            builder.append_link(&mut header, &member.name, target).at(path)
        }
        (MemberType::Hardlink | MemberType::Symlink, None) => Err(VirtfsError::InvalidMember {
            path: path.to_path_buf(),
            detail: "link member without a target".into(),
        }),
        (MemberType::Directory | MemberType::Fifo | MemberType::CharDevice | MemberType::BlockDevice, _) => {
            builder.append_data(&mut header, &member.name, io::empty()).at(path)
        }
    }
}

fn walk_error(root: &Path, err: walkdir::Error) -> VirtfsError {
    let path = err.path().unwrap_or(root).to_path_buf();
    VirtfsError::io(path, io::Error::from(err))
}
