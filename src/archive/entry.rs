//! Archive member metadata and its mapping to and from tar headers.

use std::io::Read;
use std::path::{Component, Path, PathBuf};

use tar::{EntryType, Header};

use crate::attrs::AttributeRecord;
use crate::common::{DeviceNumber, EntryKind, PERMISSION_MASK};
use crate::error::{IoContext, Result, VirtfsError};

/// Tar member types this crate reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberType {
    Regular,
    Hardlink,
    Directory,
    Fifo,
    Symlink,
    CharDevice,
    BlockDevice,
}

impl MemberType {
    pub fn from_kind(kind: &EntryKind) -> Self {
        match kind {
            EntryKind::Regular => MemberType::Regular,
            EntryKind::Directory => MemberType::Directory,
            EntryKind::Symlink => MemberType::Symlink,
            EntryKind::Fifo => MemberType::Fifo,
            EntryKind::CharDevice(_) => MemberType::CharDevice,
            EntryKind::BlockDevice(_) => MemberType::BlockDevice,
        }
    }

    fn from_tar(entry_type: EntryType) -> Option<Self> {
        match entry_type {
            EntryType::Regular | EntryType::Continuous => Some(MemberType::Regular),
            EntryType::Link => Some(MemberType::Hardlink),
            EntryType::Directory => Some(MemberType::Directory),
            EntryType::Fifo => Some(MemberType::Fifo),
            EntryType::Symlink => Some(MemberType::Symlink),
            EntryType::Char => Some(MemberType::CharDevice),
            EntryType::Block => Some(MemberType::BlockDevice),
            _ => None,
        }
    }

    fn to_tar(self) -> EntryType {
        match self {
            MemberType::Regular => EntryType::Regular,
            MemberType::Hardlink => EntryType::Link,
            MemberType::Directory => EntryType::Directory,
            MemberType::Fifo => EntryType::Fifo,
            MemberType::Symlink => EntryType::Symlink,
            MemberType::CharDevice => EntryType::Char,
            MemberType::BlockDevice => EntryType::Block,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MemberType::Regular => "regular",
            MemberType::Hardlink => "hardlink",
            MemberType::Directory => "directory",
            MemberType::Fifo => "fifo",
            MemberType::Symlink => "symlink",
            MemberType::CharDevice => "char-device",
            MemberType::BlockDevice => "block-device",
        }
    }
}

/// Metadata of one archive member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Path relative to the collected root.
    pub name: PathBuf,
    pub member_type: MemberType,
    /// Permission bits; tar headers carry no type bits.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub uname: String,
    pub gname: String,
    /// Symlink target, or the canonical member of a hardlink.
    pub linkname: Option<PathBuf>,
    pub device: Option<DeviceNumber>,
    pub mtime: u64,
    pub size: u64,
}

impl ArchiveEntry {
    /// Reads the metadata of a member being iterated from a `tar::Archive`.
    pub fn from_tar<R: Read>(archive_path: &Path, entry: &tar::Entry<'_, R>) -> Result<Self> {
        let raw_name = entry.path().at(archive_path)?;
        let name = sanitize_member_path(&raw_name)?;
        let header = entry.header();
        let invalid = |detail: String| VirtfsError::InvalidMember {
            path: raw_name.to_path_buf(),
            detail,
        };

        let entry_type = header.entry_type();
        let member_type = MemberType::from_tar(entry_type)
            .ok_or_else(|| invalid(format!("unsupported tar entry type {:?}", entry_type)))?;

        let linkname = match member_type {
            MemberType::Hardlink | MemberType::Symlink => {
                let link = entry
                    .link_name()
                    .at(archive_path)?
                    .ok_or_else(|| invalid(format!("{} without a link name", member_type.name())))?;
                Some(link.into_owned())
            }
            _ => None,
        };

        let device = match member_type {
            MemberType::CharDevice | MemberType::BlockDevice => {
                let major = header.device_major().at(archive_path)?;
                let minor = header.device_minor().at(archive_path)?;
                match (major, minor) {
                    (Some(major), Some(minor)) => Some(DeviceNumber::new(major, minor)),
                    _ => return Err(invalid("device member without device numbers".into())),
                }
            }
            _ => None,
        };

        let id = |value: u64, what: &str| u32::try_from(value).map_err(|_| invalid(format!("{what} {value} out of range")));
        Ok(ArchiveEntry {
            name,
            member_type,
            mode: header.mode().at(archive_path)? & PERMISSION_MASK,
            uid: id(header.uid().at(archive_path)?, "uid")?,
            gid: id(header.gid().at(archive_path)?, "gid")?,
            uname: header.username().ok().flatten().unwrap_or_default().to_string(),
            gname: header.groupname().ok().flatten().unwrap_or_default().to_string(),
            linkname,
            device,
            mtime: header.mtime().at(archive_path)?,
            size: header.size().at(archive_path)?,
        })
    }

    /// The sidecar record this member stands for. Hardlinks are regular files.
    pub fn to_record(&self) -> Result<AttributeRecord> {
        let device = || {
            self.device.ok_or_else(|| VirtfsError::InvalidMember {
                path: self.name.clone(),
                detail: "device member without device numbers".into(),
            })
        };
        let kind = match self.member_type {
            MemberType::Regular | MemberType::Hardlink => EntryKind::Regular,
            MemberType::Directory => EntryKind::Directory,
            MemberType::Fifo => EntryKind::Fifo,
            MemberType::Symlink => EntryKind::Symlink,
            MemberType::CharDevice => EntryKind::CharDevice(device()?),
            MemberType::BlockDevice => EntryKind::BlockDevice(device()?),
        };
        let record = AttributeRecord::new(kind, self.mode, self.uid, self.gid);
        record.validate(&self.name)?;
        Ok(record)
    }

    /// Builds the tar header for this member. Path and link name are set by
    /// the `tar::Builder` append call.
    pub(crate) fn header(&self) -> Result<Header> {
        let mut header = Header::new_gnu();
        header.set_entry_type(self.member_type.to_tar());
        header.set_mode(self.mode & PERMISSION_MASK);
        header.set_uid(u64::from(self.uid));
        header.set_gid(u64::from(self.gid));
        header.set_username(header_name(&self.uname)).at(&self.name)?;
        header.set_groupname(header_name(&self.gname)).at(&self.name)?;
        header.set_mtime(self.mtime);
        header.set_size(self.size);
        if let Some(dev) = self.device {
            header.set_device_major(dev.major).at(&self.name)?;
            header.set_device_minor(dev.minor).at(&self.name)?;
        }
        Ok(header)
    }
}

/// Width of the uname/gname fields of a GNU tar header.
const HEADER_NAME_LEN: usize = 32;

/// Cuts an account name down to the header field, on a char boundary.
/// Longer names are truncated rather than refused, as GNU tar does.
fn header_name(name: &str) -> &str {
    if name.len() <= HEADER_NAME_LEN {
        return name;
    }
    let mut end = HEADER_NAME_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

/// Reduces a member path to plain relative components. Absolute paths and
/// `..` are rejected; `.` components are dropped, so `./usr/bin` and
/// `usr/bin` name the same entry.
pub fn sanitize_member_path(path: &Path) -> Result<PathBuf> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) | Component::ParentDir => {
                return Err(VirtfsError::InvalidMember {
                    path: path.to_path_buf(),
                    detail: "member paths must be relative and must not contain '..'".into(),
                })
            }
        }
    }
    Ok(clean)
}
