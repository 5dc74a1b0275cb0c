//! # Sidecar Attribute Store
//!
//! Every staged directory carries a reserved subdirectory (by default
//! `.virtfs_metadata`) holding one plain-text file per entry basename:
//!
//! ```text
//! virtfs.uid=0
//! virtfs.gid=0
//! virtfs.mode=8624
//! virtfs.rdev=1105
//! ```
//!
//! The keys mirror the `struct stat` members `st_uid`, `st_gid`, `st_mode`
//! and `st_rdev`. `mode` includes the type bits; `rdev` is present only for
//! character and block devices and uses the 8-bit major / 8-bit minor packing
//! of [`DeviceNumber::pack`].

use std::ffi::OsStr;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::trace;

use crate::common::{is_device_mode, DeviceNumber, EntryKind, PERMISSION_MASK};
use crate::config::VirtfsConfig;
use crate::error::{IoContext, Result, VirtfsError};

pub const UID_KEY: &str = "virtfs.uid";
pub const GID_KEY: &str = "virtfs.gid";
pub const MODE_KEY: &str = "virtfs.mode";
pub const RDEV_KEY: &str = "virtfs.rdev";

/// The true ownership, type and permissions of one tree entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeRecord {
    pub uid: u32,
    pub gid: u32,
    /// Permission bits only; the type lives in `kind`.
    pub permissions: u32,
    pub kind: EntryKind,
}

impl AttributeRecord {
    /// Builds a record; any type bits in `mode` are discarded in favour of `kind`.
    pub fn new(kind: EntryKind, mode: u32, uid: u32, gid: u32) -> Self {
        Self {
            uid,
            gid,
            permissions: mode & PERMISSION_MASK,
            kind,
        }
    }

    /// Full POSIX mode: type bits plus permissions.
    pub fn mode(&self) -> u32 {
        self.kind.type_bits() | self.permissions
    }

    /// Packed device number, for device kinds that fit the 8/8 packing.
    pub fn rdev(&self) -> Option<u32> {
        self.kind.device().and_then(|dev| dev.pack())
    }

    /// Fails with `DeviceOutOfRange` when the device number cannot be packed.
    pub fn validate(&self, path: &Path) -> Result<()> {
        match self.kind.device() {
            Some(dev) if dev.pack().is_none() => Err(VirtfsError::DeviceOutOfRange {
                path: path.to_path_buf(),
                major: dev.major,
                minor: dev.minor,
            }),
            _ => Ok(()),
        }
    }

    /// Serializes into sidecar text. The record must already be validated.
    fn encode(&self) -> String {
        let mut out = format!(
            "{UID_KEY}={}\n{GID_KEY}={}\n{MODE_KEY}={}\n",
            self.uid,
            self.gid,
            self.mode()
        );
        if let Some(rdev) = self.rdev() {
            out.push_str(&format!("{RDEV_KEY}={rdev}\n"));
        }
        out
    }

    /// Parses sidecar text. Unknown keys are ignored; an `rdev` on a
    /// non-device record is tolerated and dropped.
    fn decode(text: &str) -> std::result::Result<Self, String> {
        let (mut uid, mut gid, mut mode, mut rdev) = (None, None, None, None);
        for line in text.lines() {
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| format!("line '{line}' is not key=value"))?;
            let value: u32 = value
                .trim()
                .parse()
                .map_err(|e| format!("bad value for {key}: {e}"))?;
            match key {
                UID_KEY => uid = Some(value),
                GID_KEY => gid = Some(value),
                MODE_KEY => mode = Some(value),
                RDEV_KEY => rdev = Some(value),
                other => trace!(key = other, "ignoring unknown virtfs key"),
            }
        }
        let uid = uid.ok_or_else(|| format!("missing {UID_KEY}"))?;
        let gid = gid.ok_or_else(|| format!("missing {GID_KEY}"))?;
        let mode = mode.ok_or_else(|| format!("missing {MODE_KEY}"))?;

        let device = if is_device_mode(mode) {
            let rdev = rdev.ok_or_else(|| format!("device record without {RDEV_KEY}"))?;
            Some(DeviceNumber::unpack(rdev).ok_or_else(|| format!("{RDEV_KEY}={rdev} exceeds the 8/8 packing"))?)
        } else {
            None
        };
        let kind = EntryKind::from_mode(mode, device).ok_or_else(|| format!("unsupported file type in mode {mode:#o}"))?;
        Ok(Self::new(kind, mode, uid, gid))
    }
}

/// Reads and writes sidecar records under a reserved per-directory subdirectory.
#[derive(Debug, Clone)]
pub struct AttributeStore {
    metadata_dir: String,
}

impl AttributeStore {
    pub fn new(config: &VirtfsConfig) -> Self {
        Self {
            metadata_dir: config.metadata_dir.clone(),
        }
    }

    pub fn metadata_dir(&self) -> &str {
        &self.metadata_dir
    }

    /// True for the reserved subdirectory name, which is never staged or archived.
    pub fn is_reserved(&self, name: &OsStr) -> bool {
        name == OsStr::new(&self.metadata_dir)
    }

    /// Location of the sidecar file for `basename` inside `dir`.
    pub fn record_path(&self, dir: &Path, basename: &OsStr) -> PathBuf {
        dir.join(&self.metadata_dir).join(basename)
    }

    /// Persists `record` for `basename` unless a record already exists.
    /// Returns `true` when this call wrote the record.
    pub fn write(&self, dir: &Path, basename: &OsStr, record: &AttributeRecord) -> Result<bool> {
        let meta_dir = dir.join(&self.metadata_dir);
        match fs::create_dir(&meta_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(VirtfsError::io(meta_dir, e)),
        }

        let path = meta_dir.join(basename);
        record.validate(&path)?;

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                trace!(path = %path.display(), "virtfs record exists, keeping it");
                return Ok(false);
            }
            Err(e) => return Err(VirtfsError::io(path, e)),
        };
        file.write_all(record.encode().as_bytes()).at(&path)?;
        Ok(true)
    }

    /// Reads the record for `basename`. A missing sidecar file yields
    /// [`VirtfsError::NotFound`]; every other failure is an I/O or parse error.
    pub fn read(&self, dir: &Path, basename: &OsStr) -> Result<AttributeRecord> {
        let path = self.record_path(dir, basename);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(VirtfsError::NotFound { path }),
            Err(e) => return Err(VirtfsError::io(path, e)),
        };
        AttributeRecord::decode(&text).map_err(|detail| VirtfsError::MalformedRecord { path, detail })
    }
}
