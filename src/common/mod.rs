//! Common types shared by the stager, collector and extractor.
//!
//! File types are decoded once from POSIX mode bits into [`EntryKind`] and
//! matched exhaustively from then on.

/// Mask selecting the file-type bits of a `st_mode`.
pub const S_IFMT: u32 = 0o170_000;
pub const S_IFREG: u32 = 0o100_000;
pub const S_IFDIR: u32 = 0o040_000;
pub const S_IFLNK: u32 = 0o120_000;
pub const S_IFIFO: u32 = 0o010_000;
pub const S_IFCHR: u32 = 0o020_000;
pub const S_IFBLK: u32 = 0o060_000;

/// Permission bits, including setuid/setgid/sticky.
pub const PERMISSION_MASK: u32 = 0o7777;

/// Host permission given to every surrogate file.
pub const SURROGATE_FILE_MODE: u32 = 0o600;
/// Host permission given to every surrogate directory.
pub const SURROGATE_DIR_MODE: u32 = 0o700;

/// A device identity split into major and minor numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceNumber {
    pub major: u32,
    pub minor: u32,
}

impl DeviceNumber {
    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Packs into the virtfs `rdev` form: 8-bit major in bits 8-15, 8-bit
    /// minor in bits 0-7. Returns `None` when either half exceeds 255; the
    /// packing is never widened.
    pub fn pack(&self) -> Option<u32> {
        if self.major > 0xff || self.minor > 0xff {
            return None;
        }
        Some((self.major << 8) | self.minor)
    }

    /// Inverse of [`DeviceNumber::pack`]. Returns `None` for values using bits
    /// above the 16 the packing defines.
    pub fn unpack(rdev: u32) -> Option<Self> {
        if rdev > 0xffff {
            return None;
        }
        Some(Self {
            major: (rdev >> 8) & 0xff,
            minor: rdev & 0xff,
        })
    }
}

/// The true type of a tree entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Regular,
    Directory,
    Symlink,
    Fifo,
    CharDevice(DeviceNumber),
    BlockDevice(DeviceNumber),
}

/// True if `mode` carries the char-device or block-device type bits.
pub fn is_device_mode(mode: u32) -> bool {
    matches!(mode & S_IFMT, S_IFCHR | S_IFBLK)
}

impl EntryKind {
    /// Decodes the type bits of `mode`. `device` is consulted only for device
    /// types; `None` is returned for unsupported type bits or for a device
    /// type without a device number.
    pub fn from_mode(mode: u32, device: Option<DeviceNumber>) -> Option<Self> {
        match mode & S_IFMT {
            S_IFREG => Some(EntryKind::Regular),
            S_IFDIR => Some(EntryKind::Directory),
            S_IFLNK => Some(EntryKind::Symlink),
            S_IFIFO => Some(EntryKind::Fifo),
            S_IFCHR => device.map(EntryKind::CharDevice),
            S_IFBLK => device.map(EntryKind::BlockDevice),
            _ => None,
        }
    }

    pub fn type_bits(&self) -> u32 {
        match self {
            EntryKind::Regular => S_IFREG,
            EntryKind::Directory => S_IFDIR,
            EntryKind::Symlink => S_IFLNK,
            EntryKind::Fifo => S_IFIFO,
            EntryKind::CharDevice(_) => S_IFCHR,
            EntryKind::BlockDevice(_) => S_IFBLK,
        }
    }

    pub fn device(&self) -> Option<DeviceNumber> {
        match self {
            EntryKind::CharDevice(dev) | EntryKind::BlockDevice(dev) => Some(*dev),
            EntryKind::Regular | EntryKind::Directory | EntryKind::Symlink | EntryKind::Fifo => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            EntryKind::Regular => "regular",
            EntryKind::Directory => "directory",
            EntryKind::Symlink => "symlink",
            EntryKind::Fifo => "fifo",
            EntryKind::CharDevice(_) => "char-device",
            EntryKind::BlockDevice(_) => "block-device",
        }
    }

    /// Host permission of the surrogate standing in for an entry of this kind.
    pub fn surrogate_mode(&self) -> u32 {
        match self {
            EntryKind::Directory => SURROGATE_DIR_MODE,
            _ => SURROGATE_FILE_MODE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_device_packs_to_8_8() {
        let dev = DeviceNumber::new(5, 1);
        assert_eq!(dev.pack(), Some(1281));
        assert_eq!(DeviceNumber::unpack(1281), Some(dev));
    }

    #[test]
    fn pack_refuses_wide_numbers() {
        assert_eq!(DeviceNumber::new(256, 0).pack(), None);
        assert_eq!(DeviceNumber::new(8, 300).pack(), None);
        assert_eq!(DeviceNumber::unpack(0x1_0000), None);
    }

    #[test]
    fn from_mode_covers_supported_types() {
        let dev = DeviceNumber::new(1, 3);
        assert_eq!(EntryKind::from_mode(0o100644, None), Some(EntryKind::Regular));
        assert_eq!(EntryKind::from_mode(0o040755, None), Some(EntryKind::Directory));
        assert_eq!(EntryKind::from_mode(0o120777, None), Some(EntryKind::Symlink));
        assert_eq!(EntryKind::from_mode(0o010644, None), Some(EntryKind::Fifo));
        assert_eq!(EntryKind::from_mode(0o020666, Some(dev)), Some(EntryKind::CharDevice(dev)));
        assert_eq!(EntryKind::from_mode(0o060660, Some(dev)), Some(EntryKind::BlockDevice(dev)));
        // sockets are not representable
        assert_eq!(EntryKind::from_mode(0o140755, None), None);
        // a device without its number is not a complete kind
        assert_eq!(EntryKind::from_mode(0o020666, None), None);
    }

    #[test]
    fn type_bits_round_trip() {
        let kinds = [
            EntryKind::Regular,
            EntryKind::Directory,
            EntryKind::Symlink,
            EntryKind::Fifo,
            EntryKind::CharDevice(DeviceNumber::new(4, 64)),
            EntryKind::BlockDevice(DeviceNumber::new(8, 0)),
        ];
        for kind in kinds {
            let mode = kind.type_bits() | 0o640;
            assert_eq!(EntryKind::from_mode(mode, kind.device()), Some(kind));
            assert_eq!(is_device_mode(mode), kind.device().is_some());
        }
    }
}
