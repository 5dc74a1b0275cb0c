//! Host filesystem helpers.
//!
//! Thin wrappers over `std::fs` and `libc` for the pieces of POSIX state the
//! engine needs: permission bits, the effective identity of the running
//! process, user/group name lookup and the platform `dev_t` encoding.

use std::ffi::CStr;
use std::fs::FileType;
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;

use crate::common::DeviceNumber;

/// Set POSIX permission bits.
pub fn set_unix_permissions(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

/// Human-readable name of a host file type, for error messages.
pub fn describe(file_type: &FileType) -> &'static str {
    if file_type.is_dir() {
        "directory"
    } else if file_type.is_file() {
        "regular"
    } else if file_type.is_symlink() {
        "symlink"
    } else if file_type.is_fifo() {
        "fifo"
    } else if file_type.is_char_device() {
        "char-device"
    } else if file_type.is_block_device() {
        "block-device"
    } else {
        "other"
    }
}

/// Splits a platform `dev_t` (as returned by `MetadataExt::rdev`) into
/// major and minor numbers.
#[cfg(target_os = "linux")]
pub fn split_dev(dev: u64) -> DeviceNumber {
    let major = ((dev >> 8) & 0xfff) | ((dev >> 32) & 0xffff_f000);
    let minor = (dev & 0xff) | ((dev >> 12) & 0xffff_ff00);
    DeviceNumber::new(major as u32, minor as u32)
}

#[cfg(not(target_os = "linux"))]
pub fn split_dev(dev: u64) -> DeviceNumber {
    DeviceNumber::new(((dev >> 24) & 0xff) as u32, (dev & 0xff_ffff) as u32)
}

/// The uid/gid and account names a process runs as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
    pub uname: String,
    pub gname: String,
}

impl Identity {
    /// Effective identity of the calling process. Unknown names fall back to
    /// the decimal id.
    pub fn effective() -> Self {
        // SAFETY: geteuid/getegid cannot fail and touch no memory we own.
        let uid = unsafe { libc::geteuid() };
        let gid = unsafe { libc::getegid() };
        Identity {
            uid,
            gid,
            uname: user_name_or_id(uid),
            gname: group_name_or_id(gid),
        }
    }
}

const NAME_BUF_START: usize = 1024;
const NAME_BUF_MAX: usize = 1 << 20;

/// Looks up the passwd entry name for `uid`.
pub fn user_name(uid: u32) -> Option<String> {
    let mut size = NAME_BUF_START;
    loop {
        let mut buf = vec![0 as libc::c_char; size];
        // SAFETY: an all-zero passwd is a valid out-parameter.
        let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
        let mut result: *mut libc::passwd = std::ptr::null_mut();
        // SAFETY: every pointer refers to live, correctly sized storage.
        let rc = unsafe { libc::getpwuid_r(uid, &mut pwd, buf.as_mut_ptr(), buf.len(), &mut result) };
        if rc == libc::ERANGE && size < NAME_BUF_MAX {
            size *= 2;
            continue;
        }
        if rc != 0 || result.is_null() || pwd.pw_name.is_null() {
            return None;
        }
        // SAFETY: pw_name points into `buf`, NUL-terminated by getpwuid_r.
        let name = unsafe { CStr::from_ptr(pwd.pw_name) };
        return Some(name.to_string_lossy().into_owned());
    }
}

/// Looks up the group entry name for `gid`.
pub fn group_name(gid: u32) -> Option<String> {
    let mut size = NAME_BUF_START;
    loop {
        let mut buf = vec![0 as libc::c_char; size];
        // SAFETY: an all-zero group is a valid out-parameter.
        let mut grp: libc::group = unsafe { std::mem::zeroed() };
        let mut result: *mut libc::group = std::ptr::null_mut();
        // SAFETY: every pointer refers to live, correctly sized storage.
        let rc = unsafe { libc::getgrgid_r(gid, &mut grp, buf.as_mut_ptr(), buf.len(), &mut result) };
        if rc == libc::ERANGE && size < NAME_BUF_MAX {
            size *= 2;
            continue;
        }
        if rc != 0 || result.is_null() || grp.gr_name.is_null() {
            return None;
        }
        // SAFETY: gr_name points into `buf`, NUL-terminated by getgrgid_r.
        let name = unsafe { CStr::from_ptr(grp.gr_name) };
        return Some(name.to_string_lossy().into_owned());
    }
}

pub fn user_name_or_id(uid: u32) -> String {
    user_name(uid).unwrap_or_else(|| uid.to_string())
}

pub fn group_name_or_id(gid: u32) -> String {
    group_name(gid).unwrap_or_else(|| gid.to_string())
}
