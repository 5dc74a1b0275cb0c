//! Stage -> collect -> stage-artifact round trips over a tree holding every
//! supported entry type.

use std::collections::BTreeMap;
use std::ffi::{CString, OsStr};
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{symlink, MetadataExt};
use std::path::{Path, PathBuf};

use tempfile::tempdir;
use virtfs::archive::MemberType;
use virtfs::config::DEFAULT_METADATA_DIR;
use virtfs::{extract, fsx, AttributeRecord, AttributeStore, Collector, DeviceNumber, EntryKind, Extractor, Stager, VirtfsConfig};
use walkdir::WalkDir;

// ---------- helpers ----------

fn mkfifo(path: &Path) {
    let c_path = CString::new(path.as_os_str().as_bytes()).unwrap();
    // SAFETY: c_path is a valid NUL-terminated string.
    assert_eq!(unsafe { libc::mkfifo(c_path.as_ptr(), 0o640) }, 0, "mkfifo {:?}", path);
}

/// Every entry's record plus content for regular files and symlinks.
fn snapshot(root: &Path) -> BTreeMap<PathBuf, (AttributeRecord, Option<Vec<u8>>)> {
    let store = AttributeStore::new(&VirtfsConfig::default());
    let mut out = BTreeMap::new();
    let walker = WalkDir::new(root)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.file_name() != OsStr::new(DEFAULT_METADATA_DIR));
    for e in walker {
        let e = e.unwrap();
        let record = store.read(e.path().parent().unwrap(), e.file_name()).unwrap();
        let content = match record.kind {
            EntryKind::Regular | EntryKind::Symlink => Some(fs::read(e.path()).unwrap()),
            _ => None,
        };
        out.insert(e.path().strip_prefix(root).unwrap().to_path_buf(), (record, content));
    }
    out
}

/// A staged tree with one entry of each type, a hardlinked pair, a char
/// device surrogate and a record with foreign ownership.
fn build_staged_tree(root: &Path) {
    fs::create_dir_all(root.join("etc")).unwrap();
    fsx::set_unix_permissions(&root.join("etc"), 0o750).unwrap();
    fs::create_dir_all(root.join("bin")).unwrap();
    fs::write(root.join("bin/tool"), b"\x7fELF tool").unwrap();
    fsx::set_unix_permissions(&root.join("bin/tool"), 0o755).unwrap();
    symlink("bin/tool", root.join("lib.so")).unwrap();
    mkfifo(&root.join("pipe"));
    fs::write(root.join("a"), b"shared content").unwrap();
    fs::hard_link(root.join("a"), root.join("b")).unwrap();

    Stager::new(&VirtfsConfig::default()).stage_directory(root).unwrap();

    // Entries an unprivileged host cannot create, described only by records.
    let store = AttributeStore::new(&VirtfsConfig::default());
    fs::write(root.join("null"), b"").unwrap();
    store
        .write(root, OsStr::new("null"), &AttributeRecord::new(EntryKind::CharDevice(DeviceNumber::new(1, 3)), 0o666, 0, 0))
        .unwrap();
    fs::write(root.join("etc/shadow"), b"root:*:").unwrap();
    store
        .write(&root.join("etc"), OsStr::new("shadow"), &AttributeRecord::new(EntryKind::Regular, 0o640, 4242, 4243))
        .unwrap();
}

// ---------- tests ----------

#[test]
fn round_trip_preserves_records_and_content() -> Result<(), Box<dyn std::error::Error>> {
    let work = tempdir()?;
    let src = work.path().join("src");
    build_staged_tree(&src);
    let before = snapshot(&src);
    assert_eq!(before.len(), 9);

    let archive = work.path().join("artifact.tar.gz");
    let summary = Collector::new(VirtfsConfig::default()).collect(&archive, &src, true)?;
    assert_eq!(summary.members, 9);
    assert_eq!(summary.hardlinks, 1);
    assert_eq!(summary.passthrough, 0);

    let dest = work.path().join("dest");
    let staged = Extractor::new(&VirtfsConfig::default()).stage_artifact(&archive, &dest, true)?;
    assert_eq!(staged, 9);

    assert_eq!(snapshot(&dest), before);

    let shadow = AttributeStore::new(&VirtfsConfig::default()).read(&dest.join("etc"), OsStr::new("shadow"))?;
    assert_eq!((shadow.uid, shadow.gid), (4242, 4243));
    Ok(())
}

#[test]
fn surrogates_are_private_regular_files() -> Result<(), Box<dyn std::error::Error>> {
    let work = tempdir()?;
    let src = work.path().join("src");
    build_staged_tree(&src);
    let archive = work.path().join("artifact.tar");
    Collector::new(VirtfsConfig::default()).collect(&archive, &src, false)?;
    let dest = work.path().join("dest");
    Extractor::new(&VirtfsConfig::default()).stage_artifact(&archive, &dest, false)?;

    // SAFETY: geteuid cannot fail.
    let me = unsafe { libc::geteuid() };
    for e in WalkDir::new(&dest).min_depth(1) {
        let e = e?;
        if e.path().components().any(|c| c.as_os_str() == DEFAULT_METADATA_DIR) {
            continue;
        }
        let meta = fs::symlink_metadata(e.path())?;
        assert_eq!(meta.uid(), me, "{:?}", e.path());
        if meta.is_dir() {
            assert_eq!(meta.mode() & 0o7777, 0o700, "{:?}", e.path());
        } else {
            assert!(meta.file_type().is_file(), "{:?}", e.path());
            assert_eq!(meta.mode() & 0o7777, 0o600, "{:?}", e.path());
        }
    }
    Ok(())
}

#[test]
fn hardlinks_collapse_to_one_content_member() -> Result<(), Box<dyn std::error::Error>> {
    let work = tempdir()?;
    let src = work.path().join("src");
    build_staged_tree(&src);
    let archive = work.path().join("artifact.tar");
    Collector::new(VirtfsConfig::default()).collect(&archive, &src, false)?;

    let members = extract::list_members(&archive, false)?;
    let a = members.iter().find(|m| m.name == Path::new("a")).unwrap();
    let b = members.iter().find(|m| m.name == Path::new("b")).unwrap();
    assert_eq!(a.member_type, MemberType::Regular);
    assert_eq!(a.size, b"shared content".len() as u64);
    assert_eq!(b.member_type, MemberType::Hardlink);
    assert_eq!(b.linkname.as_deref(), Some(Path::new("a")));
    assert_eq!(b.size, 0);

    let dest = work.path().join("dest");
    Extractor::new(&VirtfsConfig::default()).stage_artifact(&archive, &dest, false)?;
    assert_eq!(fs::read(dest.join("a"))?, b"shared content");
    assert_eq!(fs::read(dest.join("b"))?, b"shared content");
    assert_eq!(fs::metadata(dest.join("a"))?.ino(), fs::metadata(dest.join("b"))?.ino());
    Ok(())
}

#[test]
fn device_numbers_survive_the_archive() -> Result<(), Box<dyn std::error::Error>> {
    let work = tempdir()?;
    let src = work.path().join("src");
    build_staged_tree(&src);
    let archive = work.path().join("artifact.tar");
    Collector::new(VirtfsConfig::default()).collect(&archive, &src, false)?;

    let members = extract::list_members(&archive, false)?;
    let null = members.iter().find(|m| m.name == Path::new("null")).unwrap();
    assert_eq!(null.member_type, MemberType::CharDevice);
    assert_eq!(null.device, Some(DeviceNumber::new(1, 3)));
    assert_eq!(null.mode, 0o666);
    let pipe = members.iter().find(|m| m.name == Path::new("pipe")).unwrap();
    assert_eq!(pipe.member_type, MemberType::Fifo);
    let link = members.iter().find(|m| m.name == Path::new("lib.so")).unwrap();
    assert_eq!(link.member_type, MemberType::Symlink);
    assert_eq!(link.linkname.as_deref(), Some(Path::new("bin/tool")));
    Ok(())
}

#[test]
fn block_device_stages_to_packed_rdev() -> Result<(), Box<dyn std::error::Error>> {
    // SAFETY: geteuid cannot fail.
    if unsafe { libc::geteuid() } != 0 {
        eprintln!("skipping: creating device nodes needs root");
        return Ok(());
    }
    let work = tempdir()?;
    let node = work.path().join("loop5");
    let c_path = CString::new(node.as_os_str().as_bytes())?;
    // makedev(5, 1) in the Linux encoding
    let dev: libc::dev_t = (5 << 8) | 1;
    // SAFETY: c_path is a valid NUL-terminated string.
    let rc = unsafe { libc::mknod(c_path.as_ptr(), (libc::S_IFBLK | 0o660) as libc::mode_t, dev) };
    assert_eq!(rc, 0);

    Stager::new(&VirtfsConfig::default()).stage_file(&node)?;

    let text = fs::read_to_string(work.path().join(DEFAULT_METADATA_DIR).join("loop5"))?;
    assert!(text.contains("virtfs.rdev=1281\n"), "{text}");
    let record = AttributeStore::new(&VirtfsConfig::default()).read(work.path(), OsStr::new("loop5"))?;
    assert_eq!(record.kind, EntryKind::BlockDevice(DeviceNumber::new(5, 1)));
    assert!(fs::symlink_metadata(&node)?.file_type().is_file());
    Ok(())
}
