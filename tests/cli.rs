use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::fs;
use std::io::Write;
use std::os::unix::fs::symlink;
use std::process::Command;
use tempfile::tempdir;

#[test]
fn test_cli_stage_collect_list_stage_artifact_cycle() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Setup: a tree with a nested file and a symlink
    let source_dir = tempdir()?;
    let root = source_dir.path().join("root");
    fs::create_dir_all(root.join("nested"))?;
    let mut file1 = fs::File::create(root.join("file1.txt"))?;
    writeln!(file1, "Hello, this is the first file.")?;
    fs::write(root.join("nested/nested_file.dat"), [0, 1, 2, 3, 4, 5])?;
    symlink("/usr/share/zoneinfo/UTC", root.join("localtime"))?;

    // 2. Stage it
    let mut cmd = Command::cargo_bin("virtfs")?;
    cmd.arg("stage-dir").arg(&root);
    cmd.assert().success();
    assert!(root.join(".virtfs_metadata/localtime").exists());
    assert!(fs::symlink_metadata(root.join("localtime"))?.file_type().is_file());

    // 3. Collect
    let archive_dir = tempdir()?;
    let archive_path = archive_dir.path().join("chunk.tar.gz");
    let mut cmd = Command::cargo_bin("virtfs")?;
    cmd.arg("collect").arg(&root).arg("--output").arg(&archive_path);
    cmd.assert().success();
    assert!(archive_path.exists());

    // 4. List
    let mut cmd = Command::cargo_bin("virtfs")?;
    cmd.arg("list").arg(&archive_path);
    cmd.assert().success().stdout(
        predicate::str::contains("Artifact (4 members):")
            .and(predicate::str::contains("file1.txt"))
            .and(predicate::str::contains("nested/nested_file.dat"))
            .and(predicate::str::contains("localtime -> /usr/share/zoneinfo/UTC"))
            .and(predicate::str::contains(".virtfs_metadata").not()),
    );

    // 5. Stage the artifact into a new directory
    let extract_dir = tempdir()?;
    let dest = extract_dir.path().join("next");
    let mut cmd = Command::cargo_bin("virtfs")?;
    cmd.arg("stage-artifact").arg(&archive_path).arg("-o").arg(&dest);
    cmd.assert().success();

    // 6. Verify
    assert_eq!(fs::read(dest.join("file1.txt"))?, fs::read(root.join("file1.txt"))?);
    assert_eq!(fs::read(dest.join("nested/nested_file.dat"))?, [0, 1, 2, 3, 4, 5]);
    assert_eq!(fs::read(dest.join("localtime"))?, b"/usr/share/zoneinfo/UTC");
    let record = fs::read_to_string(dest.join(".virtfs_metadata/localtime"))?;
    assert!(record.contains("virtfs.mode=41471\n"), "{record}");

    Ok(())
}

#[test]
fn test_cli_plain_tar_with_timestamp() -> Result<(), Box<dyn std::error::Error>> {
    let source_dir = tempdir()?;
    fs::write(source_dir.path().join("a"), b"a")?;
    let archive_dir = tempdir()?;
    let archive_path = archive_dir.path().join("plain.tar");

    let mut cmd = Command::cargo_bin("virtfs")?;
    cmd.arg("c")
        .arg(source_dir.path())
        .arg("-o")
        .arg(&archive_path)
        .arg("--no-compress")
        .arg("--timestamp")
        .arg("2000-01-01T00:00:00Z");
    cmd.assert().success();

    let mut ar = tar::Archive::new(fs::File::open(&archive_path)?);
    for entry in ar.entries()? {
        assert_eq!(entry?.header().mtime()?, 946_684_800);
    }
    Ok(())
}

#[test]
fn test_cli_missing_input_fails() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let mut cmd = Command::cargo_bin("virtfs")?;
    cmd.arg("stage-file").arg(dir.path().join("does-not-exist"));
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Error:").and(predicate::str::contains("does-not-exist")));
    Ok(())
}

#[test]
fn test_cli_bad_config_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let config = dir.path().join("virtfs.json");
    fs::write(&config, r#"{ "metadata_dir": "../escape" }"#)?;

    let mut cmd = Command::cargo_bin("virtfs")?;
    cmd.arg("--config").arg(&config).arg("stage-dir").arg(dir.path());
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("invalid configuration"));
    Ok(())
}
