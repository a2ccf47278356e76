fn dcp() -> assert_cmd::Command {
    assert_cmd::Command::cargo_bin("dcp").unwrap()
}

fn setup_source_tree() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("0.txt"), "zero").unwrap();
    let nested = dir.path().join("nested");
    std::fs::create_dir(&nested).unwrap();
    std::fs::write(nested.join("1.xml"), "<one/>").unwrap();
    std::fs::write(nested.join("2.bin"), [0u8, 1, 2, 3]).unwrap();
    dir
}

fn read_tree(root: &std::path::Path) -> Vec<(String, Vec<u8>)> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                stack.push(path);
            } else {
                let rel = path.strip_prefix(root).unwrap().to_string_lossy().into_owned();
                files.push((rel, std::fs::read(&path).unwrap()));
            }
        }
    }
    files.sort();
    files
}

#[test]
fn fs_to_archive_to_fs_round_trip() {
    let src = setup_source_tree();
    let work = tempfile::tempdir().unwrap();
    let archive = work.path().join("backup.zip");
    let restore = work.path().join("restore");

    dcp()
        .args([
            src.path().to_str().unwrap(),
            archive.to_str().unwrap(),
            "--checksums",
            "--summary",
        ])
        .assert()
        .success()
        .stdout(predicates::str::contains("documents synced: 3"));
    assert!(archive.exists());

    dcp()
        .args([
            archive.to_str().unwrap(),
            restore.to_str().unwrap(),
            "--checksums",
        ])
        .assert()
        .success();

    assert_eq!(read_tree(src.path()), read_tree(&restore));
}

#[test]
fn rotation_produces_fragmented_archives_that_read_back() {
    let src = tempfile::tempdir().unwrap();
    for i in 0..7 {
        std::fs::write(src.path().join(format!("doc-{}.txt", i)), format!("{}", i)).unwrap();
    }
    let work = tempfile::tempdir().unwrap();
    let archive = work.path().join("out.zip");
    let restore = work.path().join("back");

    dcp()
        .args([
            src.path().to_str().unwrap(),
            archive.to_str().unwrap(),
            // two documents (four entries) per physical file
            "--archive-max-entries",
            "4",
        ])
        .assert()
        .success();
    assert!(archive.exists());
    assert!(work.path().join("out-000001.zip").exists());
    assert!(work.path().join("out-000002.zip").exists());
    assert!(work.path().join("out-000003.zip").exists());

    dcp()
        .args([archive.to_str().unwrap(), restore.to_str().unwrap()])
        .assert()
        .success();
    assert_eq!(read_tree(src.path()), read_tree(&restore));
}

#[test]
fn output_prefix_rewrites_restored_paths() {
    let src = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("doc.txt"), "content").unwrap();
    let dst = tempfile::tempdir().unwrap();

    dcp()
        .args([
            src.path().to_str().unwrap(),
            dst.path().to_str().unwrap(),
            "--output-prefix",
            "copied/",
        ])
        .assert()
        .success();
    assert_eq!(
        std::fs::read_to_string(dst.path().join("copied/doc.txt")).unwrap(),
        "content"
    );
}

#[test]
fn excluded_formats_are_left_behind() {
    let src = setup_source_tree();
    let dst = tempfile::tempdir().unwrap();

    dcp()
        .args([
            src.path().to_str().unwrap(),
            dst.path().to_str().unwrap(),
            "--exclude-format",
            "binary",
        ])
        .assert()
        .success();
    let restored = read_tree(dst.path());
    let names: Vec<&str> = restored.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, vec!["0.txt", "nested/1.xml"]);
}

#[test]
fn missing_source_exits_non_zero() {
    let dst = tempfile::tempdir().unwrap();
    dcp()
        .args([
            "/definitely/not/a/real/path",
            dst.path().join("out").to_str().unwrap(),
        ])
        .assert()
        .failure()
        .code(1);
}

#[test]
fn fail_early_surfaces_batch_failures() {
    let work = tempfile::tempdir().unwrap();
    let archive = work.path().join("broken.zip");
    // a zip with a content entry but no metadata twin
    std::fs::write(&archive, minimal_zip_without_twin()).unwrap();
    let restore = work.path().join("restore");
    dcp()
        .args([
            archive.to_str().unwrap(),
            restore.to_str().unwrap(),
            "--fail-early",
            "--max-retries",
            "0",
        ])
        .assert()
        .failure()
        .code(1);
}

/// Hand-built single-entry stored zip: `doc` with content `x`, no metadata
/// twin entry.
fn minimal_zip_without_twin() -> Vec<u8> {
    let name = b"doc";
    let data = b"x";
    let crc = crc32(data);
    let mut out = Vec::new();
    // local header
    out.extend_from_slice(&0x0403_4b50u32.to_le_bytes());
    out.extend_from_slice(&20u16.to_le_bytes()); // version
    out.extend_from_slice(&0u16.to_le_bytes()); // flags
    out.extend_from_slice(&0u16.to_le_bytes()); // stored
    out.extend_from_slice(&0u16.to_le_bytes()); // time
    out.extend_from_slice(&0x21u16.to_le_bytes()); // date
    out.extend_from_slice(&crc.to_le_bytes());
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(&(name.len() as u16).to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(name);
    out.extend_from_slice(data);
    let central_offset = out.len() as u32;
    // central directory
    out.extend_from_slice(&0x0201_4b50u32.to_le_bytes());
    out.extend_from_slice(&20u16.to_le_bytes());
    out.extend_from_slice(&20u16.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&0x21u16.to_le_bytes());
    out.extend_from_slice(&crc.to_le_bytes());
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(&(name.len() as u16).to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // local offset
    out.extend_from_slice(name);
    let central_size = out.len() as u32 - central_offset;
    // end of central directory
    out.extend_from_slice(&0x0605_4b50u32.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&central_size.to_le_bytes());
    out.extend_from_slice(&central_offset.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out
}

/// Plain table-less CRC32 (reflected, polynomial 0xEDB88320).
fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xffff_ffffu32;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xedb8_8320 & mask);
        }
    }
    !crc
}
