use super::archive::{compare_archive_with_folder, zip_folder};
use std::{fs, io::Write, path::Path};
use tempfile::TempDir;
use zip::{write::FileOptions, ZipWriter};

/// folder with a nested layout, zipped next to it
fn same_fixture() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    let folder = dir.path().join("Same");
    fs::create_dir_all(folder.join("sub")).unwrap();
    fs::write(folder.join("Wheat.out"), "yield,1.2\n").unwrap();
    fs::write(folder.join("Wheat.sum"), "summary").unwrap();
    fs::write(folder.join("sub/Barley.out"), "yield,0.7\n").unwrap();
    fs::write(folder.join("empty.db"), "").unwrap();

    assert_eq!(
        zip_folder(&folder, &dir.path().join("Same.zip")).unwrap(),
        4
    );

    dir
}

fn paths(dir: &TempDir) -> (std::path::PathBuf, std::path::PathBuf) {
    (dir.path().join("Same.zip"), dir.path().join("Same"))
}

#[test]
pub fn same_folder_matches() {
    let dir = same_fixture();
    let (archive, folder) = paths(&dir);

    assert!(compare_archive_with_folder(&archive, &folder).unwrap());
}

#[test]
pub fn size_change_differs() {
    let dir = same_fixture();
    let (archive, folder) = paths(&dir);
    fs::write(folder.join("sub/Barley.out"), "yield,0.75\n").unwrap();

    assert!(!compare_archive_with_folder(&archive, &folder).unwrap());
}

#[test]
pub fn extra_file_differs() {
    let dir = same_fixture();
    let (archive, folder) = paths(&dir);
    fs::write(folder.join("Oats.out"), "yield").unwrap();

    assert!(!compare_archive_with_folder(&archive, &folder).unwrap());
}

#[test]
pub fn missing_file_differs() {
    let dir = same_fixture();
    let (archive, folder) = paths(&dir);
    fs::remove_file(folder.join("Wheat.sum")).unwrap();

    assert!(!compare_archive_with_folder(&archive, &folder).unwrap());
}

fn write_zip(path: &Path, entries: &[(&str, &str)]) {
    let mut writer = ZipWriter::new(fs::File::create(path).unwrap());

    for (name, content) in entries {
        writer.start_file(*name, FileOptions::default()).unwrap();
        writer.write_all(content.as_bytes()).unwrap();
    }

    writer.finish().unwrap();
}

#[test]
pub fn extra_archive_entry_differs() {
    let dir = tempfile::tempdir().unwrap();
    let folder = dir.path().join("Different");
    fs::create_dir_all(&folder).unwrap();
    fs::write(folder.join("a.out"), "12345").unwrap();

    let archive = dir.path().join("Different.zip");
    write_zip(&archive, &[("a.out", "12345"), ("b.out", "1")]);
    assert!(!compare_archive_with_folder(&archive, &folder).unwrap());

    // same content written by hand compares equal, directory entries are ignored
    let archive = dir.path().join("Handmade.zip");
    let mut writer = ZipWriter::new(fs::File::create(&archive).unwrap());
    writer.add_directory("nested/", FileOptions::default()).unwrap();
    writer.start_file("a.out", FileOptions::default()).unwrap();
    writer.write_all(b"12345").unwrap();
    writer.finish().unwrap();
    assert!(compare_archive_with_folder(&archive, &folder).unwrap());
}

#[test]
pub fn malformed_archive_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("broken.zip");
    fs::write(&archive, "not a zip").unwrap();

    assert!(compare_archive_with_folder(&archive, dir.path()).is_err());
}
