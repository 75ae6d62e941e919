use ignore::WalkBuilder;
use itertools::Itertools;
use std::{
    collections::BTreeMap,
    fs::File,
    io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::debug;
use zip::{result::ZipError, write::FileOptions, CompressionMethod, ZipArchive, ZipWriter};

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Archive is malformed")]
    Zip(#[from] ZipError),
    #[error("Failed to access archive contents")]
    Io(#[from] io::Error),
}

/// Every file below `folder` keyed by its `/` separated relative name
fn folder_files(folder: &Path) -> io::Result<BTreeMap<String, (PathBuf, u64)>> {
    let mut builder = WalkBuilder::new(folder);
    builder.standard_filters(false);

    let mut files = BTreeMap::new();

    for entry in builder.build() {
        let entry = entry.map_err(|error| io::Error::new(io::ErrorKind::Other, error))?;

        if !entry.file_type().map_or(false, |kind| kind.is_file()) {
            continue;
        }

        let name = match entry.path().strip_prefix(folder) {
            Ok(relative) => relative
                .components()
                .map(|component| component.as_os_str().to_string_lossy())
                .join("/"),
            Err(_) => continue,
        };

        let size = entry
            .metadata()
            .map_err(|error| io::Error::new(io::ErrorKind::Other, error))?
            .len();
        files.insert(name, (entry.into_path(), size));
    }

    Ok(files)
}

/// Compress every file below `folder` into a new archive at `archive`, returns the entry count
pub fn zip_folder(folder: &Path, archive: &Path) -> Result<usize, ArchiveError> {
    let files = folder_files(folder)?;
    let mut writer = ZipWriter::new(File::create(archive)?);

    for (name, (path, size)) in &files {
        let options = FileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .large_file(*size >= u64::from(u32::MAX));

        writer.start_file(name.as_str(), options)?;
        io::copy(&mut File::open(path)?, &mut writer)?;
    }

    writer.finish()?;
    debug!(archive = ?archive, entries = files.len(), "Wrote archive");

    Ok(files.len())
}

/// `true` iff the archive holds exactly the files of `folder`, compared by name and size
pub fn compare_archive_with_folder(archive: &Path, folder: &Path) -> Result<bool, ArchiveError> {
    let mut zip = ZipArchive::new(File::open(archive)?)?;
    let mut entries = BTreeMap::new();

    for index in 0..zip.len() {
        let entry = zip.by_index(index)?;

        if entry.is_dir() {
            continue;
        }

        entries.insert(entry.name().replace('\\', "/"), entry.size());
    }

    let files = folder_files(folder)?
        .into_iter()
        .map(|(name, (_, size))| (name, size))
        .collect::<BTreeMap<_, _>>();

    Ok(entries == files)
}
