#[cfg(test)]
mod discover_test;

use crate::job::SimulationUnit;
use globset::{GlobBuilder, GlobMatcher};
use ignore::{DirEntry, WalkBuilder};
use itertools::Itertools;
use once_cell::sync::Lazy;
use std::{
    fs::File,
    io::{self, Read},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info, warn};
use zip::ZipArchive;

/// Model formats in order of preference, directories are searched for the first one only
/// falling back to the second if the first yields nothing.
pub const MODEL_EXTENSIONS: [&str; 2] = ["apsim", "apsimx"];

/// Extension of the manifest entry listing the simulations of an archive
pub const MANIFEST_EXTENSION: &str = ".simulations";

static ARCHIVE_GLOB: Lazy<Option<GlobMatcher>> = Lazy::new(|| matcher("*.zip"));

static MODEL_GLOBS: Lazy<Vec<Option<GlobMatcher>>> = Lazy::new(|| {
    MODEL_EXTENSIONS
        .iter()
        .map(|extension| matcher(&format!("*.{extension}")))
        .collect()
});

fn matcher(glob: &str) -> Option<GlobMatcher> {
    match GlobBuilder::new(glob).case_insensitive(true).build() {
        Ok(glob) => Some(glob.compile_matcher()),
        Err(error) => {
            warn!(error = ?error, glob = glob, "Failed to compile glob");
            None
        }
    }
}

fn is_match(matcher: &Option<GlobMatcher>, name: &str) -> bool {
    matcher.as_ref().map_or(false, |matcher| matcher.is_match(name))
}

#[derive(Error, Debug)]
pub enum CollectError {
    #[error("Input isn't a valid archive or directory: {0:?}")]
    InputNotFound(PathBuf),
    #[error("Failed to find any simulations in archive {0:?}")]
    NoSimulationsFound(PathBuf),
    #[error("Failed to find any model files in {0:?}")]
    NoModelFilesFound(PathBuf),
    #[error("Failed to read archive")]
    Archive(#[from] zip::result::ZipError),
    #[error("Failed to read input")]
    Io(#[from] io::Error),
}

/// Input layouts a simulation run can be handed in as.
/// These should be initialized from `Collector::load`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Collector {
    /// a single zip archive with one model file and a manifest of its simulations
    Archive { path: PathBuf },
    /// a directory of model files, each file is its own simulation
    Directory { path: PathBuf },
}

/// enumerate the simulation units of an input path
pub fn discover(input: &Path) -> Result<Vec<SimulationUnit>, CollectError> {
    Collector::load(input)?.units()
}

impl Collector {
    pub fn load(input: &Path) -> Result<Self, CollectError> {
        let name = input
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        if input.is_file() && is_match(&ARCHIVE_GLOB, &name) {
            Ok(Self::Archive {
                path: input.to_path_buf(),
            })
        } else if input.is_dir() {
            Ok(Self::Directory {
                path: input.to_path_buf(),
            })
        } else {
            Err(CollectError::InputNotFound(input.to_path_buf()))
        }
    }

    pub fn units(&self) -> Result<Vec<SimulationUnit>, CollectError> {
        match self {
            Self::Archive { path } => archive_units(path),
            Self::Directory { path } => directory_units(path),
        }
    }
}

fn archive_units(path: &Path) -> Result<Vec<SimulationUnit>, CollectError> {
    info!(archive = ?path, "Searching in zip archive");

    let mut archive = ZipArchive::new(File::open(path)?)?;
    let mut model = None;
    let mut simulations = Vec::new();

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;

        if entry.is_dir() {
            continue;
        }

        let file_name = entry
            .name()
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or_default()
            .to_owned();

        if model.is_none() && MODEL_GLOBS.iter().any(|glob| is_match(glob, &file_name)) {
            debug!(model = %file_name, "Found model file in archive");
            model = Some(file_name);
        } else if file_name.ends_with(MANIFEST_EXTENSION) {
            let mut manifest = String::new();
            entry.read_to_string(&mut manifest)?;
            simulations.extend(manifest_simulations(&manifest));
        }
    }

    let model = model.ok_or_else(|| CollectError::NoModelFilesFound(path.to_path_buf()))?;

    if simulations.is_empty() {
        return Err(CollectError::NoSimulationsFound(path.to_path_buf()));
    }

    info!(model = %model, simulations = simulations.len(), "Collected archive");

    Ok(vec![SimulationUnit { model, simulations }])
}

/// simulation names of a manifest: the trailing path token of every non empty line
pub fn manifest_simulations(manifest: &str) -> Vec<String> {
    manifest
        .lines()
        .filter_map(|line| line.split('/').filter(|token| !token.trim().is_empty()).last())
        .map(|token| token.trim().to_owned())
        .collect()
}

fn directory_units(path: &Path) -> Result<Vec<SimulationUnit>, CollectError> {
    info!(directory = ?path, "Searching in directory");

    let mut builder = WalkBuilder::new(path);
    builder.max_depth(Some(1)).standard_filters(false);

    let files = builder
        .build()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(error) => {
                warn!(error = ?error, "Failed to list model file");
                None
            }
        })
        .filter(|entry| entry.file_type().map_or(false, |kind| kind.is_file()))
        .map(DirEntry::into_path)
        .filter_map(|path| {
            path.file_name()
                .map(|name| name.to_string_lossy().into_owned())
        })
        // sorted so the ordinal task ids are stable across restarts
        .sorted()
        .collect_vec();

    // the first model format with any hit wins
    let models = MODEL_GLOBS
        .iter()
        .map(|glob| {
            files
                .iter()
                .filter(|name| is_match(glob, name))
                .cloned()
                .collect_vec()
        })
        .find(|models| !models.is_empty())
        .ok_or_else(|| CollectError::NoModelFilesFound(path.to_path_buf()))?;

    info!(models = models.len(), "Collected directory");

    Ok(models
        .into_iter()
        .map(|model| SimulationUnit {
            simulations: vec![model.clone()],
            model,
        })
        .collect())
}
