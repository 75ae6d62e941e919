pub mod archive;

#[cfg(test)]
mod archive_test;

use crate::{
    error::RemoteError,
    harvester::download_blob,
    job::JobId,
    storage::{extension, BlobInfo, ObjectStore},
    summary::Summary,
    sync::ShutdownToken,
};
use archive::{zip_folder, ArchiveError};
use itertools::Itertools;
use rayon::{prelude::*, ThreadPool, ThreadPoolBuilder};
use std::{
    fs, io,
    path::{Component, Path, PathBuf},
};
use thiserror::Error;
use tracing::{info, instrument, warn};

/// Name of the packaged results, both locally and in the output container
pub const ARCHIVE_NAME: &str = "Results.zip";

/// Outputs that are final on their own, they are neither archived nor deleted
pub const RETAINED_EXTENSIONS: [&str; 2] = [".stdout", ".sum"];

#[derive(Error, Debug)]
pub enum PackageError {
    #[error("Failed to create temporary directory {path:?}")]
    Scratch { path: PathBuf, source: io::Error },
    #[error("Failed to list outputs of job {job}")]
    List {
        job: JobId,
        #[source]
        source: RemoteError,
    },
    #[error("Download Error: {failed} of {total} outputs failed")]
    Download {
        failed: usize,
        total: usize,
        #[source]
        first: RemoteError,
    },
    #[error("Error zipping results")]
    Archive(#[from] ArchiveError),
    #[error("Error uploading zip")]
    Upload(#[source] RemoteError),
    #[error("Failed to delete {failed} individual results")]
    Delete {
        failed: usize,
        #[source]
        first: RemoteError,
    },
    #[error("Failed to clean up {path:?}")]
    Cleanup { path: PathBuf, source: io::Error },
    #[error("Failed to build transfer pool")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// Outcome of a packaging run, failures past the scratch directory end up here
#[derive(Debug, Default)]
pub struct PackageReport {
    pub downloaded: usize,
    pub archived: usize,
    /// the archive is present in the output container, uploaded by this run or an earlier one
    pub published: bool,
    pub deleted: usize,
    pub failures: Vec<PackageError>,
}

impl PackageReport {
    pub fn is_complete(&self) -> bool {
        self.published && self.failures.is_empty()
    }
}

/// objects that are kept as they are instead of going into the archive
pub fn is_retained(blob: &str) -> bool {
    blob == ARCHIVE_NAME || RETAINED_EXTENSIONS.contains(&extension(blob).as_str())
}

/// Merges the raw outputs of a finished job into a single archive
pub struct ResultPackager<'a> {
    store: &'a dyn ObjectStore,
    job: JobId,
    scratch: PathBuf,
    workers: ThreadPool,
}

impl<'a> ResultPackager<'a> {
    /// `scratch` is created on demand, the archive is written next to it
    pub fn new(
        store: &'a dyn ObjectStore,
        job: JobId,
        scratch: PathBuf,
        concurrency: usize,
    ) -> Result<Self, PackageError> {
        let workers = ThreadPoolBuilder::new()
            .num_threads(concurrency)
            .thread_name(|index| format!("parasim-package-{index}"))
            .build()?;

        Ok(Self {
            store,
            job,
            scratch,
            workers,
        })
    }

    pub fn archive_path(&self) -> PathBuf {
        self.scratch.with_file_name(ARCHIVE_NAME)
    }

    /// Download, zip, publish and clean up.
    ///
    /// Only a missing scratch directory is returned as error, everything else is recorded in the
    /// summary and the report.
    #[instrument(skip_all, fields(job = %self.job))]
    pub fn package(
        &self,
        summary: &Summary,
        token: &ShutdownToken,
    ) -> Result<PackageReport, PackageError> {
        let mut report = PackageReport::default();

        if let Err(source) = fs::create_dir_all(&self.scratch) {
            let error = PackageError::Scratch {
                path: self.scratch.clone(),
                source,
            };
            summary.failure("Failed to create temporary directory", &error);

            return Err(error);
        }

        summary.line("Downloading results from storage...");
        let container = self.job.output_container();

        let outputs = match self.store.list(&container) {
            Ok(outputs) => outputs,
            Err(source) => {
                self.record(
                    summary,
                    &mut report,
                    PackageError::List {
                        job: self.job,
                        source,
                    },
                );

                return Ok(report);
            }
        };

        let raw = outputs
            .into_iter()
            .filter(|blob| !is_retained(&blob.name))
            .collect_vec();

        let download_failed = match self.download(&container, &raw, token) {
            Ok(count) => {
                report.downloaded = count;
                false
            }
            Err(error) => {
                if let PackageError::Download { total, failed, .. } = &error {
                    report.downloaded = total - failed;
                }
                self.record(summary, &mut report, error);
                true
            }
        };

        if token.is_cancelled() {
            summary.line("Cancelled while downloading results");

            return Ok(report);
        }

        summary.line("Zipping results...");
        let archive = self.archive_path();
        summary.line(format!("Zip Path: {}", archive.to_string_lossy()));

        match self.zip(&archive) {
            Ok(entries) => report.archived = entries,
            Err(error) => {
                self.record(summary, &mut report, error);

                return Ok(report);
            }
        }

        summary.line("Uploading zip to job outputs...");

        if let Err(error) = self.publish(&container, &archive) {
            self.record(summary, &mut report, error);

            return Ok(report);
        }
        report.published = true;

        for (path, result) in [
            (archive.clone(), fs::remove_file(&archive)),
            (self.scratch.clone(), fs::remove_dir_all(&self.scratch)),
        ] {
            if let Err(source) = result {
                self.record(summary, &mut report, PackageError::Cleanup { path, source });
            }
        }

        if download_failed {
            summary.line("Keeping individual results, not all of them made it into the zip");

            return Ok(report);
        }

        summary.line("Deleting individual results...");

        match self.delete(&container, &raw, token) {
            Ok(count) => report.deleted = count,
            Err(error) => self.record(summary, &mut report, error),
        }

        info!(
            downloaded = report.downloaded,
            archived = report.archived,
            deleted = report.deleted,
            failures = report.failures.len(),
            "Packaged results"
        );

        Ok(report)
    }

    fn record(&self, summary: &Summary, report: &mut PackageReport, error: PackageError) {
        summary.failure("Packaging", &error);
        report.failures.push(error);
    }

    fn download(
        &self,
        container: &str,
        blobs: &[BlobInfo],
        token: &ShutdownToken,
    ) -> Result<usize, PackageError> {
        let failures = self.workers.install(|| {
            blobs
                .par_iter()
                .filter(|_| !token.is_cancelled())
                .filter_map(|blob| self.fetch(container, &blob.name).err())
                .collect::<Vec<_>>()
        });

        collect_failures(blobs.len(), failures, |failed, total, first| {
            PackageError::Download {
                failed,
                total,
                first,
            }
        })
    }

    fn fetch(&self, container: &str, blob: &str) -> Result<(), RemoteError> {
        if !Path::new(blob)
            .components()
            .all(|component| matches!(component, Component::Normal(_)))
        {
            return Err(RemoteError::Rejected(format!(
                "refusing to unpack {blob:?} outside the temporary directory"
            )));
        }

        let target = self.scratch.join(blob);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        download_blob(self.store, container, blob, &target)
    }

    fn zip(&self, archive: &Path) -> Result<usize, PackageError> {
        match fs::remove_file(archive) {
            Ok(()) => warn!(archive = ?archive, "Replaced stale archive"),
            Err(error) if error.kind() == io::ErrorKind::NotFound => {}
            Err(error) => return Err(ArchiveError::Io(error).into()),
        }

        Ok(zip_folder(&self.scratch, archive)?)
    }

    /// upload the archive unless an earlier run already did
    fn publish(&self, container: &str, archive: &Path) -> Result<(), PackageError> {
        if self
            .store
            .exists(container, ARCHIVE_NAME)
            .map_err(PackageError::Upload)?
        {
            info!("Archive already published, keeping existing copy");

            return Ok(());
        }

        self.store
            .upload(container, ARCHIVE_NAME, archive)
            .map_err(PackageError::Upload)
    }

    fn delete(
        &self,
        container: &str,
        blobs: &[BlobInfo],
        token: &ShutdownToken,
    ) -> Result<usize, PackageError> {
        let failures = self.workers.install(|| {
            blobs
                .par_iter()
                .filter(|_| !token.is_cancelled())
                .filter_map(|blob| match self.store.delete(container, &blob.name) {
                    Ok(()) => None,
                    // gone already, e.g. a previous run got this far
                    Err(RemoteError::NotFound { .. }) => None,
                    Err(error) => Some(error),
                })
                .collect::<Vec<_>>()
        });

        collect_failures(blobs.len(), failures, |failed, _, first| {
            PackageError::Delete { failed, first }
        })
    }
}

fn collect_failures(
    total: usize,
    failures: Vec<RemoteError>,
    error: impl FnOnce(usize, usize, RemoteError) -> PackageError,
) -> Result<usize, PackageError> {
    let failed = failures.len();

    match failures.into_iter().next() {
        Some(first) => Err(error(failed, total, first)),
        None => Ok(total),
    }
}
