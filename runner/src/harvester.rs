#[cfg(test)]
mod harvester_test;

use crate::{
    error::RemoteError,
    executors::Executor,
    job::JobId,
    storage::ObjectStore,
    sync::ShutdownToken,
};
use ignore::WalkBuilder;
use itertools::Itertools;
use parking_lot::Mutex;
use rayon::{prelude::*, ThreadPool, ThreadPoolBuilder};
use std::{
    collections::HashSet,
    fs, io,
    path::{Component, Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, info, instrument, trace, warn};

/// Downloads in flight carry this prefix until they are complete
pub const PARTIAL_PREFIX: &str = ".partial-";

/// `true` if the last component of `name` marks an unfinished download
pub fn is_partial(name: &str) -> bool {
    name.rsplit('/')
        .next()
        .map_or(false, |file_name| file_name.starts_with(PARTIAL_PREFIX))
}

#[derive(Error, Debug)]
pub enum HarvestError {
    #[error("Failed to prepare output directory {path:?}")]
    OutputDir { path: PathBuf, source: io::Error },
    #[error("Failed to list outputs of job {job}")]
    List {
        job: JobId,
        #[source]
        source: RemoteError,
    },
    #[error("{failed} of {total} downloads failed")]
    Downloads {
        failed: usize,
        total: usize,
        #[source]
        first: RemoteError,
    },
    #[error("Failed to build transfer pool")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// Names of the objects already present in the local output directory
#[derive(Debug, Default)]
pub struct DownloadedSet {
    names: Mutex<HashSet<String>>,
}

impl DownloadedSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan `dir` for completed downloads, stale partial downloads are removed on the way
    pub fn rebuild(dir: &Path) -> io::Result<Self> {
        let set = Self::new();

        if !dir.is_dir() {
            return Ok(set);
        }

        let mut builder = WalkBuilder::new(dir);
        builder.standard_filters(false);

        for entry in builder.build() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(error) => {
                    warn!(error = ?error, "Failed to scan output directory");
                    continue;
                }
            };

            if !entry.file_type().map_or(false, |kind| kind.is_file()) {
                continue;
            }

            if is_partial(&entry.file_name().to_string_lossy()) {
                debug!(path = ?entry.path(), "Removing stale partial download");
                fs::remove_file(entry.path())?;
                continue;
            }

            if let Ok(relative) = entry.path().strip_prefix(dir) {
                set.insert(
                    relative
                        .components()
                        .map(|component| component.as_os_str().to_string_lossy())
                        .join("/"),
                );
            }
        }

        Ok(set)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.lock().contains(name)
    }

    /// returns `false` if the name was already present
    pub fn insert(&self, name: impl Into<String>) -> bool {
        self.names.lock().insert(name.into())
    }

    pub fn len(&self) -> usize {
        self.names.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// local directory receiving the outputs of `job` below `base`
pub fn output_dir(base: &Path, job: &JobId) -> PathBuf {
    base.join(job.output_container())
}

/// Download one blob through a partial file renamed into place
pub fn download_blob(
    store: &dyn ObjectStore,
    container: &str,
    blob: &str,
    target: &Path,
) -> Result<(), RemoteError> {
    let file_name = target
        .file_name()
        .ok_or_else(|| RemoteError::Rejected(format!("invalid download target {target:?}")))?;
    let mut partial_name = PARTIAL_PREFIX.to_owned();
    partial_name.push_str(&file_name.to_string_lossy());
    let partial = target.with_file_name(partial_name);

    if let Err(error) = store.download(container, blob, &partial) {
        let _ = fs::remove_file(&partial);

        return Err(error);
    }

    fs::rename(&partial, target)?;

    Ok(())
}

/// Continuously mirrors the output container of a job into a local directory
pub struct OutputHarvester<'a> {
    store: &'a dyn ObjectStore,
    executor: &'a dyn Executor,
    job: JobId,
    dir: PathBuf,
    interval: Duration,
    workers: ThreadPool,
    downloaded: DownloadedSet,
}

impl<'a> OutputHarvester<'a> {
    /// Prepare `dir` and rebuild the set of finished downloads from it
    pub fn new(
        store: &'a dyn ObjectStore,
        executor: &'a dyn Executor,
        job: JobId,
        dir: PathBuf,
        interval: Duration,
        concurrency: usize,
    ) -> Result<Self, HarvestError> {
        let downloaded = fs::create_dir_all(&dir)
            .and_then(|_| DownloadedSet::rebuild(&dir))
            .map_err(|source| HarvestError::OutputDir {
                path: dir.clone(),
                source,
            })?;

        debug!(job = %job, existing = downloaded.len(), "Rebuilt downloaded set");

        let workers = ThreadPoolBuilder::new()
            .num_threads(concurrency)
            .thread_name(|index| format!("parasim-download-{index}"))
            .build()?;

        Ok(Self {
            store,
            executor,
            job,
            dir,
            interval,
            workers,
            downloaded,
        })
    }

    pub fn downloaded(&self) -> &DownloadedSet {
        &self.downloaded
    }

    /// Download every listed object not downloaded yet, returns how many were fetched.
    ///
    /// A failing download does not stop the others, the first failure is reported once all of
    /// them were attempted.
    pub fn harvest_once(&self, token: &ShutdownToken) -> Result<usize, HarvestError> {
        let container = self.job.output_container();

        let pending = self
            .store
            .list(&container)
            .map_err(|source| HarvestError::List {
                job: self.job,
                source,
            })?
            .into_iter()
            .filter(|blob| {
                if is_partial(&blob.name) {
                    trace!(blob = %blob.name, "Skipping object with a reserved name");
                    return false;
                }

                !self.downloaded.contains(&blob.name)
            })
            .collect_vec();

        if pending.is_empty() {
            trace!(job = %self.job, "No new outputs");
            return Ok(0);
        }

        let results = self.workers.install(|| {
            pending
                .par_iter()
                .filter(|_| !token.is_cancelled())
                .map(|blob| (blob, self.fetch(&container, &blob.name)))
                .collect::<Vec<_>>()
        });

        let total = results.len();
        let mut failures = Vec::new();

        for (blob, result) in results {
            if let Err(error) = result {
                warn!(error = ?error, blob = %blob.name, "Download Error");
                failures.push(error);
            }
        }

        let failed = failures.len();
        info!(job = %self.job, downloaded = total - failed, failed = failed, "Harvested outputs");

        match failures.into_iter().next() {
            Some(first) => Err(HarvestError::Downloads {
                failed,
                total,
                first,
            }),
            None => Ok(total),
        }
    }

    fn fetch(&self, container: &str, blob: &str) -> Result<(), RemoteError> {
        if !Path::new(blob)
            .components()
            .all(|component| matches!(component, Component::Normal(_)))
        {
            return Err(RemoteError::Rejected(format!(
                "refusing to download {blob:?} outside the output directory"
            )));
        }

        let target = self.dir.join(blob);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        download_blob(self.store, container, blob, &target)?;
        self.downloaded.insert(blob);

        Ok(())
    }

    /// `true` once the job cannot produce further outputs, a vanished job counts as done
    fn job_complete(&self) -> bool {
        match self.executor.job(&self.job) {
            Ok(Some(job)) => job.state.is_finished(),
            Ok(None) => true,
            Err(error) => {
                warn!(error = ?error, job = %self.job, "Failed to query job state");
                false
            }
        }
    }

    /// Harvest until the job is complete and a full cycle succeeded, or `token` is cancelled.
    ///
    /// Returns the number of objects downloaded by this call.
    #[instrument(skip_all, fields(job = %self.job))]
    pub fn run(&self, token: &ShutdownToken) -> usize {
        let mut harvested = 0;

        loop {
            if token.is_cancelled() {
                break;
            }

            // sampled before listing so outputs written right before completion are included
            let complete = self.job_complete();

            if token.is_cancelled() {
                break;
            }

            match self.harvest_once(token) {
                Ok(count) => {
                    harvested += count;

                    if complete {
                        info!(harvested = harvested, "Job complete, all outputs harvested");
                        break;
                    }
                }
                Err(error) => {
                    if let HarvestError::Downloads { total, failed, .. } = &error {
                        harvested += total - failed;
                    }
                    warn!(error = ?error, "Harvest cycle failed");
                }
            }

            if token.wait(self.interval) {
                break;
            }
        }

        harvested
    }
}
