use crate::{
    error::{chain, RemoteError},
    job::JobId,
    storage::ObjectStore,
};
use chrono::Utc;
use parking_lot::Mutex;
use std::{
    error::Error,
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{error, info};

/// Remote object name of the job manager summary
pub const MANAGER_SUMMARY: &str = "manager-summary.stdout";

/// Remote object name of the client side submission summary
pub const SUBMIT_SUMMARY: &str = "submit-summary.stdout";

#[derive(Error, Debug)]
pub enum SummaryError {
    #[error("failed to write local fallback summary {path:?}")]
    Fallback { path: PathBuf, source: io::Error },
}

/// Running log of one orchestration call.
///
/// Owned by the call, handed down by reference to every step and persisted exactly once at the
/// end, regardless of the outcome. Appends are serialized so parallel transfers may report into
/// it.
#[derive(Debug)]
pub struct Summary {
    name: &'static str,
    lines: Mutex<Vec<String>>,
}

impl Summary {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            lines: Mutex::new(Vec::new()),
        }
    }

    pub fn line(&self, message: impl Into<String>) {
        let message = message.into();
        info!(summary = self.name, "{message}");
        self.lines.lock().push(message);
    }

    /// record a failure with its full cause chain
    pub fn failure(&self, context: &str, failure: &(dyn Error + 'static)) {
        let message = format!("{context}: {}", chain(failure));
        error!(summary = self.name, "{message}");
        self.lines.lock().push(message);
    }

    pub fn render(&self) -> String {
        let lines = self.lines.lock();
        let mut rendered = String::with_capacity(lines.iter().map(|line| line.len() + 1).sum());

        for line in lines.iter() {
            rendered.push_str(line);
            rendered.push('\n');
        }

        rendered
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    /// Write the summary into the job's output container and into the local fallback location.
    ///
    /// A failing remote write is recorded in the fallback copy, only a failing fallback write is
    /// reported to the caller.
    pub fn persist(
        &self,
        store: &dyn ObjectStore,
        job: &JobId,
        fallback_dir: &Path,
    ) -> Result<PathBuf, SummaryError> {
        self.line(format!("Storing summary at {}", Utc::now().to_rfc3339()));

        let job_dir = fallback_dir.join(job.to_string());
        let fallback = job_dir.join(self.name.replace(".stdout", "-fallback.stdout"));

        if let Err(failure) = self.persist_remote(store, job, &job_dir) {
            self.failure("Error storing summary remotely", &failure);
        }

        fs::create_dir_all(&job_dir)
            .and_then(|_| fs::write(&fallback, self.render()))
            .map_err(|source| SummaryError::Fallback {
                path: fallback.clone(),
                source,
            })?;

        Ok(fallback)
    }

    fn persist_remote(
        &self,
        store: &dyn ObjectStore,
        job: &JobId,
        staging_dir: &Path,
    ) -> Result<(), RemoteError> {
        let container = job.output_container();
        store.create_container(&container)?;

        if store.exists(&container, self.name)? {
            info!(job = %job, "Summary {} already stored, keeping existing copy", self.name);

            return Ok(());
        }

        fs::create_dir_all(staging_dir)?;
        let staged = staging_dir.join(self.name);
        fs::write(&staged, self.render())?;

        let result = store.upload(&container, self.name, &staged);
        let _ = fs::remove_file(&staged);

        result
    }
}
