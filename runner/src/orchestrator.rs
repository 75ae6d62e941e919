
use crate::{
    collector::{discover, CollectError, Collector},
    config::{get_tmp_dir, ConfigErrors, RunnerConfig},
    error::RemoteError,
    executors::{self, Executor},
    harvester::{output_dir, HarvestError, OutputHarvester},
    job::{
        AutoPoolSpec, JobDetails, JobId, JobParameters, JobSpec, PoolDetails, PoolSpec,
        PreparationStep, ReleaseStep, ResourceFile, SimulationUnit, TaskDetails, TaskSpec,
        MANAGER_TASK_ID, MODEL_ARCHIVE_NAME,
    },
    monitor::{CompletionMonitor, ErrorTally, MonitorError, MonitorState},
    packager::{archive::zip_folder, archive::ArchiveError, PackageError, ResultPackager},
    storage::{
        self, file_checksum, CapabilityWindow, ObjectStore, APPLICATION_CONTAINER,
        TOOLS_CONTAINER,
    },
    summary::{Summary, SummaryError, MANAGER_SUMMARY, SUBMIT_SUMMARY},
    sync::ShutdownToken,
    tasks::{quote, TaskGenerator},
};
use ignore::{DirEntry, WalkBuilder};
use itertools::Itertools;
use rayon::{prelude::*, ThreadPoolBuilder};
use std::{
    collections::{BTreeMap, HashSet},
    env, fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Environment variable carrying the configuration path into the job manager
pub const ENV_CONFIG: &str = "PARASIM_CONFIG";

/// Resize timeout of job scoped pools
pub const AUTO_POOL_RESIZE_TIMEOUT_SECS: u64 = 15 * 60;

#[derive(Error, Debug)]
pub enum OrchestrationError {
    #[error("{0}")]
    InputValidation(String),
    #[error("Remote request failed")]
    Remote(#[from] RemoteError),
    #[error("Failed to collect simulations")]
    Collect(#[from] CollectError),
    #[error("Gave up waiting for tasks")]
    Monitor(#[from] MonitorError),
    #[error("Failed to download outputs")]
    Harvest(#[from] HarvestError),
    #[error("Failed to package results")]
    Fatal(#[from] PackageError),
    #[error("Failed to archive input")]
    Archive(#[from] ArchiveError),
    #[error("Failed to write summary")]
    Summary(#[from] SummaryError),
    #[error("Failed to build worker pool")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("Cancelled")]
    Cancelled,
    #[error("Local I/O failed")]
    Io(#[from] io::Error),
}

/// Entry point for every user facing action on jobs
pub struct JobOrchestrator {
    config: RunnerConfig,
    config_path: PathBuf,
    store: Arc<dyn ObjectStore>,
    executor: Arc<dyn Executor>,
}

impl JobOrchestrator {
    /// Connect to the configured store and compute service
    pub fn load(config: RunnerConfig, config_path: PathBuf) -> Result<Self, ConfigErrors> {
        let store = storage::load(&config.storage)?;
        let executor = executors::load(&config.executor)?;

        Ok(Self::new(config, config_path, store, executor))
    }

    pub fn new(
        config: RunnerConfig,
        config_path: PathBuf,
        store: Arc<dyn ObjectStore>,
        executor: Arc<dyn Executor>,
    ) -> Self {
        Self {
            config,
            config_path,
            store,
            executor,
        }
    }

    /// Validate the input, stage it and commit a new job.
    ///
    /// Nothing is touched remotely if the input is invalid. Once a job id exists the submit
    /// summary is persisted whatever the outcome.
    #[instrument(skip_all, fields(name = %parameters.display_name))]
    pub fn submit_job(
        &self,
        parameters: &JobParameters,
        token: &ShutdownToken,
    ) -> Result<JobId, OrchestrationError> {
        let collector = validate(parameters)?;
        let units = collector.units()?;

        if token.is_cancelled() {
            return Err(OrchestrationError::Cancelled);
        }

        let job = JobId::generate();
        let summary = Summary::new(SUBMIT_SUMMARY);
        summary.line(format!("Submitting job {job} ({})", parameters.display_name));

        let result = self.stage_and_commit(job, parameters, &collector, units, &summary, token);

        match &result {
            Ok(()) => summary.line(format!("Submitted Job {job}")),
            Err(error) => summary.failure("Submission failed", error),
        }

        if let Err(error) =
            summary.persist(self.store.as_ref(), &job, &self.config.summary.fallback_dir)
        {
            warn!(error = ?error, job = %job, "Failed to persist submit summary");
        }

        result.map(|_| job)
    }

    fn stage_and_commit(
        &self,
        job: JobId,
        parameters: &JobParameters,
        collector: &Collector,
        units: Vec<SimulationUnit>,
        summary: &Summary,
        token: &ShutdownToken,
    ) -> Result<(), OrchestrationError> {
        summary.line("Staging input...");
        let model_url = self.stage_input(&job, collector)?;

        if token.is_cancelled() {
            return Err(OrchestrationError::Cancelled);
        }

        // tasks start uploading as soon as they run
        self.store.create_container(&job.output_container())?;

        // the staged archive of a directory carries no manifest to rediscover the units from
        let client_side =
            !parameters.manager_submits_tasks || matches!(collector, Collector::Directory { .. });

        if parameters.manager_submits_tasks && client_side {
            summary.line("Directory input, submitting tasks from the client");
        }

        let spec = self.job_spec(job, parameters, model_url, !client_side)?;
        self.executor.create_job(&spec)?;
        summary.line("Job committed");

        if client_side {
            let generator = self.generator(units, parameters.cores_per_process);
            let submitted = self.submit_tasks(&job, &generator, token)?;
            summary.line(format!("Submitted {submitted} of {} tasks", generator.len()));
        }

        Ok(())
    }

    /// Upload the model input unless an identical copy is already staged, returns its read url
    fn stage_input(&self, job: &JobId, collector: &Collector) -> Result<String, OrchestrationError> {
        let container = job.input_container();
        self.store.create_container(&container)?;

        let url = match collector {
            Collector::Archive { path } => self.upload_if_changed(&container, path)?,
            Collector::Directory { path } => {
                let staged = get_tmp_dir().join(format!("parasim-{job}-{MODEL_ARCHIVE_NAME}"));
                let entries = zip_folder(path, &staged)?;
                debug!(entries = entries, archive = ?staged, "Zipped input directory");

                let result = self.upload_if_changed(&container, &staged);
                let _ = fs::remove_file(&staged);
                result?
            }
        };

        Ok(url)
    }

    fn upload_if_changed(&self, container: &str, path: &Path) -> Result<String, OrchestrationError> {
        let checksum = file_checksum(path)?;

        let unchanged = self
            .store
            .properties(container, MODEL_ARCHIVE_NAME)?
            .and_then(|blob| blob.checksum)
            .map_or(false, |remote| remote == checksum);

        if unchanged {
            info!(container = container, "Input already staged");
        } else {
            info!(path = ?path, container = container, "Uploading input");
            self.store.upload(container, MODEL_ARCHIVE_NAME, path)?;
        }

        Ok(self.store.read_capability(
            container,
            MODEL_ARCHIVE_NAME,
            CapabilityWindow::staged_input(),
        ))
    }

    /// the staged model plus every tool and matching application blob
    fn resource_files(
        &self,
        model_url: String,
        application_version: &str,
    ) -> Result<Vec<ResourceFile>, RemoteError> {
        let window = CapabilityWindow::shared_tool();
        let version = application_version.to_lowercase();

        let mut resources = vec![ResourceFile {
            url: model_url,
            file_name: MODEL_ARCHIVE_NAME.to_owned(),
        }];

        for blob in self.store.list(TOOLS_CONTAINER)? {
            resources.push(ResourceFile {
                url: self.store.read_capability(TOOLS_CONTAINER, &blob.name, window),
                file_name: blob.name,
            });
        }

        for blob in self.store.list(APPLICATION_CONTAINER)? {
            if blob.name.to_lowercase().contains(&version) {
                resources.push(ResourceFile {
                    url: self.store.read_capability(APPLICATION_CONTAINER, &blob.name, window),
                    file_name: blob.name,
                });
            }
        }

        Ok(resources)
    }

    fn job_spec(
        &self,
        job: JobId,
        parameters: &JobParameters,
        model_url: String,
        manager_submits_tasks: bool,
    ) -> Result<JobSpec, OrchestrationError> {
        let pool = match &self.config.pool.name {
            Some(name) => PoolSpec::Named(name.clone()),
            None => PoolSpec::Auto(AutoPoolSpec {
                vm_size: self.config.pool.vm_size.clone(),
                target_dedicated: self.config.pool.vm_count,
                max_tasks_per_node: self.config.pool.max_tasks_per_vm,
                resize_timeout_secs: AUTO_POOL_RESIZE_TIMEOUT_SECS,
            }),
        };

        Ok(JobSpec {
            id: job,
            display_name: parameters.display_name.clone(),
            pool,
            preparation: PreparationStep {
                command: self.config.job.preparation_command.clone(),
                resource_files: self
                    .resource_files(model_url, &parameters.application_version)?,
                wait_for_success: true,
            },
            manager: self.manager_task(&job, manager_submits_tasks, parameters.auto_scale)?,
            release: self
                .config
                .job
                .release_command
                .clone()
                .map(|command| ReleaseStep { command }),
        })
    }

    fn manager_task(
        &self,
        job: &JobId,
        submit_tasks: bool,
        auto_scale: bool,
    ) -> Result<TaskSpec, OrchestrationError> {
        let program = match &self.config.job.manager_command {
            Some(command) => command.clone(),
            None => quote(&env::current_exe()?.to_string_lossy()),
        };

        let config_path = self
            .config_path
            .canonicalize()
            .unwrap_or_else(|_| self.config_path.clone());
        let config_path = config_path.to_string_lossy();

        Ok(TaskSpec {
            id: MANAGER_TASK_ID.to_owned(),
            display_name: "Job manager".to_owned(),
            command: format!(
                "{program} --config {} run-manager {job} {} {submit_tasks} {auto_scale}",
                quote(&config_path),
                quote(MODEL_ARCHIVE_NAME),
            ),
            environment: BTreeMap::from([(ENV_CONFIG.to_owned(), config_path.into_owned())]),
        })
    }

    fn generator(
        &self,
        units: Vec<SimulationUnit>,
        cores_per_process: u32,
    ) -> TaskGenerator {
        let (account, key) = self.store.credentials();

        TaskGenerator::new(
            units,
            self.config.job.task_command.clone(),
            account,
            key,
            cores_per_process,
        )
    }

    /// Submit every generated task the job does not know yet, returns how many were submitted.
    ///
    /// The known ids are read once right before submitting. A task created remotely in between
    /// is submitted again, which the compute service ignores for an existing id.
    #[instrument(skip_all, fields(job = %job))]
    pub fn submit_tasks(
        &self,
        job: &JobId,
        generator: &TaskGenerator,
        token: &ShutdownToken,
    ) -> Result<usize, OrchestrationError> {
        let existing = self
            .executor
            .list_tasks(job)?
            .into_iter()
            .map(|task| task.id)
            .collect::<HashSet<_>>();

        let container_url = self.store.container_url(&job.output_container());
        let pending = generator
            .generate(job, &container_url)
            .filter(|task| !existing.contains(&task.id))
            .collect_vec();

        if pending.is_empty() {
            info!(existing = existing.len(), "All tasks already submitted");
            return Ok(0);
        }

        let workers = ThreadPoolBuilder::new()
            .num_threads(self.config.monitor.submit_concurrency)
            .thread_name(|index| format!("parasim-submit-{index}"))
            .build()?;

        let results = workers.install(|| {
            pending
                .par_chunks(self.config.monitor.submit_batch_size)
                .filter(|_| !token.is_cancelled())
                .map(|batch| {
                    self.executor
                        .add_tasks(job, batch.to_vec())
                        .map(|_| batch.len())
                })
                .collect::<Vec<_>>()
        });

        let mut submitted = 0;
        let mut failure = None;

        for result in results {
            match result {
                Ok(count) => submitted += count,
                Err(error) => {
                    warn!(error = ?error, "Failed to submit task batch");
                    failure.get_or_insert(error);
                }
            }
        }

        info!(submitted = submitted, pending = pending.len(), "Submitted tasks");

        match failure {
            Some(error) => Err(error.into()),
            None => Ok(submitted),
        }
    }

    /// Every job with the pool it runs on, stops early once `token` is cancelled
    pub fn list_jobs(&self, token: &ShutdownToken) -> Result<Vec<JobDetails>, OrchestrationError> {
        let pools = self.executor.list_pools()?;
        let mut details = Vec::new();

        for job in self.executor.list_jobs()? {
            if token.is_cancelled() {
                break;
            }

            let pool = job
                .pool_id
                .as_ref()
                .and_then(|id| pools.iter().find(|pool| &pool.id == id))
                .map(PoolDetails::from);

            details.push(JobDetails {
                id: job.id,
                display_name: job.display_name,
                state: job.state,
                start: job.start,
                end: job.end,
                pool,
            });
        }

        Ok(details)
    }

    pub fn list_tasks(
        &self,
        job: &JobId,
        token: &ShutdownToken,
    ) -> Result<Vec<TaskDetails>, OrchestrationError> {
        self.require_job(job)?;

        Ok(self
            .executor
            .list_tasks(job)?
            .into_iter()
            .take_while(|_| !token.is_cancelled())
            .map(TaskDetails::from)
            .collect())
    }

    pub fn terminate_job(&self, job: &JobId) -> Result<(), OrchestrationError> {
        self.require_job(job)?;
        self.executor.terminate_job(job)?;
        info!(job = %job, "Terminated job");

        Ok(())
    }

    /// Remove the outputs, then the job.
    ///
    /// Outputs go first so an interrupted delete never leaves a job whose outputs cannot be found
    /// anymore. Both steps tolerate an already missing counterpart.
    pub fn delete_job(&self, job: &JobId) -> Result<(), OrchestrationError> {
        match self.store.delete_container(&job.output_container()) {
            Ok(()) | Err(RemoteError::NotFound { .. }) => {}
            Err(error) => return Err(error.into()),
        }
        info!(job = %job, "Deleted job outputs");

        match self.executor.delete_job(job) {
            Ok(()) => info!(job = %job, "Deleted job"),
            Err(RemoteError::NotFound { .. }) => info!(job = %job, "Job not found"),
            Err(error) => return Err(error.into()),
        }

        Ok(())
    }

    fn require_job(&self, job: &JobId) -> Result<(), OrchestrationError> {
        match self.executor.job(job)? {
            Some(_) => Ok(()),
            None => Err(OrchestrationError::InputValidation(format!(
                "Job {job} not found"
            ))),
        }
    }

    /// Mirror the outputs of a job into `base` until the job is complete
    #[instrument(skip_all, fields(job = %job))]
    pub fn download_outputs(
        &self,
        job: &JobId,
        base: &Path,
        token: &ShutdownToken,
    ) -> Result<usize, OrchestrationError> {
        let harvester = OutputHarvester::new(
            self.store.as_ref(),
            self.executor.as_ref(),
            *job,
            output_dir(base, job),
            self.config.monitor.harvest_interval(),
            self.config.monitor.transfer_concurrency,
        )?;

        Ok(harvester.run(token))
    }

    /// Drive a job from inside the pool: submit, wait, package.
    ///
    /// The manager summary is persisted whatever the outcome, a failing fallback write is only
    /// reported if everything else succeeded.
    #[instrument(skip_all, fields(job = %job, submit_tasks = submit_tasks, auto_scale = auto_scale))]
    pub fn run_manager(
        &self,
        job: &JobId,
        input: &Path,
        submit_tasks: bool,
        auto_scale: bool,
        token: &ShutdownToken,
    ) -> Result<MonitorState, OrchestrationError> {
        let summary = Summary::new(MANAGER_SUMMARY);
        let result = self.manage(job, input, submit_tasks, auto_scale, &summary, token);

        match &result {
            Ok(state) => summary.line(format!("Job manager finished: {state:?}")),
            Err(error) => summary.failure("Job manager failed", error),
        }

        diagnostics(&summary, &get_tmp_dir());

        let persisted =
            summary.persist(self.store.as_ref(), job, &self.config.summary.fallback_dir);
        let state = result?;
        persisted?;

        Ok(state)
    }

    fn manage(
        &self,
        job: &JobId,
        input: &Path,
        submit_tasks: bool,
        auto_scale: bool,
        summary: &Summary,
        token: &ShutdownToken,
    ) -> Result<MonitorState, OrchestrationError> {
        summary.line("Submitting tasks");

        if submit_tasks {
            let generator = self.generator(discover(input)?, self.config.job.cores_per_process);
            let submitted = self.submit_tasks(job, &generator, token)?;
            summary.line(format!("Submitted {submitted} of {} tasks", generator.len()));
        } else if !self.await_first_task(job, token)? {
            summary.line("Cancelled before any task was submitted");

            return Ok(MonitorState::CancelledExternally);
        }

        let mut monitor = CompletionMonitor::new(
            self.executor.as_ref(),
            *job,
            auto_scale,
            self.config.monitor.poll_interval(),
            self.config.monitor.error_ceiling,
        );

        let state = monitor.run(token)?;

        if state != MonitorState::Completed {
            summary.line("Cancelled while waiting for tasks");

            return Ok(state);
        }

        summary.line("Tasks complete");
        self.store.create_container(&job.output_container())?;

        let packager = ResultPackager::new(
            self.store.as_ref(),
            *job,
            self.scratch_dir(job),
            self.config.monitor.transfer_concurrency,
        )?;
        let report = packager.package(summary, token)?;

        if !report.is_complete() {
            warn!(failures = report.failures.len(), "Packaging finished with failures");
        }

        Ok(state)
    }

    /// local working directory of the packaging step, next to the summary fallback of the job
    pub fn scratch_dir(&self, job: &JobId) -> PathBuf {
        self.config
            .summary
            .fallback_dir
            .join(job.to_string())
            .join("results")
    }

    /// Wait for the client to submit, a job without tasks would count as complete right away.
    ///
    /// Returns `false` if cancelled first.
    fn await_first_task(&self, job: &JobId, token: &ShutdownToken) -> Result<bool, OrchestrationError> {
        let mut tally = ErrorTally::new(self.config.monitor.error_ceiling);

        loop {
            if token.is_cancelled() {
                return Ok(false);
            }

            match self.executor.list_tasks(job) {
                Ok(tasks) if tasks.iter().any(|task| task.id != MANAGER_TASK_ID) => {
                    return Ok(true)
                }
                Ok(_) => {
                    tally.success();
                    debug!(job = %job, "Waiting for the first task");
                }
                Err(last) => {
                    if tally.failure() {
                        return Err(MonitorError::TooManyErrors {
                            errors: tally.errors(),
                            last,
                        }
                        .into());
                    }
                    warn!(error = ?last, job = %job, "Failed to list tasks");
                }
            }

            if token.wait(self.config.monitor.poll_interval()) {
                return Ok(false);
            }
        }
    }

    /// Upload tools and application archives that are missing or differ in size
    #[instrument(skip_all)]
    pub fn stage_tools(&self) -> Result<usize, OrchestrationError> {
        let mut uploaded = 0;

        for (dir, container) in [
            (&self.config.job.tools_dir, TOOLS_CONTAINER),
            (&self.config.job.application_dir, APPLICATION_CONTAINER),
        ] {
            let Some(dir) = dir else {
                continue;
            };

            self.store.create_container(container)?;

            for path in staged_files(dir) {
                let Some(name) = path.file_name().map(|name| name.to_string_lossy().into_owned())
                else {
                    continue;
                };

                let size = fs::metadata(&path)?.len();
                let current = self.store.properties(container, &name)?;

                if current.map_or(false, |blob| blob.size == size) {
                    debug!(container = container, blob = %name, "Already staged");
                    continue;
                }

                info!(container = container, blob = %name, "Uploading");
                self.store.upload(container, &name, &path)?;
                uploaded += 1;
            }
        }

        Ok(uploaded)
    }
}

fn validate(parameters: &JobParameters) -> Result<Collector, OrchestrationError> {
    if parameters.display_name.trim().is_empty() {
        return Err(OrchestrationError::InputValidation(
            "Job name cannot be empty".to_owned(),
        ));
    }

    if !parameters.model_path.exists() {
        return Err(OrchestrationError::InputValidation(format!(
            "Model input {} does not exist",
            parameters.model_path.to_string_lossy()
        )));
    }

    Collector::load(&parameters.model_path).map_err(|error| match error {
        CollectError::InputNotFound(path) => OrchestrationError::InputValidation(format!(
            "Model input {} is neither a zip archive nor a directory",
            path.to_string_lossy()
        )),
        error => error.into(),
    })
}

fn staged_files(dir: &Path) -> Vec<PathBuf> {
    let mut builder = WalkBuilder::new(dir);
    builder.max_depth(Some(1)).standard_filters(false);

    builder
        .build()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(error) => {
                warn!(error = ?error, "Failed to list staged file");
                None
            }
        })
        .filter(|entry| entry.file_type().map_or(false, |kind| kind.is_file()))
        .map(DirEntry::into_path)
        .sorted()
        .collect()
}

// host and free space, environment variables stay out since they carry keys
fn diagnostics(summary: &Summary, scratch: &Path) {
    summary.line("------------------------");

    match nix::unistd::gethostname() {
        Ok(hostname) => summary.line(format!("Host: {}", hostname.to_string_lossy())),
        Err(error) => summary.failure("Failed to retrieve hostname", &error),
    }

    match nix::sys::statvfs::statvfs(scratch) {
        Ok(stat) => {
            let fragment = stat.fragment_size() as u64;
            summary.line(format!(
                "Available space in {}: {} MB of {} MB",
                scratch.to_string_lossy(),
                stat.blocks_available() as u64 * fragment / 1024 / 1024,
                stat.blocks() as u64 * fragment / 1024 / 1024,
            ));
        }
        Err(error) => summary.failure("Failed to retrieve free space", &error),
    }
}
