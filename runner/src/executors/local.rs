use super::Executor;
use crate::{
    config::{ConfigErrors, ExecutorConfig},
    error::RemoteError,
    job::{
        AllocationState, JobId, JobInfo, JobSpec, JobState, NodeInfo, NodeState, PoolInfo,
        PoolSpec, PoolState, ResourceFile, TaskInfo, TaskSpec, TaskState, MANAGER_TASK_ID,
    },
};
use chrono::Utc;
use parking_lot::Mutex;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::{self, File},
    io,
    path::{Component, Path, PathBuf},
    process::{Child, Command, Stdio},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, error, info, instrument, trace, warn};
use uuid::Uuid;
use wait_timeout::ChildExt;

const JOB_RECORD: &str = "job.yaml";
const RECORD_EXTENSION: &str = "yaml";

// granularity at which running commands notice a terminated job
const SUPERVISE_SLICE: Duration = Duration::from_millis(200);

#[derive(Serialize, Deserialize, Debug)]
struct JobRecord {
    spec: JobSpec,
    info: JobInfo,
}

#[derive(Serialize, Deserialize, Debug)]
struct TaskRecord {
    spec: TaskSpec,
    info: TaskInfo,
}

enum Exit {
    Code(i32),
    TimedOut,
    Stopped,
}

/// Compute service running every task on a local thread pool.
///
/// State lives in YAML records below `root`, so separate `parasim` invocations observe the same
/// jobs:
///
/// ```text
/// root/jobs/<job>/job.yaml
/// root/jobs/<job>/tasks/<task>.yaml
/// root/jobs/<job>/logs/<task>.{stdout,stderr}
/// root/jobs/<job>/shared/          working directory of every command of the job
/// root/pools/<pool>.yaml
/// ```
///
/// Tasks run inside the process that added them, a process exiting takes its queued tasks with
/// it. Nodes are synthesized from the pool size and the number of running tasks.
#[derive(Debug, Clone)]
pub struct LocalExecutor {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    root: PathBuf,
    workers: ThreadPool,
    threads: usize,
    timeout: Duration,
    // serializes read-modify-write of records
    records: Mutex<()>,
    processed: AtomicU64,
    total: AtomicU64,
}

impl LocalExecutor {
    pub fn load(config: &ExecutorConfig) -> Result<Self, ConfigErrors> {
        for dir in [config.root.join("jobs"), config.root.join("pools")] {
            fs::create_dir_all(&dir).map_err(|source| ConfigErrors::ExecutorRoot {
                path: dir.clone(),
                source,
            })?;
        }

        let threads = config.threads.unwrap_or_else(num_cpus::get);

        debug!("Starting thread pool with {threads} threads");

        let workers = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|index| format!("parasim-task-{index}"))
            .build()?;

        Ok(Self {
            inner: Arc::new(Inner {
                root: config.root.clone(),
                workers,
                threads,
                timeout: Duration::from_millis(config.task_timeout_ms),
                records: Mutex::new(()),
                processed: AtomicU64::new(0),
                total: AtomicU64::new(0),
            }),
        })
    }

    fn job_dir(&self, job: &JobId) -> PathBuf {
        self.inner.root.join("jobs").join(job.to_string())
    }

    fn job_path(&self, job: &JobId) -> PathBuf {
        self.job_dir(job).join(JOB_RECORD)
    }

    fn task_path(&self, job: &JobId, task: &str) -> PathBuf {
        self.job_dir(job)
            .join("tasks")
            .join(format!("{task}.{RECORD_EXTENSION}"))
    }

    fn log_path(&self, job: &JobId, task: &str) -> PathBuf {
        self.job_dir(job).join("logs").join(task)
    }

    fn shared_dir(&self, job: &JobId) -> PathBuf {
        self.job_dir(job).join("shared")
    }

    fn pool_path(&self, pool: &str) -> Result<PathBuf, RemoteError> {
        validate_name("pool", pool)?;

        Ok(self
            .inner
            .root
            .join("pools")
            .join(format!("{pool}.{RECORD_EXTENSION}")))
    }

    fn read_job(&self, job: &JobId) -> Result<Option<JobRecord>, RemoteError> {
        read_record(&self.job_path(job))
    }

    /// a job that is gone or about to finish stops every command it still runs
    fn job_stopping(&self, job: &JobId) -> bool {
        match self.read_job(job) {
            Ok(Some(record)) => {
                record.info.state.is_finished() || record.info.state == JobState::Terminating
            }
            Ok(None) => true,
            Err(error) => {
                warn!(error = ?error, job = %job, "Failed to read job record");
                false
            }
        }
    }

    /// Apply `update` to a task record, skipped if the record is gone or `update` returns false
    fn update_task(
        &self,
        job: &JobId,
        task: &str,
        update: impl FnOnce(&mut TaskInfo) -> bool,
    ) -> Result<bool, RemoteError> {
        let _guard = self.inner.records.lock();
        let path = self.task_path(job, task);

        let mut record = match read_record::<TaskRecord>(&path)? {
            Some(record) => record,
            None => return Ok(false),
        };

        if !update(&mut record.info) {
            return Ok(false);
        }

        write_record(&path, &record)?;

        Ok(true)
    }

    fn ensure_pool(&self, job: &JobId, pool: &PoolSpec) -> Result<String, RemoteError> {
        let (id, info) = match pool {
            PoolSpec::Auto(auto) => {
                let id = format!("job-{job}-pool");
                let info = PoolInfo {
                    id: id.clone(),
                    vm_size: auto.vm_size.clone(),
                    state: PoolState::Active,
                    allocation_state: AllocationState::Steady,
                    current_dedicated: auto.target_dedicated,
                    max_tasks_per_node: auto.max_tasks_per_node,
                };
                (id, info)
            }
            PoolSpec::Named(name) => {
                // named pools are created on first use, sized after the worker threads
                let info = PoolInfo {
                    id: name.clone(),
                    vm_size: "local".to_owned(),
                    state: PoolState::Active,
                    allocation_state: AllocationState::Steady,
                    current_dedicated: u32::try_from(self.inner.threads).unwrap_or(u32::MAX),
                    max_tasks_per_node: 1,
                };
                (name.clone(), info)
            }
        };

        let path = self.pool_path(&id)?;
        if read_record::<PoolInfo>(&path)?.is_none() {
            debug!(pool = %id, "Creating pool");
            write_record(&path, &info)?;
        }

        Ok(id)
    }

    fn fetch_resource(&self, shared: &Path, resource: &ResourceFile) -> Result<(), RemoteError> {
        let location = resource.url.split('?').next().unwrap_or_default();
        let source = location.strip_prefix("file://").ok_or_else(|| {
            RemoteError::Rejected(format!("cannot fetch non local resource {location}"))
        })?;
        validate_relative(&resource.file_name)?;

        let target = shared.join(&resource.file_name);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::copy(source, &target)?;
        trace!(resource = %resource.file_name, "Fetched resource file");

        Ok(())
    }

    fn spawn(
        &self,
        job: &JobId,
        name: &str,
        command: &str,
        environment: &BTreeMap<String, String>,
    ) -> io::Result<Child> {
        let log = self.log_path(job, name);
        if let Some(parent) = log.parent() {
            fs::create_dir_all(parent)?;
        }

        Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(self.shared_dir(job))
            .envs(environment)
            .stdin(Stdio::null())
            .stdout(File::create(log.with_extension("stdout"))?)
            .stderr(File::create(log.with_extension("stderr"))?)
            .spawn()
    }

    /// Wait for a child while watching for the timeout and, if `watch_job` is set, for a stopping
    /// job
    fn supervise(&self, job: &JobId, child: &mut Child, watch_job: bool) -> io::Result<Exit> {
        let start = Instant::now();

        loop {
            if let Some(status) = child.wait_timeout(SUPERVISE_SLICE)? {
                return Ok(Exit::Code(status.code().unwrap_or(-1)));
            }

            let stop = if start.elapsed() >= self.inner.timeout {
                Some(Exit::TimedOut)
            } else if watch_job && self.job_stopping(job) {
                Some(Exit::Stopped)
            } else {
                None
            };

            if let Some(exit) = stop {
                child.kill()?;
                child.wait()?;

                return Ok(exit);
            }
        }
    }

    fn run_blocking(
        &self,
        job: &JobId,
        name: &str,
        command: &str,
        environment: &BTreeMap<String, String>,
        watch_job: bool,
    ) -> io::Result<Exit> {
        let mut child = self.spawn(job, name, command, environment)?;

        self.supervise(job, &mut child, watch_job)
    }

    fn run_task(&self, job: JobId, task: TaskSpec) {
        if let Err(error) = self.try_run_task(&job, &task) {
            error!(error = ?error, job = %job, task = %task.id, "Failed to run task");

            let completed = self.update_task(&job, &task.id, |info| {
                info.state = TaskState::Completed;
                info.end = Some(Utc::now());
                true
            });

            if let Err(error) = completed {
                error!(error = ?error, job = %job, task = %task.id, "Failed to complete task");
            }
        }

        info!(
            "Done with {}/{}",
            self.inner.processed.fetch_add(1, Ordering::SeqCst) + 1,
            self.inner.total.load(Ordering::SeqCst)
        );
    }

    fn try_run_task(&self, job: &JobId, task: &TaskSpec) -> Result<(), RemoteError> {
        // terminated before a worker picked it up
        if self.job_stopping(job) {
            return Ok(());
        }

        let started = self.update_task(job, &task.id, |info| {
            if info.state != TaskState::Active {
                return false;
            }
            info.state = TaskState::Running;
            info.start = Some(Utc::now());
            true
        })?;

        if !started {
            return Ok(());
        }

        debug!(job = %job, task = %task.id, command = %task.command, "Running task");

        let exit = self.run_blocking(job, &task.id, &task.command, &task.environment, true)?;

        let exit_code = match exit {
            Exit::Code(code) => Some(code),
            Exit::TimedOut => {
                warn!(job = %job, task = %task.id, "Task timed out and was killed");
                None
            }
            Exit::Stopped => None,
        };

        self.update_task(job, &task.id, |info| {
            info.state = TaskState::Completed;
            info.end = Some(Utc::now());
            info.exit_code = exit_code;
            true
        })?;

        Ok(())
    }

    fn watch_manager(&self, job: JobId, mut child: Child, release: Option<String>) {
        let exit_code = match self.supervise(&job, &mut child, true) {
            Ok(Exit::Code(code)) => Some(code),
            Ok(_) => None,
            Err(error) => {
                error!(error = ?error, job = %job, "Failed to wait for the job manager");
                None
            }
        };

        info!(job = %job, exit_code = ?exit_code, "Job manager finished");

        if let Err(error) = self
            .update_task(&job, MANAGER_TASK_ID, |info| {
                info.state = TaskState::Completed;
                info.end = Some(Utc::now());
                info.exit_code = exit_code;
                true
            })
            .and_then(|_| self.finish_job(&job))
        {
            error!(error = ?error, job = %job, "Failed to complete job");
        }

        if let Some(release) = release {
            // the job is finished at this point, only the timeout applies
            match self.run_blocking(&job, "release", &release, &BTreeMap::new(), false) {
                Ok(Exit::Code(0)) => debug!(job = %job, "Release step finished"),
                Ok(_) => warn!(job = %job, "Release step failed"),
                Err(error) => warn!(error = ?error, job = %job, "Failed to run release step"),
            }
        }
    }

    /// Complete the job and every task that did not finish yet
    fn finish_job(&self, job: &JobId) -> Result<(), RemoteError> {
        let _guard = self.inner.records.lock();
        let path = self.job_path(job);

        let mut record = match read_record::<JobRecord>(&path)? {
            Some(record) => record,
            None => return Ok(()),
        };

        if record.info.state.is_finished() {
            return Ok(());
        }

        let now = Utc::now();

        for (task_path, mut task) in read_records::<TaskRecord>(&self.job_dir(job).join("tasks"))? {
            if !task.info.state.is_terminal() {
                task.info.state = TaskState::Completed;
                task.info.end = Some(now);
                write_record(&task_path, &task)?;
            }
        }

        record.info.state = JobState::Completed;
        record.info.end = Some(now);
        write_record(&path, &record)
    }

    fn start_manager(&self, spec: &JobSpec) -> Result<(), RemoteError> {
        let manager = &spec.manager;
        let now = Utc::now();

        {
            let _guard = self.inner.records.lock();
            write_record(
                &self.task_path(&spec.id, MANAGER_TASK_ID),
                &TaskRecord {
                    spec: manager.clone(),
                    info: TaskInfo {
                        id: MANAGER_TASK_ID.to_owned(),
                        display_name: manager.display_name.clone(),
                        state: TaskState::Running,
                        start: Some(now),
                        end: None,
                        exit_code: None,
                    },
                },
            )?;
        }

        let child = self.spawn(
            &spec.id,
            MANAGER_TASK_ID,
            &manager.command,
            &manager.environment,
        )?;

        let executor = self.clone();
        let job = spec.id;
        let release = spec.release.as_ref().map(|release| release.command.clone());

        thread::Builder::new()
            .name(format!("parasim-manager-{job}"))
            .spawn(move || executor.watch_manager(job, child, release))?;

        Ok(())
    }

    fn set_job_state(&self, job: &JobId, state: JobState) -> Result<(), RemoteError> {
        let _guard = self.inner.records.lock();
        let path = self.job_path(job);

        if let Some(mut record) = read_record::<JobRecord>(&path)? {
            record.info.state = state;
            if state.is_finished() {
                record.info.end = Some(Utc::now());
            }
            write_record(&path, &record)?;
        }

        Ok(())
    }
}

impl Executor for LocalExecutor {
    #[instrument(skip_all, fields(job = %spec.id), level = "debug")]
    fn create_job(&self, spec: &JobSpec) -> Result<(), RemoteError> {
        let job_dir = self.job_dir(&spec.id);
        let shared = self.shared_dir(&spec.id);

        {
            let _guard = self.inner.records.lock();
            let path = self.job_path(&spec.id);

            if path.exists() {
                return Err(RemoteError::already_exists("job", spec.id));
            }

            fs::create_dir_all(job_dir.join("tasks"))?;
            fs::create_dir_all(&shared)?;

            let pool_id = self.ensure_pool(&spec.id, &spec.pool)?;

            write_record(
                &path,
                &JobRecord {
                    spec: spec.clone(),
                    info: JobInfo {
                        id: spec.id,
                        display_name: spec.display_name.clone(),
                        state: JobState::Active,
                        pool_id: Some(pool_id),
                        start: Some(Utc::now()),
                        end: None,
                    },
                },
            )?;
        }

        for resource in &spec.preparation.resource_files {
            self.fetch_resource(&shared, resource)?;
        }

        let preparation = self.run_blocking(
            &spec.id,
            "preparation",
            &spec.preparation.command,
            &BTreeMap::new(),
            true,
        )?;

        if spec.preparation.wait_for_success && !matches!(preparation, Exit::Code(0)) {
            self.set_job_state(&spec.id, JobState::Disabled)?;

            return Err(RemoteError::Rejected(format!(
                "preparation step of job {} failed",
                spec.id
            )));
        }

        self.start_manager(spec)?;
        info!(job = %spec.id, "Created job");

        Ok(())
    }

    fn job(&self, job: &JobId) -> Result<Option<JobInfo>, RemoteError> {
        Ok(self.read_job(job)?.map(|record| record.info))
    }

    fn list_jobs(&self) -> Result<Vec<JobInfo>, RemoteError> {
        let mut jobs = Vec::new();

        for entry in fs::read_dir(self.inner.root.join("jobs"))? {
            let path = entry?.path().join(JOB_RECORD);

            if let Some(record) = read_record::<JobRecord>(&path)? {
                jobs.push(record.info);
            }
        }

        jobs.sort_by_key(|job| job.start);

        Ok(jobs)
    }

    fn terminate_job(&self, job: &JobId) -> Result<(), RemoteError> {
        if self.read_job(job)?.is_none() {
            return Err(RemoteError::not_found("job", job));
        }

        info!(job = %job, "Terminating job");

        self.finish_job(job)
    }

    fn delete_job(&self, job: &JobId) -> Result<(), RemoteError> {
        let record = self
            .read_job(job)?
            .ok_or_else(|| RemoteError::not_found("job", job))?;

        // stop running commands before their working directory disappears
        self.finish_job(job)?;

        let _guard = self.inner.records.lock();
        fs::remove_dir_all(self.job_dir(job))?;

        if let (PoolSpec::Auto(_), Some(pool)) = (&record.spec.pool, &record.info.pool_id) {
            match fs::remove_file(self.pool_path(pool)?) {
                Ok(()) => debug!(pool = %pool, "Deleted job scoped pool"),
                Err(error) if error.kind() == io::ErrorKind::NotFound => {}
                Err(error) => return Err(error.into()),
            }
        }

        info!(job = %job, "Deleted job");

        Ok(())
    }

    fn list_tasks(&self, job: &JobId) -> Result<Vec<TaskInfo>, RemoteError> {
        if self.read_job(job)?.is_none() {
            return Err(RemoteError::not_found("job", job));
        }

        let mut tasks = read_records::<TaskRecord>(&self.job_dir(job).join("tasks"))?
            .into_iter()
            .map(|(_, record)| record.info)
            .collect::<Vec<_>>();

        // numeric ids in submission order, the manager last
        tasks.sort_by_key(|task| (task.id.parse::<u64>().unwrap_or(u64::MAX), task.id.clone()));

        Ok(tasks)
    }

    fn add_tasks(&self, job: &JobId, tasks: Vec<TaskSpec>) -> Result<(), RemoteError> {
        let mut fresh = Vec::with_capacity(tasks.len());

        {
            let _guard = self.inner.records.lock();
            let record = read_record::<JobRecord>(&self.job_path(job))?
                .ok_or_else(|| RemoteError::not_found("job", job))?;

            if record.info.state != JobState::Active {
                return Err(RemoteError::Rejected(format!(
                    "job {job} is {} and accepts no tasks",
                    record.info.state
                )));
            }

            for task in tasks {
                validate_name("task", &task.id)?;
                let path = self.task_path(job, &task.id);

                if path.exists() {
                    trace!(job = %job, task = %task.id, "Task already exists, skipping");
                    continue;
                }

                write_record(
                    &path,
                    &TaskRecord {
                        spec: task.clone(),
                        info: TaskInfo {
                            id: task.id.clone(),
                            display_name: task.display_name.clone(),
                            state: TaskState::Active,
                            start: None,
                            end: None,
                            exit_code: None,
                        },
                    },
                )?;
                fresh.push(task);
            }
        }

        self.inner
            .total
            .fetch_add(fresh.len() as u64, Ordering::SeqCst);
        debug!(job = %job, count = fresh.len(), "Queued tasks");

        for task in fresh {
            let executor = self.clone();
            let job = *job;
            self.inner
                .workers
                .spawn(move || executor.run_task(job, task));
        }

        Ok(())
    }

    fn pool(&self, pool: &str) -> Result<Option<PoolInfo>, RemoteError> {
        read_record(&self.pool_path(pool)?)
    }

    fn list_pools(&self) -> Result<Vec<PoolInfo>, RemoteError> {
        Ok(read_records::<PoolInfo>(&self.inner.root.join("pools"))?
            .into_iter()
            .map(|(_, pool)| pool)
            .collect())
    }

    fn list_nodes(&self, pool: &str) -> Result<Vec<NodeInfo>, RemoteError> {
        let info = self
            .pool(pool)?
            .ok_or_else(|| RemoteError::not_found("pool", pool))?;

        let mut running = 0u32;
        for job in self.list_jobs()? {
            if job.pool_id.as_deref() != Some(pool) || job.state.is_finished() {
                continue;
            }

            running += self
                .list_tasks(&job.id)?
                .iter()
                .filter(|task| task.id != MANAGER_TASK_ID && task.state == TaskState::Running)
                .count() as u32;
        }

        let capacity = info.max_tasks_per_node.max(1);
        let busy = ((running + capacity - 1) / capacity).min(info.current_dedicated);

        Ok((0..info.current_dedicated)
            .map(|index| NodeInfo {
                id: format!("{pool}-node-{index}"),
                state: if index < busy {
                    NodeState::Running
                } else {
                    NodeState::Idle
                },
            })
            .collect())
    }

    fn resize_pool(&self, pool: &str, target_dedicated: u32) -> Result<(), RemoteError> {
        let _guard = self.inner.records.lock();
        let path = self.pool_path(pool)?;
        let mut info = read_record::<PoolInfo>(&path)?
            .ok_or_else(|| RemoteError::not_found("pool", pool))?;

        info!(
            pool = pool,
            from = info.current_dedicated,
            to = target_dedicated,
            "Resizing pool"
        );

        info.current_dedicated = target_dedicated;
        info.allocation_state = AllocationState::Steady;
        write_record(&path, &info)
    }
}

fn validate_name(kind: &str, name: &str) -> Result<(), RemoteError> {
    if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
        return Err(RemoteError::Rejected(format!("invalid {kind} id {name:?}")));
    }

    Ok(())
}

fn validate_relative(name: &str) -> Result<(), RemoteError> {
    if name.is_empty()
        || !Path::new(name)
            .components()
            .all(|component| matches!(component, Component::Normal(_)))
    {
        return Err(RemoteError::Rejected(format!("invalid file name {name:?}")));
    }

    Ok(())
}

fn read_record<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, RemoteError> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(serde_yaml::from_str(&content)?)),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(error) => Err(error.into()),
    }
}

fn read_records<T: DeserializeOwned>(dir: &Path) -> Result<Vec<(PathBuf, T)>, RemoteError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(error) => return Err(error.into()),
    };

    let mut records = Vec::new();

    for entry in entries {
        let path = entry?.path();

        if path.extension().map_or(true, |extension| extension != RECORD_EXTENSION) {
            continue;
        }

        if let Some(record) = read_record(&path)? {
            records.push((path, record));
        }
    }

    Ok(records)
}

// written next to the record and renamed, readers never observe a partial record
fn write_record<T: Serialize>(path: &Path, record: &T) -> Result<(), RemoteError> {
    let staging = path.with_extension(format!("tmp-{}", Uuid::new_v4()));

    fs::write(&staging, serde_yaml::to_string(record)?)?;

    if let Err(error) = fs::rename(&staging, path) {
        let _ = fs::remove_file(&staging);

        return Err(error.into());
    }

    Ok(())
}
