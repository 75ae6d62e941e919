use serde::{Deserialize, Serialize};
use std::{env, fs, io, path::PathBuf, time::Duration};
use thiserror::Error;
use tracing::{error, warn};

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to read config file {path:?}")]
    Read { path: PathBuf, source: io::Error },
    #[error("Config file is not valid YAML for this runner")]
    Parse(#[from] serde_yaml::Error),
    #[error("Executor not supported: {0}")]
    UnsupportedExecutor(String),
    #[error("Storage not supported: {0}")]
    UnsupportedStorage(String),
    #[error("Failed to prepare executor root {path:?}")]
    ExecutorRoot { path: PathBuf, source: io::Error },
    #[error("Failed to build worker pool")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("Preflight checks failed, see the log for details")]
    Preflight,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct RunnerConfig {
    // object store holding staged inputs and job outputs
    pub storage: StorageConfig,
    // compute service the jobs are submitted to
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub job: JobConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub summary: SummaryConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    // Name of the selected store, only `fs` for now
    pub name: String,
    pub root: PathBuf,
    pub account: String,
    pub key: String,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ExecutorConfig {
    // Name of the selected executor, see `executors::load` for the selection process
    pub name: String,
    pub root: PathBuf,
    // worker threads of the local executor, defaults to the number of cpus
    pub threads: Option<usize>,
    #[serde(default = "default_task_timeout")]
    pub task_timeout_ms: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct PoolConfig {
    // existing pool to run on, a job scoped pool is created when absent
    pub name: Option<String>,
    #[serde(default = "default_vm_size")]
    pub vm_size: String,
    #[serde(default = "default_one")]
    pub vm_count: u32,
    #[serde(default = "default_one")]
    pub max_tasks_per_vm: u32,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct JobConfig {
    #[serde(default = "default_one")]
    pub cores_per_process: u32,
    #[serde(default)]
    pub manager_submits_tasks: bool,
    #[serde(default)]
    pub auto_scale: bool,
    #[serde(default)]
    pub application_version: String,
    // `{model}` and `{simulation}` are substituted per task
    #[serde(default = "default_task_command")]
    pub task_command: String,
    // command that starts `parasim` on the compute node, defaults to the running binary
    pub manager_command: Option<String>,
    #[serde(default = "default_preparation_command")]
    pub preparation_command: String,
    pub release_command: Option<String>,
    pub tools_dir: Option<PathBuf>,
    pub application_dir: Option<PathBuf>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct MonitorConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_harvest_interval")]
    pub harvest_interval_ms: u64,
    #[serde(default = "default_error_ceiling")]
    pub error_ceiling: u32,
    #[serde(default = "default_transfer_concurrency")]
    pub transfer_concurrency: usize,
    #[serde(default = "default_submit_concurrency")]
    pub submit_concurrency: usize,
    #[serde(default = "default_submit_batch_size")]
    pub submit_batch_size: usize,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SummaryConfig {
    #[serde(default = "default_fallback_dir")]
    pub fallback_dir: PathBuf,
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn harvest_interval(&self) -> Duration {
        Duration::from_millis(self.harvest_interval_ms)
    }
}

impl RunnerConfig {
    pub fn load(path: &PathBuf) -> Result<Self, ConfigErrors> {
        let content = fs::read_to_string(path).map_err(|source| ConfigErrors::Read {
            path: path.clone(),
            source,
        })?;

        Ok(serde_yaml::from_str(&content)?)
    }

    /// Validate the configuration, returns `true` if any error was found.
    ///
    /// All problems are reported before returning to make fixing a config a single round trip.
    pub fn preflight_checks(&mut self) -> bool {
        let mut contains_error = false;

        self.storage.name = self.storage.name.to_lowercase();
        self.executor.name = self.executor.name.to_lowercase();

        if self.storage.name != "fs" {
            error!(
                "storage.name ({}) is not supported, please use `fs` for now",
                self.storage.name
            );
            contains_error = true;
        }

        if self.executor.name != "local" {
            error!(
                "executor.name ({}) is not supported, please use `local` for now",
                self.executor.name
            );
            contains_error = true;
        }

        if self.storage.account.trim().is_empty() {
            error!("storage.account cannot be empty, it scopes every capability url");
            contains_error = true;
        }

        if self.executor.threads == Some(0) {
            error!("executor.threads cannot be 0");
            contains_error = true;
        }

        if self.pool.name.is_none() && self.pool.vm_count == 0 {
            error!("pool.vm_count cannot be 0 for a job scoped pool");
            contains_error = true;
        }

        if self.pool.max_tasks_per_vm == 0 {
            error!("pool.max_tasks_per_vm cannot be 0");
            contains_error = true;
        }

        if self.job.cores_per_process == 0 {
            warn!("job.cores_per_process is 0. Falling back to 1");
            self.job.cores_per_process = 1;
        }

        if !self.job.task_command.contains("{model}") {
            warn!("job.task_command does not reference {{model}}, every task will run the same command");
        }

        for (key, dir) in [
            ("job.tools_dir", &self.job.tools_dir),
            ("job.application_dir", &self.job.application_dir),
        ] {
            if let Some(dir) = dir {
                if !dir.is_dir() {
                    error!("{key} ({}) is not a directory", dir.to_string_lossy());
                    contains_error = true;
                }
            }
        }

        if self.monitor.transfer_concurrency == 0 || self.monitor.submit_concurrency == 0 {
            error!("monitor.transfer_concurrency and monitor.submit_concurrency must be at least 1");
            contains_error = true;
        }

        if self.monitor.submit_batch_size == 0 {
            error!("monitor.submit_batch_size must be at least 1");
            contains_error = true;
        }

        if self.monitor.error_ceiling == 0 {
            warn!("monitor.error_ceiling is 0, the first failed poll will abort the monitor");
        }

        contains_error
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: None,
            vm_size: default_vm_size(),
            vm_count: 1,
            max_tasks_per_vm: 1,
        }
    }
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            cores_per_process: 1,
            manager_submits_tasks: false,
            auto_scale: false,
            application_version: String::new(),
            task_command: default_task_command(),
            manager_command: None,
            preparation_command: default_preparation_command(),
            release_command: None,
            tools_dir: None,
            application_dir: None,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            harvest_interval_ms: default_harvest_interval(),
            error_ceiling: default_error_ceiling(),
            transfer_concurrency: default_transfer_concurrency(),
            submit_concurrency: default_submit_concurrency(),
            submit_batch_size: default_submit_batch_size(),
        }
    }
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            fallback_dir: default_fallback_dir(),
        }
    }
}

/// primitve way to retrieve the tmp dir from the environment with default to /tmp
pub fn get_tmp_dir() -> PathBuf {
    env::var("TMPDIR")
        .map(PathBuf::from)
        .unwrap_or(PathBuf::from("/tmp"))
}

fn default_fallback_dir() -> PathBuf {
    get_tmp_dir().join("parasim")
}

fn default_vm_size() -> String {
    "standard_d2_v3".to_owned()
}

fn default_one() -> u32 {
    1
}

fn default_task_command() -> String {
    "./runtask.sh {model} {simulation}".to_owned()
}

fn default_preparation_command() -> String {
    "./jobprep.sh".to_owned()
}

fn default_task_timeout() -> u64 {
    // one day
    24 * 60 * 60 * 1000
}

fn default_poll_interval() -> u64 {
    30_000
}

fn default_harvest_interval() -> u64 {
    15_000
}

fn default_error_ceiling() -> u32 {
    20
}

fn default_transfer_concurrency() -> usize {
    8
}

fn default_submit_concurrency() -> usize {
    4
}

fn default_submit_batch_size() -> usize {
    100
}
