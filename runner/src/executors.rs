pub mod local;
pub mod memory;


use crate::{
    config::{ConfigErrors, ExecutorConfig},
    error::RemoteError,
    job::{JobId, JobInfo, JobSpec, NodeInfo, PoolInfo, TaskInfo, TaskSpec},
};
use std::sync::Arc;

/// Compute service contract consumed by the orchestration core.
///
/// Every call is a single remote request, none of them retry. The polling loops decide what is
/// transient.
pub trait Executor: Send + Sync {
    /// Commit a job, fails with `AlreadyExists` if the id is taken
    fn create_job(&self, spec: &JobSpec) -> Result<(), RemoteError>;
    /// `None` once the job was deleted
    fn job(&self, job: &JobId) -> Result<Option<JobInfo>, RemoteError>;
    fn list_jobs(&self) -> Result<Vec<JobInfo>, RemoteError>;
    fn terminate_job(&self, job: &JobId) -> Result<(), RemoteError>;
    fn delete_job(&self, job: &JobId) -> Result<(), RemoteError>;

    fn list_tasks(&self, job: &JobId) -> Result<Vec<TaskInfo>, RemoteError>;
    /// Add a batch of tasks. Ids already present are left untouched.
    fn add_tasks(&self, job: &JobId, tasks: Vec<TaskSpec>) -> Result<(), RemoteError>;

    fn pool(&self, pool: &str) -> Result<Option<PoolInfo>, RemoteError>;
    fn list_pools(&self) -> Result<Vec<PoolInfo>, RemoteError>;
    fn list_nodes(&self, pool: &str) -> Result<Vec<NodeInfo>, RemoteError>;
    fn resize_pool(&self, pool: &str, target_dedicated: u32) -> Result<(), RemoteError>;
}

/// load the configured compute service
pub fn load(config: &ExecutorConfig) -> Result<Arc<dyn Executor>, ConfigErrors> {
    match config.name.as_str() {
        "local" => Ok(Arc::new(local::LocalExecutor::load(config)?)),
        _ => Err(ConfigErrors::UnsupportedExecutor(config.name.clone())),
    }
}
