use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr};
use uuid::Uuid;

/// Id of the task that drives a job from inside the pool, it is excluded from every
/// completion and idleness check.
pub const MANAGER_TASK_ID: &str = "job-manager";

/// Name of the staged model archive on the compute nodes
pub const MODEL_ARCHIVE_NAME: &str = "model.zip";

/// Globally unique job identifier, generated once at submission and never reused
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// container holding every output object of the job
    pub fn output_container(&self) -> String {
        format!("job-{}-outputs", self.0)
    }

    /// container holding the staged inputs of the job
    pub fn input_container(&self) -> String {
        format!("job-{}", self.0)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Active,
    Disabled,
    Terminating,
    Completed,
}

impl JobState {
    /// a job in one of these states will not produce further outputs
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Disabled)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Active,
    Preparing,
    Running,
    Completed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocationState {
    Steady,
    Resizing,
    Stopping,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolState {
    Active,
    Deleting,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    Idle,
    Running,
    Starting,
    Offline,
}

macro_rules! display_as_debug {
    ($($ty:ty),+) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Debug::fmt(self, f)
            }
        })+
    };
}

display_as_debug!(JobState, TaskState, AllocationState, PoolState, NodeState);

/// Unit of work discovered from the input: one model file and the simulations it contains
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SimulationUnit {
    pub model: String,
    pub simulations: Vec<String>,
}

/// Remote side specification of a task
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: String,
    pub display_name: String,
    pub command: String,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

/// Reference to a staged blob that is fetched onto the node before the preparation step runs
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceFile {
    pub url: String,
    pub file_name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreparationStep {
    pub command: String,
    pub resource_files: Vec<ResourceFile>,
    pub wait_for_success: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseStep {
    pub command: String,
}

/// Pool created for the lifetime of a single job
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoPoolSpec {
    pub vm_size: String,
    pub target_dedicated: u32,
    pub max_tasks_per_node: u32,
    pub resize_timeout_secs: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolSpec {
    /// run on an existing pool
    Named(String),
    /// create a pool that lives as long as the job
    Auto(AutoPoolSpec),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub id: JobId,
    pub display_name: String,
    pub pool: PoolSpec,
    pub preparation: PreparationStep,
    pub manager: TaskSpec,
    pub release: Option<ReleaseStep>,
}

/// Parameters of a single submission as collected from the command line and configuration
#[derive(Clone, Debug)]
pub struct JobParameters {
    pub display_name: String,
    pub model_path: std::path::PathBuf,
    pub application_version: String,
    pub cores_per_process: u32,
    pub manager_submits_tasks: bool,
    pub auto_scale: bool,
    pub no_wait: bool,
}

/// Job as reported by the compute service
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: JobId,
    pub display_name: String,
    pub state: JobState,
    pub pool_id: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

/// Task as reported by the compute service
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: String,
    pub display_name: String,
    pub state: TaskState,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolInfo {
    pub id: String,
    pub vm_size: String,
    pub state: PoolState,
    pub allocation_state: AllocationState,
    pub current_dedicated: u32,
    pub max_tasks_per_node: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: String,
    pub state: NodeState,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolDetails {
    pub vm_count: u32,
    pub vm_size: String,
    pub allocation_state: AllocationState,
    pub max_tasks_per_vm: u32,
}

impl From<&PoolInfo> for PoolDetails {
    fn from(pool: &PoolInfo) -> Self {
        Self {
            vm_count: pool.current_dedicated,
            vm_size: pool.vm_size.clone(),
            allocation_state: pool.allocation_state,
            max_tasks_per_vm: pool.max_tasks_per_node,
        }
    }
}

/// Operator facing projection of a job
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobDetails {
    pub id: JobId,
    pub display_name: String,
    pub state: JobState,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub pool: Option<PoolDetails>,
}

impl JobDetails {
    pub fn duration(&self) -> Option<Duration> {
        elapsed(self.start, self.end)
    }
}

/// Operator facing projection of a task
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskDetails {
    pub id: String,
    pub display_name: String,
    pub state: TaskState,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl TaskDetails {
    pub fn duration(&self) -> Option<Duration> {
        elapsed(self.start, self.end)
    }
}

impl From<TaskInfo> for TaskDetails {
    fn from(task: TaskInfo) -> Self {
        Self {
            id: task.id,
            display_name: task.display_name,
            state: task.state,
            start: task.start,
            end: task.end,
        }
    }
}

// running jobs and tasks are measured against now
fn elapsed(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Option<Duration> {
    start.map(|start| end.unwrap_or_else(Utc::now) - start)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn job_id_parses_and_names_containers() {
        let id: JobId = "9ffdb1e6-070b-46cd-a84f-2c65b1a89e3c".parse().unwrap();

        assert_eq!(
            id.output_container(),
            "job-9ffdb1e6-070b-46cd-a84f-2c65b1a89e3c-outputs"
        );
        assert_eq!(id.input_container(), "job-9ffdb1e6-070b-46cd-a84f-2c65b1a89e3c");
        assert!("not-a-job".parse::<JobId>().is_err());
    }

    #[test]
    pub fn finished_task_duration_uses_end() {
        let start = Utc::now() - Duration::minutes(90);
        let details = TaskDetails {
            id: "0".into(),
            display_name: "sim (model)".into(),
            state: TaskState::Completed,
            start: Some(start),
            end: Some(start + Duration::minutes(30)),
        };

        assert_eq!(details.duration(), Some(Duration::minutes(30)));
    }

    #[test]
    pub fn unstarted_job_has_no_duration() {
        let details = JobDetails {
            id: JobId::generate(),
            display_name: "job".into(),
            state: JobState::Active,
            start: None,
            end: None,
            pool: None,
        };

        assert!(details.duration().is_none());
    }
}
