use super::Executor;
use crate::{
    error::RemoteError,
    job::{
        AllocationState, JobId, JobInfo, JobSpec, JobState, NodeInfo, NodeState, PoolInfo,
        PoolSpec, PoolState, TaskInfo, TaskSpec, TaskState, MANAGER_TASK_ID,
    },
};
use chrono::Utc;
use parking_lot::Mutex;
use std::{collections::BTreeMap, sync::Arc};

/// In process compute service whose state is set by hand.
///
/// Records every task batch and resize so tests can assert on what the orchestration core asked
/// for, and fails reads or writes on request to exercise the error ceilings.
#[derive(Clone, Debug, Default)]
pub struct MemoryExecutor {
    state: Arc<Mutex<State>>,
}

#[derive(Debug, Default)]
struct State {
    jobs: BTreeMap<JobId, MemoryJob>,
    pools: BTreeMap<String, PoolInfo>,
    nodes: BTreeMap<String, Vec<NodeInfo>>,
    created: Vec<JobSpec>,
    batches: Vec<TaskBatch>,
    resizes: Vec<(String, u32)>,
    failing_reads: u32,
    failing_writes: u32,
    // created right after the next task listing of the job, simulating a concurrent submitter
    sneak_in: Vec<(JobId, TaskSpec)>,
}

#[derive(Debug)]
struct MemoryJob {
    info: JobInfo,
    tasks: Vec<(TaskSpec, TaskInfo)>,
}

/// One `add_tasks` call as received
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskBatch {
    pub job: JobId,
    pub ids: Vec<String>,
}

impl MemoryExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pool with `dedicated` idle nodes
    pub fn add_pool(&self, id: &str, dedicated: u32, max_tasks_per_node: u32) {
        let mut state = self.state.lock();

        state.pools.insert(
            id.to_owned(),
            PoolInfo {
                id: id.to_owned(),
                vm_size: "memory".to_owned(),
                state: PoolState::Active,
                allocation_state: AllocationState::Steady,
                current_dedicated: dedicated,
                max_tasks_per_node,
            },
        );
        state.nodes.insert(id.to_owned(), idle_nodes(id, dedicated));
    }

    pub fn set_nodes(&self, pool: &str, nodes: Vec<NodeInfo>) {
        self.state.lock().nodes.insert(pool.to_owned(), nodes);
    }

    pub fn set_allocation_state(&self, pool: &str, allocation_state: AllocationState) {
        if let Some(pool) = self.state.lock().pools.get_mut(pool) {
            pool.allocation_state = allocation_state;
        }
    }

    pub fn set_job_state(&self, job: &JobId, job_state: JobState) {
        if let Some(job) = self.state.lock().jobs.get_mut(job) {
            job.info.state = job_state;
            if job_state.is_finished() {
                job.info.end = Some(Utc::now());
            }
        }
    }

    pub fn set_task_state(&self, job: &JobId, task: &str, task_state: TaskState) {
        let mut state = self.state.lock();

        let Some(job) = state.jobs.get_mut(job) else {
            return;
        };

        for (_, info) in job.tasks.iter_mut().filter(|(_, info)| info.id == task) {
            set_task_state(info, task_state);
        }
    }

    /// Move every task except the job manager into `Completed`
    pub fn complete_tasks(&self, job: &JobId) {
        let mut state = self.state.lock();

        if let Some(job) = state.jobs.get_mut(job) {
            for (_, info) in job.tasks.iter_mut().filter(|(_, info)| info.id != MANAGER_TASK_ID) {
                set_task_state(info, TaskState::Completed);
            }
        }
    }

    /// Make the next `count` read requests fail with a transient error
    pub fn fail_reads(&self, count: u32) {
        self.state.lock().failing_reads = count;
    }

    /// Make the next `count` task submissions, terminations, deletions or resizes fail
    pub fn fail_writes(&self, count: u32) {
        self.state.lock().failing_writes = count;
    }

    /// Create `task` right after the next task listing of `job`
    pub fn sneak_in_task(&self, job: &JobId, task: TaskSpec) {
        self.state.lock().sneak_in.push((*job, task));
    }

    pub fn created_jobs(&self) -> Vec<JobSpec> {
        self.state.lock().created.clone()
    }

    pub fn task_batches(&self) -> Vec<TaskBatch> {
        self.state.lock().batches.clone()
    }

    /// every submitted id in submission order, duplicates included
    pub fn submitted_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .batches
            .iter()
            .flat_map(|batch| batch.ids.iter().cloned())
            .collect()
    }

    pub fn resizes(&self) -> Vec<(String, u32)> {
        self.state.lock().resizes.clone()
    }

    fn check_read(&self, state: &mut State) -> Result<(), RemoteError> {
        if state.failing_reads > 0 {
            state.failing_reads -= 1;

            return Err(RemoteError::Rejected("service temporarily unavailable".into()));
        }

        Ok(())
    }

    fn check_write(&self, state: &mut State) -> Result<(), RemoteError> {
        if state.failing_writes > 0 {
            state.failing_writes -= 1;

            return Err(RemoteError::Rejected("service temporarily unavailable".into()));
        }

        Ok(())
    }
}

fn idle_nodes(pool: &str, count: u32) -> Vec<NodeInfo> {
    (0..count)
        .map(|index| NodeInfo {
            id: format!("{pool}-node-{index}"),
            state: NodeState::Idle,
        })
        .collect()
}

fn set_task_state(info: &mut TaskInfo, task_state: TaskState) {
    let now = Utc::now();

    info.state = task_state;
    match task_state {
        TaskState::Running => info.start = Some(now),
        TaskState::Completed => {
            info.start.get_or_insert(now);
            info.end = Some(now);
            info.exit_code.get_or_insert(0);
        }
        TaskState::Active | TaskState::Preparing => {}
    }
}

fn new_task(spec: &TaskSpec, state: TaskState) -> TaskInfo {
    TaskInfo {
        id: spec.id.clone(),
        display_name: spec.display_name.clone(),
        state,
        start: None,
        end: None,
        exit_code: None,
    }
}

impl Executor for MemoryExecutor {
    fn create_job(&self, spec: &JobSpec) -> Result<(), RemoteError> {
        let mut state = self.state.lock();

        if state.jobs.contains_key(&spec.id) {
            return Err(RemoteError::already_exists("job", spec.id));
        }

        let pool_id = match &spec.pool {
            PoolSpec::Named(name) => name.clone(),
            PoolSpec::Auto(auto) => {
                let id = format!("job-{}-pool", spec.id);
                state.pools.insert(
                    id.clone(),
                    PoolInfo {
                        id: id.clone(),
                        vm_size: auto.vm_size.clone(),
                        state: PoolState::Active,
                        allocation_state: AllocationState::Steady,
                        current_dedicated: auto.target_dedicated,
                        max_tasks_per_node: auto.max_tasks_per_node,
                    },
                );
                state
                    .nodes
                    .insert(id.clone(), idle_nodes(&id, auto.target_dedicated));
                id
            }
        };

        let mut manager = new_task(&spec.manager, TaskState::Running);
        manager.id = MANAGER_TASK_ID.to_owned();
        manager.start = Some(Utc::now());

        state.jobs.insert(
            spec.id,
            MemoryJob {
                info: JobInfo {
                    id: spec.id,
                    display_name: spec.display_name.clone(),
                    state: JobState::Active,
                    pool_id: Some(pool_id),
                    start: Some(Utc::now()),
                    end: None,
                },
                tasks: vec![(spec.manager.clone(), manager)],
            },
        );
        state.created.push(spec.clone());

        Ok(())
    }

    fn job(&self, job: &JobId) -> Result<Option<JobInfo>, RemoteError> {
        let mut state = self.state.lock();
        self.check_read(&mut state)?;

        Ok(state.jobs.get(job).map(|job| job.info.clone()))
    }

    fn list_jobs(&self) -> Result<Vec<JobInfo>, RemoteError> {
        let mut state = self.state.lock();
        self.check_read(&mut state)?;

        Ok(state.jobs.values().map(|job| job.info.clone()).collect())
    }

    fn terminate_job(&self, job: &JobId) -> Result<(), RemoteError> {
        let mut state = self.state.lock();
        self.check_write(&mut state)?;
        let job = state
            .jobs
            .get_mut(job)
            .ok_or_else(|| RemoteError::not_found("job", job))?;

        for (_, info) in job.tasks.iter_mut().filter(|(_, info)| !info.state.is_terminal()) {
            set_task_state(info, TaskState::Completed);
        }
        job.info.state = JobState::Completed;
        job.info.end = Some(Utc::now());

        Ok(())
    }

    fn delete_job(&self, job: &JobId) -> Result<(), RemoteError> {
        let mut state = self.state.lock();
        self.check_write(&mut state)?;

        state
            .jobs
            .remove(job)
            .map(|_| ())
            .ok_or_else(|| RemoteError::not_found("job", job))
    }

    fn list_tasks(&self, job: &JobId) -> Result<Vec<TaskInfo>, RemoteError> {
        let mut state = self.state.lock();
        self.check_read(&mut state)?;

        let tasks: Vec<TaskInfo> = state
            .jobs
            .get(job)
            .ok_or_else(|| RemoteError::not_found("job", job))?
            .tasks
            .iter()
            .map(|(_, info)| info.clone())
            .collect();

        let (sneaking, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut state.sneak_in)
            .into_iter()
            .partition(|(target, _)| target == job);
        state.sneak_in = waiting;

        if let Some(entry) = state.jobs.get_mut(job) {
            for (_, spec) in sneaking {
                let info = new_task(&spec, TaskState::Active);
                entry.tasks.push((spec, info));
            }
        }

        Ok(tasks)
    }

    fn add_tasks(&self, job: &JobId, tasks: Vec<TaskSpec>) -> Result<(), RemoteError> {
        let mut state = self.state.lock();
        self.check_write(&mut state)?;

        state.batches.push(TaskBatch {
            job: *job,
            ids: tasks.iter().map(|task| task.id.clone()).collect(),
        });

        let entry = state
            .jobs
            .get_mut(job)
            .ok_or_else(|| RemoteError::not_found("job", job))?;

        for task in tasks {
            // same id is a no-op, like the real service
            if entry.tasks.iter().any(|(_, info)| info.id == task.id) {
                continue;
            }

            let info = new_task(&task, TaskState::Active);
            entry.tasks.push((task, info));
        }

        Ok(())
    }

    fn pool(&self, pool: &str) -> Result<Option<PoolInfo>, RemoteError> {
        let mut state = self.state.lock();
        self.check_read(&mut state)?;

        Ok(state.pools.get(pool).cloned())
    }

    fn list_pools(&self) -> Result<Vec<PoolInfo>, RemoteError> {
        let mut state = self.state.lock();
        self.check_read(&mut state)?;

        Ok(state.pools.values().cloned().collect())
    }

    fn list_nodes(&self, pool: &str) -> Result<Vec<NodeInfo>, RemoteError> {
        let mut state = self.state.lock();
        self.check_read(&mut state)?;

        state
            .nodes
            .get(pool)
            .cloned()
            .ok_or_else(|| RemoteError::not_found("pool", pool))
    }

    fn resize_pool(&self, pool: &str, target_dedicated: u32) -> Result<(), RemoteError> {
        let mut state = self.state.lock();
        self.check_write(&mut state)?;

        let info = state
            .pools
            .get_mut(pool)
            .ok_or_else(|| RemoteError::not_found("pool", pool))?;
        info.current_dedicated = target_dedicated;
        info.allocation_state = AllocationState::Steady;

        state.resizes.push((pool.to_owned(), target_dedicated));

        if let Some(nodes) = state.nodes.get_mut(pool) {
            // idle nodes leave first
            nodes.sort_by_key(|node| node.state == NodeState::Idle);
            nodes.truncate(target_dedicated as usize);
        }

        Ok(())
    }
}
