#[cfg(test)]
mod monitor_test;

use crate::{
    error::RemoteError,
    executors::Executor,
    job::{AllocationState, JobId, NodeState, PoolInfo, PoolState, TaskInfo, MANAGER_TASK_ID},
    sync::ShutdownToken,
};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Too many errors waiting for tasks to complete ({errors} in a row)")]
    TooManyErrors {
        errors: u32,
        #[source]
        last: RemoteError,
    },
}

/// Lifecycle of a monitored job as seen from the orchestrating process
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MonitorState {
    Submitting,
    AwaitingCompletion,
    ScalingDown,
    Completed,
    CancelledExternally,
    FailedPermanently,
}

impl MonitorState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::CancelledExternally | Self::FailedPermanently
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MonitorEvent {
    TasksSubmitted,
    Polled { complete: bool, scaled: bool },
    PollFailed { fatal: bool },
    Cancelled,
}

/// State transition of the monitor, terminal states absorb every event
pub fn transition(state: MonitorState, event: MonitorEvent) -> MonitorState {
    use MonitorState::*;

    if state.is_terminal() {
        return state;
    }

    match (state, event) {
        (_, MonitorEvent::Cancelled) => CancelledExternally,
        (_, MonitorEvent::PollFailed { fatal: true }) => FailedPermanently,
        (_, MonitorEvent::PollFailed { fatal: false }) => state,
        (Submitting, MonitorEvent::TasksSubmitted) => AwaitingCompletion,
        (_, MonitorEvent::TasksSubmitted) => state,
        (_, MonitorEvent::Polled { complete: true, .. }) => Completed,
        (_, MonitorEvent::Polled { scaled: true, .. }) => ScalingDown,
        (_, MonitorEvent::Polled { .. }) => AwaitingCompletion,
    }
}

/// Consecutive failed polls, a successful poll starts over
#[derive(Clone, Copy, Debug)]
pub struct ErrorTally {
    errors: u32,
    ceiling: u32,
}

impl ErrorTally {
    pub fn new(ceiling: u32) -> Self {
        Self { errors: 0, ceiling }
    }

    pub fn success(&mut self) {
        self.errors = 0;
    }

    /// Count a failure, returns `true` once the ceiling is crossed
    pub fn failure(&mut self) -> bool {
        self.errors += 1;
        self.errors > self.ceiling
    }

    pub fn errors(&self) -> u32 {
        self.errors
    }
}

/// The job is done once every task except the job manager reached a terminal state
pub fn is_job_complete(tasks: &[TaskInfo]) -> bool {
    tasks
        .iter()
        .filter(|task| task.id != MANAGER_TASK_ID)
        .all(|task| task.state.is_terminal())
}

/// `true` while any task other than the job manager is queued, preparing or running
pub fn has_pending_work(tasks: &[TaskInfo]) -> bool {
    tasks
        .iter()
        .any(|task| task.id != MANAGER_TASK_ID && !task.state.is_terminal())
}

/// Pool size to shrink to, `None` if the pool must be left alone this cycle.
///
/// Only a steady, active pool without queued or running work is touched and the result is
/// strictly smaller than the current size. Growing the pool is left to the compute service.
pub fn scale_down_target(pool: &PoolInfo, tasks: &[TaskInfo], idle_nodes: u32) -> Option<u32> {
    if pool.state != PoolState::Active || pool.allocation_state != AllocationState::Steady {
        return None;
    }

    if has_pending_work(tasks) || idle_nodes == 0 {
        return None;
    }

    Some(pool.current_dedicated.saturating_sub(idle_nodes))
}

/// Polls a job until its tasks are done, shrinking the pool on idle cycles if enabled
pub struct CompletionMonitor<'a> {
    executor: &'a dyn Executor,
    job: JobId,
    auto_scale: bool,
    interval: Duration,
    state: MonitorState,
    tally: ErrorTally,
    pool_id: Option<String>,
}

impl<'a> CompletionMonitor<'a> {
    pub fn new(
        executor: &'a dyn Executor,
        job: JobId,
        auto_scale: bool,
        interval: Duration,
        error_ceiling: u32,
    ) -> Self {
        Self {
            executor,
            job,
            auto_scale,
            interval,
            state: MonitorState::Submitting,
            tally: ErrorTally::new(error_ceiling),
            pool_id: None,
        }
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    fn apply(&mut self, event: MonitorEvent) -> MonitorState {
        let next = transition(self.state, event);

        if next != self.state {
            debug!(job = %self.job, from = ?self.state, to = ?next, "Monitor transition");
        }

        self.state = next;
        next
    }

    /// Mark the end of task submission
    pub fn tasks_submitted(&mut self) {
        self.apply(MonitorEvent::TasksSubmitted);
    }

    /// Run a single poll cycle
    pub fn step(&mut self) -> Result<MonitorState, MonitorError> {
        match self.poll() {
            Ok((complete, scaled)) => {
                self.tally.success();

                Ok(self.apply(MonitorEvent::Polled { complete, scaled }))
            }
            Err(last) => {
                let fatal = self.tally.failure();
                self.apply(MonitorEvent::PollFailed { fatal });

                if fatal {
                    error!(job = %self.job, errors = self.tally.errors(), "Too many errors, giving up");

                    return Err(MonitorError::TooManyErrors {
                        errors: self.tally.errors(),
                        last,
                    });
                }

                warn!(
                    error = ?last,
                    job = %self.job,
                    errors = self.tally.errors(),
                    "Error waiting for tasks to complete"
                );

                Ok(self.state)
            }
        }
    }

    /// Poll until the job completes or `token` is cancelled.
    ///
    /// Cancellation is not an error, it ends the loop with `CancelledExternally`.
    #[instrument(skip_all, fields(job = %self.job, auto_scale = self.auto_scale))]
    pub fn run(&mut self, token: &ShutdownToken) -> Result<MonitorState, MonitorError> {
        self.tasks_submitted();

        loop {
            if token.is_cancelled() {
                break;
            }

            if self.step()? == MonitorState::Completed {
                info!("All tasks completed");

                return Ok(MonitorState::Completed);
            }

            if token.wait(self.interval) {
                break;
            }
        }

        info!("Monitor cancelled");

        Ok(self.apply(MonitorEvent::Cancelled))
    }

    fn poll(&mut self) -> Result<(bool, bool), RemoteError> {
        let tasks = self.executor.list_tasks(&self.job)?;
        let complete = is_job_complete(&tasks);

        if !self.auto_scale {
            return Ok((complete, false));
        }

        match self.scale_pool_if_needed(&tasks) {
            Ok(scaled) => Ok((complete, scaled)),
            // nothing left to run, a failed resize only leaves idle nodes behind
            Err(error) if complete => {
                warn!(error = ?error, job = %self.job, "Failed to scale pool down");
                Ok((true, false))
            }
            Err(error) => Err(error),
        }
    }

    fn scale_pool_if_needed(&mut self, tasks: &[TaskInfo]) -> Result<bool, RemoteError> {
        if has_pending_work(tasks) {
            debug!(job = %self.job, "There are still pending tasks, will not scale");
            return Ok(false);
        }

        let pool_id = match &self.pool_id {
            Some(pool_id) => pool_id.clone(),
            None => {
                let job = self
                    .executor
                    .job(&self.job)?
                    .ok_or_else(|| RemoteError::not_found("job", self.job))?;
                let pool_id = job.pool_id.ok_or_else(|| {
                    RemoteError::Rejected(format!("job {} is not bound to a pool", self.job))
                })?;
                self.pool_id = Some(pool_id.clone());
                pool_id
            }
        };

        let pool = match self.executor.pool(&pool_id)? {
            Some(pool) => pool,
            None => {
                info!(pool = %pool_id, "Pool is gone, skipping auto scale");
                return Ok(false);
            }
        };

        let idle = self
            .executor
            .list_nodes(&pool_id)?
            .iter()
            .filter(|node| node.state == NodeState::Idle)
            .count();
        let idle = u32::try_from(idle).unwrap_or(u32::MAX);

        match scale_down_target(&pool, tasks, idle) {
            Some(target) => {
                info!(
                    pool = %pool_id,
                    idle = idle,
                    from = pool.current_dedicated,
                    to = target,
                    "Scaling pool down"
                );
                self.executor.resize_pool(&pool_id, target)?;

                Ok(true)
            }
            None => {
                debug!(pool = %pool_id, idle = idle, "Not scaling pool this cycle");

                Ok(false)
            }
        }
    }
}
