use super::{
    is_job_complete, scale_down_target, transition, CompletionMonitor, ErrorTally, MonitorError,
    MonitorEvent, MonitorState,
};
use crate::{
    executors::{memory::MemoryExecutor, Executor},
    job::{
        AllocationState, JobId, JobSpec, NodeInfo, NodeState, PoolInfo, PoolSpec, PoolState,
        PreparationStep, TaskInfo, TaskSpec, TaskState, MANAGER_TASK_ID,
    },
    sync::ShutdownToken,
};
use std::{
    collections::BTreeMap,
    thread,
    time::{Duration, Instant},
};

const POOL: &str = "sims";

fn task_info(id: &str, state: TaskState) -> TaskInfo {
    TaskInfo {
        id: id.into(),
        display_name: id.into(),
        state,
        start: None,
        end: None,
        exit_code: None,
    }
}

fn task_spec(id: &str) -> TaskSpec {
    TaskSpec {
        id: id.into(),
        display_name: id.into(),
        command: "true".into(),
        environment: BTreeMap::new(),
    }
}

fn pool(current_dedicated: u32) -> PoolInfo {
    PoolInfo {
        id: POOL.into(),
        vm_size: "standard_d2_v3".into(),
        state: PoolState::Active,
        allocation_state: AllocationState::Steady,
        current_dedicated,
        max_tasks_per_node: 1,
    }
}

/// job on a 3 node named pool with `tasks` queued
fn setup(tasks: usize) -> (MemoryExecutor, JobId) {
    let executor = MemoryExecutor::new();
    executor.add_pool(POOL, 3, 1);

    let job = JobId::generate();
    executor
        .create_job(&JobSpec {
            id: job,
            display_name: "monitored".into(),
            pool: PoolSpec::Named(POOL.into()),
            preparation: PreparationStep {
                command: "true".into(),
                resource_files: Vec::new(),
                wait_for_success: true,
            },
            manager: task_spec(MANAGER_TASK_ID),
            release: None,
        })
        .unwrap();
    executor
        .add_tasks(&job, (0..tasks).map(|id| task_spec(&id.to_string())).collect())
        .unwrap();

    (executor, job)
}

fn nodes(states: &[NodeState]) -> Vec<NodeInfo> {
    states
        .iter()
        .enumerate()
        .map(|(index, state)| NodeInfo {
            id: format!("node-{index}"),
            state: *state,
        })
        .collect()
}

#[test]
pub fn complete_ignores_the_job_manager() {
    let manager = task_info(MANAGER_TASK_ID, TaskState::Running);

    assert!(is_job_complete(&[
        manager.clone(),
        task_info("0", TaskState::Completed),
        task_info("1", TaskState::Completed),
    ]));
    assert!(!is_job_complete(&[
        manager.clone(),
        task_info("0", TaskState::Completed),
        task_info("1", TaskState::Preparing),
    ]));
    assert!(!is_job_complete(&[manager, task_info("0", TaskState::Active)]));
}

#[test]
pub fn scale_down_requires_idle_steady_pool() {
    let manager = task_info(MANAGER_TASK_ID, TaskState::Running);
    let drained = [manager.clone(), task_info("0", TaskState::Completed)];

    assert_eq!(scale_down_target(&pool(3), &drained, 2), Some(1));
    assert_eq!(scale_down_target(&pool(3), &drained, 0), None);

    for pending in [TaskState::Active, TaskState::Preparing, TaskState::Running] {
        let tasks = [
            manager.clone(),
            task_info("0", TaskState::Completed),
            task_info("1", pending),
        ];
        assert_eq!(scale_down_target(&pool(3), &tasks, 2), None, "{pending:?}");
    }

    let mut resizing = pool(3);
    resizing.allocation_state = AllocationState::Resizing;
    assert_eq!(scale_down_target(&resizing, &drained, 2), None);

    let mut deleting = pool(3);
    deleting.state = PoolState::Deleting;
    assert_eq!(scale_down_target(&deleting, &drained, 2), None);
}

#[test]
pub fn scale_down_never_grows_the_pool() {
    let drained = [task_info("0", TaskState::Completed)];

    // more idle nodes than the pool reports, e.g. a stale listing
    assert_eq!(scale_down_target(&pool(1), &drained, 4), Some(0));
}

#[test]
pub fn queued_tasks_keep_idle_nodes() {
    // freshly submitted, nothing placed on a node yet
    let (executor, job) = setup(2);

    let mut monitor = CompletionMonitor::new(&executor, job, true, Duration::ZERO, 20);
    monitor.tasks_submitted();

    for _ in 0..3 {
        assert_eq!(monitor.step().unwrap(), MonitorState::AwaitingCompletion);
    }
    assert!(executor.resizes().is_empty());
    assert_eq!(executor.pool(POOL).unwrap().unwrap().current_dedicated, 3);
}

#[test]
pub fn transitions_follow_the_lifecycle() {
    use MonitorState::*;

    let awaiting = transition(Submitting, MonitorEvent::TasksSubmitted);
    assert_eq!(awaiting, AwaitingCompletion);

    let polled = |complete, scaled| MonitorEvent::Polled { complete, scaled };
    assert_eq!(transition(awaiting, polled(false, true)), ScalingDown);
    assert_eq!(transition(ScalingDown, polled(false, false)), AwaitingCompletion);
    assert_eq!(transition(ScalingDown, polled(true, false)), Completed);
    assert_eq!(
        transition(awaiting, MonitorEvent::PollFailed { fatal: false }),
        AwaitingCompletion
    );
    assert_eq!(
        transition(awaiting, MonitorEvent::PollFailed { fatal: true }),
        FailedPermanently
    );
    assert_eq!(transition(awaiting, MonitorEvent::Cancelled), CancelledExternally);

    // terminal states stay
    assert_eq!(transition(Completed, MonitorEvent::Cancelled), Completed);
    assert_eq!(transition(CancelledExternally, polled(true, false)), CancelledExternally);
}

#[test]
pub fn tally_is_fatal_past_the_ceiling_and_resets_on_success() {
    let mut tally = ErrorTally::new(2);

    assert!(!tally.failure());
    assert!(!tally.failure());
    tally.success();
    assert!(!tally.failure());
    assert!(!tally.failure());
    assert!(tally.failure());
    assert_eq!(tally.errors(), 3);
}

#[test]
pub fn never_resizes_while_a_task_is_running() {
    let (executor, job) = setup(2);
    executor.set_task_state(&job, "0", TaskState::Running);
    executor.set_nodes(
        POOL,
        nodes(&[NodeState::Running, NodeState::Idle, NodeState::Idle]),
    );

    let mut monitor = CompletionMonitor::new(&executor, job, true, Duration::ZERO, 20);
    monitor.tasks_submitted();

    for _ in 0..3 {
        assert_eq!(monitor.step().unwrap(), MonitorState::AwaitingCompletion);
    }
    assert!(executor.resizes().is_empty());

    // the running task finishes, the queued one still needs a node
    executor.set_task_state(&job, "0", TaskState::Completed);
    assert_eq!(monitor.step().unwrap(), MonitorState::AwaitingCompletion);
    assert!(executor.resizes().is_empty());

    // drained, the idle nodes are released on the way out
    executor.set_task_state(&job, "1", TaskState::Completed);
    assert_eq!(monitor.step().unwrap(), MonitorState::Completed);
    assert_eq!(executor.resizes(), vec![(POOL.to_owned(), 1)]);
}

#[test]
pub fn failed_resize_does_not_hold_back_completion() {
    let (executor, job) = setup(1);
    executor.complete_tasks(&job);
    executor.fail_writes(1);

    let mut monitor = CompletionMonitor::new(&executor, job, true, Duration::ZERO, 0);
    monitor.tasks_submitted();

    assert_eq!(monitor.step().unwrap(), MonitorState::Completed);
    assert!(executor.resizes().is_empty());
}

#[test]
pub fn resizing_pool_is_left_alone() {
    let (executor, job) = setup(1);
    executor.set_allocation_state(POOL, AllocationState::Resizing);

    let mut monitor = CompletionMonitor::new(&executor, job, true, Duration::ZERO, 20);
    monitor.tasks_submitted();

    assert_eq!(monitor.step().unwrap(), MonitorState::AwaitingCompletion);
    assert!(executor.resizes().is_empty());
}

#[test]
pub fn auto_scale_disabled_never_resizes() {
    let (executor, job) = setup(1);

    let mut monitor = CompletionMonitor::new(&executor, job, false, Duration::ZERO, 20);
    monitor.tasks_submitted();

    assert_eq!(monitor.step().unwrap(), MonitorState::AwaitingCompletion);
    assert!(executor.resizes().is_empty());
}

#[test]
pub fn completes_exactly_when_all_tasks_are_terminal() {
    let (executor, job) = setup(2);
    let mut monitor = CompletionMonitor::new(&executor, job, false, Duration::ZERO, 20);
    monitor.tasks_submitted();

    executor.set_task_state(&job, "0", TaskState::Completed);
    assert_eq!(monitor.step().unwrap(), MonitorState::AwaitingCompletion);

    executor.set_task_state(&job, "1", TaskState::Completed);
    assert_eq!(monitor.step().unwrap(), MonitorState::Completed);
}

#[test]
pub fn transient_errors_are_swallowed_below_the_ceiling() {
    let (executor, job) = setup(1);
    executor.complete_tasks(&job);
    executor.fail_reads(2);

    let mut monitor = CompletionMonitor::new(&executor, job, false, Duration::ZERO, 2);

    assert_eq!(monitor.run(&ShutdownToken::new()).unwrap(), MonitorState::Completed);
}

#[test]
pub fn crossing_the_error_ceiling_is_fatal() {
    let (executor, job) = setup(1);
    executor.fail_reads(u32::MAX);

    let mut monitor = CompletionMonitor::new(&executor, job, false, Duration::ZERO, 2);

    let error = monitor.run(&ShutdownToken::new()).unwrap_err();
    assert!(matches!(error, MonitorError::TooManyErrors { errors: 3, .. }));
    assert_eq!(monitor.state(), MonitorState::FailedPermanently);
}

#[test]
pub fn cancelled_token_returns_without_polling() {
    let (executor, job) = setup(1);
    executor.fail_reads(1);
    let token = ShutdownToken::new();
    token.cancel();

    let mut monitor = CompletionMonitor::new(&executor, job, false, Duration::ZERO, 0);

    // a poll would hit the injected failure and cross the zero ceiling
    assert_eq!(monitor.run(&token).unwrap(), MonitorState::CancelledExternally);
}

#[test]
pub fn cancel_interrupts_the_poll_wait() {
    let (executor, job) = setup(1);
    let token = ShutdownToken::new();

    let canceller = {
        let token = token.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            token.cancel();
        })
    };

    let start = Instant::now();
    let mut monitor = CompletionMonitor::new(&executor, job, false, Duration::from_secs(60), 20);

    assert_eq!(monitor.run(&token).unwrap(), MonitorState::CancelledExternally);
    assert!(start.elapsed() < Duration::from_secs(30));

    canceller.join().unwrap();
}
