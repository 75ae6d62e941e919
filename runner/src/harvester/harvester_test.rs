use super::{is_partial, DownloadedSet, HarvestError, OutputHarvester, PARTIAL_PREFIX};
use crate::{
    error::RemoteError,
    executors::{memory::MemoryExecutor, Executor},
    job::{JobId, JobSpec, JobState, PoolSpec, PreparationStep, TaskSpec, MANAGER_TASK_ID},
    storage::{fs::FsStore, BlobInfo, ObjectStore},
    sync::ShutdownToken,
};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, HashSet},
    fs,
    path::Path,
    time::Duration,
};
use tempfile::TempDir;

/// Store recording every download and failing the names it is told to
struct CountingStore {
    inner: FsStore,
    downloads: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
}

impl CountingStore {
    fn downloads(&self) -> Vec<String> {
        let mut downloads = self.downloads.lock().clone();
        downloads.sort();
        downloads
    }
}

impl ObjectStore for CountingStore {
    fn create_container(&self, container: &str) -> Result<(), RemoteError> {
        self.inner.create_container(container)
    }

    fn container_exists(&self, container: &str) -> Result<bool, RemoteError> {
        self.inner.container_exists(container)
    }

    fn delete_container(&self, container: &str) -> Result<(), RemoteError> {
        self.inner.delete_container(container)
    }

    fn list(&self, container: &str) -> Result<Vec<BlobInfo>, RemoteError> {
        self.inner.list(container)
    }

    fn properties(&self, container: &str, blob: &str) -> Result<Option<BlobInfo>, RemoteError> {
        self.inner.properties(container, blob)
    }

    fn upload(&self, container: &str, blob: &str, source: &Path) -> Result<(), RemoteError> {
        self.inner.upload(container, blob, source)
    }

    fn download(&self, container: &str, blob: &str, target: &Path) -> Result<(), RemoteError> {
        if self.failing.lock().contains(blob) {
            return Err(RemoteError::Rejected("connection reset".into()));
        }

        self.downloads.lock().push(blob.to_owned());
        self.inner.download(container, blob, target)
    }

    fn delete(&self, container: &str, blob: &str) -> Result<(), RemoteError> {
        self.inner.delete(container, blob)
    }

    fn container_url(&self, container: &str) -> String {
        self.inner.container_url(container)
    }

    fn credentials(&self) -> (&str, &str) {
        self.inner.credentials()
    }
}

struct Fixture {
    dir: TempDir,
    store: CountingStore,
    executor: MemoryExecutor,
    job: JobId,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = CountingStore {
            inner: FsStore::new(dir.path().join("store"), "lab".into(), "key".into()),
            downloads: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
        };
        let executor = MemoryExecutor::new();
        executor.add_pool("sims", 1, 1);

        let job = JobId::generate();
        executor
            .create_job(&JobSpec {
                id: job,
                display_name: "harvest".into(),
                pool: PoolSpec::Named("sims".into()),
                preparation: PreparationStep {
                    command: "true".into(),
                    resource_files: Vec::new(),
                    wait_for_success: true,
                },
                manager: TaskSpec {
                    id: MANAGER_TASK_ID.into(),
                    display_name: "manager".into(),
                    command: "true".into(),
                    environment: BTreeMap::new(),
                },
                release: None,
            })
            .unwrap();
        store.create_container(&job.output_container()).unwrap();

        Self {
            dir,
            store,
            executor,
            job,
        }
    }

    fn put(&self, name: &str, content: &str) {
        let source = self.dir.path().join("source");
        fs::write(&source, content).unwrap();
        self.store
            .upload(&self.job.output_container(), name, &source)
            .unwrap();
    }

    fn local(&self) -> std::path::PathBuf {
        self.dir.path().join("outputs")
    }

    fn harvester(&self) -> OutputHarvester<'_> {
        OutputHarvester::new(
            &self.store,
            &self.executor,
            self.job,
            self.local(),
            Duration::from_millis(10),
            4,
        )
        .unwrap()
    }
}

#[test]
pub fn never_downloads_the_same_object_twice() {
    let fixture = Fixture::new();
    let token = ShutdownToken::new();
    fixture.put("0.csv", "a");
    fixture.put("nested/0.stdout", "b");

    let harvester = fixture.harvester();
    assert_eq!(harvester.harvest_once(&token).unwrap(), 2);
    assert_eq!(harvester.harvest_once(&token).unwrap(), 0);

    fixture.put("1.csv", "c");
    assert_eq!(harvester.harvest_once(&token).unwrap(), 1);

    assert_eq!(
        fixture.store.downloads(),
        vec!["0.csv", "1.csv", "nested/0.stdout"]
    );
    assert_eq!(
        fs::read_to_string(fixture.local().join("nested/0.stdout")).unwrap(),
        "b"
    );
}

#[test]
pub fn restart_skips_objects_already_on_disk() {
    let fixture = Fixture::new();
    let token = ShutdownToken::new();
    fixture.put("x.csv", "remote");
    fixture.put("y.csv", "remote");

    fs::create_dir_all(fixture.local()).unwrap();
    fs::write(fixture.local().join("x.csv"), "local").unwrap();

    let harvester = fixture.harvester();
    assert!(harvester.downloaded().contains("x.csv"));
    assert_eq!(harvester.harvest_once(&token).unwrap(), 1);

    assert_eq!(fixture.store.downloads(), vec!["y.csv"]);
    // the existing copy is left alone
    assert_eq!(
        fs::read_to_string(fixture.local().join("x.csv")).unwrap(),
        "local"
    );
}

#[test]
pub fn stale_partial_downloads_are_discarded() {
    let fixture = Fixture::new();
    fs::create_dir_all(fixture.local()).unwrap();
    let partial = fixture.local().join(format!("{PARTIAL_PREFIX}y.csv"));
    fs::write(&partial, "trunc").unwrap();

    let set = DownloadedSet::rebuild(&fixture.local()).unwrap();

    assert!(set.is_empty());
    assert!(!partial.exists());
}

#[test]
pub fn bracketed_object_names_survive_a_restart() {
    let fixture = Fixture::new();
    let token = ShutdownToken::new();
    fixture.put("[partial]_0.csv", "a");

    assert_eq!(fixture.harvester().harvest_once(&token).unwrap(), 1);

    // a fresh harvester rebuilds from disk and keeps the completed object
    let restarted = fixture.harvester();
    assert!(restarted.downloaded().contains("[partial]_0.csv"));
    assert_eq!(restarted.harvest_once(&token).unwrap(), 0);

    assert_eq!(fixture.store.downloads(), vec!["[partial]_0.csv"]);
    assert_eq!(
        fs::read_to_string(fixture.local().join("[partial]_0.csv")).unwrap(),
        "a"
    );
}

#[test]
pub fn partial_names_are_recognised_by_their_last_component() {
    assert!(is_partial(".partial-0.csv"));
    assert!(is_partial("nested/.partial-0.csv"));
    assert!(!is_partial(".partial-dir/0.csv"));
    assert!(!is_partial("[partial]_0.csv"));
}

#[test]
pub fn failed_download_is_retried_next_cycle() {
    let fixture = Fixture::new();
    let token = ShutdownToken::new();
    fixture.put("good.csv", "a");
    fixture.put("bad.csv", "b");
    fixture.store.failing.lock().insert("bad.csv".into());

    let harvester = fixture.harvester();
    let error = harvester.harvest_once(&token).unwrap_err();
    assert!(matches!(
        error,
        HarvestError::Downloads {
            failed: 1,
            total: 2,
            ..
        }
    ));
    assert!(harvester.downloaded().contains("good.csv"));
    assert!(!fixture.local().join(format!("{PARTIAL_PREFIX}bad.csv")).exists());

    fixture.store.failing.lock().clear();
    assert_eq!(harvester.harvest_once(&token).unwrap(), 1);
    assert_eq!(fixture.store.downloads(), vec!["bad.csv", "good.csv"]);
}

#[test]
pub fn run_stops_once_the_job_is_complete() {
    let fixture = Fixture::new();
    fixture.put("0.csv", "a");
    fixture.put("1.csv", "b");
    fixture.executor.set_job_state(&fixture.job, JobState::Completed);

    let harvested = fixture.harvester().run(&ShutdownToken::new());

    assert_eq!(harvested, 2);
}

#[test]
pub fn run_treats_a_deleted_job_as_complete() {
    let fixture = Fixture::new();
    fixture.put("0.csv", "a");
    fixture.executor.delete_job(&fixture.job).unwrap();

    assert_eq!(fixture.harvester().run(&ShutdownToken::new()), 1);
}

#[test]
pub fn run_keeps_going_through_failed_cycles() {
    let fixture = Fixture::new();
    fixture.put("0.csv", "a");
    fixture.executor.set_job_state(&fixture.job, JobState::Completed);
    // the first cycle only fails the job lookup, which counts as not complete
    fixture.executor.fail_reads(1);

    assert_eq!(fixture.harvester().run(&ShutdownToken::new()), 1);
}

#[test]
pub fn cancelled_run_does_not_list() {
    let fixture = Fixture::new();
    fixture.put("0.csv", "a");
    let token = ShutdownToken::new();
    token.cancel();

    assert_eq!(fixture.harvester().run(&token), 0);
    assert!(fixture.store.downloads().is_empty());
}
