//! Scheduler (component E): owns the task table, the FIFO backlog, the bounded active
//! set, the progress event stream, and the five public control operations.
//!
//! Per spec §9, this is an explicit owner (`Arc<Scheduler>` constructed once by the
//! caller) rather than a process-wide singleton, so tests can instantiate isolated
//! schedulers pointed at their own temp directories and databases.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::db::Repository;
use crate::error::AppError;
use crate::model::{Task, TaskStatus};
use crate::runner;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

pub struct SchedulerConfig {
    pub download_dir: PathBuf,
    pub max_concurrent: usize,
    pub connect_timeout: Duration,
    pub receive_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            download_dir: std::env::temp_dir().join("fetchbox"),
            max_concurrent: 3,
            connect_timeout: Duration::from_secs(30),
            receive_timeout: Duration::from_secs(300),
        }
    }
}

struct State {
    tasks: HashMap<String, Task>,
    backlog: VecDeque<String>,
    active_count: usize,
}

pub struct Scheduler {
    state: Mutex<State>,
    repo: Repository,
    events: broadcast::Sender<Task>,
    client: reqwest::Client,
    config: SchedulerConfig,
    tracker: TaskTracker,
}

impl Scheduler {
    pub fn new(repo: Repository, config: SchedulerConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.receive_timeout)
            .build()
            .expect("http client configuration to be valid");
        Arc::new(Scheduler {
            state: Mutex::new(State {
                tasks: HashMap::new(),
                backlog: VecDeque::new(),
                active_count: 0,
            }),
            repo,
            events,
            client,
            config,
            tracker: TaskTracker::new(),
        })
    }

    pub fn client(&self) -> reqwest::Client {
        self.client.clone()
    }

    pub fn download_dir(&self) -> &std::path::Path {
        &self.config.download_dir
    }

    pub fn max_concurrent(&self) -> usize {
        self.config.max_concurrent
    }

    /// Idempotent: initialize repository, load all tasks, coerce any Downloading rows
    /// to Paused (startup recovery, §4.5/§8 S7), then pump.
    pub async fn initialize(self: &Arc<Self>) -> Result<(), AppError> {
        self.repo.initialize().await?;
        let loaded = self.repo.load_all().await?;
        let mut state = self.state.lock().await;
        for mut task in loaded {
            if task.status == TaskStatus::Downloading {
                task.status = TaskStatus::Paused;
                self.repo.upsert(&task).await?;
            }
            state.tasks.insert(task.id.clone(), task);
        }
        drop(state);
        self.pump().await;
        Ok(())
    }

    pub async fn add(
        self: &Arc<Self>,
        url: String,
        title: String,
        key: Option<String>,
        iv: Option<String>,
    ) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let task = Task::new(id.clone(), url, title, key, iv);
        {
            let mut state = self.state.lock().await;
            state.tasks.insert(id.clone(), task.clone());
            state.backlog.push_back(id.clone());
        }
        let _ = self.repo.upsert(&task).await;
        self.emit(&task);
        self.pump().await;
        id
    }

    pub async fn pause(self: &Arc<Self>, id: &str) {
        let cancel_handle = {
            let mut state = self.state.lock().await;
            let Some(task) = state.tasks.get_mut(id) else { return };
            if task.status != TaskStatus::Downloading {
                return;
            }
            task.status = TaskStatus::Paused;
            let handle = task.cancel_handle.clone();
            let snapshot = task.snapshot();
            let _ = self.repo.upsert(&snapshot).await;
            self.emit(&snapshot);
            handle
        };
        if let Some(handle) = cancel_handle {
            handle.cancel();
        }
    }

    pub async fn resume(self: &Arc<Self>, id: &str) {
        {
            let mut state = self.state.lock().await;
            let Some(task) = state.tasks.get_mut(id) else { return };
            if !matches!(task.status, TaskStatus::Paused | TaskStatus::Failed) {
                return;
            }
            task.status = TaskStatus::Pending;
            task.error = None;
            let snapshot = task.snapshot();
            state.backlog.push_back(id.to_string());
            let _ = self.repo.upsert(&snapshot).await;
            self.emit(&snapshot);
        }
        self.pump().await;
    }

    pub async fn cancel(self: &Arc<Self>, id: &str) {
        let (cancel_handle, task) = {
            let mut state = self.state.lock().await;
            let Some(mut task) = state.tasks.remove(id) else { return };
            state.backlog.retain(|x| x != id);
            if task.status == TaskStatus::Downloading {
                state.active_count = state.active_count.saturating_sub(1);
            }
            let handle = task.cancel_handle.take();
            task.status = TaskStatus::Cancelled;
            (handle, task)
        };
        if let Some(handle) = cancel_handle {
            handle.cancel();
        }
        let _ = self.repo.delete(id).await;
        remove_task_artifacts(&self.config.download_dir, id).await;
        self.emit(&task.snapshot());
        self.pump().await;
    }

    pub async fn get(&self, id: &str) -> Option<Task> {
        self.state.lock().await.tasks.get(id).map(Task::snapshot)
    }

    pub async fn list(&self) -> Vec<Task> {
        let state = self.state.lock().await;
        let mut tasks: Vec<Task> = state.tasks.values().map(Task::snapshot).collect();
        tasks.sort_unstable_by(|a, b| b.id.cmp(&a.id));
        tasks
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Task> {
        self.events.subscribe()
    }

    fn emit(&self, task: &Task) {
        let _ = self.events.send(task.snapshot());
    }

    /// While there's a free slot and backlog work, dispatch. Safe to call repeatedly and
    /// concurrently: each call only ever acts on what it observes under the lock.
    pub async fn pump(self: &Arc<Self>) {
        loop {
            let next = {
                let mut state = self.state.lock().await;
                if state.active_count >= self.config.max_concurrent {
                    None
                } else if let Some(id) = state.backlog.pop_front() {
                    match state.tasks.get_mut(&id) {
                        Some(task) if task.status == TaskStatus::Pending => {
                            let token = CancellationToken::new();
                            task.cancel_handle = Some(token.clone());
                            task.status = TaskStatus::Downloading;
                            state.active_count += 1;
                            Some((id, task.snapshot(), token))
                        }
                        _ => None,
                    }
                } else {
                    None
                }
            };
            let Some((id, snapshot, token)) = next else { break };
            let _ = self.repo.upsert(&snapshot).await;
            self.emit(&snapshot);
            let scheduler = Arc::clone(self);
            self.tracker.spawn(async move {
                runner::run(scheduler, id, token).await;
            });
        }
    }

    /// Called by the runner when a task finishes (successfully or not) to free its slot
    /// and keep pumping the backlog.
    pub(crate) async fn on_run_finished(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().await;
            state.active_count = state.active_count.saturating_sub(1);
        }
        self.pump().await;
    }

    /// Persist and broadcast a mutated snapshot of `id`. Used by the runner to report
    /// progress and terminal transitions without exposing the internal task map.
    pub(crate) async fn apply<F>(&self, id: &str, mutate: F) -> Option<Task>
    where
        F: FnOnce(&mut Task),
    {
        let snapshot = {
            let mut state = self.state.lock().await;
            let task = state.tasks.get_mut(id)?;
            mutate(task);
            task.snapshot()
        };
        let _ = self.repo.upsert(&snapshot).await;
        self.emit(&snapshot);
        Some(snapshot)
    }

    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }
}

async fn remove_task_artifacts(download_dir: &std::path::Path, id: &str) {
    let file = download_dir.join(format!("{id}.mp4"));
    let _ = tokio::fs::remove_file(&file).await;
    let temp_dir = download_dir.join(format!("{id}_temp"));
    let _ = tokio::fs::remove_dir_all(&temp_dir).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn scheduler_with_tempdir() -> (Arc<Scheduler>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::connect_in_memory().await.unwrap();
        let config = SchedulerConfig {
            download_dir: dir.path().to_path_buf(),
            max_concurrent: 3,
            connect_timeout: Duration::from_secs(5),
            receive_timeout: Duration::from_secs(5),
        };
        let scheduler = Scheduler::new(repo, config);
        scheduler.initialize().await.unwrap();
        (scheduler, dir)
    }

    #[tokio::test]
    async fn add_creates_pending_task_then_dispatches() {
        let (scheduler, _dir) = scheduler_with_tempdir().await;
        let id = scheduler
            .add("http://127.0.0.1:1/does-not-exist.mp4".into(), "T".into(), None, None)
            .await;
        // pump() will have flipped it to Downloading (no slot contention at cap=3).
        let task = scheduler.get(&id).await.unwrap();
        assert!(matches!(task.status, TaskStatus::Downloading | TaskStatus::Failed));
    }

    #[tokio::test]
    async fn list_sorts_by_id_descending() {
        let (scheduler, _dir) = scheduler_with_tempdir().await;
        {
            let mut state = scheduler.state.lock().await;
            state.tasks.insert(
                "a".into(),
                Task::new("a".into(), "http://x/a.mp4".into(), "A".into(), None, None),
            );
            state.tasks.insert(
                "b".into(),
                Task::new("b".into(), "http://x/b.mp4".into(), "B".into(), None, None),
            );
        }
        let listed = scheduler.list().await;
        assert_eq!(listed[0].id, "b");
        assert_eq!(listed[1].id, "a");
    }

    #[tokio::test]
    async fn cancel_removes_task_and_deletes_row() {
        let (scheduler, _dir) = scheduler_with_tempdir().await;
        let id = scheduler
            .add("http://127.0.0.1:1/x.mp4".into(), "X".into(), None, None)
            .await;
        scheduler.cancel(&id).await;
        assert!(scheduler.get(&id).await.is_none());
    }

    #[tokio::test]
    async fn max_concurrent_bounds_active_set() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::connect_in_memory().await.unwrap();
        let config = SchedulerConfig {
            download_dir: dir.path().to_path_buf(),
            max_concurrent: 2,
            connect_timeout: Duration::from_secs(5),
            receive_timeout: Duration::from_secs(5),
        };
        let scheduler = Scheduler::new(repo, config);
        scheduler.initialize().await.unwrap();
        for i in 0..5 {
            scheduler
                .add(format!("http://127.0.0.1:1/{i}.mp4"), format!("T{i}"), None, None)
                .await;
        }
        let state = scheduler.state.lock().await;
        assert!(state.active_count <= 2);
    }

    #[tokio::test]
    async fn startup_recovery_coerces_downloading_to_paused() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::connect_in_memory().await.unwrap();
        repo.initialize().await.unwrap();
        let mut task = Task::new("r1".into(), "http://x/a.mp4".into(), "A".into(), None, None);
        task.status = TaskStatus::Downloading;
        repo.upsert(&task).await.unwrap();

        let config = SchedulerConfig {
            download_dir: dir.path().to_path_buf(),
            max_concurrent: 3,
            connect_timeout: Duration::from_secs(5),
            receive_timeout: Duration::from_secs(5),
        };
        let scheduler = Scheduler::new(repo, config);
        scheduler.initialize().await.unwrap();
        let reloaded = scheduler.get("r1").await.unwrap();
        assert_eq!(reloaded.status, TaskStatus::Paused);
    }
}
