//! The durable write-task queue.
//!
//! Tasks survive restarts in a JSON state file; anything `pending` or
//! `running` at startup is re-queued. The worker owns no registry
//! connection itself: registry effects go through a `RegistryNotifier`,
//! and UI-side observers (the pending-override cache) register as
//! `TaskListener`s. Neither trait implementor is known to the queue, which
//! keeps the dependency arrow pointing one way.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Utc;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use crate::error::{IftrackError, WorkerError};

use super::executor;
use super::task::{AssignmentItem, ResponsePayload, TaskPayload, WriteTask, WriteTaskStatus};

/// Registry-side effects of a write task. Implemented over the registry
/// write queue by the hooks layer; mocked in tests.
pub trait RegistryNotifier: Send + Sync {
    fn response_written(&self, payload: &ResponsePayload) -> Result<(), IftrackError>;
    fn assigned(&self, item: &AssignmentItem) -> Result<(), IftrackError>;
    /// Best-effort mirror of the task into the shared write log.
    fn mirror(&self, task: &WriteTask);
}

/// Observer of task state changes.
pub trait TaskListener: Send + Sync {
    fn on_task_update(&self, task: &WriteTask);
}

struct Shared {
    tasks: Mutex<HashMap<String, WriteTask>>,
    listeners: RwLock<Vec<Arc<dyn TaskListener>>>,
    state_path: PathBuf,
    notifier: Arc<dyn RegistryNotifier>,
    persist_warned: AtomicBool,
}

pub struct WriteTaskQueue {
    shared: Arc<Shared>,
    sender: Sender<String>,
    worker: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl WriteTaskQueue {
    /// Where the queue persists its state by default.
    pub fn default_state_path() -> Result<PathBuf, crate::error::ConfigError> {
        Ok(crate::config::ensure_state_dir()?.join("write_tasks_state.json"))
    }

    /// Loads persisted tasks from `state_path`, re-queues unfinished ones
    /// and starts the worker.
    pub fn new(state_path: PathBuf, notifier: Arc<dyn RegistryNotifier>) -> Self {
        let mut loaded = load_state(&state_path);
        let mut requeue: Vec<(String, String)> = Vec::new();
        for task in loaded.values_mut() {
            if !task.status.is_terminal() {
                task.status = WriteTaskStatus::Pending;
                task.started_at = None;
                requeue.push((task.submitted_at.clone(), task.id.clone()));
            }
        }
        requeue.sort();
        if !requeue.is_empty() {
            log::info!("Re-queueing {} unfinished write task(s)", requeue.len());
        }

        let shared = Arc::new(Shared {
            tasks: Mutex::new(loaded),
            listeners: RwLock::new(Vec::new()),
            state_path,
            notifier,
            persist_warned: AtomicBool::new(false),
        });
        let (sender, receiver) = bounded::<String>(256);
        let shutdown = Arc::new(AtomicBool::new(false));

        let worker_shared = Arc::clone(&shared);
        let flag = Arc::clone(&shutdown);
        let worker = thread::Builder::new()
            .name("write-tasks".to_string())
            .spawn(move || run_worker(worker_shared, receiver, flag))
            .ok();
        if worker.is_none() {
            log::error!("Failed to spawn write-task worker");
        }

        let queue = Self {
            shared,
            sender,
            worker,
            shutdown,
        };
        for (_, id) in requeue {
            let _ = queue.sender.send(id);
        }
        queue
    }

    pub fn add_listener(&self, listener: Arc<dyn TaskListener>) {
        if let Ok(mut listeners) = self.shared.listeners.write() {
            listeners.push(listener);
        }
    }

    /// Persists and enqueues a task; returns its id.
    pub fn submit(&self, task: WriteTask) -> Result<String, WorkerError> {
        if self.shutdown.load(Ordering::Relaxed) {
            return Err(WorkerError::ChannelClosed);
        }
        let id = task.id.clone();
        {
            let mut tasks = match self.shared.tasks.lock() {
                Ok(guard) => guard,
                Err(_) => return Err(WorkerError::ChannelClosed),
            };
            tasks.insert(id.clone(), task.clone());
        }
        self.shared.after_change(&task);
        self.sender
            .send(id.clone())
            .map_err(|_| WorkerError::ChannelClosed)?;
        Ok(id)
    }

    /// All tasks, oldest submission first.
    pub fn snapshot(&self) -> Vec<WriteTask> {
        let mut tasks: Vec<WriteTask> = match self.shared.tasks.lock() {
            Ok(guard) => guard.values().cloned().collect(),
            Err(_) => Vec::new(),
        };
        tasks.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at).then(a.id.cmp(&b.id)));
        tasks
    }

    pub fn find(&self, id: &str) -> Option<WriteTask> {
        self.shared.tasks.lock().ok()?.get(id).cloned()
    }

    /// `(pending, running, completed, failed)` counts.
    pub fn counts(&self) -> (usize, usize, usize, usize) {
        let mut counts = (0, 0, 0, 0);
        if let Ok(tasks) = self.shared.tasks.lock() {
            for task in tasks.values() {
                match task.status {
                    WriteTaskStatus::Pending => counts.0 += 1,
                    WriteTaskStatus::Running => counts.1 += 1,
                    WriteTaskStatus::Completed => counts.2 += 1,
                    WriteTaskStatus::Failed => counts.3 += 1,
                }
            }
        }
        counts
    }

    /// Blocks until no task is pending or running, or the timeout elapses.
    pub fn flush(&self, timeout: Duration) -> Result<(), WorkerError> {
        let deadline = Instant::now() + timeout;
        loop {
            let (pending, running, _, _) = self.counts();
            if pending == 0 && running == 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(WorkerError::FlushTimeout(timeout));
            }
            thread::sleep(Duration::from_millis(50));
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Signals shutdown and joins the worker. Queued tasks are drained
    /// first; the worker exits once the channel is empty and the flag is
    /// set.
    pub fn wait(mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                log::error!("Write-task worker panicked");
            }
        }
    }
}

impl Drop for WriteTaskQueue {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

impl Shared {
    /// Persist, mirror and notify after any task mutation.
    fn after_change(&self, task: &WriteTask) {
        self.persist();
        self.notifier.mirror(task);
        if let Ok(listeners) = self.listeners.read() {
            for listener in listeners.iter() {
                listener.on_task_update(task);
            }
        }
    }

    fn update<F>(&self, id: &str, apply: F) -> Option<WriteTask>
    where
        F: FnOnce(&mut WriteTask),
    {
        let updated = {
            let mut tasks = self.tasks.lock().ok()?;
            let task = tasks.get_mut(id)?;
            apply(task);
            task.clone()
        };
        self.after_change(&updated);
        Some(updated)
    }

    /// An unwritable state dir degrades to memory-only persistence and
    /// warns once.
    fn persist(&self) {
        let tasks: Vec<WriteTask> = match self.tasks.lock() {
            Ok(guard) => guard.values().cloned().collect(),
            Err(_) => return,
        };
        if let Err(e) = write_state(&self.state_path, &tasks) {
            if !self.persist_warned.swap(true, Ordering::Relaxed) {
                log::warn!(
                    "Cannot persist write tasks to {}: {} (continuing in memory)",
                    self.state_path.display(),
                    e
                );
            }
        }
    }
}

fn run_worker(shared: Arc<Shared>, receiver: Receiver<String>, shutdown: Arc<AtomicBool>) {
    log::debug!("Write-task worker started");
    loop {
        let id = match receiver.recv_timeout(Duration::from_millis(100)) {
            Ok(id) => id,
            Err(RecvTimeoutError::Timeout) => {
                if shutdown.load(Ordering::Relaxed) && receiver.is_empty() {
                    break;
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };
        execute_task(&shared, &id);
    }
    log::debug!("Write-task worker stopped");
}

fn execute_task(shared: &Shared, id: &str) {
    let now = || Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    let Some(task) = shared.update(id, |t| {
        t.status = WriteTaskStatus::Running;
        t.started_at = Some(now());
    }) else {
        log::error!("Write task {} vanished before execution", id);
        return;
    };

    let today = chrono::Local::now().date_naive();
    let result: Result<(), String> = match &task.payload {
        TaskPayload::Response(payload) => match executor::execute_response(payload, today) {
            Ok(()) => {
                notify_with_retry(|| shared.notifier.response_written(payload));
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        },
        TaskPayload::Assignment { items } => {
            let outcome = executor::execute_assignment_batch(items);
            // Items that did land in Excel are pushed to the registry even
            // when the batch as a whole fails.
            for item in items {
                let failed = outcome.failed.iter().any(|(iface, _)| iface == &item.interface_id);
                if !failed {
                    notify_with_retry(|| shared.notifier.assigned(item));
                }
            }
            if outcome.is_success(items.len()) {
                Ok(())
            } else {
                Err(outcome
                    .first_reason()
                    .unwrap_or("assignment batch incomplete")
                    .to_string())
            }
        }
    };

    shared.update(id, |t| {
        t.completed_at = Some(now());
        match &result {
            Ok(()) => t.status = WriteTaskStatus::Completed,
            Err(reason) => {
                t.status = WriteTaskStatus::Failed;
                t.error = Some(reason.clone());
            }
        }
    });
}

/// Registry failures after a verified Excel write do not fail the task;
/// one immediate retry, then give up and log.
fn notify_with_retry<F>(notify: F)
where
    F: Fn() -> Result<(), IftrackError>,
{
    if let Err(first) = notify() {
        log::warn!("Registry update failed after Excel write: {}, retrying", first);
        if let Err(second) = notify() {
            log::error!("Registry update retry failed: {}", second);
        }
    }
}

fn load_state(path: &PathBuf) -> HashMap<String, WriteTask> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(_) => return HashMap::new(),
    };
    match serde_json::from_slice::<Vec<WriteTask>>(&bytes) {
        Ok(tasks) => tasks.into_iter().map(|t| (t.id.clone(), t)).collect(),
        Err(e) => {
            log::warn!("Discarding unreadable state file {}: {}", path.display(), e);
            HashMap::new()
        }
    }
}

fn write_state(path: &PathBuf, tasks: &[WriteTask]) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_vec_pretty(tasks)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
