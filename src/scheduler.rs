//! Queue Scheduler.
//!
//! Owns a set of named queues and admits pending tasks to coordinators
//! subject to per-queue concurrency limits and priorities, firing
//! post-completion actions once a queue drains.
//!
//! Grounded directly on the old `GlobalScheduler`: `Semaphore`-gated
//! admission, a priority-ordered `VecDeque`, and the same
//! enqueue/try_start_next/complete_download/pause/resume shape —
//! generalized from two hardcoded download/SNDE semaphores to a
//! `HashMap<String, Semaphore>` keyed by queue name.

use crate::log_info;
use crate::model::{PostProcessAction, Queue, QueueMode, Task, TaskStatus};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock, Semaphore};
use uuid::Uuid;

const TAG: &str = "Scheduler";
pub const DEFAULT_QUEUE: &str = "Default";

#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    SlotAvailable(String),
    TaskCompleted(Uuid),
    TaskFailed(Uuid, String),
    QueueDrained(String),
}

struct QueueState {
    queue: Queue,
    semaphore: Arc<Semaphore>,
    pending: VecDeque<Task>,
    running: HashMap<Uuid, Task>,
}

impl QueueState {
    fn new(queue: Queue) -> Self {
        let limit = queue.effective_limit() as usize;
        Self { queue, semaphore: Arc::new(Semaphore::new(limit)), pending: VecDeque::new(), running: HashMap::new() }
    }

    fn resize_semaphore(&mut self) {
        let limit = self.queue.effective_limit() as usize;
        let current = self.semaphore.available_permits() + self.running.len();
        if limit > current {
            self.semaphore.add_permits(limit - current);
        }
        // Shrinking takes effect gradually as permits are returned by
        // completions, per §6: "must take effect on the next admission
        // pass without disturbing running workers."
    }

    fn insert_pending_sorted(&mut self, task: Task) {
        let pos = self
            .pending
            .iter()
            .position(|t| t.priority < task.priority || (t.priority == task.priority && t.created_at > task.created_at))
            .unwrap_or(self.pending.len());
        self.pending.insert(pos, task);
    }
}

pub struct QueueScheduler {
    queues: Arc<RwLock<HashMap<String, QueueState>>>,
    event_tx: mpsc::Sender<SchedulerEvent>,
}

impl QueueScheduler {
    pub fn new() -> (Self, mpsc::Receiver<SchedulerEvent>) {
        let (tx, rx) = mpsc::channel(256);
        (Self { queues: Arc::new(RwLock::new(HashMap::new())), event_tx: tx }, rx)
    }

    pub async fn create_queue(&self, queue: Queue) {
        let mut queues = self.queues.write().await;
        if !queues.contains_key(&queue.name) {
            log_info!(TAG, "created queue {}", queue.name);
            queues.insert(queue.name.clone(), QueueState::new(queue));
        }
    }

    async fn ensure_default_queue(&self) {
        let mut queues = self.queues.write().await;
        queues
            .entry(DEFAULT_QUEUE.to_string())
            .or_insert_with(|| QueueState::new(Queue::new(DEFAULT_QUEUE, 3, QueueMode::Parallel)));
    }

    pub async fn set_active(&self, name: &str, active: bool) {
        if let Some(state) = self.queues.write().await.get_mut(name) {
            state.queue.is_active = active;
        }
    }

    pub async fn delete_queue(&self, name: &str) {
        self.queues.write().await.remove(name);
    }

    pub async fn set_max_concurrent(&self, name: &str, max_concurrent: u8) {
        let mut queues = self.queues.write().await;
        if let Some(state) = queues.get_mut(name) {
            state.queue.max_concurrent = max_concurrent;
            state.resize_semaphore();
        }
    }

    /// Enqueues a task into its declared queue, creating the lazy
    /// "Default" queue if the task has none.
    pub async fn enqueue(&self, mut task: Task) {
        self.ensure_default_queue().await;
        let queue_name = task.queue_id.clone().unwrap_or_else(|| DEFAULT_QUEUE.to_string());
        task.queue_id = Some(queue_name.clone());
        task.status = TaskStatus::Pending;

        let mut queues = self.queues.write().await;
        let state = queues.entry(queue_name.clone()).or_insert_with(|| QueueState::new(Queue::new(&queue_name, 3, QueueMode::Parallel)));
        state.queue.post_process_executed = false;
        state.insert_pending_sorted(task);
        log_info!(TAG, "enqueued task into {}, pending={}", queue_name, state.pending.len());
    }

    /// One admission pass for a single queue: fetch pending tasks sorted
    /// by (priority desc, createdDate asc) — already the invariant
    /// `insert_pending_sorted` maintains — and admit up to the number of
    /// free slots.
    pub async fn admit(&self, queue_name: &str) -> Vec<Task> {
        let mut queues = self.queues.write().await;
        let state = match queues.get_mut(queue_name) {
            Some(s) => s,
            None => return Vec::new(),
        };
        if !state.queue.is_active {
            return Vec::new();
        }

        let mut admitted = Vec::new();
        while state.semaphore.available_permits() > 0 {
            let Some(task) = state.pending.pop_front() else { break };
            let _ = state.semaphore.try_acquire().map(|p| p.forget());
            state.running.insert(task.id, task.clone());
            admitted.push(task);
        }
        if !admitted.is_empty() {
            log_info!(TAG, "admitted {} task(s) into {}", admitted.len(), queue_name);
        }
        admitted
    }

    /// Marks a task terminal (completed or errored), releases its slot,
    /// and fires the post-process action if the queue just drained.
    pub async fn complete_task(&self, queue_name: &str, task_id: Uuid, success: bool) {
        let mut queues = self.queues.write().await;
        let Some(state) = queues.get_mut(queue_name) else { return };
        if state.running.remove(&task_id).is_some() {
            state.semaphore.add_permits(1);
        }

        let drained = state.pending.is_empty() && state.running.is_empty();
        if drained && !state.queue.post_process_executed {
            state.queue.post_process_executed = true;
            let action = state.queue.post_process_action;
            let script = state.queue.post_process_script_path.clone();
            drop(queues);
            self.run_post_process(queue_name, action, script).await;
            let _ = self.event_tx.send(SchedulerEvent::QueueDrained(queue_name.to_string())).await;
        } else {
            drop(queues);
        }

        let event = if success {
            SchedulerEvent::TaskCompleted(task_id)
        } else {
            SchedulerEvent::TaskFailed(task_id, "task errored".into())
        };
        let _ = self.event_tx.send(event).await;
        let _ = self.event_tx.send(SchedulerEvent::SlotAvailable(queue_name.to_string())).await;
    }

    async fn run_post_process(&self, queue_name: &str, action: PostProcessAction, script: Option<std::path::PathBuf>) {
        match action {
            PostProcessAction::None => {}
            PostProcessAction::Sleep => {
                log_info!(TAG, "queue {} drained: would enter sleep", queue_name);
            }
            PostProcessAction::Shutdown => {
                log_info!(TAG, "queue {} drained: would shut down", queue_name);
            }
            PostProcessAction::RunScript => {
                if let Some(path) = script {
                    log_info!(TAG, "queue {} drained: running script {:?}", queue_name, path);
                    let _ = tokio::process::Command::new(&path).spawn();
                }
            }
            PostProcessAction::Notify => {
                log_info!(TAG, "queue {} drained: notify", queue_name);
            }
        }
    }

    pub async fn pause_task(&self, queue_name: &str, task_id: Uuid) -> Option<Task> {
        let mut queues = self.queues.write().await;
        let state = queues.get_mut(queue_name)?;
        if let Some(task) = state.running.remove(&task_id) {
            state.semaphore.add_permits(1);
            return Some(task);
        }
        if let Some(pos) = state.pending.iter().position(|t| t.id == task_id) {
            return state.pending.remove(pos);
        }
        None
    }

    pub async fn status(&self, queue_name: &str) -> Option<QueueStatus> {
        let queues = self.queues.read().await;
        let state = queues.get(queue_name)?;
        Some(QueueStatus {
            pending: state.pending.len(),
            running: state.running.len(),
            available_slots: state.semaphore.available_permits(),
        })
    }
}

impl Default for QueueScheduler {
    fn default() -> Self {
        Self::new().0
    }
}

#[derive(Debug, Clone)]
pub struct QueueStatus {
    pub pending: usize,
    pub running: usize,
    pub available_slots: usize,
}
