//! Synchronization Checker.
//!
//! Periodically probes completed tasks in sync-queues for remote
//! changes, enqueuing successor tasks when the remote copy differs.
//!
//! No analogue existed in this codebase before — grounded on
//! `watchdog.rs::Watchdog::run`'s `tokio::time::interval` +
//! `tokio::select!` polling loop (the only periodic-background-task
//! idiom already in use here), repurposed to probe completed downloads
//! instead of live connection health.

use crate::log_info;
use crate::model::{Queue, Task, TaskStatus};
use crate::persistence::{PersistencePort, TaskFilter};
use crate::scheduler::QueueScheduler;
use crate::transport::Transport;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{interval, Duration};

const TAG: &str = "SyncChecker";

pub enum SyncCommand {
    Shutdown,
}

pub struct SyncChecker {
    persistence: Arc<dyn PersistencePort>,
    transport: Arc<Transport>,
    scheduler: Arc<QueueScheduler>,
    queues: Arc<RwLock<Vec<Queue>>>,
}

impl SyncChecker {
    pub fn new(persistence: Arc<dyn PersistencePort>, transport: Arc<Transport>, scheduler: Arc<QueueScheduler>) -> Self {
        Self { persistence, transport, scheduler, queues: Arc::new(RwLock::new(Vec::new())) }
    }

    pub async fn register_sync_queue(&self, queue: Queue) {
        if !queue.is_sync_queue {
            return;
        }
        self.queues.write().await.push(queue);
    }

    /// Drives the periodic poll loop until `Shutdown` is received.
    pub async fn run(self: Arc<Self>, mut commands: mpsc::Receiver<SyncCommand>) {
        let mut ticker = interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                cmd = commands.recv() => {
                    match cmd {
                        Some(SyncCommand::Shutdown) | None => {
                            log_info!(TAG, "shutting down");
                            return;
                        }
                    }
                }
                _ = ticker.tick() => {
                    self.check_due_queues().await;
                }
            }
        }
    }

    /// Runs one admission pass over every registered sync queue whose
    /// `check_interval_secs` has elapsed. Exposed directly (not just via
    /// `run`'s ticker) so an embedder can trigger an out-of-band "sync
    /// now" check.
    pub async fn check_due_queues(&self) {
        let now = chrono::Utc::now();
        let due: Vec<Queue> = {
            let mut queues = self.queues.write().await;
            let mut due = Vec::new();
            for q in queues.iter_mut() {
                let Some(interval_secs) = q.check_interval_secs else { continue };
                let elapsed = q
                    .last_check
                    .map(|last| (now - last).num_seconds() as u64)
                    .unwrap_or(u64::MAX);
                if elapsed >= interval_secs {
                    q.last_check = Some(now);
                    due.push(q.clone());
                }
            }
            due
        };

        for queue in due {
            if let Err(e) = self.check_queue(&queue).await {
                log_info!(TAG, "check of queue {} failed: {}", queue.name, e);
            }
        }
    }

    async fn check_queue(&self, queue: &Queue) -> crate::error::EngineResult<()> {
        let filter = TaskFilter { queue_id: Some(queue.name.clone()), status: Some(TaskStatus::Complete) };
        let completed = self.persistence.load_tasks(&filter).await?;

        for task in completed {
            let probe = match self.transport.probe(&task.url).await {
                Ok(p) => p,
                Err(_) => continue, // transient probe failures don't spawn successors
            };

            let etag_differs = match (&task.validators.etag, &probe.etag) {
                (Some(a), Some(b)) => a != b,
                _ => false,
            };
            let length_differs = task.total_size != 0 && probe.content_length != 0 && task.total_size != probe.content_length;
            let newer_last_modified = match (&task.validators.last_modified, &probe.last_modified) {
                (Some(a), Some(b)) => b > a,
                _ => false,
            };

            if etag_differs || length_differs || newer_last_modified {
                let mut successor = Task::new(task.url.clone(), task.destination_path.clone(), task.connections)
                    .with_priority(task.priority)
                    .with_queue(queue.name.clone());
                successor.status = TaskStatus::Pending;
                self.persistence.upsert_task(&successor).await?;
                self.scheduler.enqueue(successor).await;
                log_info!(TAG, "queue {}: remote change detected, enqueued successor for {}", queue.name, task.url);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::QueueMode;
    use crate::persistence::SqlitePersistence;
    use std::time::Duration as StdDuration;

    fn sync_queue(name: &str, interval_secs: u64) -> Queue {
        let mut q = Queue::new(name, 1, QueueMode::Sequential);
        q.is_sync_queue = true;
        q.check_interval_secs = Some(interval_secs);
        q
    }

    #[tokio::test]
    async fn registering_a_non_sync_queue_is_ignored() {
        let persistence: Arc<dyn PersistencePort> = Arc::new(SqlitePersistence::in_memory().unwrap());
        let transport = Arc::new(Transport::new(StdDuration::from_secs(1), StdDuration::from_secs(1)));
        let (scheduler, _rx) = QueueScheduler::new();
        let checker = SyncChecker::new(persistence, transport, Arc::new(scheduler));

        checker.register_sync_queue(Queue::new("not-sync", 1, QueueMode::Parallel)).await;
        assert!(checker.queues.read().await.is_empty());
    }

    #[tokio::test]
    async fn sync_queue_is_registered() {
        let persistence: Arc<dyn PersistencePort> = Arc::new(SqlitePersistence::in_memory().unwrap());
        let transport = Arc::new(Transport::new(StdDuration::from_secs(1), StdDuration::from_secs(1)));
        let (scheduler, _rx) = QueueScheduler::new();
        let checker = SyncChecker::new(persistence, transport, Arc::new(scheduler));

        checker.register_sync_queue(sync_queue("films", 3600)).await;
        assert_eq!(checker.queues.read().await.len(), 1);
    }
}
