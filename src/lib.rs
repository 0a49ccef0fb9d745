//! Multi-connection HTTP(S) download engine core.
//!
//! Wires together the sparse file writer, network transport, token-bucket
//! limiter, persistence port, task coordinator, queue scheduler,
//! synchronization checker, and progress broadcaster described in each
//! module's own doc comment. No GUI shell, browser bridge, or media
//! extraction lives here — those are external collaborators that feed
//! requests in through the Ingress Adapter.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod ingress;
pub mod limiter;
pub mod logging;
pub mod model;
pub mod persistence;
pub mod progress;
pub mod scheduler;
pub mod sync_checker;
pub mod transport;
pub mod writer;

use std::sync::Arc;

pub use config::EngineConfig;
pub use coordinator::TaskCoordinator;
pub use error::{EngineError, EngineResult};
pub use ingress::{DownloadRequest, IngressAdapter};
pub use limiter::TokenBucket;
pub use model::{Task, TaskStatus};
pub use persistence::{PersistencePort, SqlitePersistence, TaskFilter};
pub use progress::ProgressRegistry;
pub use scheduler::QueueScheduler;
pub use sync_checker::SyncChecker;
pub use transport::Transport;
pub use writer::SparseWriter;

/// Convenience bundle of the process-wide singletons (§9: "instantiate
/// them once and pass as explicit dependencies to coordinators rather
/// than via ambient access").
pub struct Engine {
    pub config: EngineConfig,
    pub transport: Arc<Transport>,
    pub limiter: Arc<TokenBucket>,
    pub persistence: Arc<dyn PersistencePort>,
    pub progress: Arc<ProgressRegistry>,
    pub scheduler: Arc<QueueScheduler>,
}

impl Engine {
    pub fn new(persistence: Arc<dyn PersistencePort>, config: EngineConfig) -> (Self, tokio::sync::mpsc::Receiver<scheduler::SchedulerEvent>) {
        let transport = Arc::new(Transport::new(config.connect_timeout, config.idle_timeout));
        let limiter = Arc::new(TokenBucket::unlimited());
        let progress = Arc::new(ProgressRegistry::new(config.progress_interval));
        let (scheduler, rx) = QueueScheduler::new();

        (
            Self { config, transport, limiter, persistence, progress, scheduler: Arc::new(scheduler) },
            rx,
        )
    }

    /// Builds a coordinator for a task, wired to this engine's shared
    /// singletons.
    pub fn spawn_coordinator(&self, task: Task) -> TaskCoordinator {
        TaskCoordinator::new(
            task,
            self.transport.clone(),
            self.limiter.clone(),
            self.persistence.clone(),
            self.progress.clone(),
            self.config.clone(),
        )
    }
}
