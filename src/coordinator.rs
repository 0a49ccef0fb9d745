//! Task Coordinator — the heart of the engine.
//!
//! Owns one task's segment set, spawns a worker per segment, applies the
//! in-half split rule as workers finish early, enforces the validator
//! policy on (re)start, and drives persistence and progress reporting.
//!
//! Grounded on `SNDEEngine::download` (probe -> preallocate -> create
//! chunks -> spawn workers -> join), generalized into a resumable,
//! splittable, persisted state machine. Cancellation uses
//! `CancellationToken` rather than this codebase's older oneshot/
//! `AtomicBool` bridge, since one token clones cheaply to every worker.

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::limiter::TokenBucket;
use crate::log_info;
use crate::log_warn;
use crate::model::{Segment, Task, TaskStatus, Validators};
use crate::persistence::PersistencePort;
use crate::progress::ProgressRegistry;
use crate::transport::{RangeEnd, Transport};
use crate::writer::SparseWriter;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const TAG: &str = "Coordinator";

enum WorkerOutcome {
    Complete(Uuid),
    Cancelled(Uuid),
    RangeRejected(Uuid),
    Failed(Uuid, EngineError),
}

/// Shared, mutable per-segment state. Wrapped individually (rather than
/// one lock over the whole Vec) so the in-half split can shorten a donor
/// segment without blocking every other worker's offset advances.
type SharedSegment = Arc<Mutex<Segment>>;

pub struct TaskCoordinator {
    task: Arc<RwLock<Task>>,
    segments: Arc<RwLock<HashMap<Uuid, SharedSegment>>>,
    transport: Arc<Transport>,
    limiter: Arc<TokenBucket>,
    persistence: Arc<dyn PersistencePort>,
    progress: Arc<ProgressRegistry>,
    config: EngineConfig,
    cancel: CancellationToken,
    live_workers: Arc<AtomicU32>,
}

impl TaskCoordinator {
    pub fn new(
        task: Task,
        transport: Arc<Transport>,
        limiter: Arc<TokenBucket>,
        persistence: Arc<dyn PersistencePort>,
        progress: Arc<ProgressRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            task: Arc::new(RwLock::new(task)),
            segments: Arc::new(RwLock::new(HashMap::new())),
            transport,
            limiter,
            persistence,
            progress,
            config,
            cancel: CancellationToken::new(),
            live_workers: Arc::new(AtomicU32::new(0)),
        }
    }

    pub async fn task_id(&self) -> Uuid {
        self.task.read().await.id
    }

    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Startup sequence (§4.4): load state, probe if needed, validate,
    /// create segments if absent, open the writer, and run workers to
    /// completion (or until paused/cancelled/errored).
    pub async fn start(&self) -> EngineResult<()> {
        {
            let mut task = self.task.write().await;
            task.status = TaskStatus::Connecting;
        }

        let existing_segments = self.persistence.load_segments(self.task_id().await).await?;

        let probe = self.transport.probe(&self.task.read().await.url.clone()).await?;

        let (resume_from_scratch, validators_ok) = {
            let task = self.task.read().await;
            let new_validators = Validators { etag: probe.etag.clone(), last_modified: probe.last_modified.clone() };
            let length_changed = task.total_size != 0 && probe.content_length != 0 && task.total_size != probe.content_length;
            let changed = !existing_segments.is_empty() && task.validators.changed(&new_validators, length_changed);
            // Unknown-length downloads (accepts_ranges == false) always
            // restart from offset 0 on resume rather than trusting a
            // previously-written partial length (Open Question #3).
            let restart = !probe.accepts_ranges && !existing_segments.is_empty();
            (restart, !changed)
        };

        if !validators_ok {
            let mut task = self.task.write().await;
            task.status = TaskStatus::Error;
            task.error_message = Some("remote file changed since last download".into());
            self.persistence.upsert_task(&task).await.ok();
            return Err(EngineError::FileModified);
        }

        {
            let mut task = self.task.write().await;
            task.total_size = probe.content_length;
            task.supports_resume = probe.accepts_ranges;
            task.validators = Validators { etag: probe.etag.clone(), last_modified: probe.last_modified.clone() };
        }

        let segments = if existing_segments.is_empty() || resume_from_scratch {
            if resume_from_scratch {
                self.persistence.delete_task(self.task_id().await).await.ok();
                self.persistence.upsert_task(&*self.task.read().await).await?;
            }
            self.create_initial_segments(probe.content_length, probe.accepts_ranges).await
        } else {
            existing_segments
        };

        {
            let mut table = self.segments.write().await;
            table.clear();
            for seg in segments {
                table.insert(seg.id, Arc::new(Mutex::new(seg)));
            }
        }

        let writer = Arc::new(
            SparseWriter::open(&self.task.read().await.destination_path.clone(), probe.content_length).await?,
        );

        {
            let mut task = self.task.write().await;
            task.status = TaskStatus::Running;
        }
        self.persistence.upsert_task(&*self.task.read().await).await?;

        self.run_workers(writer).await
    }

    async fn create_initial_segments(&self, total_size: u64, accepts_ranges: bool) -> Vec<Segment> {
        let task_id = self.task_id().await;
        if !accepts_ranges {
            let end = if total_size > 0 { total_size - 1 } else { u64::MAX };
            return vec![Segment::new(task_id, 0, end)];
        }
        if total_size == 0 {
            return vec![Segment::new(task_id, 0, u64::MAX)];
        }

        let requested = self.task.read().await.connections.max(1);
        let n = requested.min(self.config.max_segments).max(1) as u64;
        let base_size = (total_size + n - 1) / n; // ceil(total/n)

        let mut segments = Vec::new();
        let mut start = 0u64;
        while start < total_size {
            let end = (start + base_size - 1).min(total_size - 1);
            segments.push(Segment::new(task_id, start, end));
            start = end + 1;
        }
        segments
    }

    async fn run_workers(&self, writer: Arc<SparseWriter>) -> EngineResult<()> {
        let (tx, mut rx) = mpsc::channel::<WorkerOutcome>(64);

        let segment_ids: Vec<Uuid> = self.segments.read().await.keys().cloned().collect();
        for id in &segment_ids {
            self.spawn_worker(*id, writer.clone(), tx.clone());
        }

        loop {
            if self.cancel.is_cancelled() {
                let mut task = self.task.write().await;
                task.status = TaskStatus::Paused;
                self.persistence.upsert_task(&task).await.ok();
                return Ok(());
            }

            let total_live = self.live_workers.load(Ordering::SeqCst);
            if total_live == 0 {
                break;
            }

            let outcome = match rx.recv().await {
                Some(o) => o,
                None => break,
            };

            match outcome {
                WorkerOutcome::Complete(id) => {
                    self.live_workers.fetch_sub(1, Ordering::SeqCst);
                    log_info!(TAG, "segment {} complete", id);
                    self.maybe_split_and_spawn(writer.clone(), tx.clone()).await;
                }
                WorkerOutcome::Cancelled(id) => {
                    self.live_workers.fetch_sub(1, Ordering::SeqCst);
                    log_info!(TAG, "segment {} stopped for cancellation", id);
                    // No split: a cancelled worker means pause() was called,
                    // and the next loop iteration's cancellation check will
                    // transition the task to Paused rather than keep running.
                }
                WorkerOutcome::RangeRejected(id) => {
                    self.live_workers.fetch_sub(1, Ordering::SeqCst);
                    log_warn!(TAG, "segment {} rejected by server, re-checking validators", id);
                    let probe = self.transport.probe(&self.task.read().await.url.clone()).await;
                    if let Ok(p) = probe {
                        let task = self.task.read().await;
                        let new_validators = Validators { etag: p.etag, last_modified: p.last_modified };
                        if task.validators.changed(&new_validators, false) {
                            drop(task);
                            let mut task = self.task.write().await;
                            task.status = TaskStatus::Error;
                            task.error_message = Some("remote file changed since last download".into());
                            self.persistence.upsert_task(&task).await.ok();
                            return Err(EngineError::FileModified);
                        }
                    }
                }
                WorkerOutcome::Failed(id, err) => {
                    self.live_workers.fetch_sub(1, Ordering::SeqCst);
                    log_warn!(TAG, "segment {} failed terminally: {}", id, err);
                    let mut task = self.task.write().await;
                    task.status = TaskStatus::Error;
                    task.error_message = Some(err.to_string());
                    self.persistence.upsert_task(&task).await.ok();
                    return Err(err);
                }
            }

            if self.all_segments_complete().await {
                break;
            }
        }

        writer.close().await?;
        let mut task = self.task.write().await;
        task.status = TaskStatus::Complete;
        self.persistence.upsert_task(&task).await?;
        log_info!(TAG, "task {} complete", task.id);
        Ok(())
    }

    async fn all_segments_complete(&self) -> bool {
        let table = self.segments.read().await;
        for seg in table.values() {
            if !seg.lock().await.is_complete() {
                return false;
            }
        }
        true
    }

    /// In-half split rule (§4.4): when a worker exits and the task is
    /// still running with fewer live workers than the configured
    /// connection count, split the live segment with the largest
    /// remaining byte count, provided it clears the minimum threshold.
    async fn maybe_split_and_spawn(&self, writer: Arc<SparseWriter>, tx: mpsc::Sender<WorkerOutcome>) {
        let configured = self.task.read().await.connections as u32;
        if self.live_workers.load(Ordering::SeqCst) >= configured {
            return;
        }

        let table = self.segments.read().await;
        let mut best: Option<(Uuid, u64)> = None;
        for (id, seg) in table.iter() {
            let seg = seg.lock().await;
            if seg.is_complete() {
                continue;
            }
            let remaining = seg.remaining();
            if best.map(|(_, r)| remaining > r).unwrap_or(true) {
                best = Some((*id, remaining));
            }
        }
        let (donor_id, remaining) = match best {
            Some(v) if v.1 >= self.config.min_split_threshold => v,
            _ => return,
        };

        let donor_ref = table.get(&donor_id).cloned();
        drop(table);
        let donor_ref = match donor_ref {
            Some(r) => r,
            None => return,
        };

        let new_segment = {
            let mut donor = donor_ref.lock().await;
            let split_point = donor.current_offset + (remaining + 1) / 2;
            let original_end = donor.end_offset;
            donor.end_offset = split_point - 1;
            Segment::new(donor.task_id, split_point, original_end)
        };

        if self.persistence.upsert_segment(&*donor_ref.lock().await).await.is_err() {
            log_warn!(TAG, "failed to persist shortened donor segment {}", donor_id);
        }
        if self.persistence.upsert_segment(&new_segment).await.is_err() {
            log_warn!(TAG, "failed to persist new split segment {}", new_segment.id);
        }

        let new_id = new_segment.id;
        self.segments.write().await.insert(new_id, Arc::new(Mutex::new(new_segment)));
        log_info!(TAG, "split donor {} -> new segment {}", donor_id, new_id);
        self.spawn_worker(new_id, writer, tx);
    }

    fn spawn_worker(&self, segment_id: Uuid, writer: Arc<SparseWriter>, tx: mpsc::Sender<WorkerOutcome>) {
        self.live_workers.fetch_add(1, Ordering::SeqCst);
        let segments = self.segments.clone();
        let task = self.task.clone();
        let transport = self.transport.clone();
        let limiter = self.limiter.clone();
        let persistence = self.persistence.clone();
        let progress = self.progress.clone();
        let config = self.config.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let outcome = worker_loop(
                segment_id, segments, task, transport, limiter, persistence, progress, config, cancel, writer,
            )
            .await;
            let _ = tx.send(outcome).await;
        });
    }

    pub async fn pause(&self) {
        self.cancel.cancel();
    }

    pub async fn snapshot_task(&self) -> Task {
        self.task.read().await.clone()
    }
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop(
    segment_id: Uuid,
    segments: Arc<RwLock<HashMap<Uuid, SharedSegment>>>,
    task: Arc<RwLock<Task>>,
    transport: Arc<Transport>,
    limiter: Arc<TokenBucket>,
    persistence: Arc<dyn PersistencePort>,
    progress: Arc<ProgressRegistry>,
    config: EngineConfig,
    cancel: CancellationToken,
    writer: Arc<SparseWriter>,
) -> WorkerOutcome {
    let shared_seg = match segments.read().await.get(&segment_id).cloned() {
        Some(s) => s,
        None => return WorkerOutcome::Complete(segment_id),
    };

    let url = task.read().await.url.clone();
    let task_id_for_progress = task.read().await.id;
    let total_size = task.read().await.total_size;

    let mut dirty_bytes = 0u64;
    let mut last_persist = Instant::now();
    let downloaded_counter = Arc::new(AtomicU64::new(0));

    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return WorkerOutcome::Cancelled(segment_id);
        }

        let (start, end_bound) = {
            let seg = shared_seg.lock().await;
            if seg.is_complete() {
                return WorkerOutcome::Complete(segment_id);
            }
            let end = if total_size > 0 { RangeEnd::At(seg.end_offset) } else { RangeEnd::Open };
            (seg.current_offset, end)
        };

        let stream_result = transport.read_range(&url, start, end_bound).await;
        let mut stream = match stream_result {
            Ok(s) => s,
            Err(EngineError::RangeNotSatisfiable) => return WorkerOutcome::RangeRejected(segment_id),
            Err(e) if e.is_retryable() && attempt < config.backoff_max_attempts => {
                attempt += 1;
                tokio::time::sleep(config.backoff_delay(attempt)).await;
                continue;
            }
            Err(e) => return WorkerOutcome::Failed(segment_id, e),
        };

        let mut stream_failed = false;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return WorkerOutcome::Cancelled(segment_id);
                }
                chunk = stream.next() => {
                    match chunk {
                        None => break,
                        Some(Ok(bytes)) => {
                            limiter.acquire(bytes.len() as u64).await;

                            let offset = {
                                let seg = shared_seg.lock().await;
                                seg.current_offset
                            };
                            if let Err(e) = writer.write_at(offset, &bytes).await {
                                return WorkerOutcome::Failed(segment_id, e);
                            }

                            {
                                let mut seg = shared_seg.lock().await;
                                seg.current_offset += bytes.len() as u64;
                            }
                            downloaded_counter.fetch_add(bytes.len() as u64, Ordering::Relaxed);
                            dirty_bytes += bytes.len() as u64;

                            progress.record_bytes(task_id_for_progress, bytes.len() as u64, total_size).await;

                            let should_persist = last_persist.elapsed() >= config.min_save_interval
                                || dirty_bytes >= config.persist_chunk_threshold;
                            if should_persist {
                                let seg_copy = shared_seg.lock().await.clone();
                                let _ = persistence.upsert_segment(&seg_copy).await;
                                dirty_bytes = 0;
                                last_persist = Instant::now();
                            }
                        }
                        Some(Err(e)) => {
                            stream_failed = true;
                            if e.is_retryable() && attempt < config.backoff_max_attempts {
                                attempt += 1;
                                let delay = config.backoff_delay(attempt);
                                drop(stream);
                                tokio::time::sleep(delay).await;
                            } else {
                                return WorkerOutcome::Failed(segment_id, e);
                            }
                            break;
                        }
                    }
                }
            }
        }

        if stream_failed {
            continue; // retry from the now-persisted current_offset
        }

        let seg = shared_seg.lock().await;
        if seg.is_complete() {
            let seg_copy = seg.clone();
            drop(seg);
            let _ = persistence.upsert_segment(&seg_copy).await;
            return WorkerOutcome::Complete(segment_id);
        }
        // Clean EOF short of end_offset (donor was shortened by an
        // in-half split mid-stream): loop back and re-request from the
        // new current_offset against the new, smaller end bound.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{SqlitePersistence, TaskFilter};
    use crate::progress::ProgressRegistry;
    use std::path::PathBuf;
    use std::time::Duration;

    fn test_coordinator() -> TaskCoordinator {
        test_coordinator_with_config(EngineConfig::default())
    }

    fn test_coordinator_with_config(config: EngineConfig) -> TaskCoordinator {
        let task = Task::new("https://example.com/f.bin".into(), PathBuf::from("/tmp/does-not-matter.bin"), 4);
        let persistence: Arc<dyn PersistencePort> = Arc::new(SqlitePersistence::in_memory().unwrap());
        TaskCoordinator::new(
            task,
            Arc::new(Transport::new(Duration::from_secs(1), Duration::from_secs(1))),
            Arc::new(TokenBucket::unlimited()),
            persistence,
            Arc::new(ProgressRegistry::new(Duration::from_millis(200))),
            config,
        )
    }

    #[tokio::test]
    async fn create_initial_segments_divides_evenly_with_remainder_last() {
        let c = test_coordinator();
        let segs = c.create_initial_segments(100, true).await;
        assert_eq!(segs.len(), 4);
        assert_eq!(segs[0].start_offset, 0);
        assert_eq!(segs.last().unwrap().end_offset, 99);
        let total: u64 = segs.iter().map(|s| s.end_offset - s.start_offset + 1).sum();
        assert_eq!(total, 100);
    }

    #[tokio::test]
    async fn no_range_support_yields_single_segment() {
        let c = test_coordinator();
        let segs = c.create_initial_segments(100, false).await;
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].start_offset, 0);
        assert_eq!(segs[0].end_offset, 99);
    }

    #[tokio::test]
    async fn unknown_length_yields_single_open_segment() {
        let c = test_coordinator();
        let segs = c.create_initial_segments(0, true).await;
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].start_offset, 0);
    }

    #[tokio::test]
    async fn split_picks_largest_remaining_and_preserves_union() {
        let mut cfg = EngineConfig::default();
        cfg.min_split_threshold = 10; // low threshold so a 100-byte donor in this test qualifies
        let c = test_coordinator_with_config(cfg);
        let task_id = c.task_id().await;
        let donor = Segment::new(task_id, 0, 99);
        let other = Segment::new(task_id, 100, 109);
        {
            let mut table = c.segments.write().await;
            table.insert(donor.id, Arc::new(Mutex::new(donor.clone())));
            table.insert(other.id, Arc::new(Mutex::new(other.clone())));
        }
        // configured connections is 4 (>1 live worker), so split proceeds.
        let (tx, _rx) = mpsc::channel(4);
        let writer_path = std::env::temp_dir().join(format!("multiget-test-{}.bin", Uuid::new_v4()));
        let writer = Arc::new(SparseWriter::open(&writer_path, 110).await.unwrap());
        c.maybe_split_and_spawn(writer, tx).await;

        let table = c.segments.read().await;
        assert_eq!(table.len(), 3);
        let mut ranges: Vec<(u64, u64)> = Vec::new();
        for seg in table.values() {
            let seg = seg.lock().await;
            ranges.push((seg.start_offset, seg.end_offset));
        }
        ranges.sort();
        // union must still equal [0, 109]
        assert_eq!(ranges[0].0, 0);
        assert_eq!(ranges.last().unwrap().1, 109);
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].1 + 1, pair[1].0);
        }
        let _ = tokio::fs::remove_file(&writer_path).await;
    }

    #[tokio::test]
    async fn split_refuses_below_threshold() {
        let c = test_coordinator();
        let task_id = c.task_id().await;
        let donor = Segment::new(task_id, 0, 9); // 10 bytes, far below 1 MiB threshold
        {
            let mut table = c.segments.write().await;
            table.insert(donor.id, Arc::new(Mutex::new(donor)));
        }
        let (tx, _rx) = mpsc::channel(4);
        let writer_path = std::env::temp_dir().join(format!("multiget-test-{}.bin", Uuid::new_v4()));
        let writer = Arc::new(SparseWriter::open(&writer_path, 10).await.unwrap());
        c.maybe_split_and_spawn(writer, tx).await;
        assert_eq!(c.segments.read().await.len(), 1);
        let _ = tokio::fs::remove_file(&writer_path).await;
    }

    #[tokio::test]
    async fn split_skips_when_live_workers_meet_configured_connections() {
        let c = test_coordinator();
        c.live_workers.store(4, Ordering::SeqCst); // == configured connections
        let task_id = c.task_id().await;
        let donor = Segment::new(task_id, 0, 99);
        {
            let mut table = c.segments.write().await;
            table.insert(donor.id, Arc::new(Mutex::new(donor)));
        }
        let (tx, _rx) = mpsc::channel(4);
        let writer_path = std::env::temp_dir().join(format!("multiget-test-{}.bin", Uuid::new_v4()));
        let writer = Arc::new(SparseWriter::open(&writer_path, 100).await.unwrap());
        c.maybe_split_and_spawn(writer, tx).await;
        assert_eq!(c.segments.read().await.len(), 1);
        let _ = tokio::fs::remove_file(&writer_path).await;
    }

    #[test]
    fn queue_id_filter_unused_import_guard() {
        let _ = TaskFilter::default();
    }
}
