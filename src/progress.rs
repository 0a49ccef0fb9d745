//! Progress Broadcaster.
//!
//! Throttled in-memory snapshot registry. The coordinator publishes no
//! more than once per `interval` (default 200ms) from a rolling byte
//! window; consumers read the latest snapshot and never block.
//!
//! Grounded on `snde.rs`'s progress-reporting task (byte delta over
//! elapsed time on a fixed tick) and `health_metrics.rs`'s
//! `Arc<RwLock<HashMap<..>>>` registry shape, tightened from the
//! teacher's flat 250ms tick to the spec's 200ms throttle and given a
//! rolling window instead of a single last-tick delta.

use crate::model::ProgressSnapshot;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use uuid::Uuid;

struct Window {
    downloaded_bytes: u64,
    total_bytes: u64,
    samples: Vec<(Instant, u64)>, // (time, cumulative bytes at that time)
    last_published: Option<Instant>,
    last_snapshot: Option<ProgressSnapshot>,
}

pub struct ProgressRegistry {
    windows: RwLock<HashMap<Uuid, Window>>,
    interval: Duration,
    window_span: Duration,
}

impl ProgressRegistry {
    pub fn new(interval: Duration) -> Self {
        Self {
            windows: RwLock::new(HashMap::new()),
            interval,
            window_span: Duration::from_millis(1500),
        }
    }

    /// Records newly-written bytes for a task. Recomputes and republishes
    /// the snapshot only if the publish throttle interval has elapsed.
    pub async fn record_bytes(&self, task_id: Uuid, len: u64, total_bytes: u64) {
        let mut windows = self.windows.write().await;
        let now = Instant::now();
        let entry = windows.entry(task_id).or_insert_with(|| Window {
            downloaded_bytes: 0,
            total_bytes,
            samples: Vec::new(),
            last_published: None,
            last_snapshot: None,
        });

        entry.downloaded_bytes += len;
        entry.total_bytes = total_bytes;
        entry.samples.push((now, entry.downloaded_bytes));
        entry.samples.retain(|(t, _)| now.duration_since(*t) <= self.window_span);

        let should_publish = entry
            .last_published
            .map(|last| now.duration_since(last) >= self.interval)
            .unwrap_or(true);

        if should_publish {
            let bps = Self::compute_rate(&entry.samples);
            let remaining = entry.total_bytes.saturating_sub(entry.downloaded_bytes);
            let eta = if bps > 0.0 && entry.total_bytes > 0 {
                Some((remaining as f64 / bps) as u64)
            } else {
                None
            };
            entry.last_snapshot = Some(ProgressSnapshot {
                downloaded_bytes: entry.downloaded_bytes,
                total_bytes: entry.total_bytes,
                bytes_per_second: bps,
                eta_seconds: eta,
            });
            entry.last_published = Some(now);
        }
    }

    fn compute_rate(samples: &[(Instant, u64)]) -> f64 {
        if samples.len() < 2 {
            return 0.0;
        }
        let (t0, b0) = samples[0];
        let (t1, b1) = samples[samples.len() - 1];
        let elapsed = t1.duration_since(t0).as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        (b1.saturating_sub(b0)) as f64 / elapsed
    }

    /// Never blocks; returns the most recent published value or None.
    pub async fn snapshot(&self, task_id: Uuid) -> Option<ProgressSnapshot> {
        self.windows.read().await.get(&task_id).and_then(|w| w.last_snapshot.clone())
    }

    pub async fn clear(&self, task_id: Uuid) {
        self.windows.write().await.remove(&task_id);
    }
}

pub type SharedProgressRegistry = Arc<ProgressRegistry>;
