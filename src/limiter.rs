//! Token-Bucket Limiter.
//!
//! Process-wide pacing primitive. No teacher analogue exists (the old
//! SNDE engine downloaded unthrottled) — built in this codebase's usual
//! singleton shape, an `Arc<Mutex<State>>`, with `tokio::sync::Notify`
//! standing in for the `Semaphore`-style "block until available" wait
//! the scheduler already uses for a structurally similar problem.

use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

#[derive(Debug)]
struct BucketState {
    capacity_bytes: f64,
    refill_bytes_per_second: f64,
    current_tokens: f64,
    last_refill: Instant,
}

pub struct TokenBucket {
    state: Mutex<BucketState>,
    notify: Notify,
}

impl TokenBucket {
    /// A bytes_per_second of 0 disables limiting.
    pub fn new(bytes_per_second: u64) -> Self {
        let capacity = if bytes_per_second == 0 { 0.0 } else { bytes_per_second as f64 * 2.0 };
        Self {
            state: Mutex::new(BucketState {
                capacity_bytes: capacity,
                refill_bytes_per_second: bytes_per_second as f64,
                current_tokens: capacity,
                last_refill: Instant::now(),
            }),
            notify: Notify::new(),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    /// bytesPerSecond=0 disables limiting; otherwise capacity is a
    /// 2-second burst and the bucket is topped up to the new capacity.
    pub async fn set_limit(&self, bytes_per_second: u64) {
        let mut state = self.state.lock().await;
        let capacity = if bytes_per_second == 0 { 0.0 } else { bytes_per_second as f64 * 2.0 };
        state.capacity_bytes = capacity;
        state.refill_bytes_per_second = bytes_per_second as f64;
        state.current_tokens = state.current_tokens.min(capacity).max(0.0);
        state.last_refill = Instant::now();
        self.notify.notify_waiters();
    }

    fn refill(state: &mut BucketState) {
        if state.refill_bytes_per_second <= 0.0 {
            return;
        }
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.current_tokens =
            (state.current_tokens + elapsed * state.refill_bytes_per_second).min(state.capacity_bytes);
        state.last_refill = now;
    }

    /// Suspends the caller until at least `n` tokens are available, then
    /// subtracts them. Disabled limiters (rate == 0) return immediately.
    pub async fn acquire(&self, n: u64) {
        let n = n as f64;
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                if state.refill_bytes_per_second <= 0.0 {
                    return; // unlimited
                }
                Self::refill(&mut state);
                if state.current_tokens >= n {
                    state.current_tokens -= n;
                    return;
                }
                let deficit = n - state.current_tokens;
                deficit / state.refill_bytes_per_second
            };

            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_secs_f64(wait.max(0.001))) => {}
                _ = self.notify.notified() => {}
            }
        }
    }
}

impl Default for TokenBucket {
    fn default() -> Self {
        Self::unlimited()
    }
}
