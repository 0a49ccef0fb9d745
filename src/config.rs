//! Engine-wide tunables.
//!
//! Mirrors the teacher's top-of-file `const` blocks (see the old
//! `snde.rs`/`scheduler.rs` constants) but as an overridable struct,
//! since this crate supports more than one concurrent task shape.

use std::time::Duration;

/// Minimum remaining-bytes threshold below which the in-half rule
/// refuses to split a segment further (suggested 1 MiB in the design).
pub const MIN_SPLIT_THRESHOLD: u64 = 1024 * 1024;

/// Cap on initial segments per task, independent of requested connections.
pub const MAX_SEGMENTS: u8 = 32;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Default requested connection count when a request doesn't specify one.
    pub default_connections: u8,
    /// Hard cap on segments for a single task.
    pub max_segments: u8,
    /// Minimum remaining bytes a donor segment must have to be split.
    pub min_split_threshold: u64,
    /// Minimum time between persisted currentOffset updates for a segment.
    pub min_save_interval: Duration,
    /// Dirty-byte threshold that forces a persist regardless of timing.
    pub persist_chunk_threshold: u64,
    /// Backoff base delay for transient worker errors.
    pub backoff_base: Duration,
    /// Backoff multiplicative factor.
    pub backoff_factor: f64,
    /// Backoff jitter, as a fraction of the computed delay (e.g. 0.2 = +-20%).
    pub backoff_jitter: f64,
    /// Backoff delay cap.
    pub backoff_cap: Duration,
    /// Maximum retry attempts before a transient error is surfaced as terminal.
    pub backoff_max_attempts: u32,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Per-chunk idle read timeout.
    pub idle_timeout: Duration,
    /// Progress snapshot publish throttle.
    pub progress_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_connections: 8,
            max_segments: MAX_SEGMENTS,
            min_split_threshold: MIN_SPLIT_THRESHOLD,
            min_save_interval: Duration::from_secs(1),
            persist_chunk_threshold: 256 * 1024,
            backoff_base: Duration::from_millis(500),
            backoff_factor: 2.0,
            backoff_jitter: 0.2,
            backoff_cap: Duration::from_secs(30),
            backoff_max_attempts: 6,
            connect_timeout: Duration::from_secs(15),
            idle_timeout: Duration::from_secs(30),
            progress_interval: Duration::from_millis(200),
        }
    }
}

impl EngineConfig {
    /// Overlay a handful of environment variables onto the defaults, the
    /// way the teacher reads its few runtime toggles directly with
    /// `std::env::var` rather than a config-file layer.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(v) = std::env::var("MULTIGET_DEFAULT_CONNECTIONS") {
            if let Ok(n) = v.parse() {
                cfg.default_connections = n;
            }
        }
        if let Ok(v) = std::env::var("MULTIGET_MAX_SEGMENTS") {
            if let Ok(n) = v.parse() {
                cfg.max_segments = n;
            }
        }
        cfg
    }

    /// Compute the backoff delay for a given attempt (0-indexed), with jitter applied.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let raw = self.backoff_base.as_secs_f64() * self.backoff_factor.powi(attempt as i32);
        let capped = raw.min(self.backoff_cap.as_secs_f64());
        let jitter_span = capped * self.backoff_jitter;
        let jitter = rand::random::<f64>() * 2.0 * jitter_span - jitter_span;
        Duration::from_secs_f64((capped + jitter).max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let cfg = EngineConfig::default();
        for attempt in 0..cfg.backoff_max_attempts {
            let d = cfg.backoff_delay(attempt);
            assert!(d.as_secs_f64() <= cfg.backoff_cap.as_secs_f64() * (1.0 + cfg.backoff_jitter));
        }
    }

    #[test]
    fn defaults_match_spec_suggestions() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.min_split_threshold, 1024 * 1024);
        assert_eq!(cfg.max_segments, 32);
        assert_eq!(cfg.backoff_max_attempts, 6);
    }
}
