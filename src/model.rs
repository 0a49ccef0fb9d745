//! Core data model: Task, Segment, Queue, Progress Snapshot.
//!
//! Segment carries a stable id and derives `is_complete` from its offsets
//! rather than storing a redundant flag — the old `ChunkWork.completed`
//! field in this codebase's SNDE engine duplicated what its offsets
//! already implied, which is exactly the class of bug these invariants
//! guard against.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Connecting,
    Running,
    Paused,
    Complete,
    Error,
    Extracting,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Validators {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl Validators {
    /// True if `other` indicates the remote resource has changed relative
    /// to `self`. ETag compared first, then Last-Modified, per the
    /// validator policy in the coordinator's startup sequence.
    pub fn changed(&self, other: &Validators, content_length_changed: bool) -> bool {
        if let (Some(a), Some(b)) = (&self.etag, &other.etag) {
            return a != b;
        }
        if let (Some(a), Some(b)) = (&self.last_modified, &other.last_modified) {
            return a != b;
        }
        content_length_changed
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub url: String,
    pub destination_path: std::path::PathBuf,
    pub total_size: u64,
    pub status: TaskStatus,
    pub validators: Validators,
    pub cookies: Vec<(String, String)>,
    pub priority: i32,
    pub queue_id: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub error_message: Option<String>,
    pub supports_resume: bool,
    pub connections: u8,
    pub headers: Vec<(String, String)>,
}

impl Task {
    pub fn new(url: String, destination_path: std::path::PathBuf, connections: u8) -> Self {
        Self {
            id: Uuid::new_v4(),
            url,
            destination_path,
            total_size: 0,
            status: TaskStatus::Pending,
            validators: Validators::default(),
            cookies: Vec::new(),
            priority: 0,
            queue_id: None,
            created_at: chrono::Utc::now(),
            error_message: None,
            supports_resume: false,
            connections,
            headers: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_queue(mut self, queue_id: impl Into<String>) -> Self {
        self.queue_id = Some(queue_id.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub id: Uuid,
    pub task_id: Uuid,
    pub start_offset: u64,
    pub end_offset: u64,
    pub current_offset: u64,
}

impl Segment {
    pub fn new(task_id: Uuid, start_offset: u64, end_offset: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            start_offset,
            end_offset,
            current_offset: start_offset,
        }
    }

    /// A segment whose current_offset has passed end_offset is terminal;
    /// its worker has exited cleanly. Derived, never stored.
    pub fn is_complete(&self) -> bool {
        self.current_offset > self.end_offset
    }

    pub fn remaining(&self) -> u64 {
        self.end_offset.saturating_sub(self.current_offset) + 1
    }

    /// Invariant check: start <= current <= end + 1.
    pub fn offsets_valid(&self) -> bool {
        self.start_offset <= self.current_offset && self.current_offset <= self.end_offset + 1
    }
}

/// Checks the §8 quantified invariants across a task's segment set.
/// `total_size` is `None` when the task's length is unknown.
pub fn segments_are_consistent(segments: &[Segment], total_size: Option<u64>) -> bool {
    let mut sorted: Vec<&Segment> = segments.iter().collect();
    sorted.sort_by_key(|s| s.start_offset);

    for s in &sorted {
        if !s.offsets_valid() {
            return false;
        }
    }

    for pair in sorted.windows(2) {
        if pair[0].end_offset >= pair[1].start_offset {
            return false; // overlap
        }
    }

    if let Some(total) = total_size {
        if sorted.is_empty() {
            return total == 0;
        }
        if sorted.first().unwrap().start_offset != 0 {
            return false;
        }
        if sorted.last().unwrap().end_offset + 1 != total {
            return false;
        }
        for pair in sorted.windows(2) {
            if pair[0].end_offset + 1 != pair[1].start_offset {
                return false; // gap
            }
        }
    }

    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueMode {
    Parallel,
    Sequential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PostProcessAction {
    None,
    Sleep,
    Shutdown,
    RunScript,
    Notify,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Queue {
    pub name: String,
    pub max_concurrent: u8,
    pub mode: QueueMode,
    pub is_active: bool,
    pub is_sync_queue: bool,
    pub check_interval_secs: Option<u64>,
    pub last_check: Option<chrono::DateTime<chrono::Utc>>,
    pub post_process_action: PostProcessAction,
    pub post_process_script_path: Option<std::path::PathBuf>,
    pub post_process_executed: bool,
}

impl Queue {
    pub fn new(name: impl Into<String>, max_concurrent: u8, mode: QueueMode) -> Self {
        Self {
            name: name.into(),
            max_concurrent,
            mode,
            is_active: true,
            is_sync_queue: false,
            check_interval_secs: None,
            last_check: None,
            post_process_action: PostProcessAction::None,
            post_process_script_path: None,
            post_process_executed: false,
        }
    }

    /// `maxConcurrent`, or 1 in sequential mode, per §4.5.
    pub fn effective_limit(&self) -> u8 {
        match self.mode {
            QueueMode::Sequential => 1,
            QueueMode::Parallel => self.max_concurrent,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub bytes_per_second: f64,
    pub eta_seconds: Option<u64>,
}

pub type ProgressTable = HashMap<Uuid, ProgressSnapshot>;

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(task: Uuid, start: u64, end: u64, current: u64) -> Segment {
        Segment { id: Uuid::new_v4(), task_id: task, start_offset: start, end_offset: end, current_offset: current }
    }

    #[test]
    fn is_complete_derived_from_offsets() {
        let t = Uuid::new_v4();
        let s = seg(t, 0, 9, 10);
        assert!(s.is_complete());
        let s2 = seg(t, 0, 9, 9);
        assert!(!s2.is_complete());
    }

    #[test]
    fn consistent_segments_cover_full_range() {
        let t = Uuid::new_v4();
        let segs = vec![seg(t, 0, 49, 0), seg(t, 50, 99, 50)];
        assert!(segments_are_consistent(&segs, Some(100)));
    }

    #[test]
    fn overlapping_segments_rejected() {
        let t = Uuid::new_v4();
        let segs = vec![seg(t, 0, 60, 0), seg(t, 50, 99, 50)];
        assert!(!segments_are_consistent(&segs, Some(100)));
    }

    #[test]
    fn gap_in_segments_rejected() {
        let t = Uuid::new_v4();
        let segs = vec![seg(t, 0, 40, 0), seg(t, 50, 99, 50)];
        assert!(!segments_are_consistent(&segs, Some(100)));
    }

    #[test]
    fn effective_limit_sequential_is_one() {
        let q = Queue::new("seq", 5, QueueMode::Sequential);
        assert_eq!(q.effective_limit(), 1);
    }
}
