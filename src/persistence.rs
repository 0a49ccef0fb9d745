//! Persistence Port.
//!
//! Abstract store for task metadata and the segment map, plus a
//! `rusqlite`-backed implementation. Grounded on this codebase's
//! `host_reputation.rs` module (`Arc<Mutex<Connection>>`,
//! `CREATE TABLE IF NOT EXISTS`, `INSERT ... ON CONFLICT DO UPDATE`) —
//! the original `database.rs` that `lib.rs` referenced was not present
//! in the retrieved tree, so that sibling module is the grounding source
//! for the SQL idiom instead.

use crate::error::EngineResult;
use crate::model::{Segment, Task, TaskStatus, Validators};
use async_trait::async_trait;
use rusqlite::{params, Connection};
use std::path::PathBuf;
use std::sync::Arc;
use std::str::FromStr;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Default, Clone)]
pub struct TaskFilter {
    pub queue_id: Option<String>,
    pub status: Option<TaskStatus>,
}

#[async_trait]
pub trait PersistencePort: Send + Sync {
    async fn upsert_task(&self, task: &Task) -> EngineResult<()>;
    async fn load_tasks(&self, filter: &TaskFilter) -> EngineResult<Vec<Task>>;
    async fn upsert_segment(&self, segment: &Segment) -> EngineResult<()>;
    async fn load_segments(&self, task_id: Uuid) -> EngineResult<Vec<Segment>>;
    async fn delete_task(&self, task_id: Uuid) -> EngineResult<()>;
}

pub struct SqlitePersistence {
    conn: Arc<Mutex<Connection>>,
}

impl SqlitePersistence {
    pub fn open(path: &std::path::Path) -> EngineResult<Self> {
        let conn = Connection::open(path)?;
        let this = Self { conn: Arc::new(Mutex::new(conn)) };
        this.initialize_tables_sync()?;
        Ok(this)
    }

    pub fn in_memory() -> EngineResult<Self> {
        let conn = Connection::open_in_memory()?;
        let this = Self { conn: Arc::new(Mutex::new(conn)) };
        this.initialize_tables_sync()?;
        Ok(this)
    }

    fn initialize_tables_sync(&self) -> EngineResult<()> {
        let conn = self.conn.try_lock().expect("fresh connection, uncontended");
        conn.execute(
            "CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                url TEXT NOT NULL,
                destination_path TEXT NOT NULL,
                total_size INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                etag TEXT,
                last_modified TEXT,
                cookies TEXT NOT NULL DEFAULT '[]',
                headers TEXT NOT NULL DEFAULT '[]',
                priority INTEGER NOT NULL DEFAULT 0,
                queue_id TEXT,
                created_at INTEGER NOT NULL,
                error_message TEXT,
                supports_resume INTEGER NOT NULL DEFAULT 0,
                connections INTEGER NOT NULL DEFAULT 8
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tasks_queue ON tasks(queue_id)",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS segments (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL,
                start_offset INTEGER NOT NULL,
                end_offset INTEGER NOT NULL,
                current_offset INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_segments_task ON segments(task_id)",
            [],
        )?;
        Ok(())
    }

    fn status_to_str(status: TaskStatus) -> &'static str {
        match status {
            TaskStatus::Pending => "pending",
            TaskStatus::Connecting => "connecting",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Complete => "complete",
            TaskStatus::Error => "error",
            TaskStatus::Extracting => "extracting",
        }
    }

    fn status_from_str(s: &str) -> TaskStatus {
        match s {
            "connecting" => TaskStatus::Connecting,
            "running" => TaskStatus::Running,
            "paused" => TaskStatus::Paused,
            "complete" => TaskStatus::Complete,
            "error" => TaskStatus::Error,
            "extracting" => TaskStatus::Extracting,
            _ => TaskStatus::Pending,
        }
    }
}

#[async_trait]
impl PersistencePort for SqlitePersistence {
    async fn upsert_task(&self, task: &Task) -> EngineResult<()> {
        let conn = self.conn.lock().await;
        let cookies = serde_json::to_string(&task.cookies).unwrap_or_else(|_| "[]".into());
        let headers = serde_json::to_string(&task.headers).unwrap_or_else(|_| "[]".into());
        conn.execute(
            "INSERT INTO tasks
             (id, url, destination_path, total_size, status, etag, last_modified,
              cookies, headers, priority, queue_id, created_at, error_message,
              supports_resume, connections)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
             ON CONFLICT(id) DO UPDATE SET
                url = excluded.url,
                destination_path = excluded.destination_path,
                total_size = excluded.total_size,
                status = excluded.status,
                etag = excluded.etag,
                last_modified = excluded.last_modified,
                cookies = excluded.cookies,
                headers = excluded.headers,
                priority = excluded.priority,
                queue_id = excluded.queue_id,
                error_message = excluded.error_message,
                supports_resume = excluded.supports_resume,
                connections = excluded.connections",
            params![
                task.id.to_string(),
                task.url,
                task.destination_path.to_string_lossy().to_string(),
                task.total_size as i64,
                Self::status_to_str(task.status),
                task.validators.etag,
                task.validators.last_modified,
                cookies,
                headers,
                task.priority,
                task.queue_id,
                task.created_at.timestamp(),
                task.error_message,
                task.supports_resume as i32,
                task.connections as i32,
            ],
        )?;
        Ok(())
    }

    async fn load_tasks(&self, filter: &TaskFilter) -> EngineResult<Vec<Task>> {
        let conn = self.conn.lock().await;
        let mut sql = String::from(
            "SELECT id, url, destination_path, total_size, status, etag, last_modified,
                    cookies, headers, priority, queue_id, created_at, error_message,
                    supports_resume, connections FROM tasks WHERE 1=1",
        );
        if filter.queue_id.is_some() {
            sql.push_str(" AND queue_id = ?1");
        }
        if filter.status.is_some() {
            sql.push_str(if filter.queue_id.is_some() { " AND status = ?2" } else { " AND status = ?1" });
        }

        let mut stmt = conn.prepare(&sql)?;
        let status_str = filter.status.map(Self::status_to_str);

        let map_row = |row: &rusqlite::Row| -> rusqlite::Result<Task> {
            let id_str: String = row.get(0)?;
            let dest: String = row.get(2)?;
            let cookies_json: String = row.get(7)?;
            let headers_json: String = row.get(8)?;
            let created_ts: i64 = row.get(11)?;
            Ok(Task {
                id: Uuid::from_str(&id_str).unwrap_or_else(|_| Uuid::new_v4()),
                url: row.get(1)?,
                destination_path: PathBuf::from(dest),
                total_size: row.get::<_, i64>(3)? as u64,
                status: Self::status_from_str(&row.get::<_, String>(4)?),
                validators: Validators { etag: row.get(5)?, last_modified: row.get(6)? },
                cookies: serde_json::from_str(&cookies_json).unwrap_or_default(),
                headers: serde_json::from_str(&headers_json).unwrap_or_default(),
                priority: row.get(9)?,
                queue_id: row.get(10)?,
                created_at: chrono::DateTime::from_timestamp(created_ts, 0).unwrap_or_else(chrono::Utc::now),
                error_message: row.get(12)?,
                supports_resume: row.get::<_, i32>(13)? != 0,
                connections: row.get::<_, i32>(14)? as u8,
            })
        };

        let rows: Vec<Task> = match (&filter.queue_id, status_str) {
            (Some(q), Some(s)) => stmt
                .query_map(params![q, s], map_row)?
                .filter_map(|r| r.ok())
                .collect(),
            (Some(q), None) => stmt.query_map(params![q], map_row)?.filter_map(|r| r.ok()).collect(),
            (None, Some(s)) => stmt.query_map(params![s], map_row)?.filter_map(|r| r.ok()).collect(),
            (None, None) => stmt.query_map([], map_row)?.filter_map(|r| r.ok()).collect(),
        };

        Ok(rows)
    }

    async fn upsert_segment(&self, segment: &Segment) -> EngineResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO segments (id, task_id, start_offset, end_offset, current_offset)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                current_offset = excluded.current_offset,
                end_offset = excluded.end_offset",
            params![
                segment.id.to_string(),
                segment.task_id.to_string(),
                segment.start_offset as i64,
                segment.end_offset as i64,
                segment.current_offset as i64,
            ],
        )?;
        Ok(())
    }

    async fn load_segments(&self, task_id: Uuid) -> EngineResult<Vec<Segment>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, task_id, start_offset, end_offset, current_offset
             FROM segments WHERE task_id = ?1 ORDER BY start_offset ASC",
        )?;
        let rows = stmt
            .query_map(params![task_id.to_string()], |row| {
                let id_str: String = row.get(0)?;
                let task_str: String = row.get(1)?;
                Ok(Segment {
                    id: Uuid::from_str(&id_str).unwrap_or_else(|_| Uuid::new_v4()),
                    task_id: Uuid::from_str(&task_str).unwrap_or(task_id),
                    start_offset: row.get::<_, i64>(2)? as u64,
                    end_offset: row.get::<_, i64>(3)? as u64,
                    current_offset: row.get::<_, i64>(4)? as u64,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    async fn delete_task(&self, task_id: Uuid) -> EngineResult<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM segments WHERE task_id = ?1", params![task_id.to_string()])?;
        conn.execute("DELETE FROM tasks WHERE id = ?1", params![task_id.to_string()])?;
        Ok(())
    }
}
