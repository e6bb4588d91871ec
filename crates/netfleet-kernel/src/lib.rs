use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use netfleet_core::model::{Device, Task, TaskFilter, TaskPatch};
use netfleet_core::ports::{DeviceRepository, TaskRepository};

/// SQLite-backed store for tasks, the device inventory, cancel requests and
/// the event journal. Cheap to clone; every call opens its own connection.
#[derive(Clone)]
pub struct Kernel {
    db_path: PathBuf,
    busy: Duration,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EventRow {
    pub id: i64,
    pub time: String,
    pub kind: String,
    pub task_id: Option<String>,
    pub payload: serde_json::Value,
}

/// Cancellation asked for out of process (e.g. by the CLI), picked up by the daemon.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CancelRequest {
    pub id: i64,
    pub task_id: String,
    pub user_id: Option<String>,
    pub requested_at: String,
}

const TASK_COLUMNS: &str =
    "id,kind,status,payload,progress,error,start_time,end_time,user_id,created_at";

struct TaskColumns {
    id: String,
    kind: String,
    status: String,
    payload: String,
    progress: f64,
    error: Option<String>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    user_id: Option<String>,
    created_at: DateTime<Utc>,
}

impl TaskColumns {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            kind: row.get(1)?,
            status: row.get(2)?,
            payload: row.get(3)?,
            progress: row.get(4)?,
            error: row.get(5)?,
            start_time: row.get(6)?,
            end_time: row.get(7)?,
            user_id: row.get(8)?,
            created_at: row.get(9)?,
        })
    }

    fn into_task(self) -> Result<Task> {
        Ok(Task {
            kind: self.kind.parse()?,
            status: self.status.parse()?,
            payload: serde_json::from_str(&self.payload)
                .with_context(|| format!("task {} has an unreadable payload", self.id))?,
            id: self.id,
            progress: self.progress,
            error: self.error,
            start_time: self.start_time,
            end_time: self.end_time,
            user_id: self.user_id,
            created_at: self.created_at,
        })
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(",")
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

impl Kernel {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating state dir {}", dir.display()))?;
        let db_path = dir.join("netfleet.sqlite");
        // Busy timeout (default 5000ms; override with NETFLEET_SQLITE_BUSY_MS)
        let busy_ms: u64 = std::env::var("NETFLEET_SQLITE_BUSY_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5000);
        let kernel = Self {
            db_path,
            busy: Duration::from_millis(busy_ms),
        };
        let conn = kernel.conn()?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        let _ = conn.pragma_update(None, "temp_store", "MEMORY");
        Self::init_schema(&conn)?;
        tracing::debug!(path = %kernel.db_path.display(), "kernel opened");
        Ok(kernel)
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
              id TEXT PRIMARY KEY,
              kind TEXT NOT NULL,
              status TEXT NOT NULL,
              device_id TEXT NOT NULL,
              payload TEXT NOT NULL,      -- JSON TaskPayload
              progress REAL NOT NULL DEFAULT 0,
              error TEXT,
              start_time TEXT,
              end_time TEXT,
              user_id TEXT,
              created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
            CREATE INDEX IF NOT EXISTS idx_tasks_device ON tasks(device_id);
            CREATE INDEX IF NOT EXISTS idx_tasks_created ON tasks(created_at);

            -- Device inventory as last written by the controller sync
            CREATE TABLE IF NOT EXISTS devices (
              id TEXT PRIMARY KEY,
              record TEXT NOT NULL,
              updated TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS cancel_requests (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              task_id TEXT NOT NULL,
              user_id TEXT,
              requested_at TEXT NOT NULL,
              handled INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_cancel_pending ON cancel_requests(handled);

            CREATE TABLE IF NOT EXISTS events (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              time TEXT NOT NULL,
              kind TEXT NOT NULL,
              task_id TEXT,
              payload TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_kind ON events(kind);
            CREATE INDEX IF NOT EXISTS idx_events_task ON events(task_id);
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(self.busy)?;
        Ok(conn)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    // ---------------- Tasks ----------------

    pub fn insert_task(&self, task: &Task) -> Result<()> {
        let conn = self.conn()?;
        let payload = serde_json::to_string(&task.payload)?;
        conn.execute(
            "INSERT INTO tasks(id,kind,status,device_id,payload,progress,error,start_time,end_time,user_id,created_at) VALUES (?,?,?,?,?,?,?,?,?,?,?)",
            params![
                task.id,
                task.kind.as_str(),
                task.status.as_str(),
                task.device_id(),
                payload,
                task.progress,
                task.error,
                task.start_time,
                task.end_time,
                task.user_id,
                task.created_at,
            ],
        )
        .with_context(|| format!("inserting task {}", task.id))?;
        Ok(())
    }

    pub fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE id=? LIMIT 1"
        ))?;
        let cols = stmt.query_row([id], TaskColumns::read).optional()?;
        cols.map(TaskColumns::into_task).transpose()
    }

    /// Tasks matching `filter`, oldest first.
    pub fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let mut clauses: Vec<String> = Vec::new();
        let mut args: Vec<String> = Vec::new();
        if let Some(ids) = &filter.ids {
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            clauses.push(format!("id IN ({})", placeholders(ids.len())));
            args.extend(ids.iter().cloned());
        }
        if let Some(statuses) = &filter.statuses {
            if statuses.is_empty() {
                return Ok(Vec::new());
            }
            clauses.push(format!("status IN ({})", placeholders(statuses.len())));
            args.extend(statuses.iter().map(|s| s.as_str().to_string()));
        }
        if let Some(kind) = filter.kind {
            clauses.push("kind=?".into());
            args.push(kind.as_str().to_string());
        }
        if let Some(device_id) = &filter.device_id {
            clauses.push("device_id=?".into());
            args.push(device_id.clone());
        }
        let mut sql = format!("SELECT {TASK_COLUMNS} FROM tasks");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at ASC, rowid ASC");

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), TaskColumns::read)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?.into_task()?);
        }
        Ok(out)
    }

    /// Merge `patch` into the stored task and return the result.
    pub fn update_task(&self, patch: &TaskPatch) -> Result<Task> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut task = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE id=? LIMIT 1"
            ))?;
            stmt.query_row([patch.id.as_str()], TaskColumns::read)
                .optional()?
                .ok_or_else(|| anyhow!("task {} does not exist", patch.id))?
                .into_task()?
        };
        task.apply(patch);
        tx.execute(
            "UPDATE tasks SET status=?, progress=?, error=?, start_time=?, end_time=?, user_id=? WHERE id=?",
            params![
                task.status.as_str(),
                task.progress,
                task.error,
                task.start_time,
                task.end_time,
                task.user_id,
                task.id,
            ],
        )?;
        tx.commit()?;
        Ok(task)
    }

    // ---------------- Devices ----------------

    pub fn upsert_device(&self, device: &Device) -> Result<()> {
        let conn = self.conn()?;
        let record = serde_json::to_string(device)?;
        conn.execute(
            "INSERT INTO devices(id,record,updated) VALUES(?,?,?) \
             ON CONFLICT(id) DO UPDATE SET record=excluded.record, updated=excluded.updated",
            params![device.id, record, now_rfc3339()],
        )?;
        Ok(())
    }

    pub fn get_device(&self, id: &str) -> Result<Option<Device>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT record FROM devices WHERE id=? LIMIT 1")?;
        let record: Option<String> = stmt.query_row([id], |row| row.get(0)).optional()?;
        record
            .map(|s| serde_json::from_str(&s).with_context(|| format!("device {id} record")))
            .transpose()
    }

    pub fn list_devices(&self) -> Result<Vec<Device>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id,record FROM devices ORDER BY id ASC")?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let id: String = row.get(0)?;
            let record: String = row.get(1)?;
            match serde_json::from_str::<Device>(&record) {
                Ok(device) => out.push(device),
                Err(err) => tracing::warn!(%id, error = %err, "skipping unreadable device record"),
            }
        }
        Ok(out)
    }

    // ---------------- Cancel requests ----------------

    pub fn request_cancel(&self, task_id: &str, user_id: Option<&str>) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO cancel_requests(task_id,user_id,requested_at) VALUES(?,?,?)",
            params![task_id, user_id, now_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Unhandled requests in the order they were made.
    pub fn pending_cancels(&self, limit: i64) -> Result<Vec<CancelRequest>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id,task_id,user_id,requested_at FROM cancel_requests WHERE handled=0 ORDER BY id ASC LIMIT ?",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok(CancelRequest {
                id: row.get(0)?,
                task_id: row.get(1)?,
                user_id: row.get(2)?,
                requested_at: row.get(3)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn mark_cancel_handled(&self, id: i64) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE cancel_requests SET handled=1 WHERE id=? AND handled=0",
            params![id],
        )?;
        Ok(n > 0)
    }

    // ---------------- Event journal ----------------

    pub fn append_event(&self, env: &netfleet_events::Envelope) -> Result<i64> {
        let conn = self.conn()?;
        let payload = serde_json::to_string(&env.payload).unwrap_or("{}".to_string());
        conn.execute(
            "INSERT INTO events(time,kind,task_id,payload) VALUES (?,?,?,?)",
            params![env.time, env.kind, env.task_id(), payload],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Newest `limit` events (or those after `after_id`), in ascending id order.
    pub fn recent_events(&self, limit: i64, after_id: Option<i64>) -> Result<Vec<EventRow>> {
        let conn = self.conn()?;
        let mut stmt_after;
        let mut stmt_all;
        let mut rows = if let Some(aid) = after_id {
            stmt_after = conn.prepare(
                "SELECT id,time,kind,task_id,payload FROM events WHERE id>? ORDER BY id ASC LIMIT ?",
            )?;
            stmt_after.query(params![aid, limit])?
        } else {
            stmt_all = conn.prepare(
                "SELECT id,time,kind,task_id,payload FROM events ORDER BY id DESC LIMIT ?",
            )?;
            stmt_all.query(params![limit])?
        };
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let payload_s: String = row.get(4)?;
            out.push(EventRow {
                id: row.get(0)?,
                time: row.get(1)?,
                kind: row.get(2)?,
                task_id: row.get(3)?,
                payload: serde_json::from_str(&payload_s).unwrap_or(serde_json::json!({})),
            });
        }
        if after_id.is_none() {
            out.reverse();
        }
        Ok(out)
    }

    /// Journal entries recorded for one task, oldest first.
    pub fn task_events(&self, task_id: &str) -> Result<Vec<EventRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id,time,kind,task_id,payload FROM events WHERE task_id=? ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([task_id], |row| {
            let payload_s: String = row.get(4)?;
            Ok(EventRow {
                id: row.get(0)?,
                time: row.get(1)?,
                kind: row.get(2)?,
                task_id: row.get(3)?,
                payload: serde_json::from_str(&payload_s).unwrap_or(serde_json::json!({})),
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    // ---------------- Async wrappers (spawn_blocking) ----------------

    pub async fn insert_task_async(&self, task: &Task) -> Result<()> {
        let k = self.clone();
        let task = task.clone();
        tokio::task::spawn_blocking(move || k.insert_task(&task))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn get_task_async(&self, id: &str) -> Result<Option<Task>> {
        let k = self.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || k.get_task(&id))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn list_tasks_async(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let k = self.clone();
        let filter = filter.clone();
        tokio::task::spawn_blocking(move || k.list_tasks(&filter))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn update_task_async(&self, patch: &TaskPatch) -> Result<Task> {
        let k = self.clone();
        let patch = patch.clone();
        tokio::task::spawn_blocking(move || k.update_task(&patch))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn upsert_device_async(&self, device: &Device) -> Result<()> {
        let k = self.clone();
        let device = device.clone();
        tokio::task::spawn_blocking(move || k.upsert_device(&device))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn get_device_async(&self, id: &str) -> Result<Option<Device>> {
        let k = self.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || k.get_device(&id))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn list_devices_async(&self) -> Result<Vec<Device>> {
        let k = self.clone();
        tokio::task::spawn_blocking(move || k.list_devices())
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn pending_cancels_async(&self, limit: i64) -> Result<Vec<CancelRequest>> {
        let k = self.clone();
        tokio::task::spawn_blocking(move || k.pending_cancels(limit))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn mark_cancel_handled_async(&self, id: i64) -> Result<bool> {
        let k = self.clone();
        tokio::task::spawn_blocking(move || k.mark_cancel_handled(id))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn append_event_async(&self, env: &netfleet_events::Envelope) -> Result<i64> {
        let k = self.clone();
        let env = env.clone();
        tokio::task::spawn_blocking(move || k.append_event(&env))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }
}

#[async_trait]
impl TaskRepository for Kernel {
    async fn find_all(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        self.list_tasks_async(filter).await
    }

    async fn insert(&self, task: &Task) -> Result<Task> {
        self.insert_task_async(task).await?;
        Ok(task.clone())
    }

    async fn update(&self, patch: &TaskPatch) -> Result<Task> {
        self.update_task_async(patch).await
    }
}

#[async_trait]
impl DeviceRepository for Kernel {
    async fn find_by_id(&self, id: &str) -> Result<Option<Device>> {
        self.get_device_async(id).await
    }

    async fn list(&self) -> Result<Vec<Device>> {
        self.list_devices_async().await
    }
}
