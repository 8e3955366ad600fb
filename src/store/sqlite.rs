//! SQLite-based task store.
//!
//! Safe to share between processes: WAL mode, and a partial unique index
//! that allows at most one `running` run per task.

use super::{
    now_string, ConsoleKind, ConsoleLogEntry, Room, RunOutcome, RunStatus, Task, TaskRun,
    TaskStatus, TaskStore, TriggerKind, Worker, STALE_RUN_ERROR,
};
use crate::llm::ChatMessage;
use crate::util::format_timestamp;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA busy_timeout = 5000;

CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY NOT NULL,
    name TEXT NOT NULL,
    prompt TEXT NOT NULL,
    worker_id TEXT,
    room_id TEXT,
    trigger_kind TEXT NOT NULL DEFAULT 'manual',
    status TEXT NOT NULL DEFAULT 'active',
    session_continuity INTEGER NOT NULL DEFAULT 0,
    session_id TEXT,
    session_history TEXT,
    learned_context TEXT,
    run_count INTEGER NOT NULL DEFAULT 0,
    max_runs INTEGER,
    timeout_secs INTEGER,
    max_turns INTEGER,
    allowed_tools TEXT,
    disallowed_tools TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS workers (
    id TEXT PRIMARY KEY NOT NULL,
    name TEXT NOT NULL,
    system_prompt TEXT,
    model TEXT,
    is_default INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS rooms (
    id TEXT PRIMARY KEY NOT NULL,
    name TEXT NOT NULL,
    max_concurrent INTEGER,
    model TEXT,
    system_prompt TEXT
);

CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS task_runs (
    id TEXT PRIMARY KEY NOT NULL,
    task_id TEXT NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    status TEXT NOT NULL,
    result TEXT,
    error_message TEXT,
    duration_ms INTEGER,
    progress REAL,
    progress_message TEXT,
    session_id TEXT,
    timed_out INTEGER NOT NULL DEFAULT 0,
    input_tokens INTEGER NOT NULL DEFAULT 0,
    output_tokens INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_runs_task ON task_runs(task_id, started_at DESC);
CREATE INDEX IF NOT EXISTS idx_runs_session ON task_runs(task_id, session_id);
CREATE UNIQUE INDEX IF NOT EXISTS idx_runs_one_running ON task_runs(task_id) WHERE status = 'running';

CREATE TABLE IF NOT EXISTS console_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL,
    seq INTEGER NOT NULL,
    kind TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_console_run ON console_logs(run_id, seq);
"#;

const TASK_COLUMNS: &str = "id, name, prompt, worker_id, room_id, trigger_kind, status,
    session_continuity, session_id, session_history, learned_context, run_count, max_runs,
    timeout_secs, max_turns, allowed_tools, disallowed_tools, created_at, updated_at";

const RUN_COLUMNS: &str = "id, task_id, started_at, finished_at, status, result, error_message,
    duration_ms, progress, progress_message, session_id, timed_out, input_tokens, output_tokens";

pub struct SqliteTaskStore {
    conn: Arc<Mutex<Connection>>,
}

fn parse_uuid(value: Option<String>) -> Option<Uuid> {
    value.and_then(|s| Uuid::parse_str(&s).ok())
}

fn json_list(value: Option<String>) -> Vec<String> {
    value
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    let id: String = row.get(0)?;
    let history: Option<String> = row.get(9)?;
    Ok(Task {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        name: row.get(1)?,
        prompt: row.get(2)?,
        worker_id: parse_uuid(row.get(3)?),
        room_id: parse_uuid(row.get(4)?),
        trigger: TriggerKind::parse(&row.get::<_, String>(5)?),
        status: TaskStatus::parse(&row.get::<_, String>(6)?),
        session_continuity: row.get::<_, i64>(7)? != 0,
        session_id: row.get(8)?,
        session_history: history.and_then(|s| serde_json::from_str(&s).ok()),
        learned_context: row.get(10)?,
        run_count: row.get::<_, i64>(11)? as u64,
        max_runs: row.get::<_, Option<i64>>(12)?.map(|v| v as u64),
        timeout_secs: row.get::<_, Option<i64>>(13)?.map(|v| v as u64),
        max_turns: row.get::<_, Option<i64>>(14)?.map(|v| v as u32),
        allowed_tools: json_list(row.get(15)?),
        disallowed_tools: json_list(row.get(16)?),
        created_at: row.get(17)?,
        updated_at: row.get(18)?,
    })
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<TaskRun> {
    let id: String = row.get(0)?;
    let task_id: String = row.get(1)?;
    Ok(TaskRun {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        task_id: Uuid::parse_str(&task_id).unwrap_or_default(),
        started_at: row.get(2)?,
        finished_at: row.get(3)?,
        status: RunStatus::parse(&row.get::<_, String>(4)?),
        result: row.get(5)?,
        error_message: row.get(6)?,
        duration_ms: row.get::<_, Option<i64>>(7)?.map(|v| v as u64),
        progress: row.get(8)?,
        progress_message: row.get(9)?,
        session_id: row.get(10)?,
        timed_out: row.get::<_, i64>(11)? != 0,
        input_tokens: row.get::<_, i64>(12)? as u64,
        output_tokens: row.get::<_, i64>(13)? as u64,
    })
}

fn worker_from_row(row: &Row<'_>) -> rusqlite::Result<Worker> {
    let id: String = row.get(0)?;
    Ok(Worker {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        name: row.get(1)?,
        system_prompt: row.get(2)?,
        model: row.get(3)?,
        is_default: row.get::<_, i64>(4)? != 0,
    })
}

impl SqliteTaskStore {
    /// Open (or create) the database at `path`.
    pub async fn open(path: &Path) -> Result<Self, String> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| format!("Failed to create store dir: {}", e))?;
        }
        let path = path.to_path_buf();

        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path)
                .map_err(|e| format!("Failed to open SQLite database: {}", e))?;
            conn.execute_batch(SCHEMA)
                .map_err(|e| format!("Failed to run schema: {}", e))?;
            Ok::<_, String>(conn)
        })
        .await
        .map_err(|e| format!("Task join error: {}", e))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, String>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            f(&conn).map_err(|e| e.to_string())
        })
        .await
        .map_err(|e| e.to_string())?
    }

    /// Execute a single-row update and fail if nothing matched.
    async fn update_one(
        &self,
        what: &'static str,
        id: Uuid,
        sql: &'static str,
        value: Option<String>,
    ) -> Result<(), String> {
        let now = now_string();
        let changed = self
            .with_conn(move |conn| conn.execute(sql, params![value, now, id.to_string()]))
            .await?;
        if changed == 0 {
            return Err(format!("{} {} not found", what, id));
        }
        Ok(())
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    fn is_persistent(&self) -> bool {
        true
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, String> {
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
                params![id.to_string()],
                task_from_row,
            )
            .optional()
        })
        .await
    }

    async fn save_task(&self, task: &Task) -> Result<(), String> {
        let t = task.clone();
        let history = t
            .session_history
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| e.to_string())?;
        let allowed = serde_json::to_string(&t.allowed_tools).map_err(|e| e.to_string())?;
        let disallowed = serde_json::to_string(&t.disallowed_tools).map_err(|e| e.to_string())?;

        self.with_conn(move |conn| {
            conn.execute(
                &format!(
                    "INSERT OR REPLACE INTO tasks ({}) VALUES
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
                    TASK_COLUMNS
                ),
                params![
                    t.id.to_string(),
                    t.name,
                    t.prompt,
                    t.worker_id.map(|u| u.to_string()),
                    t.room_id.map(|u| u.to_string()),
                    t.trigger.as_str(),
                    t.status.as_str(),
                    t.session_continuity as i64,
                    t.session_id,
                    history,
                    t.learned_context,
                    t.run_count as i64,
                    t.max_runs.map(|v| v as i64),
                    t.timeout_secs.map(|v| v as i64),
                    t.max_turns.map(|v| v as i64),
                    allowed,
                    disallowed,
                    t.created_at,
                    t.updated_at,
                ],
            )
            .map(|_| ())
        })
        .await
    }

    async fn set_task_status(&self, id: Uuid, status: TaskStatus) -> Result<(), String> {
        self.update_one(
            "Task",
            id,
            "UPDATE tasks SET status = ?1, updated_at = ?2 WHERE id = ?3",
            Some(status.as_str().to_string()),
        )
        .await
    }

    async fn set_task_session_id(&self, id: Uuid, session_id: Option<&str>) -> Result<(), String> {
        self.update_one(
            "Task",
            id,
            "UPDATE tasks SET session_id = ?1, updated_at = ?2 WHERE id = ?3",
            session_id.map(|s| s.to_string()),
        )
        .await
    }

    async fn set_session_history(
        &self,
        id: Uuid,
        history: Option<&[ChatMessage]>,
    ) -> Result<(), String> {
        let json = history
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| e.to_string())?;
        self.update_one(
            "Task",
            id,
            "UPDATE tasks SET session_history = ?1, updated_at = ?2 WHERE id = ?3",
            json,
        )
        .await
    }

    async fn set_learned_context(&self, id: Uuid, context: &str) -> Result<(), String> {
        self.update_one(
            "Task",
            id,
            "UPDATE tasks SET learned_context = ?1, updated_at = ?2 WHERE id = ?3",
            Some(context.to_string()),
        )
        .await
    }

    async fn increment_run_count(&self, id: Uuid) -> Result<u64, String> {
        let now = now_string();
        let count = self
            .with_conn(move |conn| {
                conn.query_row(
                    "UPDATE tasks SET run_count = run_count + 1, updated_at = ?1
                     WHERE id = ?2 RETURNING run_count",
                    params![now, id.to_string()],
                    |row| row.get::<_, i64>(0),
                )
                .optional()
            })
            .await?;
        count
            .map(|c| c as u64)
            .ok_or_else(|| format!("Task {} not found", id))
    }

    async fn get_worker(&self, id: Uuid) -> Result<Option<Worker>, String> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, name, system_prompt, model, is_default FROM workers WHERE id = ?1",
                params![id.to_string()],
                worker_from_row,
            )
            .optional()
        })
        .await
    }

    async fn default_worker(&self) -> Result<Option<Worker>, String> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, name, system_prompt, model, is_default FROM workers
                 WHERE is_default = 1 ORDER BY name LIMIT 1",
                [],
                worker_from_row,
            )
            .optional()
        })
        .await
    }

    async fn save_worker(&self, worker: &Worker) -> Result<(), String> {
        let w = worker.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO workers (id, name, system_prompt, model, is_default)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    w.id.to_string(),
                    w.name,
                    w.system_prompt,
                    w.model,
                    w.is_default as i64
                ],
            )
            .map(|_| ())
        })
        .await
    }

    async fn get_room(&self, id: Uuid) -> Result<Option<Room>, String> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, name, max_concurrent, model, system_prompt FROM rooms WHERE id = ?1",
                params![id.to_string()],
                |row| {
                    let id: String = row.get(0)?;
                    Ok(Room {
                        id: Uuid::parse_str(&id).unwrap_or_default(),
                        name: row.get(1)?,
                        max_concurrent: row.get::<_, Option<i64>>(2)?.map(|v| v.max(0) as u32),
                        model: row.get(3)?,
                        system_prompt: row.get(4)?,
                    })
                },
            )
            .optional()
        })
        .await
    }

    async fn save_room(&self, room: &Room) -> Result<(), String> {
        let r = room.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO rooms (id, name, max_concurrent, model, system_prompt)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    r.id.to_string(),
                    r.name,
                    r.max_concurrent.map(|v| v as i64),
                    r.model,
                    r.system_prompt
                ],
            )
            .map(|_| ())
        })
        .await
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>, String> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
        })
        .await
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<(), String> {
        let (key, value) = (key.to_string(), value.to_string());
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO settings (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )
            .map(|_| ())
        })
        .await
    }

    async fn running_run_for_task(&self, task_id: Uuid) -> Result<Option<TaskRun>, String> {
        self.with_conn(move |conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM task_runs WHERE task_id = ?1 AND status = 'running' LIMIT 1",
                    RUN_COLUMNS
                ),
                params![task_id.to_string()],
                run_from_row,
            )
            .optional()
        })
        .await
    }

    async fn create_run(
        &self,
        task_id: Uuid,
        session_id: Option<&str>,
    ) -> Result<Option<TaskRun>, String> {
        let run = TaskRun::started(task_id, session_id);
        let r = run.clone();
        let inserted = self
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO task_runs (id, task_id, started_at, status, session_id)
                     VALUES (?1, ?2, ?3, 'running', ?4)",
                    params![r.id.to_string(), r.task_id.to_string(), r.started_at, r.session_id],
                )
            })
            .await?;
        Ok((inserted == 1).then_some(run))
    }

    async fn update_run_progress(
        &self,
        run_id: Uuid,
        fraction: Option<f64>,
        message: &str,
    ) -> Result<(), String> {
        let message = message.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE task_runs SET progress = COALESCE(?1, progress), progress_message = ?2
                 WHERE id = ?3",
                params![fraction, message, run_id.to_string()],
            )
            .map(|_| ())
        })
        .await
    }

    async fn finish_run(&self, run_id: Uuid, outcome: &RunOutcome) -> Result<(), String> {
        let o = outcome.clone();
        let now = now_string();
        let changed = self
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE task_runs SET status = ?1, finished_at = ?2, result = ?3,
                        error_message = ?4, duration_ms = ?5,
                        session_id = COALESCE(?6, session_id), timed_out = ?7,
                        input_tokens = ?8, output_tokens = ?9
                     WHERE id = ?10",
                    params![
                        o.status.as_str(),
                        now,
                        o.result,
                        o.error_message,
                        o.duration_ms as i64,
                        o.session_id,
                        o.timed_out as i64,
                        o.input_tokens as i64,
                        o.output_tokens as i64,
                        run_id.to_string(),
                    ],
                )
            })
            .await?;
        if changed == 0 {
            return Err(format!("Run {} not found", run_id));
        }
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<TaskRun>, String> {
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {} FROM task_runs WHERE id = ?1", RUN_COLUMNS),
                params![run_id.to_string()],
                run_from_row,
            )
            .optional()
        })
        .await
    }

    async fn list_runs(&self, task_id: Uuid, limit: usize) -> Result<Vec<TaskRun>, String> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM task_runs WHERE task_id = ?1 ORDER BY started_at DESC LIMIT ?2",
                RUN_COLUMNS
            ))?;
            let runs = stmt
                .query_map(params![task_id.to_string(), limit as i64], run_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(runs)
        })
        .await
    }

    async fn count_runs_with_session(
        &self,
        task_id: Uuid,
        session_id: &str,
    ) -> Result<u64, String> {
        let session_id = session_id.to_string();
        let count = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM task_runs WHERE task_id = ?1 AND session_id = ?2",
                    params![task_id.to_string(), session_id],
                    |row| row.get::<_, i64>(0),
                )
            })
            .await?;
        Ok(count as u64)
    }

    async fn fail_stale_runs(&self, older_than: DateTime<Utc>) -> Result<usize, String> {
        let cutoff = format_timestamp(older_than);
        let now = now_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE task_runs SET status = 'failed', finished_at = ?1, error_message = ?2
                 WHERE status = 'running' AND started_at < ?3",
                params![now, STALE_RUN_ERROR, cutoff],
            )
        })
        .await
    }

    async fn append_console_logs(&self, entries: &[ConsoleLogEntry]) -> Result<(), String> {
        if entries.is_empty() {
            return Ok(());
        }
        let entries = entries.to_vec();
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.blocking_lock();
            let tx = conn.transaction().map_err(|e| e.to_string())?;
            {
                let mut stmt = tx
                    .prepare(
                        "INSERT INTO console_logs (run_id, seq, kind, content, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                    )
                    .map_err(|e| e.to_string())?;
                for e in &entries {
                    stmt.execute(params![
                        e.run_id.to_string(),
                        e.seq as i64,
                        e.kind.as_str(),
                        e.content,
                        e.created_at,
                    ])
                    .map_err(|e| e.to_string())?;
                }
            }
            tx.commit().map_err(|e| e.to_string())
        })
        .await
        .map_err(|e| e.to_string())?
    }

    async fn list_console_logs(&self, run_id: Uuid) -> Result<Vec<ConsoleLogEntry>, String> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT seq, kind, content, created_at FROM console_logs
                 WHERE run_id = ?1 ORDER BY seq ASC",
            )?;
            let entries = stmt
                .query_map(params![run_id.to_string()], |row| {
                    Ok(ConsoleLogEntry {
                        run_id,
                        seq: row.get::<_, i64>(0)? as u64,
                        kind: ConsoleKind::parse(&row.get::<_, String>(1)?),
                        content: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(entries)
        })
        .await
    }
}
