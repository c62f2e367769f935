//! Persistence layer (C1).
//!
//! Single-writer embedded SQLite database, WAL-mode journaling, opened
//! once at startup and shared behind a mutex. Schema is created
//! idempotently via `CREATE TABLE IF NOT EXISTS` so repeated opens of
//! the same file are always safe.

use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

/// Errors raised opening or operating on the store.
#[derive(Debug)]
pub struct StoreError(pub String);

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "store error: {}", self.0)
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError(e.to_string())
    }
}

/// A chat role in the conversation log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    fn parse(s: &str) -> Role {
        match s {
            "assistant" => Role::Assistant,
            _ => Role::User,
        }
    }
}

/// One conversation row.
#[derive(Debug, Clone)]
pub struct ConversationMessage {
    pub id: i64,
    pub chat_id: i64,
    pub role: Role,
    pub content: String,
    pub created_at: String,
}

/// The scheduler's declaration of a cron job.
#[derive(Debug, Clone)]
pub struct CronJob {
    pub id: i64,
    pub name: String,
    pub schedule: String,
    pub prompt: String,
    pub output: String,
    pub enabled: bool,
    pub timezone: String,
    pub max_turns: Option<i64>,
    pub model: Option<String>,
    pub execution_mode: String,
    pub allowed_tools: Option<Vec<String>>,
    pub created_at: String,
    pub updated_at: String,
}

/// Field-by-field partial update applied by `updateJob`.
#[derive(Debug, Clone, Default)]
pub struct CronJobUpdate {
    pub schedule: Option<String>,
    pub prompt: Option<String>,
    pub output: Option<String>,
    pub enabled: Option<bool>,
    pub timezone: Option<String>,
    pub max_turns: Option<Option<i64>>,
    pub model: Option<Option<String>>,
    pub execution_mode: Option<String>,
    pub allowed_tools: Option<Option<Vec<String>>>,
}

/// A new cron job creation request.
#[derive(Debug, Clone)]
pub struct NewCronJob {
    pub name: String,
    pub schedule: String,
    pub prompt: String,
    pub output: String,
    pub enabled: bool,
    pub timezone: String,
    pub max_turns: Option<i64>,
    pub model: Option<String>,
    pub execution_mode: String,
    pub allowed_tools: Option<Vec<String>>,
}

/// One attempted execution of a job.
#[derive(Debug, Clone)]
pub struct ExecutionEntry {
    pub job_name: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub exit_code: Option<i64>,
    pub timed_out: bool,
    pub output_destination: Option<String>,
    pub response_preview: Option<String>,
    pub error: Option<String>,
    pub cost_usd: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub id: i64,
    pub job_name: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub exit_code: Option<i64>,
    pub timed_out: bool,
    pub output_destination: Option<String>,
    pub response_preview: Option<String>,
    pub error: Option<String>,
    pub cost_usd: Option<f64>,
}

/// The conductor's relational store.
pub struct Store {
    conn: Mutex<Connection>,
}

fn allowed_tools_to_json(tools: &Option<Vec<String>>) -> Option<String> {
    tools.as_ref().map(|t| serde_json::to_string(t).unwrap_or_default())
}

fn allowed_tools_from_json(s: Option<String>) -> Option<Vec<String>> {
    s.and_then(|s| serde_json::from_str(&s).ok())
}

impl Store {
    /// Open (or create) the store at `path`. Pass `":memory:"` for an
    /// ephemeral in-process database (tests).
    pub fn open(path: &Path) -> Result<Store, StoreError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Open an ephemeral in-memory store.
    pub fn open_in_memory() -> Result<Store, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Store, StoreError> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;",
        )
        .map_err(|e| StoreError(format!("failed to set pragmas: {e}")))?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS conversations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                chat_id INTEGER NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_conversations_chat_id
                ON conversations(chat_id);

            CREATE TABLE IF NOT EXISTS cron_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                schedule TEXT NOT NULL,
                prompt TEXT NOT NULL,
                output TEXT NOT NULL DEFAULT 'telegram',
                enabled INTEGER NOT NULL DEFAULT 1,
                timezone TEXT NOT NULL DEFAULT 'America/Chicago',
                max_turns INTEGER,
                model TEXT,
                execution_mode TEXT NOT NULL DEFAULT 'cli',
                allowed_tools TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS cron_executions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_name TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                exit_code INTEGER,
                timed_out INTEGER NOT NULL DEFAULT 0,
                output_destination TEXT,
                response_preview TEXT,
                error TEXT,
                cost_usd REAL
            );

            CREATE TABLE IF NOT EXISTS chat_sticky_models (
                chat_id INTEGER PRIMARY KEY,
                model TEXT NOT NULL
            );
            ",
        )
        .map_err(|e| StoreError(format!("failed to create schema: {e}")))?;

        Ok(Store {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("store connection mutex poisoned")
    }

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<CronJob> {
        let allowed_tools_json: Option<String> = row.get("allowed_tools")?;
        Ok(CronJob {
            id: row.get("id")?,
            name: row.get("name")?,
            schedule: row.get("schedule")?,
            prompt: row.get("prompt")?,
            output: row.get("output")?,
            enabled: row.get::<_, i64>("enabled")? != 0,
            timezone: row.get("timezone")?,
            max_turns: row.get("max_turns")?,
            model: row.get("model")?,
            execution_mode: row.get("execution_mode")?,
            allowed_tools: allowed_tools_from_json(allowed_tools_json),
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    // ---------------------------------------------------------------
    // Cron job catalog
    // ---------------------------------------------------------------

    /// Create a new cron job. Returns `StoreError` wrapping a UNIQUE
    /// constraint violation when `name` already exists; callers (C7)
    /// translate that into a 409 conflict.
    pub fn create_job(&self, job: &NewCronJob) -> Result<CronJob, StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO cron_jobs
                (name, schedule, prompt, output, enabled, timezone, max_turns, model, execution_mode, allowed_tools)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                job.name,
                job.schedule,
                job.prompt,
                job.output,
                job.enabled as i64,
                job.timezone,
                job.max_turns,
                job.model,
                job.execution_mode,
                allowed_tools_to_json(&job.allowed_tools),
            ],
        )?;
        drop(conn);
        self.get_job(&job.name)?
            .ok_or_else(|| StoreError("job vanished immediately after insert".into()))
    }

    pub fn get_job(&self, name: &str) -> Result<Option<CronJob>, StoreError> {
        let conn = self.lock();
        conn.query_row(
            "SELECT * FROM cron_jobs WHERE name = ?1",
            params![name],
            Self::row_to_job,
        )
        .optional()
        .map_err(StoreError::from)
    }

    pub fn list_jobs(&self) -> Result<Vec<CronJob>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT * FROM cron_jobs ORDER BY name")?;
        let rows = stmt
            .query_map([], Self::row_to_job)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Apply a field-by-field partial update; `updated_at` is always
    /// refreshed. Returns `Ok(None)` if no job with that name exists.
    pub fn update_job(
        &self,
        name: &str,
        update: &CronJobUpdate,
    ) -> Result<Option<CronJob>, StoreError> {
        let existing = match self.get_job(name)? {
            Some(j) => j,
            None => return Ok(None),
        };

        let schedule = update.schedule.clone().unwrap_or(existing.schedule);
        let prompt = update.prompt.clone().unwrap_or(existing.prompt);
        let output = update.output.clone().unwrap_or(existing.output);
        let enabled = update.enabled.unwrap_or(existing.enabled);
        let timezone = update.timezone.clone().unwrap_or(existing.timezone);
        let max_turns = update.max_turns.clone().unwrap_or(existing.max_turns);
        let model = update.model.clone().unwrap_or(existing.model);
        let execution_mode = update
            .execution_mode
            .clone()
            .unwrap_or(existing.execution_mode);
        let allowed_tools = update
            .allowed_tools
            .clone()
            .unwrap_or(existing.allowed_tools);

        let conn = self.lock();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE cron_jobs SET
                schedule = ?1, prompt = ?2, output = ?3, enabled = ?4,
                timezone = ?5, max_turns = ?6, model = ?7,
                execution_mode = ?8, allowed_tools = ?9, updated_at = ?10
             WHERE name = ?11",
            params![
                schedule,
                prompt,
                output,
                enabled as i64,
                timezone,
                max_turns,
                model,
                execution_mode,
                allowed_tools_to_json(&allowed_tools),
                now,
                name,
            ],
        )?;
        drop(conn);
        self.get_job(name)
    }

    /// Delete a job by name. Returns `true` if a row was removed.
    pub fn delete_job(&self, name: &str) -> Result<bool, StoreError> {
        let conn = self.lock();
        let n = conn.execute("DELETE FROM cron_jobs WHERE name = ?1", params![name])?;
        Ok(n > 0)
    }

    // ---------------------------------------------------------------
    // Conversations
    // ---------------------------------------------------------------

    pub fn save_message(&self, chat_id: i64, role: Role, content: &str) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO conversations (chat_id, role, content) VALUES (?1, ?2, ?3)",
            params![chat_id, role.as_str(), content],
        )?;
        Ok(())
    }

    /// Return the last `limit` rows for `chat_id`, oldest first.
    pub fn get_recent_context(
        &self,
        chat_id: i64,
        limit: usize,
    ) -> Result<Vec<ConversationMessage>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM (
                SELECT * FROM conversations WHERE chat_id = ?1 ORDER BY id DESC LIMIT ?2
             ) ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![chat_id, limit as i64], |row| {
                Ok(ConversationMessage {
                    id: row.get("id")?,
                    chat_id: row.get("chat_id")?,
                    role: Role::parse(&row.get::<_, String>("role")?),
                    content: row.get("content")?,
                    created_at: row.get("created_at")?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn clear_conversation(&self, chat_id: i64) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute("DELETE FROM conversations WHERE chat_id = ?1", params![chat_id])?;
        Ok(())
    }

    // ---------------------------------------------------------------
    // Per-chat sticky model override (C8 `/model`)
    // ---------------------------------------------------------------

    pub fn get_sticky_model(&self, chat_id: i64) -> Result<Option<String>, StoreError> {
        let conn = self.lock();
        conn.query_row(
            "SELECT model FROM chat_sticky_models WHERE chat_id = ?1",
            params![chat_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(StoreError::from)
    }

    /// `Some(model)` sets the sticky override; `None` drops it.
    pub fn set_sticky_model(&self, chat_id: i64, model: Option<&str>) -> Result<(), StoreError> {
        let conn = self.lock();
        match model {
            Some(m) => {
                conn.execute(
                    "INSERT INTO chat_sticky_models (chat_id, model) VALUES (?1, ?2)
                     ON CONFLICT(chat_id) DO UPDATE SET model = excluded.model",
                    params![chat_id, m],
                )?;
            }
            None => {
                conn.execute(
                    "DELETE FROM chat_sticky_models WHERE chat_id = ?1",
                    params![chat_id],
                )?;
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Execution history
    // ---------------------------------------------------------------

    pub fn log_execution(&self, entry: &ExecutionEntry) -> Result<i64, StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO cron_executions
                (job_name, started_at, finished_at, exit_code, timed_out, output_destination, response_preview, error, cost_usd)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                entry.job_name,
                entry.started_at,
                entry.finished_at,
                entry.exit_code,
                entry.timed_out as i64,
                entry.output_destination,
                entry.response_preview,
                entry.error,
                entry.cost_usd,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Most-recent-first execution rows, optionally filtered by job name.
    /// `limit` is capped at 200 regardless of the caller's request.
    pub fn get_recent_executions(
        &self,
        job_name: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        let capped = limit.min(200);
        let conn = self.lock();
        let row_fn = |row: &rusqlite::Row| {
            Ok(ExecutionRecord {
                id: row.get("id")?,
                job_name: row.get("job_name")?,
                started_at: row.get("started_at")?,
                finished_at: row.get("finished_at")?,
                exit_code: row.get("exit_code")?,
                timed_out: row.get::<_, i64>("timed_out")? != 0,
                output_destination: row.get("output_destination")?,
                response_preview: row.get("response_preview")?,
                error: row.get("error")?,
                cost_usd: row.get("cost_usd")?,
            })
        };
        let rows = if let Some(name) = job_name {
            let mut stmt = conn.prepare(
                "SELECT * FROM cron_executions WHERE job_name = ?1 ORDER BY id DESC LIMIT ?2",
            )?;
            stmt.query_map(params![name, capped as i64], row_fn)?
                .collect::<Result<Vec<_>, _>>()?
        } else {
            let mut stmt =
                conn.prepare("SELECT * FROM cron_executions ORDER BY id DESC LIMIT ?1")?;
            stmt.query_map(params![capped as i64], row_fn)?
                .collect::<Result<Vec<_>, _>>()?
        };
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job(name: &str) -> NewCronJob {
        NewCronJob {
            name: name.to_string(),
            schedule: "* * * * *".to_string(),
            prompt: "hello".to_string(),
            output: "log".to_string(),
            enabled: true,
            timezone: "America/Chicago".to_string(),
            max_turns: None,
            model: None,
            execution_mode: "cli".to_string(),
            allowed_tools: None,
        }
    }

    #[test]
    fn create_and_get_job() {
        let store = Store::open_in_memory().unwrap();
        let job = store.create_job(&sample_job("daily")).unwrap();
        assert_eq!(job.name, "daily");
        assert!(job.enabled);
        let fetched = store.get_job("daily").unwrap().unwrap();
        assert_eq!(fetched.id, job.id);
    }

    #[test]
    fn create_duplicate_name_fails() {
        let store = Store::open_in_memory().unwrap();
        store.create_job(&sample_job("x")).unwrap();
        let err = store.create_job(&sample_job("x"));
        assert!(err.is_err());
        assert_eq!(store.list_jobs().unwrap().len(), 1);
    }

    #[test]
    fn update_job_refreshes_updated_at() {
        let store = Store::open_in_memory().unwrap();
        let job = store.create_job(&sample_job("daily")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        let updated = store
            .update_job(
                "daily",
                &CronJobUpdate {
                    enabled: Some(false),
                    ..Default::default()
                },
            )
            .unwrap()
            .unwrap();
        assert!(!updated.enabled);
        assert_ne!(updated.updated_at, job.updated_at);
    }

    #[test]
    fn update_missing_job_returns_none() {
        let store = Store::open_in_memory().unwrap();
        let res = store
            .update_job("missing", &CronJobUpdate::default())
            .unwrap();
        assert!(res.is_none());
    }

    #[test]
    fn delete_job_returns_bool() {
        let store = Store::open_in_memory().unwrap();
        store.create_job(&sample_job("x")).unwrap();
        assert!(store.delete_job("x").unwrap());
        assert!(!store.delete_job("x").unwrap());
    }

    #[test]
    fn conversation_round_trip_chronological() {
        let store = Store::open_in_memory().unwrap();
        store.save_message(1, Role::User, "hi").unwrap();
        store.save_message(1, Role::Assistant, "hello").unwrap();
        store.save_message(1, Role::User, "how are you").unwrap();
        let ctx = store.get_recent_context(1, 2).unwrap();
        assert_eq!(ctx.len(), 2);
        assert_eq!(ctx[0].content, "hello");
        assert_eq!(ctx[1].content, "how are you");
    }

    #[test]
    fn clear_conversation_removes_all_rows() {
        let store = Store::open_in_memory().unwrap();
        store.save_message(1, Role::User, "hi").unwrap();
        store.clear_conversation(1).unwrap();
        assert!(store.get_recent_context(1, 10).unwrap().is_empty());
    }

    #[test]
    fn sticky_model_set_get_and_clear() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.get_sticky_model(1).unwrap().is_none());
        store.set_sticky_model(1, Some("opus")).unwrap();
        assert_eq!(store.get_sticky_model(1).unwrap().as_deref(), Some("opus"));
        store.set_sticky_model(1, Some("haiku")).unwrap();
        assert_eq!(store.get_sticky_model(1).unwrap().as_deref(), Some("haiku"));
        store.set_sticky_model(1, None).unwrap();
        assert!(store.get_sticky_model(1).unwrap().is_none());
    }

    #[test]
    fn executions_most_recent_first() {
        let store = Store::open_in_memory().unwrap();
        for i in 0..3 {
            store
                .log_execution(&ExecutionEntry {
                    job_name: "daily".into(),
                    started_at: format!("2024-01-0{}T00:00:00Z", i + 1),
                    finished_at: None,
                    exit_code: Some(0),
                    timed_out: false,
                    output_destination: Some("log".into()),
                    response_preview: Some(format!("run {i}")),
                    error: None,
                    cost_usd: None,
                })
                .unwrap();
        }
        let rows = store.get_recent_executions(Some("daily"), 20).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].response_preview.as_deref(), Some("run 2"));
    }

    #[test]
    fn executions_limit_capped_at_200() {
        let store = Store::open_in_memory().unwrap();
        store
            .log_execution(&ExecutionEntry {
                job_name: "daily".into(),
                started_at: "2024-01-01T00:00:00Z".into(),
                finished_at: None,
                exit_code: Some(0),
                timed_out: false,
                output_destination: None,
                response_preview: None,
                error: None,
                cost_usd: None,
            })
            .unwrap();
        // Requesting an absurd limit does not panic or error.
        let rows = store.get_recent_executions(None, 10_000).unwrap();
        assert_eq!(rows.len(), 1);
    }
}
