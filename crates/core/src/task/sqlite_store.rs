//! SQLite-backed task store implementation.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::{
    ControlFlags, CreateTaskRequest, NewStepResult, PublishTask, StepCompletion, StepResult,
    StepResultStatus, TaskError, TaskFilter, TaskOrder, TaskStatus, TaskStore, TaskUpdate,
};

/// Step indices at or above this value are reserved for control/watchdog records.
const RESERVED_STEP_INDEX: i64 = 9000;

const STEP_RESULT_COLUMNS: &str = "id, task_id, step_index, version, tool_id, step_name, status, moderation_status, previous_version_id, retry_count, can_retry, input_params, output_data, output_files, logs, error_message, started_at, completed_at, created_at";

/// SQLite-backed task store.
///
/// Filterable fields live in their own columns; the full task is kept as a
/// JSON document in `data` and rewritten on every update.
pub struct SqliteTaskStore {
    conn: Mutex<Connection>,
}

impl SqliteTaskStore {
    /// Open (or create) the task database at `path`.
    pub fn new(path: &Path) -> Result<Self, TaskError> {
        let conn = Connection::open(path).map_err(|e| TaskError::Database(e.to_string()))?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store (useful for testing).
    pub fn in_memory() -> Result<Self, TaskError> {
        let conn = Connection::open_in_memory().map_err(|e| TaskError::Database(e.to_string()))?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), TaskError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS publish_tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project_id INTEGER NOT NULL,
                platform TEXT NOT NULL,
                destination_id INTEGER NOT NULL,
                candidate_id INTEGER,
                status TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                published_at TEXT,
                data TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_status ON publish_tasks(status, created_at);
            CREATE INDEX IF NOT EXISTS idx_tasks_destination ON publish_tasks(destination_id, status);
            CREATE INDEX IF NOT EXISTS idx_tasks_published_at ON publish_tasks(published_at);

            CREATE TABLE IF NOT EXISTS step_results (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id INTEGER NOT NULL,
                step_index INTEGER NOT NULL,
                version INTEGER NOT NULL DEFAULT 1,
                tool_id TEXT NOT NULL,
                step_name TEXT NOT NULL,
                status TEXT NOT NULL,
                moderation_status TEXT NOT NULL,
                previous_version_id INTEGER,
                retry_count INTEGER NOT NULL DEFAULT 0,
                can_retry INTEGER NOT NULL DEFAULT 0,
                input_params TEXT NOT NULL,
                output_data TEXT NOT NULL,
                output_files TEXT NOT NULL,
                logs TEXT,
                error_message TEXT,
                started_at TEXT,
                completed_at TEXT,
                created_at TEXT NOT NULL,
                UNIQUE(task_id, step_index, version)
            );

            CREATE INDEX IF NOT EXISTS idx_step_results_task ON step_results(task_id, step_index);
            "#,
        )
        .map_err(|e| TaskError::Database(e.to_string()))?;

        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, TaskError> {
        self.conn
            .lock()
            .map_err(|e| TaskError::Database(format!("connection lock poisoned: {}", e)))
    }

    fn build_where_clause(filter: &TaskFilter) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut conditions: Vec<String> = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if !filter.statuses.is_empty() {
            let placeholders = vec!["?"; filter.statuses.len()].join(", ");
            conditions.push(format!("status IN ({})", placeholders));
            for status in &filter.statuses {
                params.push(Box::new(status.as_str().to_string()));
            }
        }

        if let Some(project_id) = filter.project_id {
            conditions.push("project_id = ?".to_string());
            params.push(Box::new(project_id));
        }

        if let Some(destination_id) = filter.destination_id {
            conditions.push("destination_id = ?".to_string());
            params.push(Box::new(destination_id));
        }

        if let Some(since) = filter.published_since {
            conditions.push("published_at IS NOT NULL AND published_at >= ?".to_string());
            params.push(Box::new(timestamp(&since)));
        }

        if let Some(before) = filter.published_before {
            conditions.push("published_at IS NOT NULL AND published_at < ?".to_string());
            params.push(Box::new(timestamp(&before)));
        }

        if let Some(since) = filter.created_since {
            conditions.push("created_at >= ?".to_string());
            params.push(Box::new(timestamp(&since)));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        (where_clause, params)
    }

    fn order_clause(order: TaskOrder) -> &'static str {
        match order {
            TaskOrder::CreatedAsc => "ORDER BY created_at ASC, id ASC",
            TaskOrder::UpdatedDesc => "ORDER BY updated_at DESC, id DESC",
            TaskOrder::PublishedDesc => "ORDER BY published_at DESC, id DESC",
            TaskOrder::PriorityDesc => "ORDER BY priority DESC, created_at ASC, id ASC",
        }
    }

    fn load(conn: &Connection, id: i64) -> Result<Option<PublishTask>, TaskError> {
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM publish_tasks WHERE id = ?",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| TaskError::Database(e.to_string()))?;

        data.map(|json| decode_task(&json)).transpose()
    }

    fn save(conn: &Connection, task: &PublishTask) -> Result<(), TaskError> {
        let data = serde_json::to_string(task).map_err(|e| TaskError::Database(e.to_string()))?;
        conn.execute(
            "UPDATE publish_tasks SET status = ?, priority = ?, updated_at = ?, published_at = ?, data = ? WHERE id = ?",
            params![
                task.status.as_str(),
                task.priority,
                timestamp(&task.updated_at),
                task.published_at.as_ref().map(timestamp),
                data,
                task.id,
            ],
        )
        .map_err(|e| TaskError::Database(e.to_string()))?;
        Ok(())
    }

    fn modify(
        &self,
        id: i64,
        to: Option<TaskStatus>,
        update: TaskUpdate,
    ) -> Result<PublishTask, TaskError> {
        let conn = self.lock()?;
        let mut task = Self::load(&conn, id)?.ok_or(TaskError::NotFound(id))?;

        if !update.lease_matches(&task) {
            return Err(TaskError::LeaseLost {
                task_id: id,
                lease_id: update.held_by.unwrap_or_default(),
            });
        }

        if let Some(to) = to {
            if !task.status.can_transition_to(to) {
                return Err(TaskError::InvalidTransition {
                    task_id: id,
                    from: task.status,
                    to,
                });
            }
            task.status = to;
        }

        update.apply(&mut task);
        task.updated_at = Utc::now();
        Self::save(&conn, &task)?;
        Ok(task)
    }

    fn row_to_step_result(row: &rusqlite::Row) -> rusqlite::Result<StepResult> {
        let status: String = row.get(6)?;
        let input_params: String = row.get(11)?;
        let output_data: String = row.get(12)?;
        let output_files: String = row.get(13)?;
        let started_at: Option<String> = row.get(16)?;
        let completed_at: Option<String> = row.get(17)?;
        let created_at: String = row.get(18)?;

        Ok(StepResult {
            id: row.get(0)?,
            task_id: row.get(1)?,
            step_index: row.get(2)?,
            version: row.get(3)?,
            tool_id: row.get(4)?,
            step_name: row.get(5)?,
            status: status.parse().unwrap_or(StepResultStatus::Error),
            moderation_status: row.get(7)?,
            previous_version_id: row.get(8)?,
            retry_count: row.get(9)?,
            can_retry: row.get(10)?,
            input_params: serde_json::from_str(&input_params).unwrap_or_default(),
            output_data: serde_json::from_str(&output_data).unwrap_or_default(),
            output_files: serde_json::from_str(&output_files).unwrap_or_default(),
            logs: row.get(14)?,
            error_message: row.get(15)?,
            started_at: started_at.as_deref().and_then(parse_timestamp),
            completed_at: completed_at.as_deref().and_then(parse_timestamp),
            created_at: parse_timestamp(&created_at).unwrap_or_else(Utc::now),
        })
    }
}

/// Fixed-width RFC 3339 so that string comparison orders by time.
pub(crate) fn timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

fn decode_task(json: &str) -> Result<PublishTask, TaskError> {
    serde_json::from_str(json).map_err(|e| TaskError::Database(format!("corrupt task row: {}", e)))
}

impl TaskStore for SqliteTaskStore {
    fn create(&self, request: CreateTaskRequest) -> Result<PublishTask, TaskError> {
        let conn = self.lock()?;
        let now = Utc::now();

        conn.execute(
            "INSERT INTO publish_tasks (project_id, platform, destination_id, candidate_id, status, priority, created_at, updated_at, data) VALUES (?, ?, ?, ?, ?, ?, ?, ?, '{}')",
            params![
                request.project_id,
                request.platform,
                request.destination_id,
                request.candidate_id,
                TaskStatus::Queued.as_str(),
                request.priority,
                timestamp(&now),
                timestamp(&now),
            ],
        )
        .map_err(|e| TaskError::Database(e.to_string()))?;

        let task = PublishTask {
            id: conn.last_insert_rowid(),
            project_id: request.project_id,
            platform: request.platform,
            destination_id: request.destination_id,
            candidate_id: request.candidate_id,
            external_id: None,
            status: TaskStatus::Queued,
            pipeline_status: None,
            current_step_index: 0,
            total_steps: 0,
            moderation_mode: request.moderation_mode,
            artifacts: request.artifacts,
            dag_debug: Vec::new(),
            priority: request.priority,
            caption_text: request.caption_text,
            instructions: request.instructions,
            download_url: request.download_url,
            permalink: request.permalink,
            published_url: None,
            published_external_id: None,
            published_at: None,
            publish_error: None,
            publish_attempts: Vec::new(),
            error_message: None,
            control: ControlFlags::default(),
            lease: None,
            created_at: now,
            updated_at: now,
            processing_started_at: None,
            processing_finished_at: None,
            publishing_started_at: None,
            paused_at: None,
            canceled_at: None,
            retry_from: None,
        };

        Self::save(&conn, &task)?;
        Ok(task)
    }

    fn get(&self, id: i64) -> Result<Option<PublishTask>, TaskError> {
        let conn = self.lock()?;
        Self::load(&conn, id)
    }

    fn list(&self, filter: &TaskFilter) -> Result<Vec<PublishTask>, TaskError> {
        let conn = self.lock()?;
        let (where_clause, mut params) = Self::build_where_clause(filter);

        let sql = format!(
            "SELECT data FROM publish_tasks {} {} LIMIT ? OFFSET ?",
            where_clause,
            Self::order_clause(filter.order)
        );
        params.push(Box::new(filter.limit));
        params.push(Box::new(filter.offset));

        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| TaskError::Database(e.to_string()))?;
        let rows = stmt
            .query_map(param_refs.as_slice(), |row| row.get::<_, String>(0))
            .map_err(|e| TaskError::Database(e.to_string()))?;

        let mut tasks = Vec::new();
        for row in rows {
            let json = row.map_err(|e| TaskError::Database(e.to_string()))?;
            tasks.push(decode_task(&json)?);
        }
        Ok(tasks)
    }

    fn count(&self, filter: &TaskFilter) -> Result<i64, TaskError> {
        let conn = self.lock()?;
        let (where_clause, params) = Self::build_where_clause(filter);
        let sql = format!("SELECT COUNT(*) FROM publish_tasks {}", where_clause);
        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        conn.query_row(&sql, param_refs.as_slice(), |row| row.get(0))
            .map_err(|e| TaskError::Database(e.to_string()))
    }

    fn count_by_status(&self) -> Result<HashMap<TaskStatus, i64>, TaskError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM publish_tasks GROUP BY status")
            .map_err(|e| TaskError::Database(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(|e| TaskError::Database(e.to_string()))?;

        let mut counts = HashMap::new();
        for row in rows {
            let (status, count) = row.map_err(|e| TaskError::Database(e.to_string()))?;
            if let Ok(status) = status.parse::<TaskStatus>() {
                counts.insert(status, count);
            }
        }
        Ok(counts)
    }

    fn transition(
        &self,
        id: i64,
        to: TaskStatus,
        update: TaskUpdate,
    ) -> Result<PublishTask, TaskError> {
        self.modify(id, Some(to), update)
    }

    fn update(&self, id: i64, update: TaskUpdate) -> Result<PublishTask, TaskError> {
        self.modify(id, None, update)
    }

    fn insert_step_result(&self, result: NewStepResult) -> Result<StepResult, TaskError> {
        let conn = self.lock()?;
        let now = Utc::now();

        let input_params = serde_json::to_string(&result.input_params)
            .map_err(|e| TaskError::Database(e.to_string()))?;
        let output_data = serde_json::to_string(&result.output_data)
            .map_err(|e| TaskError::Database(e.to_string()))?;
        let output_files = serde_json::to_string(&result.output_files)
            .map_err(|e| TaskError::Database(e.to_string()))?;

        conn.execute(
            "INSERT INTO step_results (task_id, step_index, version, tool_id, step_name, status, moderation_status, previous_version_id, retry_count, can_retry, input_params, output_data, output_files, logs, error_message, started_at, completed_at, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                result.task_id,
                result.step_index,
                result.version,
                result.tool_id,
                result.step_name,
                result.status.as_str(),
                result.moderation_status,
                result.previous_version_id,
                result.retry_count,
                result.can_retry,
                input_params,
                output_data,
                output_files,
                result.logs,
                result.error_message,
                result.started_at.as_ref().map(timestamp),
                result.completed_at.as_ref().map(timestamp),
                timestamp(&now),
            ],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(ref err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                TaskError::Conflict(format!(
                    "step result exists for task {} step {} version {}",
                    result.task_id, result.step_index, result.version
                ))
            }
            other => TaskError::Database(other.to_string()),
        })?;

        Ok(StepResult {
            id: conn.last_insert_rowid(),
            task_id: result.task_id,
            step_index: result.step_index,
            tool_id: result.tool_id,
            step_name: result.step_name,
            status: result.status,
            moderation_status: result.moderation_status,
            version: result.version,
            previous_version_id: result.previous_version_id,
            retry_count: result.retry_count,
            can_retry: result.can_retry,
            input_params: result.input_params,
            output_data: result.output_data,
            output_files: result.output_files,
            logs: result.logs,
            error_message: result.error_message,
            started_at: result.started_at,
            completed_at: result.completed_at,
            created_at: now,
        })
    }

    fn complete_step_result(
        &self,
        id: i64,
        completion: StepCompletion,
    ) -> Result<StepResult, TaskError> {
        let conn = self.lock()?;
        let output_data = serde_json::to_string(&completion.output_data)
            .map_err(|e| TaskError::Database(e.to_string()))?;

        let changed = conn
            .execute(
                "UPDATE step_results SET status = ?, output_data = ?, error_message = ?, started_at = ?, completed_at = ? WHERE id = ? AND status = ?",
                params![
                    completion.status.as_str(),
                    output_data,
                    completion.error_message,
                    completion.started_at.as_ref().map(timestamp),
                    completion.completed_at.as_ref().map(timestamp),
                    id,
                    StepResultStatus::Pending.as_str(),
                ],
            )
            .map_err(|e| TaskError::Database(e.to_string()))?;
        if changed == 0 {
            return Err(TaskError::Conflict(format!(
                "step result {} is missing or no longer pending",
                id
            )));
        }

        conn.query_row(
            &format!("SELECT {} FROM step_results WHERE id = ?", STEP_RESULT_COLUMNS),
            params![id],
            Self::row_to_step_result,
        )
        .map_err(|e| TaskError::Database(e.to_string()))
    }

    fn step_results(&self, task_id: i64) -> Result<Vec<StepResult>, TaskError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM step_results WHERE task_id = ? ORDER BY step_index ASC, version ASC",
                STEP_RESULT_COLUMNS
            ))
            .map_err(|e| TaskError::Database(e.to_string()))?;

        let rows = stmt
            .query_map(params![task_id], Self::row_to_step_result)
            .map_err(|e| TaskError::Database(e.to_string()))?;

        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| TaskError::Database(e.to_string()))
    }

    fn max_step_index(&self, task_id: i64) -> Result<Option<i64>, TaskError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT MAX(step_index) FROM step_results WHERE task_id = ? AND step_index < ?",
            params![task_id, RESERVED_STEP_INDEX],
            |row| row.get(0),
        )
        .map_err(|e| TaskError::Database(e.to_string()))
    }
}
