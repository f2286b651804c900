use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection};

use super::{AuditError, AuditEvent, AuditFilter, AuditRecord, AuditStore};
use crate::task::{parse_timestamp, timestamp};

/// SQLite-backed decision log.
pub struct SqliteAuditStore {
    conn: Mutex<Connection>,
}

impl SqliteAuditStore {
    /// Open (or create) the decision log at `path`.
    pub fn new(path: &Path) -> Result<Self, AuditError> {
        let conn = Connection::open(path).map_err(|e| AuditError::Database(e.to_string()))?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store (useful for testing)
    pub fn in_memory() -> Result<Self, AuditError> {
        let conn = Connection::open_in_memory().map_err(|e| AuditError::Database(e.to_string()))?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), AuditError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS decision_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                event_type TEXT NOT NULL,
                project_id INTEGER,
                task_id INTEGER,
                data TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_decision_log_timestamp ON decision_log(timestamp);
            CREATE INDEX IF NOT EXISTS idx_decision_log_project ON decision_log(project_id);
            CREATE INDEX IF NOT EXISTS idx_decision_log_task ON decision_log(task_id);
            CREATE INDEX IF NOT EXISTS idx_decision_log_event_type ON decision_log(event_type);
            "#,
        )
        .map_err(|e| AuditError::Database(e.to_string()))
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, AuditError> {
        self.conn
            .lock()
            .map_err(|e| AuditError::Database(format!("connection lock poisoned: {}", e)))
    }

    fn build_where_clause(filter: &AuditFilter) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut conditions = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(project_id) = filter.project_id {
            conditions.push("project_id = ?");
            params.push(Box::new(project_id));
        }

        if let Some(task_id) = filter.task_id {
            conditions.push("task_id = ?");
            params.push(Box::new(task_id));
        }

        if let Some(ref event_type) = filter.event_type {
            conditions.push("event_type = ?");
            params.push(Box::new(event_type.clone()));
        }

        if let Some(ref from) = filter.from {
            conditions.push("timestamp >= ?");
            params.push(Box::new(timestamp(from)));
        }

        if let Some(ref to) = filter.to {
            conditions.push("timestamp <= ?");
            params.push(Box::new(timestamp(to)));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        (where_clause, params)
    }
}

impl AuditStore for SqliteAuditStore {
    fn insert(&self, record: &AuditRecord) -> Result<i64, AuditError> {
        let data_json = serde_json::to_string(&record.data)
            .map_err(|e| AuditError::Serialization(e.to_string()))?;

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO decision_log (timestamp, event_type, project_id, task_id, data) VALUES (?, ?, ?, ?, ?)",
            params![
                timestamp(&record.timestamp),
                record.event_type,
                record.project_id,
                record.task_id,
                data_json,
            ],
        )
        .map_err(|e| AuditError::Database(e.to_string()))?;

        Ok(conn.last_insert_rowid())
    }

    fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditRecord>, AuditError> {
        let conn = self.lock()?;
        let (where_clause, mut params) = Self::build_where_clause(filter);

        let sql = format!(
            "SELECT id, timestamp, event_type, project_id, task_id, data FROM decision_log {} ORDER BY timestamp DESC, id DESC LIMIT ? OFFSET ?",
            where_clause
        );
        params.push(Box::new(filter.limit));
        params.push(Box::new(filter.offset));
        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| AuditError::Database(e.to_string()))?;
        let rows = stmt
            .query_map(param_refs.as_slice(), |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .map_err(|e| AuditError::Database(e.to_string()))?;

        let mut records = Vec::new();
        for row in rows {
            let (id, ts, event_type, project_id, task_id, data_json) =
                row.map_err(|e| AuditError::Database(e.to_string()))?;

            let timestamp = parse_timestamp(&ts)
                .ok_or_else(|| AuditError::Database(format!("Invalid timestamp: {}", ts)))?;
            let data: AuditEvent = serde_json::from_str(&data_json)
                .map_err(|e| AuditError::Serialization(e.to_string()))?;

            records.push(AuditRecord {
                id,
                timestamp,
                event_type,
                project_id,
                task_id,
                data,
            });
        }

        Ok(records)
    }

    fn count(&self, filter: &AuditFilter) -> Result<i64, AuditError> {
        let conn = self.lock()?;
        let (where_clause, params) = Self::build_where_clause(filter);
        let sql = format!("SELECT COUNT(*) FROM decision_log {}", where_clause);
        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        conn.query_row(&sql, param_refs.as_slice(), |row| row.get(0))
            .map_err(|e| AuditError::Database(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn record(event: AuditEvent) -> AuditRecord {
        AuditRecord {
            id: 0,
            timestamp: Utc::now(),
            event_type: event.event_type().to_string(),
            project_id: event.project_id(),
            task_id: event.task_id(),
            data: event,
        }
    }

    fn stuck(project_id: i64, task_id: i64) -> AuditRecord {
        record(AuditEvent::WatchdogStuck {
            project_id,
            task_id,
            old_status: "processing".to_string(),
            age_minutes: 95,
            new_status: "error".to_string(),
        })
    }

    fn plan_applied(project_id: i64) -> AuditRecord {
        record(AuditEvent::DailyPublishPlanApply {
            project_id,
            date: "2024-06-03".to_string(),
            base_priority: 10,
            enqueue: false,
            ok_count: 1,
            failed_count: 0,
            task_ids: vec![1],
        })
    }

    #[test]
    fn test_insert_and_query() {
        let store = SqliteAuditStore::in_memory().unwrap();
        let id = store.insert(&stuck(1, 10)).unwrap();
        assert!(id > 0);

        let results = store.query(&AuditFilter::new()).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, id);
        assert_eq!(results[0].event_type, "watchdog_stuck");
        assert_eq!(results[0].task_id, Some(10));
        assert!(matches!(
            results[0].data,
            AuditEvent::WatchdogStuck { age_minutes: 95, .. }
        ));
    }

    #[test]
    fn test_filters() {
        let store = SqliteAuditStore::in_memory().unwrap();
        store.insert(&stuck(1, 10)).unwrap();
        store.insert(&stuck(2, 20)).unwrap();
        store.insert(&plan_applied(1)).unwrap();

        let by_project = store.query(&AuditFilter::new().with_project_id(1)).unwrap();
        assert_eq!(by_project.len(), 2);

        let by_task = store.query(&AuditFilter::new().with_task_id(20)).unwrap();
        assert_eq!(by_task.len(), 1);
        assert_eq!(by_task[0].project_id, Some(2));

        let by_type = AuditFilter::new().with_event_type("daily_publish_plan_apply");
        assert_eq!(store.count(&by_type).unwrap(), 1);
        assert_eq!(store.count(&AuditFilter::new()).unwrap(), 3);
    }

    #[test]
    fn test_newest_first_and_time_range() {
        let store = SqliteAuditStore::in_memory().unwrap();
        let now = Utc::now();

        let mut old = stuck(1, 1);
        old.timestamp = now - Duration::hours(2);
        store.insert(&old).unwrap();

        let mut recent = stuck(1, 2);
        recent.timestamp = now;
        store.insert(&recent).unwrap();

        let all = store.query(&AuditFilter::new()).unwrap();
        assert_eq!(all[0].task_id, Some(2));

        let filter = AuditFilter::new().with_time_range(Some(now - Duration::hours(1)), None);
        let results = store.query(&filter).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].task_id, Some(2));
    }

    #[test]
    fn test_pagination() {
        let store = SqliteAuditStore::in_memory().unwrap();
        for i in 0..5 {
            store.insert(&stuck(1, i)).unwrap();
        }

        let page = |offset| {
            store
                .query(&AuditFilter::new().with_limit(2).with_offset(offset))
                .unwrap()
                .len()
        };
        assert_eq!(page(0), 2);
        assert_eq!(page(2), 2);
        assert_eq!(page(4), 1);
    }

    #[test]
    fn test_file_based_store() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("decisions.db");

        {
            let store = SqliteAuditStore::new(&db_path).unwrap();
            store.insert(&plan_applied(4)).unwrap();
        }

        let reopened = SqliteAuditStore::new(&db_path).unwrap();
        let results = reopened.query(&AuditFilter::new()).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].project_id, Some(4));
    }
}
