//! SQLite-backed catalog implementation.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};

use super::{
    Candidate, CandidateFilter, CatalogError, CatalogStore, Destination, Project,
};
use crate::task::timestamp;
use crate::topic::topic_signature;

/// SQLite-backed catalog.
pub struct SqliteCatalog {
    conn: Mutex<Connection>,
}

impl SqliteCatalog {
    /// Create a new SQLite catalog, creating the database file and tables if needed.
    pub fn new(path: &Path) -> Result<Self, CatalogError> {
        let conn = Connection::open(path).map_err(|e| CatalogError::Database(e.to_string()))?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory SQLite catalog (useful for testing).
    pub fn in_memory() -> Result<Self, CatalogError> {
        let conn =
            Connection::open_in_memory().map_err(|e| CatalogError::Database(e.to_string()))?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), CatalogError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS projects (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                data TEXT NOT NULL
            );

            -- Credentials are kept out of the JSON document so they never
            -- leave the store through serialization.
            CREATE TABLE IF NOT EXISTS destinations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project_id INTEGER NOT NULL,
                data TEXT NOT NULL,
                credentials TEXT NOT NULL DEFAULT '{}'
            );

            CREATE INDEX IF NOT EXISTS idx_destinations_project ON destinations(project_id);

            CREATE TABLE IF NOT EXISTS candidates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project_id INTEGER NOT NULL,
                status TEXT NOT NULL,
                score REAL,
                linked_task_id INTEGER,
                reviewed_at TEXT,
                created_at TEXT NOT NULL,
                data TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_candidates_project_status ON candidates(project_id, status);
            CREATE INDEX IF NOT EXISTS idx_candidates_linked_task ON candidates(linked_task_id);
            "#,
        )
        .map_err(|e| CatalogError::Database(e.to_string()))?;

        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, CatalogError> {
        self.conn
            .lock()
            .map_err(|e| CatalogError::Database(format!("connection lock poisoned: {}", e)))
    }

    fn build_where_clause(filter: &CandidateFilter) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut conditions: Vec<String> = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(project_id) = filter.project_id {
            conditions.push("project_id = ?".to_string());
            params.push(Box::new(project_id));
        }

        if !filter.statuses.is_empty() {
            let placeholders = vec!["?"; filter.statuses.len()].join(", ");
            conditions.push(format!("status IN ({})", placeholders));
            for status in &filter.statuses {
                params.push(Box::new(status.as_str().to_string()));
            }
        }

        if let Some(min_score) = filter.min_score {
            conditions.push("score IS NOT NULL AND score >= ?".to_string());
            params.push(Box::new(min_score));
        }

        if filter.unlinked {
            conditions.push("linked_task_id IS NULL".to_string());
        }

        if let Some(since) = filter.reviewed_since {
            conditions.push("reviewed_at IS NOT NULL AND reviewed_at >= ?".to_string());
            params.push(Box::new(timestamp(&since)));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        (where_clause, params)
    }

    fn decode<T: serde::de::DeserializeOwned>(json: &str) -> Result<T, CatalogError> {
        serde_json::from_str(json).map_err(|e| CatalogError::Database(format!("corrupt row: {}", e)))
    }

    fn encode<T: serde::Serialize>(value: &T) -> Result<String, CatalogError> {
        serde_json::to_string(value).map_err(|e| CatalogError::Database(e.to_string()))
    }

    fn decode_destination(data: &str, credentials: &str) -> Result<Destination, CatalogError> {
        let mut destination: Destination = Self::decode(data)?;
        destination.credentials = serde_json::from_str::<Map<String, Value>>(credentials)
            .unwrap_or_default();
        Ok(destination)
    }

    fn save_candidate(conn: &Connection, candidate: &Candidate) -> Result<(), CatalogError> {
        conn.execute(
            "UPDATE candidates SET status = ?, score = ?, linked_task_id = ?, reviewed_at = ?, data = ? WHERE id = ?",
            params![
                candidate.status.as_str(),
                candidate.score,
                candidate.linked_task_id,
                candidate.reviewed_at.as_ref().map(timestamp),
                Self::encode(candidate)?,
                candidate.id,
            ],
        )
        .map_err(|e| CatalogError::Database(e.to_string()))?;
        Ok(())
    }
}

impl CatalogStore for SqliteCatalog {
    fn create_project(&self, mut project: Project) -> Result<Project, CatalogError> {
        let conn = self.lock()?;
        conn.execute("INSERT INTO projects (data) VALUES ('{}')", [])
            .map_err(|e| CatalogError::Database(e.to_string()))?;
        project.id = conn.last_insert_rowid();
        conn.execute(
            "UPDATE projects SET data = ? WHERE id = ?",
            params![Self::encode(&project)?, project.id],
        )
        .map_err(|e| CatalogError::Database(e.to_string()))?;
        Ok(project)
    }

    fn get_project(&self, id: i64) -> Result<Option<Project>, CatalogError> {
        let conn = self.lock()?;
        let data: Option<String> = conn
            .query_row("SELECT data FROM projects WHERE id = ?", params![id], |row| {
                row.get(0)
            })
            .optional()
            .map_err(|e| CatalogError::Database(e.to_string()))?;
        data.map(|json| Self::decode(&json)).transpose()
    }

    fn list_projects(&self) -> Result<Vec<Project>, CatalogError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT data FROM projects ORDER BY id ASC")
            .map_err(|e| CatalogError::Database(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| CatalogError::Database(e.to_string()))?;

        let mut projects = Vec::new();
        for row in rows {
            let json = row.map_err(|e| CatalogError::Database(e.to_string()))?;
            projects.push(Self::decode(&json)?);
        }
        Ok(projects)
    }

    fn update_project(&self, project: &Project) -> Result<(), CatalogError> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE projects SET data = ? WHERE id = ?",
                params![Self::encode(project)?, project.id],
            )
            .map_err(|e| CatalogError::Database(e.to_string()))?;
        if changed == 0 {
            return Err(CatalogError::NotFound(format!("project {}", project.id)));
        }
        Ok(())
    }

    fn create_destination(
        &self,
        mut destination: Destination,
    ) -> Result<Destination, CatalogError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO destinations (project_id, data, credentials) VALUES (?, '{}', ?)",
            params![
                destination.project_id,
                Self::encode(&destination.credentials)?
            ],
        )
        .map_err(|e| CatalogError::Database(e.to_string()))?;
        destination.id = conn.last_insert_rowid();
        conn.execute(
            "UPDATE destinations SET data = ? WHERE id = ?",
            params![Self::encode(&destination)?, destination.id],
        )
        .map_err(|e| CatalogError::Database(e.to_string()))?;
        Ok(destination)
    }

    fn get_destination(&self, id: i64) -> Result<Option<Destination>, CatalogError> {
        let conn = self.lock()?;
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT data, credentials FROM destinations WHERE id = ?",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|e| CatalogError::Database(e.to_string()))?;
        row.map(|(data, credentials)| Self::decode_destination(&data, &credentials))
            .transpose()
    }

    fn destinations(&self, project_id: i64) -> Result<Vec<Destination>, CatalogError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT data, credentials FROM destinations WHERE project_id = ? ORDER BY id ASC",
            )
            .map_err(|e| CatalogError::Database(e.to_string()))?;
        let rows = stmt
            .query_map(params![project_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|e| CatalogError::Database(e.to_string()))?;

        let mut destinations = Vec::new();
        for row in rows {
            let (data, credentials) = row.map_err(|e| CatalogError::Database(e.to_string()))?;
            destinations.push(Self::decode_destination(&data, &credentials)?);
        }
        Ok(destinations)
    }

    fn create_candidate(&self, mut candidate: Candidate) -> Result<Candidate, CatalogError> {
        if candidate.topic_signature.is_empty() {
            candidate.topic_signature = topic_signature(&candidate.topic_tags);
        }

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO candidates (project_id, status, created_at, data) VALUES (?, ?, ?, '{}')",
            params![
                candidate.project_id,
                candidate.status.as_str(),
                timestamp(&candidate.created_at),
            ],
        )
        .map_err(|e| CatalogError::Database(e.to_string()))?;
        candidate.id = conn.last_insert_rowid();
        Self::save_candidate(&conn, &candidate)?;
        Ok(candidate)
    }

    fn get_candidate(&self, id: i64) -> Result<Option<Candidate>, CatalogError> {
        let conn = self.lock()?;
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM candidates WHERE id = ?",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| CatalogError::Database(e.to_string()))?;
        data.map(|json| Self::decode(&json)).transpose()
    }

    fn list_candidates(&self, filter: &CandidateFilter) -> Result<Vec<Candidate>, CatalogError> {
        let conn = self.lock()?;
        let (where_clause, mut params) = Self::build_where_clause(filter);
        let sql = format!(
            "SELECT data FROM candidates {} ORDER BY score IS NULL, score DESC, created_at ASC, id ASC LIMIT ?",
            where_clause
        );
        params.push(Box::new(filter.limit));
        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| CatalogError::Database(e.to_string()))?;
        let rows = stmt
            .query_map(param_refs.as_slice(), |row| row.get::<_, String>(0))
            .map_err(|e| CatalogError::Database(e.to_string()))?;

        let mut candidates = Vec::new();
        for row in rows {
            let json = row.map_err(|e| CatalogError::Database(e.to_string()))?;
            candidates.push(Self::decode(&json)?);
        }
        Ok(candidates)
    }

    fn candidates_for_tasks(
        &self,
        task_ids: &[i64],
    ) -> Result<HashMap<i64, Candidate>, CatalogError> {
        if task_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let conn = self.lock()?;
        let placeholders = vec!["?"; task_ids.len()].join(", ");
        let sql = format!(
            "SELECT data FROM candidates WHERE linked_task_id IN ({})",
            placeholders
        );
        let param_refs: Vec<&dyn rusqlite::ToSql> =
            task_ids.iter().map(|id| id as &dyn rusqlite::ToSql).collect();

        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| CatalogError::Database(e.to_string()))?;
        let rows = stmt
            .query_map(param_refs.as_slice(), |row| row.get::<_, String>(0))
            .map_err(|e| CatalogError::Database(e.to_string()))?;

        let mut by_task = HashMap::new();
        for row in rows {
            let json = row.map_err(|e| CatalogError::Database(e.to_string()))?;
            let candidate: Candidate = Self::decode(&json)?;
            if let Some(task_id) = candidate.linked_task_id {
                by_task.insert(task_id, candidate);
            }
        }
        Ok(by_task)
    }

    fn update_candidate(&self, candidate: &Candidate) -> Result<(), CatalogError> {
        let conn = self.lock()?;
        Self::save_candidate(&conn, candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CandidateOrigin, CandidateStatus};
    use chrono::Utc;

    fn catalog() -> SqliteCatalog {
        SqliteCatalog::in_memory().unwrap()
    }

    fn candidate(project_id: i64, score: f64) -> Candidate {
        let mut candidate = Candidate::new(project_id, CandidateOrigin::Repurpose);
        candidate.score = Some(score);
        candidate
    }

    #[test]
    fn test_project_round_trip() {
        let catalog = catalog();
        let mut project = Project::new("shorts");
        project.publish.publish_enabled = true;
        let created = catalog.create_project(project).unwrap();
        assert!(created.id > 0);

        let fetched = catalog.get_project(created.id).unwrap().unwrap();
        assert_eq!(fetched.name, "shorts");
        assert!(fetched.publish.publish_enabled);

        let mut updated = fetched.clone();
        updated.publish.jitter_minutes = 7;
        catalog.update_project(&updated).unwrap();
        assert_eq!(
            catalog
                .get_project(created.id)
                .unwrap()
                .unwrap()
                .publish
                .jitter_minutes,
            7
        );
    }

    #[test]
    fn test_update_missing_project() {
        let mut project = Project::new("ghost");
        project.id = 404;
        assert!(matches!(
            catalog().update_project(&project),
            Err(CatalogError::NotFound(_))
        ));
    }

    #[test]
    fn test_destination_keeps_credentials() {
        let catalog = catalog();
        let mut credentials = Map::new();
        credentials.insert("session_id".to_string(), Value::from("abc"));
        let created = catalog
            .create_destination(Destination {
                id: 0,
                project_id: 1,
                platform: "tiktok".to_string(),
                social_account_id: 10,
                handle: Some("channel".to_string()),
                active: true,
                credentials,
            })
            .unwrap();

        let fetched = catalog.get_destination(created.id).unwrap().unwrap();
        assert_eq!(fetched.credential("session_id"), Some("abc"));
        assert_eq!(catalog.destinations(1).unwrap().len(), 1);
        assert!(catalog.destinations(2).unwrap().is_empty());
    }

    #[test]
    fn test_candidate_signature_derived_on_create() {
        let catalog = catalog();
        let mut c = candidate(1, 0.5);
        c.topic_tags = vec!["Cats".to_string(), "funny".to_string()];
        let created = catalog.create_candidate(c).unwrap();
        assert_eq!(
            created.topic_signature,
            topic_signature(&["funny".to_string(), "cats".to_string()])
        );
    }

    #[test]
    fn test_list_candidates_ordering_and_filters() {
        let catalog = catalog();
        let low = catalog.create_candidate(candidate(1, 0.4)).unwrap();
        let high = catalog.create_candidate(candidate(1, 0.9)).unwrap();
        let mut linked = candidate(1, 0.95);
        linked.linked_task_id = Some(3);
        catalog.create_candidate(linked).unwrap();
        catalog.create_candidate(candidate(2, 0.99)).unwrap();

        let listed = catalog
            .list_candidates(
                &CandidateFilter::new()
                    .with_project(1)
                    .with_status(CandidateStatus::New)
                    .with_min_score(0.3)
                    .unlinked(),
            )
            .unwrap();
        let ids: Vec<i64> = listed.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![high.id, low.id]);
    }

    #[test]
    fn test_candidates_for_tasks() {
        let catalog = catalog();
        let mut c = catalog.create_candidate(candidate(1, 0.7)).unwrap();
        c.linked_task_id = Some(42);
        c.status = CandidateStatus::Approved;
        c.reviewed_at = Some(Utc::now());
        catalog.update_candidate(&c).unwrap();

        let map = catalog.candidates_for_tasks(&[42, 43]).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map[&42].id, c.id);
        assert!(catalog.candidates_for_tasks(&[]).unwrap().is_empty());

        let reviewed = catalog
            .list_candidates(
                &CandidateFilter::new()
                    .with_status(CandidateStatus::Approved)
                    .with_reviewed_since(Utc::now() - chrono::Duration::hours(1)),
            )
            .unwrap();
        assert_eq!(reviewed.len(), 1);
    }
}
