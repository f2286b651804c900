//! Catalog of projects, their destinations and the candidates that feed them.
//!
//! Candidates arrive already scored; the catalog only persists them and the
//! bookkeeping the control loops need (approval status, linked task).

mod sqlite;
mod types;

use std::collections::HashMap;

pub use sqlite::SqliteCatalog;
pub use types::*;

/// Trait for catalog storage.
pub trait CatalogStore: Send + Sync {
    /// Insert a project. The `id` of the argument is ignored.
    fn create_project(&self, project: Project) -> Result<Project, CatalogError>;

    fn get_project(&self, id: i64) -> Result<Option<Project>, CatalogError>;

    /// All projects ordered by id.
    fn list_projects(&self) -> Result<Vec<Project>, CatalogError>;

    fn update_project(&self, project: &Project) -> Result<(), CatalogError>;

    /// Insert a destination. The `id` of the argument is ignored.
    fn create_destination(&self, destination: Destination) -> Result<Destination, CatalogError>;

    fn get_destination(&self, id: i64) -> Result<Option<Destination>, CatalogError>;

    /// Destinations of a project ordered by id.
    fn destinations(&self, project_id: i64) -> Result<Vec<Destination>, CatalogError>;

    /// Insert a candidate. The `id` of the argument is ignored and a topic
    /// signature is derived from its tags when missing.
    fn create_candidate(&self, candidate: Candidate) -> Result<Candidate, CatalogError>;

    fn get_candidate(&self, id: i64) -> Result<Option<Candidate>, CatalogError>;

    /// Candidates matching the filter, best score first, then oldest first.
    fn list_candidates(&self, filter: &CandidateFilter) -> Result<Vec<Candidate>, CatalogError>;

    /// Candidates linked to the given tasks, keyed by task id.
    fn candidates_for_tasks(
        &self,
        task_ids: &[i64],
    ) -> Result<HashMap<i64, Candidate>, CatalogError>;

    fn update_candidate(&self, candidate: &Candidate) -> Result<(), CatalogError>;
}
