//! P01_PUBLISH as a pipeline step.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::executor::{StepContext, StepError, StepHandler};
use crate::publisher::PublishService;

/// Delegates to the [`PublishService`] for the context's task.
pub struct PublishStepHandler {
    service: Arc<PublishService>,
}

impl PublishStepHandler {
    pub fn new(service: Arc<PublishService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl StepHandler for PublishStepHandler {
    async fn execute(&self, ctx: &mut StepContext, _params: &Value) -> Result<Value, StepError> {
        let outcome = self
            .service
            .publish_task(ctx.task_id, &ctx.work_dir)
            .await
            .map_err(|e| StepError::failed(e.to_string()))?;

        if !outcome.published {
            let reason = outcome
                .error
                .clone()
                .or_else(|| outcome.skipped_reason.clone())
                .unwrap_or_else(|| "publish failed".to_string());
            return Err(StepError::failed(reason));
        }
        if let Some(ref url) = outcome.published_url {
            ctx.log(format!("Published to {}", url));
        }
        serde_json::to_value(&outcome)
            .map_err(|e| StepError::failed(format!("Cannot serialize publish outcome: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogStore, Project, SqliteCatalog};
    use crate::publisher::{PublisherConfig, PublisherRegistry};
    use crate::task::{SqliteTaskStore, TaskStatus, TaskStore, TaskUpdate};
    use crate::testing::{fixtures, MockPublisher, RecordingSleeper};

    fn service(tasks: Arc<SqliteTaskStore>, catalog: Arc<SqliteCatalog>) -> Arc<PublishService> {
        let mut registry = PublisherRegistry::new();
        registry.register(Arc::new(MockPublisher::new("youtube")));
        Arc::new(PublishService::new(
            tasks,
            catalog,
            Arc::new(registry),
            Arc::new(RecordingSleeper::new()),
            PublisherConfig::default(),
        ))
    }

    #[tokio::test]
    async fn test_step_publishes_task() {
        let tasks = Arc::new(SqliteTaskStore::in_memory().unwrap());
        let catalog = Arc::new(SqliteCatalog::in_memory().unwrap());
        let project = catalog.create_project(Project::new("p")).unwrap();
        let dest = catalog
            .create_destination(fixtures::destination(project.id, "youtube"))
            .unwrap();
        let task = tasks
            .create(fixtures::create_request(project.id, dest.id))
            .unwrap();
        tasks
            .transition(task.id, TaskStatus::Processing, TaskUpdate::new())
            .unwrap();
        let task = tasks
            .transition(task.id, TaskStatus::ReadyForPublish, TaskUpdate::new())
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("final.mp4"), b"video").unwrap();
        let handler = PublishStepHandler::new(service(tasks.clone(), catalog));
        let mut ctx = StepContext::for_task(&task, &project, Some(&dest), dir.path());

        let out = handler.execute(&mut ctx, &Value::Null).await.unwrap();
        assert_eq!(out["published"], true);
        assert_eq!(
            tasks.get(task.id).unwrap().unwrap().status,
            TaskStatus::Published
        );
    }

    #[tokio::test]
    async fn test_step_fails_when_task_not_publishable() {
        let tasks = Arc::new(SqliteTaskStore::in_memory().unwrap());
        let catalog = Arc::new(SqliteCatalog::in_memory().unwrap());
        let project = catalog.create_project(Project::new("p")).unwrap();
        let task = tasks.create(fixtures::create_request(project.id, 1)).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let handler = PublishStepHandler::new(service(tasks, catalog));
        let mut ctx = StepContext::for_task(&task, &project, None, dir.path());

        let err = handler.execute(&mut ctx, &Value::Null).await.unwrap_err();
        assert!(err.to_string().contains("expected ready_for_publish"));
    }
}
