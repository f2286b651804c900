//! Common test utilities for in-process API testing.
//!
//! The fixture wires a real engine over a temporary SQLite database with
//! the media tool and platform adapter replaced by mocks, so requests can
//! be driven through the router with `oneshot` and no external services.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

use clipline_core::{
    create_audit_system, AuditFilter, AuditStore, CatalogStore, Config, Destination, Project,
    PublisherRegistry, SqliteAuditStore, TaskStore,
    testing::{MockMediaTool, MockPublisher},
};
use clipline_server::{
    api::create_router,
    engine::{build_engine, EngineDeps},
    state::AppState,
};

pub use clipline_core::testing::fixtures;

/// In-process server with a temporary database.
///
/// ```rust,ignore
/// #[tokio::test]
/// async fn test_list() {
///     let fixture = TestFixture::new().await;
///     let response = fixture.get("/api/v1/tasks").await;
///     assert_eq!(response.status, StatusCode::OK);
/// }
/// ```
pub struct TestFixture {
    pub router: Router,
    pub tasks: Arc<dyn TaskStore>,
    pub catalog: Arc<dyn CatalogStore>,
    pub audit_store: Arc<dyn AuditStore>,
    /// Adapter registered for `youtube`.
    pub publisher: Arc<MockPublisher>,
    pub media: Arc<MockMediaTool>,
    /// Holds the database and work directory.
    pub temp_dir: TempDir,
}

/// Response from a test request
#[derive(Debug)]
pub struct TestResponse {
    pub status: StatusCode,
    pub body: Value,
    pub text: String,
}

impl TestFixture {
    pub async fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");

        let mut config = Config::default();
        config.server.host = std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST);
        config.database.path = temp_dir.path().join("test.db");
        config.pipeline.work_dir = temp_dir.path().join("work");
        config.orchestrator.enabled = false;

        let audit_store: Arc<dyn AuditStore> = Arc::new(
            SqliteAuditStore::new(&config.database.path).expect("Failed to create audit store"),
        );
        let (audit_handle, audit_writer) = create_audit_system(Arc::clone(&audit_store), 100);
        tokio::spawn(audit_writer.run());

        let publisher = Arc::new(MockPublisher::new("youtube"));
        let media = Arc::new(MockMediaTool::new());
        let mut adapters = PublisherRegistry::new();
        adapters.register(publisher.clone());

        let deps = EngineDeps {
            media: media.clone(),
            adapters,
        };
        let engine = build_engine(&config, deps, audit_handle.clone(), Arc::clone(&audit_store))
            .expect("Failed to build engine");
        let tasks = Arc::clone(&engine.tasks);
        let catalog = Arc::clone(&engine.catalog);

        let state = Arc::new(AppState::new(
            config,
            audit_handle,
            Arc::clone(&audit_store),
            engine,
        ));

        Self {
            router: create_router(state),
            tasks,
            catalog,
            audit_store,
            publisher,
            media,
            temp_dir,
        }
    }

    /// A project with one active youtube destination.
    pub fn seed_project(&self) -> (Project, Destination) {
        let project = self
            .catalog
            .create_project(Project::new("test project"))
            .expect("Failed to create project");
        let destination = self
            .catalog
            .create_destination(fixtures::destination(project.id, "youtube"))
            .expect("Failed to create destination");
        (project, destination)
    }

    /// Poll the decision log until an event of `event_type` shows up.
    pub async fn wait_for_audit(&self, event_type: &str) -> bool {
        let filter = AuditFilter::new().with_event_type(event_type);
        for _ in 0..50 {
            if self.audit_store.count(&filter).unwrap_or(0) > 0 {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    pub async fn get(&self, path: &str) -> TestResponse {
        self.request("GET", path).await
    }

    pub async fn post(&self, path: &str) -> TestResponse {
        self.request("POST", path).await
    }

    pub async fn post_json(&self, path: &str, body: &Value) -> TestResponse {
        let request = Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        self.send(request).await
    }

    async fn request(&self, method: &str, path: &str) -> TestResponse {
        let request = Request::builder()
            .method(method)
            .uri(path)
            .body(Body::empty())
            .unwrap();
        self.send(request).await
    }

    async fn send(&self, request: Request<Body>) -> TestResponse {

        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("Failed to send request");

        let status = response.status();
        let body_bytes = response
            .into_body()
            .collect()
            .await
            .expect("Failed to collect body")
            .to_bytes();

        let text = String::from_utf8_lossy(&body_bytes).into_owned();
        let body: Value = serde_json::from_slice(&body_bytes).unwrap_or(Value::Null);

        TestResponse { status, body, text }
    }
}
