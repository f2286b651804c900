use std::sync::Arc;

use clipline_core::{
    AuditHandle, AuditStore, Config, DailyPlanner, Orchestrator, SanitizedConfig,
    TaskControl, TaskStore,
};

use crate::engine::Engine;

/// Shared application state
pub struct AppState {
    config: Config,
    audit: AuditHandle,
    audit_store: Arc<dyn AuditStore>,
    tasks: Arc<dyn TaskStore>,
    control: TaskControl,
    planner: DailyPlanner,
    orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(
        config: Config,
        audit: AuditHandle,
        audit_store: Arc<dyn AuditStore>,
        engine: Engine,
    ) -> Self {
        Self {
            config,
            audit,
            audit_store,
            tasks: engine.tasks,
            control: engine.control,
            planner: engine.planner,
            orchestrator: engine.orchestrator,
        }
    }

    pub fn sanitized_config(&self) -> SanitizedConfig {
        SanitizedConfig::from(&self.config)
    }

    #[allow(dead_code)]
    pub fn audit(&self) -> &AuditHandle {
        &self.audit
    }

    pub fn audit_store(&self) -> &dyn AuditStore {
        self.audit_store.as_ref()
    }

    pub fn tasks(&self) -> &dyn TaskStore {
        self.tasks.as_ref()
    }

    pub fn control(&self) -> &TaskControl {
        &self.control
    }

    pub fn planner(&self) -> &DailyPlanner {
        &self.planner
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }
}
