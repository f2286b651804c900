pub mod approve;
pub mod audit;
pub mod catalog;
pub mod config;
pub mod control;
pub mod dispatcher;
pub mod executor;
pub mod media;
pub mod metrics;
pub mod orchestrator;
pub mod processor;
pub mod publisher;
pub mod schedule;
pub mod selector;
pub mod sleeper;
pub mod task;
pub mod testing;
pub mod topic;
pub mod watchdog;

pub use approve::{ApproveError, ApproveReport, ApproveRunReport, AutoApprover};
pub use audit::{
    create_audit_system, AuditError, AuditEvent, AuditFilter, AuditHandle, AuditRecord, AuditStore,
    SqliteAuditStore,
};
pub use catalog::{
    Candidate, CandidateFilter, CandidateOrigin, CandidateStatus, CatalogError, CatalogStore,
    Destination, Project, SqliteCatalog,
};
pub use config::{
    load_config, load_config_from_str, validate_config, Config, ConfigError, SanitizedConfig,
};
pub use control::{ControlError, ControlOutcome, StepRetryOutcome, TaskControl};
pub use dispatcher::{DispatchError, DispatchReport, Dispatcher, DispatcherConfig};
pub use executor::{PipelineExecutor, StepError, StepHandler, StepKind};
pub use media::{FfmpegTool, MediaConfig, MediaError, MediaTool};
pub use orchestrator::{Orchestrator, OrchestratorConfig, OrchestratorError, OrchestratorStatus};
pub use processor::{ProcessorConfig, TaskProcessor, WorkerPool};
pub use publisher::{
    PlatformsConfig, PublishService, PublisherAdapter, PublisherConfig, PublisherRegistry,
};
pub use schedule::{DailyPlanner, ScheduleError, ScheduledPublisher};
pub use selector::{Penalties, Selector};
pub use sleeper::{SleepInterrupted, Sleeper, TokioSleeper};
pub use task::{
    CreateTaskRequest, PublishTask, SqliteTaskStore, TaskError, TaskFilter, TaskStatus, TaskStore,
    TaskUpdate,
};
pub use watchdog::{Watchdog, WatchdogConfig, WatchdogError, WatchdogReport};
