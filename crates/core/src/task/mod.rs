//! Publish tasks: the work-unit state machine and its persistence.

mod sqlite_store;
mod store;
mod types;

pub(crate) use sqlite_store::{parse_timestamp, timestamp};
pub use sqlite_store::SqliteTaskStore;
pub use store::{
    CreateTaskRequest, NewStepResult, StepCompletion, TaskError, TaskFilter, TaskOrder, TaskStore,
    TaskUpdate,
};
pub use types::{
    ControlFlags, Lease, ModerationMode, PublishAttempt, PublishTask, StepRecord, StepResult,
    StepResultStatus, StepRetry, StepStatus, TaskStatus, CONTROL_STEP_INDEX, WATCHDOG_STEP_INDEX,
};
