//! Fail-fast execution of an ordered step list.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};

use super::{HandlerRegistry, StepContext, StepError, StepSpec};
use crate::control::ControlSignal;
use crate::metrics;
use crate::task::{StepRecord, StepStatus, TaskStore};

/// Outcome of [`PipelineExecutor::execute_steps`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionReport {
    pub success: bool,
    pub steps_executed: usize,
    pub steps_skipped: usize,
    pub steps_failed: usize,
    pub error: Option<String>,
    /// One record per step reached, the failed step included.
    pub steps: Vec<StepRecord>,
    /// Set when an operator pause/cancel stopped the run between steps.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interrupted: Option<ControlSignal>,
}

impl ExecutionReport {
    fn new() -> Self {
        Self {
            success: true,
            steps_executed: 0,
            steps_skipped: 0,
            steps_failed: 0,
            error: None,
            steps: Vec::new(),
            interrupted: None,
        }
    }
}

/// Runs step lists against a [`HandlerRegistry`].
pub struct PipelineExecutor {
    registry: Arc<HandlerRegistry>,
    step_timeout: Duration,
    control: Option<Arc<dyn TaskStore>>,
}

impl PipelineExecutor {
    pub fn new(registry: Arc<HandlerRegistry>, step_timeout: Duration) -> Self {
        Self {
            registry,
            step_timeout,
            control: None,
        }
    }

    /// Observe operator pause/cancel requests on the task between steps.
    pub fn with_control(mut self, tasks: Arc<dyn TaskStore>) -> Self {
        self.control = Some(tasks);
        self
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    fn pending_signal(&self, task_id: i64) -> Option<ControlSignal> {
        let tasks = self.control.as_ref()?;
        match tasks.get(task_id) {
            Ok(Some(task)) => ControlSignal::from_flags(&task.control),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(task_id, error = %e, "Control check failed, continuing");
                None
            }
        }
    }

    /// Execute `steps` in order, stopping at the first failure.
    pub async fn execute_steps(&self, ctx: &mut StepContext, steps: &[StepSpec]) -> ExecutionReport {
        let mut report = ExecutionReport::new();

        for (index, step) in steps.iter().enumerate() {
            if let Some(signal) = self.pending_signal(ctx.task_id) {
                ctx.log(format!("Run interrupted before {}: {}", step.tool_id, signal.as_str()));
                report.success = false;
                report.interrupted = Some(signal);
                break;
            }

            let mut record = StepRecord {
                index,
                id: step.id.clone(),
                tool_id: step.tool_id.clone(),
                name: step.name.clone(),
                enabled: step.enabled,
                status: StepStatus::Pending,
                started_at: None,
                finished_at: None,
                duration_ms: None,
                outputs: Value::Object(Map::new()),
                error: None,
            };

            if !step.enabled {
                record.status = StepStatus::Skipped;
                report.steps_skipped += 1;
                report.steps.push(record);
                continue;
            }

            let Some(handler) = self.registry.get(&step.tool_id) else {
                ctx.log(format!("[{}] No handler registered, skipping", step.tool_id));
                record.status = StepStatus::Skipped;
                record.error = Some("No handler registered".to_string());
                report.steps_skipped += 1;
                report.steps.push(record);
                continue;
            };

            record.status = StepStatus::Processing;
            record.started_at = Some(Utc::now());
            ctx.log(format!("[{}] Starting step: {}", step.tool_id, step.name));
            let started = Instant::now();

            let result = match tokio::time::timeout(
                self.step_timeout,
                handler.execute(ctx, &step.params),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(StepError::Timeout {
                    secs: self.step_timeout.as_secs(),
                }),
            };

            let elapsed = started.elapsed();
            record.finished_at = Some(Utc::now());
            record.duration_ms = Some(elapsed.as_millis() as u64);

            match result {
                Ok(outputs) => {
                    record.status = StepStatus::Ok;
                    record.outputs = outputs.clone();
                    ctx.outputs.insert(step.tool_id.clone(), outputs);
                    report.steps_executed += 1;
                    ctx.log(format!("[{}] Completed in {}ms", step.tool_id, elapsed.as_millis()));
                    metrics::STEP_DURATION_SECONDS
                        .with_label_values(&[step.tool_id.as_str(), "ok"])
                        .observe(elapsed.as_secs_f64());
                    report.steps.push(record);
                }
                Err(e) => {
                    record.status = StepStatus::Error;
                    record.error = Some(e.to_string());
                    report.steps_failed += 1;
                    report.success = false;
                    report.error = Some(format!("Step {} failed: {}", step.tool_id, e));
                    ctx.log(format!("[{}] Error: {}", step.tool_id, e));
                    tracing::warn!(task_id = ctx.task_id, tool_id = %step.tool_id, error = %e, "Pipeline step failed");
                    metrics::STEP_DURATION_SECONDS
                        .with_label_values(&[step.tool_id.as_str(), "error"])
                        .observe(elapsed.as_secs_f64());
                    report.steps.push(record);
                    break;
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Project;
    use crate::executor::StepKind;
    use crate::task::{ControlFlags, SqliteTaskStore, TaskUpdate};
    use crate::testing::{fixtures, MockStepHandler};
    use serde_json::json;

    fn context() -> StepContext {
        StepContext::for_task(&fixtures::task(1, 1, 1), &Project::new("p"), None, "/tmp/w")
    }

    fn registry(entries: Vec<(&str, MockStepHandler)>) -> Arc<HandlerRegistry> {
        let mut registry = HandlerRegistry::new();
        for (tool_id, handler) in entries {
            registry.register(StepKind::from_tool_id(tool_id), Arc::new(handler));
        }
        Arc::new(registry)
    }

    #[tokio::test]
    async fn test_all_steps_succeed() {
        let executor = PipelineExecutor::new(
            registry(vec![
                ("T02_PROBE", MockStepHandler::ok(json!({"duration": 12.0}))),
                ("T04_CROP_RESIZE", MockStepHandler::ok(json!({"path": "ready.mp4"}))),
            ]),
            Duration::from_secs(5),
        );
        let mut ctx = context();
        let steps = vec![
            StepSpec::new("T02_PROBE", json!({})),
            StepSpec::new("T04_CROP_RESIZE", json!({"width": 1080})),
        ];

        let report = executor.execute_steps(&mut ctx, &steps).await;
        assert!(report.success);
        assert_eq!(report.steps_executed, 2);
        assert_eq!(report.steps.len(), 2);
        assert!(report.steps.iter().all(|s| s.status == StepStatus::Ok));
        assert_eq!(ctx.outputs["T02_PROBE"]["duration"], 12.0);
    }

    #[tokio::test]
    async fn test_disabled_and_unknown_steps_are_skipped() {
        let executor = PipelineExecutor::new(
            registry(vec![("T02_PROBE", MockStepHandler::ok(json!({})))]),
            Duration::from_secs(5),
        );
        let mut ctx = context();
        let steps = vec![
            StepSpec::new("T02_PROBE", json!({})).disabled(),
            StepSpec::new("G03_TTS", json!({})),
        ];

        let report = executor.execute_steps(&mut ctx, &steps).await;
        assert!(report.success);
        assert_eq!(report.steps_skipped, 2);
        assert_eq!(report.steps[0].error, None);
        assert_eq!(
            report.steps[1].error.as_deref(),
            Some("No handler registered")
        );
    }

    #[tokio::test]
    async fn test_failure_aborts_remaining_steps() {
        let last = MockStepHandler::ok(json!({}));
        let last_calls = last.calls();
        let executor = PipelineExecutor::new(
            registry(vec![
                ("T02_PROBE", MockStepHandler::ok(json!({}))),
                ("T04_CROP_RESIZE", MockStepHandler::failing("scale failed")),
                ("T05_THUMBNAIL", last),
            ]),
            Duration::from_secs(5),
        );
        let mut ctx = context();
        let steps = vec![
            StepSpec::new("T02_PROBE", json!({})),
            StepSpec::new("T04_CROP_RESIZE", json!({})),
            StepSpec::new("T05_THUMBNAIL", json!({})),
        ];

        let report = executor.execute_steps(&mut ctx, &steps).await;
        assert!(!report.success);
        assert_eq!(report.steps_executed, 1);
        assert_eq!(report.steps_failed, 1);
        assert_eq!(report.steps.len(), 2);
        assert_eq!(report.steps[1].status, StepStatus::Error);
        assert_eq!(
            report.error.as_deref(),
            Some("Step T04_CROP_RESIZE failed: scale failed")
        );
        assert_eq!(last_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_step_timeout_is_an_error() {
        let executor = PipelineExecutor::new(
            registry(vec![(
                "T17_PACKAGE",
                MockStepHandler::ok(json!({})).with_delay(Duration::from_millis(200)),
            )]),
            Duration::from_millis(20),
        );
        let mut ctx = context();
        let report = executor
            .execute_steps(&mut ctx, &[StepSpec::new("T17_PACKAGE", json!({}))])
            .await;

        assert!(!report.success);
        assert!(report.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_cancel_request_stops_before_next_step() {
        let store = Arc::new(SqliteTaskStore::in_memory().unwrap());
        let task = store.create(fixtures::create_request(1, 1)).unwrap();
        store
            .update(
                task.id,
                TaskUpdate::new().control(ControlFlags {
                    cancel_requested_at: Some(Utc::now()),
                    cancel_reason: Some("operator".to_string()),
                    ..ControlFlags::default()
                }),
            )
            .unwrap();

        let executor = PipelineExecutor::new(
            registry(vec![("T02_PROBE", MockStepHandler::ok(json!({})))]),
            Duration::from_secs(5),
        )
        .with_control(store.clone());
        let mut ctx = StepContext::for_task(&task, &Project::new("p"), None, "/tmp/w");

        let report = executor
            .execute_steps(&mut ctx, &[StepSpec::new("T02_PROBE", json!({}))])
            .await;
        assert!(!report.success);
        assert!(report.steps.is_empty());
        assert!(matches!(report.interrupted, Some(ControlSignal::Cancel { .. })));
    }
}
