//! Testing utilities and mock implementations.
//!
//! Mocks stand in for every external boundary of the engine (ffmpeg,
//! platform uploads, step handlers, timers) so control loops and pipelines
//! can be exercised end to end against in-memory stores.
//!
//! # Example
//!
//! ```rust,ignore
//! use clipline_core::testing::{MockPublisher, RecordingSleeper};
//!
//! let publisher = MockPublisher::new("youtube");
//! publisher.push_result(PublishResult::retryable("youtube", "HTTP 503"));
//!
//! let sleeper = RecordingSleeper::new();
//! // ... run the publish service ...
//! assert_eq!(sleeper.durations(), vec![Duration::from_secs(60)]);
//! ```

mod mock_media;
mod mock_publisher;
mod mock_step_handler;
mod recording_sleeper;

pub use mock_media::MockMediaTool;
pub use mock_publisher::MockPublisher;
pub use mock_step_handler::MockStepHandler;
pub use recording_sleeper::RecordingSleeper;

/// Test fixtures and helper functions.
pub mod fixtures {
    use chrono::Utc;
    use serde_json::Map;

    use crate::catalog::{Candidate, CandidateOrigin, Destination};
    use crate::task::{ControlFlags, CreateTaskRequest, ModerationMode, PublishTask, TaskStatus};

    /// A `queued` task that has never been stored.
    pub fn task(id: i64, project_id: i64, destination_id: i64) -> PublishTask {
        let now = Utc::now();
        PublishTask {
            id,
            project_id,
            platform: "youtube".to_string(),
            destination_id,
            candidate_id: None,
            external_id: None,
            status: TaskStatus::Queued,
            pipeline_status: None,
            current_step_index: 0,
            total_steps: 0,
            moderation_mode: ModerationMode::Manual,
            artifacts: Map::new(),
            dag_debug: Vec::new(),
            priority: 0,
            caption_text: None,
            instructions: None,
            download_url: None,
            permalink: None,
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
        }
    }

    /// Request for a manual-moderation youtube task.
    pub fn create_request(project_id: i64, destination_id: i64) -> CreateTaskRequest {
        CreateTaskRequest {
            project_id,
            platform: "youtube".to_string(),
            destination_id,
            ..Default::default()
        }
    }

    /// An active destination without credentials. The `id` is assigned on insert.
    pub fn destination(project_id: i64, platform: &str) -> Destination {
        Destination {
            id: 0,
            project_id,
            platform: platform.to_string(),
            social_account_id: 1,
            handle: Some(format!("{}_account", platform)),
            active: true,
            credentials: Map::new(),
        }
    }

    /// A new repurposed candidate with a score, author and topic tags.
    pub fn candidate(project_id: i64, score: f64, author: &str, tags: &[&str]) -> Candidate {
        let mut candidate = Candidate::new(project_id, CandidateOrigin::Repurpose);
        candidate.score = Some(score);
        candidate.author = Some(author.to_string());
        candidate.url = Some(format!("https://source.test/{}/{}", author, score));
        candidate.topic_tags = tags.iter().map(|t| t.to_string()).collect();
        candidate
    }
}
