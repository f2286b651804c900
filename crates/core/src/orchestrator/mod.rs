//! Periodic driver for the control loops.
//!
//! The orchestrator owns one tokio task per loop:
//! - **Dispatch**: admits queued tasks into processing within the limits
//! - **Publish**: publishes ready tasks inside project publish windows
//! - **Watchdog**: reclaims tasks stuck in processing or publishing
//! - **Approve**: turns high-scoring candidates into queued tasks

mod config;
mod runner;
mod types;

pub use config::OrchestratorConfig;
pub use runner::Orchestrator;
pub use types::{LoopKind, LoopRun, LoopStatus, OrchestratorError, OrchestratorStatus};
