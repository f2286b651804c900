//! Task processor: runs the pipeline of dispatched tasks.
//!
//! The dispatcher commits a `processing` reservation with a lease and hands
//! the task to the [`WorkerPool`]. The pool runs [`TaskProcessor::process`]
//! off the control loop; the processor builds the step list, executes it and
//! commits the final status, releasing the lease.

mod config;
mod pool;
mod runner;

pub use config::ProcessorConfig;
pub use pool::{PoolStatus, WorkerPool};
pub use runner::{plan_steps, resume_steps, ProcessError, ProcessOutcome, TaskProcessor};
