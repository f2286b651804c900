//! Sleeper that records requested delays and returns immediately.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::sleeper::{SleepInterrupted, Sleeper};

/// Records every requested delay. When built with
/// [`RecordingSleeper::interrupted`] every sleep fails as if the service
/// were shutting down.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    durations: Mutex<Vec<Duration>>,
    interrupt: bool,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sleeper that reports every sleep as interrupted.
    pub fn interrupted() -> Self {
        Self {
            durations: Mutex::new(Vec::new()),
            interrupt: true,
        }
    }

    /// Delays requested so far, in order.
    pub fn durations(&self) -> Vec<Duration> {
        self.durations.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) -> Result<(), SleepInterrupted> {
        self.durations.lock().unwrap().push(duration);
        if self.interrupt {
            Err(SleepInterrupted)
        } else {
            Ok(())
        }
    }
}
