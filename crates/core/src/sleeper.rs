//! Cancellable delays for retry backoff and publish jitter.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("sleep interrupted by shutdown")]
pub struct SleepInterrupted;

/// Source of delays. Production code waits on the tokio timer; tests record
/// the requested durations and return immediately.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration) -> Result<(), SleepInterrupted>;
}

/// Tokio timer that aborts early once the shutdown flag flips to `true`.
#[derive(Clone)]
pub struct TokioSleeper {
    shutdown: watch::Receiver<bool>,
}

impl TokioSleeper {
    pub fn new(shutdown: watch::Receiver<bool>) -> Self {
        Self { shutdown }
    }

    /// A sleeper no shutdown signal can interrupt.
    pub fn uncancellable() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { shutdown: rx }
    }
}

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) -> Result<(), SleepInterrupted> {
        let mut rx = self.shutdown.clone();
        if *rx.borrow() {
            return Err(SleepInterrupted);
        }

        let timer = tokio::time::sleep(duration);
        tokio::pin!(timer);
        loop {
            tokio::select! {
                _ = &mut timer => return Ok(()),
                changed = rx.changed() => {
                    if changed.is_err() {
                        // Sender gone: nobody can cancel us any more.
                        (&mut timer).await;
                        return Ok(());
                    }
                    if *rx.borrow() {
                        return Err(SleepInterrupted);
                    }
                }
            }
        }
    }
}
