//! Periodic expiry of idle state
//!
//! The [`Sweeper`] wakes every `interval`, asks each [`SweepTask`] to drop
//! what has expired, and logs the counts. Each task runs on the blocking
//! pool, so a task that errors or panics is logged as a failure and the next
//! pass is brought forward to `failure_backoff`; the loop itself only ends on
//! shutdown.

use crate::chat::conversation::ConversationStore;
use crate::chat::rate_limit::RateLimiter;
use crate::chat::session::SessionStore;
use crate::proxy::cache::CacheStore;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_FAILURE_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum SweepError {
    #[error("Sweep task {task} failed: {reason}")]
    Failed { task: &'static str, reason: String },
}

/// One kind of expirable state
pub trait SweepTask: Send + Sync {
    fn name(&self) -> &'static str;

    /// Remove entries expired at `now`, returning how many were removed
    fn sweep(&self, now: Instant) -> Result<usize, SweepError>;
}

pub struct RateWindowSweep(pub Arc<RateLimiter>);

impl SweepTask for RateWindowSweep {
    fn name(&self) -> &'static str {
        "rate_windows"
    }

    fn sweep(&self, now: Instant) -> Result<usize, SweepError> {
        Ok(self.0.purge_idle(now))
    }
}

pub struct ConversationSweep(pub Arc<ConversationStore>);

impl SweepTask for ConversationSweep {
    fn name(&self) -> &'static str {
        "conversations"
    }

    fn sweep(&self, now: Instant) -> Result<usize, SweepError> {
        Ok(self.0.reap_idle(now))
    }
}

pub struct SessionSweep(pub Arc<SessionStore>);

impl SweepTask for SessionSweep {
    fn name(&self) -> &'static str {
        "sessions"
    }

    fn sweep(&self, now: Instant) -> Result<usize, SweepError> {
        Ok(self.0.reap_expired(now))
    }
}

pub struct CacheSweep(pub Arc<CacheStore>);

impl SweepTask for CacheSweep {
    fn name(&self) -> &'static str {
        "response_cache"
    }

    fn sweep(&self, now: Instant) -> Result<usize, SweepError> {
        Ok(self.0.purge_expired(now))
    }
}

/// Background loop running every registered [`SweepTask`]
pub struct Sweeper {
    tasks: Vec<Arc<dyn SweepTask>>,
    interval: Duration,
    failure_backoff: Duration,
    shutdown_rx: mpsc::Receiver<()>,
}

impl Sweeper {
    /// Create a sweeper and the sender that stops it
    pub fn new(
        tasks: Vec<Arc<dyn SweepTask>>,
        interval: Duration,
        failure_backoff: Duration,
    ) -> (Self, mpsc::Sender<()>) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let sweeper = Self {
            tasks,
            interval,
            failure_backoff,
            shutdown_rx,
        };
        (sweeper, shutdown_tx)
    }

    /// Run every task once; `true` when all of them succeeded
    pub async fn sweep_once(&self, now: Instant) -> bool {
        let mut healthy = true;
        for task in &self.tasks {
            match run_isolated(task.clone(), now).await {
                Ok(0) => debug!(task = task.name(), "Nothing to sweep"),
                Ok(removed) => info!(task = task.name(), removed, "Expired entries swept"),
                Err(e) => {
                    error!(task = task.name(), error = %e, "Sweep task failed");
                    healthy = false;
                }
            }
        }
        healthy
    }

    /// Sweep until a shutdown signal arrives or the sender is dropped
    pub async fn run(mut self) {
        info!(
            tasks = self.tasks.len(),
            interval_secs = self.interval.as_secs(),
            "Sweeper started"
        );

        let mut delay = self.interval;
        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            delay = if self.sweep_once(Instant::now()).await {
                self.interval
            } else {
                self.failure_backoff
            };
        }

        info!("Sweeper stopped");
    }
}

/// Run one task on the blocking pool, turning a panic into a [`SweepError`]
async fn run_isolated(task: Arc<dyn SweepTask>, now: Instant) -> Result<usize, SweepError> {
    let name = task.name();
    tokio::task::spawn_blocking(move || task.sweep(now))
        .await
        .unwrap_or_else(|e| {
            Err(SweepError::Failed {
                task: name,
                reason: e.to_string(),
            })
        })
}
