//! Forever scheduler and the single-flight guard shared with the control surface

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info};

use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::models::{PassReport, TriageMode};

/// Anything that can run one triage pass
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PassRunner: Send + Sync {
    async fn run_pass(
        &self,
        mode: TriageMode,
        watermark_override: Option<DateTime<Utc>>,
    ) -> Result<PassReport>;
}

/// Serializes passes so at most one session is ever open
#[derive(Clone)]
pub struct SingleFlight {
    runner: Arc<dyn PassRunner>,
    guard: Arc<Mutex<()>>,
}

impl SingleFlight {
    pub fn new(runner: Arc<dyn PassRunner>) -> Self {
        Self {
            runner,
            guard: Arc::new(Mutex::new(())),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.guard.try_lock().is_err()
    }

    /// Wait in line for the guard, then run
    pub async fn run_queued(
        &self,
        mode: TriageMode,
        watermark_override: Option<DateTime<Utc>>,
    ) -> Result<PassReport> {
        let _guard = self.guard.clone().lock_owned().await;
        self.runner.run_pass(mode, watermark_override).await
    }

    /// Re-check the guard every `poll` until it is free, then run
    pub async fn run_when_idle(&self, mode: TriageMode, poll: Duration) -> Result<PassReport> {
        let _guard = self.acquire_polling(mode, poll).await;
        self.runner.run_pass(mode, None).await
    }

    async fn acquire_polling(&self, mode: TriageMode, poll: Duration) -> OwnedMutexGuard<()> {
        loop {
            match self.guard.clone().try_lock_owned() {
                Ok(guard) => return guard,
                Err(_) => {
                    debug!("A pass is already running, deferring {} pass", mode);
                    tokio::time::sleep(poll).await;
                }
            }
        }
    }
}

/// The pass to run next and how long to wait first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextStep {
    pub mode: TriageMode,
    pub delay: Duration,
}

/// Alternates new-mail and backlog passes forever
pub struct Scheduler {
    flight: SingleFlight,
    config: SchedulerConfig,
    next: NextStep,
}

impl Scheduler {
    pub fn new(flight: SingleFlight, config: SchedulerConfig) -> Self {
        Self {
            flight,
            config,
            next: NextStep {
                mode: TriageMode::New,
                delay: Duration::ZERO,
            },
        }
    }

    pub fn next(&self) -> NextStep {
        self.next
    }

    /// Decide what follows a finished pass
    ///
    /// | finished | outcome                     | next                 |
    /// |----------|-----------------------------|----------------------|
    /// | new      | progress, not rate limited  | new after burst      |
    /// | new      | idle or error               | backlog immediately  |
    /// | new      | rate limited                | new after refresh    |
    /// | backlog  | anything                    | new after refresh    |
    ///
    /// An error counts as zero processed. Progress means at least one
    /// processed message that did not fail, so a pass whose messages all
    /// failed is idle here and cannot keep a burst going. With
    /// `process_backlog` off an idle new pass waits the refresh interval.
    pub fn next_step(&mut self, finished: TriageMode, outcome: &Result<PassReport>) -> NextStep {
        let refresh = NextStep {
            mode: TriageMode::New,
            delay: self.config.refresh_interval(),
        };

        let next = match (finished, outcome) {
            (TriageMode::New, Ok(report)) if report.rate_limited > 0 => refresh,
            (TriageMode::New, Ok(report)) if report.made_progress() => NextStep {
                mode: TriageMode::New,
                delay: self.config.burst_delay(),
            },
            (TriageMode::New, _) if self.config.process_backlog => NextStep {
                mode: TriageMode::Backlog,
                delay: Duration::ZERO,
            },
            _ => refresh,
        };

        self.next = next;
        next
    }

    /// Wait, run the scheduled pass, and advance
    pub async fn tick(&mut self) -> NextStep {
        let step = self.next;
        if !step.delay.is_zero() {
            tokio::time::sleep(step.delay).await;
        }

        let outcome = self
            .flight
            .run_when_idle(step.mode, self.config.guard_poll())
            .await;
        match &outcome {
            Ok(report) => debug!(
                "{} pass processed {} message(s)",
                step.mode, report.processed
            ),
            Err(e) => error!("{} pass failed: {}", step.mode, e),
        }

        self.next_step(step.mode, &outcome)
    }

    pub async fn run_forever(&mut self) {
        info!(
            "Scheduler started (refresh every {:?}, backlog {})",
            self.config.refresh_interval(),
            if self.config.process_backlog {
                "enabled"
            } else {
                "disabled"
            }
        );
        loop {
            let next = self.tick().await;
            debug!("Next: {} pass in {:?}", next.mode, next.delay);
        }
    }
}
