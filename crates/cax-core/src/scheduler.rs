// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Polling scheduler driving the task set.
//!
//! Each cycle runs every registered task to completion, in order, against
//! the shared run filter. Tasks never run concurrently with each other on
//! the same agent; cross-agent concurrency is handled by the store's
//! conditional operations, not by scheduling.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{error, info};

use crate::store::RunFilter;
use crate::tasks::{Task, TaskStats};

/// Builder for a [`Scheduler`].
#[derive(Default)]
pub struct SchedulerBuilder {
    tasks: Vec<Arc<dyn Task>>,
    filter: RunFilter,
    poll_interval: Option<Duration>,
}

impl SchedulerBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a task to the cycle. Order is preserved.
    pub fn task(mut self, task: Arc<dyn Task>) -> Self {
        self.tasks.push(task);
        self
    }

    /// Restrict every cycle to runs matching this filter.
    pub fn filter(mut self, filter: RunFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Set the pause between cycles (default: 60 seconds).
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    /// Build the scheduler.
    pub fn build(self) -> Scheduler {
        Scheduler {
            tasks: self.tasks,
            filter: self.filter,
            poll_interval: self.poll_interval.unwrap_or(Duration::from_secs(60)),
            shutdown: Arc::new(Notify::new()),
        }
    }
}

/// Runs the task set in a periodic polling loop.
pub struct Scheduler {
    tasks: Vec<Arc<dyn Task>>,
    filter: RunFilter,
    poll_interval: Duration,
    shutdown: Arc<Notify>,
}

impl Scheduler {
    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the polling loop until the shutdown signal is received.
    ///
    /// The first cycle starts immediately; subsequent cycles are separated
    /// by the poll interval.
    pub async fn run(&self) {
        info!(
            tasks = self.tasks.len(),
            poll_interval_secs = self.poll_interval.as_secs(),
            "Scheduler started"
        );

        loop {
            self.cycle().await;

            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Scheduler received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        info!("Scheduler stopped");
    }

    /// Run every task once. Returns the accumulated stats.
    pub async fn cycle(&self) -> TaskStats {
        let mut total = TaskStats::default();
        for task in &self.tasks {
            match task.go(&self.filter).await {
                Ok(stats) => {
                    info!(
                        task = task.name(),
                        runs = stats.runs_seen,
                        errors = stats.errors,
                        "task pass completed"
                    );
                    total.runs_seen += stats.runs_seen;
                    total.errors += stats.errors;
                }
                Err(e) => {
                    error!(
                        task = task.name(),
                        code = e.error_code(),
                        error = %e,
                        "task pass aborted"
                    );
                    total.errors += 1;
                }
            }
        }
        total
    }
}
