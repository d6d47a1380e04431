// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The task protocol: uniform, resumable iteration over runs that might
//! need work.
//!
//! [`Task::go`] pages through the store and dispatches each run to the
//! task's own logic. Which runs need attention is generic and store-driven;
//! what to do about them lives in the leaf tasks. A failure in one run is
//! logged and counted, never allowed to abort the pass: one bad document
//! must not starve every other run of its poll cycle.

pub mod clear;
pub mod rucio_rule;
pub mod stale;
pub mod transfer;
pub mod verify;

pub use self::clear::ClearTask;
pub use self::rucio_rule::{RuleDefinition, RuleDestination, RucioRuleTask};
pub use self::stale::StaleTask;
pub use self::transfer::{TransferDirection, TransferTask};
pub use self::verify::VerifyTask;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::error::CaxError;
use crate::model::{DataLocation, RunDocument};
use crate::store::{RunFilter, RunStore};

/// Page size for store iteration.
const PAGE_SIZE: i64 = 200;

/// Outcome of one full pass over a filter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskStats {
    /// Runs dispatched to `each_run`.
    pub runs_seen: u64,
    /// Runs whose processing failed.
    pub errors: u64,
}

impl TaskStats {
    /// Whether the pass completed without per-run failures.
    pub fn is_clean(&self) -> bool {
        self.errors == 0
    }
}

/// A unit of periodic work over run documents.
#[async_trait]
pub trait Task: Send + Sync {
    /// Task name, used in logs.
    fn name(&self) -> &'static str;

    /// The store this task iterates.
    fn store(&self) -> &Arc<dyn RunStore>;

    /// Process one run. The default iterates the run's data array and
    /// calls [`each_location`](Self::each_location) for every entry; tasks
    /// that need whole-run reasoning override this directly.
    async fn each_run(&self, run: &RunDocument) -> Result<(), CaxError> {
        for location in &run.data {
            self.each_location(run, location).await?;
        }
        Ok(())
    }

    /// Process one data location of a run. Leaf tasks that work
    /// per-location implement this.
    async fn each_location(
        &self,
        _run: &RunDocument,
        _location: &DataLocation,
    ) -> Result<(), CaxError> {
        Ok(())
    }

    /// One full pass: fetch runs matching `filter` until none remain and
    /// dispatch each to [`each_run`](Self::each_run). Reads are allowed to
    /// be stale; the per-document store operations are what keep concurrent
    /// agents consistent.
    async fn go(&self, filter: &RunFilter) -> Result<TaskStats, CaxError> {
        let mut stats = TaskStats::default();
        let mut offset = 0i64;

        loop {
            let page = self.store().find_runs(filter, PAGE_SIZE, offset).await?;
            if page.is_empty() {
                break;
            }
            offset += page.len() as i64;

            for run in &page {
                stats.runs_seen += 1;
                if let Err(e) = self.each_run(run).await {
                    stats.errors += 1;
                    warn!(
                        task = self.name(),
                        run = %run.name,
                        code = e.error_code(),
                        error = %e,
                        "run processing failed, continuing with next run"
                    );
                }
            }
        }

        Ok(stats)
    }
}

/// Remove the physical data at a local path. A path that is already gone
/// is fine; the store pull is what matters.
pub(crate) async fn purge_path(path: &str) -> Result<(), CaxError> {
    let io_err = |e: std::io::Error| CaxError::Io {
        path: path.to_string(),
        details: e.to_string(),
    };

    match tokio::fs::metadata(path).await {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_err(e)),
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await.map_err(io_err),
        Ok(_) => tokio::fs::remove_file(path).await.map_err(io_err),
    }
}

/// The destination-side data address for a run on a given host.
///
/// Catalogue methods address by `scope:name` DID with the registry
/// directory as the scope; path methods join the registry directory with
/// the run name, with processed data split out per pax version.
pub(crate) fn data_address(
    entry: &crate::config::HostEntry,
    run: &RunDocument,
    location: &DataLocation,
) -> String {
    if entry.method == "rucio" {
        return format!("{}:{}", entry.directory, run.name);
    }
    match &location.pax_version {
        Some(version) => format!("{}/pax_{}/{}", entry.directory, version, run.name),
        None => format!("{}/{}", entry.directory, run.name),
    }
}
