// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stale transfer monitoring and purging.
//!
//! Transfers die quietly when an agent crashes mid-copy: the location stays
//! `transferring` or `verifying` forever while the bytes on disk are
//! garbage. After a warning window this task flags them; after a longer
//! window it deletes the local debris, but only while the data remains
//! redundant elsewhere. Deletion with fewer than two healthy copies is
//! never worth the disk space.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tracing::{info, warn};

use crate::error::CaxError;
use crate::model::{DataLocation, LocationStatus, RunDocument};
use crate::store::RunStore;

use super::{purge_path, Task};

/// Flags and purges locations stuck in a non-terminal status.
pub struct StaleTask {
    local_host: String,
    store: Arc<dyn RunStore>,
    warn_after: Duration,
    purge_after: Duration,
}

impl StaleTask {
    /// Create a staleness task. `warn_after` must not exceed `purge_after`.
    pub fn new(
        local_host: impl Into<String>,
        store: Arc<dyn RunStore>,
        warn_after: Duration,
        purge_after: Duration,
    ) -> Self {
        Self {
            local_host: local_host.into(),
            store,
            warn_after,
            purge_after,
        }
    }

    /// Whether the run still holds at least two other healthy copies of the
    /// same data, all agreeing on the checksum.
    fn redundancy_met(run: &RunDocument, subject: &DataLocation) -> bool {
        let subject_key = subject.key();
        let checksums: Vec<&str> = run
            .data
            .iter()
            .filter(|l| {
                l.kind == subject.kind
                    && l.pax_version == subject.pax_version
                    && l.status == LocationStatus::Transferred
                    && !subject_key.matches(l)
            })
            .filter_map(|l| l.checksum.as_deref())
            .collect();
        checksums.len() >= 2 && checksums.windows(2).all(|w| w[0] == w[1])
    }

    async fn purge(&self, run: &RunDocument, location: &DataLocation) -> Result<(), CaxError> {
        purge_path(&location.location).await?;
        let removed = self
            .store
            .remove_location(run.detector, &run.name, &location.key())
            .await?;
        info!(
            run = %run.name,
            host = %location.host,
            status = location.status.as_str(),
            path = %location.location,
            removed,
            "purged stale transfer"
        );
        Ok(())
    }
}

#[async_trait]
impl Task for StaleTask {
    fn name(&self) -> &'static str {
        "stale"
    }

    fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    async fn each_run(&self, run: &RunDocument) -> Result<(), CaxError> {
        let now = Utc::now();
        for location in run.data.iter().filter(|l| !l.status.is_terminal()) {
            let age = location.age(now);
            if age < self.warn_after {
                continue;
            }

            if age < self.purge_after || location.host != self.local_host {
                warn!(
                    run = %run.name,
                    host = %location.host,
                    status = location.status.as_str(),
                    age_hours = age.num_hours(),
                    "stale transfer"
                );
                continue;
            }

            if Self::redundancy_met(run, location) {
                self.purge(run, location).await?;
            } else {
                warn!(
                    run = %run.name,
                    host = %location.host,
                    status = location.status.as_str(),
                    age_hours = age.num_hours(),
                    "stale transfer exceeds purge window but lacks redundancy, keeping"
                );
            }
        }
        Ok(())
    }
}
