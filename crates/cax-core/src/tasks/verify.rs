// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Periodic checksum verification of local `verifying` copies.
//!
//! Settles copies the transfer handshake could not verify inline, for
//! example when the source had no checksum yet at copy time. The master
//! checksum is taken from the oldest `transferred` sibling of the same
//! kind; with no master available the copy simply stays `verifying` until
//! one appears.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};

use crate::checksum::ChecksumProvider;
use crate::error::CaxError;
use crate::model::{DataLocation, LocationStatus, RunDocument};
use crate::store::RunStore;

use super::Task;

/// Verifies local `verifying` locations against a master checksum.
pub struct VerifyTask {
    local_host: String,
    store: Arc<dyn RunStore>,
    checksum: Arc<dyn ChecksumProvider>,
}

impl VerifyTask {
    /// Create a verification task for the local host.
    pub fn new(
        local_host: impl Into<String>,
        store: Arc<dyn RunStore>,
        checksum: Arc<dyn ChecksumProvider>,
    ) -> Self {
        Self {
            local_host: local_host.into(),
            store,
            checksum,
        }
    }

    /// The master checksum for a location: the oldest `transferred` sibling
    /// of the same kind and pax version that carries one.
    fn master_checksum<'a>(run: &'a RunDocument, subject: &DataLocation) -> Option<&'a str> {
        run.data
            .iter()
            .filter(|l| {
                l.kind == subject.kind
                    && l.pax_version == subject.pax_version
                    && l.status == LocationStatus::Transferred
                    && l.checksum.is_some()
                    && !(l.host == subject.host && l.location == subject.location)
            })
            .min_by_key(|l| l.creation_time)
            .and_then(|l| l.checksum.as_deref())
    }

    async fn verify_one(
        &self,
        run: &RunDocument,
        location: &DataLocation,
    ) -> Result<(), CaxError> {
        let Some(master) = Self::master_checksum(run, location) else {
            return Ok(());
        };

        let actual = self.checksum.hash(Path::new(&location.location)).await?;
        let key = location.key();

        if actual == master {
            if self
                .store
                .update_location_status(
                    run.detector,
                    &run.name,
                    &key,
                    Some(LocationStatus::Verifying),
                    LocationStatus::Transferred,
                    Some(&actual),
                )
                .await?
            {
                info!(run = %run.name, host = %key.host, "copy verified");
            }
        } else {
            let mismatch = CaxError::ChecksumMismatch {
                name: run.name.clone(),
                host: key.host.clone(),
                expected: master.to_string(),
                actual,
            };
            error!(
                run = %run.name,
                host = %key.host,
                code = mismatch.error_code(),
                error = %mismatch,
                "copy failed verification"
            );
            self.store
                .update_location_status(
                    run.detector,
                    &run.name,
                    &key,
                    Some(LocationStatus::Verifying),
                    LocationStatus::Failed,
                    None,
                )
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Task for VerifyTask {
    fn name(&self) -> &'static str {
        "verify"
    }

    fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    async fn each_run(&self, run: &RunDocument) -> Result<(), CaxError> {
        for location in run
            .data
            .iter()
            .filter(|l| l.host == self.local_host && l.status == LocationStatus::Verifying)
        {
            self.verify_one(run, location).await?;
        }
        Ok(())
    }
}
