// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Push/pull transfer task.
//!
//! One handshake for every backend: announce the copy with a conditional
//! `transferring` stub, move the bytes, then advance the stub to
//! `verifying` and on to `transferred` or `failed`. The stub append is the
//! admission guard; when it is refused, another agent already owns this
//! copy and we walk away without touching anything.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::backend::{BackendFactory, TransferBackend, TransferSpec};
use crate::checksum::ChecksumProvider;
use crate::config::{HostEntry, HostRegistry};
use crate::error::CaxError;
use crate::model::{DataLocation, LocationStatus, RunDocument};
use crate::store::RunStore;

use super::{data_address, Task};

/// Which way data moves relative to the local host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// Copy local data out to the peers in `upload_to`.
    Push,
    /// Fetch remote data in from the peers in `download_from`.
    Pull,
}

impl TransferDirection {
    /// Task name for this direction.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::Pull => "pull",
        }
    }
}

/// Copies run data between the local host and its configured peers.
pub struct TransferTask {
    direction: TransferDirection,
    local_host: String,
    registry: Arc<HostRegistry>,
    store: Arc<dyn RunStore>,
    backends: Arc<dyn BackendFactory>,
    checksum: Option<Arc<dyn ChecksumProvider>>,
}

impl TransferTask {
    /// Create a transfer task for one direction.
    pub fn new(
        direction: TransferDirection,
        local_host: impl Into<String>,
        registry: Arc<HostRegistry>,
        store: Arc<dyn RunStore>,
        backends: Arc<dyn BackendFactory>,
    ) -> Self {
        Self {
            direction,
            local_host: local_host.into(),
            registry,
            store,
            backends,
            checksum: None,
        }
    }

    /// Enable inline verification of pulled copies with a local hasher.
    pub fn with_checksum(mut self, provider: Arc<dyn ChecksumProvider>) -> Self {
        self.checksum = Some(provider);
        self
    }

    async fn transfer_pair(&self, run: &RunDocument, peer: &str) -> Result<(), CaxError> {
        let (source_host, dest_host) = match self.direction {
            TransferDirection::Push => (self.local_host.as_str(), peer),
            TransferDirection::Pull => (peer, self.local_host.as_str()),
        };

        let source_entry = self.registry.get(source_host).ok_or(CaxError::UnknownHost {
            host: source_host.to_string(),
        })?;
        let dest_entry = self.registry.get(dest_host).ok_or(CaxError::UnknownHost {
            host: dest_host.to_string(),
        })?;

        // The peer's entry decides the mechanism: pushing to a grid site
        // and pulling from it both go through that site's method.
        let peer_entry = match self.direction {
            TransferDirection::Push => dest_entry,
            TransferDirection::Pull => source_entry,
        };
        let backend =
            self.backends
                .backend(&peer_entry.method)
                .ok_or(CaxError::UnsupportedMethod {
                    host: peer.to_string(),
                    method: peer_entry.method.clone(),
                })?;

        for source in run.data.iter().filter(|l| {
            l.host == source_host && l.status == LocationStatus::Transferred
        }) {
            if self.destination_blocked(run, dest_host, source, backend.retry_on_error()) {
                continue;
            }
            self.transfer_one(run, source, source_entry, dest_host, dest_entry, &*backend)
                .await?;
        }
        Ok(())
    }

    /// Whether an existing destination location rules out a new copy of
    /// this source. In-flight and completed copies always block; a `failed`
    /// copy blocks until an operator resolves the mismatch; an `error` copy
    /// blocks only for backends that cannot safely retry.
    fn destination_blocked(
        &self,
        run: &RunDocument,
        dest_host: &str,
        source: &DataLocation,
        retry_on_error: bool,
    ) -> bool {
        run.data.iter().any(|l| {
            l.host == dest_host
                && l.kind == source.kind
                && l.pax_version == source.pax_version
                && match l.status {
                    LocationStatus::Transferring
                    | LocationStatus::Verifying
                    | LocationStatus::Transferred
                    | LocationStatus::Failed => true,
                    LocationStatus::Error => !retry_on_error,
                }
        })
    }

    async fn transfer_one(
        &self,
        run: &RunDocument,
        source: &DataLocation,
        source_entry: &HostEntry,
        dest_host: &str,
        dest_entry: &HostEntry,
        backend: &dyn TransferBackend,
    ) -> Result<(), CaxError> {
        let address = data_address(dest_entry, run, source);
        let stub = DataLocation::transferring(
            source.kind,
            dest_host,
            address.clone(),
            source.pax_version.clone(),
        );

        if !self.store.add_location(run.detector, &run.name, &stub).await? {
            info!(
                run = %run.name,
                host = dest_host,
                kind = source.kind.as_str(),
                "another agent announced this copy first, skipping"
            );
            return Ok(());
        }
        let key = stub.key();

        let mut source_spec = TransferSpec::local(source.host.clone(), source.location.clone());
        let mut dest_spec = TransferSpec::local(dest_host, address);
        // Only the remote side carries SSH addressing; the local side
        // stays a plain path.
        match self.direction {
            TransferDirection::Push => {
                dest_spec.hostname = dest_entry.hostname.clone();
                dest_spec.account = dest_entry.account.clone();
            }
            TransferDirection::Pull => {
                source_spec.hostname = source_entry.hostname.clone();
                source_spec.account = source_entry.account.clone();
            }
        }

        info!(
            run = %run.name,
            source = %source.host,
            destination = dest_host,
            method = backend.method(),
            "starting copy"
        );

        if let Err(e) = backend.copy(&source_spec, &dest_spec).await {
            warn!(
                run = %run.name,
                destination = dest_host,
                method = backend.method(),
                error = %e,
                "copy failed, recording error location"
            );
            self.store
                .update_location_status(
                    run.detector,
                    &run.name,
                    &key,
                    Some(LocationStatus::Transferring),
                    LocationStatus::Error,
                    None,
                )
                .await?;
            return Ok(());
        }

        if !self
            .store
            .update_location_status(
                run.detector,
                &run.name,
                &key,
                Some(LocationStatus::Transferring),
                LocationStatus::Verifying,
                None,
            )
            .await?
        {
            return Err(CaxError::RaceDetected {
                name: run.name.clone(),
                host: dest_host.to_string(),
                operation: "update_location_status".to_string(),
            });
        }

        self.verify_fresh_copy(run, source, &key, &dest_spec, backend)
            .await
    }

    /// Inline verification right after the copy. Without a master checksum
    /// or a way to hash the destination, the location stays `verifying` for
    /// a later verification pass.
    async fn verify_fresh_copy(
        &self,
        run: &RunDocument,
        source: &DataLocation,
        key: &crate::model::LocationKey,
        dest_spec: &TransferSpec,
        backend: &dyn TransferBackend,
    ) -> Result<(), CaxError> {
        let Some(master) = source.checksum.as_deref() else {
            return Ok(());
        };

        let reported = backend
            .remote_checksum(dest_spec)
            .await
            .map_err(|e| CaxError::TransferFailed {
                method: backend.method().to_string(),
                details: e.to_string(),
            })?;
        let actual = match reported {
            Some(c) => c,
            None => match (&self.checksum, self.direction) {
                // A pulled copy lives on the local filesystem; hash it here.
                (Some(provider), TransferDirection::Pull) => {
                    provider.hash(Path::new(&dest_spec.address)).await?
                }
                _ => return Ok(()),
            },
        };

        if actual == master {
            self.store
                .update_location_status(
                    run.detector,
                    &run.name,
                    key,
                    Some(LocationStatus::Verifying),
                    LocationStatus::Transferred,
                    Some(&actual),
                )
                .await?;
        } else {
            let mismatch = CaxError::ChecksumMismatch {
                name: run.name.clone(),
                host: key.host.clone(),
                expected: master.to_string(),
                actual: actual.clone(),
            };
            error!(
                run = %run.name,
                host = %key.host,
                code = mismatch.error_code(),
                error = %mismatch,
                "fresh copy failed verification"
            );
            self.store
                .update_location_status(
                    run.detector,
                    &run.name,
                    key,
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
impl Task for TransferTask {
    fn name(&self) -> &'static str {
        self.direction.as_str()
    }

    fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    async fn each_run(&self, run: &RunDocument) -> Result<(), CaxError> {
        let peers: Vec<String> = match self.direction {
            TransferDirection::Push => self.registry.upload_options(&self.local_host).to_vec(),
            TransferDirection::Pull => self.registry.download_options(&self.local_host).to_vec(),
        };
        for peer in &peers {
            self.transfer_pair(run, peer).await?;
        }
        Ok(())
    }
}
