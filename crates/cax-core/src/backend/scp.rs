// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SCP/SSH transfer backend.

use async_trait::async_trait;
use tokio::process::Command;

use super::{run_cli, TransferBackend, TransferError, TransferSpec};

/// Copies run data over SSH with `scp -r`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScpBackend;

impl ScpBackend {
    /// Create a new SCP backend.
    pub fn new() -> Self {
        Self
    }

    fn endpoint(spec: &TransferSpec) -> String {
        match &spec.hostname {
            Some(hostname) => match &spec.account {
                Some(account) => format!("{}@{}:{}", account, hostname, spec.address),
                None => format!("{}:{}", hostname, spec.address),
            },
            None => spec.address.clone(),
        }
    }
}

#[async_trait]
impl TransferBackend for ScpBackend {
    fn method(&self) -> &'static str {
        "scp"
    }

    async fn copy(
        &self,
        source: &TransferSpec,
        destination: &TransferSpec,
    ) -> Result<(), TransferError> {
        let mut cmd = Command::new("scp");
        cmd.args(["-r", "-o", "BatchMode=yes"])
            .arg(Self::endpoint(source))
            .arg(Self::endpoint(destination));
        run_cli(&mut cmd, "scp").await?;
        Ok(())
    }
}
