// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! GFAL grid transfer backend.
//!
//! Wraps `gfal-copy` between grid URLs (srm://, gsiftp://, root://, or
//! plain file paths). Long transfers are expected; the timeout is measured
//! in hours, not seconds.

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use super::{run_cli, TransferBackend, TransferError, TransferSpec};

/// Copies run data with `gfal-copy`.
#[derive(Debug, Clone, Copy)]
pub struct GfalBackend {
    timeout: Duration,
}

impl Default for GfalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl GfalBackend {
    /// Create a backend with the default 9 hour transfer timeout.
    pub fn new() -> Self {
        Self {
            timeout: Duration::from_secs(9 * 3600),
        }
    }

    /// Override the transfer timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl TransferBackend for GfalBackend {
    fn method(&self) -> &'static str {
        "gfal-copy"
    }

    async fn copy(
        &self,
        source: &TransferSpec,
        destination: &TransferSpec,
    ) -> Result<(), TransferError> {
        let mut cmd = Command::new("gfal-copy");
        cmd.args([
            "-p", // create destination parents
            "-f", // overwrite a partial earlier attempt
            "-r", // recurse into run directories
            "-t",
        ])
        .arg(self.timeout.as_secs().to_string())
        .arg(&source.address)
        .arg(&destination.address);
        run_cli(&mut cmd, "gfal-copy").await?;
        Ok(())
    }
}
