// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tape archive backend.
//!
//! Wraps the TSM `dsmc` client. Archiving to tape and retrieving from it
//! are driven by which side of the transfer is the tape server's symbolic
//! host; the tape side's address is the archive description under which
//! the run was filed.

use async_trait::async_trait;
use tokio::process::Command;

use super::{run_cli, TransferBackend, TransferError, TransferSpec};

/// Symbolic host identifier of the tape server in the registry.
pub const TAPE_HOST: &str = "tsm-server";

/// Archives and retrieves run data with `dsmc`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TapeBackend;

impl TapeBackend {
    /// Create a new tape backend.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransferBackend for TapeBackend {
    fn method(&self) -> &'static str {
        "tape"
    }

    async fn copy(
        &self,
        source: &TransferSpec,
        destination: &TransferSpec,
    ) -> Result<(), TransferError> {
        if destination.host == TAPE_HOST {
            let mut cmd = Command::new("dsmc");
            cmd.arg("archive")
                .arg("-subdir=yes")
                .arg(format!("-description={}", destination.address))
                .arg(format!("{}/", source.address.trim_end_matches('/')));
            run_cli(&mut cmd, "dsmc").await?;
            Ok(())
        } else if source.host == TAPE_HOST {
            let mut cmd = Command::new("dsmc");
            cmd.arg("retrieve")
                .arg("-subdir=yes")
                .arg(format!("-description={}", source.address))
                .arg(format!("{}/", destination.address.trim_end_matches('/')));
            run_cli(&mut cmd, "dsmc").await?;
            Ok(())
        } else {
            Err(TransferError::BadAddress(format!(
                "tape transfer without a '{}' side: '{}' -> '{}'",
                TAPE_HOST, source.host, destination.host
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rejects_transfer_without_tape_side() {
        let backend = TapeBackend::new();
        let a = TransferSpec::local("siteA", "/data/siteA/160315_1824");
        let b = TransferSpec::local("siteB", "/data/siteB/160315_1824");
        let err = backend.copy(&a, &b).await.unwrap_err();
        assert!(matches!(err, TransferError::BadAddress(_)));
    }
}
