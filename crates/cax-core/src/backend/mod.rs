// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transfer backend definitions.
//!
//! Each backend wraps one copy mechanism (SCP, GFAL, Rucio, tape archive)
//! behind the same narrow interface, so the transfer handshake exists
//! exactly once and the backends only supply the byte movement.

pub mod gfal;
pub mod mock;
pub mod rucio;
pub mod scp;
pub mod tape;

pub use self::gfal::GfalBackend;
pub use self::mock::{MockBackend, MockRuleClient};
pub use self::rucio::{RucioBackend, RuleClient, RuleInfo, RuleState};
pub use self::scp::ScpBackend;
pub use self::tape::TapeBackend;

use std::collections::HashMap;
use std::process::Output;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

/// Errors from transfer backend operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransferError {
    /// External command exited non-zero.
    #[error("{program} exited with code {exit_code}: {stderr}")]
    CommandFailed {
        /// The program that was invoked.
        program: String,
        /// Exit code from the process.
        exit_code: i32,
        /// Captured standard error output.
        stderr: String,
    },

    /// A source or destination descriptor was malformed for this backend.
    #[error("bad address: {0}")]
    BadAddress(String),

    /// Backend CLI output could not be parsed.
    #[error("unparseable output: {0}")]
    Parse(String),

    /// I/O failure spawning or talking to the external command.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One side of a transfer, resolved from the host registry.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferSpec {
    /// Host identifier in the registry.
    pub host: String,
    /// Backend-specific address: a filesystem path, a grid URL, or a
    /// `scope:name` DID.
    pub address: String,
    /// Network hostname for SSH-style addressing; symbolic sites have none.
    pub hostname: Option<String>,
    /// Account used when connecting.
    pub account: Option<String>,
}

impl TransferSpec {
    /// A purely local side (no remote hostname).
    pub fn local(host: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            address: address.into(),
            hostname: None,
            account: None,
        }
    }
}

/// Performs the actual byte movement between two locations.
#[async_trait]
pub trait TransferBackend: Send + Sync {
    /// The registry method string this backend serves.
    fn method(&self) -> &'static str;

    /// Whether an `error` location at a destination should block a new
    /// attempt at the same pair.
    fn retry_on_error(&self) -> bool {
        true
    }

    /// Copy from `source` to `destination`. Failure leaves any partial
    /// destination data in place; compensation is the caller's job.
    async fn copy(
        &self,
        source: &TransferSpec,
        destination: &TransferSpec,
    ) -> Result<(), TransferError>;

    /// Checksum of a destination this backend can report on without local
    /// filesystem access (e.g. a catalogue-reported adler32). `None` when
    /// the backend cannot verify remotely.
    async fn remote_checksum(&self, _spec: &TransferSpec) -> Result<Option<String>, TransferError> {
        Ok(None)
    }
}

/// Resolves a registry method string to a backend instance.
pub trait BackendFactory: Send + Sync {
    /// The backend for a method, or `None` when unsupported.
    fn backend(&self, method: &str) -> Option<Arc<dyn TransferBackend>>;
}

/// Factory for the real CLI-wrapping backends.
#[derive(Default)]
pub struct CliBackends {
    backends: HashMap<&'static str, Arc<dyn TransferBackend>>,
}

impl CliBackends {
    /// Build the full backend set.
    pub fn new() -> Self {
        let mut backends: HashMap<&'static str, Arc<dyn TransferBackend>> = HashMap::new();
        for backend in [
            Arc::new(ScpBackend::new()) as Arc<dyn TransferBackend>,
            Arc::new(GfalBackend::new()),
            Arc::new(RucioBackend::new(None)),
            Arc::new(TapeBackend::new()),
        ] {
            backends.insert(backend.method(), backend);
        }
        Self { backends }
    }
}

impl BackendFactory for CliBackends {
    fn backend(&self, method: &str) -> Option<Arc<dyn TransferBackend>> {
        self.backends.get(method).cloned()
    }
}

/// Run an external command, mapping a non-zero exit to
/// [`TransferError::CommandFailed`] with captured stderr.
pub(crate) async fn run_cli(command: &mut Command, program: &str) -> Result<String, TransferError> {
    let output: Output = command.output().await?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        Err(TransferError::CommandFailed {
            program: program.to_string(),
            exit_code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}
