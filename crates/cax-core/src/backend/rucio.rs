// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Rucio catalogue backend: DID upload/download plus replication-rule
//! management.
//!
//! Rucio-backed locations carry a second, nested state machine: one
//! replication rule per storage element (RSE), with its own lifecycle
//! independent of the data location's status. The rule operations are
//! exposed behind [`RuleClient`] so the reconciliation task can be tested
//! without the CLI.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::process::Command;

use super::{run_cli, TransferBackend, TransferError, TransferSpec};

/// State of a replication rule at one RSE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleState {
    /// All replicas in place.
    Ok,
    /// Replication in progress.
    Replicating,
    /// Rule is stuck and needs attention.
    Stuck,
}

impl RuleState {
    /// Parse the state out of a `STATE[OK/REPL/STUCK]`-style CLI token.
    pub fn parse(token: &str) -> Option<Self> {
        let name = token.split('[').next()?;
        match name {
            "OK" => Some(Self::Ok),
            "REPLICATING" => Some(Self::Replicating),
            "STUCK" => Some(Self::Stuck),
            _ => None,
        }
    }
}

/// One replication rule as reported by the catalogue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleInfo {
    /// Rule identifier, needed for updates and deletion.
    pub id: String,
    /// Current rule state.
    pub state: RuleState,
}

/// Replication-rule operations, keyed by DID and RSE.
#[async_trait]
pub trait RuleClient: Send + Sync {
    /// The rules currently attached to a DID, by RSE expression.
    async fn list_rules(&self, did: &str) -> Result<HashMap<String, RuleInfo>, TransferError>;

    /// Idempotently ensure a rule exists for `rse`. Creates the rule when
    /// absent; when present, updates its lifetime if one is given.
    /// `lifetime` is in seconds, `None` meaning permanent.
    async fn set_rule(
        &self,
        did: &str,
        rse: &str,
        lifetime: Option<i64>,
    ) -> Result<(), TransferError>;

    /// Request asynchronous removal of the rule for `rse`. Removal is not
    /// immediate: the catalogue reports an expiry time, not a deletion.
    /// A missing rule is not an error.
    async fn delete_rule(&self, did: &str, rse: &str) -> Result<(), TransferError>;
}

/// Rucio CLI backend.
#[derive(Debug, Default, Clone)]
pub struct RucioBackend {
    account: Option<String>,
}

impl RucioBackend {
    /// Create a backend, optionally pinning the Rucio account.
    pub fn new(account: Option<String>) -> Self {
        Self { account }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("rucio");
        if let Some(account) = &self.account {
            cmd.arg("-a").arg(account);
        }
        cmd
    }
}

#[async_trait]
impl TransferBackend for RucioBackend {
    fn method(&self) -> &'static str {
        "rucio"
    }

    // A failed catalogue registration leaves partial state behind in the
    // catalogue itself; re-uploading the same DID without cleanup makes it
    // worse. Operators clear the error location explicitly first.
    fn retry_on_error(&self) -> bool {
        false
    }

    async fn copy(
        &self,
        source: &TransferSpec,
        destination: &TransferSpec,
    ) -> Result<(), TransferError> {
        if let Some((scope, _name)) = split_did(&destination.address) {
            // Local path -> catalogue: register and upload.
            let mut cmd = self.command();
            cmd.arg("upload")
                .arg("--scope")
                .arg(scope)
                .arg(&source.address);
            run_cli(&mut cmd, "rucio").await?;
            Ok(())
        } else if split_did(&source.address).is_some() {
            // Catalogue -> local directory.
            let mut cmd = self.command();
            cmd.arg("download")
                .arg(&source.address)
                .arg("--dir")
                .arg(&destination.address);
            run_cli(&mut cmd, "rucio").await?;
            Ok(())
        } else {
            Err(TransferError::BadAddress(format!(
                "neither side is a scope:name DID: '{}' -> '{}'",
                source.address, destination.address
            )))
        }
    }

    async fn remote_checksum(&self, spec: &TransferSpec) -> Result<Option<String>, TransferError> {
        if split_did(&spec.address).is_none() {
            return Ok(None);
        }
        let mut cmd = self.command();
        cmd.arg("list-files").arg(&spec.address);
        let output = run_cli(&mut cmd, "rucio").await?;
        Ok(parse_adler32(&output))
    }
}

#[async_trait]
impl RuleClient for RucioBackend {
    async fn list_rules(&self, did: &str) -> Result<HashMap<String, RuleInfo>, TransferError> {
        let mut cmd = self.command();
        cmd.arg("list-rules").arg(did);
        let output = run_cli(&mut cmd, "rucio").await?;
        parse_rules(&output)
    }

    async fn set_rule(
        &self,
        did: &str,
        rse: &str,
        lifetime: Option<i64>,
    ) -> Result<(), TransferError> {
        let rules = self.list_rules(did).await?;
        match rules.get(rse) {
            None => {
                let mut cmd = self.command();
                cmd.arg("add-rule").arg(did).arg("1").arg(rse);
                if let Some(lifetime) = lifetime {
                    cmd.arg("--lifetime").arg(lifetime.to_string());
                }
                run_cli(&mut cmd, "rucio").await?;
            }
            Some(rule) => {
                if let Some(lifetime) = lifetime {
                    let mut cmd = self.command();
                    cmd.arg("update-rule")
                        .arg("--lifetime")
                        .arg(lifetime.to_string())
                        .arg(&rule.id);
                    run_cli(&mut cmd, "rucio").await?;
                }
            }
        }
        Ok(())
    }

    async fn delete_rule(&self, did: &str, rse: &str) -> Result<(), TransferError> {
        let rules = self.list_rules(did).await?;
        if let Some(rule) = rules.get(rse) {
            let mut cmd = self.command();
            cmd.arg("delete-rule").arg(&rule.id);
            run_cli(&mut cmd, "rucio").await?;
        }
        Ok(())
    }
}

/// Split a `scope:name` DID. Grid URLs and plain paths return `None`.
pub fn split_did(address: &str) -> Option<(&str, &str)> {
    if address.contains('/') {
        return None;
    }
    let (scope, name) = address.split_once(':')?;
    if scope.is_empty() || name.is_empty() {
        return None;
    }
    Some((scope, name))
}

fn parse_rules(output: &str) -> Result<HashMap<String, RuleInfo>, TransferError> {
    let mut rules = HashMap::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        // Data rows: ID ACCOUNT SCOPE:NAME STATE[x/y/z] RSE_EXPRESSION ...
        let Some(state_index) = fields.iter().position(|f| f.contains('[')) else {
            continue;
        };
        let Some(state) = RuleState::parse(fields[state_index]) else {
            continue;
        };
        let Some(rse) = fields.get(state_index + 1) else {
            return Err(TransferError::Parse(format!(
                "rule line without RSE expression: '{}'",
                line
            )));
        };
        rules.insert(
            rse.to_string(),
            RuleInfo {
                id: fields[0].to_string(),
                state,
            },
        );
    }
    Ok(rules)
}

fn parse_adler32(output: &str) -> Option<String> {
    output
        .split_whitespace()
        .find_map(|token| token.strip_prefix("ad:"))
        .map(|c| c.trim_matches('|').to_string())
}
