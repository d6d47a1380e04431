// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock transfer backend and rule client for testing.
//!
//! Simulates byte movement and rule management without shelling out, and
//! records every call so tests can assert on what the tasks attempted.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{
    RuleClient, RuleInfo, RuleState, TransferBackend, TransferError, TransferSpec,
};

/// Mock transfer backend.
#[derive(Default)]
pub struct MockBackend {
    /// When true, every copy fails with a connection error.
    fail: AtomicBool,
    /// Checksum reported for any destination, simulating a
    /// backend-reported hash.
    pub reported_checksum: Mutex<Option<String>>,
    /// Every (source, destination) address pair attempted.
    pub copies: Mutex<Vec<(String, String)>>,
}

impl MockBackend {
    /// Create a mock backend whose copies succeed.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a mock backend whose copies fail.
    pub fn failing() -> Arc<Self> {
        let backend = Self::default();
        backend.fail.store(true, Ordering::SeqCst);
        Arc::new(backend)
    }

    /// Create a mock backend reporting the given destination checksum.
    pub fn with_checksum(checksum: &str) -> Arc<Self> {
        Arc::new(Self {
            reported_checksum: Mutex::new(Some(checksum.to_string())),
            ..Self::default()
        })
    }

    /// Flip the failure switch.
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl TransferBackend for MockBackend {
    fn method(&self) -> &'static str {
        "mock"
    }

    async fn copy(
        &self,
        source: &TransferSpec,
        destination: &TransferSpec,
    ) -> Result<(), TransferError> {
        self.copies
            .lock()
            .await
            .push((source.address.clone(), destination.address.clone()));
        if self.fail.load(Ordering::SeqCst) {
            return Err(TransferError::CommandFailed {
                program: "mock".to_string(),
                exit_code: 1,
                stderr: "connection refused".to_string(),
            });
        }
        Ok(())
    }

    async fn remote_checksum(&self, _spec: &TransferSpec) -> Result<Option<String>, TransferError> {
        Ok(self.reported_checksum.lock().await.clone())
    }
}

/// Mock rule client backed by an in-memory rule table.
#[derive(Default)]
pub struct MockRuleClient {
    /// DID -> RSE -> rule. Tests seed and inspect this directly.
    pub rules: Mutex<HashMap<String, HashMap<String, RuleInfo>>>,
    /// Every (did, rse, lifetime) passed to `set_rule`.
    pub set_calls: Mutex<Vec<(String, String, Option<i64>)>>,
    /// Every (did, rse) passed to `delete_rule`.
    pub delete_calls: Mutex<Vec<(String, String)>>,
}

impl MockRuleClient {
    /// Create an empty mock rule client.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Seed an existing rule.
    pub async fn seed(&self, did: &str, rse: &str, state: RuleState) {
        self.rules.lock().await.entry(did.to_string()).or_default().insert(
            rse.to_string(),
            RuleInfo {
                id: format!("rule-{}-{}", did, rse),
                state,
            },
        );
    }
}

#[async_trait]
impl RuleClient for MockRuleClient {
    async fn list_rules(&self, did: &str) -> Result<HashMap<String, RuleInfo>, TransferError> {
        Ok(self.rules.lock().await.get(did).cloned().unwrap_or_default())
    }

    async fn set_rule(
        &self,
        did: &str,
        rse: &str,
        lifetime: Option<i64>,
    ) -> Result<(), TransferError> {
        self.set_calls
            .lock()
            .await
            .push((did.to_string(), rse.to_string(), lifetime));
        self.rules.lock().await.entry(did.to_string()).or_default().insert(
            rse.to_string(),
            RuleInfo {
                id: format!("rule-{}-{}", did, rse),
                state: RuleState::Replicating,
            },
        );
        Ok(())
    }

    async fn delete_rule(&self, did: &str, rse: &str) -> Result<(), TransferError> {
        self.delete_calls
            .lock()
            .await
            .push((did.to_string(), rse.to_string()));
        if let Some(rules) = self.rules.lock().await.get_mut(did) {
            rules.remove(rse);
        }
        Ok(())
    }
}
