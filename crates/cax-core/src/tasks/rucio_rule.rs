// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Replication-rule reconciliation against the Rucio catalogue.
//!
//! Declarative rule sheets describe which runs should be replicated to
//! which storage elements; this task drives the catalogue toward that
//! state and writes the confirmed RSE set back into the catalogue
//! location. It only touches runs whose catalogue copy is `transferred`;
//! an unregistered DID has nothing to attach rules to.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::backend::rucio::split_did;
use crate::backend::RuleClient;
use crate::error::CaxError;
use crate::model::{DataLocation, LocationStatus, RunDocument};
use crate::store::RunStore;

use super::Task;

/// Symbolic host identifier of the Rucio catalogue in the registry.
pub const CATALOGUE_HOST: &str = "rucio-catalogue";

/// Lifetime sentinel: keep the rule forever.
pub const LIFETIME_PERMANENT: i64 = -1;
/// Lifetime sentinel: never create the rule, only report when it is missing.
pub const LIFETIME_VERIFY_ONLY: i64 = -2;

/// One target storage element in a rule definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleDestination {
    /// RSE expression the rule targets.
    pub rse: String,
    /// Rule lifetime in seconds, or one of the negative sentinels.
    #[serde(default = "permanent")]
    pub lifetime: i64,
}

fn permanent() -> i64 {
    LIFETIME_PERMANENT
}

/// A declarative replication policy for a slice of the run catalogue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleDefinition {
    /// Only these run names; empty means all.
    #[serde(default)]
    pub include_names: Vec<String>,
    /// Never these run names.
    #[serde(default)]
    pub exclude_names: Vec<String>,
    /// Lowest run number covered, inclusive.
    #[serde(default)]
    pub min_number: Option<i64>,
    /// Highest run number covered, inclusive.
    #[serde(default)]
    pub max_number: Option<i64>,
    /// RSEs that should hold a rule.
    #[serde(default)]
    pub destinations: Vec<RuleDestination>,
    /// RSEs whose rules should be removed.
    #[serde(default)]
    pub remove: Vec<String>,
}

impl RuleDefinition {
    /// Whether this definition covers the given run.
    pub fn matches(&self, run: &RunDocument) -> bool {
        if !self.include_names.is_empty() && !self.include_names.contains(&run.name) {
            return false;
        }
        if self.exclude_names.contains(&run.name) {
            return false;
        }
        if self.min_number.is_some() || self.max_number.is_some() {
            let Some(number) = run.number else {
                return false;
            };
            if self.min_number.is_some_and(|min| number < min) {
                return false;
            }
            if self.max_number.is_some_and(|max| number > max) {
                return false;
            }
        }
        true
    }
}

/// Reconciles catalogue replication rules with the rule definitions.
pub struct RucioRuleTask {
    store: Arc<dyn RunStore>,
    rules: Arc<dyn RuleClient>,
    definitions: Vec<RuleDefinition>,
}

impl RucioRuleTask {
    /// Create a reconciliation task over a set of rule definitions.
    pub fn new(
        store: Arc<dyn RunStore>,
        rules: Arc<dyn RuleClient>,
        definitions: Vec<RuleDefinition>,
    ) -> Self {
        Self {
            store,
            rules,
            definitions,
        }
    }

    async fn reconcile_location(
        &self,
        run: &RunDocument,
        location: &DataLocation,
    ) -> Result<(), CaxError> {
        let did = location.location.as_str();
        if split_did(did).is_none() {
            warn!(
                run = %run.name,
                address = did,
                "catalogue location address is not a scope:name DID, skipping"
            );
            return Ok(());
        }

        let rule_error = |e| CaxError::TransferFailed {
            method: "rucio".to_string(),
            details: format!("{}", e),
        };
        let current = self.rules.list_rules(did).await.map_err(rule_error)?;

        for definition in self.definitions.iter().filter(|d| d.matches(run)) {
            for destination in &definition.destinations {
                let exists = current.contains_key(&destination.rse);
                match destination.lifetime {
                    LIFETIME_VERIFY_ONLY => {
                        if !exists {
                            warn!(
                                run = %run.name,
                                did,
                                rse = %destination.rse,
                                "expected replication rule is missing"
                            );
                        }
                    }
                    LIFETIME_PERMANENT => {
                        if !exists {
                            self.rules
                                .set_rule(did, &destination.rse, None)
                                .await
                                .map_err(rule_error)?;
                            info!(run = %run.name, did, rse = %destination.rse, "created permanent rule");
                        }
                    }
                    lifetime => {
                        // Refresh the lifetime on every pass so it keeps
                        // counting from the latest reconciliation.
                        self.rules
                            .set_rule(did, &destination.rse, Some(lifetime))
                            .await
                            .map_err(rule_error)?;
                    }
                }
            }
            for rse in &definition.remove {
                if current.contains_key(rse) {
                    self.rules.delete_rule(did, rse).await.map_err(rule_error)?;
                    info!(run = %run.name, did, rse = %rse, "requested rule removal");
                }
            }
        }

        // Record which RSEs actually hold a complete replica.
        let after = self.rules.list_rules(did).await.map_err(rule_error)?;
        let mut confirmed: Vec<String> = after
            .iter()
            .filter(|(_, info)| info.state == crate::backend::RuleState::Ok)
            .map(|(rse, _)| rse.clone())
            .collect();
        confirmed.sort();

        let mut recorded = location.rse.clone();
        recorded.sort();
        if confirmed != recorded {
            self.store
                .set_location_rses(run.detector, &run.name, &location.key(), &confirmed)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Task for RucioRuleTask {
    fn name(&self) -> &'static str {
        "rucio-rules"
    }

    fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    async fn each_run(&self, run: &RunDocument) -> Result<(), CaxError> {
        for location in run.data.iter().filter(|l| {
            l.host == CATALOGUE_HOST && l.status == LocationStatus::Transferred
        }) {
            self.reconcile_location(run, location).await?;
        }
        Ok(())
    }
}
