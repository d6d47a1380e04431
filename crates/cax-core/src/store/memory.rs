// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory store backend.
//!
//! Backs unit tests and embedded use. Enforces the same conditional-insert
//! rule as the SQLite backend: the whole map sits behind one mutex, so each
//! trait method is a single atomic action just like a real document store's
//! per-document operations.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::CaxError;
use crate::model::{DataLocation, Detector, LocationKey, LocationStatus, RunDocument};

use super::{RunFilter, RunStore};

/// In-memory run store.
#[derive(Default)]
pub struct MemoryStore {
    runs: Mutex<BTreeMap<(Detector, String), RunDocument>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with the given runs.
    pub async fn with_runs(runs: Vec<RunDocument>) -> Result<Self, CaxError> {
        let store = Self::new();
        for run in &runs {
            store.insert_run(run).await?;
        }
        Ok(store)
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn find_runs(
        &self,
        filter: &RunFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<RunDocument>, CaxError> {
        let runs = self.runs.lock().await;
        Ok(runs
            .values()
            .filter(|r| filter.accepts(r))
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn get_run(
        &self,
        detector: Detector,
        name: &str,
    ) -> Result<Option<RunDocument>, CaxError> {
        let runs = self.runs.lock().await;
        Ok(runs.get(&(detector, name.to_string())).cloned())
    }

    async fn insert_run(&self, run: &RunDocument) -> Result<(), CaxError> {
        run.validate()?;
        let mut runs = self.runs.lock().await;
        let key = (run.detector, run.name.clone());
        if runs.contains_key(&key) {
            return Err(CaxError::ValidationError {
                field: "name".to_string(),
                message: format!("run '{}' already exists", run.name),
            });
        }
        runs.insert(key, run.clone());
        Ok(())
    }

    async fn delete_run(&self, detector: Detector, name: &str) -> Result<bool, CaxError> {
        let mut runs = self.runs.lock().await;
        Ok(runs.remove(&(detector, name.to_string())).is_some())
    }

    async fn add_location(
        &self,
        detector: Detector,
        name: &str,
        location: &DataLocation,
    ) -> Result<bool, CaxError> {
        let mut runs = self.runs.lock().await;
        let run = runs
            .get_mut(&(detector, name.to_string()))
            .ok_or_else(|| CaxError::RunNotFound {
                detector: detector.as_str().to_string(),
                name: name.to_string(),
            })?;

        let key = location.key();
        let blocked = run
            .data
            .iter()
            .any(|l| l.status != LocationStatus::Error && key.matches(l));
        if blocked {
            return Ok(false);
        }
        run.data.push(location.clone());
        Ok(true)
    }

    async fn update_location_status(
        &self,
        detector: Detector,
        name: &str,
        key: &LocationKey,
        expected: Option<LocationStatus>,
        new_status: LocationStatus,
        checksum: Option<&str>,
    ) -> Result<bool, CaxError> {
        let mut runs = self.runs.lock().await;
        let Some(run) = runs.get_mut(&(detector, name.to_string())) else {
            return Ok(false);
        };
        let Some(location) = run.data.iter_mut().find(|l| {
            key.matches(l) && expected.map(|e| l.status == e).unwrap_or(true)
        }) else {
            return Ok(false);
        };

        location.status = new_status;
        if let Some(checksum) = checksum {
            location.checksum = Some(checksum.to_string());
        }
        Ok(true)
    }

    async fn remove_location(
        &self,
        detector: Detector,
        name: &str,
        key: &LocationKey,
    ) -> Result<bool, CaxError> {
        let mut runs = self.runs.lock().await;
        let Some(run) = runs.get_mut(&(detector, name.to_string())) else {
            return Ok(false);
        };
        let before = run.data.len();
        run.data.retain(|l| !key.matches(l));
        Ok(run.data.len() < before)
    }

    async fn set_location_rses(
        &self,
        detector: Detector,
        name: &str,
        key: &LocationKey,
        rses: &[String],
    ) -> Result<bool, CaxError> {
        let mut runs = self.runs.lock().await;
        let Some(run) = runs.get_mut(&(detector, name.to_string())) else {
            return Ok(false);
        };
        let Some(location) = run.data.iter_mut().find(|l| key.matches(l)) else {
            return Ok(false);
        };
        location.rse = rses.to_vec();
        Ok(true)
    }

    async fn health_check(&self) -> Result<bool, CaxError> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LocationType;

    fn run_with_source() -> RunDocument {
        let mut run = RunDocument::new(Detector::Tpc, Some(1), "160315_1824");
        let mut source = DataLocation::transferring(
            LocationType::Raw,
            "siteA",
            "/data/siteA/160315_1824",
            None,
        );
        source.status = LocationStatus::Transferred;
        source.checksum = Some("abc".to_string());
        run.data.push(source);
        run
    }

    #[tokio::test]
    async fn test_conditional_insert_refuses_duplicate_key() {
        let store = MemoryStore::with_runs(vec![run_with_source()]).await.unwrap();
        let stub = DataLocation::transferring(
            LocationType::Raw,
            "siteB",
            "/data/siteB/160315_1824",
            None,
        );

        assert!(store.add_location(Detector::Tpc, "160315_1824", &stub).await.unwrap());
        // Second announcement for the same destination loses.
        assert!(!store.add_location(Detector::Tpc, "160315_1824", &stub).await.unwrap());

        let run = store.get_run(Detector::Tpc, "160315_1824").await.unwrap().unwrap();
        assert_eq!(run.data.len(), 2);
    }

    #[tokio::test]
    async fn test_conditional_insert_allows_retry_after_error() {
        let store = MemoryStore::with_runs(vec![run_with_source()]).await.unwrap();
        let stub = DataLocation::transferring(
            LocationType::Raw,
            "siteB",
            "/data/siteB/160315_1824",
            None,
        );
        store.add_location(Detector::Tpc, "160315_1824", &stub).await.unwrap();
        store
            .update_location_status(
                Detector::Tpc,
                "160315_1824",
                &stub.key(),
                Some(LocationStatus::Transferring),
                LocationStatus::Error,
                None,
            )
            .await
            .unwrap();

        // The errored copy does not block a fresh attempt.
        assert!(store.add_location(Detector::Tpc, "160315_1824", &stub).await.unwrap());
    }

    #[tokio::test]
    async fn test_guarded_update_reports_lost_race() {
        let store = MemoryStore::with_runs(vec![run_with_source()]).await.unwrap();
        let key = LocationKey {
            host: "siteA".to_string(),
            kind: LocationType::Raw,
            pax_version: None,
        };

        // Location is transferred, not transferring; the guard must refuse.
        let matched = store
            .update_location_status(
                Detector::Tpc,
                "160315_1824",
                &key,
                Some(LocationStatus::Transferring),
                LocationStatus::Verifying,
                None,
            )
            .await
            .unwrap();
        assert!(!matched);
    }

    #[tokio::test]
    async fn test_push_then_pull_restores_data_array() {
        let store = MemoryStore::with_runs(vec![run_with_source()]).await.unwrap();
        let before = store
            .get_run(Detector::Tpc, "160315_1824")
            .await
            .unwrap()
            .unwrap();

        let mut stub = DataLocation::transferring(
            LocationType::Processed,
            "siteB",
            "/data/siteB/pax_6.8.0/160315_1824",
            Some("6.8.0".to_string()),
        );
        stub.extra
            .insert("pax_hash".to_string(), serde_json::json!("deadbeef"));

        store.add_location(Detector::Tpc, "160315_1824", &stub).await.unwrap();
        assert!(store
            .remove_location(Detector::Tpc, "160315_1824", &stub.key())
            .await
            .unwrap());

        let after = store
            .get_run(Detector::Tpc, "160315_1824")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(before.data, after.data);
    }

    #[tokio::test]
    async fn test_filter_excludes_tagged_runs() {
        let mut tagged = run_with_source();
        tagged.name = "160316_0000".to_string();
        tagged.tags.push(crate::model::Tag {
            name: "donotprocess".to_string(),
            user: None,
        });
        let store = MemoryStore::with_runs(vec![run_with_source(), tagged]).await.unwrap();

        let mut filter = RunFilter::detector(Detector::Tpc);
        filter.exclude_tags.push("donotprocess".to_string());

        let runs = store.find_runs(&filter, 100, 0).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].name, "160315_1824");
    }
}
