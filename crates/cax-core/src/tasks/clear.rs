// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Untriggered buffer clearing on the producer host.
//!
//! The producer keeps an untriggered buffer copy alongside the triggered
//! raw data until the raw data is safe. Safe means three `transferred` raw
//! copies that all agree on the checksum; any disagreement is an integrity
//! incident and the buffer stays put as the recovery source.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::CaxError;
use crate::model::{LocationStatus, LocationType, RunDocument};
use crate::store::RunStore;

use super::{purge_path, Task};

/// Raw copies required before the untriggered buffer may go.
const REQUIRED_RAW_COPIES: usize = 3;

/// Deletes the producer's untriggered buffer once the raw data is safe.
pub struct ClearTask {
    local_host: String,
    store: Arc<dyn RunStore>,
}

impl ClearTask {
    /// Create a buffer-clearing task for the producer host.
    pub fn new(local_host: impl Into<String>, store: Arc<dyn RunStore>) -> Self {
        Self {
            local_host: local_host.into(),
            store,
        }
    }

    /// Whether the raw data is redundant enough to give up the buffer.
    fn raw_data_safe(run: &RunDocument) -> bool {
        let checksums: Vec<Option<&str>> = run
            .locations_of(LocationType::Raw)
            .filter(|l| l.status == LocationStatus::Transferred)
            .map(|l| l.checksum.as_deref())
            .collect();
        checksums.len() >= REQUIRED_RAW_COPIES
            && checksums
                .iter()
                .all(|c| c.is_some() && *c == checksums[0])
    }
}

#[async_trait]
impl Task for ClearTask {
    fn name(&self) -> &'static str {
        "clear"
    }

    fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    async fn each_run(&self, run: &RunDocument) -> Result<(), CaxError> {
        let Some(buffer) = run
            .locations_of(LocationType::Untriggered)
            .find(|l| l.host == self.local_host)
        else {
            return Ok(());
        };

        if !Self::raw_data_safe(run) {
            debug!(
                run = %run.name,
                "raw data not yet redundant, keeping untriggered buffer"
            );
            return Ok(());
        }

        purge_path(&buffer.location).await?;
        let removed = self
            .store
            .remove_location(run.detector, &run.name, &buffer.key())
            .await?;
        if removed {
            info!(run = %run.name, path = %buffer.location, "cleared untriggered buffer");
        } else {
            warn!(run = %run.name, "buffer location vanished before removal");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DataLocation, Detector};
    use crate::store::{MemoryStore, RunFilter};
    use tempfile::TempDir;

    fn raw(host: &str, checksum: Option<&str>) -> DataLocation {
        let mut l =
            DataLocation::transferring(LocationType::Raw, host, format!("/data/{}/r", host), None);
        l.status = LocationStatus::Transferred;
        l.checksum = checksum.map(|c| c.to_string());
        l
    }

    fn buffer(host: &str, path: &str) -> DataLocation {
        let mut l = DataLocation::transferring(LocationType::Untriggered, host, path, None);
        l.status = LocationStatus::Transferred;
        l
    }

    async fn clear(run: RunDocument) -> Arc<dyn RunStore> {
        let store: Arc<dyn RunStore> =
            Arc::new(MemoryStore::with_runs(vec![run]).await.unwrap());
        let stats = ClearTask::new("daq", store.clone())
            .go(&RunFilter::default())
            .await
            .unwrap();
        assert!(stats.is_clean());
        store
    }

    #[tokio::test]
    async fn test_clears_buffer_with_three_matching_raw_copies() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("160315_1824");
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("chunk0"), b"untriggered").unwrap();

        let mut run = RunDocument::new(Detector::Tpc, Some(1), "160315_1824");
        for host in ["siteA", "siteB", "siteC"] {
            run.data.push(raw(host, Some("abc")));
        }
        run.data.push(buffer("daq", path.to_str().unwrap()));

        let store = clear(run).await;
        assert!(!path.exists());
        let run = store.get_run(Detector::Tpc, "160315_1824").await.unwrap().unwrap();
        assert!(run.locations_of(LocationType::Untriggered).next().is_none());
    }

    #[tokio::test]
    async fn test_keeps_buffer_with_only_two_copies() {
        let mut run = RunDocument::new(Detector::Tpc, Some(1), "160315_1824");
        for host in ["siteA", "siteB"] {
            run.data.push(raw(host, Some("abc")));
        }
        run.data.push(buffer("daq", "/buffer/160315_1824"));

        let store = clear(run).await;
        let run = store.get_run(Detector::Tpc, "160315_1824").await.unwrap().unwrap();
        assert!(run.locations_of(LocationType::Untriggered).next().is_some());
    }

    #[tokio::test]
    async fn test_keeps_buffer_on_checksum_disagreement() {
        let mut run = RunDocument::new(Detector::Tpc, Some(1), "160315_1824");
        run.data.push(raw("siteA", Some("abc")));
        run.data.push(raw("siteB", Some("abc")));
        run.data.push(raw("siteC", Some("def")));
        run.data.push(buffer("daq", "/buffer/160315_1824"));

        let store = clear(run).await;
        let run = store.get_run(Detector::Tpc, "160315_1824").await.unwrap().unwrap();
        assert!(run.locations_of(LocationType::Untriggered).next().is_some());
    }

    #[tokio::test]
    async fn test_keeps_buffer_when_a_copy_has_no_checksum() {
        let mut run = RunDocument::new(Detector::Tpc, Some(1), "160315_1824");
        run.data.push(raw("siteA", Some("abc")));
        run.data.push(raw("siteB", None));
        run.data.push(raw("siteC", Some("abc")));
        run.data.push(buffer("daq", "/buffer/160315_1824"));

        let store = clear(run).await;
        let run = store.get_run(Detector::Tpc, "160315_1824").await.unwrap().unwrap();
        assert!(run.locations_of(LocationType::Untriggered).next().is_some());
    }

    #[tokio::test]
    async fn test_ignores_other_hosts_buffers() {
        let mut run = RunDocument::new(Detector::Tpc, Some(1), "160315_1824");
        for host in ["siteA", "siteB", "siteC"] {
            run.data.push(raw(host, Some("abc")));
        }
        run.data.push(buffer("other-daq", "/buffer/160315_1824"));

        let store = clear(run).await;
        let run = store.get_run(Detector::Tpc, "160315_1824").await.unwrap().unwrap();
        assert!(run.locations_of(LocationType::Untriggered).next().is_some());
    }
}
