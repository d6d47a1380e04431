// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end lifecycle tests: several agents' worth of tasks driving run
//! documents through the transfer state machine on a shared store.

use std::sync::Arc;

use cax_core::backend::{BackendFactory, MockBackend, TransferBackend};
use cax_core::checksum::{ChecksumProvider, Sha512Checksum};
use cax_core::config::{HostEntry, HostRegistry};
use cax_core::model::{
    DataLocation, Detector, LocationStatus, LocationType, RunDocument, Tag,
};
use cax_core::store::{MemoryStore, RunFilter, RunStore};
use cax_core::tasks::{
    ClearTask, StaleTask, Task, TransferDirection, TransferTask, VerifyTask,
};

struct MockFactory(Arc<MockBackend>);

impl BackendFactory for MockFactory {
    fn backend(&self, method: &str) -> Option<Arc<dyn TransferBackend>> {
        (method == "mock").then(|| self.0.clone() as Arc<dyn TransferBackend>)
    }
}

fn registry() -> Arc<HostRegistry> {
    let site = |dir: &str, upload: &[&str], download: &[&str]| HostEntry {
        hostname: None,
        account: None,
        method: "mock".to_string(),
        directory: dir.to_string(),
        upload_to: upload.iter().map(|s| s.to_string()).collect(),
        download_from: download.iter().map(|s| s.to_string()).collect(),
    };
    Arc::new(HostRegistry::from_entries(vec![
        ("daq".to_string(), site("/daq/raw", &["siteA"], &[])),
        ("siteA".to_string(), site("/data/siteA", &[], &["daq"])),
        ("siteB".to_string(), site("/data/siteB", &[], &["siteA"])),
    ]))
}

fn transferred(kind: LocationType, host: &str, path: &str, checksum: Option<&str>) -> DataLocation {
    let mut l = DataLocation::transferring(kind, host, path, None);
    l.status = LocationStatus::Transferred;
    l.checksum = checksum.map(|c| c.to_string());
    l
}

fn fresh_run() -> RunDocument {
    let mut run = RunDocument::new(Detector::Tpc, Some(4242), "160315_1824");
    run.data.push(transferred(
        LocationType::Raw,
        "daq",
        "/daq/raw/160315_1824",
        Some("abc"),
    ));
    run
}

fn push_task(
    host: &str,
    store: Arc<dyn RunStore>,
    backend: Arc<MockBackend>,
) -> TransferTask {
    TransferTask::new(
        TransferDirection::Push,
        host,
        registry(),
        store,
        Arc::new(MockFactory(backend)),
    )
}

fn pull_task(
    host: &str,
    store: Arc<dyn RunStore>,
    backend: Arc<MockBackend>,
) -> TransferTask {
    TransferTask::new(
        TransferDirection::Pull,
        host,
        registry(),
        store,
        Arc::new(MockFactory(backend)),
    )
}

async fn get(store: &Arc<dyn RunStore>) -> RunDocument {
    store
        .get_run(Detector::Tpc, "160315_1824")
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn test_data_fans_out_across_sites() {
    let store: Arc<dyn RunStore> =
        Arc::new(MemoryStore::with_runs(vec![fresh_run()]).await.unwrap());
    let backend = MockBackend::with_checksum("abc");
    let filter = RunFilter::default();

    // The producer pushes to siteA, then siteB pulls from siteA.
    push_task("daq", store.clone(), backend.clone())
        .go(&filter)
        .await
        .unwrap();
    pull_task("siteB", store.clone(), backend.clone())
        .go(&filter)
        .await
        .unwrap();

    let run = get(&store).await;
    for host in ["daq", "siteA", "siteB"] {
        let l = run.data.iter().find(|l| l.host == host).unwrap();
        assert_eq!(l.status, LocationStatus::Transferred, "host {}", host);
        assert_eq!(l.checksum.as_deref(), Some("abc"), "host {}", host);
    }
    assert_eq!(backend.copies.lock().await.len(), 2);
}

#[tokio::test]
async fn test_competing_agents_produce_exactly_one_copy() {
    let store: Arc<dyn RunStore> =
        Arc::new(MemoryStore::with_runs(vec![fresh_run()]).await.unwrap());
    let backend = MockBackend::with_checksum("abc");
    let filter = RunFilter::default();

    // Two agents for the same site racing over the same pair. Both see
    // "no copy at siteA yet"; the store's conditional append admits one.
    let first = push_task("daq", store.clone(), backend.clone());
    let second = push_task("daq", store.clone(), backend.clone());
    let (a, b) = tokio::join!(first.go(&filter), second.go(&filter));
    a.unwrap();
    b.unwrap();

    let run = get(&store).await;
    let copies: Vec<_> = run.data.iter().filter(|l| l.host == "siteA").collect();
    assert_eq!(copies.len(), 1);
    assert_eq!(copies[0].status, LocationStatus::Transferred);
    assert_eq!(backend.copies.lock().await.len(), 1);
    run.validate().unwrap();
}

#[tokio::test]
async fn test_interrupted_transfer_is_purged_then_retried() {
    // A crashed agent left a transferring stub and debris on disk.
    let dir = tempfile::TempDir::new().unwrap();
    let debris = dir.path().join("160315_1824");
    std::fs::write(&debris, b"half a run").unwrap();

    let mut run = fresh_run();
    run.data.push(transferred(
        LocationType::Raw,
        "siteB",
        "/data/siteB/160315_1824",
        Some("abc"),
    ));
    let mut stuck = DataLocation::transferring(
        LocationType::Raw,
        "siteA",
        debris.to_str().unwrap(),
        None,
    );
    stuck.creation_time = chrono::Utc::now() - chrono::Duration::days(5);
    run.data.push(stuck);

    let store: Arc<dyn RunStore> =
        Arc::new(MemoryStore::with_runs(vec![run]).await.unwrap());
    let filter = RunFilter::default();

    // siteA's stale pass removes the dead stub and its debris.
    StaleTask::new(
        "siteA",
        store.clone(),
        chrono::Duration::hours(24),
        chrono::Duration::hours(72),
    )
    .go(&filter)
    .await
    .unwrap();

    assert!(!debris.exists());
    let run = get(&store).await;
    assert!(!run.data.iter().any(|l| l.host == "siteA"));

    // With the stub gone the next push pass starts a fresh copy.
    let backend = MockBackend::with_checksum("abc");
    push_task("daq", store.clone(), backend.clone())
        .go(&filter)
        .await
        .unwrap();

    let run = get(&store).await;
    let copy = run.data.iter().find(|l| l.host == "siteA").unwrap();
    assert_eq!(copy.status, LocationStatus::Transferred);
}

#[tokio::test]
async fn test_deferred_verification_settles_a_pulled_copy() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("160315_1824");
    std::fs::write(&path, b"raw run data").unwrap();
    let master = Sha512Checksum.hash(&path).await.unwrap();

    // The source has a checksum but the backend cannot report one, so the
    // fresh copy stays verifying until the verify pass hashes it locally.
    let mut run = RunDocument::new(Detector::Tpc, Some(4242), "160315_1824");
    run.data.push(transferred(
        LocationType::Raw,
        "daq",
        "/daq/raw/160315_1824",
        Some(&master),
    ));
    let mut local =
        DataLocation::transferring(LocationType::Raw, "siteA", path.to_str().unwrap(), None);
    local.status = LocationStatus::Verifying;
    run.data.push(local);

    let store: Arc<dyn RunStore> =
        Arc::new(MemoryStore::with_runs(vec![run]).await.unwrap());

    VerifyTask::new("siteA", store.clone(), Arc::new(Sha512Checksum))
        .go(&RunFilter::default())
        .await
        .unwrap();

    let run = get(&store).await;
    let local = run.data.iter().find(|l| l.host == "siteA").unwrap();
    assert_eq!(local.status, LocationStatus::Transferred);
    assert_eq!(local.checksum.as_deref(), Some(master.as_str()));
}

#[tokio::test]
async fn test_buffer_clears_only_after_third_copy_lands() {
    let dir = tempfile::TempDir::new().unwrap();
    let buffer = dir.path().join("160315_1824_untriggered");
    std::fs::create_dir(&buffer).unwrap();
    std::fs::write(buffer.join("chunk0"), b"untriggered").unwrap();

    let mut run = fresh_run();
    let mut untriggered = DataLocation::transferring(
        LocationType::Untriggered,
        "daq",
        buffer.to_str().unwrap(),
        None,
    );
    untriggered.status = LocationStatus::Transferred;
    run.data.push(untriggered);
    run.data.push(transferred(
        LocationType::Raw,
        "siteB",
        "/data/siteB/160315_1824",
        Some("abc"),
    ));

    let store: Arc<dyn RunStore> =
        Arc::new(MemoryStore::with_runs(vec![run]).await.unwrap());
    let filter = RunFilter::default();
    let clear = ClearTask::new("daq", store.clone());

    // Two raw copies: not safe yet.
    clear.go(&filter).await.unwrap();
    assert!(buffer.exists());

    // The third copy lands via push to siteA.
    let backend = MockBackend::with_checksum("abc");
    push_task("daq", store.clone(), backend)
        .go(&filter)
        .await
        .unwrap();

    clear.go(&filter).await.unwrap();
    assert!(!buffer.exists());
    let run = get(&store).await;
    assert!(run
        .locations_of(LocationType::Untriggered)
        .next()
        .is_none());
}

#[tokio::test]
async fn test_tagged_runs_are_excluded_from_every_pass() {
    let mut run = fresh_run();
    run.tags.push(Tag {
        name: "donotprocess".to_string(),
        user: Some("operator".to_string()),
    });

    let store: Arc<dyn RunStore> =
        Arc::new(MemoryStore::with_runs(vec![run]).await.unwrap());
    let filter = RunFilter {
        exclude_tags: vec!["donotprocess".to_string()],
        ..RunFilter::default()
    };

    let backend = MockBackend::with_checksum("abc");
    let stats = push_task("daq", store.clone(), backend.clone())
        .go(&filter)
        .await
        .unwrap();

    assert_eq!(stats.runs_seen, 0);
    assert!(backend.copies.lock().await.is_empty());
    let run = get(&store).await;
    assert_eq!(run.data.len(), 1);
}
