//! Store interfaces and backends for run documents.
//!
//! This module defines the store abstraction every task works against and
//! its backend implementations. All coordination between agents goes
//! through these operations; each one is a single atomic action scoped to
//! one run document, never a read-modify-write pair.

pub mod memory;
pub mod sqlite;

pub use self::memory::MemoryStore;
pub use self::sqlite::SqliteStore;

use async_trait::async_trait;

use crate::error::CaxError;
use crate::model::{DataLocation, Detector, LocationKey, LocationStatus, RunDocument};

/// Filter options for iterating run documents.
///
/// Iteration order is store-defined and must be treated as unspecified.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    /// Restrict to runs of this detector.
    pub detector: Option<Detector>,
    /// Restrict to a single run by name.
    pub name: Option<String>,
    /// Restrict to a single run by number.
    pub number: Option<i64>,
    /// Skip runs carrying any of these tags (e.g. `donotprocess`).
    pub exclude_tags: Vec<String>,
    /// Only runs holding at least one location in this status.
    pub needs_location_status: Option<LocationStatus>,
}

impl RunFilter {
    /// Filter for all runs of one detector.
    pub fn detector(detector: Detector) -> Self {
        Self {
            detector: Some(detector),
            ..Self::default()
        }
    }

    /// Whether a run document passes the tag/status parts of this filter.
    ///
    /// Backends that can push these predicates into the query use this only
    /// in tests; the memory backend applies it directly.
    pub fn accepts(&self, run: &RunDocument) -> bool {
        if let Some(detector) = self.detector
            && run.detector != detector
        {
            return false;
        }
        if let Some(name) = &self.name
            && run.name != *name
        {
            return false;
        }
        if let Some(number) = self.number
            && run.number != Some(number)
        {
            return false;
        }
        if self.exclude_tags.iter().any(|t| run.has_tag(t)) {
            return false;
        }
        if let Some(status) = self.needs_location_status
            && !run.data.iter().any(|l| l.status == status)
        {
            return false;
        }
        true
    }
}

/// Store interface used by all tasks.
///
/// The conditional operations return a matched flag rather than erroring:
/// `false` means another agent's write got there first (or the target never
/// existed), and the caller must treat its own intent as abandoned.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Fetch a page of runs matching the filter. Order is unspecified; the
    /// caller pages with `limit`/`offset` until an empty page comes back.
    async fn find_runs(
        &self,
        filter: &RunFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<RunDocument>, CaxError>;

    /// Fetch a single run by its external key.
    async fn get_run(
        &self,
        detector: Detector,
        name: &str,
    ) -> Result<Option<RunDocument>, CaxError>;

    /// Insert a new run document. Fails if the external key already exists.
    async fn insert_run(&self, run: &RunDocument) -> Result<(), CaxError>;

    /// Delete a run document. Returns whether it existed.
    async fn delete_run(&self, detector: Detector, name: &str) -> Result<bool, CaxError>;

    /// Conditionally append a location to a run's data array.
    ///
    /// Returns `false` without writing when a location with the same
    /// discriminator key already exists in a non-`error` state. This is the
    /// admission guard for the candidate-detection race: two agents may both
    /// observe "no destination copy yet", but only one append lands.
    async fn add_location(
        &self,
        detector: Detector,
        name: &str,
        location: &DataLocation,
    ) -> Result<bool, CaxError>;

    /// Atomically update one location's status (and optionally set its
    /// checksum), matched by discriminator key and, when given, by the
    /// expected current status. Returns the matched flag.
    async fn update_location_status(
        &self,
        detector: Detector,
        name: &str,
        key: &LocationKey,
        expected: Option<LocationStatus>,
        new_status: LocationStatus,
        checksum: Option<&str>,
    ) -> Result<bool, CaxError>;

    /// Remove one location by discriminator key. Returns the matched flag.
    async fn remove_location(
        &self,
        detector: Detector,
        name: &str,
        key: &LocationKey,
    ) -> Result<bool, CaxError>;

    /// Replace the confirmed RSE set of one location. Returns the matched
    /// flag. Callers only invoke this when the set actually changed.
    async fn set_location_rses(
        &self,
        detector: Detector,
        name: &str,
        key: &LocationKey,
        rses: &[String],
    ) -> Result<bool, CaxError>;

    /// Whether the store is reachable.
    async fn health_check(&self) -> Result<bool, CaxError>;
}
