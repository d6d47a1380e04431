//! SQLite-backed store implementation.
//!
//! Run documents are split across a `runs` row and one `locations` row per
//! data location; documents are reassembled on read. The partial unique
//! index on the location discriminator tuple (see the migration) turns the
//! conditional insert into a real store-level constraint rather than an
//! advisory check.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use crate::error::CaxError;
use crate::model::{
    DataLocation, Detector, LocationKey, LocationStatus, LocationType, RunDocument, Tag,
};

use super::{RunFilter, RunStore};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// SQLite-backed run store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a new store from an existing pool. Migrations must already
    /// have been applied.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a store from a database file path.
    ///
    /// Creates parent directories and the database file as needed, connects
    /// with foreign keys enabled, and runs all migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CaxError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CaxError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| CaxError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| CaxError::DatabaseError {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })?;

        Ok(Self { pool })
    }

    async fn load_locations(&self, run_id: i64) -> Result<Vec<DataLocation>, CaxError> {
        let rows = sqlx::query(
            r#"
            SELECT kind, host, status, address, checksum, creation_time,
                   pax_version, rse, extra
            FROM locations
            WHERE run_id = ?1
            ORDER BY id
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        let mut locations = Vec::with_capacity(rows.len());
        for row in rows {
            locations.push(location_from_row(&row)?);
        }
        Ok(locations)
    }

    async fn run_from_row(&self, row: &sqlx::sqlite::SqliteRow) -> Result<RunDocument, CaxError> {
        let id: i64 = row.try_get("id")?;
        let detector: String = row.try_get("detector")?;
        let detector = Detector::parse(&detector).ok_or_else(|| CaxError::ValidationError {
            field: "detector".to_string(),
            message: format!("unknown detector '{}'", detector),
        })?;
        let tags: String = row.try_get("tags")?;
        let extra: String = row.try_get("extra")?;

        Ok(RunDocument {
            detector,
            number: row.try_get("number")?,
            name: row.try_get("name")?,
            tags: serde_json::from_str::<Vec<Tag>>(&tags)?,
            data: self.load_locations(id).await?,
            extra: serde_json::from_str(&extra)?,
        })
    }
}

fn location_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<DataLocation, CaxError> {
    let kind: String = row.try_get("kind")?;
    let kind = LocationType::parse(&kind).ok_or_else(|| CaxError::ValidationError {
        field: "kind".to_string(),
        message: format!("unknown location type '{}'", kind),
    })?;
    let status: String = row.try_get("status")?;
    let status = LocationStatus::parse(&status).ok_or_else(|| CaxError::ValidationError {
        field: "status".to_string(),
        message: format!("unknown location status '{}'", status),
    })?;
    let creation_time: DateTime<Utc> = row.try_get("creation_time")?;
    let rse: String = row.try_get("rse")?;
    let extra: String = row.try_get("extra")?;

    Ok(DataLocation {
        kind,
        host: row.try_get("host")?,
        status,
        location: row.try_get("address")?,
        checksum: row.try_get("checksum")?,
        creation_time,
        pax_version: row.try_get("pax_version")?,
        rse: serde_json::from_str(&rse)?,
        extra: serde_json::from_str(&extra)?,
    })
}

#[async_trait]
impl RunStore for SqliteStore {
    async fn find_runs(
        &self,
        filter: &RunFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<RunDocument>, CaxError> {
        let exclude_tags = serde_json::to_string(&filter.exclude_tags)?;

        let rows = sqlx::query(
            r#"
            SELECT id, detector, name, number, tags, extra
            FROM runs
            WHERE (?1 IS NULL OR detector = ?1)
              AND (?2 IS NULL OR name = ?2)
              AND (?3 IS NULL OR number = ?3)
              AND NOT EXISTS (
                  SELECT 1 FROM json_each(runs.tags) t, json_each(?4) x
                  WHERE json_extract(t.value, '$.name') = x.value
              )
              AND (?5 IS NULL OR EXISTS (
                  SELECT 1 FROM locations l
                  WHERE l.run_id = runs.id AND l.status = ?5
              ))
            ORDER BY id
            LIMIT ?6 OFFSET ?7
            "#,
        )
        .bind(filter.detector.map(|d| d.as_str()))
        .bind(&filter.name)
        .bind(filter.number)
        .bind(exclude_tags)
        .bind(filter.needs_location_status.map(|s| s.as_str()))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let mut runs = Vec::with_capacity(rows.len());
        for row in &rows {
            runs.push(self.run_from_row(row).await?);
        }
        Ok(runs)
    }

    async fn get_run(
        &self,
        detector: Detector,
        name: &str,
    ) -> Result<Option<RunDocument>, CaxError> {
        let row = sqlx::query(
            r#"
            SELECT id, detector, name, number, tags, extra
            FROM runs
            WHERE detector = ?1 AND name = ?2
            "#,
        )
        .bind(detector.as_str())
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.run_from_row(&row).await?)),
            None => Ok(None),
        }
    }

    async fn insert_run(&self, run: &RunDocument) -> Result<(), CaxError> {
        run.validate()?;

        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO runs (detector, name, number, tags, extra)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(run.detector.as_str())
        .bind(&run.name)
        .bind(run.number)
        .bind(serde_json::to_string(&run.tags)?)
        .bind(serde_json::to_string(&run.extra)?)
        .execute(&mut *tx)
        .await?;

        let run_id = result.last_insert_rowid();
        for location in &run.data {
            insert_location(&mut tx, run_id, location).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete_run(&self, detector: Detector, name: &str) -> Result<bool, CaxError> {
        let result = sqlx::query("DELETE FROM runs WHERE detector = ?1 AND name = ?2")
            .bind(detector.as_str())
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn add_location(
        &self,
        detector: Detector,
        name: &str,
        location: &DataLocation,
    ) -> Result<bool, CaxError> {
        // INSERT..SELECT keeps this one statement: a missing run inserts
        // nothing, a duplicate key trips the partial unique index.
        let result = sqlx::query(
            r#"
            INSERT INTO locations
                (run_id, kind, host, status, address, checksum, creation_time,
                 pax_version, rse, extra)
            SELECT id, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11
            FROM runs
            WHERE detector = ?1 AND name = ?2
            "#,
        )
        .bind(detector.as_str())
        .bind(name)
        .bind(location.kind.as_str())
        .bind(&location.host)
        .bind(location.status.as_str())
        .bind(&location.location)
        .bind(&location.checksum)
        .bind(location.creation_time)
        .bind(&location.pax_version)
        .bind(serde_json::to_string(&location.rse)?)
        .bind(serde_json::to_string(&location.extra)?)
        .execute(&self.pool)
        .await;

        match result {
            Ok(result) if result.rows_affected() > 0 => Ok(true),
            Ok(_) => Err(CaxError::RunNotFound {
                detector: detector.as_str().to_string(),
                name: name.to_string(),
            }),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Ok(false),
            Err(e) => Err(e.into()),
        }
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
        let result = sqlx::query(
            r#"
            UPDATE locations
            SET status = ?1,
                checksum = COALESCE(?2, checksum)
            WHERE run_id = (SELECT id FROM runs WHERE detector = ?3 AND name = ?4)
              AND host = ?5
              AND kind = ?6
              AND COALESCE(pax_version, '') = COALESCE(?7, '')
              AND (?8 IS NULL OR status = ?8)
            "#,
        )
        .bind(new_status.as_str())
        .bind(checksum)
        .bind(detector.as_str())
        .bind(name)
        .bind(&key.host)
        .bind(key.kind.as_str())
        .bind(&key.pax_version)
        .bind(expected.map(|s| s.as_str()))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn remove_location(
        &self,
        detector: Detector,
        name: &str,
        key: &LocationKey,
    ) -> Result<bool, CaxError> {
        let result = sqlx::query(
            r#"
            DELETE FROM locations
            WHERE run_id = (SELECT id FROM runs WHERE detector = ?1 AND name = ?2)
              AND host = ?3
              AND kind = ?4
              AND COALESCE(pax_version, '') = COALESCE(?5, '')
            "#,
        )
        .bind(detector.as_str())
        .bind(name)
        .bind(&key.host)
        .bind(key.kind.as_str())
        .bind(&key.pax_version)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_location_rses(
        &self,
        detector: Detector,
        name: &str,
        key: &LocationKey,
        rses: &[String],
    ) -> Result<bool, CaxError> {
        let result = sqlx::query(
            r#"
            UPDATE locations
            SET rse = ?1
            WHERE run_id = (SELECT id FROM runs WHERE detector = ?2 AND name = ?3)
              AND host = ?4
              AND kind = ?5
              AND COALESCE(pax_version, '') = COALESCE(?6, '')
            "#,
        )
        .bind(serde_json::to_string(rses)?)
        .bind(detector.as_str())
        .bind(name)
        .bind(&key.host)
        .bind(key.kind.as_str())
        .bind(&key.pax_version)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn health_check(&self) -> Result<bool, CaxError> {
        let row: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;
        Ok(row.0 == 1)
    }
}

async fn insert_location(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    run_id: i64,
    location: &DataLocation,
) -> Result<(), CaxError> {
    sqlx::query(
        r#"
        INSERT INTO locations
            (run_id, kind, host, status, address, checksum, creation_time,
             pax_version, rse, extra)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        "#,
    )
    .bind(run_id)
    .bind(location.kind.as_str())
    .bind(&location.host)
    .bind(location.status.as_str())
    .bind(&location.location)
    .bind(&location.checksum)
    .bind(location.creation_time)
    .bind(&location.pax_version)
    .bind(serde_json::to_string(&location.rse)?)
    .bind(serde_json::to_string(&location.extra)?)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn store_with_run() -> (TempDir, SqliteStore) {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::from_path(dir.path().join("cax.db")).await.unwrap();

        let mut run = RunDocument::new(Detector::Tpc, Some(4242), "160315_1824");
        let mut source = DataLocation::transferring(
            LocationType::Raw,
            "siteA",
            "/data/siteA/160315_1824",
            None,
        );
        source.status = LocationStatus::Transferred;
        source.checksum = Some("abc".to_string());
        run.data.push(source);
        store.insert_run(&run).await.unwrap();

        (dir, store)
    }

    #[tokio::test]
    async fn test_insert_and_get_roundtrip() {
        let (_dir, store) = store_with_run().await;

        let run = store.get_run(Detector::Tpc, "160315_1824").await.unwrap().unwrap();
        assert_eq!(run.number, Some(4242));
        assert_eq!(run.data.len(), 1);
        assert_eq!(run.data[0].status, LocationStatus::Transferred);
        assert_eq!(run.data[0].checksum.as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn test_unique_index_refuses_duplicate_in_flight_location() {
        let (_dir, store) = store_with_run().await;
        let stub = DataLocation::transferring(
            LocationType::Raw,
            "siteB",
            "/data/siteB/160315_1824",
            None,
        );

        assert!(store.add_location(Detector::Tpc, "160315_1824", &stub).await.unwrap());
        assert!(!store.add_location(Detector::Tpc, "160315_1824", &stub).await.unwrap());
    }

    #[tokio::test]
    async fn test_add_location_to_missing_run_is_an_error() {
        let (_dir, store) = store_with_run().await;
        let stub = DataLocation::transferring(LocationType::Raw, "siteB", "/x", None);

        let err = store
            .add_location(Detector::Tpc, "no_such_run", &stub)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "RUN_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_guarded_status_update() {
        let (_dir, store) = store_with_run().await;
        let stub = DataLocation::transferring(
            LocationType::Raw,
            "siteB",
            "/data/siteB/160315_1824",
            None,
        );
        store.add_location(Detector::Tpc, "160315_1824", &stub).await.unwrap();

        // Guard mismatch: location is transferring, not verifying.
        let matched = store
            .update_location_status(
                Detector::Tpc,
                "160315_1824",
                &stub.key(),
                Some(LocationStatus::Verifying),
                LocationStatus::Transferred,
                None,
            )
            .await
            .unwrap();
        assert!(!matched);

        // Correct guard applies and sets the checksum.
        let matched = store
            .update_location_status(
                Detector::Tpc,
                "160315_1824",
                &stub.key(),
                Some(LocationStatus::Transferring),
                LocationStatus::Verifying,
                Some("abc"),
            )
            .await
            .unwrap();
        assert!(matched);

        let run = store.get_run(Detector::Tpc, "160315_1824").await.unwrap().unwrap();
        let copy = run.location(&stub.key()).unwrap();
        assert_eq!(copy.status, LocationStatus::Verifying);
        assert_eq!(copy.checksum.as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn test_remove_location_restores_previous_data() {
        let (_dir, store) = store_with_run().await;
        let before = store.get_run(Detector::Tpc, "160315_1824").await.unwrap().unwrap();

        let stub = DataLocation::transferring(
            LocationType::Processed,
            "siteB",
            "/data/siteB/pax_6.8.0/160315_1824",
            Some("6.8.0".to_string()),
        );
        store.add_location(Detector::Tpc, "160315_1824", &stub).await.unwrap();
        assert!(store
            .remove_location(Detector::Tpc, "160315_1824", &stub.key())
            .await
            .unwrap());

        let after = store.get_run(Detector::Tpc, "160315_1824").await.unwrap().unwrap();
        assert_eq!(before.data, after.data);
    }

    #[tokio::test]
    async fn test_find_runs_filters_by_status_and_tag() {
        let (_dir, store) = store_with_run().await;

        let mut tagged = RunDocument::new(Detector::Tpc, Some(4243), "160316_0000");
        tagged.tags.push(Tag {
            name: "donotprocess".to_string(),
            user: Some("operator".to_string()),
        });
        store.insert_run(&tagged).await.unwrap();

        let mut filter = RunFilter::detector(Detector::Tpc);
        filter.exclude_tags.push("donotprocess".to_string());
        filter.needs_location_status = Some(LocationStatus::Transferred);

        let runs = store.find_runs(&filter, 10, 0).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].name, "160315_1824");
    }
}
