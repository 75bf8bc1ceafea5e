use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite};
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{HubError, HubResult};

/// Width of one aggregation bucket.
const BUCKET_MS: i64 = 60 * 60 * 1000;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct Device {
    pub id: Uuid,
    pub external_id: String,
    pub kind: String,
    pub location: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub device_id: Uuid,
    pub ts: OffsetDateTime,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HourlyAverage {
    pub bucket_start: OffsetDateTime,
    pub average: f64,
}

#[derive(FromRow)]
struct ReadingRow {
    device_id: Uuid,
    ts_ms: i64,
    value: f64,
}

pub fn to_unix_ms(ts: OffsetDateTime) -> i64 {
    (ts.unix_timestamp_nanos() / 1_000_000) as i64
}

pub fn from_unix_ms(ms: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/habanero/habanero.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // Every connection to ":memory:" is its own database, so the pool
        // must hold exactly one connection for its whole lifetime.
        let pool_options = if db_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Device registry
    // ----------------------------

    /// Returns the device registered under `external_id`, creating it with
    /// `kind`/`location` first if it is unknown. A single conflict-aware
    /// statement, so concurrent callers for the same id all get one row.
    pub async fn resolve_or_create(
        &self,
        external_id: &str,
        kind: &str,
        location: &str,
    ) -> HubResult<Device> {
        let device = sqlx::query_as::<_, Device>(
            r#"
            INSERT INTO devices (id, external_id, kind, location)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(external_id) DO UPDATE SET
              external_id=excluded.external_id
            RETURNING id, external_id, kind, location
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(external_id)
        .bind(kind)
        .bind(location)
        .fetch_one(&self.pool)
        .await?;
        Ok(device)
    }

    pub async fn list_devices(&self) -> HubResult<Vec<Device>> {
        let devices = sqlx::query_as::<_, Device>(
            r#"
            SELECT id, external_id, kind, location
            FROM devices
            ORDER BY external_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(devices)
    }

    pub async fn get_device(&self, id: Uuid) -> HubResult<Device> {
        sqlx::query_as::<_, Device>(
            r#"
            SELECT id, external_id, kind, location
            FROM devices
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| HubError::NotFound(format!("device {id}")))
    }

    pub async fn find_device_by_external_id(&self, external_id: &str) -> HubResult<Device> {
        sqlx::query_as::<_, Device>(
            r#"
            SELECT id, external_id, kind, location
            FROM devices
            WHERE external_id = ?
            "#,
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| HubError::NotFound(format!("device '{external_id}'")))
    }

    // ----------------------------
    // Readings + aggregation
    // ----------------------------

    pub async fn insert_reading(&self, device_id: Uuid, ts: OffsetDateTime, value: f64) -> HubResult<()> {
        sqlx::query(
            r#"
            INSERT INTO readings (device_id, ts_ms, value)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(device_id)
        .bind(to_unix_ms(ts))
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Readings with `start <= ts <= end`, oldest first.
    pub async fn readings_in_range(
        &self,
        device_id: Uuid,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> HubResult<Vec<Reading>> {
        let rows = sqlx::query_as::<_, ReadingRow>(
            r#"
            SELECT device_id, ts_ms, value
            FROM readings
            WHERE device_id = ? AND ts_ms >= ? AND ts_ms <= ?
            ORDER BY ts_ms ASC, rowid ASC
            "#,
        )
        .bind(device_id)
        .bind(to_unix_ms(start))
        .bind(to_unix_ms(end))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| Reading {
                device_id: r.device_id,
                ts: from_unix_ms(r.ts_ms),
                value: r.value,
            })
            .collect())
    }

    /// Mean value per hour-aligned bucket over readings with
    /// `since <= ts <= until`. Buckets without readings are not returned.
    pub async fn hourly_averages(
        &self,
        device_id: Uuid,
        since: OffsetDateTime,
        until: OffsetDateTime,
    ) -> HubResult<Vec<HourlyAverage>> {
        let rows = sqlx::query_as::<_, (i64, f64)>(
            r#"
            SELECT (ts_ms / ?) * ? AS bucket_ms, AVG(value) AS average
            FROM readings
            WHERE device_id = ? AND ts_ms >= ? AND ts_ms <= ?
            GROUP BY bucket_ms
            ORDER BY bucket_ms ASC
            "#,
        )
        .bind(BUCKET_MS)
        .bind(BUCKET_MS)
        .bind(device_id)
        .bind(to_unix_ms(since))
        .bind(to_unix_ms(until))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(bucket_ms, average)| HourlyAverage {
                bucket_start: from_unix_ms(bucket_ms),
                average,
            })
            .collect())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use time::Duration;

    pub(crate) async fn test_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    /// Start of the hour containing `ts`.
    fn hour_floor(ts: OffsetDateTime) -> OffsetDateTime {
        from_unix_ms(to_unix_ms(ts) / BUCKET_MS * BUCKET_MS)
    }

    // -- Device registry ----------------------------------------------------

    #[tokio::test]
    async fn resolve_or_create_creates_unknown_device() {
        let db = test_db().await;
        let d = db
            .resolve_or_create("dev123", "soil-moisture", "unspecified")
            .await
            .unwrap();
        assert_eq!(d.external_id, "dev123");
        assert_eq!(d.kind, "soil-moisture");
        assert_eq!(d.location, "unspecified");
    }

    #[tokio::test]
    async fn resolve_or_create_is_idempotent_and_keeps_first_fields() {
        let db = test_db().await;
        let first = db
            .resolve_or_create("dev123", "soil-moisture", "greenhouse")
            .await
            .unwrap();
        let second = db
            .resolve_or_create("dev123", "thermometer", "porch")
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.kind, "soil-moisture");
        assert_eq!(second.location, "greenhouse");
        assert_eq!(db.list_devices().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn resolve_or_create_concurrent_callers_share_one_device() {
        let db = test_db().await;

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let db = db.clone();
                tokio::spawn(async move {
                    db.resolve_or_create("racer", "soil-moisture", &format!("loc-{i}"))
                        .await
                        .unwrap()
                        .id
                })
            })
            .collect();

        let mut ids = Vec::new();
        for h in handles {
            ids.push(h.await.unwrap());
        }

        let devices = db.list_devices().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert!(ids.iter().all(|id| *id == devices[0].id));
    }

    #[tokio::test]
    async fn list_devices_returns_all() {
        let db = test_db().await;
        for id in ["b", "a", "c"] {
            db.resolve_or_create(id, "soil-moisture", "unspecified").await.unwrap();
        }
        let ids: Vec<String> = db
            .list_devices()
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.external_id)
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn get_device_by_internal_id() {
        let db = test_db().await;
        let created = db.resolve_or_create("dev1", "soil-moisture", "bed").await.unwrap();
        assert_eq!(db.get_device(created.id).await.unwrap(), created);
    }

    #[tokio::test]
    async fn get_device_unknown_is_not_found() {
        let db = test_db().await;
        let err = db.get_device(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, HubError::NotFound(_)));
    }

    #[tokio::test]
    async fn find_by_external_id_unknown_is_not_found() {
        let db = test_db().await;
        let err = db.find_device_by_external_id("ghost").await.unwrap_err();
        assert!(matches!(err, HubError::NotFound(_)));
    }

    // -- Readings -----------------------------------------------------------

    #[tokio::test]
    async fn insert_reading_for_unknown_device_is_rejected() {
        let db = test_db().await;
        let err = db
            .insert_reading(Uuid::new_v4(), OffsetDateTime::now_utc(), 1.0)
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::StorageUnavailable(_)));
    }

    #[tokio::test]
    async fn range_query_sorted_and_bounded() {
        let db = test_db().await;
        let d = db.resolve_or_create("dev1", "soil-moisture", "unspecified").await.unwrap();
        let base = OffsetDateTime::now_utc() - Duration::hours(2);

        // Inserted out of order on purpose.
        for (offset_min, v) in [(30, 3.0), (10, 1.0), (20, 2.0), (90, 9.0), (-5, 0.5)] {
            db.insert_reading(d.id, base + Duration::minutes(offset_min), v)
                .await
                .unwrap();
        }

        let got = db
            .readings_in_range(d.id, base, base + Duration::minutes(60))
            .await
            .unwrap();
        let values: Vec<f64> = got.iter().map(|r| r.value).collect();
        assert_eq!(values, vec![1.0, 2.0, 3.0]);
        assert!(got.windows(2).all(|w| w[0].ts <= w[1].ts));
    }

    #[tokio::test]
    async fn range_query_bounds_are_inclusive() {
        let db = test_db().await;
        let d = db.resolve_or_create("dev1", "soil-moisture", "unspecified").await.unwrap();
        let start = from_unix_ms(1_700_000_000_000);
        let end = start + Duration::minutes(10);
        db.insert_reading(d.id, start, 1.0).await.unwrap();
        db.insert_reading(d.id, end, 2.0).await.unwrap();

        let got = db.readings_in_range(d.id, start, end).await.unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].ts, start);
    }

    #[tokio::test]
    async fn range_query_empty_window() {
        let db = test_db().await;
        let d = db.resolve_or_create("dev1", "soil-moisture", "unspecified").await.unwrap();
        let now = OffsetDateTime::now_utc();
        db.insert_reading(d.id, now, 1.0).await.unwrap();

        let got = db
            .readings_in_range(d.id, now - Duration::days(2), now - Duration::days(1))
            .await
            .unwrap();
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn range_query_ignores_other_devices() {
        let db = test_db().await;
        let a = db.resolve_or_create("a", "soil-moisture", "unspecified").await.unwrap();
        let b = db.resolve_or_create("b", "soil-moisture", "unspecified").await.unwrap();
        let now = OffsetDateTime::now_utc();
        db.insert_reading(a.id, now, 1.0).await.unwrap();
        db.insert_reading(b.id, now, 2.0).await.unwrap();

        let got = db
            .readings_in_range(a.id, now - Duration::minutes(1), now + Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].device_id, a.id);
    }

    // -- Hourly averages ----------------------------------------------------

    #[tokio::test]
    async fn hourly_average_of_one_bucket() {
        let db = test_db().await;
        let d = db.resolve_or_create("dev1", "soil-moisture", "unspecified").await.unwrap();
        let now = OffsetDateTime::now_utc();
        let bucket = hour_floor(now - Duration::hours(3));

        for (i, v) in [0.2, 0.4, 0.6].into_iter().enumerate() {
            db.insert_reading(d.id, bucket + Duration::minutes(5 + i as i64), v)
                .await
                .unwrap();
        }

        let avgs = db
            .hourly_averages(d.id, now - Duration::hours(24), now)
            .await
            .unwrap();
        assert_eq!(avgs.len(), 1);
        assert_eq!(avgs[0].bucket_start, bucket);
        assert!((avgs[0].average - 0.4).abs() < 1e-9, "got {}", avgs[0].average);
    }

    #[tokio::test]
    async fn hourly_averages_ascending_and_skip_empty_buckets() {
        let db = test_db().await;
        let d = db.resolve_or_create("dev1", "soil-moisture", "unspecified").await.unwrap();
        let now = OffsetDateTime::now_utc();
        let late = hour_floor(now - Duration::hours(2));
        let early = hour_floor(now - Duration::hours(6));

        db.insert_reading(d.id, late + Duration::minutes(1), 10.0).await.unwrap();
        db.insert_reading(d.id, late + Duration::minutes(2), 20.0).await.unwrap();
        db.insert_reading(d.id, early + Duration::minutes(1), 40.0).await.unwrap();

        let avgs = db
            .hourly_averages(d.id, now - Duration::hours(24), now)
            .await
            .unwrap();
        assert_eq!(avgs.len(), 2);
        assert_eq!(avgs[0].bucket_start, early);
        assert_eq!(avgs[0].average, 40.0);
        assert_eq!(avgs[1].bucket_start, late);
        assert_eq!(avgs[1].average, 15.0);
    }

    #[tokio::test]
    async fn hourly_averages_exclude_readings_outside_window() {
        let db = test_db().await;
        let d = db.resolve_or_create("dev1", "soil-moisture", "unspecified").await.unwrap();
        let now = OffsetDateTime::now_utc();
        db.insert_reading(d.id, now - Duration::hours(30), 99.0).await.unwrap();

        let avgs = db
            .hourly_averages(d.id, now - Duration::hours(24), now)
            .await
            .unwrap();
        assert!(avgs.is_empty());
    }

    // -- Time helpers -------------------------------------------------------

    #[test]
    fn unix_ms_conversion() {
        let ts = from_unix_ms(1_700_000_000_123);
        assert_eq!(to_unix_ms(ts), 1_700_000_000_123);
        assert_eq!(ts.unix_timestamp(), 1_700_000_000);
    }
}
