//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, Result as SqlResult, Row};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

use super::models::*;
use crate::surveillance::{EndReason, WatchEntry};
use crate::telemetry::{
    EntityInfo, EntityKey, EntityKind, OpticalMetrics, PingMetrics, Sample, UsageMetrics,
};

mod embedded {
    use refinery::embed_migrations;
    embed_migrations!("migrations");
}

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("Not found")]
    NotFound,
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the database at `path` and run pending migrations.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), DbError> {
        let mut conn = self.conn.lock();
        embedded::migrations::runner()
            .run(&mut *conn)
            .map_err(|e| DbError::Migration(e.to_string()))?;
        Ok(())
    }

    // --- Entities ---

    pub fn upsert_entity(&self, info: &EntityInfo) -> Result<(), DbError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO entities (key, kind, name, ip, device_class) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(key) DO UPDATE SET
             kind=excluded.kind, name=excluded.name, ip=excluded.ip, device_class=excluded.device_class",
            params![
                info.key.as_str(),
                info.kind.as_str(),
                info.name,
                info.ip,
                info.device_class,
            ],
        )?;
        Ok(())
    }

    pub fn get_entities(&self) -> Result<Vec<EntityInfo>, DbError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT key, kind, name, ip, device_class FROM entities ORDER BY key")?;
        let entities = stmt
            .query_map([], |row| {
                Ok(EntityInfo {
                    key: key_col(row, 0)?,
                    kind: parse_col::<EntityKind>(row, 1)?,
                    name: row.get(2)?,
                    ip: row.get(3)?,
                    device_class: row.get(4)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(entities)
    }

    // --- Samples ---

    /// Add samples in batch.
    pub fn add_samples(&self, samples: &[StoredSample]) -> Result<(), DbError> {
        if samples.is_empty() {
            return Ok(());
        }

        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO samples (time, entity, loss_pct, rtt_ms, has_optical, rx_dbm, tx_dbm,
                 bytes_in, bytes_out, bps_in, bps_out, connected_devices)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            )?;
            for s in samples {
                let sample = &s.sample;
                let ping = sample.ping.as_ref();
                let optical = sample.optical.as_ref();
                let usage = sample.usage.as_ref();
                stmt.execute(params![
                    fmt_time(sample.at),
                    s.entity.as_str(),
                    ping.map(|p| p.loss_pct),
                    ping.and_then(|p| p.rtt_ms),
                    optical.is_some(),
                    optical.and_then(|o| o.rx_dbm),
                    optical.and_then(|o| o.tx_dbm),
                    usage.map(|u| clamp_i64(u.bytes_in)),
                    usage.map(|u| clamp_i64(u.bytes_out)),
                    usage.map(|u| u.bps_in),
                    usage.map(|u| u.bps_out),
                    usage.and_then(|u| u.connected_devices),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// All samples at or after `since`, oldest first.
    pub fn get_samples_since(&self, since: DateTime<Utc>) -> Result<Vec<StoredSample>, DbError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT time, entity, loss_pct, rtt_ms, has_optical, rx_dbm, tx_dbm,
             bytes_in, bytes_out, bps_in, bps_out, connected_devices
             FROM samples WHERE time >= ?1 ORDER BY time ASC",
        )?;
        let samples = stmt
            .query_map(params![fmt_time(since)], stored_sample_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(samples)
    }

    /// Samples for one entity within `[start, end)`, oldest first.
    pub fn get_samples(
        &self,
        entity: &EntityKey,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Sample>, DbError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT time, entity, loss_pct, rtt_ms, has_optical, rx_dbm, tx_dbm,
             bytes_in, bytes_out, bps_in, bps_out, connected_devices
             FROM samples WHERE entity = ?1 AND time >= ?2 AND time < ?3 ORDER BY time ASC",
        )?;
        let samples = stmt
            .query_map(
                params![entity.as_str(), fmt_time(start), fmt_time(end)],
                stored_sample_row,
            )?
            .map(|r| r.map(|s| s.sample))
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(samples)
    }

    pub fn get_earliest_sample_time(&self, entity: &EntityKey) -> Result<Option<DateTime<Utc>>, DbError> {
        let conn = self.conn.lock();
        let result: Option<String> = conn.query_row(
            "SELECT MIN(time) FROM samples WHERE entity = ?1",
            params![entity.as_str()],
            |row| row.get(0),
        )?;
        Ok(result.and_then(|s| parse_db_time(&s)))
    }

    /// Delete samples before a cutoff. Returns the number of rows removed.
    pub fn delete_samples_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn.lock();
        let deleted = conn.execute("DELETE FROM samples WHERE time < ?1", params![fmt_time(cutoff)])?;
        Ok(deleted)
    }

    // --- Rollups ---

    pub fn add_rollups(&self, buckets: &[RollupBucket]) -> Result<(), DbError> {
        if buckets.is_empty() {
            return Ok(());
        }

        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO rollups (time, entity, window_seconds, tdigest_data, loss_avg, timeout_count, sample_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(time, entity, window_seconds) DO UPDATE SET
                 tdigest_data=excluded.tdigest_data, loss_avg=excluded.loss_avg,
                 timeout_count=excluded.timeout_count, sample_count=excluded.sample_count",
            )?;
            for b in buckets {
                stmt.execute(params![
                    fmt_time(b.time),
                    b.entity.as_str(),
                    b.window_seconds,
                    b.tdigest_data,
                    b.loss_avg,
                    b.timeout_count,
                    b.sample_count,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Buckets for one entity and window within `[start, end)`.
    pub fn get_rollups(
        &self,
        entity: &EntityKey,
        window_seconds: i32,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RollupBucket>, DbError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT time, entity, window_seconds, tdigest_data, loss_avg, timeout_count, sample_count
             FROM rollups
             WHERE entity = ?1 AND window_seconds = ?2 AND time >= ?3 AND time < ?4
             ORDER BY time ASC",
        )?;
        let buckets = stmt
            .query_map(
                params![entity.as_str(), window_seconds, fmt_time(start), fmt_time(end)],
                |row| {
                    Ok(RollupBucket {
                        time: time_col(row, 0)?,
                        entity: key_col(row, 1)?,
                        window_seconds: row.get(2)?,
                        tdigest_data: row.get::<_, Option<Vec<u8>>>(3)?.unwrap_or_default(),
                        loss_avg: row.get(4)?,
                        timeout_count: row.get(5)?,
                        sample_count: row.get(6)?,
                    })
                },
            )?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(buckets)
    }

    pub fn get_last_rollup_time(
        &self,
        entity: &EntityKey,
        window_seconds: i32,
    ) -> Result<Option<DateTime<Utc>>, DbError> {
        let conn = self.conn.lock();
        let result: Option<String> = conn.query_row(
            "SELECT MAX(time) FROM rollups WHERE entity = ?1 AND window_seconds = ?2",
            params![entity.as_str(), window_seconds],
            |row| row.get(0),
        )?;
        Ok(result.and_then(|s| parse_db_time(&s)))
    }

    pub fn delete_rollups_before(&self, window_seconds: i32, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM rollups WHERE window_seconds = ?1 AND time < ?2",
            params![window_seconds, fmt_time(cutoff)],
        )?;
        Ok(deleted)
    }

    // --- Surveillance history ---

    /// Open a history record for a new watch entry and return its id.
    pub fn open_history(&self, entry: &WatchEntry) -> Result<i64, DbError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO surveillance_history
             (entity, source, mode, level, started_at, level2_at, issue_since, counted_through, observed_samples)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                entry.key.as_str(),
                entry.source.as_str(),
                entry.added_mode.as_str(),
                entry.level.as_str(),
                fmt_time(entry.added_at),
                entry.level2_at.map(fmt_time),
                entry.issue_since.map(fmt_time),
                fmt_time(entry.counted_through),
                clamp_i64(entry.observed_samples),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Rewrite the mutable fields of an open record.
    pub fn update_open_history(&self, entry: &WatchEntry) -> Result<(), DbError> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE surveillance_history SET mode=?1, level=?2, level2_at=?3, issue_since=?4,
             counted_through=?5, observed_samples=?6
             WHERE id = ?7 AND ended_at IS NULL",
            params![
                entry.added_mode.as_str(),
                entry.level.as_str(),
                entry.level2_at.map(fmt_time),
                entry.issue_since.map(fmt_time),
                fmt_time(entry.counted_through),
                clamp_i64(entry.observed_samples),
                entry.history_id,
            ],
        )?;
        if updated == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    pub fn close_history(
        &self,
        id: i64,
        ended_at: DateTime<Utc>,
        reason: EndReason,
        note: Option<&str>,
        observed_samples: u64,
    ) -> Result<(), DbError> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE surveillance_history SET ended_at=?1, end_reason=?2, end_note=?3, observed_samples=?4
             WHERE id = ?5 AND ended_at IS NULL",
            params![
                fmt_time(ended_at),
                reason.as_str(),
                note,
                clamp_i64(observed_samples),
                id
            ],
        )?;
        if updated == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    pub fn get_open_history(&self) -> Result<Vec<HistoryRecord>, DbError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "{} WHERE ended_at IS NULL ORDER BY id ASC",
            HISTORY_SELECT
        ))?;
        let records = stmt
            .query_map([], history_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(records)
    }

    /// Most recent history records, newest first, optionally for one entity.
    pub fn get_history(&self, entity: Option<&EntityKey>, limit: usize) -> Result<Vec<HistoryRecord>, DbError> {
        let conn = self.conn.lock();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let records = match entity {
            Some(key) => {
                let mut stmt = conn.prepare(&format!(
                    "{} WHERE entity = ?1 ORDER BY started_at DESC, id DESC LIMIT ?2",
                    HISTORY_SELECT
                ))?;
                let rows = stmt
                    .query_map(params![key.as_str(), limit], history_row)?
                    .collect::<SqlResult<Vec<_>>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "{} ORDER BY started_at DESC, id DESC LIMIT ?1",
                    HISTORY_SELECT
                ))?;
                let rows = stmt
                    .query_map(params![limit], history_row)?
                    .collect::<SqlResult<Vec<_>>>()?;
                rows
            }
        };
        Ok(records)
    }
}

const HISTORY_SELECT: &str = "SELECT id, entity, source, mode, level, started_at, level2_at, issue_since,
     counted_through, observed_samples, ended_at, end_reason, end_note FROM surveillance_history";

fn history_row(row: &Row<'_>) -> SqlResult<HistoryRecord> {
    let observed: i64 = row.get(9)?;
    Ok(HistoryRecord {
        id: row.get(0)?,
        key: key_col(row, 1)?,
        source: parse_col(row, 2)?,
        mode: parse_col(row, 3)?,
        level: parse_col(row, 4)?,
        started_at: time_col(row, 5)?,
        level2_at: opt_time_col(row, 6)?,
        issue_since: opt_time_col(row, 7)?,
        counted_through: time_col(row, 8)?,
        observed_samples: observed.max(0) as u64,
        ended_at: opt_time_col(row, 10)?,
        end_reason: match row.get::<_, Option<String>>(11)? {
            Some(s) => Some(EndReason::from_str(&s).map_err(|e| decode_failure(11, e))?),
            None => None,
        },
        end_note: row.get(12)?,
    })
}

fn stored_sample_row(row: &Row<'_>) -> SqlResult<StoredSample> {
    let loss_pct: Option<f64> = row.get(2)?;
    let has_optical: bool = row.get(4)?;
    let bytes_in: Option<i64> = row.get(7)?;

    let mut sample = Sample::at(time_col(row, 0)?);
    if let Some(loss_pct) = loss_pct {
        sample.ping = Some(PingMetrics {
            loss_pct,
            rtt_ms: row.get(3)?,
        });
    }
    if has_optical {
        sample.optical = Some(OpticalMetrics {
            rx_dbm: row.get(5)?,
            tx_dbm: row.get(6)?,
        });
    }
    if let Some(bytes_in) = bytes_in {
        let bytes_out: Option<i64> = row.get(8)?;
        sample.usage = Some(UsageMetrics {
            bytes_in: bytes_in.max(0) as u64,
            bytes_out: bytes_out.unwrap_or(0).max(0) as u64,
            bps_in: row.get::<_, Option<f64>>(9)?.unwrap_or(0.0),
            bps_out: row.get::<_, Option<f64>>(10)?.unwrap_or(0.0),
            connected_devices: row.get(11)?,
        });
    }

    Ok(StoredSample {
        entity: key_col(row, 1)?,
        sample,
    })
}

fn fmt_time(t: DateTime<Utc>) -> String {
    t.format(TIME_FORMAT).to_string()
}

fn clamp_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn decode_failure(idx: usize, msg: impl Into<String>) -> rusqlite::Error {
    let msg: String = msg.into();
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

fn time_col(row: &Row<'_>, idx: usize) -> SqlResult<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    parse_db_time(&s).ok_or_else(|| decode_failure(idx, format!("invalid timestamp: {}", s)))
}

fn opt_time_col(row: &Row<'_>, idx: usize) -> SqlResult<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(s) => parse_db_time(&s)
            .map(Some)
            .ok_or_else(|| decode_failure(idx, format!("invalid timestamp: {}", s))),
        None => Ok(None),
    }
}

fn key_col(row: &Row<'_>, idx: usize) -> SqlResult<EntityKey> {
    let s: String = row.get(idx)?;
    EntityKey::new(s).map_err(|e| decode_failure(idx, e.to_string()))
}

fn parse_col<T>(row: &Row<'_>, idx: usize) -> SqlResult<T>
where
    T: FromStr<Err = String>,
{
    let s: String = row.get(idx)?;
    T::from_str(&s).map_err(|e| decode_failure(idx, e))
}

/// Parse a datetime string from the database.
pub fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        "%Y-%m-%d %H:%M:%S%.9f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.9fZ",
        "%Y-%m-%dT%H:%M:%SZ",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surveillance::{AddedMode, Level};
    use chrono::{Duration as ChronoDuration, TimeZone};
    use tempfile::NamedTempFile;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + ChronoDuration::seconds(secs)
    }

    fn key(s: &str) -> EntityKey {
        EntityKey::new(s).unwrap()
    }

    fn open_store() -> (NamedTempFile, Store) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        (tmp, store)
    }

    fn watch(k: &str, at: i64) -> WatchEntry {
        WatchEntry {
            key: key(k),
            history_id: 0,
            source: AddedMode::Auto,
            added_mode: AddedMode::Auto,
            added_at: t(at),
            level: Level::Under,
            level2_at: None,
            issue_since: None,
            observed_samples: 0,
            counted_through: t(at),
        }
    }

    #[test]
    fn test_reopen_runs_migrations_once() {
        let tmp = NamedTempFile::new().unwrap();
        Store::new(tmp.path()).unwrap();
        let store = Store::new(tmp.path()).unwrap();
        assert!(store.get_entities().unwrap().is_empty());
    }

    #[test]
    fn test_entity_upsert() {
        let (_tmp, store) = open_store();
        let mut info = EntityInfo::new(key("olt-7/3"), EntityKind::Optical);
        store.upsert_entity(&info).unwrap();

        info.name = "Tower 7 port 3".to_string();
        info.device_class = Some("gpon-c+".to_string());
        store.upsert_entity(&info).unwrap();

        let entities = store.get_entities().unwrap();
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].name, "Tower 7 port 3");
        assert_eq!(entities[0].kind, EntityKind::Optical);
        assert_eq!(entities[0].device_class.as_deref(), Some("gpon-c+"));
    }

    #[test]
    fn test_samples_keep_metric_families() {
        let (_tmp, store) = open_store();
        let a = key("a");
        let usage = UsageMetrics {
            bytes_in: 10,
            bytes_out: 20,
            bps_in: 1.5,
            bps_out: 2.5,
            connected_devices: Some(3),
        };
        store
            .add_samples(&[
                StoredSample {
                    entity: a.clone(),
                    sample: Sample::ping(t(0), 5.0, None),
                },
                StoredSample {
                    entity: a.clone(),
                    sample: Sample::optical(t(10), None, None),
                },
                StoredSample {
                    entity: a.clone(),
                    sample: Sample::at(t(20)).with_usage(usage),
                },
            ])
            .unwrap();

        let samples = store.get_samples(&a, t(0), t(60)).unwrap();
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0].ping.unwrap().loss_pct, 5.0);
        assert!(samples[0].optical.is_none());
        assert_eq!(samples[1].optical, Some(OpticalMetrics::default()));
        assert_eq!(samples[2].usage, Some(usage));

        assert_eq!(store.get_earliest_sample_time(&a).unwrap(), Some(t(0)));
        assert_eq!(store.delete_samples_before(t(15)).unwrap(), 2);
        assert_eq!(store.get_samples_since(t(0)).unwrap().len(), 1);
    }

    #[test]
    fn test_rollup_upsert() {
        let (_tmp, store) = open_store();
        let a = key("a");
        let mut bucket = RollupBucket {
            time: t(0),
            entity: a.clone(),
            window_seconds: 60,
            tdigest_data: vec![1, 2, 3],
            loss_avg: Some(10.0),
            timeout_count: 1,
            sample_count: 4,
        };
        store.add_rollups(&[bucket.clone()]).unwrap();
        bucket.sample_count = 6;
        store.add_rollups(&[bucket]).unwrap();

        let buckets = store.get_rollups(&a, 60, t(0), t(60)).unwrap();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].sample_count, 6);
        assert_eq!(store.get_last_rollup_time(&a, 60).unwrap(), Some(t(0)));
        assert_eq!(store.get_last_rollup_time(&a, 300).unwrap(), None);
        assert_eq!(store.delete_rollups_before(60, t(1)).unwrap(), 1);
    }

    #[test]
    fn test_history_lifecycle() {
        let (_tmp, store) = open_store();
        let mut entry = watch("a", 0);
        entry.history_id = store.open_history(&entry).unwrap();

        entry.level = Level::Level2;
        entry.level2_at = Some(t(100));
        entry.observed_samples = 42;
        store.update_open_history(&entry).unwrap();

        let open = store.get_open_history().unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].level, Level::Level2);
        assert_eq!(open[0].observed_samples, 42);

        store
            .close_history(entry.history_id, t(200), EndReason::Fixed, Some("new ONT"), 50)
            .unwrap();
        assert!(store.get_open_history().unwrap().is_empty());
        let history = store.get_history(Some(&key("a")), 10).unwrap();
        let closed = history.iter().find(|r| r.id == entry.history_id).unwrap();
        assert_eq!(closed.end_reason, Some(EndReason::Fixed));
        assert_eq!(closed.end_note.as_deref(), Some("new ONT"));

        // Closing twice is rejected.
        assert!(matches!(
            store.close_history(entry.history_id, t(300), EndReason::Removed, None, 50),
            Err(DbError::NotFound)
        ));
    }

    #[test]
    fn test_single_open_record_per_entity() {
        let (_tmp, store) = open_store();
        store.open_history(&watch("a", 0)).unwrap();
        assert!(store.open_history(&watch("a", 10)).is_err());
        store.open_history(&watch("b", 10)).unwrap();

        assert_eq!(store.get_history(None, 10).unwrap().len(), 2);
        assert_eq!(store.get_history(Some(&key("a")), 10).unwrap().len(), 1);
    }
}
