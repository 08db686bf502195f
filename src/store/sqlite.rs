//! SQLite-backed implementation of every store contract.
//!
//! All nodes of a cluster point at the same database file. Cross-node mutual
//! exclusion relies on single-statement compare-and-set for mutexes and on
//! `BEGIN IMMEDIATE` transactions (one writer at a time) everywhere a read
//! decides a write.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

use crate::aggregation::{
    Aggregation, AggregationInterval, AggregationKey, AggregationType, ClosedAggregation,
    DurationStats,
};
use crate::clock::{expiry, from_millis, to_millis, ProcessingClock};
use crate::config::StoreConfig;
use crate::dimension::{DateDimension, DimensionStore, TimeDimension};
use crate::event::{EventSession, EventStatus, RawEvent};
use crate::lock::{
    EntityLock, EntityLockStore, LockFilter, LockStoreError, LockType, MutexRecord, MutexStore,
};
use crate::migrate::{Migrator, SqliteMigrator};

use super::{
    check_sequence, AggregationRecord, AggregationStore, Checkpoint, ClosedFilter, CommitBatch,
    EventSessionStore, RawEventStore, StoreError,
};

/// Opens a connection with the pragmas every node uses.
pub fn open_connection(path: &Path, busy_timeout: Duration) -> Result<Connection, StoreError> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(busy_timeout)?;
    let _mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(conn)
}

/// Shared database of record.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    clock: Arc<dyn ProcessingClock>,
}

impl SqliteStore {
    /// Opens (and by default migrates) the database named in `config`.
    pub fn open(config: &StoreConfig, clock: Arc<dyn ProcessingClock>) -> anyhow::Result<Self> {
        let conn = open_connection(&config.path, config.busy_timeout)
            .with_context(|| format!("opening sqlite database {}", config.path.display()))?;

        if config.auto_migrate {
            SqliteMigrator::new(&conn)
                .up()
                .context("migrating sqlite database")?;
        }

        Ok(Self::from_connection(conn, clock))
    }

    /// Private, migrated in-memory database.
    pub fn open_in_memory(clock: Arc<dyn ProcessingClock>) -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("opening in-memory sqlite")?;
        SqliteMigrator::new(&conn).up()?;
        Ok(Self::from_connection(conn, clock))
    }

    pub fn from_connection(conn: Connection, clock: Arc<dyn ProcessingClock>) -> Self {
        Self {
            conn: Mutex::new(conn),
            clock,
        }
    }
}

fn corrupted(table: &'static str, reason: impl Into<String>) -> StoreError {
    StoreError::Corrupted {
        table,
        reason: reason.into(),
    }
}

// ---------------------------------------------------------------------------
// Mutexes
// ---------------------------------------------------------------------------

impl MutexStore for SqliteStore {
    fn acquire(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool, LockStoreError> {
        if ttl.is_zero() {
            return Err(LockStoreError::InvalidTtl {
                name: name.to_string(),
                ttl,
            });
        }

        let now = self.clock.now();
        let changed = self
            .conn
            .lock()
            .execute(
                "INSERT INTO cluster_mutex (name, owner, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(name) DO UPDATE
                    SET owner = excluded.owner, expires_at = excluded.expires_at
                    WHERE cluster_mutex.expires_at <= ?4
                       OR cluster_mutex.owner = excluded.owner",
                params![name, owner, to_millis(expiry(now, ttl)), to_millis(now)],
            )
            .map_err(|e| LockStoreError::storage(name, e))?;

        Ok(changed == 1)
    }

    fn renew(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool, LockStoreError> {
        if ttl.is_zero() {
            return Err(LockStoreError::InvalidTtl {
                name: name.to_string(),
                ttl,
            });
        }

        let now = self.clock.now();
        let changed = self
            .conn
            .lock()
            .execute(
                "UPDATE cluster_mutex SET expires_at = ?3
                 WHERE name = ?1 AND owner = ?2 AND expires_at > ?4",
                params![name, owner, to_millis(expiry(now, ttl)), to_millis(now)],
            )
            .map_err(|e| LockStoreError::storage(name, e))?;

        Ok(changed == 1)
    }

    fn release(&self, name: &str, owner: &str) -> Result<(), LockStoreError> {
        self.conn
            .lock()
            .execute(
                "DELETE FROM cluster_mutex WHERE name = ?1 AND owner = ?2",
                params![name, owner],
            )
            .map_err(|e| LockStoreError::storage(name, e))?;
        Ok(())
    }

    fn get(&self, name: &str) -> Result<Option<MutexRecord>, LockStoreError> {
        self.conn
            .lock()
            .query_row(
                "SELECT name, owner, expires_at FROM cluster_mutex WHERE name = ?1",
                params![name],
                |row| {
                    Ok(MutexRecord {
                        name: row.get(0)?,
                        owner: row.get(1)?,
                        expires_at: from_millis(row.get(2)?),
                    })
                },
            )
            .optional()
            .map_err(|e| LockStoreError::storage(name, e))
    }

    fn delete_expired(&self) -> Result<usize, LockStoreError> {
        let now = self.clock.now();
        self.conn
            .lock()
            .execute(
                "DELETE FROM cluster_mutex WHERE expires_at <= ?1",
                params![to_millis(now)],
            )
            .map_err(|e| LockStoreError::storage("cluster_mutex", e))
    }
}

// ---------------------------------------------------------------------------
// Entity locks
// ---------------------------------------------------------------------------

const ENTITY_LOCK_SELECT: &str = "SELECT entity_type, entity_key, lock_owner, lock_type, expires_at
     FROM entity_lock
     WHERE (?1 IS NULL OR entity_type = ?1)
       AND (?2 IS NULL OR entity_key = ?2)
       AND (?3 IS NULL OR lock_type = ?3)
       AND (?4 IS NULL OR lock_owner = ?4)
       AND (?5 IS NULL OR expires_at = ?5)
       AND (?6 IS NULL OR expires_at > ?6)
     ORDER BY entity_type, entity_key, lock_owner";

type EntityLockRow = (String, String, String, String, i64);

fn entity_lock_name(lock: &EntityLock) -> String {
    format!("{}/{}", lock.entity_type, lock.entity_key)
}

fn query_entity_locks(
    conn: &Connection,
    filter: &LockFilter,
    unexpired_at: Option<DateTime<Utc>>,
) -> Result<Vec<EntityLock>, StoreError> {
    let mut stmt = conn.prepare_cached(ENTITY_LOCK_SELECT)?;
    let rows = stmt
        .query_map(
            params![
                filter.entity_type,
                filter.entity_key,
                filter.lock_type.map(LockType::as_str),
                filter.owner,
                filter.expiration.map(to_millis),
                unexpired_at.map(to_millis),
            ],
            |row| {
                Ok::<EntityLockRow, _>((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            },
        )?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(entity_type, entity_key, lock_owner, lock_type, expires_at)| {
            let lock_type = LockType::parse(&lock_type)
                .ok_or_else(|| corrupted("entity_lock", format!("unknown lock type {lock_type}")))?;
            Ok(EntityLock {
                entity_type,
                entity_key,
                lock_owner,
                lock_type,
                expires_at: from_millis(expires_at),
            })
        })
        .collect()
}

fn upsert_entity_lock(conn: &Connection, lock: &EntityLock) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO entity_lock (entity_type, entity_key, lock_owner, lock_type, expires_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(entity_type, entity_key, lock_owner) DO UPDATE
            SET lock_type = excluded.lock_type, expires_at = excluded.expires_at",
        params![
            lock.entity_type,
            lock.entity_key,
            lock.lock_owner,
            lock.lock_type.as_str(),
            to_millis(lock.expires_at),
        ],
    )?;
    Ok(())
}

impl SqliteStore {
    /// Writes `candidate` unless another owner's unexpired lock conflicts.
    /// `require_existing` restricts the write to locks the owner already holds.
    fn write_entity_lock(
        &self,
        candidate: &EntityLock,
        require_existing: bool,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        if candidate.is_expired(now) {
            return Ok(false);
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let holders = query_entity_locks(
            &tx,
            &LockFilter::entity(&candidate.entity_type, &candidate.entity_key),
            Some(now),
        )?;

        if require_existing && !holders.iter().any(|h| h.lock_owner == candidate.lock_owner) {
            return Ok(false);
        }
        if holders.iter().any(|h| candidate.conflicts_with(h, now)) {
            return Ok(false);
        }

        upsert_entity_lock(&tx, candidate)?;
        tx.commit()?;
        Ok(true)
    }
}

impl EntityLockStore for SqliteStore {
    fn add(&self, lock: &EntityLock) -> Result<bool, LockStoreError> {
        self.write_entity_lock(lock, false)
            .map_err(|e| LockStoreError::storage(entity_lock_name(lock), e))
    }

    fn update(
        &self,
        lock: &EntityLock,
        new_expiration: DateTime<Utc>,
        new_type: Option<LockType>,
    ) -> Result<bool, LockStoreError> {
        let updated = EntityLock {
            expires_at: new_expiration,
            lock_type: new_type.unwrap_or(lock.lock_type),
            ..lock.clone()
        };
        self.write_entity_lock(&updated, true)
            .map_err(|e| LockStoreError::storage(entity_lock_name(lock), e))
    }

    fn delete(&self, lock: &EntityLock) -> Result<(), LockStoreError> {
        self.conn
            .lock()
            .execute(
                "DELETE FROM entity_lock
                 WHERE entity_type = ?1 AND entity_key = ?2 AND lock_owner = ?3",
                params![lock.entity_type, lock.entity_key, lock.lock_owner],
            )
            .map_err(|e| LockStoreError::storage(entity_lock_name(lock), e))?;
        Ok(())
    }

    fn delete_all(&self) -> Result<(), LockStoreError> {
        self.conn
            .lock()
            .execute("DELETE FROM entity_lock", [])
            .map_err(|e| LockStoreError::storage("entity_lock", e))?;
        Ok(())
    }

    fn delete_expired(&self) -> Result<usize, LockStoreError> {
        let now = self.clock.now();
        self.conn
            .lock()
            .execute(
                "DELETE FROM entity_lock WHERE expires_at <= ?1",
                params![to_millis(now)],
            )
            .map_err(|e| LockStoreError::storage("entity_lock", e))
    }

    fn find(&self, filter: &LockFilter) -> Result<Vec<EntityLock>, LockStoreError> {
        query_entity_locks(&self.conn.lock(), filter, None)
            .map_err(|e| LockStoreError::storage("entity_lock", e))
    }

    fn find_unexpired(&self, filter: &LockFilter) -> Result<Vec<EntityLock>, LockStoreError> {
        let now = self.clock.now();
        query_entity_locks(&self.conn.lock(), filter, Some(now))
            .map_err(|e| LockStoreError::storage("entity_lock", e))
    }
}

// ---------------------------------------------------------------------------
// Dimensions
// ---------------------------------------------------------------------------

const INSERT_DATE: &str = "INSERT OR IGNORE INTO date_dimension
     (date, year, quarter, month, week, day_of_week, term)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)";

fn insert_date(conn: &Connection, row: &DateDimension) -> Result<bool, StoreError> {
    let changed = conn.prepare_cached(INSERT_DATE)?.execute(params![
        row.date.to_string(),
        row.year,
        row.quarter,
        row.month,
        row.week,
        row.day_of_week,
        row.term,
    ])?;
    Ok(changed == 1)
}

fn parse_date(raw: &str) -> Result<NaiveDate, StoreError> {
    raw.parse::<NaiveDate>()
        .map_err(|e| corrupted("date_dimension", format!("bad date {raw}: {e}")))
}

impl DimensionStore for SqliteStore {
    fn insert_date_if_absent(&self, row: &DateDimension) -> Result<bool, StoreError> {
        insert_date(&self.conn.lock(), row)
    }

    fn insert_time_if_absent(&self, row: &TimeDimension) -> Result<bool, StoreError> {
        let changed = self.conn.lock().execute(
            "INSERT OR IGNORE INTO time_dimension (minute_of_day, hour, minute, five_minute)
             VALUES (?1, ?2, ?3, ?4)",
            params![row.minute_of_day, row.hour, row.minute, row.five_minute],
        )?;
        Ok(changed == 1)
    }

    fn insert_dates_if_absent(&self, rows: &[DateDimension]) -> Result<usize, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut inserted = 0;
        for row in rows {
            if insert_date(&tx, row)? {
                inserted += 1;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    fn get_date(&self, date: NaiveDate) -> Result<Option<DateDimension>, StoreError> {
        let row = self
            .conn
            .lock()
            .query_row(
                "SELECT date, year, quarter, month, week, day_of_week, term
                 FROM date_dimension WHERE date = ?1",
                params![date.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(raw, year, quarter, month, week, day_of_week, term)| {
            Ok(DateDimension {
                date: parse_date(&raw)?,
                year,
                quarter,
                month,
                week,
                day_of_week,
                term,
            })
        })
        .transpose()
    }

    fn get_time(&self, time: NaiveTime) -> Result<Option<TimeDimension>, StoreError> {
        let minute_of_day = TimeDimension::from_time(time).minute_of_day;
        let found: Option<u32> = self
            .conn
            .lock()
            .query_row(
                "SELECT minute_of_day FROM time_dimension WHERE minute_of_day = ?1",
                params![minute_of_day],
                |row| row.get(0),
            )
            .optional()?;

        found
            .map(|m| {
                TimeDimension::from_minute_of_day(m)
                    .ok_or_else(|| corrupted("time_dimension", format!("minute {m} out of range")))
            })
            .transpose()
    }

    fn date_range(&self) -> Result<Option<(NaiveDate, NaiveDate)>, StoreError> {
        let (min, max): (Option<String>, Option<String>) = self.conn.lock().query_row(
            "SELECT MIN(date), MAX(date) FROM date_dimension",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        match (min, max) {
            (Some(min), Some(max)) => Ok(Some((parse_date(&min)?, parse_date(&max)?))),
            _ => Ok(None),
        }
    }

    fn time_count(&self) -> Result<usize, StoreError> {
        let count: i64 =
            self.conn
                .lock()
                .query_row("SELECT COUNT(*) FROM time_dimension", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

// ---------------------------------------------------------------------------
// Raw events
// ---------------------------------------------------------------------------

type RawEventRow = (i64, i64, String, Option<String>, String, String);

fn decode_event(row: RawEventRow) -> Result<RawEvent, StoreError> {
    let (id, occurred_at, subject, session_id, groups, payload) = row;
    Ok(RawEvent {
        id,
        occurred_at: from_millis(occurred_at),
        subject,
        session_id,
        subject_groups: serde_json::from_str(&groups)?,
        payload: serde_json::from_str(&payload)?,
    })
}

impl RawEventStore for SqliteStore {
    fn append(&self, events: &[RawEvent]) -> Result<Vec<i64>, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut ids = Vec::with_capacity(events.len());
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO raw_event
                    (occurred_at, subject, session_id, subject_groups, payload, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for event in events {
                stmt.execute(params![
                    to_millis(event.occurred_at),
                    event.subject,
                    event.session_id,
                    serde_json::to_string(&event.subject_groups)?,
                    serde_json::to_string(&event.payload)?,
                    EventStatus::Pending as u8,
                ])?;
                ids.push(tx.last_insert_rowid());
            }
        }
        tx.commit()?;
        Ok(ids)
    }

    fn read_pending(&self, limit: usize) -> Result<Vec<RawEvent>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, occurred_at, subject, session_id, subject_groups, payload
             FROM raw_event WHERE status = ?1
             ORDER BY occurred_at, id LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(
                params![EventStatus::Pending as u8, limit as i64],
                |row| {
                    Ok::<RawEventRow, _>((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ))
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter().map(decode_event).collect()
    }

    fn event_status(&self, id: i64) -> Result<Option<EventStatus>, StoreError> {
        let status: Option<u8> = self
            .conn
            .lock()
            .query_row(
                "SELECT status FROM raw_event WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;

        status
            .map(|s| {
                EventStatus::from_u8(s)
                    .ok_or_else(|| corrupted("raw_event", format!("unknown status {s}")))
            })
            .transpose()
    }

    fn purge_processed(&self, before: DateTime<Utc>) -> Result<usize, StoreError> {
        let removed = self.conn.lock().execute(
            "DELETE FROM raw_event WHERE status != ?1 AND occurred_at < ?2",
            params![EventStatus::Pending as u8, to_millis(before)],
        )?;
        Ok(removed)
    }
}

// ---------------------------------------------------------------------------
// Aggregations
// ---------------------------------------------------------------------------

const AGGREGATION_COLUMNS: &str = "aggregation_type, bucket_date, bucket_minute, \
     bucket_interval, group_key, discriminator, bucket_end, event_count, unique_count, \
     subjects, duration_count, duration_sum_ms, duration_min_ms, duration_max_ms, closed_at";

const KEY_MATCH: &str = "aggregation_type = ?1 AND bucket_date = ?2 AND bucket_minute = ?3 \
     AND bucket_interval = ?4 AND group_key = ?5 AND discriminator = ?6";

/// Closed rows are left untouched by the conflict clause.
const UPSERT_AGGREGATION: &str = "INSERT INTO aggregation (
        aggregation_type, bucket_date, bucket_minute, bucket_interval, group_key,
        discriminator, bucket_end, event_count, unique_count, subjects, duration_count,
        duration_sum_ms, duration_min_ms, duration_max_ms, closed, closed_at)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
     ON CONFLICT(aggregation_type, bucket_date, bucket_minute, bucket_interval, group_key,
                 discriminator) DO UPDATE SET
        bucket_end = excluded.bucket_end,
        event_count = excluded.event_count,
        unique_count = excluded.unique_count,
        subjects = excluded.subjects,
        duration_count = excluded.duration_count,
        duration_sum_ms = excluded.duration_sum_ms,
        duration_min_ms = excluded.duration_min_ms,
        duration_max_ms = excluded.duration_max_ms,
        closed = excluded.closed,
        closed_at = excluded.closed_at
     WHERE aggregation.closed = 0";

/// Column encoding of an [`AggregationKey`].
struct KeyColumns {
    aggregation_type: &'static str,
    date: String,
    minute: u32,
    interval: &'static str,
    group: String,
    discriminator: String,
}

impl KeyColumns {
    fn encode(key: &AggregationKey) -> Result<Self, StoreError> {
        Ok(Self {
            aggregation_type: key.aggregation_type.as_str(),
            date: key.date.to_string(),
            minute: TimeDimension::from_time(key.time).minute_of_day,
            interval: key.interval.as_str(),
            group: serde_json::to_string(&key.group)?,
            discriminator: serde_json::to_string(&key.discriminator)?,
        })
    }
}

struct AggregationRow {
    aggregation_type: String,
    date: String,
    minute: i64,
    interval: String,
    group: String,
    discriminator: String,
    bucket_end: i64,
    count: i64,
    unique_count: i64,
    subjects: String,
    duration: [i64; 4],
    closed_at: Option<i64>,
}

impl AggregationRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            aggregation_type: row.get(0)?,
            date: row.get(1)?,
            minute: row.get(2)?,
            interval: row.get(3)?,
            group: row.get(4)?,
            discriminator: row.get(5)?,
            bucket_end: row.get(6)?,
            count: row.get(7)?,
            unique_count: row.get(8)?,
            subjects: row.get(9)?,
            duration: [row.get(10)?, row.get(11)?, row.get(12)?, row.get(13)?],
            closed_at: row.get(14)?,
        })
    }

    fn decode_key(&self) -> Result<AggregationKey, StoreError> {
        let aggregation_type = AggregationType::parse(&self.aggregation_type).ok_or_else(|| {
            corrupted(
                "aggregation",
                format!("unknown aggregation type {}", self.aggregation_type),
            )
        })?;
        let interval = AggregationInterval::parse(&self.interval).ok_or_else(|| {
            corrupted("aggregation", format!("unknown interval {}", self.interval))
        })?;
        let time = u32::try_from(self.minute)
            .ok()
            .and_then(TimeDimension::from_minute_of_day)
            .ok_or_else(|| {
                corrupted("aggregation", format!("bucket minute {} out of range", self.minute))
            })?
            .time;

        Ok(AggregationKey {
            aggregation_type,
            date: parse_date(&self.date)?,
            time,
            interval,
            group: serde_json::from_str(&self.group)?,
            discriminator: serde_json::from_str(&self.discriminator)?,
        })
    }

    fn into_record(self) -> Result<AggregationRecord, StoreError> {
        let key = self.decode_key()?;
        let subjects: HashSet<String> = serde_json::from_str(&self.subjects)?;
        let [count, sum_ms, min_ms, max_ms] = self.duration;
        Ok(AggregationRecord {
            key,
            bucket_end: from_millis(self.bucket_end),
            count: self.count as u64,
            unique_count: self.unique_count as u64,
            subjects,
            duration: DurationStats {
                count: count as u64,
                sum_ms: sum_ms as u64,
                min_ms: min_ms as u64,
                max_ms: max_ms as u64,
            },
            closed_at: self.closed_at.map(from_millis),
        })
    }
}

fn upsert_aggregation(conn: &Connection, record: &AggregationRecord) -> Result<(), StoreError> {
    let key = KeyColumns::encode(&record.key)?;
    let mut subjects: Vec<&String> = record.subjects.iter().collect();
    subjects.sort();

    conn.prepare_cached(UPSERT_AGGREGATION)?.execute(params![
        key.aggregation_type,
        key.date,
        key.minute,
        key.interval,
        key.group,
        key.discriminator,
        to_millis(record.bucket_end),
        record.count as i64,
        record.unique_count as i64,
        serde_json::to_string(&subjects)?,
        record.duration.count as i64,
        record.duration.sum_ms as i64,
        record.duration.min_ms as i64,
        record.duration.max_ms as i64,
        record.is_closed(),
        record.closed_at.map(to_millis),
    ])?;
    Ok(())
}

fn load_checkpoint(conn: &Connection) -> Result<Option<Checkpoint>, StoreError> {
    let row: Option<(String, i64, Option<i64>)> = conn
        .query_row(
            "SELECT owner, sequence, closed_through FROM aggregation_checkpoint WHERE id = 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    Ok(row.map(|(owner, sequence, closed_through)| Checkpoint {
        owner,
        sequence: sequence as u64,
        closed_through: closed_through.map(from_millis),
    }))
}

impl SqliteStore {
    fn query_aggregations(
        &self,
        where_clause: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<AggregationRecord>, StoreError> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {AGGREGATION_COLUMNS} FROM aggregation WHERE {where_clause}");
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt
            .query_map(params, AggregationRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        let mut records = rows
            .into_iter()
            .map(AggregationRow::into_record)
            .collect::<Result<Vec<_>, _>>()?;
        records.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(records)
    }
}

impl AggregationStore for SqliteStore {
    fn commit(&self, batch: &CommitBatch) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        check_sequence(load_checkpoint(&tx)?.as_ref(), &batch.checkpoint)?;

        for agg in &batch.open {
            upsert_aggregation(&tx, &AggregationRecord::from_open(agg))?;
        }
        for agg in &batch.closed {
            upsert_aggregation(&tx, &AggregationRecord::from_closed(agg))?;
        }

        {
            let mut mark = tx.prepare_cached("UPDATE raw_event SET status = ?2 WHERE id = ?1")?;
            for id in &batch.aggregated_events {
                mark.execute(params![id, EventStatus::Aggregated as u8])?;
            }
            for id in &batch.late_events {
                mark.execute(params![id, EventStatus::Late as u8])?;
            }
            for id in &batch.unaggregatable_events {
                mark.execute(params![id, EventStatus::Unaggregatable as u8])?;
            }
        }

        for session in &batch.sessions {
            touch_session(&tx, session)?;
        }

        tx.execute(
            "INSERT INTO aggregation_checkpoint (id, owner, sequence, closed_through)
             VALUES (1, ?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET
                owner = excluded.owner,
                sequence = excluded.sequence,
                closed_through = excluded.closed_through",
            params![
                batch.checkpoint.owner,
                batch.checkpoint.sequence as i64,
                batch.checkpoint.closed_through.map(to_millis),
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    fn load_checkpoint(&self) -> Result<Option<Checkpoint>, StoreError> {
        load_checkpoint(&self.conn.lock())
    }

    fn load_open(&self) -> Result<Vec<Aggregation>, StoreError> {
        Ok(self
            .query_aggregations("closed = 0", [])?
            .into_iter()
            .filter_map(AggregationRecord::into_open)
            .collect())
    }

    fn load_force_closed_after(
        &self,
        after: Option<DateTime<Utc>>,
    ) -> Result<Vec<(AggregationKey, DateTime<Utc>)>, StoreError> {
        Ok(self
            .query_aggregations(
                "closed = 1 AND (?1 IS NULL OR bucket_end > ?1)",
                params![after.map(to_millis)],
            )?
            .into_iter()
            .map(|r| (r.key, r.bucket_end))
            .collect())
    }

    fn get_aggregation(&self, key: &AggregationKey) -> Result<Option<AggregationRecord>, StoreError> {
        let cols = KeyColumns::encode(key)?;
        let mut found = self.query_aggregations(
            KEY_MATCH,
            params![
                cols.aggregation_type,
                cols.date,
                cols.minute,
                cols.interval,
                cols.group,
                cols.discriminator,
            ],
        )?;
        Ok(found.pop())
    }

    fn list_closed(&self, filter: &ClosedFilter) -> Result<Vec<ClosedAggregation>, StoreError> {
        Ok(self
            .query_aggregations(
                "closed = 1
                 AND (?1 IS NULL OR aggregation_type = ?1)
                 AND (?2 IS NULL OR bucket_interval = ?2)",
                params![
                    filter.aggregation_type.map(AggregationType::as_str),
                    filter.interval.map(AggregationInterval::as_str),
                ],
            )?
            .into_iter()
            .filter_map(AggregationRecord::into_closed)
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Event sessions
// ---------------------------------------------------------------------------

fn touch_session(conn: &Connection, session: &EventSession) -> Result<(), StoreError> {
    conn.prepare_cached(
        "INSERT INTO event_session (session_id, subject, last_accessed) VALUES (?1, ?2, ?3)
         ON CONFLICT(session_id) DO UPDATE SET
            last_accessed = MAX(event_session.last_accessed, excluded.last_accessed)",
    )?
    .execute(params![
        session.session_id,
        session.subject,
        to_millis(session.last_accessed),
    ])?;
    Ok(())
}

impl EventSessionStore for SqliteStore {
    fn touch(&self, session: &EventSession) -> Result<(), StoreError> {
        touch_session(&self.conn.lock(), session)
    }

    fn get_session(&self, session_id: &str) -> Result<Option<EventSession>, StoreError> {
        let session = self
            .conn
            .lock()
            .query_row(
                "SELECT session_id, subject, last_accessed FROM event_session
                 WHERE session_id = ?1",
                params![session_id],
                |row| {
                    Ok(EventSession {
                        session_id: row.get(0)?,
                        subject: row.get(1)?,
                        last_accessed: from_millis(row.get(2)?),
                    })
                },
            )
            .optional()?;
        Ok(session)
    }

    fn purge_expired(&self, idle_before: DateTime<Utc>) -> Result<usize, StoreError> {
        let removed = self.conn.lock().execute(
            "DELETE FROM event_session WHERE last_accessed < ?1",
            params![to_millis(idle_before)],
        )?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration as ChronoDuration, TimeZone};

    use super::*;
    use crate::aggregation::{AggregationDelta, Discriminator, GroupMapping};
    use crate::clock::ManualClock;
    use crate::dimension::{Calendar, DimensionCatalog};
    use crate::event::{EventPayload, ExecutionKind};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
    }

    fn store() -> (Arc<ManualClock>, SqliteStore) {
        let clock = Arc::new(ManualClock::new(start()));
        let store = SqliteStore::open_in_memory(clock.clone()).expect("open");
        (clock, store)
    }

    fn key(hour: u32, group: GroupMapping) -> AggregationKey {
        AggregationKey {
            aggregation_type: AggregationType::PortletExecution,
            date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            time: NaiveTime::from_hms_opt(hour, 0, 0).unwrap(),
            interval: AggregationInterval::Hour,
            group,
            discriminator: Discriminator::Resource {
                name: "weather".to_string(),
                operation: ExecutionKind::Render,
            },
        }
    }

    fn agg(hour: u32, subjects: &[&str]) -> Aggregation {
        let mut agg = Aggregation::new(
            key(hour, GroupMapping::AllUsers),
            start() + ChronoDuration::hours(i64::from(hour) - 8),
        );
        for subject in subjects {
            agg.apply(&AggregationDelta {
                subject: Some(subject),
                duration_ms: Some(25),
            });
        }
        agg
    }

    fn batch(sequence: u64) -> CommitBatch {
        CommitBatch::new(Checkpoint {
            owner: "node-a".to_string(),
            sequence,
            closed_through: Some(start()),
        })
    }

    #[test]
    fn test_mutex_acquire_renew_release() {
        let (clock, store) = store();
        let ttl = Duration::from_secs(60);

        assert!(store.acquire("aggregation", "a", ttl).unwrap());
        assert!(!store.acquire("aggregation", "b", ttl).unwrap());
        assert!(store.acquire("aggregation", "a", ttl).unwrap(), "reentrant for owner");
        assert!(store.renew("aggregation", "a", ttl).unwrap());
        assert!(!store.renew("aggregation", "b", ttl).unwrap());

        store.release("aggregation", "b").unwrap();
        assert_eq!(
            store.get("aggregation").unwrap().map(|r| r.owner),
            Some("a".to_string())
        );

        clock.advance(ChronoDuration::seconds(61));
        assert!(!store.renew("aggregation", "a", ttl).unwrap());
        assert!(store.acquire("aggregation", "b", ttl).unwrap(), "takeover after expiry");

        // The previous owner's release must not clear the new owner.
        store.release("aggregation", "a").unwrap();
        assert_eq!(
            store.get("aggregation").unwrap().map(|r| r.owner),
            Some("b".to_string())
        );
    }

    #[test]
    fn test_mutex_zero_ttl_rejected() {
        let (_, store) = store();
        assert!(matches!(
            store.acquire("x", "a", Duration::ZERO),
            Err(LockStoreError::InvalidTtl { .. })
        ));
    }

    #[test]
    fn test_mutex_delete_expired() {
        let (clock, store) = store();
        store.acquire("short", "a", Duration::from_secs(1)).unwrap();
        store.acquire("long", "a", Duration::from_secs(600)).unwrap();
        clock.advance(ChronoDuration::seconds(5));

        assert_eq!(MutexStore::delete_expired(&store).unwrap(), 1);
        assert!(store.get("short").unwrap().is_none());
        assert!(store.get("long").unwrap().is_some());
    }

    fn entity_lock(owner: &str, lock_type: LockType, ttl_secs: i64) -> EntityLock {
        EntityLock {
            entity_type: "portlet".to_string(),
            entity_key: "weather".to_string(),
            lock_owner: owner.to_string(),
            lock_type,
            expires_at: start() + ChronoDuration::seconds(ttl_secs),
        }
    }

    #[test]
    fn test_entity_lock_find_and_expiry() {
        let (clock, store) = store();
        assert!(store.add(&entity_lock("a", LockType::Shared, 30)).unwrap());
        assert!(store.add(&entity_lock("b", LockType::Shared, 90)).unwrap());
        assert!(!store.add(&entity_lock("c", LockType::Exclusive, 90)).unwrap());

        let filter = LockFilter::entity("portlet", "weather");
        assert_eq!(store.find(&filter).unwrap().len(), 2);

        clock.advance(ChronoDuration::seconds(60));
        let live = store.find_unexpired(&filter).unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].lock_owner, "b");
        assert_eq!(store.find(&filter).unwrap().len(), 2);

        assert_eq!(EntityLockStore::delete_expired(&store).unwrap(), 1);
        assert_eq!(store.find(&filter).unwrap().len(), 1);
    }

    #[test]
    fn test_entity_lock_update_and_upgrade() {
        let (_, store) = store();
        let a = entity_lock("a", LockType::Shared, 30);
        let b = entity_lock("b", LockType::Shared, 30);
        store.add(&a).unwrap();
        store.add(&b).unwrap();

        // Upgrade blocked by the other reader.
        assert!(!store
            .update(&a, a.expires_at, Some(LockType::Exclusive))
            .unwrap());
        store.delete(&b).unwrap();
        assert!(store
            .update(&a, a.expires_at + ChronoDuration::seconds(30), Some(LockType::Exclusive))
            .unwrap());

        let held = store
            .find(&LockFilter {
                owner: Some("a".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(held[0].lock_type, LockType::Exclusive);

        // Updating a lock that was never added fails.
        let ghost = entity_lock("ghost", LockType::Shared, 30);
        assert!(!store.update(&ghost, ghost.expires_at, None).unwrap());

        store.delete_all().unwrap();
        assert!(store.find(&LockFilter::default()).unwrap().is_empty());
    }

    #[test]
    fn test_dimension_population_through_catalog() {
        let (_, store) = store();
        let store = Arc::new(store);
        let catalog = DimensionCatalog::new(
            store.clone(),
            Arc::new(Calendar::default()),
            Some(NaiveDate::from_ymd_opt(2024, 2, 27).unwrap()),
        );

        let report = catalog.ensure_populated(start()).expect("populate");
        assert_eq!(report.dates_created, 4);
        assert_eq!(report.times_created, 1440);
        assert_eq!(store.time_count().unwrap(), 1440);

        let (date, time) = catalog
            .resolve(start() + ChronoDuration::minutes(65))
            .expect("resolve");
        assert_eq!(date.date, NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
        assert_eq!(time.minute_of_day, 10 * 60 + 5);

        assert_eq!(catalog.ensure_populated(start()).unwrap().dates_created, 0);
    }

    #[test]
    fn test_raw_event_roundtrip_and_purge() {
        let (_, store) = store();
        let events = vec![
            RawEvent {
                id: 0,
                occurred_at: start() + ChronoDuration::minutes(5),
                subject: "alice".to_string(),
                session_id: Some("s1".to_string()),
                subject_groups: vec!["students".to_string()],
                payload: EventPayload::TabRender {
                    tab: "home".to_string(),
                    duration_ms: 12,
                },
            },
            RawEvent {
                id: 0,
                occurred_at: start(),
                subject: "bob".to_string(),
                session_id: None,
                subject_groups: Vec::new(),
                payload: EventPayload::Login,
            },
        ];
        let ids = store.append(&events).unwrap();

        let pending = store.read_pending(10).unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, ids[1]);
        assert_eq!(pending[1].payload, events[0].payload);
        assert_eq!(pending[1].subject_groups, events[0].subject_groups);

        let mut b = batch(1);
        b.aggregated_events.push(ids[1]);
        store.commit(&b).unwrap();

        assert_eq!(store.event_status(ids[1]).unwrap(), Some(EventStatus::Aggregated));
        assert_eq!(store.purge_processed(start() + ChronoDuration::hours(1)).unwrap(), 1);
        assert_eq!(store.read_pending(10).unwrap().len(), 1);

        let mut b = batch(2);
        b.unaggregatable_events.push(ids[0]);
        store.commit(&b).unwrap();

        assert_eq!(
            store.event_status(ids[0]).unwrap(),
            Some(EventStatus::Unaggregatable)
        );
        assert!(store.read_pending(10).unwrap().is_empty());
        assert_eq!(store.purge_processed(start() + ChronoDuration::hours(1)).unwrap(), 1);
    }

    #[test]
    fn test_commit_upserts_and_freezes_closed_rows() {
        let (_, store) = store();

        let mut b = batch(1);
        b.open.push(agg(9, &["alice", "bob"]));
        store.commit(&b).unwrap();

        let open = store.load_open().unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].unique_count(), 2);
        assert_eq!(open[0].duration().sum_ms, 50);
        assert_eq!(open[0], agg(9, &["alice", "bob"]));

        let mut b = batch(2);
        b.closed.push(agg(9, &["alice", "bob", "carol"]).close(start()));
        store.commit(&b).unwrap();

        let mut b = batch(3);
        b.open.push(agg(9, &["dave"]));
        store.commit(&b).unwrap();

        let record = store
            .get_aggregation(&key(9, GroupMapping::AllUsers))
            .unwrap()
            .expect("row");
        assert!(record.is_closed());
        assert_eq!(record.count, 3);
        assert!(store.load_open().unwrap().is_empty());

        let closed = store.list_closed(&ClosedFilter::default()).unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].unique_count, 3);
    }

    #[test]
    fn test_commit_is_atomic_on_conflict() {
        let (_, store) = store();
        store.commit(&batch(1)).unwrap();

        let mut stale = batch(1);
        stale.open.push(agg(10, &["alice"]));
        assert!(matches!(
            store.commit(&stale),
            Err(StoreError::CheckpointConflict { .. })
        ));
        assert!(store.load_open().unwrap().is_empty());
        assert_eq!(store.load_checkpoint().unwrap().map(|c| c.sequence), Some(1));
    }

    #[test]
    fn test_group_key_columns_distinguish_groups() {
        let (_, store) = store();
        let mut b = batch(1);
        for group in [GroupMapping::AllUsers, GroupMapping::from_group_name("students")] {
            let mut a = Aggregation::new(key(9, group), start() + ChronoDuration::hours(1));
            a.apply(&AggregationDelta::count_only());
            b.closed.push(a.close(start()));
        }
        store.commit(&b).unwrap();

        assert_eq!(store.list_closed(&ClosedFilter::default()).unwrap().len(), 2);
        let students = store
            .get_aggregation(&key(9, GroupMapping::from_group_name("students")))
            .unwrap()
            .expect("group row");
        assert_eq!(students.count, 1);

        let forced = store.load_force_closed_after(Some(start())).unwrap();
        assert_eq!(forced.len(), 2);
        assert!(store
            .load_force_closed_after(Some(start() + ChronoDuration::hours(1)))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_sessions() {
        let (_, store) = store();
        let session = |offset| EventSession {
            session_id: "s1".to_string(),
            subject: "alice".to_string(),
            last_accessed: start() + ChronoDuration::minutes(offset),
        };
        store.touch(&session(10)).unwrap();
        store.touch(&session(5)).unwrap();
        assert_eq!(
            store.get_session("s1").unwrap().map(|s| s.last_accessed),
            Some(start() + ChronoDuration::minutes(10))
        );
        assert_eq!(store.purge_expired(start() + ChronoDuration::minutes(10)).unwrap(), 0);
        assert_eq!(store.purge_expired(start() + ChronoDuration::minutes(11)).unwrap(), 1);
        assert!(store.get_session("s1").unwrap().is_none());
    }
}
