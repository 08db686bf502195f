//! Calendar-day and time-of-day dimension catalog.
//!
//! Every instant the engine aggregates must resolve to exactly one
//! [`DateDimension`] and one [`TimeDimension`]. Rows are created ahead of need
//! by [`DimensionCatalog::ensure_populated`] with insert-if-absent semantics,
//! so concurrent populators on different nodes converge.

use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Timelike, Utc};
use dashmap::DashMap;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::store::StoreError;

/// Number of time-of-day rows (one per minute).
pub const MINUTES_PER_DAY: u32 = 24 * 60;

/// Default for how far [`DimensionCatalog::ensure_covering`] may reach beyond
/// the populated run.
pub const DEFAULT_MAX_EXTENSION_DAYS: i64 = 366;

/// Errors raised by the dimension catalog.
#[derive(Error, Debug)]
pub enum DimensionError {
    /// Retryable once the catalog has been populated to cover `instant`.
    #[error("no dimension rows for {instant}")]
    NotPopulated { instant: DateTime<Utc> },

    /// Not retryable: `instant` lies too far from the populated run.
    #[error("{instant} is outside the dimension horizon {earliest}..={latest}")]
    OutOfHorizon {
        instant: DateTime<Utc>,
        earliest: NaiveDate,
        latest: NaiveDate,
    },

    #[error("dimension store: {0}")]
    Store(#[from] StoreError),
}

/// Named academic term, inclusive of both end dates.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AcademicTerm {
    pub name: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl AcademicTerm {
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

/// Calendar configuration shared by the catalog and interval math.
#[derive(Debug, Clone, Default)]
pub struct Calendar {
    terms: Vec<AcademicTerm>,
}

impl Calendar {
    /// Terms are sorted by start date. Overlaps are rejected by config
    /// validation, so the first match is the only match.
    pub fn new(mut terms: Vec<AcademicTerm>) -> Self {
        terms.sort_by_key(|t| t.start);
        Self { terms }
    }

    pub fn term_for(&self, date: NaiveDate) -> Option<&AcademicTerm> {
        self.terms.iter().find(|t| t.contains(date))
    }

    pub fn term_named(&self, name: &str) -> Option<&AcademicTerm> {
        self.terms.iter().find(|t| t.name == name)
    }

    pub fn terms(&self) -> &[AcademicTerm] {
        &self.terms
    }
}

/// Immutable calendar-day row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DateDimension {
    pub date: NaiveDate,
    pub year: i32,
    pub quarter: u32,
    pub month: u32,
    pub week: u32,
    pub day_of_week: u32,
    pub term: Option<String>,
}

impl DateDimension {
    pub fn new(date: NaiveDate, calendar: &Calendar) -> Self {
        Self {
            date,
            year: date.year(),
            quarter: (date.month() - 1) / 3 + 1,
            month: date.month(),
            week: date.iso_week().week(),
            day_of_week: date.weekday().number_from_monday(),
            term: calendar.term_for(date).map(|t| t.name.clone()),
        }
    }
}

/// Immutable time-of-day row at one-minute resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeDimension {
    pub time: NaiveTime,
    pub hour: u32,
    pub minute: u32,
    pub five_minute: u32,
    pub minute_of_day: u32,
}

impl TimeDimension {
    /// Returns `None` when `minute_of_day` is outside a day.
    pub fn from_minute_of_day(minute_of_day: u32) -> Option<Self> {
        let time = NaiveTime::from_hms_opt(minute_of_day / 60, minute_of_day % 60, 0)?;
        Some(Self::from_time(time))
    }

    /// Floors `time` to its minute.
    pub fn from_time(time: NaiveTime) -> Self {
        let hour = time.hour();
        let minute = time.minute();
        Self {
            time: NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN),
            hour,
            minute,
            five_minute: minute / 5 * 5,
            minute_of_day: hour * 60 + minute,
        }
    }
}

/// Persistence contract for dimension rows.
pub trait DimensionStore: Send + Sync {
    /// Insert unless a row for the same date exists. Returns true if inserted.
    fn insert_date_if_absent(&self, row: &DateDimension) -> Result<bool, StoreError>;

    fn insert_time_if_absent(&self, row: &TimeDimension) -> Result<bool, StoreError>;

    /// Bulk variant. Stores with transactions override this.
    fn insert_dates_if_absent(&self, rows: &[DateDimension]) -> Result<usize, StoreError> {
        let mut inserted = 0;
        for row in rows {
            if self.insert_date_if_absent(row)? {
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    fn get_date(&self, date: NaiveDate) -> Result<Option<DateDimension>, StoreError>;

    fn get_time(&self, time: NaiveTime) -> Result<Option<TimeDimension>, StoreError>;

    /// Oldest and newest populated dates.
    fn date_range(&self) -> Result<Option<(NaiveDate, NaiveDate)>, StoreError>;

    fn time_count(&self) -> Result<usize, StoreError>;
}

/// Rows created by one population pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PopulateReport {
    pub dates_created: usize,
    pub times_created: usize,
}

/// Resolves instants to dimension rows and keeps the populated horizon ahead
/// of need.
pub struct DimensionCatalog {
    store: Arc<dyn DimensionStore>,
    calendar: Arc<Calendar>,
    horizon_start: Option<NaiveDate>,
    max_extension: Duration,
    dates: DashMap<NaiveDate, DateDimension>,
    times: DashMap<NaiveTime, TimeDimension>,
}

impl DimensionCatalog {
    pub fn new(
        store: Arc<dyn DimensionStore>,
        calendar: Arc<Calendar>,
        horizon_start: Option<NaiveDate>,
    ) -> Self {
        Self {
            store,
            calendar,
            horizon_start,
            max_extension: Duration::days(DEFAULT_MAX_EXTENSION_DAYS),
            dates: DashMap::with_capacity(512),
            times: DashMap::with_capacity(MINUTES_PER_DAY as usize),
        }
    }

    /// Limits how far `ensure_covering` extends past the populated run.
    pub fn with_max_extension(mut self, max_extension: Duration) -> Self {
        self.max_extension = max_extension;
        self
    }

    pub fn calendar(&self) -> &Arc<Calendar> {
        &self.calendar
    }

    /// Guarantees rows exist for every date from the horizon start through
    /// `through`, and for every minute of the day. Idempotent.
    pub fn ensure_populated(&self, through: DateTime<Utc>) -> Result<PopulateReport, DimensionError> {
        let through_date = through.date_naive();
        let mut report = PopulateReport {
            times_created: self.populate_times()?,
            ..Default::default()
        };

        let range = self.store.date_range()?;
        let start = match (self.horizon_start, range) {
            (Some(h), Some((oldest, _))) => h.min(oldest),
            (Some(h), None) => h,
            (None, Some((oldest, _))) => oldest,
            (None, None) => through_date,
        };

        // Populated dates are always one contiguous run, so only the gaps on
        // either side need inserting.
        match range {
            Some((oldest, newest)) => {
                if start < oldest {
                    report.dates_created += self.populate_dates(start, oldest.pred_opt())?;
                }
                if through_date > newest {
                    report.dates_created += self.populate_dates(
                        newest.succ_opt().unwrap_or(newest),
                        Some(through_date),
                    )?;
                }
            }
            None => {
                report.dates_created += self.populate_dates(start, Some(through_date))?;
            }
        }

        if report.dates_created > 0 || report.times_created > 0 {
            info!(
                dates_created = report.dates_created,
                times_created = report.times_created,
                %through_date,
                "dimensions populated",
            );
        }

        Ok(report)
    }

    /// Extends the populated run so that `instant` resolves.
    ///
    /// Refuses with [`DimensionError::OutOfHorizon`] when `instant` falls more
    /// than `max_extension` outside the span of the populated run and `now`.
    pub fn ensure_covering(
        &self,
        instant: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<PopulateReport, DimensionError> {
        let date = instant.date_naive();
        let range = self.store.date_range()?;

        let today = now.date_naive();
        let (oldest, newest) = range.map_or((today, today), |(oldest, newest)| {
            (oldest.min(today), newest.max(today))
        });
        let earliest = oldest
            .checked_sub_signed(self.max_extension)
            .unwrap_or(NaiveDate::MIN);
        let latest = newest
            .checked_add_signed(self.max_extension)
            .unwrap_or(NaiveDate::MAX);
        if date < earliest || date > latest {
            warn!(%instant, %earliest, %latest, "refusing to extend dimension horizon");
            return Err(DimensionError::OutOfHorizon {
                instant,
                earliest,
                latest,
            });
        }

        let mut report = PopulateReport {
            times_created: self.populate_times()?,
            ..Default::default()
        };

        report.dates_created = match range {
            None => self.populate_dates(date, Some(date))?,
            Some((oldest, _)) if date < oldest => self.populate_dates(date, oldest.pred_opt())?,
            Some((_, newest)) if date > newest => {
                self.populate_dates(newest.succ_opt().unwrap_or(newest), Some(date))?
            }
            Some(_) => 0,
        };

        debug!(%date, dates_created = report.dates_created, "ensured dimension coverage");
        Ok(report)
    }

    /// Looks up the rows for `instant`, caching them after the first hit.
    pub fn resolve(
        &self,
        instant: DateTime<Utc>,
    ) -> Result<(DateDimension, TimeDimension), DimensionError> {
        let date = instant.date_naive();
        let time = TimeDimension::from_time(instant.time()).time;

        let date_row = match self.dates.get(&date) {
            Some(row) => row.clone(),
            None => {
                let row = self
                    .store
                    .get_date(date)?
                    .ok_or(DimensionError::NotPopulated { instant })?;
                self.dates.insert(date, row.clone());
                row
            }
        };

        let time_row = match self.times.get(&time) {
            Some(row) => *row,
            None => {
                let row = self
                    .store
                    .get_time(time)?
                    .ok_or(DimensionError::NotPopulated { instant })?;
                self.times.insert(time, row);
                row
            }
        };

        Ok((date_row, time_row))
    }

    fn populate_times(&self) -> Result<usize, StoreError> {
        if self.store.time_count()? >= MINUTES_PER_DAY as usize {
            return Ok(0);
        }

        let mut created = 0;
        for minute in 0..MINUTES_PER_DAY {
            if let Some(row) = TimeDimension::from_minute_of_day(minute) {
                if self.store.insert_time_if_absent(&row)? {
                    created += 1;
                }
            }
        }
        Ok(created)
    }

    /// Inserts `from..=to`. `to == None` means the range is empty.
    fn populate_dates(&self, from: NaiveDate, to: Option<NaiveDate>) -> Result<usize, StoreError> {
        let Some(to) = to else {
            return Ok(0);
        };
        if from > to {
            return Ok(0);
        }

        let days = (to - from).num_days() + 1;
        let rows: Vec<DateDimension> = (0..days)
            .filter_map(|offset| from.checked_add_signed(Duration::days(offset)))
            .map(|date| DateDimension::new(date, &self.calendar))
            .collect();

        self.store.insert_dates_if_absent(&rows)
    }
}
