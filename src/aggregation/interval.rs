use std::fmt;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::dimension::Calendar;

/// Supported bucket granularities.
///
/// All bucket math is done in UTC. Weeks are ISO weeks (Monday start),
/// quarters start in January, April, July and October, and academic terms
/// come from the configured [`Calendar`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationInterval {
    Minute,
    FiveMinute,
    Hour,
    Day,
    Week,
    Month,
    CalendarQuarter,
    AcademicTerm,
    Year,
}

/// Half-open time range `[start, end)` covered by one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Bucket {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Bucket {
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant < self.end
    }
}

impl AggregationInterval {
    pub const ALL: [Self; 9] = [
        Self::Minute,
        Self::FiveMinute,
        Self::Hour,
        Self::Day,
        Self::Week,
        Self::Month,
        Self::CalendarQuarter,
        Self::AcademicTerm,
        Self::Year,
    ];

    /// Returns the canonical label name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::FiveMinute => "five_minute",
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
            Self::CalendarQuarter => "calendar_quarter",
            Self::AcademicTerm => "academic_term",
            Self::Year => "year",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|i| i.as_str() == s)
    }

    /// Next coarser interval whose buckets each contain whole buckets of
    /// this one.
    pub const fn parent(self) -> Option<Self> {
        match self {
            Self::Minute => Some(Self::FiveMinute),
            Self::FiveMinute => Some(Self::Hour),
            Self::Hour => Some(Self::Day),
            Self::Day => Some(Self::Month),
            Self::Month => Some(Self::CalendarQuarter),
            Self::CalendarQuarter => Some(Self::Year),
            Self::Week | Self::AcademicTerm | Self::Year => None,
        }
    }

    /// True if every bucket of `finer` lies entirely inside one bucket of
    /// `self`, so finer buckets can be rolled up into this interval.
    pub fn contains(self, finer: Self) -> bool {
        if self == finer {
            return false;
        }

        let mut current = finer.parent();
        while let Some(p) = current {
            if p == self {
                return true;
            }
            current = p.parent();
        }

        // Weeks and terms are made of whole days but sit outside the chain.
        matches!(self, Self::Week | Self::AcademicTerm) && finer <= Self::Day
    }

    /// Bucket containing `instant`. `None` only for academic terms when the
    /// date falls outside every configured term.
    pub fn bucket(self, instant: DateTime<Utc>, calendar: &Calendar) -> Option<Bucket> {
        let date = instant.date_naive();
        let (start, end) = match self {
            Self::Minute => {
                let start = floor_minutes(instant, 1);
                (start, start + Duration::minutes(1))
            }
            Self::FiveMinute => {
                let start = floor_minutes(instant, 5);
                (start, start + Duration::minutes(5))
            }
            Self::Hour => {
                let start = floor_minutes(instant, 60);
                (start, start + Duration::hours(1))
            }
            Self::Day => {
                let start = midnight(date);
                (start, start + Duration::days(1))
            }
            Self::Week => {
                let monday =
                    date - Duration::days(i64::from(date.weekday().num_days_from_monday()));
                let start = midnight(monday);
                (start, start + Duration::days(7))
            }
            Self::Month => {
                let first = first_of_month(date.year(), date.month())?;
                (midnight(first), midnight(add_months(first, 1)?))
            }
            Self::CalendarQuarter => {
                let quarter_month = (date.month() - 1) / 3 * 3 + 1;
                let first = first_of_month(date.year(), quarter_month)?;
                (midnight(first), midnight(add_months(first, 3)?))
            }
            Self::AcademicTerm => {
                let term = calendar.term_for(date)?;
                (midnight(term.start), midnight(term.end.succ_opt()?))
            }
            Self::Year => {
                let first = first_of_month(date.year(), 1)?;
                (midnight(first), midnight(first_of_month(date.year() + 1, 1)?))
            }
        };

        Some(Bucket { start, end })
    }
}

impl fmt::Display for AggregationInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

fn floor_minutes(instant: DateTime<Utc>, step: u32) -> DateTime<Utc> {
    let minute_of_day = instant.hour() * 60 + instant.minute();
    let floored = minute_of_day / step * step;
    midnight(instant.date_naive()) + Duration::minutes(i64::from(floored))
}

fn first_of_month(year: i32, month: u32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, 1)
}

fn add_months(first: NaiveDate, months: u32) -> Option<NaiveDate> {
    let zero_based = first.month0() + months;
    first_of_month(first.year() + (zero_based / 12) as i32, zero_based % 12 + 1)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::dimension::AcademicTerm;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    fn calendar() -> Calendar {
        Calendar::new(vec![AcademicTerm {
            name: "spring-2024".to_string(),
            start: NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
            end: NaiveDate::from_ymd_opt(2024, 5, 10).unwrap(),
        }])
    }

    fn bounds(interval: AggregationInterval, instant: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let b = interval.bucket(instant, &calendar()).expect("bucket");
        (b.start, b.end)
    }

    #[test]
    fn test_sub_daily_buckets() {
        let t = at(2024, 3, 1, 9, 47, 12);
        assert_eq!(
            bounds(AggregationInterval::Minute, t),
            (at(2024, 3, 1, 9, 47, 0), at(2024, 3, 1, 9, 48, 0))
        );
        assert_eq!(
            bounds(AggregationInterval::FiveMinute, t),
            (at(2024, 3, 1, 9, 45, 0), at(2024, 3, 1, 9, 50, 0))
        );
        assert_eq!(
            bounds(AggregationInterval::Hour, t),
            (at(2024, 3, 1, 9, 0, 0), at(2024, 3, 1, 10, 0, 0))
        );
        assert_eq!(
            bounds(AggregationInterval::Day, t),
            (at(2024, 3, 1, 0, 0, 0), at(2024, 3, 2, 0, 0, 0))
        );
    }

    #[test]
    fn test_last_hour_of_day_rolls_into_next_day() {
        let t = at(2024, 12, 31, 23, 59, 59);
        assert_eq!(
            bounds(AggregationInterval::Hour, t),
            (at(2024, 12, 31, 23, 0, 0), at(2025, 1, 1, 0, 0, 0))
        );
    }

    #[test]
    fn test_week_starts_monday() {
        // 2024-03-01 is a Friday.
        let t = at(2024, 3, 1, 12, 0, 0);
        assert_eq!(
            bounds(AggregationInterval::Week, t),
            (at(2024, 2, 26, 0, 0, 0), at(2024, 3, 4, 0, 0, 0))
        );
    }

    #[test]
    fn test_calendar_buckets() {
        let t = at(2024, 11, 20, 8, 0, 0);
        assert_eq!(
            bounds(AggregationInterval::Month, t),
            (at(2024, 11, 1, 0, 0, 0), at(2024, 12, 1, 0, 0, 0))
        );
        assert_eq!(
            bounds(AggregationInterval::CalendarQuarter, t),
            (at(2024, 10, 1, 0, 0, 0), at(2025, 1, 1, 0, 0, 0))
        );
        assert_eq!(
            bounds(AggregationInterval::Year, t),
            (at(2024, 1, 1, 0, 0, 0), at(2025, 1, 1, 0, 0, 0))
        );
        assert_eq!(
            bounds(AggregationInterval::Month, at(2024, 12, 5, 0, 0, 0)),
            (at(2024, 12, 1, 0, 0, 0), at(2025, 1, 1, 0, 0, 0))
        );
    }

    #[test]
    fn test_academic_term_bucket() {
        let cal = calendar();
        let inside = AggregationInterval::AcademicTerm
            .bucket(at(2024, 3, 1, 9, 0, 0), &cal)
            .expect("inside term");
        assert_eq!(inside.start, at(2024, 1, 15, 0, 0, 0));
        assert_eq!(inside.end, at(2024, 5, 11, 0, 0, 0));

        assert!(AggregationInterval::AcademicTerm
            .bucket(at(2024, 7, 1, 9, 0, 0), &cal)
            .is_none());
    }

    #[test]
    fn test_bucket_contains_its_instant() {
        let cal = calendar();
        let t = at(2024, 2, 29, 23, 59, 59);
        for interval in AggregationInterval::ALL {
            let b = interval.bucket(t, &cal).expect("bucket");
            assert!(b.contains(t), "{interval} bucket does not contain instant");
            // Start of a bucket maps to the same bucket.
            assert_eq!(interval.bucket(b.start, &cal), Some(b));
        }
    }

    #[test]
    fn test_parent_chain_and_containment() {
        use AggregationInterval as I;

        assert_eq!(I::Minute.parent(), Some(I::FiveMinute));
        assert_eq!(I::Day.parent(), Some(I::Month));
        assert_eq!(I::Week.parent(), None);

        assert!(I::Year.contains(I::Minute));
        assert!(I::Month.contains(I::Day));
        assert!(I::Week.contains(I::Hour));
        assert!(I::AcademicTerm.contains(I::Day));
        assert!(!I::Month.contains(I::Week));
        assert!(!I::Year.contains(I::Week));
        assert!(!I::Day.contains(I::Day));
        assert!(!I::Hour.contains(I::Day));
    }

    #[test]
    fn test_parse_roundtrip() {
        for interval in AggregationInterval::ALL {
            assert_eq!(AggregationInterval::parse(interval.as_str()), Some(interval));
        }
        assert_eq!(AggregationInterval::parse("fortnight"), None);
    }
}
