use crate::error::StatsError;
use crate::query::gaps::densify;
use crate::query::timeseries::AggregatedPoint;
use chrono::{DateTime, Datelike, Months, NaiveDate, NaiveTime, TimeDelta, Timelike, Utc};
use std::fmt;
use std::str::FromStr;

/// Upper bound on buckets in one series.
pub const MAX_BUCKETS: i64 = 10_000;

/// Time granularity for bucketing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Granularity {
    Hour,
    Day,
    Month,
}

impl Granularity {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Month => "month",
        }
    }

    /// Unit name accepted by DuckDB's `date_trunc`.
    pub(crate) const fn trunc_unit(self) -> &'static str {
        self.as_str()
    }

    /// Start of the bucket containing `ts`.
    pub fn truncate(self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let date = ts.date_naive();
        match self {
            Self::Hour => date
                .and_hms_opt(ts.hour(), 0, 0)
                .map_or(ts, |naive| naive.and_utc()),
            Self::Day => date.and_time(NaiveTime::MIN).and_utc(),
            Self::Month => NaiveDate::from_ymd_opt(date.year(), date.month(), 1)
                .map_or(ts, |first| first.and_time(NaiveTime::MIN).and_utc()),
        }
    }

    /// Start of the bucket after the one starting at `ts`.
    ///
    /// Returns `ts` unchanged when the calendar overflows, which ends any walk.
    pub fn step(self, ts: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::Hour => ts.checked_add_signed(TimeDelta::hours(1)).unwrap_or(ts),
            Self::Day => ts.checked_add_signed(TimeDelta::days(1)).unwrap_or(ts),
            Self::Month => ts.checked_add_months(Months::new(1)).unwrap_or(ts),
        }
    }

    /// Number of buckets between the buckets holding `start` and `end`, inclusive.
    pub fn bucket_count(self, start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
        let (first, last) = (self.truncate(start), self.truncate(end));
        let span = match self {
            Self::Hour => (last - first).num_hours(),
            Self::Day => (last - first).num_days(),
            Self::Month => {
                let months = |ts: DateTime<Utc>| i64::from(ts.year()) * 12 + i64::from(ts.month0());
                months(last) - months(first)
            }
        };
        span + 1
    }

    /// Reject ranges that would produce more than [`MAX_BUCKETS`] buckets.
    pub fn check_bucket_count(self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<(), StatsError> {
        let count = self.bucket_count(start, end);
        if count > MAX_BUCKETS {
            return Err(StatsError::invalid(format!(
                "range spans {count} {self} buckets, at most {MAX_BUCKETS} allowed"
            )));
        }
        Ok(())
    }

    /// Zero-fill `points` over every bucket between `start` and `end` inclusive.
    pub fn densify_range(
        self,
        points: &[AggregatedPoint],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<AggregatedPoint> {
        densify(points, self.truncate(start), self.truncate(end), |ts| self.step(ts))
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = StatsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hour" => Ok(Self::Hour),
            "day" => Ok(Self::Day),
            "month" => Ok(Self::Month),
            other => Err(StatsError::invalid(format!(
                "unknown granularity {other:?}, expected hour, day or month"
            ))),
        }
    }
}
