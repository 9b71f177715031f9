pub mod breakdowns;
pub mod gaps;
pub mod granularity;
pub mod summary;
pub mod timeseries;

use crate::error::StatsError;
use chrono::{DateTime, NaiveTime, TimeDelta, Utc};

/// Inclusive sub-ranges served from rollups (before today) and from raw facts (today on).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Split {
    pub boundary: DateTime<Utc>,
    pub historic: Option<(DateTime<Utc>, DateTime<Utc>)>,
    pub live: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

/// Split `[start, end]` at UTC midnight of `now`.
pub(crate) fn split_range(start: DateTime<Utc>, end: DateTime<Utc>, now: DateTime<Utc>) -> Split {
    let boundary = now.date_naive().and_time(NaiveTime::MIN).and_utc();
    // Timestamps are stored with microsecond precision
    let last_historic = boundary - TimeDelta::microseconds(1);
    Split {
        boundary,
        historic: (start < boundary).then(|| (start, end.min(last_historic))),
        live: (end >= boundary).then(|| (start.max(boundary), end)),
    }
}

pub(crate) fn validate_range(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<(), StatsError> {
    if start > end {
        return Err(StatsError::invalid(format!(
            "start {start} is after end {end}"
        )));
    }
    Ok(())
}

/// Bouncing visitors over unique visitors; zero when there are no visitors.
#[allow(clippy::cast_precision_loss)]
pub(crate) fn bounce_rate(bounces: u64, unique_visitors: u64) -> f64 {
    if unique_visitors == 0 {
        0.0
    } else {
        bounces as f64 / unique_visitors as f64
    }
}
