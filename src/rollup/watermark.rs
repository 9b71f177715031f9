use crate::error::StatsError;
use crate::storage::{bind_timestamp, bucket_column};
use chrono::{DateTime, Days, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use duckdb::{params, Connection};
use serde::Serialize;

/// The last successful compaction of one day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Watermark {
    pub day: NaiveDate,
    pub compacted_at: DateTime<Utc>,
    pub fact_count: u64,
    pub daily_rows: u64,
    pub hourly_rows: u64,
}

/// Fact-table totals against rollup totals for one site-day.
///
/// Pageviews and bounces are additive across dimension groups, so they must
/// match exactly once the day is compacted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CrossCheck {
    pub site_id: String,
    pub day: NaiveDate,
    pub fact_pageviews: u64,
    pub rollup_pageviews: u64,
    pub fact_bounces: u64,
    pub rollup_bounces: u64,
}

impl CrossCheck {
    pub fn is_consistent(&self) -> bool {
        self.fact_pageviews == self.rollup_pageviews && self.fact_bounces == self.rollup_bounces
    }
}

/// Watermark for `day`, if it was ever compacted.
pub fn last_compacted(conn: &Connection, day: NaiveDate) -> Result<Option<Watermark>, StatsError> {
    let midnight = day.and_time(NaiveTime::MIN).and_utc();
    let mut stmt = conn
        .prepare(
            "SELECT strftime(compacted_at, '%Y-%m-%d %H:%M:%S'), fact_count, daily_rows, hourly_rows
             FROM compaction_watermarks WHERE day = CAST(? AS TIMESTAMP)",
        )
        .map_err(StatsError::Query)?;
    let mut rows = stmt
        .query_map(params![bind_timestamp(midnight)], |row| {
            Ok(Watermark {
                day,
                compacted_at: bucket_column(row, 0)?,
                fact_count: row.get(1)?,
                daily_rows: row.get(2)?,
                hourly_rows: row.get(3)?,
            })
        })
        .map_err(StatsError::Query)?;
    let mark = rows.next().transpose().map_err(StatsError::Query)?;
    Ok(mark)
}

/// Past days within `lookback_days` of `now` whose facts are not covered by a
/// matching watermark, oldest first. Today is never stale.
///
/// A day is stale when it has facts but no watermark, or when late arrivals moved
/// its fact count away from the one recorded at compaction.
pub fn stale_days(
    conn: &Connection,
    now: DateTime<Utc>,
    lookback_days: u32,
) -> Result<Vec<NaiveDate>, StatsError> {
    let today = now.date_naive();
    let from = today
        .checked_sub_days(Days::new(u64::from(lookback_days)))
        .unwrap_or(NaiveDate::MIN);
    let (from, to) = (
        from.and_time(NaiveTime::MIN).and_utc(),
        today.and_time(NaiveTime::MIN).and_utc(),
    );

    let mut stmt = conn
        .prepare(
            "WITH facts AS (
                 SELECT CAST(date_trunc('day', ts) AS TIMESTAMP) AS day, COUNT(*) AS n
                 FROM pageviews
                 WHERE ts >= CAST(? AS TIMESTAMP) AND ts < CAST(? AS TIMESTAMP)
                 GROUP BY 1
             )
             SELECT strftime(f.day, '%Y-%m-%d %H:%M:%S')
             FROM facts f
             LEFT JOIN compaction_watermarks w ON w.day = f.day
             WHERE w.day IS NULL OR w.fact_count <> f.n
             ORDER BY f.day",
        )
        .map_err(StatsError::Query)?;
    let days = stmt
        .query_map(params![bind_timestamp(from), bind_timestamp(to)], |row| {
            bucket_column(row, 0).map(|ts| ts.date_naive())
        })
        .map_err(StatsError::Query)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(StatsError::Query)?;
    Ok(days)
}

/// Compare raw facts with the daily rollup for one site-day.
pub fn cross_check(conn: &Connection, site_id: &str, day: NaiveDate) -> Result<CrossCheck, StatsError> {
    let start = day.and_time(NaiveTime::MIN).and_utc();
    let end = day
        .checked_add_days(Days::new(1))
        .map_or(NaiveDateTime::MAX, |d| d.and_time(NaiveTime::MIN))
        .and_utc();

    let (fact_pageviews, fact_bounces): (u64, u64) = conn
        .prepare(
            "WITH per_visitor AS (
                 SELECT visitor_id, COUNT(*) AS pv_count
                 FROM pageviews
                 WHERE site_id = ? AND ts >= CAST(? AS TIMESTAMP) AND ts < CAST(? AS TIMESTAMP)
                 GROUP BY visitor_id
             )
             SELECT CAST(COALESCE(SUM(pv_count), 0) AS BIGINT),
                    COUNT(*) FILTER (WHERE pv_count = 1)
             FROM per_visitor",
        )
        .and_then(|mut stmt| {
            stmt.query_row(
                params![site_id, bind_timestamp(start), bind_timestamp(end)],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
        })
        .map_err(StatsError::Query)?;

    let (rollup_pageviews, rollup_bounces): (u64, u64) = conn
        .prepare(
            "SELECT CAST(COALESCE(SUM(count), 0) AS BIGINT), CAST(COALESCE(SUM(bounces), 0) AS BIGINT)
             FROM daily_pageviews
             WHERE site_id = ? AND day = CAST(? AS TIMESTAMP)",
        )
        .and_then(|mut stmt| {
            stmt.query_row(params![site_id, bind_timestamp(start)], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
        })
        .map_err(StatsError::Query)?;

    let check = CrossCheck {
        site_id: site_id.to_string(),
        day,
        fact_pageviews,
        rollup_pageviews,
        fact_bounces,
        rollup_bounces,
    };
    if !check.is_consistent() {
        tracing::warn!(
            site_id,
            day = %day,
            fact_pageviews,
            rollup_pageviews,
            fact_bounces,
            rollup_bounces,
            "Rollup disagrees with facts"
        );
    }
    Ok(check)
}
