use crate::error::StatsError;
use crate::storage::bind_timestamp;
use crate::storage::dimensions::Dimension;
use chrono::{DateTime, Days, NaiveDate, NaiveTime, Utc};
use duckdb::{params, Connection};
use serde::Serialize;

/// Summary of one successful compaction run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CompactionReport {
    pub day: NaiveDate,
    pub fact_count: u64,
    pub daily_rows: u64,
    pub hourly_rows: u64,
}

/// Compact `day` using the wall clock to decide what "today" is.
pub fn compact_day(conn: &mut Connection, day: NaiveDate) -> Result<CompactionReport, StatsError> {
    compact_day_at(conn, day, Utc::now())
}

/// Compact `day`, rejecting it unless it ended before the UTC day containing `now`.
///
/// Writes one `daily_pageviews` and `hourly_pageviews` row per (bucket, site,
/// dimension tuple), upserted on the composite key. A daily bounce is a visitor
/// with exactly one view that day across the whole site, however that view is
/// categorized; an hourly bounce is a visitor with one view in that hour.
///
/// All upserts and the watermark run in one transaction; on failure nothing from
/// this run is kept and rows from earlier successful runs remain.
pub fn compact_day_at(
    conn: &mut Connection,
    day: NaiveDate,
    now: DateTime<Utc>,
) -> Result<CompactionReport, StatsError> {
    if day >= now.date_naive() {
        return Err(StatsError::invalid(format!(
            "cannot compact {day}: only days before {} are final",
            now.date_naive()
        )));
    }

    let (start, end) = day_bounds(day)?;
    let wrap = |source| StatsError::Compaction { day, source };

    let tx = conn.transaction().map_err(wrap)?;
    let fact_count = count_facts(&tx, start, end).map_err(wrap)?;
    let daily_rows = upsert_daily(&tx, start, end).map_err(wrap)?;
    let hourly_rows = upsert_hourly(&tx, start, end).map_err(wrap)?;
    let report = CompactionReport {
        day,
        fact_count,
        daily_rows,
        hourly_rows,
    };
    record_watermark(&tx, &report, start, now).map_err(wrap)?;
    tx.commit().map_err(wrap)?;

    tracing::info!(
        day = %day,
        facts = fact_count,
        daily_rows,
        hourly_rows,
        "Compacted day"
    );
    Ok(report)
}

/// Half-open `[midnight, next midnight)` bounds of a UTC day.
fn day_bounds(day: NaiveDate) -> Result<(DateTime<Utc>, DateTime<Utc>), StatsError> {
    let next = day
        .checked_add_days(Days::new(1))
        .ok_or_else(|| StatsError::invalid(format!("{day} has no following day")))?;
    Ok((
        day.and_time(NaiveTime::MIN).and_utc(),
        next.and_time(NaiveTime::MIN).and_utc(),
    ))
}

fn count_facts(
    conn: &Connection,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<u64, duckdb::Error> {
    conn.prepare(
        "SELECT COUNT(*) FROM pageviews
         WHERE ts >= CAST(? AS TIMESTAMP) AND ts < CAST(? AS TIMESTAMP)",
    )?
    .query_row(params![bind_timestamp(start), bind_timestamp(end)], |row| {
        row.get(0)
    })
}

fn key_columns() -> String {
    Dimension::ALL
        .iter()
        .map(|d| d.fact_column())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Dimension ids with NULL (unresolved) folded to 0 so they can sit in the key.
fn coalesced_columns() -> String {
    Dimension::ALL
        .iter()
        .map(|d| format!("COALESCE(p.{0}, 0)", d.fact_column()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn upsert_daily(
    conn: &Connection,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<u64, duckdb::Error> {
    let keys = key_columns();
    let dims = coalesced_columns();
    let sql = format!(
        "INSERT INTO daily_pageviews (day, site_id, {keys}, count, unique_visitors, bounces)
         SELECT CAST(? AS TIMESTAMP), p.site_id, {dims},
                COUNT(*), COUNT(DISTINCT p.visitor_id),
                COUNT(*) FILTER (WHERE v.pv_count = 1)
         FROM pageviews p
         JOIN (
             SELECT site_id, visitor_id, COUNT(*) AS pv_count
             FROM pageviews
             WHERE ts >= CAST(? AS TIMESTAMP) AND ts < CAST(? AS TIMESTAMP)
             GROUP BY site_id, visitor_id
         ) v ON v.site_id = p.site_id AND v.visitor_id = p.visitor_id
         WHERE p.ts >= CAST(? AS TIMESTAMP) AND p.ts < CAST(? AS TIMESTAMP)
         GROUP BY p.site_id, {dims}
         ON CONFLICT (day, site_id, {keys}) DO UPDATE SET
             count = EXCLUDED.count,
             unique_visitors = EXCLUDED.unique_visitors,
             bounces = EXCLUDED.bounces"
    );
    let (start, end) = (bind_timestamp(start), bind_timestamp(end));
    let rows = conn.execute(&sql, params![start, start, end, start, end])?;
    Ok(rows as u64)
}

fn upsert_hourly(
    conn: &Connection,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<u64, duckdb::Error> {
    let keys = key_columns();
    let dims = coalesced_columns();
    let sql = format!(
        "INSERT INTO hourly_pageviews (hour, site_id, {keys}, count, unique_visitors, bounces)
         SELECT CAST(date_trunc('hour', p.ts) AS TIMESTAMP), p.site_id, {dims},
                COUNT(*), COUNT(DISTINCT p.visitor_id),
                COUNT(*) FILTER (WHERE v.pv_count = 1)
         FROM pageviews p
         JOIN (
             SELECT site_id, visitor_id, CAST(date_trunc('hour', ts) AS TIMESTAMP) AS hour,
                    COUNT(*) AS pv_count
             FROM pageviews
             WHERE ts >= CAST(? AS TIMESTAMP) AND ts < CAST(? AS TIMESTAMP)
             GROUP BY site_id, visitor_id, CAST(date_trunc('hour', ts) AS TIMESTAMP)
         ) v ON v.site_id = p.site_id
            AND v.visitor_id = p.visitor_id
            AND v.hour = CAST(date_trunc('hour', p.ts) AS TIMESTAMP)
         WHERE p.ts >= CAST(? AS TIMESTAMP) AND p.ts < CAST(? AS TIMESTAMP)
         GROUP BY CAST(date_trunc('hour', p.ts) AS TIMESTAMP), p.site_id, {dims}
         ON CONFLICT (hour, site_id, {keys}) DO UPDATE SET
             count = EXCLUDED.count,
             unique_visitors = EXCLUDED.unique_visitors,
             bounces = EXCLUDED.bounces"
    );
    let (start, end) = (bind_timestamp(start), bind_timestamp(end));
    let rows = conn.execute(&sql, params![start, end, start, end])?;
    Ok(rows as u64)
}

fn record_watermark(
    conn: &Connection,
    report: &CompactionReport,
    day_start: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<(), duckdb::Error> {
    conn.execute(
        "INSERT INTO compaction_watermarks (day, compacted_at, fact_count, daily_rows, hourly_rows)
         VALUES (CAST(? AS TIMESTAMP), CAST(? AS TIMESTAMP), ?, ?, ?)
         ON CONFLICT (day) DO UPDATE SET
             compacted_at = EXCLUDED.compacted_at,
             fact_count = EXCLUDED.fact_count,
             daily_rows = EXCLUDED.daily_rows,
             hourly_rows = EXCLUDED.hourly_rows",
        params![
            bind_timestamp(day_start),
            bind_timestamp(now),
            report.fact_count,
            report.daily_rows,
            report.hourly_rows,
        ],
    )?;
    Ok(())
}
