use crate::error::StatsError;
use crate::query::validate_range;
use crate::storage::{bind_timestamp, timestamp_column};
use chrono::{DateTime, Utc};
use duckdb::{params, Connection};
use serde::Serialize;

/// Upper bound on rows returned by any breakdown or listing.
pub const MAX_ROWS: usize = 1_000;

/// Label for facts whose dimension did not resolve.
const UNKNOWN: &str = "(unknown)";

/// Pageviews and distinct visitors for one path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageStats {
    pub path: String,
    pub count: u64,
    pub unique_visitors: u64,
}

/// Share of pageviews for one device class.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceStats {
    pub device_type: String,
    pub count: u64,
    pub percentage: f64,
}

/// One fact with its dimension names joined in. Unresolved names are `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageviewRecord {
    pub id: i64,
    pub ts: DateTime<Utc>,
    pub visitor_id: u32,
    pub path: Option<String>,
    pub referrer: Option<String>,
    pub country: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub browser: Option<String>,
    pub os: Option<String>,
    pub device_type: Option<String>,
    pub language: Option<String>,
}

fn clamp(limit: usize) -> i64 {
    i64::try_from(limit.min(MAX_ROWS)).unwrap_or(0)
}

/// Most viewed paths in `[start, end]`, by pageviews descending.
pub fn query_top_pages(
    conn: &Connection,
    site_id: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    limit: usize,
) -> Result<Vec<PageStats>, StatsError> {
    validate_range(start, end)?;
    let mut stmt = conn
        .prepare(
            "SELECT COALESCE(p.path, ?) AS page,
                    COUNT(*) AS count,
                    COUNT(DISTINCT f.visitor_id) AS unique_visitors
             FROM pageviews f
             LEFT JOIN paths p ON p.id = f.path_id
             WHERE f.site_id = ? AND f.ts >= CAST(? AS TIMESTAMP) AND f.ts <= CAST(? AS TIMESTAMP)
             GROUP BY page
             ORDER BY count DESC, page
             LIMIT ?",
        )
        .map_err(StatsError::Query)?;
    let rows = stmt
        .query_map(
            params![
                UNKNOWN,
                site_id,
                bind_timestamp(start),
                bind_timestamp(end),
                clamp(limit)
            ],
            |row| {
                Ok(PageStats {
                    path: row.get(0)?,
                    count: row.get(1)?,
                    unique_visitors: row.get(2)?,
                })
            },
        )
        .map_err(StatsError::Query)?;
    rows.collect::<Result<_, _>>().map_err(StatsError::Query)
}

/// Pageviews per device class with their share of all pageviews in range.
///
/// Empty when the range holds no pageviews.
#[allow(clippy::cast_precision_loss)]
pub fn query_device_usage(
    conn: &Connection,
    site_id: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<DeviceStats>, StatsError> {
    let total = count_pageviews(conn, site_id, start, end)?;
    if total == 0 {
        return Ok(Vec::new());
    }

    let mut stmt = conn
        .prepare(
            "SELECT COALESCE(d.name, ?) AS device, COUNT(*) AS count
             FROM pageviews f
             LEFT JOIN device_types d ON d.id = f.device_type_id
             WHERE f.site_id = ? AND f.ts >= CAST(? AS TIMESTAMP) AND f.ts <= CAST(? AS TIMESTAMP)
             GROUP BY device
             ORDER BY count DESC, device",
        )
        .map_err(StatsError::Query)?;
    let rows = stmt
        .query_map(
            params![UNKNOWN, site_id, bind_timestamp(start), bind_timestamp(end)],
            |row| {
                let count: u64 = row.get(1)?;
                Ok(DeviceStats {
                    device_type: row.get(0)?,
                    count,
                    percentage: count as f64 / total as f64 * 100.0,
                })
            },
        )
        .map_err(StatsError::Query)?;
    rows.collect::<Result<_, _>>().map_err(StatsError::Query)
}

/// Number of facts for `site_id` in `[start, end]`.
pub fn count_pageviews(
    conn: &Connection,
    site_id: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<u64, StatsError> {
    validate_range(start, end)?;
    conn.query_row(
        "SELECT COUNT(*) FROM pageviews
         WHERE site_id = ? AND ts >= CAST(? AS TIMESTAMP) AND ts <= CAST(? AS TIMESTAMP)",
        params![site_id, bind_timestamp(start), bind_timestamp(end)],
        |row| row.get(0),
    )
    .map_err(StatsError::Query)
}

/// One page of raw facts, newest first.
pub fn list_pageviews(
    conn: &Connection,
    site_id: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    limit: usize,
    offset: usize,
) -> Result<Vec<PageviewRecord>, StatsError> {
    validate_range(start, end)?;
    let offset = i64::try_from(offset)
        .map_err(|_| StatsError::invalid(format!("offset {offset} is out of range")))?;

    let mut stmt = conn
        .prepare(
            "SELECT f.id,
                    strftime(f.ts, '%Y-%m-%d %H:%M:%S.%f'),
                    f.visitor_id,
                    p.path, r.host, c.name, rg.name, ci.name,
                    b.name, o.name, d.name, l.code
             FROM pageviews f
             LEFT JOIN paths p ON p.id = f.path_id
             LEFT JOIN referrers r ON r.id = f.referrer_id
             LEFT JOIN countries c ON c.id = f.country_id
             LEFT JOIN regions rg ON rg.id = f.region_id
             LEFT JOIN cities ci ON ci.id = f.city_id
             LEFT JOIN browsers b ON b.id = f.browser_id
             LEFT JOIN operating_systems o ON o.id = f.os_id
             LEFT JOIN device_types d ON d.id = f.device_type_id
             LEFT JOIN languages l ON l.id = f.language_id
             WHERE f.site_id = ? AND f.ts >= CAST(? AS TIMESTAMP) AND f.ts <= CAST(? AS TIMESTAMP)
             ORDER BY f.ts DESC, f.id DESC
             LIMIT ? OFFSET ?",
        )
        .map_err(StatsError::Query)?;
    let rows = stmt
        .query_map(
            params![
                site_id,
                bind_timestamp(start),
                bind_timestamp(end),
                clamp(limit),
                offset
            ],
            |row| {
                Ok(PageviewRecord {
                    id: row.get(0)?,
                    ts: timestamp_column(row, 1)?,
                    visitor_id: row.get(2)?,
                    path: row.get(3)?,
                    referrer: row.get(4)?,
                    country: row.get(5)?,
                    region: row.get(6)?,
                    city: row.get(7)?,
                    browser: row.get(8)?,
                    os: row.get(9)?,
                    device_type: row.get(10)?,
                    language: row.get(11)?,
                })
            },
        )
        .map_err(StatsError::Query)?;
    rows.collect::<Result<_, _>>().map_err(StatsError::Query)
}
