use crate::error::StatsError;
use crate::query::granularity::Granularity;
use crate::query::{bounce_rate, split_range, validate_range};
use crate::storage::{bind_timestamp, bucket_column};
use chrono::{DateTime, Utc};
use duckdb::{params, Connection};
use serde::{Deserialize, Serialize};

/// One bucket of the answer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AggregatedPoint {
    /// Bucket start.
    #[serde(rename = "timestamp")]
    pub time: DateTime<Utc>,
    #[serde(rename = "pageviews")]
    pub count: u64,
    pub unique_visitors: u64,
    pub bounce_rate: f64,
}

impl AggregatedPoint {
    pub const fn zero(time: DateTime<Utc>) -> Self {
        Self {
            time,
            count: 0,
            unique_visitors: 0,
            bounce_rate: 0.0,
        }
    }
}

/// Additive measures for one bucket, before the rate is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BucketTotals {
    time: DateTime<Utc>,
    count: u64,
    unique_visitors: u64,
    bounces: u64,
}

impl BucketTotals {
    fn into_point(self) -> AggregatedPoint {
        AggregatedPoint {
            time: self.time,
            count: self.count,
            unique_visitors: self.unique_visitors,
            bounce_rate: bounce_rate(self.bounces, self.unique_visitors),
        }
    }
}

/// Query bucketed stats for `site_id` over `[start, end]`.
pub fn query_stats(
    conn: &Connection,
    site_id: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    granularity: Granularity,
) -> Result<Vec<AggregatedPoint>, StatsError> {
    query_stats_at(conn, site_id, start, end, granularity, Utc::now())
}

/// [`query_stats`] with an explicit clock.
///
/// Day buckets before today's UTC midnight come from `daily_pageviews`, and
/// buckets from midnight on come from a live fact scan. Hour and month buckets
/// are always scanned from facts, so they match a fact-table aggregation exactly
/// whether or not the days were compacted.
pub fn query_stats_at(
    conn: &Connection,
    site_id: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    granularity: Granularity,
    now: DateTime<Utc>,
) -> Result<Vec<AggregatedPoint>, StatsError> {
    validate_range(start, end)?;
    granularity.check_bucket_count(start, end)?;

    let buckets = match granularity {
        Granularity::Day => {
            let split = split_range(start, end, now);
            let mut buckets = match split.historic {
                Some((from, to)) => historic_days(conn, site_id, from, to),
                None => Ok(Vec::new()),
            }
            .map_err(StatsError::Query)?;
            if let Some((from, to)) = split.live {
                buckets.extend(
                    live_buckets(conn, site_id, from, to, granularity).map_err(StatsError::Query)?,
                );
            }
            buckets
        }
        Granularity::Hour | Granularity::Month => {
            live_buckets(conn, site_id, start, end, granularity).map_err(StatsError::Query)?
        }
    };

    tracing::debug!(
        site_id,
        granularity = %granularity,
        buckets = buckets.len(),
        "Stats query"
    );
    Ok(buckets.into_iter().map(BucketTotals::into_point).collect())
}

fn historic_days(
    conn: &Connection,
    site_id: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<BucketTotals>, duckdb::Error> {
    // Rollup rows are keyed by day start, so align the lower bound to it
    let from = Granularity::Day.truncate(from);
    let mut stmt = conn.prepare(
        "SELECT strftime(day, '%Y-%m-%d %H:%M:%S') AS bucket,
                CAST(SUM(count) AS BIGINT),
                CAST(SUM(unique_visitors) AS BIGINT),
                CAST(SUM(bounces) AS BIGINT)
         FROM daily_pageviews
         WHERE site_id = ? AND day >= CAST(? AS TIMESTAMP) AND day <= CAST(? AS TIMESTAMP)
         GROUP BY bucket
         ORDER BY bucket",
    )?;
    let rows = stmt.query_map(
        params![site_id, bind_timestamp(from), bind_timestamp(to)],
        read_bucket,
    )?;
    rows.collect()
}

fn live_buckets(
    conn: &Connection,
    site_id: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    granularity: Granularity,
) -> Result<Vec<BucketTotals>, duckdb::Error> {
    let unit = granularity.trunc_unit();
    let sql = format!(
        "WITH per_visitor AS (
             SELECT CAST(date_trunc('{unit}', ts) AS TIMESTAMP) AS bucket,
                    visitor_id,
                    COUNT(*) AS pv_count
             FROM pageviews
             WHERE site_id = ? AND ts >= CAST(? AS TIMESTAMP) AND ts <= CAST(? AS TIMESTAMP)
             GROUP BY 1, 2
         )
         SELECT strftime(bucket, '%Y-%m-%d %H:%M:%S'),
                CAST(SUM(pv_count) AS BIGINT),
                COUNT(*),
                COUNT(*) FILTER (WHERE pv_count = 1)
         FROM per_visitor
         GROUP BY bucket
         ORDER BY bucket"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(
        params![site_id, bind_timestamp(from), bind_timestamp(to)],
        read_bucket,
    )?;
    rows.collect()
}

fn read_bucket(row: &duckdb::Row<'_>) -> Result<BucketTotals, duckdb::Error> {
    Ok(BucketTotals {
        time: bucket_column(row, 0)?,
        count: row.get(1)?,
        unique_visitors: row.get(2)?,
        bounces: row.get(3)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollup::compactor::compact_day_at;
    use chrono::{NaiveDate, TimeZone};

    fn setup_test_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        crate::storage::schema::init_schema(&conn).unwrap();
        conn
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 20, 12, 0, 0).unwrap()
    }

    fn at(m: u32, d: u32, h: u32) -> DateTime<Utc> {
        let y = if m == 12 { 2023 } else { 2024 };
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    fn insert_fact(conn: &Connection, ts: &str, visitor: u32) {
        insert_fact_on_path(conn, ts, visitor, 1);
    }

    fn insert_fact_on_path(conn: &Connection, ts: &str, visitor: u32, path: i64) {
        conn.execute(
            "INSERT INTO pageviews (ts, site_id, visitor_id, path_id)
             VALUES (CAST(? AS TIMESTAMP), 'example.com', ?, ?)",
            params![ts, i64::from(visitor), path],
        )
        .unwrap();
    }

    fn compact(conn: &mut Connection, m: u32, d: u32) {
        let y = if m == 12 { 2023 } else { 2024 };
        compact_day_at(conn, NaiveDate::from_ymd_opt(y, m, d).unwrap(), now()).unwrap();
    }

    /// Two compacted days plus live traffic today.
    fn seed(conn: &mut Connection) {
        insert_fact(conn, "2024-01-18 10:00:00", 1);
        insert_fact(conn, "2024-01-19 10:00:00", 1);
        insert_fact(conn, "2024-01-19 11:00:00", 2);
        insert_fact(conn, "2024-01-19 11:30:00", 2);
        insert_fact(conn, "2024-01-20 09:00:00", 3);
        insert_fact(conn, "2024-01-20 09:10:00", 3);
        insert_fact(conn, "2024-01-20 10:00:00", 4);
        compact(conn, 1, 18);
        compact(conn, 1, 19);
    }

    #[test]
    fn test_historic_range_reads_rollups() {
        let mut conn = setup_test_db();
        seed(&mut conn);

        let points = query_stats_at(
            &conn,
            "example.com",
            at(1, 18, 0),
            at(1, 19, 23),
            Granularity::Day,
            now(),
        )
        .unwrap();

        assert_eq!(points.len(), 2);
        assert_eq!(points[0].time, at(1, 18, 0));
        assert_eq!((points[0].count, points[0].unique_visitors), (1, 1));
        assert!((points[0].bounce_rate - 1.0).abs() < f64::EPSILON);
        assert_eq!(points[1].time, at(1, 19, 0));
        assert_eq!((points[1].count, points[1].unique_visitors), (3, 2));
        assert!((points[1].bounce_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_uncompacted_past_facts_are_not_served() {
        let mut conn = setup_test_db();
        seed(&mut conn);
        insert_fact(&conn, "2024-01-17 10:00:00", 9);

        let points = query_stats_at(
            &conn,
            "example.com",
            at(1, 17, 0),
            at(1, 17, 23),
            Granularity::Day,
            now(),
        )
        .unwrap();
        assert!(points.is_empty());
    }

    #[test]
    fn test_live_range_scans_facts() {
        let mut conn = setup_test_db();
        seed(&mut conn);

        let points = query_stats_at(
            &conn,
            "example.com",
            at(1, 20, 0),
            now(),
            Granularity::Hour,
            now(),
        )
        .unwrap();

        assert_eq!(points.len(), 2);
        assert_eq!(points[0].time, at(1, 20, 9));
        assert_eq!((points[0].count, points[0].unique_visitors), (2, 1));
        assert_eq!(points[0].bounce_rate, 0.0);
        assert_eq!(points[1].time, at(1, 20, 10));
        assert_eq!(points[1].bounce_rate, 1.0);
    }

    #[test]
    fn test_straddling_range_concatenates_in_order() {
        let mut conn = setup_test_db();
        seed(&mut conn);

        let points = query_stats_at(
            &conn,
            "example.com",
            at(1, 18, 0),
            now(),
            Granularity::Day,
            now(),
        )
        .unwrap();

        let times: Vec<_> = points.iter().map(|p| p.time).collect();
        assert_eq!(times, vec![at(1, 18, 0), at(1, 19, 0), at(1, 20, 0)]);
        assert!(times.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(points[2].count, 3);
        assert_eq!(points[2].unique_visitors, 2);
        assert!((points[2].bounce_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_hour_granularity_scans_facts_for_compacted_days() {
        let mut conn = setup_test_db();
        seed(&mut conn);
        // Same visitor, same hour, a second path: two rollup groups, one visitor
        insert_fact_on_path(&conn, "2024-01-19 10:05:00", 1, 2);
        compact(&mut conn, 1, 19);

        let points = query_stats_at(
            &conn,
            "example.com",
            at(1, 19, 0),
            at(1, 19, 23),
            Granularity::Hour,
            now(),
        )
        .unwrap();

        assert_eq!(points.len(), 2);
        assert_eq!(points[0].time, at(1, 19, 10));
        assert_eq!((points[0].count, points[0].unique_visitors), (2, 1));
        assert_eq!(points[0].bounce_rate, 0.0);
        assert_eq!(points[1].time, at(1, 19, 11));
        assert_eq!((points[1].count, points[1].unique_visitors), (2, 1));
    }

    #[test]
    fn test_hour_granularity_serves_uncompacted_past_facts() {
        let conn = setup_test_db();
        insert_fact(&conn, "2024-01-19 10:00:00", 1);

        let points = query_stats_at(
            &conn,
            "example.com",
            at(1, 19, 0),
            at(1, 19, 23),
            Granularity::Hour,
            now(),
        )
        .unwrap();

        assert_eq!(points.len(), 1);
        assert_eq!(points[0].time, at(1, 19, 10));
        assert_eq!(points[0].count, 1);
    }

    #[test]
    fn test_month_bucket_counts_distinct_visitors_across_days() {
        let mut conn = setup_test_db();
        seed(&mut conn);
        insert_fact(&conn, "2023-12-31 22:00:00", 5);
        compact(&mut conn, 12, 31);

        let points = query_stats_at(
            &conn,
            "example.com",
            at(12, 1, 0),
            now(),
            Granularity::Month,
            now(),
        )
        .unwrap();

        assert_eq!(points.len(), 2);
        assert_eq!(points[0].time, at(12, 1, 0));
        assert_eq!((points[0].count, points[0].unique_visitors), (1, 1));
        // Visitor 1 viewed on the 18th and the 19th: one visitor, not a bounce
        assert_eq!(points[1].time, at(1, 1, 0));
        assert_eq!((points[1].count, points[1].unique_visitors), (7, 4));
        assert!((points[1].bounce_rate - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_oversized_bucket_range_is_invalid() {
        let conn = Connection::open_in_memory().unwrap(); // no schema
        let start = Utc.with_ymd_and_hms(1, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(9999, 12, 31, 0, 0, 0).unwrap();
        let err = query_stats_at(&conn, "example.com", start, end, Granularity::Hour, now())
            .unwrap_err();
        assert!(err.is_invalid_input());
    }

    #[test]
    fn test_other_sites_are_excluded() {
        let mut conn = setup_test_db();
        seed(&mut conn);
        let points = query_stats_at(
            &conn,
            "other.org",
            at(1, 18, 0),
            now(),
            Granularity::Day,
            now(),
        )
        .unwrap();
        assert!(points.is_empty());
    }

    #[test]
    fn test_inverted_range_rejected_before_store_access() {
        let conn = Connection::open_in_memory().unwrap(); // no schema
        let err = query_stats_at(
            &conn,
            "example.com",
            at(1, 19, 0),
            at(1, 18, 0),
            Granularity::Day,
            now(),
        )
        .unwrap_err();
        assert!(err.is_invalid_input());
    }

    #[test]
    fn test_store_failure_aborts_query() {
        let conn = Connection::open_in_memory().unwrap();
        let err = query_stats_at(
            &conn,
            "example.com",
            at(1, 18, 0),
            now(),
            Granularity::Day,
            now(),
        )
        .unwrap_err();
        assert!(matches!(err, StatsError::Query(_)));
    }

    #[test]
    fn test_point_json_field_names() {
        let json = serde_json::to_value(AggregatedPoint::zero(at(1, 1, 0))).unwrap();
        assert!(json.get("timestamp").is_some());
        assert_eq!(json["pageviews"], 0);
        assert_eq!(json["unique_visitors"], 0);
        assert_eq!(json["bounce_rate"], 0.0);
    }
}
