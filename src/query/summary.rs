use crate::error::StatsError;
use crate::query::granularity::Granularity;
use crate::query::{bounce_rate, split_range, validate_range};
use crate::storage::bind_timestamp;
use chrono::{DateTime, Utc};
use duckdb::{params, Connection};
use serde::{Deserialize, Serialize};

/// Totals for a whole date range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AggregatedSummary {
    pub total_pageviews: u64,
    pub unique_visitors: u64,
    pub bounce_rate: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Totals {
    pageviews: u64,
    unique_visitors: u64,
    bounces: u64,
}

/// Summarize `site_id` over `[start, end]` using the wall clock for the split.
pub fn query_summary(
    conn: &Connection,
    site_id: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<AggregatedSummary, StatsError> {
    query_summary_at(conn, site_id, start, end, Utc::now())
}

/// [`query_summary`] with an explicit clock.
///
/// Historic and live totals are added together; unique visitors are summed
/// across days, not deduplicated.
pub fn query_summary_at(
    conn: &Connection,
    site_id: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<AggregatedSummary, StatsError> {
    validate_range(start, end)?;
    let split = split_range(start, end, now);

    let historic = match split.historic {
        Some((from, to)) => historic_totals(conn, site_id, from, to).map_err(StatsError::Query)?,
        None => Totals::default(),
    };
    let live = match split.live {
        Some((from, to)) => live_totals(conn, site_id, from, to).map_err(StatsError::Query)?,
        None => Totals::default(),
    };

    let unique_visitors = historic.unique_visitors + live.unique_visitors;
    Ok(AggregatedSummary {
        total_pageviews: historic.pageviews + live.pageviews,
        unique_visitors,
        bounce_rate: bounce_rate(historic.bounces + live.bounces, unique_visitors),
    })
}

fn historic_totals(
    conn: &Connection,
    site_id: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Totals, duckdb::Error> {
    let mut stmt = conn.prepare(
        "SELECT CAST(COALESCE(SUM(count), 0) AS BIGINT),
                CAST(COALESCE(SUM(unique_visitors), 0) AS BIGINT),
                CAST(COALESCE(SUM(bounces), 0) AS BIGINT)
         FROM daily_pageviews
         WHERE site_id = ? AND day >= CAST(? AS TIMESTAMP) AND day <= CAST(? AS TIMESTAMP)",
    )?;
    stmt.query_row(
        params![
            site_id,
            bind_timestamp(Granularity::Day.truncate(from)),
            bind_timestamp(to)
        ],
        read_totals,
    )
}

fn live_totals(
    conn: &Connection,
    site_id: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Totals, duckdb::Error> {
    let mut stmt = conn.prepare(
        "WITH per_visitor AS (
             SELECT visitor_id, COUNT(*) AS pv_count
             FROM pageviews
             WHERE site_id = ? AND ts >= CAST(? AS TIMESTAMP) AND ts <= CAST(? AS TIMESTAMP)
             GROUP BY visitor_id
         )
         SELECT CAST(COALESCE(SUM(pv_count), 0) AS BIGINT),
                COUNT(*),
                COUNT(*) FILTER (WHERE pv_count = 1)
         FROM per_visitor",
    )?;
    stmt.query_row(
        params![site_id, bind_timestamp(from), bind_timestamp(to)],
        read_totals,
    )
}

fn read_totals(row: &duckdb::Row<'_>) -> Result<Totals, duckdb::Error> {
    Ok(Totals {
        pageviews: row.get(0)?,
        unique_visitors: row.get(1)?,
        bounces: row.get(2)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn setup_test_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        crate::storage::schema::init_schema(&conn).unwrap();
        conn
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 20, 12, 0, 0).unwrap()
    }

    fn insert_rollup(conn: &Connection, day: &str, count: i64, unique: i64, bounces: i64) {
        conn.execute(
            "INSERT INTO daily_pageviews
             VALUES (CAST(? AS TIMESTAMP), 'example.com', 0, 0, 0, 0, 0, 0, 0, 0, 1, ?, ?, ?)",
            params![day, count, unique, bounces],
        )
        .unwrap();
    }

    fn insert_fact(conn: &Connection, ts: &str, visitor: u32) {
        conn.execute(
            "INSERT INTO pageviews (ts, site_id, visitor_id, path_id)
             VALUES (CAST(? AS TIMESTAMP), 'example.com', ?, 1)",
            params![ts, i64::from(visitor)],
        )
        .unwrap();
    }

    #[test]
    fn test_rollup_plus_live_totals() {
        let conn = setup_test_db();
        insert_rollup(&conn, "2024-01-19 00:00:00", 100, 50, 10);
        insert_fact(&conn, "2024-01-20 08:00:00", 1);
        insert_fact(&conn, "2024-01-20 09:00:00", 1);
        insert_fact(&conn, "2024-01-20 10:00:00", 2);

        let yesterday = Utc.with_ymd_and_hms(2024, 1, 19, 0, 0, 0).unwrap();
        let summary = query_summary_at(&conn, "example.com", yesterday, now(), now()).unwrap();

        assert_eq!(summary.total_pageviews, 103);
        assert_eq!(summary.unique_visitors, 52);
        assert!((summary.bounce_rate - 11.0 / 52.0).abs() < 1e-9);
    }

    #[test]
    fn test_start_mid_day_still_counts_that_days_rollup() {
        let conn = setup_test_db();
        insert_rollup(&conn, "2024-01-19 00:00:00", 100, 50, 10);
        let start = Utc.with_ymd_and_hms(2024, 1, 19, 12, 0, 0).unwrap();
        let summary = query_summary_at(&conn, "example.com", start, now(), now()).unwrap();
        assert_eq!(summary.total_pageviews, 100);
    }

    #[test]
    fn test_historic_only_ignores_raw_facts() {
        let conn = setup_test_db();
        insert_rollup(&conn, "2024-01-18 00:00:00", 10, 5, 5);
        insert_fact(&conn, "2024-01-18 08:00:00", 1);

        let start = Utc.with_ymd_and_hms(2024, 1, 18, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 18, 23, 59, 59).unwrap();
        let summary = query_summary_at(&conn, "example.com", start, end, now()).unwrap();

        assert_eq!(summary.total_pageviews, 10);
        assert!((summary.bounce_rate - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_range_has_zero_rate() {
        let conn = setup_test_db();
        let summary =
            query_summary_at(&conn, "example.com", now() - chrono::Days::new(3), now(), now())
                .unwrap();
        assert_eq!(summary.total_pageviews, 0);
        assert_eq!(summary.unique_visitors, 0);
        assert_eq!(summary.bounce_rate, 0.0);
    }

    #[test]
    fn test_inverted_range_is_invalid() {
        let conn = setup_test_db();
        let err = query_summary_at(&conn, "example.com", now(), now() - chrono::Days::new(1), now())
            .unwrap_err();
        assert!(err.is_invalid_input());
    }

    #[test]
    fn test_summary_json_field_names() {
        let json = serde_json::to_value(AggregatedSummary {
            total_pageviews: 1,
            unique_visitors: 1,
            bounce_rate: 1.0,
        })
        .unwrap();
        assert_eq!(json["total_pageviews"], 1);
        assert_eq!(json["unique_visitors"], 1);
        assert_eq!(json["bounce_rate"], 1.0);
    }
}
