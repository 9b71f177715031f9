use crate::error::StatsError;
use crate::ingest::handler::{AppState, Counters};
use crate::rollup::compactor::{compact_day_at, CompactionReport};
use crate::rollup::watermark::stale_days;
use chrono::{DateTime, Days, NaiveDate, NaiveTime, Utc};
use duckdb::Connection;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Outcome of one scheduled pass.
#[derive(Debug, Default)]
pub struct PassSummary {
    pub compacted: Vec<CompactionReport>,
    pub failed: Vec<(NaiveDate, StatsError)>,
}

/// Next trigger instant strictly after `now`.
pub fn next_run_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
    let today = now.date_naive().and_time(NaiveTime::MIN).and_utc() + delay;
    if today > now {
        today
    } else {
        now.date_naive()
            .checked_add_days(Days::new(1))
            .map_or(today, |d| d.and_time(NaiveTime::MIN).and_utc() + delay)
    }
}

/// Compact yesterday, then every stale day within `lookback_days`.
///
/// The connection lock is taken per day so ingest can interleave with a
/// long pass. One failed day does not stop the rest.
pub fn run_pass(conn: &Mutex<Connection>, now: DateTime<Utc>, lookback_days: u32) -> PassSummary {
    let mut days: Vec<NaiveDate> = now.date_naive().pred_opt().into_iter().collect();

    let stale = stale_days(&conn.lock(), now, lookback_days);
    match stale {
        Ok(stale) => {
            let extra: Vec<_> = stale.into_iter().filter(|d| !days.contains(d)).collect();
            days.extend(extra);
        }
        Err(e) => tracing::error!(error = %e, "Stale-day scan failed"),
    }

    compact_each(conn, &days, now, "Compaction failed")
}

/// Repair-only pass: re-compact stale days without forcing yesterday.
pub fn run_repair(conn: &Mutex<Connection>, now: DateTime<Utc>, lookback_days: u32) -> PassSummary {
    let stale = stale_days(&conn.lock(), now, lookback_days);
    match stale {
        Ok(stale) => compact_each(conn, &stale, now, "Repair compaction failed"),
        Err(e) => {
            tracing::error!(error = %e, "Stale-day scan failed");
            PassSummary::default()
        }
    }
}

fn compact_each(
    conn: &Mutex<Connection>,
    days: &[NaiveDate],
    now: DateTime<Utc>,
    failure: &'static str,
) -> PassSummary {
    let mut summary = PassSummary::default();
    for &day in days {
        let outcome = {
            let mut guard = conn.lock();
            compact_day_at(&mut guard, day, now)
        };
        match outcome {
            Ok(report) => summary.compacted.push(report),
            Err(e) => {
                tracing::error!(day = %day, error = %e, "{failure}");
                summary.failed.push((day, e));
            }
        }
    }
    summary
}

/// Background loop driving compaction for the life of the process.
///
/// Runs a repair pass at startup so a process that was down over midnight
/// catches up, then sleeps until `00:00 UTC + delay` before each daily pass.
pub async fn run_compaction_loop(state: Arc<AppState>, delay: Duration, lookback_days: u32) {
    let startup = Arc::clone(&state);
    let repaired =
        tokio::task::spawn_blocking(move || run_repair(&startup.conn, Utc::now(), lookback_days))
    .await;
    match repaired {
        Ok(summary) => record(&state, &summary, "Startup repair pass finished"),
        Err(e) => tracing::error!(error = %e, "Startup repair task panicked"),
    }

    loop {
        let now = Utc::now();
        let next = next_run_after(now, delay);
        let wait = (next - now).to_std().unwrap_or(Duration::from_secs(1));
        tracing::debug!(next = %next, "Next compaction scheduled");
        tokio::time::sleep(wait).await;

        let worker = Arc::clone(&state);
        let result =
            tokio::task::spawn_blocking(move || run_pass(&worker.conn, Utc::now(), lookback_days))
                .await;
        match result {
            Ok(summary) => record(&state, &summary, "Scheduled compaction pass finished"),
            Err(e) => tracing::error!(error = %e, "Compaction task panicked"),
        }
    }
}

fn record(state: &AppState, summary: &PassSummary, message: &'static str) {
    for _ in &summary.compacted {
        Counters::incr(&state.metrics.compactions);
    }
    for _ in &summary.failed {
        Counters::incr(&state.metrics.compaction_failures);
    }
    tracing::info!(
        compacted = summary.compacted.len(),
        failed = summary.failed.len(),
        "{message}"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use duckdb::params;

    fn setup_test_db() -> Mutex<Connection> {
        let conn = Connection::open_in_memory().unwrap();
        crate::storage::schema::init_schema(&conn).unwrap();
        Mutex::new(conn)
    }

    fn at(d: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, h, m, 0).unwrap()
    }

    fn insert_fact(conn: &Mutex<Connection>, ts: &str) {
        insert_fact_locked(&conn.lock(), ts);
    }

    fn insert_fact_locked(conn: &Connection, ts: &str) {
        conn.execute(
            "INSERT INTO pageviews (ts, site_id, visitor_id, path_id)
             VALUES (CAST(? AS TIMESTAMP), 'example.com', 1, 1)",
            params![ts],
        )
        .unwrap();
    }

    #[test]
    fn test_next_run_later_today() {
        let next = next_run_after(at(20, 0, 1), Duration::from_secs(120));
        assert_eq!(next, at(20, 0, 2));
    }

    #[test]
    fn test_next_run_tomorrow() {
        let next = next_run_after(at(20, 13, 0), Duration::from_secs(120));
        assert_eq!(next, at(21, 0, 2));
        // Exactly at the trigger instant moves to the next day
        assert_eq!(next_run_after(at(20, 0, 2), Duration::from_secs(120)), at(21, 0, 2));
    }

    #[test]
    fn test_pass_compacts_yesterday_and_stale_days() {
        let conn = setup_test_db();
        insert_fact(&conn, "2024-01-16 10:00:00");
        insert_fact(&conn, "2024-01-19 10:00:00");

        let summary = run_pass(&conn, at(20, 0, 2), 7);
        let days: Vec<_> = summary.compacted.iter().map(|r| r.day).collect();
        assert_eq!(
            days,
            vec![
                NaiveDate::from_ymd_opt(2024, 1, 19).unwrap(),
                NaiveDate::from_ymd_opt(2024, 1, 16).unwrap(),
            ]
        );
        assert!(summary.failed.is_empty());
        assert!(stale_days(&conn.lock(), at(20, 0, 2), 7).unwrap().is_empty());
    }

    #[test]
    fn test_pass_compacts_empty_yesterday() {
        let conn = setup_test_db();
        let summary = run_pass(&conn, at(20, 0, 2), 7);
        assert_eq!(summary.compacted.len(), 1);
        assert_eq!(summary.compacted[0].fact_count, 0);
    }

    #[test]
    fn test_repair_only_touches_stale_days() {
        let conn = setup_test_db();
        insert_fact(&conn, "2024-01-16 10:00:00");
        let summary = run_repair(&conn, at(20, 9, 0), 7);
        assert_eq!(summary.compacted.len(), 1);

        let again = run_repair(&conn, at(20, 9, 0), 7);
        assert!(again.compacted.is_empty());
    }

    #[test]
    fn test_pass_releases_lock_between_days() {
        let conn = std::sync::Arc::new(setup_test_db());
        for day in 10..=19 {
            insert_fact(&conn, &format!("2024-01-{day} 10:00:00"));
        }

        let worker = std::sync::Arc::clone(&conn);
        let pass = std::thread::spawn(move || run_pass(&worker, at(20, 0, 2), 14));

        // Writers acquire the lock while the pass is still running
        let mut starved = 0;
        while !pass.is_finished() {
            match conn.try_lock_for(Duration::from_secs(5)) {
                Some(guard) => insert_fact_locked(&guard, "2024-01-20 01:00:00"),
                None => starved += 1,
            }
            std::thread::yield_now();
        }
        let summary = pass.join().unwrap();

        assert_eq!(summary.compacted.len(), 10);
        assert!(summary.failed.is_empty());
        assert_eq!(starved, 0);
        assert!(stale_days(&conn.lock(), at(20, 0, 2), 14).unwrap().is_empty());
    }

    #[test]
    fn test_failures_are_collected() {
        let conn = setup_test_db();
        conn.lock().execute_batch("DROP TABLE daily_pageviews").unwrap();
        let summary = run_pass(&conn, at(20, 0, 2), 7);
        assert!(summary.compacted.is_empty());
        assert_eq!(summary.failed.len(), 1);
    }
}
