use crate::api::errors::ApiError;
use crate::ingest::handler::{AppState, Counters};
use crate::query::breakdowns::{self, DeviceStats, PageStats, PageviewRecord};
use crate::query::granularity::Granularity;
use crate::query::summary::{self, AggregatedSummary};
use crate::query::timeseries::{self, AggregatedPoint};
use crate::rollup::compactor::{self, CompactionReport};
use crate::rollup::watermark::{self, CrossCheck, Watermark};
use axum::extract::{Query, State};
use axum::Json;
use chrono::{DateTime, Days, NaiveDate, NaiveTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Query parameters for stats endpoints.
#[derive(Debug, Deserialize)]
pub struct StatsParams {
    pub site_id: String,
    #[serde(default = "default_period")]
    pub period: String,
    /// RFC 3339 instant or `YYYY-MM-DD`; both bounds are inclusive.
    pub start: Option<String>,
    pub end: Option<String>,
    pub granularity: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

fn default_period() -> String {
    "30d".to_string()
}

/// Validate that a `site_id` parameter is safe for use in queries and storage.
///
/// - Must be non-empty and at most 256 bytes.
/// - Must contain only alphanumeric ASCII characters or `.`, `-`, `_`, `:`.
///
/// Used by both the stats API handlers and the ingest handler to ensure a
/// site accepted at ingestion is also queryable through the stats API.
pub fn validate_site_id(site_id: &str) -> Result<(), ApiError> {
    if site_id.is_empty() {
        return Err(ApiError::BadRequest(
            "site_id must not be empty".to_string(),
        ));
    }
    if site_id.len() > 256 {
        return Err(ApiError::BadRequest(
            "site_id must be at most 256 characters".to_string(),
        ));
    }
    let valid = site_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ':'));
    if !valid {
        return Err(ApiError::BadRequest(
            "site_id may only contain alphanumeric characters, '.', '-', '_', ':'".to_string(),
        ));
    }
    Ok(())
}

impl StatsParams {
    /// Resolve the inclusive `[start, end]` range from explicit bounds or the period.
    pub fn date_range(&self, now: DateTime<Utc>) -> Result<(DateTime<Utc>, DateTime<Utc>), ApiError> {
        if let (Some(start), Some(end)) = (&self.start, &self.end) {
            return Ok((parse_bound(start, false)?, parse_bound(end, true)?));
        }

        let today = now.date_naive();
        let back = match self.period.as_str() {
            "day" | "today" => 0,
            "7d" => 7,
            "30d" => 30,
            "90d" => 90,
            _ => {
                return Err(ApiError::BadRequest(format!(
                    "Invalid period: {}. Use 'day', '7d', '30d', '90d', or provide start and end.",
                    self.period
                )));
            }
        };
        let start = today
            .checked_sub_days(Days::new(back))
            .unwrap_or(NaiveDate::MIN)
            .and_time(NaiveTime::MIN)
            .and_utc();
        Ok((start, now))
    }

    /// Explicit granularity, else hourly for a single-day period and daily otherwise.
    pub fn granularity(&self) -> Result<Granularity, ApiError> {
        match self.granularity.as_deref() {
            Some(g) => Ok(g.parse()?),
            None if matches!(self.period.as_str(), "day" | "today") && self.start.is_none() => {
                Ok(Granularity::Hour)
            }
            None => Ok(Granularity::Day),
        }
    }
}

/// Parse a range bound. A bare date as the end bound covers that whole day.
fn parse_bound(raw: &str, is_end: bool) -> Result<DateTime<Utc>, ApiError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| ApiError::BadRequest(format!("Invalid date: {raw}")))?;
    let midnight = date.and_time(NaiveTime::MIN).and_utc();
    if is_end {
        Ok(midnight + TimeDelta::days(1) - TimeDelta::microseconds(1))
    } else {
        Ok(midnight)
    }
}

/// GET /api/stats/timeseries — Dense time-bucketed pageviews, visitors and bounce rate.
pub async fn get_timeseries(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StatsParams>,
) -> Result<Json<Vec<AggregatedPoint>>, ApiError> {
    validate_site_id(&params.site_id)?;
    let (start, end) = params.date_range(Utc::now())?;
    let granularity = params.granularity()?;

    let site_id = params.site_id.clone();
    let points = tokio::task::spawn_blocking(move || {
        let conn = state.conn.lock();
        timeseries::query_stats(&conn, &site_id, start, end, granularity)
    })
    .await
    .map_err(|e| ApiError::Internal(format!("Query task panicked: {e}")))??;

    Ok(Json(granularity.densify_range(&points, start, end)))
}

/// GET /api/stats/summary — Totals for the range.
pub async fn get_summary(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StatsParams>,
) -> Result<Json<AggregatedSummary>, ApiError> {
    validate_site_id(&params.site_id)?;
    let (start, end) = params.date_range(Utc::now())?;

    let site_id = params.site_id.clone();
    let result = tokio::task::spawn_blocking(move || {
        let conn = state.conn.lock();
        summary::query_summary(&conn, &site_id, start, end)
    })
    .await
    .map_err(|e| ApiError::Internal(format!("Query task panicked: {e}")))??;

    Ok(Json(result))
}

/// GET /api/stats/pages — Most viewed paths with distinct visitors.
pub async fn get_top_pages(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StatsParams>,
) -> Result<Json<Vec<PageStats>>, ApiError> {
    validate_site_id(&params.site_id)?;
    let (start, end) = params.date_range(Utc::now())?;
    let limit = params.limit.unwrap_or(10);

    let site_id = params.site_id.clone();
    let pages = tokio::task::spawn_blocking(move || {
        let conn = state.conn.lock();
        breakdowns::query_top_pages(&conn, &site_id, start, end, limit)
    })
    .await
    .map_err(|e| ApiError::Internal(format!("Query task panicked: {e}")))??;

    Ok(Json(pages))
}

/// GET /api/stats/devices — Pageview share per device class.
pub async fn get_device_usage(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StatsParams>,
) -> Result<Json<Vec<DeviceStats>>, ApiError> {
    validate_site_id(&params.site_id)?;
    let (start, end) = params.date_range(Utc::now())?;

    let site_id = params.site_id.clone();
    let devices = tokio::task::spawn_blocking(move || {
        let conn = state.conn.lock();
        breakdowns::query_device_usage(&conn, &site_id, start, end)
    })
    .await
    .map_err(|e| ApiError::Internal(format!("Query task panicked: {e}")))??;

    Ok(Json(devices))
}

/// A page of raw pageviews plus the total matching the range.
#[derive(Debug, Serialize)]
pub struct PageviewPage {
    pub total: u64,
    pub limit: usize,
    pub offset: usize,
    pub pageviews: Vec<PageviewRecord>,
}

/// GET /api/stats/pageviews — Raw pageviews, newest first, paginated by `limit`/`offset`.
pub async fn get_pageviews(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StatsParams>,
) -> Result<Json<PageviewPage>, ApiError> {
    validate_site_id(&params.site_id)?;
    let (start, end) = params.date_range(Utc::now())?;
    let limit = params.limit.unwrap_or(50).min(breakdowns::MAX_ROWS);
    let offset = params.offset.unwrap_or(0);

    let site_id = params.site_id.clone();
    let page = tokio::task::spawn_blocking(move || {
        let conn = state.conn.lock();
        let total = breakdowns::count_pageviews(&conn, &site_id, start, end)?;
        let pageviews = breakdowns::list_pageviews(&conn, &site_id, start, end, limit, offset)?;
        Ok::<_, crate::error::StatsError>(PageviewPage {
            total,
            limit,
            offset,
            pageviews,
        })
    })
    .await
    .map_err(|e| ApiError::Internal(format!("Query task panicked: {e}")))??;

    Ok(Json(page))
}

/// Query parameters for compaction endpoints.
#[derive(Debug, Deserialize)]
pub struct CompactParams {
    /// `YYYY-MM-DD`, UTC.
    pub day: String,
    pub site_id: Option<String>,
}

impl CompactParams {
    fn day(&self) -> Result<NaiveDate, ApiError> {
        NaiveDate::parse_from_str(&self.day, "%Y-%m-%d")
            .map_err(|_| ApiError::BadRequest(format!("Invalid day: {}", self.day)))
    }
}

/// POST /api/compact — Compact one past day on demand (backfill or repair).
pub async fn post_compact(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CompactParams>,
) -> Result<Json<CompactionReport>, ApiError> {
    let day = params.day()?;

    let worker = Arc::clone(&state);
    let result = tokio::task::spawn_blocking(move || {
        let mut conn = worker.conn.lock();
        compactor::compact_day(&mut conn, day)
    })
    .await
    .map_err(|e| ApiError::Internal(format!("Compaction task panicked: {e}")))?;

    match result {
        Ok(report) => {
            Counters::incr(&state.metrics.compactions);
            Ok(Json(report))
        }
        Err(e) => {
            if !e.is_invalid_input() {
                Counters::incr(&state.metrics.compaction_failures);
            }
            Err(e.into())
        }
    }
}

/// Watermark and, when a site is given, a fact/rollup cross-check for one day.
#[derive(Debug, Serialize)]
pub struct CompactionStatus {
    pub day: NaiveDate,
    pub watermark: Option<Watermark>,
    pub cross_check: Option<CrossCheck>,
}

/// GET /api/compact/status — Inspect the compaction state of one day.
pub async fn get_compact_status(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CompactParams>,
) -> Result<Json<CompactionStatus>, ApiError> {
    let day = params.day()?;
    if let Some(site_id) = &params.site_id {
        validate_site_id(site_id)?;
    }

    let site_id = params.site_id.clone();
    let status = tokio::task::spawn_blocking(move || {
        let conn = state.conn.lock();
        let mark = watermark::last_compacted(&conn, day)?;
        let check = site_id
            .map(|site| watermark::cross_check(&conn, &site, day))
            .transpose()?;
        Ok::<_, crate::error::StatsError>(CompactionStatus {
            day,
            watermark: mark,
            cross_check: check,
        })
    })
    .await
    .map_err(|e| ApiError::Internal(format!("Status task panicked: {e}")))??;

    Ok(Json(status))
}
