use crate::api::errors::ApiError;
use crate::api::stats::validate_site_id;
use crate::ingest::enrich::Enricher;
use crate::ingest::fingerprint::fingerprint;
use crate::ingest::writer::{self, PageviewEvent, UnresolvedPolicy};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use duckdb::Connection;
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Inbound pageview payload from the tracking script.
#[derive(Debug, Deserialize)]
pub struct EventPayload {
    /// Site identity (e.g., "example.com")
    #[serde(rename = "d")]
    pub site_id: String,
    /// Page URL
    #[serde(rename = "u")]
    pub url: String,
    /// Referrer URL
    #[serde(rename = "r")]
    pub referrer: Option<String>,
}

/// Shared application state for all handlers.
pub struct AppState {
    pub conn: Arc<Mutex<Connection>>,
    pub enricher: Arc<dyn Enricher>,
    /// Sites accepted at ingestion. Empty means any site.
    pub allowed_sites: Vec<String>,
    pub policy: UnresolvedPolicy,
    pub geoip_loaded: bool,
    pub metrics: Counters,
}

impl AppState {
    pub fn new(conn: Arc<Mutex<Connection>>, enricher: Arc<dyn Enricher>) -> Self {
        Self {
            conn,
            enricher,
            allowed_sites: Vec::new(),
            policy: UnresolvedPolicy::default(),
            geoip_loaded: false,
            metrics: Counters::default(),
        }
    }

    fn accepts_site(&self, site_id: &str) -> bool {
        self.allowed_sites.is_empty() || self.allowed_sites.iter().any(|s| s == site_id)
    }
}

/// Process-lifetime counters exported on `/metrics`.
#[derive(Debug, Default)]
pub struct Counters {
    pub events_recorded: AtomicU64,
    pub events_partial: AtomicU64,
    pub events_rejected: AtomicU64,
    pub compactions: AtomicU64,
    pub compaction_failures: AtomicU64,
}

impl Counters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// POST /api/event — Ingestion endpoint.
///
/// Fingerprints the client, enriches the request and writes one fact row
/// synchronously. The client IP and User-Agent are discarded afterwards.
pub async fn ingest_event(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<EventPayload>,
) -> Result<StatusCode, ApiError> {
    if payload.site_id.is_empty() || payload.url.is_empty() {
        return Err(ApiError::BadRequest("d and u are required".to_string()));
    }
    if payload.url.len() > 2048 || payload.referrer.as_ref().is_some_and(|r| r.len() > 2048) {
        return Err(ApiError::BadRequest("payload field too long".to_string()));
    }
    validate_site_id(&payload.site_id)?;
    if !state.accepts_site(&payload.site_id) {
        return Err(ApiError::NotFound(format!("unknown site {}", payload.site_id)));
    }

    let ip = extract_ip(&headers);
    let user_agent = header_str(&headers, "user-agent").unwrap_or("");
    let attrs = state
        .enricher
        .enrich(&ip, user_agent)
        .with_language(header_str(&headers, "accept-language"));

    let event = PageviewEvent {
        site_id: payload.site_id,
        path: sanitize_pathname(&payload.url),
        referrer: payload
            .referrer
            .as_deref()
            .map(|r| sanitize_string(r, 2048))
            .filter(|r| !r.is_empty()),
        timestamp: None,
        fingerprint: fingerprint(&ip, user_agent),
    };

    let state2 = Arc::clone(&state);
    let result = tokio::task::spawn_blocking(move || {
        let conn = state2.conn.lock();
        writer::record(&conn, &event, &attrs, state2.policy)
    })
    .await
    .map_err(|e| ApiError::Internal(format!("Ingest task panicked: {e}")))?;

    match result {
        Ok(outcome) => {
            Counters::incr(&state.metrics.events_recorded);
            if !outcome.is_complete() {
                Counters::incr(&state.metrics.events_partial);
            }
            Ok(StatusCode::ACCEPTED)
        }
        Err(e) => {
            Counters::incr(&state.metrics.events_rejected);
            Err(e.into())
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Extract client IP from headers, checking X-Forwarded-For first.
fn extract_ip(headers: &HeaderMap) -> String {
    header_str(headers, "x-forwarded-for")
        .and_then(|s| s.split(',').next())
        .map(str::trim)
        .or_else(|| header_str(headers, "x-real-ip"))
        .unwrap_or("unknown")
        .to_string()
}

/// Extract pathname from URL, stripping scheme, host, query string and fragment.
fn sanitize_pathname(url: &str) -> String {
    let path = match url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
    {
        Some(rest) => rest.find('/').map_or("/", |pos| &rest[pos..]),
        None => url,
    };

    let path = path.split('?').next().unwrap_or(path);
    let path = path.split('#').next().unwrap_or(path);
    let path = if path.is_empty() { "/" } else { path };

    sanitize_string(path, 2048)
}

/// Sanitize a string by truncating to max length and removing control characters.
fn sanitize_string(input: &str, max_len: usize) -> String {
    input
        .chars()
        .filter(|c| !c.is_control())
        .take(max_len)
        .collect()
}
