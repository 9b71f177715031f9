use crate::api::stats;
use crate::ingest::handler::{ingest_event, AppState};
use crate::ingest::writer::UnresolvedPolicy;
use axum::extract::DefaultBodyLimit;
use axum::extract::State;
use axum::http::{header, HeaderValue, Method};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

/// Build the Axum router with all routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    // Permissive CORS for ingestion (tracking script runs on any origin)
    let ingestion_cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::POST])
        .allow_headers([header::CONTENT_TYPE]);

    let stats_cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET]);

    // Ingestion with a 16 KB body limit (max valid event ~4 KB)
    let ingestion_routes = Router::new()
        .route("/event", post(ingest_event))
        .layer(DefaultBodyLimit::max(16_384))
        .layer(ingestion_cors);

    let stats_routes = Router::new()
        .route("/stats/timeseries", get(stats::get_timeseries))
        .route("/stats/summary", get(stats::get_summary))
        .route("/stats/pages", get(stats::get_top_pages))
        .route("/stats/devices", get(stats::get_device_usage))
        .route("/stats/pageviews", get(stats::get_pageviews))
        .layer(stats_cors);

    let admin_routes = Router::new()
        .route("/compact", post(stats::post_compact))
        .route("/compact/status", get(stats::get_compact_status));

    let api_routes = Router::new()
        .merge(ingestion_routes)
        .merge(stats_routes)
        .merge(admin_routes);

    Router::new()
        .route("/health", get(health_check))
        .route("/health/detailed", get(detailed_health_check))
        .route("/metrics", get(prometheus_metrics))
        .nest("/api", api_routes)
        .layer(axum::middleware::map_response(add_security_headers))
        .layer(TimeoutLayer::with_status_code(
            axum::http::StatusCode::REQUEST_TIMEOUT,
            std::time::Duration::from_secs(30),
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Inject baseline security headers on every HTTP response.
async fn add_security_headers(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        "referrer-policy",
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    response
}

/// GET /health — Simple health check endpoint.
async fn health_check() -> &'static str {
    "ok"
}

/// GET /health/detailed — Detailed health check with runtime info.
async fn detailed_health_check(
    State(state): State<Arc<AppState>>,
) -> axum::Json<serde_json::Value> {
    let counters = &state.metrics;
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "geoip_loaded": state.geoip_loaded,
        "reject_unresolved": state.policy == UnresolvedPolicy::Reject,
        "allowed_sites": state.allowed_sites.len(),
        "events_recorded": counters.events_recorded.load(Ordering::Relaxed),
        "compactions": counters.compactions.load(Ordering::Relaxed),
        "compaction_failures": counters.compaction_failures.load(Ordering::Relaxed),
    }))
}

/// GET /metrics — Prometheus-compatible metrics endpoint.
async fn prometheus_metrics(
    State(state): State<Arc<AppState>>,
) -> ([(header::HeaderName, &'static str); 1], String) {
    use std::fmt::Write;

    let counters = &state.metrics;
    let series: [(&str, &str, &str, u64); 6] = [
        (
            "tidemark_events_recorded_total",
            "counter",
            "Pageview facts written since startup",
            counters.events_recorded.load(Ordering::Relaxed),
        ),
        (
            "tidemark_events_partial_total",
            "counter",
            "Facts written with at least one unresolved dimension",
            counters.events_partial.load(Ordering::Relaxed),
        ),
        (
            "tidemark_events_rejected_total",
            "counter",
            "Events that failed to record",
            counters.events_rejected.load(Ordering::Relaxed),
        ),
        (
            "tidemark_compactions_total",
            "counter",
            "Successful day compactions since startup",
            counters.compactions.load(Ordering::Relaxed),
        ),
        (
            "tidemark_compaction_failures_total",
            "counter",
            "Failed day compactions since startup",
            counters.compaction_failures.load(Ordering::Relaxed),
        ),
        (
            "tidemark_geoip_loaded",
            "gauge",
            "Whether a GeoIP database is loaded",
            u64::from(state.geoip_loaded),
        ),
    ];

    let mut out = String::with_capacity(1024);
    for (name, kind, help, value) in series {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} {kind}");
        let _ = writeln!(out, "{name} {value}");
    }

    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::enrich::StandardEnricher;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use duckdb::Connection;
    use http_body_util::BodyExt;
    use parking_lot::Mutex;
    use tower::ServiceExt;

    fn make_test_state() -> Arc<AppState> {
        let conn = Connection::open_in_memory().unwrap();
        crate::storage::migrations::run_migrations(&conn).unwrap();
        Arc::new(AppState::new(
            Arc::new(Mutex::new(conn)),
            Arc::new(StandardEnricher::new(None)),
        ))
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, body.to_vec())
    }

    fn post_event(payload: &serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/event")
            .header("content-type", "application/json")
            .header("user-agent", "Mozilla/5.0 (X11; Linux x86_64) Firefox/121.0")
            .header("x-forwarded-for", "203.0.113.7")
            .body(Body::from(serde_json::to_string(payload).unwrap()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = build_router(make_test_state());
        let (status, body) = send(
            app,
            Request::builder().uri("/health").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_prometheus_metrics() {
        let state = make_test_state();
        let app = build_router(Arc::clone(&state));

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap();
        assert!(content_type.contains("text/plain"));
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = std::str::from_utf8(&body).unwrap();
        assert!(text.contains("# TYPE tidemark_events_recorded_total counter"));
        assert!(text.contains("tidemark_events_recorded_total 0"));
        assert!(text.contains("tidemark_geoip_loaded 0"));
    }

    #[tokio::test]
    async fn test_ingest_event() {
        let state = make_test_state();
        let app = build_router(Arc::clone(&state));
        let payload = serde_json::json!({
            "d": "example.com",
            "u": "https://example.com/pricing?plan=pro",
            "r": "https://news.ycombinator.com/",
        });

        let (status, _) = send(app, post_event(&payload)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(state.metrics.events_recorded.load(Ordering::Relaxed), 1);

        let conn = state.conn.lock();
        let path: String = conn
            .prepare("SELECT p.path FROM pageviews f JOIN paths p ON p.id = f.path_id")
            .unwrap()
            .query_row([], |row| row.get(0))
            .unwrap();
        assert_eq!(path, "/pricing");
    }

    #[tokio::test]
    async fn test_ingest_event_invalid_payload() {
        let app = build_router(make_test_state());
        let request = Request::builder()
            .method("POST")
            .uri("/api/event")
            .header("content-type", "application/json")
            .body(Body::from("{}"))
            .unwrap();

        // Missing required fields are rejected by the Json extractor
        let (status, _) = send(app, request).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_ingest_event_empty_fields() {
        let app = build_router(make_test_state());
        let payload = serde_json::json!({ "d": "", "u": "https://example.com/" });
        let (status, _) = send(app, post_event(&payload)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_ingest_unknown_site() {
        let conn = Connection::open_in_memory().unwrap();
        crate::storage::migrations::run_migrations(&conn).unwrap();
        let mut state = AppState::new(
            Arc::new(Mutex::new(conn)),
            Arc::new(StandardEnricher::new(None)),
        );
        state.allowed_sites = vec!["example.com".to_string()];
        let app = build_router(Arc::new(state));

        let payload = serde_json::json!({ "d": "other.org", "u": "/" });
        let (status, _) = send(app, post_event(&payload)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_summary_empty() {
        let app = build_router(make_test_state());
        let (status, body) = send(
            app,
            Request::builder()
                .uri("/api/stats/summary?site_id=example.com&period=7d")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["total_pageviews"], 0);
        assert_eq!(json["bounce_rate"], 0.0);
    }

    #[tokio::test]
    async fn test_timeseries_is_dense() {
        let app = build_router(make_test_state());
        let (status, body) = send(
            app,
            Request::builder()
                .uri("/api/stats/timeseries?site_id=example.com&start=2024-01-01&end=2024-01-03")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let points = json.as_array().unwrap();
        assert_eq!(points.len(), 3);
        assert!(points.iter().all(|p| p["pageviews"] == 0));
    }

    #[tokio::test]
    async fn test_timeseries_bad_granularity() {
        let app = build_router(make_test_state());
        let (status, _) = send(
            app,
            Request::builder()
                .uri("/api/stats/timeseries?site_id=example.com&granularity=week")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_timeseries_rejects_unbounded_hourly_range() {
        let app = build_router(make_test_state());
        let (status, body) = send(
            app,
            Request::builder()
                .uri("/api/stats/timeseries?site_id=example.com&start=0001-01-01&end=9999-12-31&granularity=hour")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(json["error"].as_str().unwrap().contains("buckets"));
    }

    #[tokio::test]
    async fn test_breakdown_routes_validate_site() {
        for route in ["pages", "devices", "pageviews"] {
            let app = build_router(make_test_state());
            let (status, _) = send(
                app,
                Request::builder()
                    .uri(format!("/api/stats/{route}?site_id=bad%20site&period=day"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{route}");
        }
    }

    #[tokio::test]
    async fn test_pageviews_empty_site() {
        let app = build_router(make_test_state());
        let (status, body) = send(
            app,
            Request::builder()
                .uri("/api/stats/pageviews?site_id=example.com&period=7d")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["total"], 0);
        assert_eq!(json["limit"], 50);
        assert!(json["pageviews"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_compact_rejects_today() {
        let app = build_router(make_test_state());
        let today = chrono::Utc::now().date_naive();
        let (status, _) = send(
            app,
            Request::builder()
                .method("POST")
                .uri(format!("/api/compact?day={today}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_compact_past_day() {
        let state = make_test_state();
        let app = build_router(Arc::clone(&state));
        let (status, body) = send(
            app,
            Request::builder()
                .method("POST")
                .uri("/api/compact?day=2024-01-15")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["day"], "2024-01-15");
        assert_eq!(json["fact_count"], 0);
        assert_eq!(state.metrics.compactions.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_detailed_health_check() {
        let app = build_router(make_test_state());
        let (status, body) = send(
            app,
            Request::builder()
                .uri("/health/detailed")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert!(json.get("version").is_some());
        assert_eq!(json["geoip_loaded"], false);
        assert_eq!(json["reject_unresolved"], false);
    }

    #[tokio::test]
    async fn test_not_found() {
        let app = build_router(make_test_state());
        let (status, _) = send(
            app,
            Request::builder()
                .uri("/nonexistent.file")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cors_headers() {
        let app = build_router(make_test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/api/event")
                    .header("origin", "https://example.com")
                    .header("access-control-request-method", "POST")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert!(response
            .headers()
            .contains_key("access-control-allow-origin"));
    }

    #[tokio::test]
    async fn test_security_headers() {
        let app = build_router(make_test_state());
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.headers()["x-content-type-options"], "nosniff");
        assert_eq!(response.headers()["x-frame-options"], "DENY");
    }
}
