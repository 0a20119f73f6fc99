use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use pulse_analytics::app::{build_router, AppState};
use pulse_analytics::config::AppConfig;
use pulse_analytics::store::MemStore;

const INGEST_KEY: &str = "test-ingest-key";
const DASHBOARD_KEY: &str = "test-dashboard-key";

fn test_router() -> Router {
    let mut config = AppConfig::default();
    config.ingest_key = Some(INGEST_KEY.to_string());
    config.dashboard_key = Some(DASHBOARD_KEY.to_string());
    let state = AppState::new(config.clone(), Arc::new(MemStore::new()));
    build_router(state, &config)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn health_needs_no_auth() {
    let app = test_router();
    let response = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "pulse-analytics");
}

#[tokio::test]
async fn dashboard_rejects_missing_or_wrong_key() {
    let app = test_router();
    let response = app
        .clone()
        .oneshot(Request::get("/dashboard/live").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .oneshot(
            Request::get("/dashboard/live")
                .header("X-API-Key", "nope")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn ingest_key_does_not_open_the_dashboard() {
    let app = test_router();
    let response = app
        .oneshot(
            Request::get("/dashboard/live")
                .header("X-API-Key", INGEST_KEY)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn batch_ingest_acks_and_shows_up_in_stats() {
    let app = test_router();
    let payload = json!({
        "batch_id": "b-1",
        "events": [
            {"event_type": "session_start", "player_id": "p1", "session_id": "s1"},
            {"event_type": "run_start", "player_id": "p1", "session_id": "s1", "run_id": "r1"},
            {
                "event_type": "run_end",
                "player_id": "p1",
                "session_id": "s1",
                "run_id": "r1",
                "properties": {"score": 2500, "death_cause": "laser"}
            }
        ]
    });
    let response = app
        .clone()
        .oneshot(
            Request::post("/events/batch")
                .header("X-API-Key", INGEST_KEY)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(payload.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let ack = body_json(response).await;
    assert_eq!(ack["success"], true);
    assert_eq!(ack["events_received"], 3);
    assert_eq!(ack["batch_id"], "b-1");

    let response = app
        .oneshot(
            Request::get("/admin/stats")
                .header("X-API-Key", DASHBOARD_KEY)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let stats = body_json(response).await;
    assert_eq!(stats["total_players"], 1);
    assert_eq!(stats["total_sessions"], 1);
    assert_eq!(stats["total_runs"], 1);
    assert_eq!(stats["total_events"], 3);
}

#[tokio::test]
async fn malformed_batch_returns_bad_request() {
    let app = test_router();
    let payload = json!({
        "events": [{
            "event_type": "run_end",
            "player_id": "p1",
            "session_id": "s1",
            "run_id": "r1",
            "properties": {"score": "not a number"}
        }]
    });
    let response = app
        .oneshot(
            Request::post("/events/batch")
                .header("X-API-Key", INGEST_KEY)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(payload.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert!(body["error"].as_str().unwrap().contains("invalid properties"));
}

#[tokio::test]
async fn live_dashboard_reflects_ingested_events() {
    let app = test_router();
    let payload = json!({
        "events": [
            {"event_type": "session_start", "player_id": "p1", "session_id": "s1"},
            {"event_type": "app_open", "player_id": "p1", "session_id": "s1"}
        ]
    });
    app.clone()
        .oneshot(
            Request::post("/events/batch")
                .header("X-API-Key", INGEST_KEY)
                .body(Body::from(payload.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    let response = app
        .oneshot(
            Request::get("/dashboard/live?minutes=15")
                .header("X-API-Key", DASHBOARD_KEY)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["active_sessions"], 1);
    assert_eq!(body["avg_fps"], 60.0);
    assert_eq!(body["recent_events"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn empty_event_export_responds_no_data_csv() {
    let app = test_router();
    let response = app
        .oneshot(
            Request::get("/export/events")
                .header("X-API-Key", DASHBOARD_KEY)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "text/csv"
    );
    assert_eq!(
        response.headers().get(header::CONTENT_DISPOSITION).unwrap(),
        "attachment; filename=events.csv"
    );
    assert_eq!(body_text(response).await, "No data");
}

#[tokio::test]
async fn run_export_csv_contains_ingested_run() {
    let app = test_router();
    let payload = json!({
        "events": [
            {"event_type": "session_start", "player_id": "p1", "session_id": "s1"},
            {"event_type": "run_start", "player_id": "p1", "session_id": "s1", "run_id": "r1"},
            {
                "event_type": "run_end",
                "player_id": "p1",
                "session_id": "s1",
                "run_id": "r1",
                "properties": {"score": 900}
            }
        ]
    });
    app.clone()
        .oneshot(
            Request::post("/events/batch")
                .header("X-API-Key", INGEST_KEY)
                .body(Body::from(payload.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    let response = app
        .oneshot(
            Request::get("/export/runs")
                .header("X-API-Key", DASHBOARD_KEY)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let csv = body_text(response).await;
    let mut lines = csv.lines();
    assert!(lines.next().unwrap().starts_with("run_id,player_id,session_id"));
    let row = lines.next().unwrap();
    assert!(row.starts_with("r1,p1,s1"));
    assert!(row.contains(",900,"));
}

#[tokio::test]
async fn invalid_export_date_is_rejected() {
    let app = test_router();
    let response = app
        .oneshot(
            Request::get("/export/events?date_from=15-06-2024")
                .header("X-API-Key", DASHBOARD_KEY)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn demo_data_generates_and_clears() {
    let app = test_router();
    let response = app
        .clone()
        .oneshot(
            Request::post("/admin/generate-demo-data?days=2&players=5")
                .header("X-API-Key", DASHBOARD_KEY)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let summary = body_json(response).await;
    assert_eq!(summary["players"], 5);
    assert!(summary["events"].as_u64().unwrap() > 0);

    let response = app
        .clone()
        .oneshot(
            Request::delete("/admin/clear-demo-data")
                .header("X-API-Key", DASHBOARD_KEY)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(
            Request::get("/admin/stats")
                .header("X-API-Key", DASHBOARD_KEY)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let stats = body_json(response).await;
    assert_eq!(stats["total_events"], 0);
}

#[tokio::test]
async fn ready_check_reports_ok_for_memory_store() {
    let app = test_router();
    let response = app
        .oneshot(Request::get("/health/ready").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
