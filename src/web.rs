use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde::Serialize;
use tokio::time::{timeout, Duration};
use tracing::error;

use crate::app::AppState;
use crate::demo::DemoSummary;
use crate::error::AppError;
use crate::export::{self, EVENT_EXPORT_LIMIT, RUN_EXPORT_LIMIT};
use crate::ingest::{authorize_dashboard, authorize_ingest, parse_batch};
use crate::model::{
    BatchAck, DailyQuery, DemoQuery, DimFilter, EconomyMetrics, EngagementMetrics, Event,
    EventType, ExportEventsQuery, ExportRunsQuery, GameplayMetrics, LiveQuery, LiveOverview,
    PerformanceMetrics, PeriodQuery, Run, StoreTotals, UpgradeMetrics,
};
use crate::utils::parse_date;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/events/batch", axum::routing::post(ingest_batch))
        .route("/dashboard/live", axum::routing::get(dashboard_live))
        .route("/dashboard/engagement", axum::routing::get(dashboard_engagement))
        .route("/dashboard/gameplay", axum::routing::get(dashboard_gameplay))
        .route("/dashboard/economy", axum::routing::get(dashboard_economy))
        .route("/dashboard/upgrades", axum::routing::get(dashboard_upgrades))
        .route("/dashboard/performance", axum::routing::get(dashboard_performance))
        .route("/dashboard/daily-summary", axum::routing::get(dashboard_daily_summary))
        .route("/export/events", axum::routing::get(export_events))
        .route("/export/runs", axum::routing::get(export_runs))
        .route(
            "/admin/generate-demo-data",
            axum::routing::post(generate_demo_data),
        )
        .route(
            "/admin/clear-demo-data",
            axum::routing::delete(clear_demo_data),
        )
        .route("/admin/stats", axum::routing::get(admin_stats))
        .route("/health", axum::routing::get(health))
        .route("/health/ready", axum::routing::get(health_ready))
        .with_state(state)
}

async fn ingest_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<Json<BatchAck>, AppError> {
    if !authorize_ingest(&state.config, &headers) {
        return Err(AppError::Unauthorized);
    }
    let batch = parse_batch(&headers, &body).map_err(|err| {
        error!("failed to parse event batch: {}", err);
        AppError::BadRequest(err.to_string())
    })?;
    let ack = state.ingest.ingest(batch).await?;
    Ok(Json(ack))
}

async fn dashboard_live(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<LiveQuery>,
) -> Result<Json<LiveOverview>, AppError> {
    if !authorize_dashboard(&state.config, &headers) {
        return Err(AppError::Unauthorized);
    }
    let minutes = query.minutes.unwrap_or(15).clamp(1, 60);
    let overview = state
        .metrics
        .live_overview(minutes, &query.filter())
        .await
        .map_err(|err| {
            error!("failed to compute live overview: {}", err);
            AppError::Internal(err)
        })?;
    Ok(Json(overview))
}

async fn dashboard_engagement(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<PeriodQuery>,
) -> Result<Json<EngagementMetrics>, AppError> {
    if !authorize_dashboard(&state.config, &headers) {
        return Err(AppError::Unauthorized);
    }
    let days = query.days.unwrap_or(7).clamp(1, 90);
    let metrics = state
        .metrics
        .engagement(days, &query.filter())
        .await
        .map_err(|err| {
            error!("failed to compute engagement metrics: {}", err);
            AppError::Internal(err)
        })?;
    Ok(Json(metrics))
}

async fn dashboard_gameplay(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<PeriodQuery>,
) -> Result<Json<GameplayMetrics>, AppError> {
    if !authorize_dashboard(&state.config, &headers) {
        return Err(AppError::Unauthorized);
    }
    let days = query.days.unwrap_or(7).clamp(1, 90);
    let metrics = state
        .metrics
        .gameplay(days, &query.filter())
        .await
        .map_err(|err| {
            error!("failed to compute gameplay metrics: {}", err);
            AppError::Internal(err)
        })?;
    Ok(Json(metrics))
}

async fn dashboard_economy(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<PeriodQuery>,
) -> Result<Json<EconomyMetrics>, AppError> {
    if !authorize_dashboard(&state.config, &headers) {
        return Err(AppError::Unauthorized);
    }
    let days = query.days.unwrap_or(7).clamp(1, 90);
    let metrics = state
        .metrics
        .economy(days, &query.filter())
        .await
        .map_err(|err| {
            error!("failed to compute economy metrics: {}", err);
            AppError::Internal(err)
        })?;
    Ok(Json(metrics))
}

async fn dashboard_upgrades(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<PeriodQuery>,
) -> Result<Json<UpgradeMetrics>, AppError> {
    if !authorize_dashboard(&state.config, &headers) {
        return Err(AppError::Unauthorized);
    }
    let days = query.days.unwrap_or(7).clamp(1, 90);
    let metrics = state
        .metrics
        .upgrades(days, &query.filter())
        .await
        .map_err(|err| {
            error!("failed to compute upgrade metrics: {}", err);
            AppError::Internal(err)
        })?;
    Ok(Json(metrics))
}

async fn dashboard_performance(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<PeriodQuery>,
) -> Result<Json<PerformanceMetrics>, AppError> {
    if !authorize_dashboard(&state.config, &headers) {
        return Err(AppError::Unauthorized);
    }
    let days = query.days.unwrap_or(7).clamp(1, 90);
    let metrics = state
        .metrics
        .performance(days, &query.filter())
        .await
        .map_err(|err| {
            error!("failed to compute performance metrics: {}", err);
            AppError::Internal(err)
        })?;
    Ok(Json(metrics))
}

async fn dashboard_daily_summary(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<DailyQuery>,
) -> Result<impl IntoResponse, AppError> {
    if !authorize_dashboard(&state.config, &headers) {
        return Err(AppError::Unauthorized);
    }
    let date = match query.date.as_deref() {
        Some(raw) => Some(
            parse_date(raw).map_err(|err| AppError::BadRequest(err.to_string()))?,
        ),
        None => None,
    };
    let summary = state.metrics.daily_summary(date).await.map_err(|err| {
        error!("failed to compute daily summary: {}", err);
        AppError::Internal(err)
    })?;
    Ok(Json(summary))
}

async fn export_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ExportEventsQuery>,
) -> Result<Response, AppError> {
    if !authorize_dashboard(&state.config, &headers) {
        return Err(AppError::Unauthorized);
    }
    let window = export_query_window(query.date_from.as_deref(), query.date_to.as_deref())?;
    let event_type = match query.event_type.as_deref() {
        Some(raw) => Some(
            raw.parse::<EventType>()
                .map_err(|err| AppError::BadRequest(err.to_string()))?,
        ),
        None => None,
    };
    let events = state
        .store
        .events_between(window, event_type, &DimFilter::default(), Some(EVENT_EXPORT_LIMIT))
        .await
        .map_err(|err| {
            error!("failed to export events: {}", err);
            AppError::Internal(err)
        })?;

    if query.format.as_deref() == Some("json") {
        return Ok(Json::<Vec<Event>>(events).into_response());
    }
    if events.is_empty() {
        return Ok(csv_attachment("events.csv", "No data".to_string()));
    }
    let csv = export::events_csv(&events).map_err(AppError::Internal)?;
    Ok(csv_attachment("events.csv", csv))
}

async fn export_runs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ExportRunsQuery>,
) -> Result<Response, AppError> {
    if !authorize_dashboard(&state.config, &headers) {
        return Err(AppError::Unauthorized);
    }
    let window = export_query_window(query.date_from.as_deref(), query.date_to.as_deref())?;
    let runs = state
        .store
        .runs_started_between(window, &query.filter(), Some(RUN_EXPORT_LIMIT))
        .await
        .map_err(|err| {
            error!("failed to export runs: {}", err);
            AppError::Internal(err)
        })?;

    if query.format.as_deref() == Some("json") {
        return Ok(Json::<Vec<Run>>(runs).into_response());
    }
    if runs.is_empty() {
        return Ok(csv_attachment("runs.csv", "No data".to_string()));
    }
    let csv = export::runs_csv(&runs).map_err(AppError::Internal)?;
    Ok(csv_attachment("runs.csv", csv))
}

fn export_query_window(
    date_from: Option<&str>,
    date_to: Option<&str>,
) -> Result<crate::store::Window, AppError> {
    let from = match date_from {
        Some(raw) => Some(parse_date(raw).map_err(|err| AppError::BadRequest(err.to_string()))?),
        None => None,
    };
    let to = match date_to {
        Some(raw) => Some(parse_date(raw).map_err(|err| AppError::BadRequest(err.to_string()))?),
        None => None,
    };
    Ok(export::export_window(from, to))
}

fn csv_attachment(filename: &str, body: String) -> Response {
    let mut response = (StatusCode::OK, body).into_response();
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/csv"));
    if let Ok(disposition) =
        HeaderValue::from_str(&format!("attachment; filename={}", filename))
    {
        response
            .headers_mut()
            .insert(header::CONTENT_DISPOSITION, disposition);
    }
    response
}

async fn generate_demo_data(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<DemoQuery>,
) -> Result<Json<DemoSummary>, AppError> {
    if !authorize_dashboard(&state.config, &headers) {
        return Err(AppError::Unauthorized);
    }
    let days = query.days.unwrap_or(14).clamp(1, 30);
    let players = query.players.unwrap_or(100).clamp(1, 1000);
    let summary = state.demo.generate(days, players).await.map_err(|err| {
        error!("failed to generate demo data: {}", err);
        AppError::Internal(err)
    })?;
    Ok(Json(summary))
}

#[derive(Serialize)]
struct ClearAck {
    success: bool,
}

async fn clear_demo_data(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ClearAck>, AppError> {
    if !authorize_dashboard(&state.config, &headers) {
        return Err(AppError::Unauthorized);
    }
    state.demo.clear().await.map_err(|err| {
        error!("failed to clear analytics data: {}", err);
        AppError::Internal(err)
    })?;
    Ok(Json(ClearAck { success: true }))
}

async fn admin_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<StoreTotals>, AppError> {
    if !authorize_dashboard(&state.config, &headers) {
        return Err(AppError::Unauthorized);
    }
    let totals = state.store.totals().await.map_err(|err| {
        error!("failed to fetch store totals: {}", err);
        AppError::Internal(err)
    })?;
    Ok(Json(totals))
}

#[derive(Serialize)]
struct HealthStatus {
    status: &'static str,
    service: &'static str,
}

async fn health() -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "healthy",
        service: "pulse-analytics",
    })
}

async fn health_ready(State(state): State<AppState>) -> StatusCode {
    let timeout_secs = state.config.request_timeout_seconds.max(1);
    match timeout(Duration::from_secs(timeout_secs), state.store.ping()).await {
        Ok(Ok(_)) => StatusCode::OK,
        Ok(Err(err)) => {
            error!("ready check failed: {}", err);
            StatusCode::SERVICE_UNAVAILABLE
        }
        Err(_) => {
            error!("ready check timeout after {}s", timeout_secs);
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}
