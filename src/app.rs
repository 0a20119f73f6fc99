use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::Router;
use clickhouse::Client;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::db::ClickhouseRepo;
use crate::demo::DemoGenerator;
use crate::ingest::IngestReducer;
use crate::metrics::MetricsEngine;
use crate::store::{AnalyticsStore, MemStore};
use crate::web;

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub store: Arc<dyn AnalyticsStore>,
    pub ingest: IngestReducer,
    pub metrics: MetricsEngine,
    pub demo: DemoGenerator,
}

impl AppState {
    pub fn new(config: AppConfig, store: Arc<dyn AnalyticsStore>) -> Self {
        Self {
            config,
            store: store.clone(),
            ingest: IngestReducer::new(store.clone()),
            metrics: MetricsEngine::new(store.clone()),
            demo: DemoGenerator::new(store),
        }
    }
}

pub async fn run() -> Result<()> {
    let config = AppConfig::load().await?;
    info!(
        bind_addr = %config.bind_addr,
        in_memory = config.in_memory,
        clickhouse_url = %config.clickhouse_url,
        clickhouse_database = %config.clickhouse_database,
        "config loaded"
    );
    if config.ingest_key.is_none() {
        warn!("ingest_key not set, event ingestion is unauthenticated");
    }
    if config.dashboard_key.is_none() {
        warn!("dashboard_key not set, dashboard and admin routes are unauthenticated");
    }

    let store: Arc<dyn AnalyticsStore> = if config.in_memory {
        warn!("running with the in-memory store, nothing will be persisted");
        Arc::new(MemStore::new())
    } else {
        let mut clickhouse = Client::default()
            .with_url(&config.clickhouse_url)
            .with_database(&config.clickhouse_database);
        if let Some(user) = &config.clickhouse_user {
            clickhouse = clickhouse.with_user(user);
        }
        if let Some(password) = &config.clickhouse_password {
            clickhouse = clickhouse.with_password(password);
        }
        Arc::new(ClickhouseRepo::new(
            clickhouse,
            config.clickhouse_database.clone(),
        ))
    };
    store.ensure_schema().await?;

    let state = AppState::new(config.clone(), store);
    let app = build_router(state, &config);

    let addr: std::net::SocketAddr = config.bind_addr.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

pub fn build_router(state: AppState, config: &AppConfig) -> Router {
    web::router(state)
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(
            usize::try_from(config.max_body_bytes).unwrap_or(usize::MAX),
        ))
        .layer(TimeoutLayer::new(Duration::from_secs(
            config.request_timeout_seconds,
        )))
        .layer(TraceLayer::new_for_http())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("sigterm handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
