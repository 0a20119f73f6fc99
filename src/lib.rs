pub mod app;
pub mod config;
pub mod db;
pub mod demo;
pub mod error;
pub mod export;
pub mod ingest;
pub mod metrics;
pub mod model;
pub mod store;
pub mod utils;
pub mod web;

pub use app::AppState;
pub use config::AppConfig;

pub async fn run() -> anyhow::Result<()> {
    app::run().await
}
