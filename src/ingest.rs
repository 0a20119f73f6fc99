use std::io::Read;
use std::sync::Arc;

use anyhow::Result;
use axum::http::HeaderMap;
use chrono::Utc;
use flate2::read::GzDecoder;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::AppError;
use crate::model::{BatchAck, Event, EventBatch, EventPayload, EventType, Run, RunOutcome, Session};
use crate::store::{AnalyticsStore, EndOutcome, PlayerVisit};

pub fn authorize_ingest(config: &AppConfig, headers: &HeaderMap) -> bool {
    key_matches(config.ingest_key.as_deref(), headers)
}

pub fn authorize_dashboard(config: &AppConfig, headers: &HeaderMap) -> bool {
    key_matches(config.dashboard_key.as_deref(), headers)
}

fn key_matches(expected: Option<&str>, headers: &HeaderMap) -> bool {
    let Some(expected) = expected else {
        return true;
    };
    headers
        .get("X-API-Key")
        .and_then(|value| value.to_str().ok())
        .map(|value| value == expected)
        .unwrap_or(false)
}

pub fn parse_batch(headers: &HeaderMap, body: &[u8]) -> Result<EventBatch> {
    let content = maybe_gunzip(headers, body)?;
    let batch: EventBatch = serde_json::from_str(&content)?;
    Ok(batch)
}

fn maybe_gunzip(headers: &HeaderMap, body: &[u8]) -> Result<String> {
    if let Some(encoding) = headers.get("Content-Encoding") {
        if encoding.to_str().unwrap_or("") == "gzip" {
            let mut decoder = GzDecoder::new(body);
            let mut out = String::new();
            decoder.read_to_string(&mut out)?;
            return Ok(out);
        }
    }
    Ok(String::from_utf8(body.to_vec())?)
}

/// Applies a batch of telemetry events against the store: lifecycle events
/// mutate the player/session/run collections, then the whole batch is
/// appended to the raw event log.
#[derive(Clone)]
pub struct IngestReducer {
    store: Arc<dyn AnalyticsStore>,
}

impl IngestReducer {
    pub fn new(store: Arc<dyn AnalyticsStore>) -> Self {
        Self { store }
    }

    pub async fn ingest(&self, batch: EventBatch) -> Result<BatchAck, AppError> {
        let batch_id = batch
            .batch_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let events_received = batch.events.len();
        self.apply(batch.events, &batch_id).await?;
        Ok(BatchAck {
            success: true,
            events_received,
            batch_id,
        })
    }

    async fn apply(&self, mut events: Vec<Event>, batch_id: &str) -> Result<(), AppError> {
        // Validation pre-pass: a malformed payload rejects the whole batch
        // before anything is written.
        for (index, event) in events.iter().enumerate() {
            event.payload().map_err(|err| {
                AppError::BadRequest(format!(
                    "event {} ({}): invalid properties: {}",
                    index,
                    event.event_type.as_str(),
                    err
                ))
            })?;
        }

        let now = Utc::now();
        for event in &events {
            match event.event_type {
                EventType::SessionStart => {
                    let visit = PlayerVisit {
                        player_id: event.player_id.clone(),
                        platform: event.platform.clone(),
                        device: event.device.clone(),
                        locale: event.locale.clone(),
                        app_version: event.app_version.clone(),
                    };
                    self.store.upsert_player(&visit, now).await?;
                    let session = Session {
                        session_id: event.session_id.clone(),
                        player_id: event.player_id.clone(),
                        started_at: now,
                        ended_at: None,
                        duration_seconds: None,
                        runs_count: 0,
                        app_version: event.app_version.clone(),
                        platform: event.platform.clone(),
                        device: event.device.clone(),
                    };
                    self.store.create_session(&session).await?;
                }
                EventType::SessionEnd => {
                    match self.store.end_session(&event.session_id, now).await? {
                        EndOutcome::Finished => {}
                        EndOutcome::AlreadyEnded => {
                            debug!(session_id = %event.session_id, "session already ended, keeping first end");
                        }
                        EndOutcome::NotFound => {
                            debug!(session_id = %event.session_id, "session_end for unknown session");
                        }
                    }
                }
                EventType::RunStart => {
                    let Some(run_id) = &event.run_id else {
                        warn!(player_id = %event.player_id, "run_start without run_id, skipping");
                        continue;
                    };
                    let run = Run::started(
                        run_id,
                        &event.player_id,
                        &event.session_id,
                        event.seed.clone(),
                        now,
                    );
                    self.store.create_run(&run).await?;
                }
                EventType::RunEnd => {
                    let Some(run_id) = &event.run_id else {
                        warn!(player_id = %event.player_id, "run_end without run_id, skipping");
                        continue;
                    };
                    // Validated in the pre-pass; defaults apply to absent fields.
                    let outcome = match event.payload() {
                        Ok(EventPayload::RunEnd(outcome)) => outcome,
                        _ => RunOutcome::default(),
                    };
                    match self.store.end_run(run_id, &outcome, now).await? {
                        EndOutcome::Finished => {}
                        EndOutcome::AlreadyEnded => {
                            debug!(run_id = %run_id, "run already ended, keeping first end");
                        }
                        EndOutcome::NotFound => {
                            debug!(run_id = %run_id, "run_end for unknown run");
                        }
                    }
                }
                _ => {}
            }
        }

        for event in &mut events {
            event.batch_id = Some(batch_id.to_string());
        }
        self.store.append_events(&events).await?;
        Ok(())
    }
}
