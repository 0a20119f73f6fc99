use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;

use crate::model::{DimFilter, Event, EventType, Player, Run, RunOutcome, Session, StoreTotals};

/// Half-open time window `[since, until)`; an absent `until` means "up to
/// whatever the store holds" (live views match the original's `>= since`).
#[derive(Debug, Clone, Copy)]
pub struct Window {
    pub since: DateTime<Utc>,
    pub until: Option<DateTime<Utc>>,
}

impl Window {
    pub fn open_ended(since: DateTime<Utc>) -> Self {
        Self { since, until: None }
    }

    pub fn between(since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        Self {
            since,
            until: Some(until),
        }
    }

    /// The 24h bucket starting at `day_start`.
    pub fn day(day_start: DateTime<Utc>) -> Self {
        Self::between(day_start, day_start + Duration::days(1))
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.since && self.until.map_or(true, |until| instant < until)
    }
}

/// Player identity fields carried by a `session_start` event.
#[derive(Debug, Clone)]
pub struct PlayerVisit {
    pub player_id: String,
    pub platform: String,
    pub device: Option<String>,
    pub locale: String,
    pub app_version: String,
}

/// Result of a finalize operation. `ended_at` is set exactly once; a repeat
/// end is reported instead of overwriting (first-write-wins).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndOutcome {
    Finished,
    AlreadyEnded,
    NotFound,
}

/// Persistence port for the analytics collections. The write side mirrors the
/// ingestion lifecycle (`create_session` also increments the owning player's
/// `total_sessions`, `create_run` increments `total_runs` and the session's
/// `runs_count`); the read side exposes windowed scans the metrics engine
/// aggregates in process.
#[async_trait]
pub trait AnalyticsStore: Send + Sync {
    async fn ensure_schema(&self) -> Result<()>;
    async fn ping(&self) -> Result<()>;

    async fn append_events(&self, events: &[Event]) -> Result<()>;
    /// Upsert the player: `last_seen` and identity fields always, `first_seen`
    /// only on first insert.
    async fn upsert_player(&self, visit: &PlayerVisit, now: DateTime<Utc>) -> Result<()>;
    async fn create_session(&self, session: &Session) -> Result<()>;
    async fn end_session(&self, session_id: &str, now: DateTime<Utc>) -> Result<EndOutcome>;
    async fn create_run(&self, run: &Run) -> Result<()>;
    async fn end_run(
        &self,
        run_id: &str,
        outcome: &RunOutcome,
        now: DateTime<Utc>,
    ) -> Result<EndOutcome>;

    /// Events in the window, ascending by timestamp.
    async fn events_between(
        &self,
        window: Window,
        event_type: Option<EventType>,
        filter: &DimFilter,
        limit: Option<usize>,
    ) -> Result<Vec<Event>>;
    async fn sessions_started_between(
        &self,
        window: Window,
        filter: &DimFilter,
        limit: Option<usize>,
    ) -> Result<Vec<Session>>;
    async fn runs_started_between(
        &self,
        window: Window,
        filter: &DimFilter,
        limit: Option<usize>,
    ) -> Result<Vec<Run>>;
    async fn players_first_seen_between(&self, window: Window) -> Result<Vec<Player>>;

    // Bulk writes for the demo data generator.
    async fn insert_players(&self, players: &[Player]) -> Result<()>;
    async fn insert_sessions(&self, sessions: &[Session]) -> Result<()>;
    async fn insert_runs(&self, runs: &[Run]) -> Result<()>;

    async fn totals(&self) -> Result<StoreTotals>;
    async fn clear_all(&self) -> Result<()>;
}

/// In-memory store: backs tests and the `in_memory` dev mode. A single
/// RwLock over all four collections; per-operation atomicity only, matching
/// the per-document guarantee of the persistent store.
#[derive(Clone, Default)]
pub struct MemStore {
    inner: Arc<RwLock<MemInner>>,
}

#[derive(Default)]
struct MemInner {
    players: HashMap<String, Player>,
    sessions: HashMap<String, Session>,
    runs: HashMap<String, Run>,
    events: Vec<Event>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AnalyticsStore for MemStore {
    async fn ensure_schema(&self) -> Result<()> {
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn append_events(&self, events: &[Event]) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.events.extend_from_slice(events);
        Ok(())
    }

    async fn upsert_player(&self, visit: &PlayerVisit, now: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.write().await;
        let player = inner
            .players
            .entry(visit.player_id.clone())
            .or_insert_with(|| Player {
                player_id: visit.player_id.clone(),
                first_seen: now,
                last_seen: now,
                total_sessions: 0,
                total_runs: 0,
                platform: None,
                device: None,
                locale: visit.locale.clone(),
                app_version: visit.app_version.clone(),
            });
        player.last_seen = now;
        player.platform = Some(visit.platform.clone());
        player.device = visit.device.clone();
        player.locale = visit.locale.clone();
        player.app_version = visit.app_version.clone();
        Ok(())
    }

    async fn create_session(&self, session: &Session) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .sessions
            .insert(session.session_id.clone(), session.clone());
        if let Some(player) = inner.players.get_mut(&session.player_id) {
            player.total_sessions += 1;
        }
        Ok(())
    }

    async fn end_session(&self, session_id: &str, now: DateTime<Utc>) -> Result<EndOutcome> {
        let mut inner = self.inner.write().await;
        let Some(session) = inner.sessions.get_mut(session_id) else {
            return Ok(EndOutcome::NotFound);
        };
        if session.ended_at.is_some() {
            return Ok(EndOutcome::AlreadyEnded);
        }
        session.ended_at = Some(now);
        session.duration_seconds = Some((now - session.started_at).num_seconds().max(0));
        Ok(EndOutcome::Finished)
    }

    async fn create_run(&self, run: &Run) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.runs.insert(run.run_id.clone(), run.clone());
        if let Some(player) = inner.players.get_mut(&run.player_id) {
            player.total_runs += 1;
        }
        if let Some(session) = inner.sessions.get_mut(&run.session_id) {
            session.runs_count += 1;
        }
        Ok(())
    }

    async fn end_run(
        &self,
        run_id: &str,
        outcome: &RunOutcome,
        now: DateTime<Utc>,
    ) -> Result<EndOutcome> {
        let mut inner = self.inner.write().await;
        let Some(run) = inner.runs.get_mut(run_id) else {
            return Ok(EndOutcome::NotFound);
        };
        if run.ended_at.is_some() {
            return Ok(EndOutcome::AlreadyEnded);
        }
        run.finalize(outcome, now);
        Ok(EndOutcome::Finished)
    }

    async fn events_between(
        &self,
        window: Window,
        event_type: Option<EventType>,
        filter: &DimFilter,
        limit: Option<usize>,
    ) -> Result<Vec<Event>> {
        let inner = self.inner.read().await;
        let mut events: Vec<Event> = inner
            .events
            .iter()
            .filter(|event| window.contains(event.timestamp))
            .filter(|event| event_type.map_or(true, |wanted| event.event_type == wanted))
            .filter(|event| {
                filter.matches(&event.app_version, &event.platform, event.device.as_deref())
            })
            .cloned()
            .collect();
        events.sort_by_key(|event| event.timestamp);
        if let Some(limit) = limit {
            events.truncate(limit);
        }
        Ok(events)
    }

    async fn sessions_started_between(
        &self,
        window: Window,
        filter: &DimFilter,
        limit: Option<usize>,
    ) -> Result<Vec<Session>> {
        let inner = self.inner.read().await;
        let mut sessions: Vec<Session> = inner
            .sessions
            .values()
            .filter(|session| window.contains(session.started_at))
            .filter(|session| {
                filter.matches(
                    &session.app_version,
                    &session.platform,
                    session.device.as_deref(),
                )
            })
            .cloned()
            .collect();
        sessions.sort_by_key(|session| session.started_at);
        if let Some(limit) = limit {
            sessions.truncate(limit);
        }
        Ok(sessions)
    }

    async fn runs_started_between(
        &self,
        window: Window,
        filter: &DimFilter,
        limit: Option<usize>,
    ) -> Result<Vec<Run>> {
        let inner = self.inner.read().await;
        let sessions = &inner.sessions;
        let mut runs: Vec<Run> = inner
            .runs
            .values()
            .filter(|run| window.contains(run.started_at))
            .filter(|run| {
                // Runs carry no dimensions of their own; filter through the
                // owning session where one is materialized.
                match sessions.get(&run.session_id) {
                    Some(session) => filter.matches(
                        &session.app_version,
                        &session.platform,
                        session.device.as_deref(),
                    ),
                    None => true,
                }
            })
            .cloned()
            .collect();
        runs.sort_by_key(|run| run.started_at);
        if let Some(limit) = limit {
            runs.truncate(limit);
        }
        Ok(runs)
    }

    async fn players_first_seen_between(&self, window: Window) -> Result<Vec<Player>> {
        let inner = self.inner.read().await;
        Ok(inner
            .players
            .values()
            .filter(|player| window.contains(player.first_seen))
            .cloned()
            .collect())
    }

    async fn insert_players(&self, players: &[Player]) -> Result<()> {
        let mut inner = self.inner.write().await;
        for player in players {
            inner.players.insert(player.player_id.clone(), player.clone());
        }
        Ok(())
    }

    async fn insert_sessions(&self, sessions: &[Session]) -> Result<()> {
        let mut inner = self.inner.write().await;
        for session in sessions {
            inner
                .sessions
                .insert(session.session_id.clone(), session.clone());
        }
        Ok(())
    }

    async fn insert_runs(&self, runs: &[Run]) -> Result<()> {
        let mut inner = self.inner.write().await;
        for run in runs {
            inner.runs.insert(run.run_id.clone(), run.clone());
        }
        Ok(())
    }

    async fn totals(&self) -> Result<StoreTotals> {
        let inner = self.inner.read().await;
        Ok(StoreTotals {
            total_players: inner.players.len() as u64,
            total_sessions: inner.sessions.len() as u64,
            total_runs: inner.runs.len() as u64,
            total_events: inner.events.len() as u64,
        })
    }

    async fn clear_all(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        *inner = MemInner::default();
        Ok(())
    }
}
