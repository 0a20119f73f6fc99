use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clickhouse::{Client, Row};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

use crate::model::{DimFilter, Event, EventType, Player, Run, RunOutcome, Session, StoreTotals};
use crate::store::{AnalyticsStore, EndOutcome, PlayerVisit, Window};
use crate::utils::{time_to_utc, utc_to_time};

/// ClickHouse-backed store. Events land in a plain MergeTree; the mutable
/// entities (players, sessions, runs) are ReplacingMergeTree(updated_at)
/// tables where every update is a full versioned rewrite and reads go
/// through FINAL.
#[derive(Clone)]
pub struct ClickhouseRepo {
    client: Client,
    database: String,
}

impl ClickhouseRepo {
    pub fn new(client: Client, database: String) -> Self {
        Self { client, database }
    }
}

#[derive(Debug, Row, Serialize, Deserialize)]
struct EventRow {
    #[serde(with = "clickhouse::serde::time::datetime64::millis")]
    timestamp: OffsetDateTime,
    event_type: String,
    player_id: String,
    session_id: String,
    run_id: String,
    app_version: String,
    platform: String,
    device: String,
    locale: String,
    seed: String,
    batch_id: String,
    properties: String,
}

const EVENT_COLUMNS: &str = "timestamp, event_type, player_id, session_id, run_id, \
     app_version, platform, device, locale, seed, batch_id, properties";

impl EventRow {
    fn from_event(event: &Event) -> Result<Self> {
        Ok(Self {
            timestamp: utc_to_time(event.timestamp),
            event_type: event.event_type.as_str().to_string(),
            player_id: event.player_id.clone(),
            session_id: event.session_id.clone(),
            run_id: event.run_id.clone().unwrap_or_default(),
            app_version: event.app_version.clone(),
            platform: event.platform.clone(),
            device: event.device.clone().unwrap_or_default(),
            locale: event.locale.clone(),
            seed: event.seed.clone().unwrap_or_default(),
            batch_id: event.batch_id.clone().unwrap_or_default(),
            properties: serde_json::to_string(&event.properties)?,
        })
    }

    fn into_event(self) -> Result<Event> {
        let event_type: EventType = self
            .event_type
            .parse()
            .with_context(|| format!("stored event_type '{}'", self.event_type))?;
        let properties: Map<String, Value> = if self.properties.is_empty() {
            Map::new()
        } else {
            serde_json::from_str(&self.properties)?
        };
        Ok(Event {
            event_type,
            timestamp: time_to_utc(self.timestamp),
            player_id: self.player_id,
            session_id: self.session_id,
            run_id: none_if_empty(self.run_id),
            app_version: self.app_version,
            platform: self.platform,
            device: none_if_empty(self.device),
            locale: self.locale,
            seed: none_if_empty(self.seed),
            batch_id: none_if_empty(self.batch_id),
            properties,
        })
    }
}

#[derive(Debug, Row, Serialize, Deserialize)]
struct PlayerRow {
    player_id: String,
    #[serde(with = "clickhouse::serde::time::datetime64::millis")]
    first_seen: OffsetDateTime,
    #[serde(with = "clickhouse::serde::time::datetime64::millis")]
    last_seen: OffsetDateTime,
    total_sessions: i64,
    total_runs: i64,
    platform: String,
    device: String,
    locale: String,
    app_version: String,
    #[serde(with = "clickhouse::serde::time::datetime64::millis")]
    updated_at: OffsetDateTime,
}

const PLAYER_COLUMNS: &str = "player_id, first_seen, last_seen, total_sessions, total_runs, \
     platform, device, locale, app_version, updated_at";

impl PlayerRow {
    fn from_player(player: &Player, updated_at: DateTime<Utc>) -> Self {
        Self {
            player_id: player.player_id.clone(),
            first_seen: utc_to_time(player.first_seen),
            last_seen: utc_to_time(player.last_seen),
            total_sessions: player.total_sessions,
            total_runs: player.total_runs,
            platform: player.platform.clone().unwrap_or_default(),
            device: player.device.clone().unwrap_or_default(),
            locale: player.locale.clone(),
            app_version: player.app_version.clone(),
            updated_at: utc_to_time(updated_at),
        }
    }

    fn into_player(self) -> Player {
        Player {
            player_id: self.player_id,
            first_seen: time_to_utc(self.first_seen),
            last_seen: time_to_utc(self.last_seen),
            total_sessions: self.total_sessions,
            total_runs: self.total_runs,
            platform: none_if_empty(self.platform),
            device: none_if_empty(self.device),
            locale: self.locale,
            app_version: self.app_version,
        }
    }
}

#[derive(Debug, Row, Serialize, Deserialize)]
struct SessionRow {
    session_id: String,
    player_id: String,
    #[serde(with = "clickhouse::serde::time::datetime64::millis")]
    started_at: OffsetDateTime,
    #[serde(with = "clickhouse::serde::time::datetime64::millis::option")]
    ended_at: Option<OffsetDateTime>,
    duration_seconds: Option<i64>,
    runs_count: i64,
    app_version: String,
    platform: String,
    device: String,
    #[serde(with = "clickhouse::serde::time::datetime64::millis")]
    updated_at: OffsetDateTime,
}

const SESSION_COLUMNS: &str = "session_id, player_id, started_at, ended_at, duration_seconds, \
     runs_count, app_version, platform, device, updated_at";

impl SessionRow {
    fn from_session(session: &Session, updated_at: DateTime<Utc>) -> Self {
        Self {
            session_id: session.session_id.clone(),
            player_id: session.player_id.clone(),
            started_at: utc_to_time(session.started_at),
            ended_at: session.ended_at.map(utc_to_time),
            duration_seconds: session.duration_seconds,
            runs_count: session.runs_count,
            app_version: session.app_version.clone(),
            platform: session.platform.clone(),
            device: session.device.clone().unwrap_or_default(),
            updated_at: utc_to_time(updated_at),
        }
    }

    fn into_session(self) -> Session {
        Session {
            session_id: self.session_id,
            player_id: self.player_id,
            started_at: time_to_utc(self.started_at),
            ended_at: self.ended_at.map(time_to_utc),
            duration_seconds: self.duration_seconds,
            runs_count: self.runs_count,
            app_version: self.app_version,
            platform: self.platform,
            device: none_if_empty(self.device),
        }
    }
}

#[derive(Debug, Row, Serialize, Deserialize)]
struct RunRow {
    run_id: String,
    player_id: String,
    session_id: String,
    #[serde(with = "clickhouse::serde::time::datetime64::millis")]
    started_at: OffsetDateTime,
    #[serde(with = "clickhouse::serde::time::datetime64::millis::option")]
    ended_at: Option<OffsetDateTime>,
    duration_seconds: Option<i64>,
    score: i64,
    blueprints_earned: i64,
    perfect_pulses: i64,
    near_misses: i64,
    phase_throughs: i64,
    damage_taken: i64,
    death_cause: String,
    segment_reached: i64,
    upgrades_selected: Vec<String>,
    seed: String,
    #[serde(with = "clickhouse::serde::time::datetime64::millis")]
    updated_at: OffsetDateTime,
}

const RUN_COLUMNS: &str = "run_id, player_id, session_id, started_at, ended_at, \
     duration_seconds, score, blueprints_earned, perfect_pulses, near_misses, phase_throughs, \
     damage_taken, death_cause, segment_reached, upgrades_selected, seed, updated_at";

impl RunRow {
    fn from_run(run: &Run, updated_at: DateTime<Utc>) -> Self {
        Self {
            run_id: run.run_id.clone(),
            player_id: run.player_id.clone(),
            session_id: run.session_id.clone(),
            started_at: utc_to_time(run.started_at),
            ended_at: run.ended_at.map(utc_to_time),
            duration_seconds: run.duration_seconds,
            score: run.score,
            blueprints_earned: run.blueprints_earned,
            perfect_pulses: run.perfect_pulses,
            near_misses: run.near_misses,
            phase_throughs: run.phase_throughs,
            damage_taken: run.damage_taken,
            death_cause: run.death_cause.clone().unwrap_or_default(),
            segment_reached: run.segment_reached,
            upgrades_selected: run.upgrades_selected.clone(),
            seed: run.seed.clone().unwrap_or_default(),
            updated_at: utc_to_time(updated_at),
        }
    }

    fn into_run(self) -> Run {
        Run {
            run_id: self.run_id,
            player_id: self.player_id,
            session_id: self.session_id,
            started_at: time_to_utc(self.started_at),
            ended_at: self.ended_at.map(time_to_utc),
            duration_seconds: self.duration_seconds,
            score: self.score,
            blueprints_earned: self.blueprints_earned,
            perfect_pulses: self.perfect_pulses,
            near_misses: self.near_misses,
            phase_throughs: self.phase_throughs,
            damage_taken: self.damage_taken,
            death_cause: none_if_empty(self.death_cause),
            segment_reached: self.segment_reached,
            upgrades_selected: self.upgrades_selected,
            seed: none_if_empty(self.seed),
        }
    }
}

fn none_if_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

fn window_clause(column: &str, window: Window) -> String {
    let mut clause = format!(
        "{} >= fromUnixTimestamp64Milli({})",
        column,
        window.since.timestamp_millis()
    );
    if let Some(until) = window.until {
        clause.push_str(&format!(
            " AND {} < fromUnixTimestamp64Milli({})",
            column,
            until.timestamp_millis()
        ));
    }
    clause
}

fn push_dim_clauses(query: &mut String, filter: &DimFilter) {
    if let Some(app_version) = &filter.app_version {
        query.push_str(&format!(" AND app_version = '{}'", escape(app_version)));
    }
    if let Some(platform) = &filter.platform {
        query.push_str(&format!(" AND platform = '{}'", escape(platform)));
    }
    if let Some(device) = &filter.device {
        query.push_str(&format!(" AND device = '{}'", escape(device)));
    }
}

fn filter_is_empty(filter: &DimFilter) -> bool {
    filter.app_version.is_none() && filter.platform.is_none() && filter.device.is_none()
}

impl ClickhouseRepo {
    async fn fetch_player(&self, player_id: &str) -> Result<Option<Player>> {
        let query = format!(
            "SELECT {} FROM players FINAL WHERE player_id = '{}' LIMIT 1",
            PLAYER_COLUMNS,
            escape(player_id)
        );
        let rows = self.client.query(&query).fetch_all::<PlayerRow>().await?;
        Ok(rows.into_iter().next().map(PlayerRow::into_player))
    }

    async fn fetch_session(&self, session_id: &str) -> Result<Option<Session>> {
        let query = format!(
            "SELECT {} FROM sessions FINAL WHERE session_id = '{}' LIMIT 1",
            SESSION_COLUMNS,
            escape(session_id)
        );
        let rows = self.client.query(&query).fetch_all::<SessionRow>().await?;
        Ok(rows.into_iter().next().map(SessionRow::into_session))
    }

    async fn fetch_run(&self, run_id: &str) -> Result<Option<Run>> {
        let query = format!(
            "SELECT {} FROM runs FINAL WHERE run_id = '{}' LIMIT 1",
            RUN_COLUMNS,
            escape(run_id)
        );
        let rows = self.client.query(&query).fetch_all::<RunRow>().await?;
        Ok(rows.into_iter().next().map(RunRow::into_run))
    }

    async fn write_player(&self, player: &Player, updated_at: DateTime<Utc>) -> Result<()> {
        let mut insert = self.client.insert("players")?;
        insert.write(&PlayerRow::from_player(player, updated_at)).await?;
        insert.end().await?;
        Ok(())
    }

    async fn write_session(&self, session: &Session, updated_at: DateTime<Utc>) -> Result<()> {
        let mut insert = self.client.insert("sessions")?;
        insert
            .write(&SessionRow::from_session(session, updated_at))
            .await?;
        insert.end().await?;
        Ok(())
    }

    async fn write_run(&self, run: &Run, updated_at: DateTime<Utc>) -> Result<()> {
        let mut insert = self.client.insert("runs")?;
        insert.write(&RunRow::from_run(run, updated_at)).await?;
        insert.end().await?;
        Ok(())
    }

    async fn count(&self, query: &str) -> Result<u64> {
        let count: u64 = self.client.query(query).fetch_one().await?;
        Ok(count)
    }
}

#[async_trait]
impl AnalyticsStore for ClickhouseRepo {
    async fn ensure_schema(&self) -> Result<()> {
        let create_db = format!("CREATE DATABASE IF NOT EXISTS {}", self.database);
        self.client.query(&create_db).execute().await?;

        let create_events = r#"
CREATE TABLE IF NOT EXISTS events (
    timestamp DateTime64(3),
    event_type String,
    player_id String,
    session_id String,
    run_id String,
    app_version String,
    platform String,
    device String,
    locale String,
    seed String,
    batch_id String,
    properties String
) ENGINE = MergeTree
PARTITION BY toDate(timestamp)
ORDER BY (timestamp, player_id)
"#;
        self.client.query(create_events).execute().await?;

        let create_players = r#"
CREATE TABLE IF NOT EXISTS players (
    player_id String,
    first_seen DateTime64(3),
    last_seen DateTime64(3),
    total_sessions Int64,
    total_runs Int64,
    platform String,
    device String,
    locale String,
    app_version String,
    updated_at DateTime64(3)
) ENGINE = ReplacingMergeTree(updated_at)
ORDER BY player_id
"#;
        self.client.query(create_players).execute().await?;

        let create_sessions = r#"
CREATE TABLE IF NOT EXISTS sessions (
    session_id String,
    player_id String,
    started_at DateTime64(3),
    ended_at Nullable(DateTime64(3)),
    duration_seconds Nullable(Int64),
    runs_count Int64,
    app_version String,
    platform String,
    device String,
    updated_at DateTime64(3)
) ENGINE = ReplacingMergeTree(updated_at)
ORDER BY session_id
"#;
        self.client.query(create_sessions).execute().await?;

        let create_runs = r#"
CREATE TABLE IF NOT EXISTS runs (
    run_id String,
    player_id String,
    session_id String,
    started_at DateTime64(3),
    ended_at Nullable(DateTime64(3)),
    duration_seconds Nullable(Int64),
    score Int64,
    blueprints_earned Int64,
    perfect_pulses Int64,
    near_misses Int64,
    phase_throughs Int64,
    damage_taken Int64,
    death_cause String,
    segment_reached Int64,
    upgrades_selected Array(String),
    seed String,
    updated_at DateTime64(3)
) ENGINE = ReplacingMergeTree(updated_at)
ORDER BY run_id
"#;
        self.client.query(create_runs).execute().await?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let _: u8 = self.client.query("SELECT toUInt8(1)").fetch_one().await?;
        Ok(())
    }

    async fn append_events(&self, events: &[Event]) -> Result<()> {
        let mut insert = self.client.insert("events")?;
        for event in events {
            insert.write(&EventRow::from_event(event)?).await?;
        }
        insert.end().await?;
        Ok(())
    }

    async fn upsert_player(&self, visit: &PlayerVisit, now: DateTime<Utc>) -> Result<()> {
        let player = match self.fetch_player(&visit.player_id).await? {
            Some(mut existing) => {
                existing.last_seen = now;
                existing.platform = Some(visit.platform.clone());
                existing.device = visit.device.clone();
                existing.locale = visit.locale.clone();
                existing.app_version = visit.app_version.clone();
                existing
            }
            None => Player {
                player_id: visit.player_id.clone(),
                first_seen: now,
                last_seen: now,
                total_sessions: 0,
                total_runs: 0,
                platform: Some(visit.platform.clone()),
                device: visit.device.clone(),
                locale: visit.locale.clone(),
                app_version: visit.app_version.clone(),
            },
        };
        self.write_player(&player, now).await
    }

    async fn create_session(&self, session: &Session) -> Result<()> {
        let now = Utc::now();
        self.write_session(session, now).await?;
        if let Some(mut player) = self.fetch_player(&session.player_id).await? {
            player.total_sessions += 1;
            self.write_player(&player, now).await?;
        }
        Ok(())
    }

    async fn end_session(&self, session_id: &str, now: DateTime<Utc>) -> Result<EndOutcome> {
        let Some(mut session) = self.fetch_session(session_id).await? else {
            return Ok(EndOutcome::NotFound);
        };
        if session.ended_at.is_some() {
            return Ok(EndOutcome::AlreadyEnded);
        }
        session.ended_at = Some(now);
        session.duration_seconds = Some((now - session.started_at).num_seconds().max(0));
        self.write_session(&session, now).await?;
        Ok(EndOutcome::Finished)
    }

    async fn create_run(&self, run: &Run) -> Result<()> {
        let now = Utc::now();
        self.write_run(run, now).await?;
        if let Some(mut player) = self.fetch_player(&run.player_id).await? {
            player.total_runs += 1;
            self.write_player(&player, now).await?;
        }
        if let Some(mut session) = self.fetch_session(&run.session_id).await? {
            session.runs_count += 1;
            self.write_session(&session, now).await?;
        }
        Ok(())
    }

    async fn end_run(
        &self,
        run_id: &str,
        outcome: &RunOutcome,
        now: DateTime<Utc>,
    ) -> Result<EndOutcome> {
        let Some(mut run) = self.fetch_run(run_id).await? else {
            return Ok(EndOutcome::NotFound);
        };
        if run.ended_at.is_some() {
            return Ok(EndOutcome::AlreadyEnded);
        }
        run.finalize(outcome, now);
        self.write_run(&run, now).await?;
        Ok(EndOutcome::Finished)
    }

    async fn events_between(
        &self,
        window: Window,
        event_type: Option<EventType>,
        filter: &DimFilter,
        limit: Option<usize>,
    ) -> Result<Vec<Event>> {
        let mut query = format!(
            "SELECT {} FROM events WHERE {}",
            EVENT_COLUMNS,
            window_clause("timestamp", window)
        );
        if let Some(event_type) = event_type {
            query.push_str(&format!(" AND event_type = '{}'", event_type.as_str()));
        }
        push_dim_clauses(&mut query, filter);
        query.push_str(" ORDER BY timestamp ASC");
        if let Some(limit) = limit {
            query.push_str(&format!(" LIMIT {}", limit));
        }
        let rows = self.client.query(&query).fetch_all::<EventRow>().await?;
        rows.into_iter().map(EventRow::into_event).collect()
    }

    async fn sessions_started_between(
        &self,
        window: Window,
        filter: &DimFilter,
        limit: Option<usize>,
    ) -> Result<Vec<Session>> {
        let mut query = format!(
            "SELECT {} FROM sessions FINAL WHERE {}",
            SESSION_COLUMNS,
            window_clause("started_at", window)
        );
        push_dim_clauses(&mut query, filter);
        query.push_str(" ORDER BY started_at ASC");
        if let Some(limit) = limit {
            query.push_str(&format!(" LIMIT {}", limit));
        }
        let rows = self.client.query(&query).fetch_all::<SessionRow>().await?;
        Ok(rows.into_iter().map(SessionRow::into_session).collect())
    }

    async fn runs_started_between(
        &self,
        window: Window,
        filter: &DimFilter,
        limit: Option<usize>,
    ) -> Result<Vec<Run>> {
        let mut query = format!(
            "SELECT {} FROM runs FINAL WHERE {}",
            RUN_COLUMNS,
            window_clause("started_at", window)
        );
        if !filter_is_empty(filter) {
            // Runs carry no dimensions; filter through the owning session.
            let mut subquery = "SELECT session_id FROM sessions FINAL WHERE 1 = 1".to_string();
            push_dim_clauses(&mut subquery, filter);
            query.push_str(&format!(" AND session_id IN ({})", subquery));
        }
        query.push_str(" ORDER BY started_at ASC");
        if let Some(limit) = limit {
            query.push_str(&format!(" LIMIT {}", limit));
        }
        let rows = self.client.query(&query).fetch_all::<RunRow>().await?;
        Ok(rows.into_iter().map(RunRow::into_run).collect())
    }

    async fn players_first_seen_between(&self, window: Window) -> Result<Vec<Player>> {
        let query = format!(
            "SELECT {} FROM players FINAL WHERE {}",
            PLAYER_COLUMNS,
            window_clause("first_seen", window)
        );
        let rows = self.client.query(&query).fetch_all::<PlayerRow>().await?;
        Ok(rows.into_iter().map(PlayerRow::into_player).collect())
    }

    async fn insert_players(&self, players: &[Player]) -> Result<()> {
        let now = Utc::now();
        let mut insert = self.client.insert("players")?;
        for player in players {
            insert.write(&PlayerRow::from_player(player, now)).await?;
        }
        insert.end().await?;
        Ok(())
    }

    async fn insert_sessions(&self, sessions: &[Session]) -> Result<()> {
        let now = Utc::now();
        let mut insert = self.client.insert("sessions")?;
        for session in sessions {
            insert.write(&SessionRow::from_session(session, now)).await?;
        }
        insert.end().await?;
        Ok(())
    }

    async fn insert_runs(&self, runs: &[Run]) -> Result<()> {
        let now = Utc::now();
        let mut insert = self.client.insert("runs")?;
        for run in runs {
            insert.write(&RunRow::from_run(run, now)).await?;
        }
        insert.end().await?;
        Ok(())
    }

    async fn totals(&self) -> Result<StoreTotals> {
        Ok(StoreTotals {
            total_players: self.count("SELECT count() FROM players FINAL").await?,
            total_sessions: self.count("SELECT count() FROM sessions FINAL").await?,
            total_runs: self.count("SELECT count() FROM runs FINAL").await?,
            total_events: self.count("SELECT count() FROM events").await?,
        })
    }

    async fn clear_all(&self) -> Result<()> {
        for table in ["events", "players", "sessions", "runs"] {
            let query = format!("TRUNCATE TABLE IF EXISTS {}", table);
            self.client.query(&query).execute().await?;
        }
        Ok(())
    }
}
