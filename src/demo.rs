use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Datelike, Duration, Utc, Weekday};
use rand::rngs::ThreadRng;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::info;
use uuid::Uuid;

use crate::model::{Event, EventType, Player, Run, Session};
use crate::store::AnalyticsStore;
use crate::utils::round1;

const UPGRADES: [&str; 15] = [
    "pulse_range",
    "pulse_power",
    "charge_speed",
    "phase_duration",
    "phase_cooldown",
    "magnet_range",
    "shield",
    "double_jump",
    "slow_motion",
    "overdrive",
    "regeneration",
    "extra_life",
    "score_multiplier",
    "shard_magnet",
    "heat_sink",
];

const DEATH_CAUSES: [(&str, f64); 5] = [
    ("wall", 0.35),
    ("drone", 0.25),
    ("laser", 0.2),
    ("timeout", 0.1),
    ("overheat", 0.1),
];

const DEVICES: [&str; 7] = [
    "iPhone 14",
    "iPhone 15 Pro",
    "Pixel 7",
    "Samsung S23",
    "iPad Pro",
    "Chrome Desktop",
    "Safari Desktop",
];

const PLATFORMS: [&str; 3] = ["ios", "android", "web"];
const VERSIONS: [&str; 3] = ["1.0.0", "1.0.1", "1.1.0"];
const LOCALES: [&str; 7] = ["en", "es", "fr", "de", "ja", "ko", "pt"];
const ITEM_TYPES: [&str; 3] = ["upgrade", "cosmetic", "theme"];
const ERROR_TYPES: [&str; 3] = ["render_error", "network_error", "state_error"];

#[derive(Debug, Serialize)]
pub struct DemoSummary {
    pub events: usize,
    pub sessions: usize,
    pub runs: usize,
    pub players: usize,
}

/// Seeds the store with a plausible activity history so every dashboard
/// panel has something to show.
#[derive(Clone)]
pub struct DemoGenerator {
    store: Arc<dyn AnalyticsStore>,
}

struct Synthesized {
    players: Vec<Player>,
    sessions: Vec<Session>,
    runs: Vec<Run>,
    events: Vec<Event>,
    requested_players: usize,
}

impl DemoGenerator {
    pub fn new(store: Arc<dyn AnalyticsStore>) -> Self {
        Self { store }
    }

    pub async fn generate(&self, days: u32, players: u32) -> Result<DemoSummary> {
        info!(days, players, "generating demo data");
        // Synthesis is sync so the thread-local rng never crosses an await.
        let data = synthesize(days, players, Utc::now());
        self.store.insert_players(&data.players).await?;
        self.store.insert_sessions(&data.sessions).await?;
        self.store.insert_runs(&data.runs).await?;
        self.store.append_events(&data.events).await?;
        info!(
            events = data.events.len(),
            sessions = data.sessions.len(),
            runs = data.runs.len(),
            "demo data inserted"
        );
        Ok(DemoSummary {
            events: data.events.len(),
            sessions: data.sessions.len(),
            runs: data.runs.len(),
            players: data.requested_players,
        })
    }

    pub async fn clear(&self) -> Result<()> {
        self.store.clear_all().await?;
        info!("analytics data cleared");
        Ok(())
    }
}

fn synthesize(days: u32, players: u32, now: DateTime<Utc>) -> Synthesized {
    let mut rng = rand::thread_rng();
    let start_date = now - Duration::days(i64::from(days));

    let player_ids: Vec<String> = (0..players).map(|_| Uuid::new_v4().to_string()).collect();

    let mut events = Vec::new();
    let mut sessions = Vec::new();
    let mut runs = Vec::new();
    let mut locales: HashMap<String, String> = HashMap::new();

    for day_offset in 0..days {
        let day_start = start_date + Duration::days(i64::from(day_offset));
        let weekend = matches!(day_start.weekday(), Weekday::Sat | Weekday::Sun);
        let daily_multiplier = if weekend { 1.3 } else { 1.0 };

        let active_count =
            (player_ids.len() as f64 * rng.gen_range(0.7..=1.0) * daily_multiplier) as usize;
        let active: Vec<&String> = player_ids
            .choose_multiple(&mut rng, active_count.min(player_ids.len()))
            .collect();

        for player_id in active {
            let sessions_count = *[(1usize, 0.5), (2, 0.35), (3, 0.15)]
                .choose_weighted(&mut rng, |item| item.1)
                .map(|item| &item.0)
                .unwrap_or(&1);

            for _ in 0..sessions_count {
                synth_session(
                    &mut rng,
                    player_id,
                    day_start,
                    &mut events,
                    &mut sessions,
                    &mut runs,
                    &mut locales,
                );
            }
        }
    }

    // Player records are derived from the sessions they ended up with.
    let mut players_out = Vec::new();
    for player_id in &player_ids {
        let mut own_sessions: Vec<&Session> = sessions
            .iter()
            .filter(|session| &session.player_id == player_id)
            .collect();
        if own_sessions.is_empty() {
            continue;
        }
        own_sessions.sort_by_key(|session| session.started_at);
        let first = own_sessions[0];
        let last = own_sessions[own_sessions.len() - 1];
        let total_runs = runs
            .iter()
            .filter(|run| &run.player_id == player_id)
            .count() as i64;
        players_out.push(Player {
            player_id: player_id.clone(),
            first_seen: first.started_at,
            last_seen: last.ended_at.unwrap_or(last.started_at),
            total_sessions: own_sessions.len() as i64,
            total_runs,
            platform: Some(first.platform.clone()),
            device: first.device.clone(),
            locale: locales
                .get(player_id)
                .cloned()
                .unwrap_or_else(|| "en".to_string()),
            app_version: first.app_version.clone(),
        });
    }

    events.sort_by_key(|event| event.timestamp);

    Synthesized {
        players: players_out,
        sessions,
        runs,
        events,
        requested_players: player_ids.len(),
    }
}

#[allow(clippy::too_many_arguments)]
fn synth_session(
    rng: &mut ThreadRng,
    player_id: &str,
    day_start: DateTime<Utc>,
    events: &mut Vec<Event>,
    sessions: &mut Vec<Session>,
    runs: &mut Vec<Run>,
    locales: &mut HashMap<String, String>,
) {
    let session_id = Uuid::new_v4().to_string();
    let session_start = day_start
        + Duration::hours(rng.gen_range(6..=23))
        + Duration::minutes(rng.gen_range(0..60));

    let platform = *PLATFORMS.choose(rng).unwrap_or(&"web");
    let matching: Vec<&str> = DEVICES
        .iter()
        .copied()
        .filter(|device| match platform {
            "ios" => device.contains("iPhone") || device.contains("iPad"),
            "android" => device.contains("Pixel") || device.contains("Samsung"),
            _ => device.contains("Desktop"),
        })
        .collect();
    let device = *matching.choose(rng).unwrap_or(&DEVICES[0]);
    let app_version = *VERSIONS.choose(rng).unwrap_or(&"1.0.0");
    let locale = *LOCALES.choose(rng).unwrap_or(&"en");
    locales
        .entry(player_id.to_string())
        .or_insert_with(|| locale.to_string());

    let dims = EventDims {
        player_id,
        session_id: &session_id,
        app_version,
        platform,
        device,
        locale,
    };

    events.push(dims.event(EventType::SessionStart, session_start, None, Map::new()));
    events.push(dims.event(EventType::AppOpen, session_start, None, Map::new()));

    let session_duration = rng.gen_range(300..=2700);
    let session_end = session_start + Duration::seconds(session_duration);

    let runs_in_session = rng.gen_range(1..=5);
    let mut run_start_time = session_start + Duration::seconds(30);
    let mut runs_count = 0i64;

    for _ in 0..runs_in_session {
        if run_start_time >= session_end {
            break;
        }
        let run_id = Uuid::new_v4().to_string();
        events.push(dims.event(EventType::RunStart, run_start_time, Some(&run_id), Map::new()));

        let run_duration = rng.gen_range(30i64..=90);
        let skill: f64 = rng.gen_range(0.3..=1.0);

        let base_score = (run_duration as f64 * 50.0 * skill) as i64;
        let score = (base_score + rng.gen_range(-200..=500)).max(100);
        let perfect_pulses = (rng.gen_range(0.0..15.0) * skill) as i64;
        let near_misses = rng.gen_range(0..=10);
        let phase_throughs = rng.gen_range(0..=5);
        let damage_taken = rng.gen_range(0..=((5.0 * (1.0 - skill) + 1.0) as i64));
        let death_cause = DEATH_CAUSES
            .choose_weighted(rng, |item| item.1)
            .map(|item| item.0)
            .unwrap_or("wall");
        let segment_reached = (1 + run_duration / 15).min(6);
        let upgrade_count = (run_duration / 15).min(6) as usize;
        let upgrades_selected: Vec<String> = UPGRADES
            .choose_multiple(rng, upgrade_count)
            .map(|upgrade| upgrade.to_string())
            .collect();
        let blueprints = score / 100 + rng.gen_range(0..=10);

        let run_end_time = run_start_time + Duration::seconds(run_duration);

        let mut pulse_time = run_start_time;
        for _ in 0..perfect_pulses {
            pulse_time = pulse_time + Duration::seconds(rng.gen_range(2..=8));
            if pulse_time < run_end_time {
                events.push(dims.event(
                    EventType::PerfectPulse,
                    pulse_time,
                    Some(&run_id),
                    props(json!({"count": 1})),
                ));
            }
        }

        for (index, upgrade) in upgrades_selected.iter().enumerate() {
            let upgrade_time = run_start_time + Duration::seconds(15 * (index as i64 + 1));
            if upgrade_time >= run_end_time {
                continue;
            }
            let mut shown: Vec<&str> = UPGRADES
                .iter()
                .copied()
                .filter(|candidate| *candidate != upgrade.as_str())
                .collect::<Vec<_>>()
                .choose_multiple(rng, 2)
                .copied()
                .collect();
            shown.insert(0, upgrade.as_str());
            for option in shown {
                events.push(dims.event(
                    EventType::UpgradeShown,
                    upgrade_time,
                    Some(&run_id),
                    props(json!({"upgrade_id": option})),
                ));
            }
            events.push(dims.event(
                EventType::UpgradeSelected,
                upgrade_time + Duration::seconds(2),
                Some(&run_id),
                props(json!({"upgrade_id": upgrade})),
            ));
        }

        for second in (0..run_duration).step_by(10) {
            // Rough bell around 55fps, clamped to the playable range.
            let noise: f64 = (0..3).map(|_| rng.gen_range(-1.0..1.0)).sum::<f64>() / 3.0;
            let fps = (55.0 + noise * 14.0).clamp(20.0, 60.0);
            events.push(dims.event(
                EventType::FpsSample,
                run_start_time + Duration::seconds(second),
                Some(&run_id),
                props(json!({"fps": round1(fps)})),
            ));
        }

        events.push(dims.event(
            EventType::RunEnd,
            run_end_time,
            Some(&run_id),
            props(json!({
                "score": score,
                "blueprints_earned": blueprints,
                "perfect_pulses": perfect_pulses,
                "near_misses": near_misses,
                "phase_throughs": phase_throughs,
                "damage_taken": damage_taken,
                "death_cause": death_cause,
                "segment_reached": segment_reached,
                "upgrades_selected": upgrades_selected,
            })),
        ));
        events.push(dims.event(
            EventType::BlueprintsEarned,
            run_end_time,
            Some(&run_id),
            props(json!({"amount": blueprints})),
        ));

        runs.push(Run {
            run_id: run_id.clone(),
            player_id: player_id.to_string(),
            session_id: session_id.clone(),
            started_at: run_start_time,
            ended_at: Some(run_end_time),
            duration_seconds: Some(run_duration),
            score,
            blueprints_earned: blueprints,
            perfect_pulses,
            near_misses,
            phase_throughs,
            damage_taken,
            death_cause: Some(death_cause.to_string()),
            segment_reached,
            upgrades_selected,
            seed: None,
        });
        runs_count += 1;

        run_start_time = run_end_time + Duration::seconds(rng.gen_range(10..=60));
    }

    if rng.gen_bool(0.2) {
        events.push(dims.event(
            EventType::BlueprintsSpent,
            session_end - Duration::seconds(30),
            None,
            props(json!({
                "amount": *[50, 100, 200, 500].choose(rng).unwrap_or(&50),
                "item_type": *ITEM_TYPES.choose(rng).unwrap_or(&"upgrade"),
            })),
        ));
    }

    events.push(dims.event(EventType::SessionEnd, session_end, None, Map::new()));

    if rng.gen_bool(0.005) {
        events.push(dims.event(
            EventType::Error,
            session_start + Duration::seconds(rng.gen_range(60..=session_duration)),
            None,
            props(json!({
                "error_type": *ERROR_TYPES.choose(rng).unwrap_or(&"render_error"),
                "message": "Simulated error for demo",
            })),
        ));
    }

    sessions.push(Session {
        session_id,
        player_id: player_id.to_string(),
        started_at: session_start,
        ended_at: Some(session_end),
        duration_seconds: Some(session_duration),
        runs_count,
        app_version: app_version.to_string(),
        platform: platform.to_string(),
        device: Some(device.to_string()),
    });
}

struct EventDims<'a> {
    player_id: &'a str,
    session_id: &'a str,
    app_version: &'a str,
    platform: &'a str,
    device: &'a str,
    locale: &'a str,
}

impl EventDims<'_> {
    fn event(
        &self,
        event_type: EventType,
        timestamp: DateTime<Utc>,
        run_id: Option<&str>,
        properties: Map<String, Value>,
    ) -> Event {
        Event {
            event_type,
            timestamp,
            player_id: self.player_id.to_string(),
            session_id: self.session_id.to_string(),
            run_id: run_id.map(str::to_string),
            app_version: self.app_version.to_string(),
            platform: self.platform.to_string(),
            device: Some(self.device.to_string()),
            locale: self.locale.to_string(),
            seed: None,
            batch_id: None,
            properties,
        }
    }
}

fn props(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;

    #[test]
    fn synthesis_is_internally_consistent() {
        let data = synthesize(3, 10, Utc::now());
        assert_eq!(data.requested_players, 10);
        assert!(!data.sessions.is_empty());
        assert!(!data.events.is_empty());
        // Every run belongs to a synthesized session and is finished.
        for run in &data.runs {
            assert!(data
                .sessions
                .iter()
                .any(|session| session.session_id == run.session_id));
            assert!(run.ended_at.is_some());
            assert!(run.score >= 100);
            assert!((1..=6).contains(&run.segment_reached));
        }
        // Player counters match the rows that were generated.
        for player in &data.players {
            let sessions = data
                .sessions
                .iter()
                .filter(|session| session.player_id == player.player_id)
                .count() as i64;
            assert_eq!(player.total_sessions, sessions);
        }
        // Events come out time-ordered for the bulk append.
        assert!(data
            .events
            .windows(2)
            .all(|pair| pair[0].timestamp <= pair[1].timestamp));
    }

    #[test]
    fn every_synthesized_payload_passes_validation() {
        let data = synthesize(2, 5, Utc::now());
        for event in &data.events {
            assert!(event.payload().is_ok(), "bad payload: {:?}", event);
        }
    }

    #[tokio::test]
    async fn generate_and_clear_round_trip() {
        let store = Arc::new(MemStore::new());
        let generator = DemoGenerator::new(store.clone());
        let summary = generator.generate(2, 5).await.unwrap();
        assert_eq!(summary.players, 5);
        assert!(store.totals().await.unwrap().total_events > 0);
        generator.clear().await.unwrap();
        assert_eq!(store.totals().await.unwrap().total_events, 0);
    }
}
