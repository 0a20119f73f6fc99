use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Closed set of telemetry event types emitted by the game client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    AppOpen,
    SessionStart,
    SessionEnd,
    RunStart,
    RunEnd,
    UpgradeShown,
    UpgradeSelected,
    DamageTaken,
    PerfectPulse,
    NearMiss,
    PhaseThrough,
    BlueprintsEarned,
    BlueprintsSpent,
    MasteryXp,
    FpsSample,
    Error,
    SkinCreated,
    SkinEquipped,
}

impl EventType {
    pub const ALL: [EventType; 18] = [
        EventType::AppOpen,
        EventType::SessionStart,
        EventType::SessionEnd,
        EventType::RunStart,
        EventType::RunEnd,
        EventType::UpgradeShown,
        EventType::UpgradeSelected,
        EventType::DamageTaken,
        EventType::PerfectPulse,
        EventType::NearMiss,
        EventType::PhaseThrough,
        EventType::BlueprintsEarned,
        EventType::BlueprintsSpent,
        EventType::MasteryXp,
        EventType::FpsSample,
        EventType::Error,
        EventType::SkinCreated,
        EventType::SkinEquipped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::AppOpen => "app_open",
            EventType::SessionStart => "session_start",
            EventType::SessionEnd => "session_end",
            EventType::RunStart => "run_start",
            EventType::RunEnd => "run_end",
            EventType::UpgradeShown => "upgrade_shown",
            EventType::UpgradeSelected => "upgrade_selected",
            EventType::DamageTaken => "damage_taken",
            EventType::PerfectPulse => "perfect_pulse",
            EventType::NearMiss => "near_miss",
            EventType::PhaseThrough => "phase_through",
            EventType::BlueprintsEarned => "blueprints_earned",
            EventType::BlueprintsSpent => "blueprints_spent",
            EventType::MasteryXp => "mastery_xp",
            EventType::FpsSample => "fps_sample",
            EventType::Error => "error",
            EventType::SkinCreated => "skin_created",
            EventType::SkinEquipped => "skin_equipped",
        }
    }
}

impl std::str::FromStr for EventType {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|event_type| event_type.as_str() == value)
            .ok_or_else(|| anyhow::anyhow!("unknown event_type '{}'", value))
    }
}

/// Single immutable telemetry record. `properties` is an open JSON object on
/// the wire; [`Event::payload`] parses it into the typed per-type payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_type: EventType,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    pub player_id: String,
    pub session_id: String,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default = "default_app_version")]
    pub app_version: String,
    #[serde(default = "default_platform")]
    pub platform: String,
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default = "default_locale")]
    pub locale: String,
    #[serde(default)]
    pub seed: Option<String>,
    /// Stamped by the ingestion reducer before the raw append.
    #[serde(default)]
    pub batch_id: Option<String>,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

impl Event {
    /// Parses `properties` against the per-type schema. Missing fields take
    /// their documented defaults; wrongly-typed fields are an error.
    pub fn payload(&self) -> Result<EventPayload, serde_json::Error> {
        let value = Value::Object(self.properties.clone());
        Ok(match self.event_type {
            EventType::RunEnd => EventPayload::RunEnd(serde_json::from_value(value)?),
            EventType::BlueprintsEarned | EventType::BlueprintsSpent => {
                EventPayload::Blueprints(serde_json::from_value(value)?)
            }
            EventType::UpgradeShown | EventType::UpgradeSelected => {
                EventPayload::Upgrade(serde_json::from_value(value)?)
            }
            EventType::FpsSample => EventPayload::Fps(serde_json::from_value(value)?),
            EventType::Error => EventPayload::Error(serde_json::from_value(value)?),
            _ => EventPayload::Plain,
        })
    }
}

fn default_app_version() -> String {
    "1.0.0".to_string()
}

fn default_platform() -> String {
    "web".to_string()
}

fn default_locale() -> String {
    "en".to_string()
}

/// Typed view over `Event::properties`.
#[derive(Debug, Clone)]
pub enum EventPayload {
    RunEnd(RunOutcome),
    Blueprints(BlueprintDelta),
    Upgrade(UpgradeRef),
    Fps(FpsSample),
    Error(ErrorDetail),
    Plain,
}

/// Gameplay outcome carried by a `run_end` event and merged into the Run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOutcome {
    pub score: i64,
    pub blueprints_earned: i64,
    pub perfect_pulses: i64,
    pub near_misses: i64,
    pub phase_throughs: i64,
    pub damage_taken: i64,
    pub death_cause: Option<String>,
    pub segment_reached: i64,
    pub upgrades_selected: Vec<String>,
}

impl Default for RunOutcome {
    fn default() -> Self {
        Self {
            score: 0,
            blueprints_earned: 0,
            perfect_pulses: 0,
            near_misses: 0,
            phase_throughs: 0,
            damage_taken: 0,
            death_cause: None,
            segment_reached: 1,
            upgrades_selected: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BlueprintDelta {
    pub amount: i64,
    pub item_type: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UpgradeRef {
    pub upgrade_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FpsSample {
    pub fps: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorDetail {
    pub error_type: Option<String>,
    pub message: Option<String>,
}

// ==================== entities ====================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Player {
    pub player_id: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub total_sessions: i64,
    pub total_runs: i64,
    pub platform: Option<String>,
    pub device: Option<String>,
    pub locale: String,
    pub app_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub player_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub runs_count: i64,
    pub app_version: String,
    pub platform: String,
    pub device: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub player_id: String,
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub score: i64,
    pub blueprints_earned: i64,
    pub perfect_pulses: i64,
    pub near_misses: i64,
    pub phase_throughs: i64,
    pub damage_taken: i64,
    pub death_cause: Option<String>,
    pub segment_reached: i64,
    pub upgrades_selected: Vec<String>,
    pub seed: Option<String>,
}

impl Run {
    pub fn started(
        run_id: &str,
        player_id: &str,
        session_id: &str,
        seed: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id: run_id.to_string(),
            player_id: player_id.to_string(),
            session_id: session_id.to_string(),
            started_at: now,
            ended_at: None,
            duration_seconds: None,
            score: 0,
            blueprints_earned: 0,
            perfect_pulses: 0,
            near_misses: 0,
            phase_throughs: 0,
            damage_taken: 0,
            death_cause: None,
            segment_reached: 1,
            upgrades_selected: Vec::new(),
            seed,
        }
    }

    /// Merges the `run_end` outcome into the run. The caller has already
    /// checked that the run is still open.
    pub fn finalize(&mut self, outcome: &RunOutcome, now: DateTime<Utc>) {
        self.ended_at = Some(now);
        self.duration_seconds = Some((now - self.started_at).num_seconds().max(0));
        self.score = outcome.score;
        self.blueprints_earned = outcome.blueprints_earned;
        self.perfect_pulses = outcome.perfect_pulses;
        self.near_misses = outcome.near_misses;
        self.phase_throughs = outcome.phase_throughs;
        self.damage_taken = outcome.damage_taken;
        self.death_cause = outcome.death_cause.clone();
        self.segment_reached = outcome.segment_reached;
        self.upgrades_selected = outcome.upgrades_selected.clone();
    }
}

// ==================== ingestion ====================

#[derive(Debug, Deserialize)]
pub struct EventBatch {
    pub events: Vec<Event>,
    #[serde(default)]
    pub batch_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BatchAck {
    pub success: bool,
    pub events_received: usize,
    pub batch_id: String,
}

// ==================== dashboard queries ====================

/// Optional dimension filter shared by dashboard and export queries.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DimFilter {
    pub app_version: Option<String>,
    pub platform: Option<String>,
    pub device: Option<String>,
}

impl DimFilter {
    pub fn matches(&self, app_version: &str, platform: &str, device: Option<&str>) -> bool {
        self.app_version.as_deref().map_or(true, |v| v == app_version)
            && self.platform.as_deref().map_or(true, |v| v == platform)
            && self.device.as_deref().map_or(true, |v| Some(v) == device)
    }
}

// Dimension filters are inlined rather than nested so the query structs
// deserialize cleanly from a URL query string.
#[derive(Debug, Default, Deserialize)]
pub struct LiveQuery {
    pub minutes: Option<u32>,
    pub app_version: Option<String>,
    pub platform: Option<String>,
    pub device: Option<String>,
}

impl LiveQuery {
    pub fn filter(&self) -> DimFilter {
        DimFilter {
            app_version: self.app_version.clone(),
            platform: self.platform.clone(),
            device: self.device.clone(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct PeriodQuery {
    pub days: Option<u32>,
    pub app_version: Option<String>,
    pub platform: Option<String>,
    pub device: Option<String>,
}

impl PeriodQuery {
    pub fn filter(&self) -> DimFilter {
        DimFilter {
            app_version: self.app_version.clone(),
            platform: self.platform.clone(),
            device: self.device.clone(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct DailyQuery {
    pub date: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ExportEventsQuery {
    pub date_from: Option<String>,
    pub date_to: Option<String>,
    pub event_type: Option<String>,
    pub format: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ExportRunsQuery {
    pub date_from: Option<String>,
    pub date_to: Option<String>,
    pub format: Option<String>,
    pub app_version: Option<String>,
    pub platform: Option<String>,
    pub device: Option<String>,
}

impl ExportRunsQuery {
    pub fn filter(&self) -> DimFilter {
        DimFilter {
            app_version: self.app_version.clone(),
            platform: self.platform.clone(),
            device: self.device.clone(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct DemoQuery {
    pub days: Option<u32>,
    pub players: Option<u32>,
}

// ==================== dashboard responses ====================

#[derive(Debug, Serialize)]
pub struct LiveOverview {
    pub active_sessions: u64,
    pub runs_per_minute: f64,
    pub crash_rate: f64,
    pub avg_fps: f64,
    pub deaths_by_cause: BTreeMap<String, u64>,
    pub recent_events: Vec<Event>,
}

#[derive(Debug, Default, Serialize)]
pub struct FunnelCounts {
    pub app_open: u64,
    pub run_start: u64,
    pub run_end: u64,
}

#[derive(Debug, Serialize)]
pub struct EngagementMetrics {
    pub sessions_per_user: f64,
    pub avg_session_duration: f64,
    pub funnel: FunnelCounts,
    pub retention_d1: f64,
    pub retention_d3: f64,
    pub retention_d7: f64,
    pub daily_active_users: u64,
}

#[derive(Debug, Serialize)]
pub struct ScoreBucket {
    pub bucket: String,
    pub count: u64,
}

#[derive(Debug, Serialize)]
pub struct GameplayMetrics {
    pub score_distribution: Vec<ScoreBucket>,
    pub segment_distribution: BTreeMap<i64, u64>,
    pub death_causes: BTreeMap<String, u64>,
    pub perfect_pulse_rate: f64,
    pub near_miss_rate: f64,
}

#[derive(Debug, Serialize)]
pub struct EconomyMetrics {
    pub blueprints_earned_total: i64,
    pub blueprints_spent_total: i64,
    pub avg_blueprints_per_run: f64,
    pub purchases_by_type: BTreeMap<String, u64>,
    /// earned/spent ratio; -1.0 when nothing was spent in the window.
    pub inflation_indicator: f64,
}

#[derive(Debug, Serialize)]
pub struct UpgradeStat {
    pub upgrade_id: String,
    pub shown: u64,
    pub picked: u64,
    pub pick_rate: f64,
}

#[derive(Debug, Serialize)]
pub struct UpgradeMetrics {
    pub shown_vs_picked: Vec<UpgradeStat>,
    pub pick_rates: BTreeMap<String, f64>,
    pub score_impact: BTreeMap<String, f64>,
}

#[derive(Debug, Serialize)]
pub struct VersionStats {
    pub sessions: u64,
    pub avg_duration: f64,
}

#[derive(Debug, Serialize)]
pub struct PerformanceMetrics {
    pub fps_by_device: BTreeMap<String, f64>,
    pub fps_by_platform: BTreeMap<String, f64>,
    pub error_list: Vec<Event>,
    pub version_comparisons: BTreeMap<String, VersionStats>,
}

#[derive(Debug, Serialize)]
pub struct AnomalyFlag {
    #[serde(rename = "type")]
    pub kind: String,
    pub change: f64,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct DailySummary {
    pub date: String,
    pub total_sessions: u64,
    pub total_runs: u64,
    pub unique_players: u64,
    pub avg_score: f64,
    pub blueprints_earned: i64,
    pub top_death_cause: String,
    pub anomalies: Vec<AnomalyFlag>,
}

#[derive(Debug, Serialize)]
pub struct StoreTotals {
    pub total_players: u64,
    pub total_sessions: u64,
    pub total_runs: u64,
    pub total_events: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_deserializes_with_wire_defaults() {
        let event: Event = serde_json::from_value(json!({
            "event_type": "app_open",
            "player_id": "p1",
            "session_id": "s1"
        }))
        .unwrap();
        assert_eq!(event.event_type, EventType::AppOpen);
        assert_eq!(event.app_version, "1.0.0");
        assert_eq!(event.platform, "web");
        assert_eq!(event.locale, "en");
        assert!(event.run_id.is_none());
    }

    #[test]
    fn unknown_event_type_is_rejected() {
        let result = serde_json::from_value::<Event>(json!({
            "event_type": "teleport",
            "player_id": "p1",
            "session_id": "s1"
        }));
        assert!(result.is_err());
    }

    #[test]
    fn run_end_payload_defaults_missing_fields() {
        let event: Event = serde_json::from_value(json!({
            "event_type": "run_end",
            "player_id": "p1",
            "session_id": "s1",
            "run_id": "r1",
            "properties": {"score": 1500}
        }))
        .unwrap();
        match event.payload().unwrap() {
            EventPayload::RunEnd(outcome) => {
                assert_eq!(outcome.score, 1500);
                assert_eq!(outcome.segment_reached, 1);
                assert!(outcome.upgrades_selected.is_empty());
                assert!(outcome.death_cause.is_none());
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn mistyped_payload_field_is_an_error() {
        let event: Event = serde_json::from_value(json!({
            "event_type": "run_end",
            "player_id": "p1",
            "session_id": "s1",
            "run_id": "r1",
            "properties": {"score": "very high"}
        }))
        .unwrap();
        assert!(event.payload().is_err());
    }

    #[test]
    fn dim_filter_matches_all_when_empty() {
        let filter = DimFilter::default();
        assert!(filter.matches("1.0.0", "web", None));
        let filter = DimFilter {
            platform: Some("ios".to_string()),
            ..DimFilter::default()
        };
        assert!(filter.matches("1.0.0", "ios", Some("iPhone 14")));
        assert!(!filter.matches("1.0.0", "web", None));
    }
}
