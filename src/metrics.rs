use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, NaiveDate, Utc};

use crate::model::{
    AnomalyFlag, DailySummary, DimFilter, EconomyMetrics, EngagementMetrics, Event, EventPayload,
    EventType, FunnelCounts, GameplayMetrics, LiveOverview, PerformanceMetrics, ScoreBucket,
    UpgradeMetrics, UpgradeStat, VersionStats,
};
use crate::store::{AnalyticsStore, Window};
use crate::utils::{day_start, round1, round2};

/// Score histogram boundaries; scores at or above the last edge fall into
/// the `other` bucket, labelled by the lower edge otherwise.
const SCORE_BOUNDARIES: [i64; 8] = [0, 500, 1000, 2000, 3000, 5000, 10_000, 50_000];

const RECENT_EVENTS_LIMIT: usize = 20;
const ERROR_LIST_LIMIT: usize = 50;

/// Computes every dashboard view from windowed store scans. Aggregation
/// happens here rather than in the database so the same code path serves
/// both backends.
#[derive(Clone)]
pub struct MetricsEngine {
    store: Arc<dyn AnalyticsStore>,
}

impl MetricsEngine {
    pub fn new(store: Arc<dyn AnalyticsStore>) -> Self {
        Self { store }
    }

    pub async fn live_overview(&self, minutes: u32, filter: &DimFilter) -> Result<LiveOverview> {
        self.live_overview_at(Utc::now(), minutes, filter).await
    }

    pub async fn live_overview_at(
        &self,
        now: DateTime<Utc>,
        minutes: u32,
        filter: &DimFilter,
    ) -> Result<LiveOverview> {
        let window = Window::open_ended(now - Duration::minutes(i64::from(minutes)));

        let sessions = self
            .store
            .sessions_started_between(window, filter, None)
            .await?;
        let active_sessions = sessions
            .iter()
            .filter(|session| session.ended_at.is_none())
            .count() as u64;

        let runs = self.store.runs_started_between(window, filter, None).await?;
        let runs_per_minute = if minutes > 0 {
            round2(runs.len() as f64 / f64::from(minutes))
        } else {
            0.0
        };

        let events = self.store.events_between(window, None, filter, None).await?;
        let error_count = events
            .iter()
            .filter(|event| event.event_type == EventType::Error)
            .count();
        let crash_rate = if events.is_empty() {
            0.0
        } else {
            round2(error_count as f64 / events.len() as f64 * 100.0)
        };

        let fps_samples: Vec<f64> = events
            .iter()
            .filter(|event| event.event_type == EventType::FpsSample)
            .filter_map(|event| match event.payload() {
                Ok(EventPayload::Fps(sample)) => Some(sample.fps),
                _ => None,
            })
            .collect();
        let avg_fps = if fps_samples.is_empty() {
            60.0
        } else {
            round1(fps_samples.iter().sum::<f64>() / fps_samples.len() as f64)
        };

        let mut deaths_by_cause = BTreeMap::new();
        for run in &runs {
            if let Some(cause) = &run.death_cause {
                *deaths_by_cause.entry(cause.clone()).or_insert(0) += 1;
            }
        }

        // Newest first.
        let recent_events = events
            .iter()
            .rev()
            .take(RECENT_EVENTS_LIMIT)
            .cloned()
            .collect();

        Ok(LiveOverview {
            active_sessions,
            runs_per_minute,
            crash_rate,
            avg_fps,
            deaths_by_cause,
            recent_events,
        })
    }

    pub async fn engagement(&self, days: u32, filter: &DimFilter) -> Result<EngagementMetrics> {
        self.engagement_at(Utc::now(), days, filter).await
    }

    pub async fn engagement_at(
        &self,
        now: DateTime<Utc>,
        days: u32,
        filter: &DimFilter,
    ) -> Result<EngagementMetrics> {
        let window = Window::open_ended(now - Duration::days(i64::from(days)));
        let today = day_start(now.date_naive());

        let sessions = self
            .store
            .sessions_started_between(window, filter, None)
            .await?;

        let mut per_player: HashMap<&str, u64> = HashMap::new();
        for session in &sessions {
            *per_player.entry(session.player_id.as_str()).or_insert(0) += 1;
        }
        let sessions_per_user = if per_player.is_empty() {
            0.0
        } else {
            round2(per_player.values().sum::<u64>() as f64 / per_player.len() as f64)
        };

        let durations: Vec<i64> = sessions
            .iter()
            .filter_map(|session| session.duration_seconds)
            .collect();
        let avg_session_duration = if durations.is_empty() {
            0.0
        } else {
            (durations.iter().sum::<i64>() as f64 / durations.len() as f64).round()
        };

        let funnel = FunnelCounts {
            app_open: self.count_events(window, EventType::AppOpen, filter).await?,
            run_start: self.count_events(window, EventType::RunStart, filter).await?,
            run_end: self.count_events(window, EventType::RunEnd, filter).await?,
        };

        let retention_d1 = self.retention(today, 1).await?;
        let retention_d3 = self.retention(today, 3).await?;
        let retention_d7 = self.retention(today, 7).await?;

        let today_sessions = self
            .store
            .sessions_started_between(Window::open_ended(today), filter, None)
            .await?;
        let daily_active_users = today_sessions
            .iter()
            .map(|session| session.player_id.as_str())
            .collect::<HashSet<_>>()
            .len() as u64;

        Ok(EngagementMetrics {
            sessions_per_user,
            avg_session_duration,
            funnel,
            retention_d1,
            retention_d3,
            retention_d7,
            daily_active_users,
        })
    }

    async fn count_events(
        &self,
        window: Window,
        event_type: EventType,
        filter: &DimFilter,
    ) -> Result<u64> {
        let events = self
            .store
            .events_between(window, Some(event_type), filter, None)
            .await?;
        Ok(events.len() as u64)
    }

    /// Day-N retention: of the players first seen N days ago, the share that
    /// came back exactly N days later. Cohorts are dimension-independent.
    async fn retention(&self, today: DateTime<Utc>, days_ago: i64) -> Result<f64> {
        let cohort_start = today - Duration::days(days_ago);
        let cohort = self
            .store
            .players_first_seen_between(Window::day(cohort_start))
            .await?;
        if cohort.is_empty() {
            return Ok(0.0);
        }
        let cohort_ids: HashSet<&str> = cohort
            .iter()
            .map(|player| player.player_id.as_str())
            .collect();

        let return_start = cohort_start + Duration::days(days_ago);
        let return_sessions = self
            .store
            .sessions_started_between(Window::day(return_start), &DimFilter::default(), None)
            .await?;
        let returned = return_sessions
            .iter()
            .filter(|session| cohort_ids.contains(session.player_id.as_str()))
            .map(|session| session.player_id.as_str())
            .collect::<HashSet<_>>()
            .len();

        Ok(round1(returned as f64 / cohort_ids.len() as f64 * 100.0))
    }

    pub async fn gameplay(&self, days: u32, filter: &DimFilter) -> Result<GameplayMetrics> {
        self.gameplay_at(Utc::now(), days, filter).await
    }

    pub async fn gameplay_at(
        &self,
        now: DateTime<Utc>,
        days: u32,
        filter: &DimFilter,
    ) -> Result<GameplayMetrics> {
        let window = Window::open_ended(now - Duration::days(i64::from(days)));
        let runs = self.store.runs_started_between(window, filter, None).await?;

        let mut bucket_counts: BTreeMap<usize, u64> = BTreeMap::new();
        let mut other_count = 0u64;
        for run in runs.iter().filter(|run| run.score > 0) {
            match SCORE_BOUNDARIES.windows(2).position(|edge| {
                run.score >= edge[0] && run.score < edge[1]
            }) {
                Some(index) => *bucket_counts.entry(index).or_insert(0) += 1,
                None => other_count += 1,
            }
        }
        let mut score_distribution: Vec<ScoreBucket> = bucket_counts
            .into_iter()
            .map(|(index, count)| ScoreBucket {
                bucket: SCORE_BOUNDARIES[index].to_string(),
                count,
            })
            .collect();
        if other_count > 0 {
            score_distribution.push(ScoreBucket {
                bucket: "other".to_string(),
                count: other_count,
            });
        }

        let mut segment_distribution = BTreeMap::new();
        for run in &runs {
            if run.segment_reached != 0 {
                *segment_distribution.entry(run.segment_reached).or_insert(0) += 1;
            }
        }

        let mut death_causes = BTreeMap::new();
        for run in &runs {
            if let Some(cause) = &run.death_cause {
                *death_causes.entry(cause.clone()).or_insert(0) += 1;
            }
        }

        let (perfect_pulse_rate, near_miss_rate) = if runs.is_empty() {
            (0.0, 0.0)
        } else {
            let total = runs.len() as f64;
            let perfect: i64 = runs.iter().map(|run| run.perfect_pulses).sum();
            let near: i64 = runs.iter().map(|run| run.near_misses).sum();
            (round2(perfect as f64 / total), round2(near as f64 / total))
        };

        Ok(GameplayMetrics {
            score_distribution,
            segment_distribution,
            death_causes,
            perfect_pulse_rate,
            near_miss_rate,
        })
    }

    pub async fn economy(&self, days: u32, filter: &DimFilter) -> Result<EconomyMetrics> {
        self.economy_at(Utc::now(), days, filter).await
    }

    pub async fn economy_at(
        &self,
        now: DateTime<Utc>,
        days: u32,
        filter: &DimFilter,
    ) -> Result<EconomyMetrics> {
        let window = Window::open_ended(now - Duration::days(i64::from(days)));

        let earned_events = self
            .store
            .events_between(window, Some(EventType::BlueprintsEarned), filter, None)
            .await?;
        let spent_events = self
            .store
            .events_between(window, Some(EventType::BlueprintsSpent), filter, None)
            .await?;

        let sum_amounts = |events: &[Event]| -> i64 {
            events
                .iter()
                .filter_map(|event| match event.payload() {
                    Ok(EventPayload::Blueprints(delta)) => Some(delta.amount),
                    _ => None,
                })
                .sum()
        };
        let blueprints_earned_total = sum_amounts(&earned_events);
        let blueprints_spent_total = sum_amounts(&spent_events);

        let runs = self.store.runs_started_between(window, filter, None).await?;
        let avg_blueprints_per_run = if runs.is_empty() {
            0.0
        } else {
            round1(blueprints_earned_total as f64 / runs.len() as f64)
        };

        let mut purchases_by_type = BTreeMap::new();
        for event in &spent_events {
            if let Ok(EventPayload::Blueprints(delta)) = event.payload() {
                if let Some(item_type) = delta.item_type {
                    if !item_type.is_empty() {
                        *purchases_by_type.entry(item_type).or_insert(0) += 1;
                    }
                }
            }
        }

        let inflation_indicator = if blueprints_spent_total > 0 {
            round2(blueprints_earned_total as f64 / blueprints_spent_total as f64)
        } else {
            -1.0
        };

        Ok(EconomyMetrics {
            blueprints_earned_total,
            blueprints_spent_total,
            avg_blueprints_per_run,
            purchases_by_type,
            inflation_indicator,
        })
    }

    pub async fn upgrades(&self, days: u32, filter: &DimFilter) -> Result<UpgradeMetrics> {
        self.upgrades_at(Utc::now(), days, filter).await
    }

    pub async fn upgrades_at(
        &self,
        now: DateTime<Utc>,
        days: u32,
        filter: &DimFilter,
    ) -> Result<UpgradeMetrics> {
        let window = Window::open_ended(now - Duration::days(i64::from(days)));

        let count_by_upgrade = |events: Vec<Event>| -> HashMap<String, u64> {
            let mut counts = HashMap::new();
            for event in events {
                if let Ok(EventPayload::Upgrade(upgrade)) = event.payload() {
                    if !upgrade.upgrade_id.is_empty() {
                        *counts.entry(upgrade.upgrade_id).or_insert(0) += 1;
                    }
                }
            }
            counts
        };
        let shown_map = count_by_upgrade(
            self.store
                .events_between(window, Some(EventType::UpgradeShown), filter, None)
                .await?,
        );
        let picked_map = count_by_upgrade(
            self.store
                .events_between(window, Some(EventType::UpgradeSelected), filter, None)
                .await?,
        );

        let mut all_upgrades: HashSet<&str> =
            shown_map.keys().map(String::as_str).collect();
        all_upgrades.extend(picked_map.keys().map(String::as_str));

        let mut shown_vs_picked = Vec::new();
        let mut pick_rates = BTreeMap::new();
        for upgrade_id in all_upgrades {
            let shown = shown_map.get(upgrade_id).copied().unwrap_or(0);
            let picked = picked_map.get(upgrade_id).copied().unwrap_or(0);
            let pick_rate = if shown > 0 {
                round1(picked as f64 / shown as f64 * 100.0)
            } else {
                0.0
            };
            shown_vs_picked.push(UpgradeStat {
                upgrade_id: upgrade_id.to_string(),
                shown,
                picked,
                pick_rate,
            });
            pick_rates.insert(upgrade_id.to_string(), pick_rate);
        }
        shown_vs_picked.sort_by(|a, b| {
            b.picked
                .cmp(&a.picked)
                .then_with(|| a.upgrade_id.cmp(&b.upgrade_id))
        });

        let runs = self.store.runs_started_between(window, filter, None).await?;
        let mut score_sums: HashMap<&str, (i64, u64)> = HashMap::new();
        for run in &runs {
            for upgrade_id in &run.upgrades_selected {
                if upgrade_id.is_empty() {
                    continue;
                }
                let entry = score_sums.entry(upgrade_id.as_str()).or_insert((0, 0));
                entry.0 += run.score;
                entry.1 += 1;
            }
        }
        let score_impact = score_sums
            .into_iter()
            .map(|(upgrade_id, (total, count))| {
                (upgrade_id.to_string(), (total as f64 / count as f64).round())
            })
            .collect();

        Ok(UpgradeMetrics {
            shown_vs_picked,
            pick_rates,
            score_impact,
        })
    }

    pub async fn performance(&self, days: u32, filter: &DimFilter) -> Result<PerformanceMetrics> {
        self.performance_at(Utc::now(), days, filter).await
    }

    pub async fn performance_at(
        &self,
        now: DateTime<Utc>,
        days: u32,
        filter: &DimFilter,
    ) -> Result<PerformanceMetrics> {
        let window = Window::open_ended(now - Duration::days(i64::from(days)));

        let fps_events = self
            .store
            .events_between(window, Some(EventType::FpsSample), filter, None)
            .await?;
        let mut by_device: HashMap<String, (f64, u64)> = HashMap::new();
        let mut by_platform: HashMap<String, (f64, u64)> = HashMap::new();
        for event in &fps_events {
            let Ok(EventPayload::Fps(sample)) = event.payload() else {
                continue;
            };
            let device = event.device.clone().unwrap_or_else(|| "unknown".to_string());
            let entry = by_device.entry(device).or_insert((0.0, 0));
            entry.0 += sample.fps;
            entry.1 += 1;
            let entry = by_platform.entry(event.platform.clone()).or_insert((0.0, 0));
            entry.0 += sample.fps;
            entry.1 += 1;
        }
        let averaged = |groups: HashMap<String, (f64, u64)>| -> BTreeMap<String, f64> {
            groups
                .into_iter()
                .map(|(key, (total, count))| (key, round1(total / count as f64)))
                .collect()
        };

        let errors = self
            .store
            .events_between(window, Some(EventType::Error), filter, None)
            .await?;
        let error_list = errors.iter().rev().take(ERROR_LIST_LIMIT).cloned().collect();

        let sessions = self
            .store
            .sessions_started_between(window, filter, None)
            .await?;
        let mut per_version: HashMap<String, (u64, i64, u64)> = HashMap::new();
        for session in &sessions {
            let entry = per_version
                .entry(session.app_version.clone())
                .or_insert((0, 0, 0));
            entry.0 += 1;
            if let Some(duration) = session.duration_seconds {
                entry.1 += duration;
                entry.2 += 1;
            }
        }
        let version_comparisons = per_version
            .into_iter()
            .map(|(version, (sessions, total_duration, finished))| {
                let avg_duration = if finished > 0 {
                    (total_duration as f64 / finished as f64).round()
                } else {
                    0.0
                };
                (version, VersionStats { sessions, avg_duration })
            })
            .collect();

        Ok(PerformanceMetrics {
            fps_by_device: averaged(by_device),
            fps_by_platform: averaged(by_platform),
            error_list,
            version_comparisons,
        })
    }

    pub async fn daily_summary(&self, date: Option<NaiveDate>) -> Result<DailySummary> {
        self.daily_summary_at(Utc::now(), date).await
    }

    pub async fn daily_summary_at(
        &self,
        now: DateTime<Utc>,
        date: Option<NaiveDate>,
    ) -> Result<DailySummary> {
        let date = date.unwrap_or_else(|| now.date_naive());
        let start = day_start(date);
        let window = Window::day(start);
        let no_filter = DimFilter::default();

        let sessions = self
            .store
            .sessions_started_between(window, &no_filter, None)
            .await?;
        let runs = self.store.runs_started_between(window, &no_filter, None).await?;
        let unique_players = sessions
            .iter()
            .map(|session| session.player_id.as_str())
            .collect::<HashSet<_>>()
            .len() as u64;

        let avg_score = if runs.is_empty() {
            0.0
        } else {
            (runs.iter().map(|run| run.score).sum::<i64>() as f64 / runs.len() as f64).round()
        };
        let blueprints_earned: i64 = runs.iter().map(|run| run.blueprints_earned).sum();

        let mut death_counts: BTreeMap<&str, u64> = BTreeMap::new();
        for run in &runs {
            if let Some(cause) = &run.death_cause {
                *death_counts.entry(cause.as_str()).or_insert(0) += 1;
            }
        }
        // Highest count wins; ties break alphabetically.
        let top_death_cause = death_counts
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(cause, _)| cause.to_string())
            .unwrap_or_else(|| "none".to_string());

        let yesterday = self
            .store
            .sessions_started_between(Window::day(start - Duration::days(1)), &no_filter, None)
            .await?;

        let mut anomalies = Vec::new();
        if !yesterday.is_empty() {
            let change =
                (sessions.len() as f64 - yesterday.len() as f64) / yesterday.len() as f64 * 100.0;
            if change.abs() > 30.0 {
                let change = round1(change);
                let direction = if change > 0.0 { "increased" } else { "decreased" };
                anomalies.push(AnomalyFlag {
                    kind: "sessions".to_string(),
                    change,
                    message: format!("Sessions {} by {}%", direction, change.abs()),
                });
            }
        }

        Ok(DailySummary {
            date: date.format("%Y-%m-%d").to_string(),
            total_sessions: sessions.len() as u64,
            total_runs: runs.len() as u64,
            unique_players,
            avg_score,
            blueprints_earned,
            top_death_cause,
            anomalies,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::IngestReducer;
    use crate::model::{Event, EventBatch, Player, Run, Session};
    use crate::store::MemStore;
    use chrono::TimeZone;
    use serde_json::json;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap()
    }

    fn engine() -> (MetricsEngine, Arc<MemStore>) {
        let store = Arc::new(MemStore::new());
        (MetricsEngine::new(store.clone()), store)
    }

    fn player(id: &str, first_seen: DateTime<Utc>) -> Player {
        Player {
            player_id: id.to_string(),
            first_seen,
            last_seen: first_seen,
            total_sessions: 1,
            total_runs: 0,
            platform: Some("web".to_string()),
            device: None,
            locale: "en".to_string(),
            app_version: "1.0.0".to_string(),
        }
    }

    fn session(id: &str, player_id: &str, started_at: DateTime<Utc>) -> Session {
        Session {
            session_id: id.to_string(),
            player_id: player_id.to_string(),
            started_at,
            ended_at: None,
            duration_seconds: None,
            runs_count: 0,
            app_version: "1.0.0".to_string(),
            platform: "web".to_string(),
            device: None,
        }
    }

    fn run(id: &str, started_at: DateTime<Utc>, score: i64, death_cause: Option<&str>) -> Run {
        let mut run = Run::started(id, "p1", "s1", None, started_at);
        run.score = score;
        run.death_cause = death_cause.map(str::to_string);
        run
    }

    #[tokio::test]
    async fn empty_store_yields_documented_defaults() {
        let (engine, _store) = engine();
        let now = fixed_now();
        let filter = DimFilter::default();

        let live = engine.live_overview_at(now, 15, &filter).await.unwrap();
        assert_eq!(live.active_sessions, 0);
        assert_eq!(live.runs_per_minute, 0.0);
        assert_eq!(live.crash_rate, 0.0);
        assert_eq!(live.avg_fps, 60.0);
        assert!(live.recent_events.is_empty());

        let engagement = engine.engagement_at(now, 7, &filter).await.unwrap();
        assert_eq!(engagement.sessions_per_user, 0.0);
        assert_eq!(engagement.retention_d1, 0.0);
        assert_eq!(engagement.daily_active_users, 0);

        let economy = engine.economy_at(now, 7, &filter).await.unwrap();
        assert_eq!(economy.inflation_indicator, -1.0);
        assert_eq!(economy.avg_blueprints_per_run, 0.0);
    }

    #[tokio::test]
    async fn inflation_is_sentinel_when_earned_but_nothing_spent() {
        let (engine, store) = engine();
        let now = fixed_now();
        store
            .insert_runs(&[run("r1", now - Duration::hours(2), 500, None)])
            .await
            .unwrap();
        let event: Event = serde_json::from_value(json!({
            "event_type": "blueprints_earned",
            "timestamp": now - Duration::hours(1),
            "player_id": "p1",
            "session_id": "s1",
            "properties": {"amount": 120}
        }))
        .unwrap();
        store.append_events(&[event]).await.unwrap();

        let economy = engine
            .economy_at(now, 7, &DimFilter::default())
            .await
            .unwrap();
        assert_eq!(economy.blueprints_earned_total, 120);
        assert_eq!(economy.blueprints_spent_total, 0);
        assert_eq!(economy.avg_blueprints_per_run, 120.0);
        // Division by zero spend is reported as the -1.0 sentinel.
        assert_eq!(economy.inflation_indicator, -1.0);
    }

    #[tokio::test]
    async fn retention_counts_distinct_returning_players() {
        let (engine, store) = engine();
        let now = fixed_now();
        let cohort_day = day_start(now.date_naive()) - Duration::days(1);

        let players: Vec<Player> = (0..10)
            .map(|i| player(&format!("p{}", i), cohort_day + Duration::hours(2)))
            .collect();
        store.insert_players(&players).await.unwrap();

        // Four distinct players return the next day, one of them twice.
        let today = cohort_day + Duration::days(1);
        let mut sessions = Vec::new();
        for (index, pid) in ["p0", "p1", "p2", "p3", "p0"].iter().enumerate() {
            sessions.push(session(
                &format!("s{}", index),
                pid,
                today + Duration::hours(1),
            ));
        }
        store.insert_sessions(&sessions).await.unwrap();

        let metrics = engine
            .engagement_at(now, 7, &DimFilter::default())
            .await
            .unwrap();
        assert_eq!(metrics.retention_d1, 40.0);
    }

    #[tokio::test]
    async fn score_histogram_buckets_and_segment_zero_exclusion() {
        let (engine, store) = engine();
        let now = fixed_now();
        let started = now - Duration::hours(1);

        let mut runs = vec![
            run("r1", started, 100, None),
            run("r2", started, 700, None),
            run("r3", started, 60_000, None),
            run("r4", started, 0, None),
        ];
        runs[3].segment_reached = 0;
        store.insert_runs(&runs).await.unwrap();

        let metrics = engine
            .gameplay_at(now, 7, &DimFilter::default())
            .await
            .unwrap();
        let buckets: Vec<(&str, u64)> = metrics
            .score_distribution
            .iter()
            .map(|bucket| (bucket.bucket.as_str(), bucket.count))
            .collect();
        assert_eq!(buckets, vec![("0", 1), ("500", 1), ("other", 1)]);
        // Unscored run counts for segments, but segment 0 is dropped.
        assert_eq!(metrics.segment_distribution.get(&1), Some(&3));
        assert!(!metrics.segment_distribution.contains_key(&0));
    }

    #[tokio::test]
    async fn pick_rate_is_zero_when_never_shown() {
        let (engine, store) = engine();
        let now = fixed_now();
        let event: Event = serde_json::from_value(json!({
            "event_type": "upgrade_selected",
            "timestamp": now - Duration::hours(1),
            "player_id": "p1",
            "session_id": "s1",
            "properties": {"upgrade_id": "ghost_dash"}
        }))
        .unwrap();
        store.append_events(&[event]).await.unwrap();

        let metrics = engine
            .upgrades_at(now, 7, &DimFilter::default())
            .await
            .unwrap();
        assert_eq!(metrics.shown_vs_picked.len(), 1);
        assert_eq!(metrics.shown_vs_picked[0].picked, 1);
        assert_eq!(metrics.shown_vs_picked[0].pick_rate, 0.0);
        assert_eq!(metrics.pick_rates.get("ghost_dash"), Some(&0.0));
    }

    #[tokio::test]
    async fn daily_summary_from_ingested_batch() {
        let (engine, store) = engine();
        let reducer = IngestReducer::new(store.clone());
        reducer
            .ingest(EventBatch {
                batch_id: None,
                events: vec![
                    serde_json::from_value(json!({
                        "event_type": "session_start",
                        "player_id": "p1",
                        "session_id": "s1"
                    }))
                    .unwrap(),
                    serde_json::from_value(json!({
                        "event_type": "run_start",
                        "player_id": "p1",
                        "session_id": "s1",
                        "run_id": "r1"
                    }))
                    .unwrap(),
                    serde_json::from_value(json!({
                        "event_type": "run_end",
                        "player_id": "p1",
                        "session_id": "s1",
                        "run_id": "r1",
                        "properties": {"score": 1500, "death_cause": "wall", "blueprints_earned": 40}
                    }))
                    .unwrap(),
                ],
            })
            .await
            .unwrap();

        let summary = engine.daily_summary(None).await.unwrap();
        assert_eq!(summary.total_sessions, 1);
        assert_eq!(summary.total_runs, 1);
        assert_eq!(summary.unique_players, 1);
        assert_eq!(summary.avg_score, 1500.0);
        assert_eq!(summary.blueprints_earned, 40);
        assert_eq!(summary.top_death_cause, "wall");
        assert!(summary.anomalies.is_empty());
    }

    #[tokio::test]
    async fn session_spike_raises_anomaly() {
        let (engine, store) = engine();
        let now = fixed_now();
        let today = day_start(now.date_naive());
        let yesterday = today - Duration::days(1);

        let mut sessions = Vec::new();
        for i in 0..10 {
            sessions.push(session(&format!("y{}", i), "p1", yesterday + Duration::hours(3)));
        }
        for i in 0..14 {
            sessions.push(session(&format!("t{}", i), "p1", today + Duration::hours(3)));
        }
        store.insert_sessions(&sessions).await.unwrap();

        let summary = engine
            .daily_summary_at(now, Some(now.date_naive()))
            .await
            .unwrap();
        assert_eq!(summary.anomalies.len(), 1);
        assert_eq!(summary.anomalies[0].kind, "sessions");
        assert_eq!(summary.anomalies[0].change, 40.0);
        assert_eq!(summary.anomalies[0].message, "Sessions increased by 40%");
    }

    #[tokio::test]
    async fn no_anomaly_without_yesterday_baseline() {
        let (engine, store) = engine();
        let now = fixed_now();
        let today = day_start(now.date_naive());
        store
            .insert_sessions(&[session("t0", "p1", today + Duration::hours(3))])
            .await
            .unwrap();
        let summary = engine
            .daily_summary_at(now, Some(now.date_naive()))
            .await
            .unwrap();
        assert!(summary.anomalies.is_empty());
    }

    #[tokio::test]
    async fn top_death_cause_tie_breaks_alphabetically() {
        let (engine, store) = engine();
        let now = fixed_now();
        let started = day_start(now.date_naive()) + Duration::hours(2);
        store
            .insert_runs(&[
                run("r1", started, 10, Some("wall")),
                run("r2", started, 10, Some("wall")),
                run("r3", started, 10, Some("drone")),
                run("r4", started, 10, Some("drone")),
            ])
            .await
            .unwrap();
        let summary = engine
            .daily_summary_at(now, Some(now.date_naive()))
            .await
            .unwrap();
        assert_eq!(summary.top_death_cause, "drone");
    }
}
