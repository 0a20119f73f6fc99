use anyhow::Result;
use chrono::{DateTime, Duration, NaiveDate, SecondsFormat, Utc};

use crate::model::{Event, Run};
use crate::store::Window;
use crate::utils::day_start;

pub const EVENT_EXPORT_LIMIT: usize = 10_000;
pub const RUN_EXPORT_LIMIT: usize = 5_000;

const EVENT_COLUMNS: [&str; 12] = [
    "timestamp",
    "event_type",
    "player_id",
    "session_id",
    "run_id",
    "app_version",
    "platform",
    "device",
    "locale",
    "seed",
    "batch_id",
    "properties",
];

const RUN_COLUMNS: [&str; 16] = [
    "run_id",
    "player_id",
    "session_id",
    "started_at",
    "ended_at",
    "duration_seconds",
    "score",
    "blueprints_earned",
    "perfect_pulses",
    "near_misses",
    "phase_throughs",
    "damage_taken",
    "death_cause",
    "segment_reached",
    "upgrades_selected",
    "seed",
];

/// Date-bounded export window. `date_to` is inclusive of the whole day.
pub fn export_window(date_from: Option<NaiveDate>, date_to: Option<NaiveDate>) -> Window {
    let since = date_from.map(day_start).unwrap_or(DateTime::<Utc>::MIN_UTC);
    Window {
        since,
        until: date_to.map(|date| day_start(date) + Duration::days(1)),
    }
}

pub fn events_csv(events: &[Event]) -> Result<String> {
    let mut out = String::new();
    write_row(&mut out, EVENT_COLUMNS.iter().map(|s| s.to_string()));
    for event in events {
        let fields = [
            rfc3339(event.timestamp),
            event.event_type.as_str().to_string(),
            event.player_id.clone(),
            event.session_id.clone(),
            event.run_id.clone().unwrap_or_default(),
            event.app_version.clone(),
            event.platform.clone(),
            event.device.clone().unwrap_or_default(),
            event.locale.clone(),
            event.seed.clone().unwrap_or_default(),
            event.batch_id.clone().unwrap_or_default(),
            serde_json::to_string(&event.properties)?,
        ];
        write_row(&mut out, fields.into_iter());
    }
    Ok(out)
}

pub fn runs_csv(runs: &[Run]) -> Result<String> {
    let mut out = String::new();
    write_row(&mut out, RUN_COLUMNS.iter().map(|s| s.to_string()));
    for run in runs {
        let fields = [
            run.run_id.clone(),
            run.player_id.clone(),
            run.session_id.clone(),
            rfc3339(run.started_at),
            run.ended_at.map(rfc3339).unwrap_or_default(),
            run.duration_seconds
                .map(|seconds| seconds.to_string())
                .unwrap_or_default(),
            run.score.to_string(),
            run.blueprints_earned.to_string(),
            run.perfect_pulses.to_string(),
            run.near_misses.to_string(),
            run.phase_throughs.to_string(),
            run.damage_taken.to_string(),
            run.death_cause.clone().unwrap_or_default(),
            run.segment_reached.to_string(),
            serde_json::to_string(&run.upgrades_selected)?,
            run.seed.clone().unwrap_or_default(),
        ];
        write_row(&mut out, fields.into_iter());
    }
    Ok(out)
}

fn rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn write_row(out: &mut String, fields: impl Iterator<Item = String>) {
    let mut first = true;
    for field in fields {
        if !first {
            out.push(',');
        }
        first = false;
        out.push_str(&quote(&field));
    }
    out.push_str("\r\n");
}

fn quote(field: &str) -> String {
    if field.contains(['"', ',', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn quoting_escapes_delimiters_and_quotes() {
        assert_eq!(quote("plain"), "plain");
        assert_eq!(quote("a,b"), "\"a,b\"");
        assert_eq!(quote("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(quote("line\nbreak"), "\"line\nbreak\"");
    }

    #[test]
    fn events_csv_has_header_and_json_properties() {
        let event: Event = serde_json::from_value(json!({
            "event_type": "run_end",
            "timestamp": "2024-06-15T12:00:00Z",
            "player_id": "p1",
            "session_id": "s1",
            "run_id": "r1",
            "properties": {"score": 1500}
        }))
        .unwrap();
        let csv = events_csv(&[event]).unwrap();
        let mut lines = csv.lines();
        assert_eq!(lines.next().unwrap().split(',').next(), Some("timestamp"));
        let row = lines.next().unwrap();
        assert!(row.contains("run_end"));
        // Properties are embedded as a quoted JSON object.
        assert!(row.contains("\"{\"\"score\"\":1500}\""));
    }

    #[test]
    fn runs_csv_serializes_optional_fields_empty() {
        let started = Utc.with_ymd_and_hms(2024, 6, 15, 10, 0, 0).unwrap();
        let run = Run::started("r1", "p1", "s1", None, started);
        let csv = runs_csv(&[run]).unwrap();
        let row = csv.lines().nth(1).unwrap();
        let fields: Vec<&str> = row.split(',').collect();
        assert_eq!(fields[0], "r1");
        // ended_at and duration_seconds are blank for an open run.
        assert_eq!(fields[4], "");
        assert_eq!(fields[5], "");
    }

    #[test]
    fn runs_csv_embeds_upgrades_selected_and_seed() {
        let started = Utc.with_ymd_and_hms(2024, 6, 15, 10, 0, 0).unwrap();
        let mut run = Run::started("r1", "p1", "s1", Some("seed-42".to_string()), started);
        run.upgrades_selected = vec!["ghost_dash".to_string(), "magnet".to_string()];
        let csv = runs_csv(&[run]).unwrap();
        let header = csv.lines().next().unwrap();
        assert!(header.ends_with("segment_reached,upgrades_selected,seed"));
        let row = csv.lines().nth(1).unwrap();
        // The upgrade list is one quoted JSON array field.
        assert!(row.contains("\"[\"\"ghost_dash\"\",\"\"magnet\"\"]\""));
        assert!(row.ends_with(",seed-42"));
    }

    #[test]
    fn export_window_is_inclusive_of_the_to_day() {
        let from = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let to = NaiveDate::from_ymd_opt(2024, 6, 2).unwrap();
        let window = export_window(Some(from), Some(to));
        assert!(window.contains(Utc.with_ymd_and_hms(2024, 6, 2, 23, 59, 59).unwrap()));
        assert!(!window.contains(Utc.with_ymd_and_hms(2024, 6, 3, 0, 0, 0).unwrap()));
        let open = export_window(None, None);
        assert!(open.contains(Utc.with_ymd_and_hms(1999, 1, 1, 0, 0, 0).unwrap()));
    }
}
