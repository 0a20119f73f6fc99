use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use time::OffsetDateTime;

pub fn parse_date(value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|err| anyhow!("invalid date '{}': {}", value, err))
}

/// Midnight-aligned UTC start of the given calendar day.
pub fn day_start(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN))
}

pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

// ClickHouse rows carry `time::OffsetDateTime` (DateTime64 serde), the domain
// uses `chrono`. Conversions go through unix millis, matching the column
// precision.

pub fn utc_to_time(value: DateTime<Utc>) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(value.timestamp_millis()) * 1_000_000)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

pub fn time_to_utc(value: OffsetDateTime) -> DateTime<Utc> {
    DateTime::from_timestamp_millis((value.unix_timestamp_nanos() / 1_000_000) as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_date_accepts_iso_day() {
        let date = parse_date("2024-03-01").unwrap();
        assert_eq!(date, NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
        assert!(parse_date("03/01/2024").is_err());
    }

    #[test]
    fn time_conversion_round_trips_millis() {
        let now = Utc::now();
        let back = time_to_utc(utc_to_time(now));
        assert_eq!(back.timestamp_millis(), now.timestamp_millis());
    }
}
