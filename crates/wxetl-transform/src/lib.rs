//! Payload normalization + natural-key deduplication.
//!
//! Everything here is pure: no clock reads except in [`transform`], no I/O.

use std::collections::HashSet;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};
use wxetl_core::{
    CurrentWeatherRecord, HourlyForecastRecord, NaturalKey, RawObservation, TransformedBatch,
};

pub const CRATE_NAME: &str = "wxetl-transform";

const API_TIME_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"];

fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

fn json_f64(value: &JsonValue, path: &[&str]) -> Option<f64> {
    json_at(value, path)?.as_f64()
}

fn json_i32(value: &JsonValue, path: &[&str]) -> Option<i32> {
    json_at(value, path).and_then(as_i32)
}

fn json_timestamp(value: &JsonValue, path: &[&str]) -> Option<NaiveDateTime> {
    json_at(value, path)?.as_str().and_then(parse_api_time)
}

fn json_array<'a>(value: &'a JsonValue, path: &[&str]) -> &'a [JsonValue] {
    json_at(value, path)
        .and_then(JsonValue::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

/// Integral JSON numbers only; `180.0` is accepted, `180.5` is not.
fn as_i32(value: &JsonValue) -> Option<i32> {
    if let Some(n) = value.as_i64() {
        return i32::try_from(n).ok();
    }
    let f = value.as_f64()?;
    if f.fract() == 0.0 && f >= f64::from(i32::MIN) && f <= f64::from(i32::MAX) {
        Some(f as i32)
    } else {
        None
    }
}

/// Open-Meteo reports local wall-clock time without an offset (`timezone=auto`).
pub fn parse_api_time(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    API_TIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .or_else(|| {
            DateTime::parse_from_rfc3339(text)
                .ok()
                .map(|dt| dt.naive_local())
        })
}

pub fn normalize_current(raw: &RawObservation, loaded_at: DateTime<Utc>) -> CurrentWeatherRecord {
    let payload = &raw.payload;
    CurrentWeatherRecord {
        location_name: raw.location_name.clone(),
        latitude: json_f64(payload, &["latitude"]),
        longitude: json_f64(payload, &["longitude"]),
        temperature_celsius: json_f64(payload, &["current_weather", "temperature"]),
        wind_speed_kmh: json_f64(payload, &["current_weather", "windspeed"]),
        wind_direction_degrees: json_i32(payload, &["current_weather", "winddirection"]),
        weather_code: json_i32(payload, &["current_weather", "weathercode"]),
        observation_time: json_timestamp(payload, &["current_weather", "time"]),
        extracted_at: raw.extracted_at,
        loaded_at,
    }
}

/// One record per entry of `hourly.time`; shorter sibling arrays yield nulls.
///
/// A time entry that is not a timestamp cannot form a natural key and is skipped. That is the
/// only case in which the output is shorter than `hourly.time`.
pub fn normalize_hourly(
    raw: &RawObservation,
    loaded_at: DateTime<Utc>,
) -> Vec<HourlyForecastRecord> {
    let payload = &raw.payload;
    let times = json_array(payload, &["hourly", "time"]);
    let temperatures = json_array(payload, &["hourly", "temperature_2m"]);
    let humidity = json_array(payload, &["hourly", "relative_humidity_2m"]);
    let wind_speeds = json_array(payload, &["hourly", "wind_speed_10m"]);

    times
        .iter()
        .enumerate()
        .filter_map(|(i, time)| {
            let Some(forecast_time) = time.as_str().and_then(parse_api_time) else {
                warn!(
                    location = %raw.location_name,
                    index = i,
                    value = %time,
                    "skipping unparseable forecast time"
                );
                return None;
            };
            Some(HourlyForecastRecord {
                location_name: raw.location_name.clone(),
                forecast_time,
                temperature_celsius: temperatures.get(i).and_then(JsonValue::as_f64),
                relative_humidity_percent: humidity.get(i).and_then(as_i32),
                wind_speed_kmh: wind_speeds.get(i).and_then(JsonValue::as_f64),
                loaded_at,
            })
        })
        .collect()
}

/// Keep the first record seen for each natural key, preserving input order.
pub fn dedup_by_natural_key<T: NaturalKey>(records: Vec<T>) -> Vec<T> {
    let mut seen = HashSet::with_capacity(records.len());
    let before = records.len();
    let kept: Vec<T> = records
        .into_iter()
        .filter(|record| seen.insert(record.natural_key()))
        .collect();
    if kept.len() < before {
        debug!(dropped = before - kept.len(), kept = kept.len(), "dropped duplicate natural keys");
    }
    kept
}

/// Normalize every raw entry, then deduplicate each record kind across the whole batch.
pub fn transform_at(raw_batch: &[RawObservation], loaded_at: DateTime<Utc>) -> TransformedBatch {
    let mut current = Vec::with_capacity(raw_batch.len());
    let mut hourly = Vec::new();

    for raw in raw_batch {
        current.push(normalize_current(raw, loaded_at));
        hourly.extend(normalize_hourly(raw, loaded_at));
    }

    let current = dedup_by_natural_key(current);
    let hourly = dedup_by_natural_key(hourly);

    info!(records = current.len(), "transformed current weather records");
    info!(records = hourly.len(), "transformed hourly weather records");

    TransformedBatch { current, hourly }
}

pub fn transform(raw_batch: &[RawObservation]) -> TransformedBatch {
    transform_at(raw_batch, Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};
    use serde_json::json;
    use std::path::{Path, PathBuf};

    fn loaded_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, 12, 30, 0).single().unwrap()
    }

    fn local(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 1, 15)
            .and_then(|d| d.and_hms_opt(h, m, 0))
            .unwrap()
    }

    fn raw(location: &str, payload: JsonValue) -> RawObservation {
        RawObservation {
            location_name: location.to_string(),
            extracted_at: Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).single().unwrap(),
            payload,
        }
    }

    fn london() -> RawObservation {
        raw(
            "London",
            json!({
                "latitude": 51.5074,
                "longitude": 0.1278,
                "current_weather": {
                    "temperature": 15.5,
                    "windspeed": 10.2,
                    "winddirection": 180,
                    "weathercode": 1,
                    "time": "2025-01-15T12:00"
                }
            }),
        )
    }

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    #[test]
    fn current_weather_fields_are_mapped() {
        let record = normalize_current(&london(), loaded_at());
        assert_eq!(record.location_name, "London");
        assert_eq!(record.latitude, Some(51.5074));
        assert_eq!(record.longitude, Some(0.1278));
        assert_eq!(record.temperature_celsius, Some(15.5));
        assert_eq!(record.wind_speed_kmh, Some(10.2));
        assert_eq!(record.wind_direction_degrees, Some(180));
        assert_eq!(record.weather_code, Some(1));
        assert_eq!(record.observation_time, Some(local(12, 0)));
        assert_eq!(record.loaded_at, loaded_at());
    }

    #[test]
    fn empty_current_block_yields_null_fields() {
        let input = raw("Unknown", json!({ "current_weather": {} }));
        let record = normalize_current(&input, loaded_at());
        assert_eq!(record.location_name, "Unknown");
        assert_eq!(record.temperature_celsius, None);
        assert_eq!(record.wind_speed_kmh, None);
        assert_eq!(record.wind_direction_degrees, None);
        assert_eq!(record.weather_code, None);
        assert_eq!(record.observation_time, None);
        assert_eq!(record.latitude, None);
    }

    #[test]
    fn wrongly_typed_payload_does_not_fail() {
        let entry = raw(
            "Odd",
            json!({
                "latitude": "north",
                "current_weather": "unavailable",
                "hourly": { "time": "2025-01-15T00:00" }
            }),
        );
        let batch = transform_at(&[entry], loaded_at());
        assert_eq!(batch.current.len(), 1);
        assert_eq!(batch.current[0].latitude, None);
        assert_eq!(batch.current[0].temperature_celsius, None);
        assert!(batch.hourly.is_empty());
    }

    #[test]
    fn integral_floats_are_accepted_for_integer_columns() {
        let entry = raw(
            "Paris",
            json!({ "current_weather": { "winddirection": 270.0, "weathercode": 3.5 } }),
        );
        let record = normalize_current(&entry, loaded_at());
        assert_eq!(record.wind_direction_degrees, Some(270));
        assert_eq!(record.weather_code, None);
    }

    #[test]
    fn ragged_hourly_arrays_fill_nulls_up_to_time_length() {
        let entry = raw(
            "London",
            json!({
                "hourly": {
                    "time": ["2025-01-15T00:00", "2025-01-15T01:00", "2025-01-15T02:00"],
                    "temperature_2m": [6.1],
                    "relative_humidity_2m": [87, 88, 90, 91],
                    "wind_speed_10m": []
                }
            }),
        );
        let records = normalize_hourly(&entry, loaded_at());
        assert_eq!(records.len(), 3);
        assert_eq!(
            records.iter().map(|r| r.forecast_time).collect::<Vec<_>>(),
            vec![local(0, 0), local(1, 0), local(2, 0)]
        );
        assert_eq!(records[0].temperature_celsius, Some(6.1));
        assert_eq!(records[1].temperature_celsius, None);
        assert_eq!(records[2].temperature_celsius, None);
        assert_eq!(records[2].relative_humidity_percent, Some(90));
        assert!(records.iter().all(|r| r.wind_speed_kmh.is_none()));
    }

    #[test]
    fn unparseable_forecast_times_are_skipped_without_shifting_values() {
        let entry = raw(
            "London",
            json!({
                "hourly": {
                    "time": ["2025-01-15T00:00", null, "2025-01-15T02:00"],
                    "temperature_2m": [6.1, 5.8, 5.4]
                }
            }),
        );
        let records = normalize_hourly(&entry, loaded_at());
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].forecast_time, local(2, 0));
        assert_eq!(records[1].temperature_celsius, Some(5.4));
    }

    #[test]
    fn missing_hourly_block_yields_no_forecasts() {
        assert!(normalize_hourly(&london(), loaded_at()).is_empty());
    }

    #[test]
    fn api_time_parsing_accepts_minute_and_second_precision() {
        assert_eq!(parse_api_time("2025-01-15T12:00"), Some(local(12, 0)));
        assert_eq!(parse_api_time("2025-01-15T12:00:00"), Some(local(12, 0)));
        assert_eq!(parse_api_time("2025-01-15T12:00:00+01:00"), Some(local(12, 0)));
        assert_eq!(parse_api_time("yesterday"), None);
        assert_eq!(parse_api_time(""), None);
    }

    #[test]
    fn dedup_keeps_first_occurrence_in_input_order() {
        let mut first = normalize_current(&london(), loaded_at());
        first.temperature_celsius = Some(1.0);
        let mut second = first.clone();
        second.temperature_celsius = Some(2.0);
        let other = normalize_current(&raw("Tokyo", json!({})), loaded_at());

        let kept = dedup_by_natural_key(vec![first.clone(), other.clone(), second]);
        assert_eq!(kept, vec![first, other]);
    }

    #[test]
    fn duplicate_raw_entries_collapse_to_one_current_record() {
        let batch = transform_at(&[london(), london()], loaded_at());
        assert_eq!(batch.current.len(), 1);
        assert_eq!(batch.current[0].location_name, "London");
    }

    #[test]
    fn same_observation_time_in_different_locations_is_kept() {
        let mut tokyo = london();
        tokyo.location_name = "Tokyo".into();
        let batch = transform_at(&[london(), tokyo], loaded_at());
        assert_eq!(batch.current.len(), 2);
    }

    #[test]
    fn fixture_payload_transforms_end_to_end() {
        let path = workspace_root().join("fixtures/open-meteo/london.json");
        let text = std::fs::read_to_string(&path).expect("read fixture");
        let entry: RawObservation = serde_json::from_str(&text).expect("parse fixture");

        let batch = transform_at(&[entry.clone(), entry], loaded_at());
        assert_eq!(batch.current.len(), 1);
        assert_eq!(batch.hourly.len(), 6);

        let current = &batch.current[0];
        assert_eq!(current.temperature_celsius, Some(15.5));
        assert_eq!(current.weather_code, Some(1));
        assert_eq!(current.observation_time, Some(local(12, 0)));

        let last = batch.hourly.last().unwrap();
        assert_eq!(last.forecast_time, local(5, 0));
        assert_eq!(last.relative_humidity_percent, Some(92));
        assert_eq!(last.wind_speed_kmh, None);
        assert!(batch
            .hourly
            .windows(2)
            .all(|w| w[0].forecast_time < w[1].forecast_time));
    }
}
