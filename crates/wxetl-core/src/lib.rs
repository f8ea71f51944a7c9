//! Core record model shared by the extract, transform and load stages.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "wxetl-core";

/// A geographic point the pipeline extracts weather for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl Location {
    pub fn new(name: impl Into<String>, latitude: f64, longitude: f64) -> Self {
        Self {
            name: name.into(),
            latitude,
            longitude,
        }
    }
}

/// One location-scoped API response as captured by extraction.
///
/// The payload is kept opaque; only the normalizer interprets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawObservation {
    pub location_name: String,
    pub extracted_at: DateTime<Utc>,
    pub payload: JsonValue,
}

pub type RawObservationBatch = Vec<RawObservation>;

/// Records whose storage uniqueness is defined by a natural key.
pub trait NaturalKey {
    type Key: Eq + std::hash::Hash + Clone;

    fn natural_key(&self) -> Self::Key;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentWeatherRecord {
    pub location_name: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub temperature_celsius: Option<f64>,
    pub wind_speed_kmh: Option<f64>,
    pub wind_direction_degrees: Option<i32>,
    pub weather_code: Option<i32>,
    /// Local time at the location, as reported by the API.
    pub observation_time: Option<NaiveDateTime>,
    pub extracted_at: DateTime<Utc>,
    /// Normalization-time placeholder; the store stamps the persisted row itself.
    pub loaded_at: DateTime<Utc>,
}

impl NaturalKey for CurrentWeatherRecord {
    type Key = (String, Option<NaiveDateTime>);

    fn natural_key(&self) -> Self::Key {
        (self.location_name.clone(), self.observation_time)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlyForecastRecord {
    pub location_name: String,
    pub forecast_time: NaiveDateTime,
    pub temperature_celsius: Option<f64>,
    pub relative_humidity_percent: Option<i32>,
    pub wind_speed_kmh: Option<f64>,
    pub loaded_at: DateTime<Utc>,
}

impl NaturalKey for HourlyForecastRecord {
    type Key = (String, NaiveDateTime);

    fn natural_key(&self) -> Self::Key {
        (self.location_name.clone(), self.forecast_time)
    }
}

/// Output of the transform stage and input of the load stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformedBatch {
    pub current: Vec<CurrentWeatherRecord>,
    pub hourly: Vec<HourlyForecastRecord>,
}

impl TransformedBatch {
    pub fn is_empty(&self) -> bool {
        self.current.is_empty() && self.hourly.is_empty()
    }
}

/// Target relations owned by the load stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    CurrentWeather,
    HourlyWeather,
}

impl Relation {
    pub fn table_name(self) -> &'static str {
        match self {
            Relation::CurrentWeather => "current_weather",
            Relation::HourlyWeather => "hourly_weather",
        }
    }
}

impl std::fmt::Display for Relation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.table_name())
    }
}

/// Rows actually inserted per relation by one load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadSummary {
    pub current_weather: u64,
    pub hourly_weather: u64,
}

impl LoadSummary {
    pub fn rows_for(&self, relation: Relation) -> u64 {
        match relation {
            Relation::CurrentWeather => self.current_weather,
            Relation::HourlyWeather => self.hourly_weather,
        }
    }

    pub fn total(&self) -> u64 {
        self.current_weather + self.hourly_weather
    }
}
