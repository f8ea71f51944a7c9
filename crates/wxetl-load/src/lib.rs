//! Schema management + idempotent bulk loading of weather records into Postgres.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgPool, Postgres, QueryBuilder};
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};
use wxetl_core::{
    CurrentWeatherRecord, HourlyForecastRecord, LoadSummary, NaturalKey, Relation, TransformedBatch,
};

pub const CRATE_NAME: &str = "wxetl-load";

/// Postgres caps a single statement at 65535 bind parameters.
const MAX_BIND_PARAMS: usize = 65_535;

pub const CREATE_CURRENT_WEATHER: &str = r#"
CREATE TABLE IF NOT EXISTS current_weather (
    id BIGSERIAL PRIMARY KEY,
    location_name VARCHAR(100) NOT NULL,
    latitude NUMERIC(9, 6),
    longitude NUMERIC(9, 6),
    temperature_celsius NUMERIC(5, 2),
    wind_speed_kmh NUMERIC(6, 2),
    wind_direction_degrees INTEGER,
    weather_code INTEGER,
    observation_time TIMESTAMP,
    extracted_at TIMESTAMPTZ NOT NULL,
    loaded_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP,
    UNIQUE NULLS NOT DISTINCT (location_name, observation_time)
)
"#;

pub const CREATE_HOURLY_WEATHER: &str = r#"
CREATE TABLE IF NOT EXISTS hourly_weather (
    id BIGSERIAL PRIMARY KEY,
    location_name VARCHAR(100) NOT NULL,
    forecast_time TIMESTAMP NOT NULL,
    temperature_celsius NUMERIC(5, 2),
    relative_humidity_percent INTEGER,
    wind_speed_kmh NUMERIC(6, 2),
    loaded_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP,
    UNIQUE (location_name, forecast_time)
)
"#;

const CURRENT_COLUMNS: &[&str] = &[
    "location_name",
    "latitude",
    "longitude",
    "temperature_celsius",
    "wind_speed_kmh",
    "wind_direction_degrees",
    "weather_code",
    "observation_time",
    "extracted_at",
];

const HOURLY_COLUMNS: &[&str] = &[
    "location_name",
    "forecast_time",
    "temperature_celsius",
    "relative_humidity_percent",
    "wind_speed_kmh",
];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    Message(String),
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("connecting to the weather store failed: {0}")]
    Connect(#[source] StoreError),
    #[error("ensuring weather schema failed: {0}")]
    Schema(#[source] StoreError),
    #[error("loading {relation} failed; its batch was rolled back: {source}")]
    Write {
        relation: Relation,
        /// Last stage completed before the write failed.
        reached: LoadStage,
        /// Rows committed by earlier steps of the same load.
        committed: LoadSummary,
        #[source]
        source: StoreError,
    },
}

impl LoadError {
    /// The relation whose write failed, if the failure was a write.
    pub fn relation(&self) -> Option<Relation> {
        match self {
            LoadError::Write { relation, .. } => Some(*relation),
            LoadError::Connect(_) | LoadError::Schema(_) => None,
        }
    }

    /// Last stage the load completed before failing.
    pub fn reached(&self) -> LoadStage {
        match self {
            LoadError::Write { reached, .. } => *reached,
            LoadError::Connect(_) | LoadError::Schema(_) => LoadStage::NotStarted,
        }
    }
}

/// Progress of one load invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStage {
    NotStarted,
    SchemaEnsured,
    CurrentWritten,
    HourlyWritten,
    Complete,
    Failed,
}

/// A deduplicated batch bound for exactly one relation.
#[derive(Debug, Clone, Copy)]
pub enum RelationBatch<'a> {
    Current(&'a [CurrentWeatherRecord]),
    Hourly(&'a [HourlyForecastRecord]),
}

impl RelationBatch<'_> {
    pub fn relation(&self) -> Relation {
        match self {
            RelationBatch::Current(_) => Relation::CurrentWeather,
            RelationBatch::Hourly(_) => Relation::HourlyWeather,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            RelationBatch::Current(records) => records.len(),
            RelationBatch::Hourly(records) => records.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Backing relational store for the load stage.
///
/// Inserts are all-or-nothing per call and skip rows whose natural key already exists,
/// returning only the rows actually inserted.
#[async_trait]
pub trait WeatherStore: Send + Sync {
    async fn ensure_schema(&self) -> Result<(), StoreError>;

    async fn insert_current(&self, records: &[CurrentWeatherRecord]) -> Result<u64, StoreError>;

    async fn insert_hourly(&self, records: &[HourlyForecastRecord]) -> Result<u64, StoreError>;
}

#[derive(Clone)]
pub struct StoreConfig {
    pub database_url: Option<String>,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            host: "localhost".to_string(),
            port: 5432,
            database: "weather_db".to_string(),
            user: "postgres".to_string(),
            password: "postgres".to_string(),
            max_connections: 5,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

impl std::fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreConfig")
            .field("database_url", &self.database_url.as_ref().map(|_| "<redacted>"))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("max_connections", &self.max_connections)
            .field("acquire_timeout", &self.acquire_timeout)
            .finish()
    }
}

impl StoreConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// `DATABASE_URL` wins over the individual `DB_*` variables.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            database_url: lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()),
            host: lookup("DB_HOST").unwrap_or(defaults.host),
            port: lookup("DB_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            database: lookup("DB_NAME").unwrap_or(defaults.database),
            user: lookup("DB_USER").unwrap_or(defaults.user),
            password: lookup("DB_PASSWORD").unwrap_or(defaults.password),
            max_connections: lookup("DB_MAX_CONNECTIONS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_connections),
            acquire_timeout: defaults.acquire_timeout,
        }
    }

    pub fn connect_options(&self) -> Result<PgConnectOptions, StoreError> {
        match &self.database_url {
            Some(url) => Ok(PgConnectOptions::from_str(url)?),
            None => Ok(PgConnectOptions::new()
                .host(&self.host)
                .port(self.port)
                .database(&self.database)
                .username(&self.user)
                .password(&self.password)),
        }
    }

    /// Human-readable target with no credentials, for logs and reports.
    pub fn display_target(&self) -> String {
        match &self.database_url {
            Some(url) => match url.rsplit_once('@') {
                Some((_, rest)) => format!("postgres://<redacted>@{rest}"),
                None => url.clone(),
            },
            None => format!(
                "postgres://{}@{}:{}/{}",
                self.user, self.host, self.port, self.database
            ),
        }
    }
}

/// Postgres-backed store. Each unit of work checks a connection out of the pool
/// and returns it when done.
#[derive(Debug, Clone)]
pub struct PgWeatherStore {
    pool: PgPool,
}

impl PgWeatherStore {
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(config.acquire_timeout)
            .connect_with(config.connect_options()?)
            .await?;
        debug!(target_db = %config.display_target(), "weather store pool established");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run `statements` in one transaction; any failure rolls the whole batch back.
    async fn execute_batch(
        &self,
        relation: Relation,
        statements: Vec<QueryBuilder<'static, Postgres>>,
    ) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;

        for mut statement in statements {
            match statement.build().execute(&mut *tx).await {
                Ok(done) => inserted += done.rows_affected(),
                Err(err) => {
                    if let Err(rollback_err) = tx.rollback().await {
                        warn!(table = %relation, error = %rollback_err, "explicit rollback failed");
                    }
                    return Err(err.into());
                }
            }
        }

        tx.commit().await?;
        Ok(inserted)
    }
}

fn rows_per_statement(column_count: usize) -> usize {
    (MAX_BIND_PARAMS / column_count.max(1)).max(1)
}

fn insert_prefix(relation: Relation, columns: &[&str]) -> String {
    format!("INSERT INTO {} ({}) ", relation.table_name(), columns.join(", "))
}

fn current_insert_statement(chunk: &[CurrentWeatherRecord]) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new(insert_prefix(Relation::CurrentWeather, CURRENT_COLUMNS));
    qb.push_values(chunk, |mut row, r| {
        row.push_bind(r.location_name.clone())
            .push_bind(r.latitude)
            .push_bind(r.longitude)
            .push_bind(r.temperature_celsius)
            .push_bind(r.wind_speed_kmh)
            .push_bind(r.wind_direction_degrees)
            .push_bind(r.weather_code)
            .push_bind(r.observation_time)
            .push_bind(r.extracted_at);
    });
    qb.push(" ON CONFLICT (location_name, observation_time) DO NOTHING");
    qb
}

fn hourly_insert_statement(chunk: &[HourlyForecastRecord]) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new(insert_prefix(Relation::HourlyWeather, HOURLY_COLUMNS));
    qb.push_values(chunk, |mut row, r| {
        row.push_bind(r.location_name.clone())
            .push_bind(r.forecast_time)
            .push_bind(r.temperature_celsius)
            .push_bind(r.relative_humidity_percent)
            .push_bind(r.wind_speed_kmh);
    });
    qb.push(" ON CONFLICT (location_name, forecast_time) DO NOTHING");
    qb
}

#[async_trait]
impl WeatherStore for PgWeatherStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(CREATE_CURRENT_WEATHER).execute(&mut *tx).await?;
        sqlx::query(CREATE_HOURLY_WEATHER).execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn insert_current(&self, records: &[CurrentWeatherRecord]) -> Result<u64, StoreError> {
        let statements = records
            .chunks(rows_per_statement(CURRENT_COLUMNS.len()))
            .map(current_insert_statement)
            .collect();
        self.execute_batch(Relation::CurrentWeather, statements).await
    }

    async fn insert_hourly(&self, records: &[HourlyForecastRecord]) -> Result<u64, StoreError> {
        let statements = records
            .chunks(rows_per_statement(HOURLY_COLUMNS.len()))
            .map(hourly_insert_statement)
            .collect();
        self.execute_batch(Relation::HourlyWeather, statements).await
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    schema_ready: bool,
    current: Vec<CurrentWeatherRecord>,
    hourly: Vec<HourlyForecastRecord>,
    write_calls: HashMap<Relation, usize>,
}

/// In-process store with the same uniqueness and atomicity rules as Postgres.
///
/// Used for dry runs; failures can be injected per relation.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    fail_schema: bool,
    fail_relation: Option<Relation>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_schema() -> Self {
        Self {
            fail_schema: true,
            ..Self::default()
        }
    }

    pub fn failing_on(relation: Relation) -> Self {
        Self {
            fail_relation: Some(relation),
            ..Self::default()
        }
    }

    pub fn current_rows(&self) -> Vec<CurrentWeatherRecord> {
        self.lock().current.clone()
    }

    pub fn hourly_rows(&self) -> Vec<HourlyForecastRecord> {
        self.lock().hourly.clone()
    }

    /// Number of insert calls that reached the store for `relation`.
    pub fn write_calls(&self, relation: Relation) -> usize {
        self.lock().write_calls.get(&relation).copied().unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin_write(&self, state: &mut MemoryState, relation: Relation) -> Result<(), StoreError> {
        *state.write_calls.entry(relation).or_default() += 1;
        if !state.schema_ready {
            return Err(StoreError::Message(format!(
                "relation \"{relation}\" does not exist"
            )));
        }
        if self.fail_relation == Some(relation) {
            return Err(StoreError::Message(format!("injected write failure for {relation}")));
        }
        Ok(())
    }
}

fn insert_absent<T: NaturalKey + Clone>(existing: &mut Vec<T>, incoming: &[T]) -> u64 {
    let mut keys: HashSet<T::Key> = existing.iter().map(NaturalKey::natural_key).collect();
    let mut inserted = 0u64;
    for record in incoming {
        if keys.insert(record.natural_key()) {
            existing.push(record.clone());
            inserted += 1;
        }
    }
    inserted
}

#[async_trait]
impl WeatherStore for MemoryStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        if self.fail_schema {
            return Err(StoreError::Message("permission denied for schema public".to_string()));
        }
        self.lock().schema_ready = true;
        Ok(())
    }

    async fn insert_current(&self, records: &[CurrentWeatherRecord]) -> Result<u64, StoreError> {
        let mut state = self.lock();
        self.begin_write(&mut state, Relation::CurrentWeather)?;
        Ok(insert_absent(&mut state.current, records))
    }

    async fn insert_hourly(&self, records: &[HourlyForecastRecord]) -> Result<u64, StoreError> {
        let mut state = self.lock();
        self.begin_write(&mut state, Relation::HourlyWeather)?;
        Ok(insert_absent(&mut state.hourly, records))
    }
}

/// Persist one relation's batch in a single atomic insert. Empty batches never reach the store.
pub async fn upsert<S>(store: &S, batch: RelationBatch<'_>) -> Result<u64, StoreError>
where
    S: WeatherStore + ?Sized,
{
    let relation = batch.relation();
    if batch.is_empty() {
        warn!(table = %relation, "no data to load into {relation}");
        return Ok(0);
    }

    let span = info_span!("upsert", table = %relation, rows = batch.len());
    let result = async {
        match batch {
            RelationBatch::Current(records) => store.insert_current(records).await,
            RelationBatch::Hourly(records) => store.insert_hourly(records).await,
        }
    }
    .instrument(span)
    .await;

    match result {
        Ok(inserted) => {
            let skipped = (batch.len() as u64).saturating_sub(inserted);
            info!(table = %relation, inserted, skipped, "loaded {inserted} rows into {relation}");
            Ok(inserted)
        }
        Err(err) => {
            error!(table = %relation, error = %err, "failed to load data into {relation}");
            Err(err)
        }
    }
}

fn advance(stage: &mut LoadStage, next: LoadStage) {
    debug!(from = ?*stage, to = ?next, "load stage transition");
    *stage = next;
}

/// Ensure the schema, then write current and hourly records in that order.
///
/// A failing step aborts the steps after it; writes committed before the failure stay.
pub async fn load<S>(batch: &TransformedBatch, store: &S) -> Result<LoadSummary, LoadError>
where
    S: WeatherStore + ?Sized,
{
    let mut stage = LoadStage::NotStarted;
    let mut summary = LoadSummary::default();

    if let Err(err) = store.ensure_schema().await {
        advance(&mut stage, LoadStage::Failed);
        return Err(LoadError::Schema(err));
    }
    info!("weather schema ensured");
    advance(&mut stage, LoadStage::SchemaEnsured);

    summary.current_weather = match upsert(store, RelationBatch::Current(&batch.current)).await {
        Ok(rows) => rows,
        Err(source) => {
            let reached = stage;
            advance(&mut stage, LoadStage::Failed);
            return Err(LoadError::Write {
                relation: Relation::CurrentWeather,
                reached,
                committed: summary,
                source,
            });
        }
    };
    advance(&mut stage, LoadStage::CurrentWritten);

    summary.hourly_weather = match upsert(store, RelationBatch::Hourly(&batch.hourly)).await {
        Ok(rows) => rows,
        Err(source) => {
            let reached = stage;
            advance(&mut stage, LoadStage::Failed);
            return Err(LoadError::Write {
                relation: Relation::HourlyWeather,
                reached,
                committed: summary,
                source,
            });
        }
    };
    advance(&mut stage, LoadStage::HourlyWritten);
    advance(&mut stage, LoadStage::Complete);

    Ok(summary)
}

/// Connect with `config`, then [`load`].
pub async fn load_with_config(
    batch: &TransformedBatch,
    config: &StoreConfig,
) -> Result<LoadSummary, LoadError> {
    let store = PgWeatherStore::connect(config)
        .await
        .map_err(LoadError::Connect)?;
    load(batch, &store).await
}
