//! Sync pipeline orchestration: extract from Open-Meteo, transform, load, report.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;
use wxetl_core::{LoadSummary, Location, RawObservation, RawObservationBatch, TransformedBatch};
use wxetl_load::{LoadError, MemoryStore, StoreConfig};
use wxetl_storage::{
    BackoffPolicy, FetchError, HandoffDocument, HandoffStore, HttpClientConfig, HttpFetcher,
    Stage, Url,
};

pub const CRATE_NAME: &str = "wxetl-sync";

pub const DEFAULT_API_BASE_URL: &str = "https://api.open-meteo.com/v1/forecast";

const HOURLY_VARIABLES: &str = "temperature_2m,relative_humidity_2m,wind_speed_10m";

/// How a failed run is re-attempted by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay: Duration::from_secs(5 * 60),
        }
    }
}

impl RetryPolicy {
    /// Run `op` until it succeeds or `max_retries` re-attempts are spent.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0usize;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_retries => {
                    warn!(
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        delay_secs = self.delay.as_secs(),
                        error = %format!("{err:#}"),
                        "sync run failed; retrying"
                    );
                    tokio::time::sleep(self.delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub api_base_url: String,
    pub locations_file: PathBuf,
    pub artifacts_dir: PathBuf,
    pub reports_enabled: bool,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub retry: RetryPolicy,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    /// Per-request retries for transient HTTP failures, separate from whole-run retries.
    pub http_retries: u32,
    pub workspace_root: PathBuf,
    pub store: StoreConfig,
}

fn truthy(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "TRUE" | "True" | "yes")
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let workspace_root = lookup("WXETL_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let defaults = RetryPolicy::default();
        Self {
            api_base_url: lookup("WXETL_API_BASE_URL")
                .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string()),
            locations_file: lookup("WXETL_LOCATIONS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| workspace_root.join("locations.yaml")),
            artifacts_dir: lookup("ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./artifacts")),
            reports_enabled: lookup("WXETL_REPORTS").map(|v| truthy(&v)).unwrap_or(true),
            scheduler_enabled: lookup("WXETL_SCHEDULER_ENABLED")
                .map(|v| truthy(&v))
                .unwrap_or(false),
            sync_cron: lookup("SYNC_CRON").unwrap_or_else(|| "0 0 6 * * *".to_string()),
            retry: RetryPolicy {
                max_retries: lookup("WXETL_RETRIES")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(defaults.max_retries),
                delay: lookup("WXETL_RETRY_DELAY_SECS")
                    .and_then(|v| v.parse().ok())
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.delay),
            },
            user_agent: lookup("WXETL_USER_AGENT").unwrap_or_else(|| "wxetl/0.1".to_string()),
            http_timeout_secs: lookup("WXETL_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            http_retries: lookup("WXETL_HTTP_RETRIES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(BackoffPolicy::default().max_retries),
            workspace_root,
            store: StoreConfig::from_lookup(&lookup),
        }
    }

    pub fn reports_root(&self) -> PathBuf {
        self.workspace_root.join("reports")
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LocationRegistry {
    pub locations: Vec<Location>,
}

impl Default for LocationRegistry {
    fn default() -> Self {
        Self {
            locations: vec![
                Location::new("London", 51.5074, -0.1278),
                Location::new("New York", 40.7128, -74.0060),
                Location::new("Tokyo", 35.6762, 139.6503),
            ],
        }
    }
}

impl LocationRegistry {
    /// Read the registry YAML, or fall back to the built-in locations if the file is absent.
    pub async fn load(path: &Path) -> Result<Self> {
        if !fs::try_exists(path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            info!(path = %path.display(), "no locations file; using built-in locations");
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("invalid API base url {url}: {message}")]
    BaseUrl { url: String, message: String },
    #[error("fetching weather for {location} failed: {source}")]
    Fetch {
        location: String,
        #[source]
        source: FetchError,
    },
}

pub fn forecast_url(base_url: &str, location: &Location) -> Result<Url, ExtractError> {
    Url::parse_with_params(
        base_url,
        &[
            ("latitude", location.latitude.to_string()),
            ("longitude", location.longitude.to_string()),
            ("current_weather", "true".to_string()),
            ("hourly", HOURLY_VARIABLES.to_string()),
            ("timezone", "auto".to_string()),
        ],
    )
    .map_err(|e| ExtractError::BaseUrl {
        url: base_url.to_string(),
        message: e.to_string(),
    })
}

pub async fn extract_location(
    http: &HttpFetcher,
    run_id: Uuid,
    base_url: &str,
    location: &Location,
) -> Result<RawObservation, ExtractError> {
    let url = forecast_url(base_url, location)?;
    info!(location = %location.name, "extracting weather data");
    let payload = http
        .fetch_json(run_id, &location.name, url)
        .await
        .map_err(|source| ExtractError::Fetch {
            location: location.name.clone(),
            source,
        })?;
    Ok(RawObservation {
        location_name: location.name.clone(),
        extracted_at: Utc::now(),
        payload,
    })
}

/// Locations that fail are logged and left out of the batch.
pub async fn extract_all_locations(
    http: &HttpFetcher,
    run_id: Uuid,
    base_url: &str,
    locations: &[Location],
) -> RawObservationBatch {
    let mut batch = Vec::with_capacity(locations.len());
    for location in locations {
        match extract_location(http, run_id, base_url, location).await {
            Ok(raw) => {
                info!(location = %location.name, "extracted weather data");
                batch.push(raw);
            }
            Err(err) => error!(
                location = %location.name,
                error = %err,
                "failed to extract weather data"
            ),
        }
    }
    info!("Extracted data for {}/{} locations", batch.len(), locations.len());
    batch
}

/// Where the load stage writes.
#[derive(Debug, Clone)]
pub enum LoadTarget {
    Postgres(StoreConfig),
    InMemory(Arc<MemoryStore>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub locations_configured: usize,
    pub locations_extracted: usize,
    pub current_records: usize,
    pub hourly_records: usize,
    pub hourly_by_location: BTreeMap<String, usize>,
    pub loaded: LoadSummary,
    pub load_target: String,
    pub reports_dir: Option<String>,
}

pub struct SyncPipeline {
    config: SyncConfig,
    handoff: HandoffStore,
    http: HttpFetcher,
    target: LoadTarget,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let handoff = HandoffStore::new(config.artifacts_dir.clone());
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            backoff: BackoffPolicy {
                max_retries: config.http_retries,
                ..BackoffPolicy::default()
            },
        })?;
        let target = LoadTarget::Postgres(config.store.clone());
        Ok(Self {
            config,
            handoff,
            http,
            target,
        })
    }

    pub fn with_load_target(mut self, target: LoadTarget) -> Self {
        self.target = target;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn extract(&self, run_id: Uuid) -> Result<(usize, RawObservationBatch)> {
        let registry = LocationRegistry::load(&self.config.locations_file).await?;
        let base_url = &self.config.api_base_url;
        let batch = extract_all_locations(&self.http, run_id, base_url, &registry.locations).await;
        Ok((registry.locations.len(), batch))
    }

    pub async fn load(&self, batch: &TransformedBatch) -> Result<LoadSummary, LoadError> {
        match &self.target {
            LoadTarget::Postgres(store) => wxetl_load::load_with_config(batch, store).await,
            LoadTarget::InMemory(store) => wxetl_load::load(batch, store.as_ref()).await,
        }
    }

    fn load_target_label(&self) -> String {
        match &self.target {
            LoadTarget::Postgres(store) => store.display_target(),
            LoadTarget::InMemory(_) => "in-memory (dry run)".to_string(),
        }
    }

    /// Extract, transform and load once.
    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        info!(%run_id, "starting weather pipeline");

        let (locations_configured, raw) = self.extract(run_id).await?;
        self.process_raw(run_id, started_at, locations_configured, raw).await
    }

    pub async fn run_with_retries(&self) -> Result<SyncRunSummary> {
        self.config.retry.run(|_attempt| self.run_once()).await
    }

    /// Transform and load an already extracted batch.
    pub async fn process_raw(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        locations_configured: usize,
        raw: RawObservationBatch,
    ) -> Result<SyncRunSummary> {
        if raw.is_empty() {
            error!(%run_id, "no data extracted; aborting pipeline");
            return Err(anyhow!("no weather data extracted for run {run_id}"));
        }

        let transformed = wxetl_transform::transform(&raw);
        let loaded = self
            .load(&transformed)
            .await
            .with_context(|| format!("loading run {run_id}"))?;

        let mut hourly_by_location: BTreeMap<String, usize> = BTreeMap::new();
        for record in &transformed.hourly {
            *hourly_by_location.entry(record.location_name.clone()).or_default() += 1;
        }

        let mut summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            locations_configured,
            locations_extracted: raw.len(),
            current_records: transformed.current.len(),
            hourly_records: transformed.hourly.len(),
            hourly_by_location,
            loaded,
            load_target: self.load_target_label(),
            reports_dir: None,
        };

        if self.config.reports_enabled {
            let dir = write_reports(&self.config.reports_root(), &summary).await?;
            summary.reports_dir = Some(dir.display().to_string());
        }

        info!(
            %run_id,
            current_weather = loaded.current_weather,
            hourly_weather = loaded.hourly_weather,
            "pipeline complete"
        );
        Ok(summary)
    }

    /// Extract and write the raw batch to the handoff store.
    pub async fn extract_to_handoff(&self) -> Result<HandoffDocument> {
        let run_id = Uuid::new_v4();
        let (_, raw) = self.extract(run_id).await?;
        if raw.is_empty() {
            return Err(anyhow!("no weather data extracted for run {run_id}"));
        }
        self.handoff.write(Stage::Raw, Utc::now(), &raw).await
    }

    /// Read a raw batch handoff document and write its transformed batch.
    pub async fn transform_handoff(&self, raw_path: &Path) -> Result<HandoffDocument> {
        let raw: RawObservationBatch = HandoffStore::read(raw_path).await?;
        let transformed = wxetl_transform::transform(&raw);
        self.handoff
            .write(Stage::Transformed, Utc::now(), &transformed)
            .await
    }

    /// Load a transformed batch handoff document.
    pub async fn load_handoff(&self, transformed_path: &Path) -> Result<LoadSummary> {
        let transformed: TransformedBatch = HandoffStore::read(transformed_path).await?;
        self.load(&transformed)
            .await
            .with_context(|| format!("loading {}", transformed_path.display()))
    }

    pub async fn maybe_build_scheduler(self: Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.sync_cron.clone();
        let pipeline = Arc::clone(&self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_with_retries().await {
                    Ok(summary) => info!(
                        run_id = %summary.run_id,
                        total_rows = summary.loaded.total(),
                        "scheduled weather sync finished"
                    ),
                    Err(err) => error!(
                        error = %format!("{err:#}"),
                        "scheduled weather sync failed after retries"
                    ),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

pub async fn write_reports(reports_root: &Path, summary: &SyncRunSummary) -> Result<PathBuf> {
    let reports_dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(reports_dir.join("run_summary.json"), json)
        .await
        .context("writing run_summary.json")?;

    let mut brief = vec![
        "# Weather Sync Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!(
            "- Locations extracted: {}/{}",
            summary.locations_extracted, summary.locations_configured
        ),
        format!(
            "- Rows written: current_weather={}, hourly_weather={}",
            summary.loaded.current_weather, summary.loaded.hourly_weather
        ),
        format!("- Target: {}", summary.load_target),
        String::new(),
        "## Hourly Forecasts per Location".to_string(),
    ];
    brief.extend(
        summary
            .hourly_by_location
            .iter()
            .map(|(location, count)| format!("- {location}: {count}")),
    );
    brief.push(String::new());
    let brief = brief.join("\n");
    fs::write(reports_dir.join("brief.md"), brief)
        .await
        .context("writing brief.md")?;

    Ok(reports_dir)
}

/// Markdown digest of the most recent `runs` run reports, newest first.
///
/// A missing reports directory means no run has written a report yet.
pub fn report_recent_runs(runs: usize, reports_root: &Path) -> Result<String> {
    let entries = match std::fs::read_dir(reports_root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(render_digest(Vec::new()));
        }
        Err(err) => {
            return Err(err).with_context(|| format!("reading {}", reports_root.display()));
        }
    };
    let mut summaries = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .filter_map(|entry| {
            let path = entry.path().join("run_summary.json");
            let text = std::fs::read_to_string(&path).ok()?;
            match serde_json::from_str::<SyncRunSummary>(&text) {
                Ok(summary) => Some(summary),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable run summary");
                    None
                }
            }
        })
        .collect::<Vec<_>>();
    summaries.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    summaries.truncate(runs);
    Ok(render_digest(summaries))
}

fn render_digest(summaries: Vec<SyncRunSummary>) -> String {
    let mut lines = vec!["# Weather Sync Runs".to_string(), String::new()];
    if summaries.is_empty() {
        lines.push("No runs to show.".to_string());
    }
    for summary in summaries {
        lines.push(format!("## Run `{}`", summary.run_id));
        lines.push(format!("- started: {}", summary.started_at));
        lines.push(format!(
            "- locations: {}/{}",
            summary.locations_extracted, summary.locations_configured
        ));
        lines.push(format!("- current_weather rows: {}", summary.loaded.current_weather));
        lines.push(format!("- hourly_weather rows: {}", summary.loaded.hourly_weather));
        lines.push(format!("- target: `{}`", summary.load_target));
        lines.push(String::new());
    }
    lines.join("\n")
}
