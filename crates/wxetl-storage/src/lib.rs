//! Handoff documents between pipeline stages, and the HTTP client used for extraction.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub use reqwest::Url;

pub const CRATE_NAME: &str = "wxetl-storage";

/// Pipeline stage whose output a handoff document holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Raw,
    Transformed,
}

impl Stage {
    pub fn dir_name(self) -> &'static str {
        match self {
            Stage::Raw => "raw",
            Stage::Transformed => "transformed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

#[derive(Debug, Clone)]
pub struct HandoffDocument {
    pub stage: Stage,
    pub digest: String,
    pub relative_path: PathBuf,
    pub path: PathBuf,
    pub size: usize,
    /// An identical document was already on disk.
    pub reused: bool,
}

/// JSON documents addressed by content digest: `<root>/<stamp>/<stage>/<sha256>.json`.
#[derive(Debug, Clone)]
pub struct HandoffStore {
    root: PathBuf,
}

impl HandoffStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn digest(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    pub fn document_path(&self, stage: Stage, written_at: DateTime<Utc>, digest: &str) -> PathBuf {
        PathBuf::from(written_at.format("%Y%m%d_%H%M%S").to_string())
            .join(stage.dir_name())
            .join(format!("{digest}.json"))
    }

    /// Write `value` as pretty JSON. The file is staged next to its target and renamed into place.
    pub async fn write<T: Serialize>(
        &self,
        stage: Stage,
        written_at: DateTime<Utc>,
        value: &T,
    ) -> anyhow::Result<HandoffDocument> {
        let bytes = serde_json::to_vec_pretty(value)
            .with_context(|| format!("serializing {stage} handoff document"))?;
        let digest = Self::digest(&bytes);
        let relative_path = self.document_path(stage, written_at, &digest);
        let path = self.root.join(&relative_path);
        let mut document = HandoffDocument {
            stage,
            digest,
            relative_path,
            path,
            size: bytes.len(),
            reused: false,
        };

        if fs::try_exists(&document.path)
            .await
            .with_context(|| format!("checking {}", document.path.display()))?
        {
            document.reused = true;
            return Ok(document);
        }

        let dir = document
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating handoff directory {}", dir.display()))?;

        let staging = dir.join(format!(".{}.partial", Uuid::new_v4().simple()));
        fs::write(&staging, &bytes)
            .await
            .with_context(|| format!("writing {}", staging.display()))?;
        if let Err(err) = fs::rename(&staging, &document.path).await {
            let _ = fs::remove_file(&staging).await;
            return Err(err)
                .with_context(|| format!("publishing {stage} handoff {}", document.path.display()));
        }

        debug!(
            %stage,
            path = %document.path.display(),
            size = document.size,
            "wrote handoff document"
        );
        Ok(document)
    }

    pub async fn read<T: DeserializeOwned>(path: impl AsRef<Path>) -> anyhow::Result<T> {
        let path = path.as_ref();
        let bytes = fs::read(path)
            .await
            .with_context(|| format!("reading handoff document {}", path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing handoff document {}", path.display()))
    }
}

/// Doubling delay between fetch retries, capped at `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `retry`, counting from zero.
    pub fn delay_before(&self, retry: u32) -> Duration {
        2u32.checked_pow(retry)
            .and_then(|factor| self.initial_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("response from {url} is not valid JSON: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    /// Timeouts, refused connections, throttling and server errors.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Request(err) => err.is_timeout() || err.is_connect(),
            FetchError::HttpStatus { status, .. } => *status == 429 || (500..600).contains(status),
            FetchError::Decode { .. } => false,
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build().context("building reqwest client")?,
            backoff: config.backoff,
        })
    }

    /// GET `url`, retrying transient failures, and return the body bytes.
    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        label: &str,
        url: Url,
    ) -> Result<Vec<u8>, FetchError> {
        let span = info_span!("http_fetch", %run_id, label, url = %url);
        async {
            let mut retry = 0u32;
            loop {
                match self.get_once(&url).await {
                    Err(err) if err.is_transient() && retry < self.backoff.max_retries => {
                        let delay = self.backoff.delay_before(retry);
                        debug!(
                            error = %err,
                            retry = retry + 1,
                            delay_ms = delay.as_millis() as u64,
                            "transient fetch failure; retrying"
                        );
                        tokio::time::sleep(delay).await;
                        retry += 1;
                    }
                    outcome => return outcome,
                }
            }
        }
        .instrument(span)
        .await
    }

    pub async fn fetch_json(
        &self,
        run_id: Uuid,
        label: &str,
        url: Url,
    ) -> Result<JsonValue, FetchError> {
        let display_url = url.to_string();
        let body = self.fetch_bytes(run_id, label, url).await?;
        serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
            url: display_url,
            source,
        })
    }

    async fn get_once(&self, url: &Url) -> Result<Vec<u8>, FetchError> {
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: response.url().to_string(),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }
}
