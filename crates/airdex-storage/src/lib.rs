//! Dataset/cache file storage + HTTP fetch utilities for airdex.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use airdex_core::{DatasetFile, Icao, StoredAirport, DEFAULT_SCHEMA_VERSION};
use anyhow::Context;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "airdex-storage";

pub const DATASET_FILE_NAME: &str = "airports.json";
pub const SEED_FILE_NAME: &str = "baseAirports.json";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{seed} does not exist, cannot create {dataset}")]
    SeedMissing { dataset: PathBuf, seed: PathBuf },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Write bytes through a temp file in the target directory and rename it into place,
/// so readers see either the previous file or the complete new one.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    let written = async {
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await
    }
    .await;
    drop(file);
    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| format!("writing temp file {}", temp_path.display()));
    }

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming temp file {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedOutcome {
    AlreadyPresent,
    CreatedFromSeed,
}

/// Result of decoding a dataset document record by record.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedDataset {
    pub file: DatasetFile,
    /// One human-readable reason per airport entry that was dropped.
    pub dropped: Vec<String>,
}

/// Decode the persisted document, keeping every airport entry that names an identifier.
pub fn decode_dataset(text: &str) -> Result<DecodedDataset, serde_json::Error> {
    let value: JsonValue = serde_json::from_str(text)?;
    let JsonValue::Object(mut doc) = value else {
        return Err(serde::de::Error::custom("dataset root is not a JSON object"));
    };

    let schema_version = doc
        .get("schemaVersion")
        .and_then(JsonValue::as_u64)
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(DEFAULT_SCHEMA_VERSION);
    let last_updated = doc
        .get("lastUpdated")
        .and_then(JsonValue::as_str)
        .map(ToString::to_string);
    let entries = match doc.remove("airports") {
        Some(JsonValue::Array(entries)) => entries,
        _ => Vec::new(),
    };

    let mut airports = Vec::with_capacity(entries.len());
    let mut dropped = Vec::new();
    for (index, entry) in entries.into_iter().enumerate() {
        match StoredAirport::from_value(entry) {
            Some(stored) => airports.push(stored),
            None => dropped.push(format!("entry {index}: missing icao")),
        }
    }

    Ok(DecodedDataset {
        file: DatasetFile {
            schema_version,
            last_updated,
            airports,
        },
        dropped,
    })
}

/// Pretty-printed, newline-terminated JSON as persisted on disk.
pub fn encode_dataset(file: &DatasetFile) -> Result<Vec<u8>, serde_json::Error> {
    let mut bytes = serde_json::to_vec_pretty(file)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// The on-disk dataset document plus the seed it is initialised from.
#[derive(Debug, Clone)]
pub struct DatasetStore {
    path: PathBuf,
    seed_path: PathBuf,
}

impl DatasetStore {
    pub fn new(path: impl Into<PathBuf>, seed_path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            seed_path: seed_path.into(),
        }
    }

    pub fn in_data_dir(data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref();
        Self::new(
            data_dir.join(DATASET_FILE_NAME),
            data_dir.join(SEED_FILE_NAME),
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn seed_path(&self) -> &Path {
        &self.seed_path
    }

    /// Make sure the dataset file exists, copying the seed when it does not.
    pub async fn ensure_initialized(&self) -> Result<SeedOutcome, StorageError> {
        if fs::try_exists(&self.path)
            .await
            .with_context(|| format!("checking {}", self.path.display()))?
        {
            info!(path = %self.path.display(), "dataset file exists");
            return Ok(SeedOutcome::AlreadyPresent);
        }

        let seed_present = fs::try_exists(&self.seed_path)
            .await
            .with_context(|| format!("checking {}", self.seed_path.display()))?;
        if !seed_present {
            return Err(StorageError::SeedMissing {
                dataset: self.path.clone(),
                seed: self.seed_path.clone(),
            });
        }

        let seed = fs::read(&self.seed_path)
            .await
            .with_context(|| format!("reading seed {}", self.seed_path.display()))?;
        write_atomic(&self.path, &seed).await?;
        warn!(
            path = %self.path.display(),
            seed = %self.seed_path.display(),
            "dataset file was missing, created from seed"
        );
        Ok(SeedOutcome::CreatedFromSeed)
    }

    /// Read the dataset. Missing, unreadable or malformed files yield an empty dataset.
    pub async fn load(&self) -> DatasetFile {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "cannot read dataset, using empty dataset");
                return DatasetFile::default();
            }
        };
        match decode_dataset(&text) {
            Ok(decoded) => {
                for reason in &decoded.dropped {
                    warn!(path = %self.path.display(), reason = %reason, "dropping unreadable airport entry");
                }
                decoded.file
            }
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "malformed dataset, using empty dataset");
                DatasetFile::default()
            }
        }
    }

    pub async fn save(&self, file: &DatasetFile) -> anyhow::Result<()> {
        let bytes = encode_dataset(file).context("serializing dataset")?;
        write_atomic(&self.path, &bytes).await
    }
}

/// Raw lookup responses, one `<ICAO>.json` file per identifier. Never invalidated here.
#[derive(Debug, Clone)]
pub struct EnrichmentCache {
    dir: PathBuf,
}

impl EnrichmentCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, icao: &Icao) -> PathBuf {
        self.dir.join(format!("{}.json", icao.as_str().to_uppercase()))
    }

    pub async fn load(&self, icao: &Icao) -> Option<JsonValue> {
        let path = self.path_for(icao);
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(%icao, path = %path.display(), error = %err, "failed to read cache entry");
                return None;
            }
        };
        match serde_json::from_str(&text) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(%icao, path = %path.display(), error = %err, "failed to parse cache entry");
                None
            }
        }
    }

    pub async fn store(&self, icao: &Icao, payload: &JsonValue) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec(payload).context("serializing cache entry")?;
        write_atomic(&self.path_for(icao), &bytes).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Enforces a minimum gap between consecutive calls.
#[derive(Debug)]
pub struct RequestPacer {
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: Mutex::new(None),
        }
    }

    pub async fn wait(&self) {
        let mut last = self.last.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                let pause = self.min_interval - elapsed;
                tracing::debug!(?pause, "pacing request");
                tokio::time::sleep(pause).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub min_request_interval: Option<Duration>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_source_concurrency: 8,
            backoff: BackoffPolicy::default(),
            min_request_interval: None,
        }
    }
}

/// A GET or form POST with optional headers.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    method: Method,
    url: String,
    headers: Vec<(String, String)>,
    form: Option<Vec<(String, String)>>,
}

impl RequestSpec {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            headers: Vec::new(),
            form: None,
        }
    }

    pub fn post_form<K, V>(url: impl Into<String>, form: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            method: Method::POST,
            url: url.into(),
            headers: Vec::new(),
            form: Some(form.into_iter().map(|(k, v)| (k.into(), v.into())).collect()),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn build(&self, client: &reqwest::Client) -> reqwest::RequestBuilder {
        let mut builder = client.request(self.method.clone(), &self.url);
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(form) = &self.form {
            builder = builder.form(form);
        }
        builder
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    pacer: Option<RequestPacer>,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid JSON from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } => Some(*status),
            FetchError::Request(err) => err.status().map(|s| s.as_u16()),
            FetchError::Decode { .. } => None,
        }
    }
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

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            pacer: config.min_request_interval.map(RequestPacer::new),
            backoff: config.backoff,
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        request: &RequestSpec,
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source.acquire().await.expect("semaphore not closed");

        if let Some(pacer) = &self.pacer {
            pacer.wait().await;
        }

        let span = info_span!("http_fetch", %run_id, source_id, url = request.url());
        self.fetch_with_retries(request).instrument(span).await
    }

    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        run_id: Uuid,
        source_id: &str,
        request: &RequestSpec,
    ) -> Result<T, FetchError> {
        let response = self.fetch_bytes(run_id, source_id, request).await?;
        serde_json::from_slice(&response.body).map_err(|source| FetchError::Decode {
            url: response.final_url,
            source,
        })
    }

    async fn fetch_with_retries(&self, request: &RequestSpec) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            let can_retry = attempt < self.backoff.max_retries;
            match request.build(&self.client).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable && can_retry {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && can_retry {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}
