//! Sync pipeline orchestration: scrape, reconcile, enrich, merge and persist.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use airdex_adapters::aerodatabox::AERODATABOX_BASE_URL;
use airdex_adapters::{
    AdapterContext, AeroDataBoxClient, AirportLookup, CandidateSource, DiscordConfig,
    DiscordForumSource, SteamConfig, SteamWorkshopSource,
};
use airdex_core::{
    format_timestamp, Candidate, Icao, IcaoExtractor, StoredAirport, DEFAULT_ICAO_DENYLIST,
};
use airdex_storage::{DatasetStore, EnrichmentCache, HttpClientConfig, HttpFetcher};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

pub mod enrich;
pub mod merge;
pub mod reconcile;
pub mod state;

pub use enrich::{derive_record, EnrichError, Enriched, Enricher, EnrichmentOutcome};
pub use merge::{apply_refreshes, merge, MergeOutcome};
pub use reconcile::{collapse_latest, reconcile, Reconciliation};
pub use state::{load_state, KnownEntry, KnownIndex, LoadedState};

pub const CRATE_NAME: &str = "airdex-sync";

pub const SETTINGS_FILE_NAME: &str = "airdex.yaml";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub root: PathBuf,
    pub data_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub apimarket_api_key: Option<String>,
    pub discord_bot_token: Option<String>,
    pub discord_channel_id: Option<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from any key lookup; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let root = var("AIRDEX_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            data_dir: var("AIRDEX_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| root.join("data")),
            cache_dir: var("AIRDEX_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| root.join("cache").join("aerodatabox")),
            apimarket_api_key: var("APIMARKET_API_KEY"),
            discord_bot_token: var("DISCORD_BOT_TOKEN"),
            discord_channel_id: var("DISCORD_CHANNEL_ID"),
            user_agent: var("AIRDEX_USER_AGENT").unwrap_or_else(|| "airdex-bot/0.1".to_string()),
            http_timeout_secs: var("AIRDEX_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            root,
        }
    }

    pub fn settings_path(&self) -> PathBuf {
        self.root.join(SETTINGS_FILE_NAME)
    }
}

/// Tunables read from `airdex.yaml`. Every key is optional.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub icao_denylist: Vec<String>,
    pub steam_app_id: u32,
    pub steam_page_cap: usize,
    pub steam_page_delay_ms: u64,
    pub lookup_delay_ms: u64,
    pub discord_concurrency: usize,
    pub discord_unit_timeout_secs: u64,
    pub aerodatabox_base_url: String,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        let steam = SteamConfig::default();
        Self {
            icao_denylist: DEFAULT_ICAO_DENYLIST.iter().map(ToString::to_string).collect(),
            steam_app_id: steam.app_id,
            steam_page_cap: steam.page_cap,
            steam_page_delay_ms: steam.page_delay.as_millis() as u64,
            lookup_delay_ms: enrich::DEFAULT_LOOKUP_DELAY.as_millis() as u64,
            discord_concurrency: 8,
            discord_unit_timeout_secs: 15,
            aerodatabox_base_url: AERODATABOX_BASE_URL.to_string(),
        }
    }
}

impl PipelineSettings {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text).context("parsing pipeline settings")
    }

    /// Read settings from `path`; a missing file means defaults.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_yaml_str(&text).with_context(|| format!("reading {}", path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
        }
    }

    pub fn extractor(&self) -> IcaoExtractor {
        IcaoExtractor::new(&self.icao_denylist)
    }

    pub fn steam_config(&self) -> SteamConfig {
        SteamConfig {
            app_id: self.steam_app_id,
            page_cap: self.steam_page_cap,
            page_delay: Duration::from_millis(self.steam_page_delay_ms),
        }
    }

    pub fn lookup_delay(&self) -> Duration {
        Duration::from_millis(self.lookup_delay_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Full,
    SteamOnly,
    DiscordOnly,
}

impl RunMode {
    pub fn runs_steam(self) -> bool {
        matches!(self, RunMode::Full | RunMode::SteamOnly)
    }

    pub fn runs_discord(self) -> bool {
        matches!(self, RunMode::Full | RunMode::DiscordOnly)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dataset_path: String,
    pub records_written: usize,
    pub base_records: usize,
    pub new_steam: usize,
    pub new_discord: usize,
    pub added: usize,
    pub rejected: usize,
    pub refreshed: usize,
    pub last_updated: String,
}

impl RunSummary {
    pub fn summary_line(&self) -> String {
        format!(
            "Updated {} with {} airports. lastUpdated={}",
            self.dataset_path, self.records_written, self.last_updated
        )
    }
}

/// Identifiers a full run would try to add, without enriching or writing anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DetectionReport {
    pub steam: Vec<Icao>,
    pub discord: Vec<Icao>,
}

impl DetectionReport {
    pub fn total(&self) -> usize {
        self.steam.len() + self.discord.len()
    }
}

impl fmt::Display for DetectionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Dry-detect new ICAOs: {}", self.total())?;
        for (label, codes) in [("STEAM", &self.steam), ("DISCORD", &self.discord)] {
            for icao in codes {
                writeln!(f, " - [{label}] {icao}")?;
            }
        }
        Ok(())
    }
}

pub struct SyncPipeline {
    store: DatasetStore,
    enricher: Enricher,
    steam: Option<Arc<dyn CandidateSource>>,
    discord: Option<Arc<dyn CandidateSource>>,
}

impl SyncPipeline {
    pub fn new(store: DatasetStore, enricher: Enricher) -> Self {
        Self {
            store,
            enricher,
            steam: None,
            discord: None,
        }
    }

    pub fn with_steam(mut self, source: Arc<dyn CandidateSource>) -> Self {
        self.steam = Some(source);
        self
    }

    pub fn with_discord(mut self, source: Arc<dyn CandidateSource>) -> Self {
        self.discord = Some(source);
        self
    }

    /// Wire the real sources and lookup client. Missing credentials leave a collaborator unset.
    pub fn from_config(config: &SyncConfig, settings: &PipelineSettings) -> Result<Self> {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?);
        let extractor = Arc::new(settings.extractor());

        let lookup: Option<Arc<dyn AirportLookup>> = match &config.apimarket_api_key {
            Some(key) => Some(Arc::new(
                AeroDataBoxClient::new(http.clone(), key.clone())
                    .with_base_url(settings.aerodatabox_base_url.clone()),
            )),
            None => {
                info!("APIMARKET_API_KEY not set, only cached airport data is usable");
                None
            }
        };
        let enricher = Enricher::new(
            EnrichmentCache::new(config.cache_dir.clone()),
            lookup,
            settings.lookup_delay(),
        );

        let steam = SteamWorkshopSource::new(http.clone(), extractor.clone(), settings.steam_config());
        let mut pipeline =
            Self::new(DatasetStore::in_data_dir(&config.data_dir), enricher).with_steam(Arc::new(steam));

        if let Some(discord) = discord_config(config, settings) {
            pipeline = pipeline.with_discord(Arc::new(DiscordForumSource::new(http, extractor, discord)));
        }
        Ok(pipeline)
    }

    async fn collect(
        &self,
        source: Option<&Arc<dyn CandidateSource>>,
        label: &str,
        ctx: &AdapterContext,
    ) -> Vec<Candidate> {
        let Some(source) = source else {
            info!(source = label, "source not configured, skipping");
            return Vec::new();
        };
        let provenance = source.source();
        match source.collect(ctx).await {
            Ok(candidates) => {
                info!(source = %provenance, scraped = candidates.len(), "source scraped");
                candidates
            }
            Err(err) => {
                error!(source = %provenance, error = %err, "source scrape failed, continuing without it");
                Vec::new()
            }
        }
    }

    /// Scrape the selected sources, enrich new identifiers and write the merged dataset.
    pub async fn run(&self, mode: RunMode) -> Result<RunSummary> {
        let started_at = Utc::now();
        let ctx = AdapterContext::new(started_at);
        let span = info_span!("sync_run", run_id = %ctx.run_id, mode = ?mode);
        self.run_inner(mode, ctx).instrument(span).await
    }

    async fn run_inner(&self, mode: RunMode, ctx: AdapterContext) -> Result<RunSummary> {
        self.store.ensure_initialized().await?;
        let state = load_state(&self.store).await;

        let steam = if mode.runs_steam() {
            self.collect(self.steam.as_ref(), "steam", &ctx).await
        } else {
            info!("steam skipped");
            Vec::new()
        };
        let discord = if mode.runs_discord() {
            self.collect(self.discord.as_ref(), "discord", &ctx).await
        } else {
            info!("discord skipped");
            Vec::new()
        };

        let reconciliation = reconcile(steam, discord, &state.known);
        info!(
            scraped_steam = reconciliation.scraped_steam,
            scraped_discord = reconciliation.scraped_discord,
            new_steam = reconciliation.new_steam.len(),
            new_discord = reconciliation.new_discord.len(),
            refreshes = reconciliation.refreshes.len(),
            "reconciled sources"
        );

        let new_records = reconciliation.new_records();
        info!(total = new_records.len(), "new ICAOs requiring AeroDataBox lookup");
        let enriched = self
            .enricher
            .enrich_all(&ctx, &new_records, ctx.started_at)
            .await?;
        info!(
            built = enriched.records.len(),
            rejected = enriched.rejected.len(),
            cache_hits = enriched.cache_hits,
            lookups = enriched.lookups,
            "enrichment finished"
        );

        let new_airports = enriched
            .records
            .iter()
            .map(StoredAirport::from_record)
            .collect::<Result<Vec<_>, _>>()
            .context("serializing new airport records")?;
        let base_records = state.base.len();
        let outcome = merge(state, new_airports, &reconciliation.refreshes, ctx.started_at);
        self.store
            .save(&outcome.file)
            .await
            .with_context(|| format!("writing {}", self.store.path().display()))?;

        let summary = RunSummary {
            run_id: ctx.run_id,
            mode,
            started_at: ctx.started_at,
            finished_at: Utc::now(),
            dataset_path: self.store.path().display().to_string(),
            records_written: outcome.file.airports.len(),
            base_records,
            new_steam: reconciliation.new_steam.len(),
            new_discord: reconciliation.new_discord.len(),
            added: outcome.added,
            rejected: enriched.rejected.len(),
            refreshed: outcome.refreshed,
            last_updated: format_timestamp(ctx.started_at),
        };
        info!(
            records = summary.records_written,
            added = summary.added,
            refreshed = summary.refreshed,
            "dataset written"
        );
        Ok(summary)
    }

    /// Scrape both sources and report what is new. Nothing is enriched or written.
    pub async fn detect(&self) -> Result<DetectionReport> {
        let ctx = AdapterContext::new(Utc::now());
        let span = info_span!("sync_detect", run_id = %ctx.run_id);
        self.detect_inner(ctx).instrument(span).await
    }

    async fn detect_inner(&self, ctx: AdapterContext) -> Result<DetectionReport> {
        self.store.ensure_initialized().await?;
        let state = load_state(&self.store).await;
        let steam = self.collect(self.steam.as_ref(), "steam", &ctx).await;
        let discord = self.collect(self.discord.as_ref(), "discord", &ctx).await;
        let reconciliation = reconcile(steam, discord, &state.known);
        Ok(DetectionReport {
            steam: reconciliation.new_steam.into_keys().collect(),
            discord: reconciliation.new_discord.into_keys().collect(),
        })
    }
}

fn discord_config(config: &SyncConfig, settings: &PipelineSettings) -> Option<DiscordConfig> {
    let Some(raw_channel) = config.discord_channel_id.as_deref() else {
        info!("DISCORD_CHANNEL_ID not set, skipping Discord");
        return None;
    };
    let channel_id = match raw_channel.parse::<u64>() {
        Ok(id) => id,
        Err(_) => {
            error!(channel_id = raw_channel, "DISCORD_CHANNEL_ID is not a valid integer, skipping Discord");
            return None;
        }
    };
    let Some(token) = config.discord_bot_token.as_deref() else {
        info!("DISCORD_BOT_TOKEN not set, skipping Discord");
        return None;
    };

    let mut discord = DiscordConfig::new(token, channel_id);
    discord.concurrency = settings.discord_concurrency.max(1);
    discord.unit_timeout = Duration::from_secs(settings.discord_unit_timeout_secs.max(1));
    Some(discord)
}

fn build_pipeline_from_env() -> Result<SyncPipeline> {
    let config = SyncConfig::from_env();
    let settings = PipelineSettings::load(&config.settings_path())?;
    info!(
        data_dir = %config.data_dir.display(),
        cache_dir = %config.cache_dir.display(),
        denylist = ?settings.icao_denylist,
        "configuration loaded"
    );
    SyncPipeline::from_config(&config, &settings)
}

pub async fn run_sync_from_env(mode: RunMode) -> Result<RunSummary> {
    build_pipeline_from_env()?.run(mode).await
}

pub async fn detect_from_env() -> Result<DetectionReport> {
    build_pipeline_from_env()?.detect().await
}
