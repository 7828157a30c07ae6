//! Turns newly admitted claims into full dataset records via the cache-first lookup.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use airdex_adapters::{json_f64, json_str, AdapterContext, AirportLookup, LookupError};
use airdex_core::{
    airport_display_name, format_timestamp, AirportRecord, Candidate, CandidateDetail, Icao, Region,
};
use airdex_storage::{EnrichmentCache, RequestPacer};
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{error, info, warn};

pub const DEFAULT_LOOKUP_DELAY: Duration = Duration::from_millis(500);

/// Payload fields tried in order for the display name.
const NAME_SOURCES: &[&[&str]] = &[
    &["fullName"],
    &["name"],
    &["shortName"],
    &["municipalityName"],
];

const LATITUDE: &[&str] = &["location", "lat"];
const LONGITUDE_SOURCES: &[&[&str]] = &[&["location", "lon"], &["location", "lng"]];

#[derive(Debug, Error)]
pub enum EnrichError {
    #[error("{0} is not cached and no AeroDataBox API key is configured (set APIMARKET_API_KEY)")]
    MissingCredentials(Icao),
    #[error("lookup failed for {icao}: {source}")]
    Lookup {
        icao: Icao,
        #[source]
        source: LookupError,
    },
    #[error("no lat/lng in lookup data for {0}")]
    MissingCoordinates(Icao),
}

impl EnrichError {
    /// Fatal errors abort the run; everything else only rejects one record.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EnrichError::MissingCredentials(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnrichmentOutcome {
    pub records: Vec<AirportRecord>,
    pub rejected: Vec<Icao>,
    /// Built records whose payload came from the cache.
    pub cache_hits: usize,
    /// Built records whose payload needed a remote lookup.
    pub lookups: usize,
}

/// One built record and whether its payload was already cached.
#[derive(Debug, Clone, PartialEq)]
pub struct Enriched {
    pub record: AirportRecord,
    pub from_cache: bool,
}

pub struct Enricher {
    cache: EnrichmentCache,
    lookup: Option<Arc<dyn AirportLookup>>,
    pacer: RequestPacer,
}

enum Resolved {
    Cached(JsonValue),
    Fetched(JsonValue),
}

impl Enricher {
    pub fn new(cache: EnrichmentCache, lookup: Option<Arc<dyn AirportLookup>>, spacing: Duration) -> Self {
        Self {
            cache,
            lookup,
            pacer: RequestPacer::new(spacing),
        }
    }

    async fn resolve(&self, ctx: &AdapterContext, icao: &Icao) -> Result<Resolved, EnrichError> {
        if let Some(cached) = self.cache.load(icao).await {
            info!(%icao, "using cached AeroDataBox data");
            return Ok(Resolved::Cached(cached));
        }

        let Some(lookup) = &self.lookup else {
            return Err(EnrichError::MissingCredentials(icao.clone()));
        };

        self.pacer.wait().await;
        let payload = lookup
            .lookup(ctx, icao)
            .await
            .map_err(|source| EnrichError::Lookup {
                icao: icao.clone(),
                source,
            })?;

        if let Err(err) = self.cache.store(icao, &payload).await {
            warn!(%icao, error = %err, "failed to write cache entry");
        }
        Ok(Resolved::Fetched(payload))
    }

    /// Build the record for one claim, reading the cache before calling the lookup.
    pub async fn enrich(
        &self,
        ctx: &AdapterContext,
        candidate: &Candidate,
        run_time: DateTime<Utc>,
    ) -> Result<Enriched, EnrichError> {
        let (payload, from_cache) = match self.resolve(ctx, &candidate.icao).await? {
            Resolved::Cached(payload) => (payload, true),
            Resolved::Fetched(payload) => (payload, false),
        };
        let record = derive_record(candidate, &payload, run_time)?;
        Ok(Enriched { record, from_cache })
    }

    /// Enrich every claim in ascending identifier order. Only fatal errors stop the loop.
    pub async fn enrich_all(
        &self,
        ctx: &AdapterContext,
        candidates: &BTreeMap<&Icao, &Candidate>,
        run_time: DateTime<Utc>,
    ) -> Result<EnrichmentOutcome, EnrichError> {
        let mut outcome = EnrichmentOutcome::default();

        for (icao, candidate) in candidates {
            match self.enrich(ctx, candidate, run_time).await {
                Ok(Enriched { record, from_cache }) => {
                    if from_cache {
                        outcome.cache_hits += 1;
                    } else {
                        outcome.lookups += 1;
                    }
                    info!(%icao, source = %candidate.source(), name = %record.name, "added new airport");
                    outcome.records.push(record);
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err @ EnrichError::Lookup { .. }) => {
                    error!(%icao, error = %err, "AeroDataBox failed, skipping");
                    outcome.rejected.push((*icao).clone());
                }
                Err(err) => {
                    warn!(%icao, error = %err, "rejecting airport");
                    outcome.rejected.push((*icao).clone());
                }
            }
        }

        Ok(outcome)
    }
}

/// Build the dataset record for one claim from its raw lookup payload.
pub fn derive_record(
    candidate: &Candidate,
    payload: &JsonValue,
    run_time: DateTime<Utc>,
) -> Result<AirportRecord, EnrichError> {
    let icao = &candidate.icao;
    let lat = json_f64(payload, LATITUDE);
    let lng = LONGITUDE_SOURCES
        .iter()
        .find_map(|path| json_f64(payload, path));
    let (Some(lat), Some(lng)) = (lat, lng) else {
        return Err(EnrichError::MissingCoordinates(icao.clone()));
    };

    let name = NAME_SOURCES
        .iter()
        .find_map(|path| json_str(payload, path))
        .map(ToString::to_string)
        .unwrap_or_else(|| format!("{icao} Airport"));

    let source = candidate.source();
    let mut record = AirportRecord {
        icao: icao.as_str().to_string(),
        name: airport_display_name(&name),
        lat,
        lng,
        country: region(payload, "country"),
        continent: region(payload, "continent"),
        status: source.status(),
        source,
        author: Some(candidate.author().to_string()),
        workshop_url: None,
        discord_thread: None,
        last_updated: None,
        default_included: false,
        featured: false,
        steam_subscriptions: 0,
    };

    let activity = match &candidate.detail {
        CandidateDetail::Workshop(item) => {
            record.workshop_url = Some(item.workshop_url.clone());
            record.steam_subscriptions = item.subscriptions;
            item.time_updated
        }
        CandidateDetail::Forum(post) => {
            record.discord_thread = Some(post.discord_thread.clone());
            post.activity_at
        }
    };
    record.last_updated = Some(format_timestamp(activity.unwrap_or(run_time)));

    Ok(record)
}

fn region(payload: &JsonValue, field: &str) -> Option<Region> {
    Some(Region {
        code: json_str(payload, &[field, "code"])?.to_string(),
        name: json_str(payload, &[field, "name"])?.to_string(),
    })
}
