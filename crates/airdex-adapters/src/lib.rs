//! Candidate source contracts, the Steam Workshop and Discord scrapers, and the
//! AeroDataBox lookup client.

use airdex_core::{Candidate, Icao, Provenance};
use airdex_storage::FetchError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub mod aerodatabox;
pub mod discord;
pub mod steam;

pub use aerodatabox::AeroDataBoxClient;
pub use discord::{DiscordConfig, DiscordForumSource};
pub use steam::{SteamConfig, SteamWorkshopSource};

pub const CRATE_NAME: &str = "airdex-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
}

impl AdapterContext {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at,
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// A scraper that turns one external platform into raw airport claims.
///
/// Duplicate claims for the same identifier are allowed; the reconciler keeps the
/// most recent one.
#[async_trait]
pub trait CandidateSource: Send + Sync {
    fn source(&self) -> Provenance;

    async fn collect(&self, ctx: &AdapterContext) -> Result<Vec<Candidate>, AdapterError>;
}

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("no airport data returned for {0}")]
    NotFound(Icao),
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// Third-party airport metadata lookup. Returns the raw, unvalidated payload.
#[async_trait]
pub trait AirportLookup: Send + Sync {
    async fn lookup(&self, ctx: &AdapterContext, icao: &Icao) -> Result<JsonValue, LookupError>;
}

pub fn json_path<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    if cur.is_null() {
        None
    } else {
        Some(cur)
    }
}

/// Non-blank string at `path`, trimmed.
pub fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    json_path(value, path)?
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Number at `path`; numeric strings are accepted too.
pub fn json_f64(value: &JsonValue, path: &[&str]) -> Option<f64> {
    let cur = json_path(value, path)?;
    cur.as_f64()
        .or_else(|| cur.as_str().and_then(|s| s.trim().parse().ok()))
}

pub fn json_u64(value: &JsonValue, path: &[&str]) -> Option<u64> {
    let cur = json_path(value, path)?;
    cur.as_u64()
        .or_else(|| cur.as_str().and_then(|s| s.trim().parse().ok()))
}
