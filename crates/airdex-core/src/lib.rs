//! Core airport dataset model, identifier extraction and naming rules for airdex.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

pub const CRATE_NAME: &str = "airdex-core";

pub const DEFAULT_SCHEMA_VERSION: u32 = 1;

/// Four-letter tokens that show up in workshop titles and forum posts but are not airports.
pub const DEFAULT_ICAO_DENYLIST: &[&str] = &["ATCG", "MSFS"];

static ICAO_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([A-Z]{4})\b").expect("ICAO token pattern is valid"));

/// Uppercase airport identifier used as the dataset key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Icao(String);

impl Icao {
    /// Normalizes a persisted or scraped code. Blank input yields `None`.
    pub fn normalize(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_uppercase()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Icao {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pulls the first plausible ICAO code out of free text.
#[derive(Debug, Clone)]
pub struct IcaoExtractor {
    denylist: BTreeSet<String>,
}

impl Default for IcaoExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_ICAO_DENYLIST.iter().copied())
    }
}

impl IcaoExtractor {
    pub fn new<I, S>(denylist: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            denylist: denylist
                .into_iter()
                .filter_map(|code| Icao::normalize(code.as_ref()))
                .map(|code| code.0)
                .collect(),
        }
    }

    pub fn denylist(&self) -> impl Iterator<Item = &str> {
        self.denylist.iter().map(String::as_str)
    }

    pub fn extract(&self, text: &str) -> Option<Icao> {
        if text.trim().is_empty() {
            return None;
        }
        let upper = text.to_uppercase();
        ICAO_TOKEN
            .captures_iter(&upper)
            .filter_map(|caps| caps.get(1))
            .map(|m| m.as_str())
            .find(|code| !self.denylist.contains(*code))
            .map(|code| Icao(code.to_string()))
    }
}

/// Applies the dataset naming rule: every pipeline-built name mentions "airport".
pub fn airport_display_name(name: &str) -> String {
    let name = name.trim();
    if name.to_lowercase().contains("airport") {
        name.to_string()
    } else {
        format!("{name} Airport")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Base,
    Released,
    InDev,
}

/// Where a record came from. `Steam` is the catalog source, `Discord` the forum source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    Base,
    Steam,
    Discord,
}

impl Provenance {
    pub fn status(self) -> Status {
        match self {
            Provenance::Base => Status::Base,
            Provenance::Steam => Status::Released,
            Provenance::Discord => Status::InDev,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Provenance::Base => "base",
            Provenance::Steam => "steam",
            Provenance::Discord => "discord",
        }
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// `{code, name}` pair used for country and continent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub code: String,
    pub name: String,
}

/// A record built by the pipeline for a newly discovered airport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AirportRecord {
    pub icao: String,
    pub name: String,
    pub lat: f64,
    pub lng: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<Region>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continent: Option<Region>,
    pub status: Status,
    pub source: Provenance,
    pub author: Option<String>,
    pub workshop_url: Option<String>,
    pub discord_thread: Option<String>,
    pub last_updated: Option<String>,
    pub default_included: bool,
    pub featured: bool,
    pub steam_subscriptions: u64,
}

/// One persisted airport entry, held as the JSON object found on disk.
/// Only `lastUpdated` is ever rewritten; every other key, value and key order survives a save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoredAirport(Map<String, JsonValue>);

impl StoredAirport {
    /// Accepts any JSON object carrying a non-blank string `icao`.
    pub fn from_value(value: JsonValue) -> Option<Self> {
        let JsonValue::Object(map) = value else {
            return None;
        };
        let stored = Self(map);
        stored.key().is_some().then_some(stored)
    }

    pub fn from_record(record: &AirportRecord) -> serde_json::Result<Self> {
        match serde_json::to_value(record)? {
            JsonValue::Object(map) => Ok(Self(map)),
            _ => Err(serde::ser::Error::custom("airport record did not serialize to an object")),
        }
    }

    pub fn icao(&self) -> &str {
        self.str_field("icao").unwrap_or_default()
    }

    pub fn key(&self) -> Option<Icao> {
        Icao::normalize(self.icao())
    }

    pub fn str_field(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(JsonValue::as_str)
    }

    pub fn get(&self, field: &str) -> Option<&JsonValue> {
        self.0.get(field)
    }

    /// Only the literal `"base"` status puts an entry in the base tier.
    pub fn is_base(&self) -> bool {
        self.str_field("status") == Some("base")
    }

    /// Provenance as persisted, falling back to what the status implies.
    /// Unknown markers count as catalog records so they are never refreshed.
    pub fn provenance(&self) -> Provenance {
        match self.str_field("source") {
            Some("discord") => return Provenance::Discord,
            Some("steam") => return Provenance::Steam,
            Some("base") => return Provenance::Base,
            _ => {}
        }
        match self.str_field("status") {
            Some("base") => Provenance::Base,
            Some("in_dev") => Provenance::Discord,
            _ => Provenance::Steam,
        }
    }

    pub fn last_updated(&self) -> Option<&str> {
        self.str_field("lastUpdated")
    }

    pub fn set_last_updated(&mut self, ts: DateTime<Utc>) {
        self.0
            .insert("lastUpdated".to_string(), JsonValue::String(format_timestamp(ts)));
    }
}

/// The persisted document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetFile {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub last_updated: Option<String>,
    #[serde(default)]
    pub airports: Vec<StoredAirport>,
}

impl Default for DatasetFile {
    fn default() -> Self {
        Self {
            schema_version: DEFAULT_SCHEMA_VERSION,
            last_updated: None,
            airports: Vec::new(),
        }
    }
}

fn default_schema_version() -> u32 {
    DEFAULT_SCHEMA_VERSION
}

/// Workshop item metadata as scraped from the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkshopItem {
    pub published_file_id: String,
    pub title: String,
    pub creator: String,
    pub time_updated: Option<DateTime<Utc>>,
    pub workshop_url: String,
    pub subscriptions: u64,
}

/// Forum thread or message metadata as scraped from the chat platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForumPost {
    pub author: String,
    pub discord_thread: String,
    pub activity_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CandidateDetail {
    Workshop(WorkshopItem),
    Forum(ForumPost),
}

/// A scraped, not yet enriched airport claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub icao: Icao,
    pub detail: CandidateDetail,
}

impl Candidate {
    pub fn workshop(icao: Icao, item: WorkshopItem) -> Self {
        Self {
            icao,
            detail: CandidateDetail::Workshop(item),
        }
    }

    pub fn forum(icao: Icao, post: ForumPost) -> Self {
        Self {
            icao,
            detail: CandidateDetail::Forum(post),
        }
    }

    pub fn source(&self) -> Provenance {
        match self.detail {
            CandidateDetail::Workshop(_) => Provenance::Steam,
            CandidateDetail::Forum(_) => Provenance::Discord,
        }
    }

    /// Source-internal recency signal used to pick between duplicate claims.
    pub fn recency(&self) -> Option<DateTime<Utc>> {
        match &self.detail {
            CandidateDetail::Workshop(item) => item.time_updated,
            CandidateDetail::Forum(post) => post.activity_at,
        }
    }

    pub fn author(&self) -> &str {
        match &self.detail {
            CandidateDetail::Workshop(item) => &item.creator,
            CandidateDetail::Forum(post) => &post.author,
        }
    }
}

pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text.trim())
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// ISO-8601 rendering used for every timestamp the pipeline writes.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

pub fn timestamp_from_unix(seconds: i64) -> Option<DateTime<Utc>> {
    if seconds <= 0 {
        return None;
    }
    DateTime::from_timestamp(seconds, 0)
}
