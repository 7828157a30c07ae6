//! Steam Workshop catalog scraper (source A).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use airdex_core::{timestamp_from_unix, Candidate, IcaoExtractor, Provenance, WorkshopItem};
use airdex_storage::{HttpFetcher, RequestPacer, RequestSpec};
use async_trait::async_trait;
use scraper::{Html, Selector};
use serde_json::Value as JsonValue;
use tracing::{error, info, warn};

use crate::{json_path, json_str, json_u64, AdapterContext, AdapterError, CandidateSource};

pub const STEAM_BROWSE_URL: &str = "https://steamcommunity.com/workshop/browse/";
pub const STEAM_DETAILS_URL: &str =
    "https://api.steampowered.com/ISteamRemoteStorage/GetPublishedFileDetails/v1/";
pub const STEAM_ITEM_URL: &str = "https://steamcommunity.com/sharedfiles/filedetails/?id=";

const SOURCE_ID: &str = "steam";
const ID_MARKER: &str = "filedetails/?id=";

#[derive(Debug, Clone)]
pub struct SteamConfig {
    pub app_id: u32,
    pub page_cap: usize,
    pub page_delay: Duration,
}

impl Default for SteamConfig {
    fn default() -> Self {
        Self {
            app_id: 3239550,
            page_cap: 50,
            page_delay: Duration::from_secs(1),
        }
    }
}

/// Fields of a published file that matter for airport candidates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkshopDetails {
    pub title: String,
    pub creator: String,
    pub time_updated: i64,
    pub subscriptions: u64,
}

pub struct SteamWorkshopSource {
    http: Arc<HttpFetcher>,
    extractor: Arc<IcaoExtractor>,
    config: SteamConfig,
    page_pacer: RequestPacer,
}

impl SteamWorkshopSource {
    pub fn new(http: Arc<HttpFetcher>, extractor: Arc<IcaoExtractor>, config: SteamConfig) -> Self {
        let page_pacer = RequestPacer::new(config.page_delay);
        Self {
            http,
            extractor,
            config,
            page_pacer,
        }
    }

    pub fn browse_url(&self, page: usize) -> String {
        format!(
            "{STEAM_BROWSE_URL}?appid={}&browsesort=mostrecent&section=readytouseitems&p={page}",
            self.config.app_id
        )
    }

    /// Walk the "most recent" browse pages until one has no items or the page cap is hit.
    async fn fetch_workshop_ids(&self, ctx: &AdapterContext) -> Result<Vec<String>, AdapterError> {
        let mut ids = Vec::new();
        let mut seen = HashSet::new();

        for page in 1..=self.config.page_cap {
            self.page_pacer.wait().await;
            let url = self.browse_url(page);
            let response = match self
                .http
                .fetch_bytes(ctx.run_id, SOURCE_ID, &RequestSpec::get(&url))
                .await
            {
                Ok(response) => response,
                Err(err) if page == 1 => return Err(err.into()),
                Err(err) => {
                    warn!(page, error = %err, "steam browse page failed, keeping ids gathered so far");
                    return Ok(ids);
                }
            };

            let html = String::from_utf8_lossy(&response.body);
            let found = parse_browse_page(&html)?;
            if found.is_empty() {
                info!(page, "no workshop items on page, stopping");
                return Ok(ids);
            }

            let mut new_count = 0usize;
            for id in &found {
                if seen.insert(id.clone()) {
                    ids.push(id.clone());
                    new_count += 1;
                }
            }
            info!(page, found = found.len(), new = new_count, total = ids.len(), "steam browse page");
        }

        warn!(page_cap = self.config.page_cap, "reached steam browse page cap");
        Ok(ids)
    }

    async fn fetch_details(
        &self,
        ctx: &AdapterContext,
        workshop_id: &str,
    ) -> Result<WorkshopDetails, AdapterError> {
        let request = RequestSpec::post_form(
            STEAM_DETAILS_URL,
            [("itemcount", "1"), ("publishedfileids[0]", workshop_id)],
        );
        let body: JsonValue = self.http.fetch_json(ctx.run_id, SOURCE_ID, &request).await?;
        parse_details_response(&body, workshop_id)
    }
}

#[async_trait]
impl CandidateSource for SteamWorkshopSource {
    fn source(&self) -> Provenance {
        Provenance::Steam
    }

    async fn collect(&self, ctx: &AdapterContext) -> Result<Vec<Candidate>, AdapterError> {
        let workshop_ids = self.fetch_workshop_ids(ctx).await?;
        info!(total = workshop_ids.len(), "steam workshop ids fetched");

        let mut candidates = Vec::new();
        for workshop_id in &workshop_ids {
            let details = match self.fetch_details(ctx, workshop_id).await {
                Ok(details) => details,
                Err(err) => {
                    error!(workshop_id, error = %err, "steam details failed");
                    continue;
                }
            };
            match candidate_from_details(&self.extractor, workshop_id, details) {
                Some(candidate) => candidates.push(candidate),
                None => warn!(workshop_id, "could not parse ICAO from workshop title, skipping"),
            }
        }

        info!(items = workshop_ids.len(), candidates = candidates.len(), "steam scrape finished");
        Ok(candidates)
    }
}

/// Workshop item ids linked from a browse page, in page order (duplicates kept).
pub fn parse_browse_page(html: &str) -> Result<Vec<String>, AdapterError> {
    let document = Html::parse_document(html);
    let links = Selector::parse("a[href]").map_err(|e| AdapterError::Message(e.to_string()))?;
    Ok(document
        .select(&links)
        .filter_map(|node| node.value().attr("href"))
        .filter_map(workshop_id_from_href)
        .collect())
}

fn workshop_id_from_href(href: &str) -> Option<String> {
    let start = href.find(ID_MARKER)? + ID_MARKER.len();
    let digits: String = href[start..].chars().take_while(char::is_ascii_digit).collect();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}

pub fn parse_details_response(body: &JsonValue, workshop_id: &str) -> Result<WorkshopDetails, AdapterError> {
    let first = json_path(body, &["response", "publishedfiledetails"])
        .and_then(JsonValue::as_array)
        .and_then(|items| items.first())
        .ok_or_else(|| AdapterError::Message(format!("no details returned for workshop {workshop_id}")))?;

    Ok(WorkshopDetails {
        title: json_str(first, &["title"]).unwrap_or_default().to_string(),
        creator: json_str(first, &["creator"]).unwrap_or("Unknown").to_string(),
        time_updated: json_u64(first, &["time_updated"])
            .and_then(|v| i64::try_from(v).ok())
            .unwrap_or(0),
        subscriptions: json_u64(first, &["subscriptions"]).unwrap_or(0),
    })
}

pub fn candidate_from_details(
    extractor: &IcaoExtractor,
    workshop_id: &str,
    details: WorkshopDetails,
) -> Option<Candidate> {
    let icao = extractor.extract(&details.title)?;
    Some(Candidate::workshop(
        icao,
        WorkshopItem {
            published_file_id: workshop_id.to_string(),
            title: details.title,
            creator: details.creator,
            time_updated: timestamp_from_unix(details.time_updated),
            workshop_url: format!("{STEAM_ITEM_URL}{workshop_id}"),
            subscriptions: details.subscriptions,
        },
    ))
}
