//! AeroDataBox airport lookup through API Market.

use std::sync::Arc;

use airdex_core::Icao;
use airdex_storage::{FetchError, HttpFetcher, RequestSpec};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tracing::info;

use crate::{AdapterContext, AirportLookup, LookupError};

pub const AERODATABOX_BASE_URL: &str = "https://prod.api.market/api/v1/aedbx/aerodatabox";

const SOURCE_ID: &str = "aerodatabox";

pub struct AeroDataBoxClient {
    http: Arc<HttpFetcher>,
    api_key: String,
    base_url: String,
}

impl AeroDataBoxClient {
    pub fn new(http: Arc<HttpFetcher>, api_key: impl Into<String>) -> Self {
        Self {
            http,
            api_key: api_key.into(),
            base_url: AERODATABOX_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn airport_url(&self, icao: &Icao) -> String {
        format!(
            "{}/airports/icao/{}?withRunways=false&withTime=false",
            self.base_url.trim_end_matches('/'),
            icao
        )
    }
}

#[async_trait]
impl AirportLookup for AeroDataBoxClient {
    async fn lookup(&self, ctx: &AdapterContext, icao: &Icao) -> Result<JsonValue, LookupError> {
        let request = RequestSpec::get(self.airport_url(icao))
            .header("accept", "application/json")
            .header("x-api-market-key", self.api_key.as_str());

        info!(%icao, "calling AeroDataBox");
        let response = match self.http.fetch_bytes(ctx.run_id, SOURCE_ID, &request).await {
            Ok(response) => response,
            Err(err) if err.status() == Some(404) => return Err(LookupError::NotFound(icao.clone())),
            Err(err) => return Err(err.into()),
        };

        if response.body.iter().all(u8::is_ascii_whitespace) {
            return Err(LookupError::NotFound(icao.clone()));
        }
        let payload: JsonValue =
            serde_json::from_slice(&response.body).map_err(|source| FetchError::Decode {
                url: response.final_url.clone(),
                source,
            })?;
        if payload.is_null() {
            return Err(LookupError::NotFound(icao.clone()));
        }
        Ok(payload)
    }
}
