// =============================================================================
// Historical Bar Client: one bounded REST call per history request
// =============================================================================
//
// Talks to a CryptoCompare-style market data API:
//   GET /data/histoday|histohour|histominute?e=&fsym=&tsym=&toTs=&limit=&aggregate=
//   GET /data/v3/all/exchanges
//
// An upstream `"Response": "Error"` or an empty `Data` array is the valid
// "no data" terminal state, not a failure. Transport and parse problems are
// returned as errors for the caller to surface.
// =============================================================================

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::market_data::SymbolParts;
use crate::runtime_config::FeedConfig;
use crate::types::{parse_decimal, Bar, Resolution};

/// `exchange -> base -> [quote]`
pub type ExchangeCatalog = BTreeMap<String, BTreeMap<String, Vec<String>>>;

/// Bars for one history request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResult {
    pub bars: Vec<Bar>,
    pub no_data: bool,
}

impl HistoryResult {
    pub fn no_data() -> Self {
        Self {
            bars: Vec::new(),
            no_data: true,
        }
    }

    /// The bar live updates continue from.
    pub fn last_bar(&self) -> Option<Bar> {
        self.bars.last().copied()
    }
}

/// Source of historical bars and of the tradable-pair catalog.
#[async_trait]
pub trait HistoryProvider: Send + Sync {
    /// Bars with `range_start <= time < range_end`, oldest first.
    async fn fetch_bars(
        &self,
        symbol: &SymbolParts,
        resolution: Resolution,
        range_start: i64,
        range_end: i64,
    ) -> Result<HistoryResult>;

    async fn fetch_exchange_catalog(&self) -> Result<ExchangeCatalog>;
}

/// REST client for the history API.
#[derive(Clone)]
pub struct HistoryClient {
    base_url: String,
    max_bars: u32,
    client: reqwest::Client,
}

impl HistoryClient {
    pub fn new(config: &FeedConfig) -> Result<Self> {
        let mut default_headers = HeaderMap::new();
        if let Some(key) = &config.api_key {
            let value = HeaderValue::from_str(&format!("Apikey {key}"))
                .context("API key contains invalid header characters")?;
            default_headers.insert(AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("failed to build HTTP client")?;

        debug!(base_url = %config.rest_base_url, "HistoryClient initialised");

        Ok(Self {
            base_url: config.rest_base_url.trim_end_matches('/').to_string(),
            max_bars: config.max_history_bars.max(1),
            client,
        })
    }

    async fn get_json(&self, path: &str, query: &[(&str, String)]) -> Result<serde_json::Value> {
        let url = format!("{}{}", self.base_url, path);

        let resp = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .with_context(|| format!("GET {path} request failed"))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {path} response"))?;

        if !status.is_success() {
            anyhow::bail!("GET {} returned {}: {}", path, status, body);
        }

        Ok(body)
    }
}

#[async_trait]
impl HistoryProvider for HistoryClient {
    #[instrument(skip(self), name = "history::fetch_bars")]
    async fn fetch_bars(
        &self,
        symbol: &SymbolParts,
        resolution: Resolution,
        range_start: i64,
        range_end: i64,
    ) -> Result<HistoryResult> {
        let (path, aggregate) = endpoint_for(resolution);
        let limit = bars_limit(resolution, range_start, range_end, self.max_bars);

        let query = [
            ("e", symbol.exchange.clone()),
            ("fsym", symbol.from_symbol.clone()),
            ("tsym", symbol.to_symbol.clone()),
            ("toTs", range_end.to_string()),
            ("limit", limit.to_string()),
            ("aggregate", aggregate.to_string()),
        ];

        let body = self.get_json(path, &query).await?;
        let result = parse_history_response(&body, range_start, range_end)?;

        debug!(
            bars = result.bars.len(),
            no_data = result.no_data,
            "history fetched"
        );
        Ok(result)
    }

    #[instrument(skip(self), name = "history::fetch_exchange_catalog")]
    async fn fetch_exchange_catalog(&self) -> Result<ExchangeCatalog> {
        let body = self.get_json("/data/v3/all/exchanges", &[]).await?;
        let catalog = parse_exchange_catalog(&body)?;
        debug!(exchanges = catalog.len(), "exchange catalog fetched");
        Ok(catalog)
    }
}

impl std::fmt::Debug for HistoryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryClient")
            .field("base_url", &self.base_url)
            .field("max_bars", &self.max_bars)
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Request helpers
// -----------------------------------------------------------------------------

/// Endpoint path and `aggregate` parameter for a resolution.
fn endpoint_for(resolution: Resolution) -> (&'static str, u32) {
    match resolution {
        Resolution::Minute1 => ("/data/histominute", 1),
        Resolution::Minute5 => ("/data/histominute", 5),
        Resolution::Minute15 => ("/data/histominute", 15),
        Resolution::Hour1 => ("/data/histohour", 1),
        Resolution::Hour4 => ("/data/histohour", 4),
        Resolution::Day1 => ("/data/histoday", 1),
    }
}

/// Number of buckets covering the range, clamped to `[1, max_bars]`.
fn bars_limit(resolution: Resolution, range_start: i64, range_end: i64, max_bars: u32) -> u32 {
    let span = (range_end - range_start).max(0);
    let bucket = resolution.bucket_secs();
    let buckets = (span + bucket - 1) / bucket;
    buckets.clamp(1, i64::from(max_bars)) as u32
}

// -----------------------------------------------------------------------------
// Response parsing
// -----------------------------------------------------------------------------

/// Turn a history response into range-filtered bars.
pub fn parse_history_response(
    body: &serde_json::Value,
    range_start: i64,
    range_end: i64,
) -> Result<HistoryResult> {
    if body["Response"].as_str() == Some("Error") {
        debug!(message = ?body["Message"].as_str(), "upstream reported no data");
        return Ok(HistoryResult::no_data());
    }

    // v1 endpoints return `Data: [...]`, v2 nests it as `Data: { Data: [...] }`.
    let rows = body["Data"]
        .as_array()
        .or_else(|| body["Data"]["Data"].as_array())
        .context("history response missing Data array")?;

    if rows.is_empty() {
        return Ok(HistoryResult::no_data());
    }

    let mut bars = Vec::with_capacity(rows.len());
    for row in rows {
        let time = row["time"].as_i64().context("history row missing time")?;
        if time < range_start || time >= range_end {
            continue;
        }
        bars.push(Bar {
            time,
            open: parse_decimal(&row["open"], "open")?,
            high: parse_decimal(&row["high"], "high")?,
            low: parse_decimal(&row["low"], "low")?,
            close: parse_decimal(&row["close"], "close")?,
        });
    }

    bars.sort_by_key(|b| b.time);
    bars.dedup_by_key(|b| b.time);

    Ok(HistoryResult {
        bars,
        no_data: false,
    })
}

/// Parse `/data/v3/all/exchanges`. Pairs are accepted either as
/// `pairs: { BTC: ["USD", ...] }` or `pairs: { BTC: { tsyms: { USD: {...} } } }`.
pub fn parse_exchange_catalog(body: &serde_json::Value) -> Result<ExchangeCatalog> {
    let exchanges = body["Data"]
        .as_object()
        .context("exchange catalog missing Data object")?;

    let mut catalog = ExchangeCatalog::new();
    for (exchange, info) in exchanges {
        let Some(pairs) = info["pairs"].as_object() else {
            warn!(exchange = %exchange, "exchange entry without pairs");
            continue;
        };

        let mut bases = BTreeMap::new();
        for (base, quotes) in pairs {
            let quotes: Vec<String> = match quotes {
                serde_json::Value::Array(list) => list
                    .iter()
                    .filter_map(|q| q.as_str().map(str::to_string))
                    .collect(),
                other => other["tsyms"]
                    .as_object()
                    .map(|tsyms| tsyms.keys().cloned().collect())
                    .unwrap_or_default(),
            };
            if !quotes.is_empty() {
                bases.insert(base.clone(), quotes);
            }
        }
        catalog.insert(exchange.clone(), bases);
    }

    Ok(catalog)
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
