// =============================================================================
// Feed Configuration: endpoints, exchanges and widget capabilities
// =============================================================================
//
// Loaded once at startup from `chart_feed.json`, then overridden from the
// environment. All fields carry `#[serde(default)]` so that a partial (or
// empty) file still loads.
//
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::Resolution;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_transport_url() -> String {
    "ws://127.0.0.1:8765/ws".to_string()
}

fn default_rest_base_url() -> String {
    "https://min-api.cryptocompare.com".to_string()
}

fn default_supported_resolutions() -> Vec<Resolution> {
    Resolution::ALL.to_vec()
}

fn default_exchanges() -> Vec<ExchangeConfig> {
    vec![
        ExchangeConfig::new("Bitfinex", "Bitfinex", "Bitfinex"),
        ExchangeConfig::new("Kraken", "Kraken", "Kraken bitcoin exchange"),
    ]
}

fn default_symbol_types() -> Vec<SymbolType> {
    vec![SymbolType {
        name: "crypto".to_string(),
        value: "crypto".to_string(),
    }]
}

fn default_max_history_bars() -> u32 {
    2000
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

fn default_tick_queue_capacity() -> usize {
    1024
}

// =============================================================================
// Exchange / symbol type descriptors
// =============================================================================

/// An exchange offered to the chart's symbol search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeConfig {
    pub value: String,
    pub name: String,
    pub desc: String,
}

impl ExchangeConfig {
    pub fn new(value: &str, name: &str, desc: &str) -> Self {
        Self {
            value: value.to_string(),
            name: name.to_string(),
            desc: desc.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolType {
    pub name: String,
    pub value: String,
}

// =============================================================================
// FeedConfig
// =============================================================================

#[derive(Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    // --- Endpoints -----------------------------------------------------------

    /// Address the HTTP/WebSocket bridge listens on.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Live trade transport (WebSocket).
    #[serde(default = "default_transport_url")]
    pub transport_url: String,

    /// Base URL of the historical bar REST API.
    #[serde(default = "default_rest_base_url")]
    pub rest_base_url: String,

    /// Optional REST API key. Never written to logs.
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,

    // --- Widget capabilities -------------------------------------------------

    #[serde(default = "default_supported_resolutions")]
    pub supported_resolutions: Vec<Resolution>,

    #[serde(default = "default_exchanges")]
    pub exchanges: Vec<ExchangeConfig>,

    #[serde(default = "default_symbol_types")]
    pub symbol_types: Vec<SymbolType>,

    // --- Limits --------------------------------------------------------------

    /// Upper bound on bars requested in one history call.
    #[serde(default = "default_max_history_bars")]
    pub max_history_bars: u32,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Pause between transport reconnect attempts.
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,

    /// Ticks buffered between the transport task and the feed engine.
    #[serde(default = "default_tick_queue_capacity")]
    pub tick_queue_capacity: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            transport_url: default_transport_url(),
            rest_base_url: default_rest_base_url(),
            api_key: None,
            supported_resolutions: default_supported_resolutions(),
            exchanges: default_exchanges(),
            symbol_types: default_symbol_types(),
            max_history_bars: default_max_history_bars(),
            request_timeout_secs: default_request_timeout_secs(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
            tick_queue_capacity: default_tick_queue_capacity(),
        }
    }
}

impl std::fmt::Debug for FeedConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedConfig")
            .field("bind_addr", &self.bind_addr)
            .field("transport_url", &self.transport_url)
            .field("rest_base_url", &self.rest_base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("supported_resolutions", &self.supported_resolutions)
            .field("exchanges", &self.exchanges)
            .field("symbol_types", &self.symbol_types)
            .field("max_history_bars", &self.max_history_bars)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("reconnect_delay_secs", &self.reconnect_delay_secs)
            .field("tick_queue_capacity", &self.tick_queue_capacity)
            .finish()
    }
}

impl FeedConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read feed config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse feed config from {}", path.display()))?;

        info!(
            path = %path.display(),
            exchanges = config.exchanges.len(),
            transport = %config.transport_url,
            "feed config loaded"
        );

        Ok(config)
    }

    /// Apply `CHART_FEED_*` / `CRYPTOCOMPARE_API_KEY` overrides. `lookup` is
    /// `std::env::var` in production.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(addr) = lookup("CHART_FEED_BIND_ADDR") {
            self.bind_addr = addr;
        }
        if let Some(url) = lookup("CHART_FEED_WS_URL") {
            self.transport_url = url;
        }
        if let Some(url) = lookup("CHART_FEED_REST_URL") {
            self.rest_base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(key) = lookup("CRYPTOCOMPARE_API_KEY").filter(|k| !k.trim().is_empty()) {
            self.api_key = Some(key);
        }
        if let Some(list) = lookup("CHART_FEED_EXCHANGES") {
            let exchanges: Vec<ExchangeConfig> = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| ExchangeConfig::new(s, s, s))
                .collect();
            if !exchanges.is_empty() {
                self.exchanges = exchanges;
            }
        }
    }
}
