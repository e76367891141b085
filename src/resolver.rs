// =============================================================================
// Symbol Resolver: static widget configuration and symbol metadata
// =============================================================================
//
// The catalog of tradable pairs is fetched once at startup. When that fetch
// fails the resolver still answers for any well-formed name on a configured
// exchange, so charts keep working against a flaky catalog endpoint.
// =============================================================================

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::FeedError;
use crate::history::{ExchangeCatalog, HistoryProvider};
use crate::market_data::symbol::{self, SymbolParts};
use crate::runtime_config::{ExchangeConfig, FeedConfig, SymbolType};
use crate::types::Resolution;

const SYMBOL_TYPE_CRYPTO: &str = "crypto";
const DEFAULT_PRICE_SCALE: u32 = 100;

/// Answer to the widget's `onReady`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatafeedConfiguration {
    pub supported_resolutions: Vec<Resolution>,
    pub exchanges: Vec<ExchangeConfig>,
    pub symbols_types: Vec<SymbolType>,
}

/// Full symbol metadata handed to `onResolved`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SymbolInfo {
    /// `exchange:base/quote`
    pub ticker: String,
    /// `base/quote`
    pub name: String,
    pub description: String,
    #[serde(rename = "type")]
    pub symbol_type: String,
    pub session: String,
    pub timezone: String,
    pub exchange: String,
    pub minmov: u32,
    pub pricescale: u32,
    pub has_intraday: bool,
    pub has_no_volume: bool,
    pub supported_resolutions: Vec<Resolution>,
    pub data_status: String,
    #[serde(skip)]
    pub parts: SymbolParts,
}

impl SymbolInfo {
    /// Key of the live channel carrying this symbol.
    pub fn market(&self) -> String {
        self.parts.market()
    }
}

/// One row of a symbol search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchResult {
    pub symbol: String,
    pub full_name: String,
    pub description: String,
    pub exchange: String,
    pub ticker: String,
    #[serde(rename = "type")]
    pub symbol_type: String,
}

pub struct Resolver {
    configuration: DatafeedConfiguration,
    catalog: RwLock<ExchangeCatalog>,
}

impl Resolver {
    pub fn new(config: &FeedConfig) -> Self {
        Self {
            configuration: DatafeedConfiguration {
                supported_resolutions: config.supported_resolutions.clone(),
                exchanges: config.exchanges.clone(),
                symbols_types: config.symbol_types.clone(),
            },
            catalog: RwLock::new(ExchangeCatalog::new()),
        }
    }

    pub fn configuration(&self) -> DatafeedConfiguration {
        self.configuration.clone()
    }

    pub fn supports(&self, resolution: Resolution) -> bool {
        self.configuration.supported_resolutions.contains(&resolution)
    }

    /// Fetch the pair catalog, keeping only configured exchanges.
    pub async fn load_catalog(&self, provider: &dyn HistoryProvider) {
        match provider.fetch_exchange_catalog().await {
            Ok(mut catalog) => {
                catalog.retain(|exchange, _| self.is_configured_exchange(exchange));
                let pairs: usize = catalog.values().map(|bases| bases.values().map(Vec::len).sum::<usize>()).sum();
                info!(exchanges = catalog.len(), pairs, "symbol catalog loaded");
                self.set_catalog(catalog);
            }
            Err(e) => {
                warn!(error = %e, "failed to load symbol catalog; resolving by name only");
            }
        }
    }

    pub fn set_catalog(&self, catalog: ExchangeCatalog) {
        *self.catalog.write() = catalog;
    }

    /// Resolve `name` (`exchange:base/quote`) to full metadata.
    pub fn resolve_symbol(&self, name: &str) -> Result<SymbolInfo, FeedError> {
        let parts = symbol::decode(name.trim()).ok_or_else(|| FeedError::unresolvable(name))?;

        if !self.is_configured_exchange(&parts.exchange) {
            return Err(FeedError::unresolvable(name));
        }

        let catalog = self.catalog.read();
        if let Some(bases) = catalog.get(&parts.exchange) {
            let listed = bases
                .get(&parts.from_symbol)
                .is_some_and(|quotes| quotes.contains(&parts.to_symbol));
            if !listed {
                return Err(FeedError::unresolvable(name));
            }
        }
        drop(catalog);

        Ok(self.symbol_info(parts))
    }

    /// Case-insensitive substring search over the catalog.
    pub fn search_symbols(&self, query: &str, exchange: Option<&str>, limit: usize) -> Vec<SearchResult> {
        let needle = query.trim().to_lowercase();
        let catalog = self.catalog.read();

        let results = catalog
            .iter()
            .filter(|(name, _)| exchange.map_or(true, |e| e.is_empty() || e == name.as_str()))
            .flat_map(|(name, bases)| {
                bases.iter().flat_map(move |(base, quotes)| {
                    quotes.iter().map(move |quote| symbol::encode(name, base, quote))
                })
            })
            .filter(|sym| sym.full.to_lowercase().contains(&needle))
            .take(limit)
            .map(|sym| SearchResult {
                description: sym.short.clone(),
                exchange: sym.full.split(':').next().unwrap_or_default().to_string(),
                ticker: sym.full.clone(),
                full_name: sym.full,
                symbol: sym.short,
                symbol_type: SYMBOL_TYPE_CRYPTO.to_string(),
            })
            .collect();
        results
    }

    fn is_configured_exchange(&self, exchange: &str) -> bool {
        self.configuration
            .exchanges
            .iter()
            .any(|e| e.value == exchange)
    }

    fn symbol_info(&self, parts: SymbolParts) -> SymbolInfo {
        let name = parts.name();
        SymbolInfo {
            ticker: name.full,
            description: name.short.clone(),
            name: name.short,
            symbol_type: SYMBOL_TYPE_CRYPTO.to_string(),
            session: "24x7".to_string(),
            timezone: "Etc/UTC".to_string(),
            exchange: parts.exchange.clone(),
            minmov: 1,
            pricescale: DEFAULT_PRICE_SCALE,
            has_intraday: self
                .configuration
                .supported_resolutions
                .iter()
                .any(|r| r.bucket_secs() < Resolution::Day1.bucket_secs()),
            has_no_volume: true,
            supported_resolutions: self.configuration.supported_resolutions.clone(),
            data_status: "streaming".to_string(),
            parts,
        }
    }
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("exchanges", &self.configuration.exchanges.len())
            .field("catalog", &self.catalog.read().len())
            .finish()
    }
}
