// =============================================================================
// Datafeed: the charting widget's callback contract
// =============================================================================
//
// Ties the resolver, the history fetcher and the feed engine together. Each
// widget call has a `Result`-returning core method (used by the HTTP bridge)
// and a callback adapter with the widget's exact shape.
//
// The last bar of the first history page for a (symbol, resolution) is kept
// in `last_bars_cache` and seeds the live series when the chart subscribes.
// `get_bars` and `subscribe_bars` for one symbol run under the same async
// gate, so a subscription never races a fetch that is still in flight.
// =============================================================================

pub mod engine;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::FeedError;
use crate::history::{HistoryProvider, HistoryResult};
use crate::market_data::{SubscribeOutcome, SubscriptionHandle};
use crate::resolver::{DatafeedConfiguration, Resolver, SearchResult, SymbolInfo};
use crate::types::{Bar, Resolution};

pub use engine::{EngineHandle, FeedEngine};

/// Default number of rows returned by `search_symbols`.
pub const DEFAULT_SEARCH_LIMIT: usize = 30;

/// Range of one `get_bars` request, unix seconds, `from` inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodParams {
    pub from: i64,
    pub to: i64,
    pub first_data_request: bool,
}

/// Second argument of the widget's `onHistoryCallback`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryMeta {
    pub no_data: bool,
}

type ResetHook = Arc<dyn Fn() + Send + Sync>;

pub struct Datafeed {
    resolver: Arc<Resolver>,
    history: Arc<dyn HistoryProvider>,
    engine: EngineHandle,
    /// (ticker, resolution) -> last bar of the first history page.
    last_bars_cache: Mutex<HashMap<(String, Resolution), Bar>>,
    /// ticker -> gate serialising `history` and `subscribe_bars`.
    fetch_gates: FetchGates,
    /// subscriber id -> widget `onResetCacheNeededCallback`.
    reset_hooks: Mutex<HashMap<String, ResetHook>>,
}

impl Datafeed {
    pub fn new(resolver: Arc<Resolver>, history: Arc<dyn HistoryProvider>, engine: EngineHandle) -> Self {
        Self {
            resolver,
            history,
            engine,
            last_bars_cache: Mutex::new(HashMap::new()),
            fetch_gates: Mutex::new(HashMap::new()),
            reset_hooks: Mutex::new(HashMap::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Core operations
    // -------------------------------------------------------------------------

    pub fn configuration(&self) -> DatafeedConfiguration {
        self.resolver.configuration()
    }

    pub fn search(&self, query: &str, exchange: Option<&str>, symbol_type: Option<&str>, limit: usize) -> Vec<SearchResult> {
        let mut results = self.resolver.search_symbols(query, exchange, limit);
        if let Some(kind) = symbol_type.filter(|t| !t.is_empty()) {
            results.retain(|r| r.symbol_type == kind);
        }
        results
    }

    pub fn resolve(&self, name: &str) -> Result<SymbolInfo, FeedError> {
        let info = self.resolver.resolve_symbol(name)?;
        debug!(symbol = %info.ticker, "symbol resolved");
        Ok(info)
    }

    /// Fetch bars for `period`. On the first request of a chart the last bar
    /// is remembered as the seed for `subscribe_bars`.
    pub async fn history(
        &self,
        info: &SymbolInfo,
        resolution: Resolution,
        period: PeriodParams,
    ) -> Result<HistoryResult, FeedError> {
        self.ensure_supported(resolution)?;

        let _gate = self.lock_gate(&info.ticker).await;

        let result = self
            .history
            .fetch_bars(&info.parts, resolution, period.from, period.to)
            .await
            .map_err(|e| {
                warn!(symbol = %info.ticker, resolution = %resolution, error = %e, "history fetch failed");
                FeedError::history(&e)
            })?;

        if period.first_data_request {
            let key = (info.ticker.clone(), resolution);
            let mut cache = self.last_bars_cache.lock();
            match result.last_bar() {
                Some(bar) => {
                    cache.insert(key, bar);
                }
                None => {
                    cache.remove(&key);
                }
            }
        }

        debug!(
            symbol = %info.ticker,
            resolution = %resolution,
            bars = result.bars.len(),
            no_data = result.no_data,
            "history served"
        );
        Ok(result)
    }

    /// Cached seed bar for a chart, if its first history page had any rows.
    pub fn cached_last_bar(&self, ticker: &str, resolution: Resolution) -> Option<Bar> {
        self.last_bars_cache
            .lock()
            .get(&(ticker.to_string(), resolution))
            .copied()
    }

    // -------------------------------------------------------------------------
    // Widget callback contract
    // -------------------------------------------------------------------------

    pub fn on_ready(&self, callback: impl FnOnce(DatafeedConfiguration)) {
        callback(self.configuration());
    }

    pub fn search_symbols(
        &self,
        query: &str,
        exchange: &str,
        symbol_type: &str,
        on_result: impl FnOnce(Vec<SearchResult>),
    ) {
        let exchange = Some(exchange).filter(|e| !e.is_empty());
        on_result(self.search(query, exchange, Some(symbol_type), DEFAULT_SEARCH_LIMIT));
    }

    pub fn resolve_symbol(
        &self,
        name: &str,
        on_resolved: impl FnOnce(SymbolInfo),
        on_error: impl FnOnce(FeedError),
    ) {
        match self.resolve(name) {
            Ok(info) => on_resolved(info),
            Err(e) => {
                info!(symbol = %name, "cannot resolve symbol");
                on_error(e)
            }
        }
    }

    pub async fn get_bars(
        &self,
        info: &SymbolInfo,
        resolution: Resolution,
        period: PeriodParams,
        on_history: impl FnOnce(Vec<Bar>, HistoryMeta),
        on_error: impl FnOnce(FeedError),
    ) {
        match self.history(info, resolution, period).await {
            Ok(result) => on_history(result.bars, HistoryMeta { no_data: result.no_data }),
            Err(e) => on_error(e),
        }
    }

    /// Start live bars for `info` at `resolution`. `on_tick` is called with
    /// every updated bar until `unsubscribe_bars(subscriber_id)` returns.
    pub async fn subscribe_bars(
        &self,
        info: &SymbolInfo,
        resolution: Resolution,
        on_tick: impl FnMut(&Bar) + Send + 'static,
        subscriber_id: &str,
        on_reset_cache: impl Fn() + Send + Sync + 'static,
    ) -> Result<SubscribeOutcome, FeedError> {
        self.ensure_supported(resolution)?;

        let _gate = self.lock_gate(&info.ticker).await;

        let seed = self.cached_last_bar(&info.ticker, resolution);
        let outcome = self
            .engine
            .subscribe(
                info.market(),
                resolution,
                SubscriptionHandle::new(subscriber_id, on_tick),
                seed,
            )
            .await?;

        self.reset_hooks
            .lock()
            .insert(subscriber_id.to_string(), Arc::new(on_reset_cache));

        info!(
            subscriber = %subscriber_id,
            symbol = %info.ticker,
            resolution = %resolution,
            seeded = seed.is_some(),
            ?outcome,
            "live bars subscribed"
        );
        Ok(outcome)
    }

    /// Returns whether the subscriber was known.
    pub async fn unsubscribe_bars(&self, subscriber_id: &str) -> Result<bool, FeedError> {
        let removed = self.engine.unsubscribe(subscriber_id).await?;
        self.reset_hooks.lock().remove(subscriber_id);
        if removed {
            info!(subscriber = %subscriber_id, "live bars unsubscribed");
        }
        Ok(removed)
    }

    /// Forget cached seeds and tell every subscribed chart to refetch. Called
    /// after the live transport reconnects, since ticks may have been missed.
    pub fn reset_caches(&self) {
        self.last_bars_cache.lock().clear();
        let hooks: Vec<ResetHook> = self.reset_hooks.lock().values().cloned().collect();
        info!(charts = hooks.len(), "resetting chart caches");
        for hook in hooks {
            hook();
        }
    }

    fn ensure_supported(&self, resolution: Resolution) -> Result<(), FeedError> {
        if self.resolver.supports(resolution) {
            Ok(())
        } else {
            Err(FeedError::UnsupportedResolution(resolution.to_string()))
        }
    }

    async fn lock_gate(&self, ticker: &str) -> GateGuard<'_> {
        let gate = self
            .fetch_gates
            .lock()
            .entry(ticker.to_string())
            .or_default()
            .clone();
        let guard = gate.lock_owned().await;
        GateGuard {
            gates: &self.fetch_gates,
            ticker: ticker.to_string(),
            guard: Some(guard),
        }
    }
}

type FetchGates = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// Held while a symbol's history fetch or subscribe runs. The map entry is
/// removed when the last holder releases a gate nobody is waiting on.
struct GateGuard<'a> {
    gates: &'a FetchGates,
    ticker: String,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        // Clones are only taken under the map lock, so the count is stable here.
        let mut gates = self.gates.lock();
        drop(self.guard.take());
        if gates
            .get(&self.ticker)
            .is_some_and(|gate| Arc::strong_count(gate) == 1)
        {
            gates.remove(&self.ticker);
        }
    }
}

impl std::fmt::Debug for Datafeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Datafeed")
            .field("resolver", &self.resolver)
            .field("cached_bars", &self.last_bars_cache.lock().len())
            .field("subscribers", &self.reset_hooks.lock().len())
            .finish()
    }
}
