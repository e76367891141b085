// =============================================================================
// Chart Feed: Main Entry Point
// =============================================================================
//
// Serves historical bars and multiplexed live bars to charting widgets. One
// WebSocket transport carries trades for every open market; the feed engine
// turns them into bars per subscribed chart.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────

mod api;
mod datafeed;
mod error;
mod history;
mod market_data;
mod resolver;
mod runtime_config;
mod types;

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::ApiState;
use crate::datafeed::{Datafeed, FeedEngine};
use crate::history::{HistoryClient, HistoryProvider};
use crate::market_data::transport::{run_transport, TransportExit};
use crate::market_data::WsChannelTransport;
use crate::resolver::Resolver;
use crate::runtime_config::FeedConfig;

const CONFIG_PATH: &str = "chart_feed.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Chart Feed starting up");

    let mut config = FeedConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        FeedConfig::default()
    });
    config.apply_overrides(|key| std::env::var(key).ok());

    info!(
        exchanges = ?config.exchanges.iter().map(|e| e.value.as_str()).collect::<Vec<_>>(),
        transport = %config.transport_url,
        history = %config.rest_base_url,
        "Feed configured"
    );

    // ── 2. History client & symbol catalog ───────────────────────────────
    let history: Arc<dyn HistoryProvider> = Arc::new(HistoryClient::new(&config)?);
    let resolver = Arc::new(Resolver::new(&config));
    resolver.load_catalog(history.as_ref()).await;

    // ── 3. Feed engine ───────────────────────────────────────────────────
    let (channel_tx, mut channel_rx) = mpsc::unbounded_channel();
    let (tick_tx, tick_rx) = mpsc::channel(config.tick_queue_capacity.max(1));

    let (engine, engine_handle) = FeedEngine::new(WsChannelTransport::new(channel_tx), tick_rx);
    tokio::spawn(engine.run());

    let feed = Arc::new(Datafeed::new(resolver, history, engine_handle));

    // ── 4. Live transport (reconnects forever) ───────────────────────────
    let transport_feed = feed.clone();
    let transport_url = config.transport_url.clone();
    let reconnect_delay = tokio::time::Duration::from_secs(config.reconnect_delay_secs);
    tokio::spawn(async move {
        let mut active = BTreeSet::new();
        let mut has_connected = false;
        loop {
            let result = run_transport(&transport_url, &mut channel_rx, &mut active, &tick_tx, || {
                // Ticks were missed while the socket was down.
                if has_connected {
                    transport_feed.reset_caches();
                }
                has_connected = true;
            })
            .await;

            match result {
                Ok(TransportExit::Shutdown) => break,
                Ok(TransportExit::Disconnected) => {
                    warn!(url = %transport_url, "Market transport disconnected — reconnecting in {}s", reconnect_delay.as_secs());
                }
                Err(e) => {
                    error!(url = %transport_url, error = %e, "Market transport error — reconnecting in {}s", reconnect_delay.as_secs());
                }
            }
            tokio::time::sleep(reconnect_delay).await;
        }
        info!("Market transport stopped");
    });

    // ── 5. Start the API server ──────────────────────────────────────────
    let api_state = Arc::new(ApiState::new(feed.clone()));
    let bind_addr = config.bind_addr.clone();

    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(addr = %bind_addr, error = %e, "Failed to bind API server");
                return;
            }
        };
        info!(addr = %bind_addr, "API server listening");
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping");

    info!(feed = ?feed, "Chart Feed shut down complete.");
    Ok(())
}
