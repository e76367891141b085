// =============================================================================
// REST API Endpoints: Axum 0.7
// =============================================================================
//
// Every endpoint lives under `/api/v1/` and maps one-to-one onto a widget
// call: `config` is `onReady`, `symbols` is `resolveSymbol`, `search` is
// `searchSymbols` and `history` is `getBars`. Live bars are served by the
// WebSocket at `/api/v1/stream`.
//
// CORS is permissive; the bridge is meant to sit next to the chart page.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Query, State},
    response::IntoResponse,
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::api::{api_error, ApiError, ApiState};
use crate::datafeed::{PeriodParams, DEFAULT_SEARCH_LIMIT};
use crate::types::Resolution;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full bridge router with CORS middleware and shared state.
pub fn router(state: Arc<ApiState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/config", get(config))
        .route("/api/v1/symbols", get(symbols))
        .route("/api/v1/search", get(search))
        .route("/api/v1/history", get(history))
        .route("/api/v1/stream", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    server_time: i64,
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

// =============================================================================
// onReady / resolveSymbol / searchSymbols
// =============================================================================

async fn config(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(state.feed.configuration())
}

#[derive(Deserialize)]
struct SymbolQuery {
    symbol: String,
}

async fn symbols(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<SymbolQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let info = state.feed.resolve(&query.symbol).map_err(api_error)?;
    Ok(Json(info))
}

#[derive(Deserialize)]
struct SearchQuery {
    #[serde(default)]
    query: String,
    exchange: Option<String>,
    #[serde(rename = "type")]
    symbol_type: Option<String>,
    limit: Option<usize>,
}

async fn search(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<SearchQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(DEFAULT_SEARCH_LIMIT);
    Json(state.feed.search(
        &query.query,
        query.exchange.as_deref().filter(|e| !e.is_empty()),
        query.symbol_type.as_deref(),
        limit,
    ))
}

// =============================================================================
// getBars
// =============================================================================

#[derive(Deserialize)]
struct HistoryQuery {
    symbol: String,
    resolution: String,
    from: i64,
    to: i64,
    #[serde(default)]
    first_data_request: bool,
}

async fn history(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<HistoryQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let info = state.feed.resolve(&query.symbol).map_err(api_error)?;
    let resolution: Resolution = query.resolution.parse().map_err(api_error)?;

    let result = state
        .feed
        .history(
            &info,
            resolution,
            PeriodParams {
                from: query.from,
                to: query.to,
                first_data_request: query.first_data_request,
            },
        )
        .await
        .map_err(api_error)?;

    Ok(Json(result))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_query_defaults_first_request_to_false() {
        let q: HistoryQuery = serde_json::from_value(serde_json::json!({
            "symbol": "Bitfinex:BTC/USD",
            "resolution": "1D",
            "from": 0,
            "to": 86_400,
        }))
        .unwrap();
        assert!(!q.first_data_request);
        assert_eq!(q.resolution.parse::<Resolution>().unwrap(), Resolution::Day1);
    }

    #[test]
    fn search_query_accepts_type_alias() {
        let q: SearchQuery = serde_json::from_value(serde_json::json!({ "type": "crypto" })).unwrap();
        assert_eq!(q.query, "");
        assert_eq!(q.symbol_type.as_deref(), Some("crypto"));
        assert!(q.limit.is_none());
    }
}
