//! HTTP/WebSocket bridge exposing the `Datafeed` to browser-resident charts.

pub mod rest;
pub mod ws;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::http::StatusCode;
use axum::Json;

use crate::datafeed::Datafeed;
use crate::error::FeedError;

/// Shared state handed to every handler.
pub struct ApiState {
    pub feed: Arc<Datafeed>,
    next_connection: AtomicU64,
}

impl ApiState {
    pub fn new(feed: Arc<Datafeed>) -> Self {
        Self {
            feed,
            next_connection: AtomicU64::new(1),
        }
    }

    /// Id used to scope one WebSocket connection's subscriber ids.
    pub fn next_connection_id(&self) -> u64 {
        self.next_connection.fetch_add(1, Ordering::Relaxed)
    }
}

pub type ApiError = (StatusCode, Json<serde_json::Value>);

pub fn status_for(err: &FeedError) -> StatusCode {
    match err {
        FeedError::UnresolvableSymbol(_) => StatusCode::NOT_FOUND,
        FeedError::UnsupportedResolution(_) => StatusCode::BAD_REQUEST,
        FeedError::History(_) => StatusCode::BAD_GATEWAY,
        FeedError::SubscriberConflict(_) => StatusCode::CONFLICT,
        FeedError::EngineStopped => StatusCode::SERVICE_UNAVAILABLE,
    }
}

pub fn api_error(err: FeedError) -> ApiError {
    (
        status_for(&err),
        Json(serde_json::json!({ "error": err.to_string() })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_http_statuses() {
        assert_eq!(status_for(&FeedError::unresolvable("x")), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&FeedError::History("503".into())), StatusCode::BAD_GATEWAY);

        let (status, Json(body)) = api_error(FeedError::UnsupportedResolution("3W".into()));
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "unsupported resolution: 3W");
    }
}
