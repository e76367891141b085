//! Error values handed to chart callbacks and HTTP clients.

use thiserror::Error;

/// Failures surfaced through the widget's `on_error` callbacks.
///
/// None of these are fatal: a failed resolve or fetch leaves the live
/// subscription state untouched and the caller may simply retry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FeedError {
    #[error("cannot resolve symbol: {0}")]
    UnresolvableSymbol(String),

    #[error("unsupported resolution: {0}")]
    UnsupportedResolution(String),

    #[error("history request failed: {0}")]
    History(String),

    #[error("subscriber id already in use for another symbol: {0}")]
    SubscriberConflict(String),

    #[error("feed engine is not running")]
    EngineStopped,
}

impl FeedError {
    pub fn unresolvable(name: impl Into<String>) -> Self {
        FeedError::UnresolvableSymbol(name.into())
    }

    pub fn history(err: &anyhow::Error) -> Self {
        FeedError::History(format!("{err:#}"))
    }
}
