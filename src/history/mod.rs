pub mod client;

pub use client::{ExchangeCatalog, HistoryClient, HistoryProvider, HistoryResult};
