// =============================================================================
// Shared types used across the chart feed
// =============================================================================

use std::str::FromStr;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One OHLC bar. `time` is the bucket start in unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bar {
    pub time: i64,
    #[serde(with = "rust_decimal::serde::float")]
    pub open: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub high: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub low: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub close: Decimal,
}

impl Bar {
    /// A flat bar where every price equals `price`.
    pub fn flat(time: i64, price: Decimal) -> Self {
        Self {
            time,
            open: price,
            high: price,
            low: price,
            close: price,
        }
    }

    /// Bucket start in milliseconds, the unit charting widgets plot in.
    pub fn time_ms(&self) -> i64 {
        self.time.saturating_mul(1000)
    }
}

/// A single trade from the live transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeTick {
    pub market: String,
    pub price: Decimal,
    /// Unix seconds.
    pub timestamp: i64,
}

/// Bar resolution, serialised the way charting widgets name them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Resolution {
    #[serde(rename = "1")]
    Minute1,
    #[serde(rename = "5")]
    Minute5,
    #[serde(rename = "15")]
    Minute15,
    #[serde(rename = "60")]
    Hour1,
    #[serde(rename = "240")]
    Hour4,
    #[serde(rename = "1D", alias = "D")]
    Day1,
}

impl Resolution {
    pub const ALL: [Resolution; 6] = [
        Self::Minute1,
        Self::Minute5,
        Self::Minute15,
        Self::Hour1,
        Self::Hour4,
        Self::Day1,
    ];

    /// Width of one bucket in seconds.
    pub fn bucket_secs(self) -> i64 {
        match self {
            Self::Minute1 => 60,
            Self::Minute5 => 5 * 60,
            Self::Minute15 => 15 * 60,
            Self::Hour1 => 3_600,
            Self::Hour4 => 4 * 3_600,
            Self::Day1 => 86_400,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Minute1 => "1",
            Self::Minute5 => "5",
            Self::Minute15 => "15",
            Self::Hour1 => "60",
            Self::Hour4 => "240",
            Self::Day1 => "1D",
        }
    }

    /// Start of the bucket containing `timestamp`.
    pub fn align(self, timestamp: i64) -> i64 {
        timestamp.div_euclid(self.bucket_secs()) * self.bucket_secs()
    }
}

impl Default for Resolution {
    fn default() -> Self {
        Self::Day1
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resolution {
    type Err = crate::error::FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1" => Ok(Self::Minute1),
            "5" => Ok(Self::Minute5),
            "15" => Ok(Self::Minute15),
            "60" => Ok(Self::Hour1),
            "240" => Ok(Self::Hour4),
            "1D" | "D" => Ok(Self::Day1),
            other => Err(crate::error::FeedError::UnsupportedResolution(other.to_string())),
        }
    }
}

/// Parse a price that upstream sends either as a JSON string or a number.
pub fn parse_decimal(val: &serde_json::Value, name: &str) -> Result<Decimal> {
    match val {
        serde_json::Value::String(s) => parse_decimal_str(s)
            .with_context(|| format!("failed to parse {name} as decimal: {s}")),
        serde_json::Value::Number(n) => parse_decimal_str(&n.to_string())
            .with_context(|| format!("field {name} is not a valid decimal")),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}

fn parse_decimal_str(s: &str) -> Result<Decimal> {
    Decimal::from_str(s)
        .or_else(|_| Decimal::from_scientific(s))
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn resolution_parses_widget_names() {
        assert_eq!("1D".parse::<Resolution>().unwrap(), Resolution::Day1);
        assert_eq!("D".parse::<Resolution>().unwrap(), Resolution::Day1);
        assert_eq!("240".parse::<Resolution>().unwrap(), Resolution::Hour4);
        assert!("3W".parse::<Resolution>().is_err());
    }

    #[test]
    fn resolution_serde_uses_widget_names() {
        let json = serde_json::to_string(&Resolution::Minute15).unwrap();
        assert_eq!(json, "\"15\"");
        let back: Resolution = serde_json::from_str("\"D\"").unwrap();
        assert_eq!(back, Resolution::Day1);
    }

    #[test]
    fn align_floors_to_bucket_start() {
        assert_eq!(Resolution::Day1.align(86_400 * 3 + 5), 86_400 * 3);
        assert_eq!(Resolution::Minute5.align(299), 0);
        assert_eq!(Resolution::Minute5.align(300), 300);
    }

    #[test]
    fn parse_decimal_accepts_strings_numbers_and_exponents() {
        assert_eq!(parse_decimal(&serde_json::json!("0.00012"), "p").unwrap(), dec!(0.00012));
        assert_eq!(parse_decimal(&serde_json::json!(42), "p").unwrap(), dec!(42));
        assert_eq!(parse_decimal(&serde_json::json!("1e-7"), "p").unwrap(), dec!(0.0000001));
        assert!(parse_decimal(&serde_json::json!(null), "p").is_err());
        assert!(parse_decimal(&serde_json::json!("abc"), "p").is_err());
    }

    #[test]
    fn bar_serialises_prices_as_numbers() {
        let bar = Bar::flat(60, dec!(1.5));
        let json = serde_json::to_value(bar).unwrap();
        assert_eq!(json["time"], 60);
        assert_eq!(json["close"], 1.5);
        assert_eq!(bar.time_ms(), 60_000);
    }

    #[test]
    fn time_ms_saturates_instead_of_overflowing() {
        assert_eq!(Bar::flat(86_400, dec!(1)).time_ms(), 86_400_000);
        assert_eq!(Bar::flat(i64::MAX / 10, dec!(1)).time_ms(), i64::MAX);
        assert_eq!(Bar::flat(i64::MIN, dec!(1)).time_ms(), i64::MIN);
    }
}
