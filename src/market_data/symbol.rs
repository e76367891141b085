//! Symbol codec for `exchange:base/quote` identifiers.

use serde::{Deserialize, Serialize};

/// Display names produced by [`encode`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolName {
    /// `base/quote`
    pub short: String,
    /// `exchange:base/quote`
    pub full: String,
}

/// The parts of a decoded full symbol name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolParts {
    pub exchange: String,
    pub from_symbol: String,
    pub to_symbol: String,
}

impl SymbolParts {
    /// Market key used by the live transport, e.g. `btcusd`.
    pub fn market(&self) -> String {
        format!("{}{}", self.from_symbol, self.to_symbol).to_lowercase()
    }

    pub fn name(&self) -> SymbolName {
        encode(&self.exchange, &self.from_symbol, &self.to_symbol)
    }
}

pub fn encode(exchange: &str, base: &str, quote: &str) -> SymbolName {
    let short = format!("{base}/{quote}");
    let full = format!("{exchange}:{short}");
    SymbolName { short, full }
}

/// Split `exchange:base/quote`. Returns `None` unless every part is a
/// non-empty word (ASCII alphanumerics or `_`).
pub fn decode(full: &str) -> Option<SymbolParts> {
    let (exchange, pair) = full.split_once(':')?;
    let (base, quote) = pair.split_once('/')?;

    if ![exchange, base, quote].iter().all(|part| is_word(part)) {
        return None;
    }

    Some(SymbolParts {
        exchange: exchange.to_string(),
        from_symbol: base.to_string(),
        to_symbol: quote.to_string(),
    })
}

fn is_word(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_builds_short_and_full() {
        let name = encode("Bitfinex", "BTC", "USD");
        assert_eq!(name.short, "BTC/USD");
        assert_eq!(name.full, "Bitfinex:BTC/USD");
    }

    #[test]
    fn decode_inverts_encode() {
        for (e, b, q) in [("Bitfinex", "BTC", "USD"), ("Kraken", "ETH", "EUR"), ("x1", "a_b", "9")] {
            let parts = decode(&encode(e, b, q).full).expect("should decode");
            assert_eq!(parts.exchange, e);
            assert_eq!(parts.from_symbol, b);
            assert_eq!(parts.to_symbol, q);
        }
    }

    #[test]
    fn decode_rejects_malformed_names() {
        for bad in ["", "BTC/USD", "Bitfinex:BTCUSD", "Bitfinex:BTC/", ":BTC/USD", "Bit finex:BTC/USD", "A:B/C/D", "A:B:C/D"] {
            assert_eq!(decode(bad), None, "{bad} should not decode");
        }
    }

    #[test]
    fn market_key_is_lowercase_pair() {
        let parts = decode("Bitfinex:BTC/USD").unwrap();
        assert_eq!(parts.market(), "btcusd");
    }
}
