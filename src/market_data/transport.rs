// =============================================================================
// Live Transport: the single shared WebSocket carrying trade ticks
// =============================================================================
//
// The multiplexer talks to the transport only through `ChannelTransport`, so
// the socket itself lives in its own task. Channel open/close requests cross
// over on an unbounded queue; decoded ticks flow back on a bounded one in
// arrival order.
//
// Wire format (inbound):
//   { "type": "candleOnUpdate", "data": { "market": "btcusd",
//     "trade": { "price": "37000.5", "ts": 1700000000 } } }
// Wire format (outbound):
//   { "op": "switchMarket", "args": { "market": "btcusd" } }
// =============================================================================

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::types::{parse_decimal, TradeTick};

/// Message kind carrying live trades.
const CANDLE_ON_UPDATE: &str = "candleOnUpdate";

/// Timestamps above this are taken to be milliseconds.
const MILLIS_THRESHOLD: i64 = 100_000_000_000;

// ---------------------------------------------------------------------------
// Channel hooks used by the multiplexer
// ---------------------------------------------------------------------------

/// Upstream channel control, injected into the multiplexer.
pub trait ChannelTransport {
    /// Ask upstream to start sending ticks for `market`.
    fn open_channel(&mut self, market: &str) -> Result<()>;

    /// The last subscriber for `market` went away.
    fn close_channel(&mut self, market: &str) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelCommand {
    Open(String),
    Close(String),
}

/// `ChannelTransport` backed by the WebSocket task.
#[derive(Debug, Clone)]
pub struct WsChannelTransport {
    commands: mpsc::UnboundedSender<ChannelCommand>,
}

impl WsChannelTransport {
    pub fn new(commands: mpsc::UnboundedSender<ChannelCommand>) -> Self {
        Self { commands }
    }
}

impl ChannelTransport for WsChannelTransport {
    fn open_channel(&mut self, market: &str) -> Result<()> {
        self.commands
            .send(ChannelCommand::Open(market.to_string()))
            .context("transport task is gone")
    }

    fn close_channel(&mut self, market: &str) -> Result<()> {
        self.commands
            .send(ChannelCommand::Close(market.to_string()))
            .context("transport task is gone")
    }
}

// ---------------------------------------------------------------------------
// Wire messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", content = "args", rename_all = "camelCase")]
pub enum OutboundMessage {
    SwitchMarket { market: String },
}

impl OutboundMessage {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("failed to serialise outbound message")
    }
}

/// Decoded inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Trade(TradeTick),
    /// Any message kind this feed does not act on.
    Unhandled(String),
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

/// Parse one inbound text frame.
pub fn parse_transport_message(text: &str) -> Result<TransportEvent> {
    let envelope: Envelope =
        serde_json::from_str(text).context("failed to parse transport envelope")?;

    match envelope.kind.as_str() {
        CANDLE_ON_UPDATE => parse_trade(&envelope.data).map(TransportEvent::Trade),
        _ => Ok(TransportEvent::Unhandled(envelope.kind)),
    }
}

fn parse_trade(data: &serde_json::Value) -> Result<TradeTick> {
    let market = data["market"]
        .as_str()
        .context("missing field data.market")?
        .to_lowercase();

    let trade = &data["trade"];
    let price = parse_decimal(&trade["price"], "trade.price")?;
    let timestamp = parse_timestamp(&trade["ts"])?;

    Ok(TradeTick {
        market,
        price,
        timestamp,
    })
}

fn parse_timestamp(val: &serde_json::Value) -> Result<i64> {
    let raw = match val {
        serde_json::Value::String(s) => s
            .parse::<i64>()
            .with_context(|| format!("failed to parse trade.ts: {s}"))?,
        serde_json::Value::Number(n) => n.as_i64().context("trade.ts is not an integer")?,
        _ => anyhow::bail!("missing field trade.ts"),
    };

    Ok(if raw > MILLIS_THRESHOLD { raw / 1000 } else { raw })
}

// ---------------------------------------------------------------------------
// WebSocket task
// ---------------------------------------------------------------------------

/// Why `run_transport` returned without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportExit {
    /// The socket went away; reconnect.
    Disconnected,
    /// The feed engine is gone; stop for good.
    Shutdown,
}

/// Connect to `url`, replay `switchMarket` for every market in `active`, then
/// pump ticks into `ticks` and channel commands out to the socket.
///
/// `on_connected` runs once the socket is up and the replay has been sent.
/// `active` lives across reconnects and tracks which markets are wanted.
pub async fn run_transport(
    url: &str,
    commands: &mut mpsc::UnboundedReceiver<ChannelCommand>,
    active: &mut BTreeSet<String>,
    ticks: &mpsc::Sender<TradeTick>,
    on_connected: impl FnOnce(),
) -> Result<TransportExit> {
    info!(url = %url, "connecting to market transport");

    let (ws_stream, _response) = connect_async(url)
        .await
        .context("failed to connect to market transport")?;

    info!(url = %url, markets = active.len(), "market transport connected");
    let (mut write, mut read) = ws_stream.split();

    for market in active.iter() {
        let msg = OutboundMessage::SwitchMarket { market: market.clone() }.to_json()?;
        write.send(Message::Text(msg)).await.context("failed to replay switchMarket")?;
    }
    on_connected();

    loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(ChannelCommand::Open(market)) => {
                    let msg = OutboundMessage::SwitchMarket { market: market.clone() }.to_json()?;
                    active.insert(market.clone());
                    write.send(Message::Text(msg)).await.context("failed to send switchMarket")?;
                    debug!(market = %market, "switchMarket sent");
                }
                Some(ChannelCommand::Close(market)) => {
                    // The protocol has no close op; stop replaying it and let
                    // the multiplexer drop any ticks still arriving.
                    active.remove(&market);
                    debug!(market = %market, "channel closed locally");
                }
                None => {
                    info!("channel command queue closed; stopping transport");
                    return Ok(TransportExit::Shutdown);
                }
            },
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => match parse_transport_message(&text) {
                    Ok(TransportEvent::Trade(tick)) => {
                        if ticks.send(tick).await.is_err() {
                            info!("tick receiver dropped; stopping transport");
                            return Ok(TransportExit::Shutdown);
                        }
                    }
                    Ok(TransportEvent::Unhandled(kind)) => {
                        debug!(kind = %kind, "ignoring transport message");
                    }
                    Err(e) => {
                        debug!(error = %e, "dropping malformed transport message");
                    }
                },
                Some(Ok(Message::Close(_))) => {
                    warn!(url = %url, "market transport closed by peer");
                    return Ok(TransportExit::Disconnected);
                }
                // tungstenite answers pings itself.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!(url = %url, error = %e, "market transport read error");
                    return Err(e.into());
                }
                None => {
                    warn!(url = %url, "market transport stream ended");
                    return Ok(TransportExit::Disconnected);
                }
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn parses_candle_on_update() {
        let json = r#"{
            "type": "candleOnUpdate",
            "data": { "market": "BTCUSD", "trade": { "price": "37020.15", "ts": 1700000000 } }
        }"#;
        let event = parse_transport_message(json).expect("should parse");
        assert_eq!(
            event,
            TransportEvent::Trade(TradeTick {
                market: "btcusd".into(),
                price: dec!(37020.15),
                timestamp: 1_700_000_000,
            })
        );
    }

    #[test]
    fn numeric_price_and_millisecond_ts_are_accepted() {
        let json = r#"{"type":"candleOnUpdate","data":{"market":"ethusdt","trade":{"price":2000.5,"ts":1700000000123}}}"#;
        match parse_transport_message(json).unwrap() {
            TransportEvent::Trade(tick) => {
                assert_eq!(tick.price, dec!(2000.5));
                assert_eq!(tick.timestamp, 1_700_000_000);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn other_kinds_are_unhandled() {
        let json = r#"{"type":"depthOnUpdate","data":{"bids":[]}}"#;
        assert_eq!(
            parse_transport_message(json).unwrap(),
            TransportEvent::Unhandled("depthOnUpdate".into())
        );
        let json = r#"{"type":"pong"}"#;
        assert!(matches!(parse_transport_message(json).unwrap(), TransportEvent::Unhandled(_)));
    }

    #[test]
    fn malformed_messages_are_errors() {
        assert!(parse_transport_message("not json").is_err());
        assert!(parse_transport_message(r#"{"data":{}}"#).is_err());
        let missing_price = r#"{"type":"candleOnUpdate","data":{"market":"btcusd","trade":{"ts":1}}}"#;
        assert!(parse_transport_message(missing_price).is_err());
    }

    #[test]
    fn switch_market_wire_shape() {
        let json = OutboundMessage::SwitchMarket { market: "btcusd".into() }.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value, serde_json::json!({ "op": "switchMarket", "args": { "market": "btcusd" } }));
    }

    #[test]
    fn ws_channel_transport_forwards_commands() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut transport = WsChannelTransport::new(tx);
        transport.open_channel("btcusd").unwrap();
        transport.close_channel("btcusd").unwrap();
        assert_eq!(rx.try_recv().unwrap(), ChannelCommand::Open("btcusd".into()));
        assert_eq!(rx.try_recv().unwrap(), ChannelCommand::Close("btcusd".into()));

        drop(rx);
        assert!(transport.open_channel("ethusdt").is_err());
    }
}
