// =============================================================================
// WebSocket Handler: live bars for remote charts
// =============================================================================
//
// Clients connect to `/api/v1/stream` and drive `subscribeBars` /
// `unsubscribeBars` with JSON text frames:
//   { "action": "subscribe", "subscriberId": "c1", "symbol": "Bitfinex:BTC/USD", "resolution": "1D" }
//   { "action": "unsubscribe", "subscriberId": "c1" }
//
// and receive:
//   { "type": "bar", "subscriberId": "c1", "bar": {...}, "timeMs": ... }
//   { "type": "subscribed" | "unsubscribed" | "resetCache", "subscriberId": "c1" }
//   { "type": "error", "subscriberId": "c1", "message": "..." }
//
// Subscriber ids are scoped per connection, so two tabs may both use "c1".
// Every subscription of a connection is removed when it closes.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::api::ApiState;
use crate::types::{Bar, Resolution};

// =============================================================================
// Wire messages
// =============================================================================

#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "camelCase")]
enum ClientMessage {
    Subscribe {
        #[serde(rename = "subscriberId")]
        subscriber_id: String,
        symbol: String,
        resolution: Resolution,
    },
    Unsubscribe {
        #[serde(rename = "subscriberId")]
        subscriber_id: String,
    },
}

#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
enum ServerMessage {
    Bar {
        #[serde(rename = "subscriberId")]
        subscriber_id: String,
        bar: Bar,
        #[serde(rename = "timeMs")]
        time_ms: i64,
    },
    Subscribed {
        #[serde(rename = "subscriberId")]
        subscriber_id: String,
    },
    Unsubscribed {
        #[serde(rename = "subscriberId")]
        subscriber_id: String,
    },
    ResetCache {
        #[serde(rename = "subscriberId")]
        subscriber_id: String,
    },
    Error {
        #[serde(rename = "subscriberId", skip_serializing_if = "Option::is_none")]
        subscriber_id: Option<String>,
        message: String,
    },
}

impl ServerMessage {
    fn bar(subscriber_id: &str, bar: &Bar) -> Self {
        ServerMessage::Bar {
            subscriber_id: subscriber_id.to_string(),
            bar: *bar,
            time_ms: bar.time_ms(),
        }
    }

    fn error(subscriber_id: Option<&str>, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            subscriber_id: subscriber_id.map(str::to_string),
            message: message.into(),
        }
    }
}

/// Engine-side id for a client id on connection `conn`.
fn scoped_id(conn: u64, subscriber_id: &str) -> String {
    format!("{conn}:{subscriber_id}")
}

// =============================================================================
// WebSocket upgrade handler
// =============================================================================

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ApiState>>,
) -> impl IntoResponse {
    let conn = state.next_connection_id();
    info!(conn, "stream connection accepted — upgrading");
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state, conn))
}

// =============================================================================
// Connection handler
// =============================================================================

/// Pumps bars from the feed to the socket while applying client requests.
async fn handle_ws_connection(socket: WebSocket, state: Arc<ApiState>, conn: u64) {
    let (mut sender, mut receiver) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerMessage>();
    let mut subscriptions: HashSet<String> = HashSet::new();

    loop {
        tokio::select! {
            Some(msg) = out_rx.recv() => {
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(conn, error = %e, "failed to serialise stream message");
                        continue;
                    }
                };
                if let Err(e) = sender.send(Message::Text(json)).await {
                    debug!(conn, error = %e, "stream send failed — disconnecting");
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_text(&state, conn, &text, &out_tx, &mut subscriptions).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            debug!(conn, error = %e, "failed to send Pong — disconnecting");
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Binary(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        info!(conn, "stream Close frame received — disconnecting");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(conn, error = %e, "stream receive error — disconnecting");
                        break;
                    }
                    None => {
                        info!(conn, "stream ended");
                        break;
                    }
                }
            }
        }
    }

    cleanup(&state, conn, subscriptions).await;
}

async fn handle_client_text(
    state: &Arc<ApiState>,
    conn: u64,
    text: &str,
    out: &mpsc::UnboundedSender<ServerMessage>,
    subscriptions: &mut HashSet<String>,
) {
    let request: ClientMessage = match serde_json::from_str(text) {
        Ok(request) => request,
        Err(e) => {
            debug!(conn, error = %e, "ignoring malformed stream request");
            let _ = out.send(ServerMessage::error(None, format!("malformed request: {e}")));
            return;
        }
    };

    match request {
        ClientMessage::Subscribe {
            subscriber_id,
            symbol,
            resolution,
        } => {
            let reply = subscribe(state, conn, &subscriber_id, &symbol, resolution, out).await;
            if matches!(reply, ServerMessage::Subscribed { .. }) {
                subscriptions.insert(scoped_id(conn, &subscriber_id));
            }
            let _ = out.send(reply);
        }
        ClientMessage::Unsubscribe { subscriber_id } => {
            let scoped = scoped_id(conn, &subscriber_id);
            let reply = match state.feed.unsubscribe_bars(&scoped).await {
                Ok(_) => ServerMessage::Unsubscribed { subscriber_id },
                Err(e) => ServerMessage::error(Some(&subscriber_id), e.to_string()),
            };
            subscriptions.remove(&scoped);
            let _ = out.send(reply);
        }
    }
}

async fn subscribe(
    state: &Arc<ApiState>,
    conn: u64,
    subscriber_id: &str,
    symbol: &str,
    resolution: Resolution,
    out: &mpsc::UnboundedSender<ServerMessage>,
) -> ServerMessage {
    let info = match state.feed.resolve(symbol) {
        Ok(info) => info,
        Err(e) => return ServerMessage::error(Some(subscriber_id), e.to_string()),
    };

    let on_tick = {
        let out = out.clone();
        let id = subscriber_id.to_string();
        move |bar: &Bar| {
            let _ = out.send(ServerMessage::bar(&id, bar));
        }
    };
    let on_reset = {
        let out = out.clone();
        let id = subscriber_id.to_string();
        move || {
            let _ = out.send(ServerMessage::ResetCache {
                subscriber_id: id.clone(),
            });
        }
    };

    let scoped = scoped_id(conn, subscriber_id);
    match state
        .feed
        .subscribe_bars(&info, resolution, on_tick, &scoped, on_reset)
        .await
    {
        Ok(_) => ServerMessage::Subscribed {
            subscriber_id: subscriber_id.to_string(),
        },
        Err(e) => ServerMessage::error(Some(subscriber_id), e.to_string()),
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Drop every subscription the connection still holds.
async fn cleanup(state: &Arc<ApiState>, conn: u64, subscriptions: HashSet<String>) {
    let count = subscriptions.len();
    for scoped in subscriptions {
        if let Err(e) = state.feed.unsubscribe_bars(&scoped).await {
            warn!(conn, subscriber = %scoped, error = %e, "failed to drop subscription on disconnect");
        }
    }
    info!(conn, dropped = count, "stream connection closed — cleanup complete");
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn parses_subscribe_and_unsubscribe() {
        let sub: ClientMessage = serde_json::from_str(
            r#"{"action":"subscribe","subscriberId":"c1","symbol":"Bitfinex:BTC/USD","resolution":"60"}"#,
        )
        .unwrap();
        assert_eq!(
            sub,
            ClientMessage::Subscribe {
                subscriber_id: "c1".into(),
                symbol: "Bitfinex:BTC/USD".into(),
                resolution: Resolution::Hour1,
            }
        );

        let unsub: ClientMessage =
            serde_json::from_str(r#"{"action":"unsubscribe","subscriberId":"c1"}"#).unwrap();
        assert_eq!(unsub, ClientMessage::Unsubscribe { subscriber_id: "c1".into() });

        assert!(serde_json::from_str::<ClientMessage>(r#"{"action":"close"}"#).is_err());
    }

    #[test]
    fn bar_message_wire_shape() {
        let msg = ServerMessage::bar("c1", &Bar::flat(86_400, dec!(2.5)));
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "bar");
        assert_eq!(value["subscriberId"], "c1");
        assert_eq!(value["bar"]["time"], 86_400);
        assert_eq!(value["bar"]["open"], 2.5);
        assert_eq!(value["timeMs"], 86_400_000);
    }

    #[test]
    fn error_without_subscriber_omits_the_field() {
        let value = serde_json::to_value(ServerMessage::error(None, "bad")).unwrap();
        assert_eq!(value, serde_json::json!({ "type": "error", "message": "bad" }));

        let value = serde_json::to_value(ServerMessage::ResetCache { subscriber_id: "c1".into() }).unwrap();
        assert_eq!(value["type"], "resetCache");
    }

    #[test]
    fn subscriber_ids_are_scoped_per_connection() {
        assert_ne!(scoped_id(1, "c1"), scoped_id(2, "c1"));
        assert_eq!(scoped_id(7, "c1"), "7:c1");
    }
}
