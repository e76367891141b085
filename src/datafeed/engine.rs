// =============================================================================
// Feed Engine: the one task that owns the multiplexer
// =============================================================================
//
// Widget calls and transport ticks both arrive here and are applied one at a
// time, so multiplexer state never needs a lock. Commands are polled before
// ticks (`biased`), and an unsubscribe is acknowledged only after the handle
// is gone: once `EngineHandle::unsubscribe` returns, no further callback can
// reach that handle.
// =============================================================================

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::error::FeedError;
use crate::market_data::transport::ChannelTransport;
use crate::market_data::{Multiplexer, SubscribeOutcome, SubscriptionHandle};
use crate::types::{Bar, Resolution, TradeTick};

pub enum EngineCommand {
    Subscribe {
        symbol_key: String,
        resolution: Resolution,
        handle: SubscriptionHandle,
        seed: Option<Bar>,
        reply: oneshot::Sender<Result<SubscribeOutcome, FeedError>>,
    },
    Unsubscribe {
        handle_id: String,
        reply: oneshot::Sender<bool>,
    },
}

/// Cloneable front door to the engine task.
#[derive(Clone, Debug)]
pub struct EngineHandle {
    commands: mpsc::UnboundedSender<EngineCommand>,
}

impl EngineHandle {
    pub async fn subscribe(
        &self,
        symbol_key: String,
        resolution: Resolution,
        handle: SubscriptionHandle,
        seed: Option<Bar>,
    ) -> Result<SubscribeOutcome, FeedError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(EngineCommand::Subscribe {
                symbol_key,
                resolution,
                handle,
                seed,
                reply,
            })
            .map_err(|_| FeedError::EngineStopped)?;
        rx.await.map_err(|_| FeedError::EngineStopped)?
    }

    pub async fn unsubscribe(&self, handle_id: impl Into<String>) -> Result<bool, FeedError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(EngineCommand::Unsubscribe {
                handle_id: handle_id.into(),
                reply,
            })
            .map_err(|_| FeedError::EngineStopped)?;
        rx.await.map_err(|_| FeedError::EngineStopped)
    }
}

pub struct FeedEngine<T: ChannelTransport> {
    multiplexer: Multiplexer<T>,
    commands: mpsc::UnboundedReceiver<EngineCommand>,
    ticks: mpsc::Receiver<TradeTick>,
}

impl<T: ChannelTransport> FeedEngine<T> {
    pub fn new(transport: T, ticks: mpsc::Receiver<TradeTick>) -> (Self, EngineHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = Self {
            multiplexer: Multiplexer::new(transport),
            commands: rx,
            ticks,
        };
        (engine, EngineHandle { commands: tx })
    }

    /// Run until every `EngineHandle` is dropped.
    pub async fn run(mut self) {
        let mut ticks_open = true;
        info!("feed engine started");

        loop {
            tokio::select! {
                biased;

                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                tick = self.ticks.recv(), if ticks_open => match tick {
                    Some(tick) => {
                        self.multiplexer.on_transport_message(&tick);
                    }
                    None => {
                        info!("tick stream closed; serving subscriptions without live data");
                        ticks_open = false;
                    }
                },
            }
        }

        info!(channels = self.multiplexer.channel_count(), "feed engine stopped");
    }

    fn handle_command(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::Subscribe {
                symbol_key,
                resolution,
                handle,
                seed,
                reply,
            } => {
                let outcome = self.multiplexer.subscribe(&symbol_key, resolution, handle, seed);
                if reply.send(outcome).is_err() {
                    debug!(market = %symbol_key, "subscriber went away before ack");
                }
            }
            EngineCommand::Unsubscribe { handle_id, reply } => {
                let removed = self.multiplexer.unsubscribe(&handle_id);
                let _ = reply.send(removed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::transport::ChannelCommand;
    use crate::market_data::WsChannelTransport;
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    const T: i64 = 1_700_006_400;

    fn tick(market: &str, timestamp: i64) -> TradeTick {
        TradeTick {
            market: market.into(),
            price: dec!(10),
            timestamp,
        }
    }

    #[tokio::test]
    async fn subscribe_routes_ticks_and_unsubscribe_stops_them() {
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
        let (tick_tx, tick_rx) = mpsc::channel(16);
        let (engine, handle) = FeedEngine::new(WsChannelTransport::new(cmd_tx), tick_rx);
        let task = tokio::spawn(engine.run());

        let (bar_tx, mut bar_rx) = mpsc::unbounded_channel();
        let outcome = handle
            .subscribe(
                "btcusd".into(),
                Resolution::Day1,
                SubscriptionHandle::new("chart-1", move |bar: &Bar| {
                    let _ = bar_tx.send(*bar);
                }),
                Some(Bar::flat(T, dec!(5))),
            )
            .await
            .unwrap();
        assert_eq!(outcome, SubscribeOutcome::ChannelOpened);
        assert_eq!(cmd_rx.recv().await, Some(ChannelCommand::Open("btcusd".into())));

        tick_tx.send(tick("btcusd", T + 1)).await.unwrap();
        let bar = bar_rx.recv().await.unwrap();
        assert_eq!(bar.high, dec!(10));
        assert_eq!(bar.low, dec!(5));

        assert!(handle.unsubscribe("chart-1").await.unwrap());
        assert_eq!(cmd_rx.recv().await, Some(ChannelCommand::Close("btcusd".into())));

        // The callback (and its sender) were dropped with the handle.
        tick_tx.send(tick("btcusd", T + 2)).await.unwrap();
        assert_eq!(bar_rx.recv().await, None);

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn unsubscribe_wins_over_queued_tick() {
        let (cmd_tx, _cmd_rx) = mpsc::unbounded_channel();
        let (tick_tx, tick_rx) = mpsc::channel(16);
        let (engine, handle) = FeedEngine::new(WsChannelTransport::new(cmd_tx), tick_rx);

        let seen = Arc::new(Mutex::new(0usize));
        let counter = seen.clone();

        // Queue everything before the engine runs: subscribe, a tick, then
        // unsubscribe. The biased loop applies both commands before the tick.
        let (sub_reply, sub_rx) = oneshot::channel();
        handle
            .commands
            .send(EngineCommand::Subscribe {
                symbol_key: "btcusd".into(),
                resolution: Resolution::Day1,
                handle: SubscriptionHandle::new("a", move |_: &Bar| *counter.lock() += 1),
                seed: None,
                reply: sub_reply,
            })
            .unwrap();
        tick_tx.send(tick("btcusd", T)).await.unwrap();
        let (unsub_reply, unsub_rx) = oneshot::channel();
        handle
            .commands
            .send(EngineCommand::Unsubscribe {
                handle_id: "a".into(),
                reply: unsub_reply,
            })
            .unwrap();

        let task = tokio::spawn(engine.run());
        assert!(sub_rx.await.unwrap().is_ok());
        assert!(unsub_rx.await.unwrap());

        // A later subscriber on the same market sees the next tick only.
        let (bar_tx, mut bar_rx) = mpsc::unbounded_channel();
        handle
            .subscribe(
                "btcusd".into(),
                Resolution::Day1,
                SubscriptionHandle::new("b", move |bar: &Bar| {
                    let _ = bar_tx.send(*bar);
                }),
                None,
            )
            .await
            .unwrap();
        tick_tx.send(tick("btcusd", T + 5)).await.unwrap();
        assert_eq!(bar_rx.recv().await.unwrap().time, T);
        assert_eq!(*seen.lock(), 0);

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn stopped_engine_reports_engine_stopped() {
        let (cmd_tx, _cmd_rx) = mpsc::unbounded_channel();
        let (_tick_tx, tick_rx) = mpsc::channel(1);
        let (engine, handle) = FeedEngine::new(WsChannelTransport::new(cmd_tx), tick_rx);
        drop(engine);

        assert_eq!(handle.unsubscribe("x").await, Err(FeedError::EngineStopped));
    }
}
