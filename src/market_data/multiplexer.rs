// =============================================================================
// Subscription Multiplexer: one upstream channel, many chart subscribers
// =============================================================================
//
// Every distinct market (symbolKey) maps to exactly one ChannelSubscription,
// opened upstream when its first handle arrives and discarded when its last
// handle leaves. Inside a channel, every resolution in use has one aggregator
// whose `last_bar` is the in-progress bar, while the handles stay in a single
// insertion-ordered list.
//
// The multiplexer is plain owned state mutated through `&mut self`. It is
// driven from a single task, so subscribe/unsubscribe/tick handling never
// interleave and an unsubscribed handle cannot see another callback.
// =============================================================================

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::{debug, info, warn};

use crate::error::FeedError;
use crate::market_data::candle_aggregator::CandleAggregator;
use crate::market_data::transport::ChannelTransport;
use crate::types::{Bar, Resolution, TradeTick};

/// Callback invoked with every bar update for a handle.
pub type BarCallback = Box<dyn FnMut(&Bar) + Send>;

/// A subscriber identity plus its callback.
pub struct SubscriptionHandle {
    pub id: String,
    pub callback: BarCallback,
}

impl SubscriptionHandle {
    pub fn new(id: impl Into<String>, callback: impl FnMut(&Bar) + Send + 'static) -> Self {
        Self {
            id: id.into(),
            callback: Box::new(callback),
        }
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle").field("id", &self.id).finish()
    }
}

/// What `subscribe` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// First handle for the market; an upstream channel was opened.
    ChannelOpened,
    /// Joined an already open channel.
    Joined,
    /// The handle id was already registered; its callback was replaced.
    Replaced,
}

struct ChannelSubscription {
    /// One aggregator per resolution in use on the channel.
    series: Vec<CandleAggregator>,
    /// Every handle of the channel in insertion order, tagged with the
    /// resolution it asked for.
    handles: Vec<(Resolution, SubscriptionHandle)>,
}

impl ChannelSubscription {
    fn position_of(&self, handle_id: &str) -> Option<usize> {
        self.handles.iter().position(|(_, h)| h.id == handle_id)
    }

    fn has_series(&self, resolution: Resolution) -> bool {
        self.series.iter().any(|agg| agg.resolution() == resolution)
    }
}

pub struct Multiplexer<T: ChannelTransport> {
    transport: T,
    channels: HashMap<String, ChannelSubscription>,
}

impl<T: ChannelTransport> Multiplexer<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            channels: HashMap::new(),
        }
    }

    // -------------------------------------------------------------------------
    // Subscription lifecycle
    // -------------------------------------------------------------------------

    /// Register `handle` for `symbol_key` at `resolution`.
    ///
    /// `seed_bar` only seeds a series that does not exist yet; a live series
    /// keeps its own in-progress bar.
    pub fn subscribe(
        &mut self,
        symbol_key: &str,
        resolution: Resolution,
        handle: SubscriptionHandle,
        seed_bar: Option<Bar>,
    ) -> Result<SubscribeOutcome, FeedError> {
        if let Some((key, _)) = self
            .channels
            .iter()
            .find(|(key, ch)| key.as_str() != symbol_key && ch.position_of(&handle.id).is_some())
        {
            warn!(subscriber = %handle.id, existing = %key, requested = %symbol_key, "subscriber id reused across symbols");
            return Err(FeedError::SubscriberConflict(handle.id));
        }

        if let Some(channel) = self.channels.get_mut(symbol_key) {
            if let Some(pos) = channel.position_of(&handle.id) {
                if channel.handles[pos].0 != resolution {
                    return Err(FeedError::SubscriberConflict(handle.id));
                }
                debug!(subscriber = %handle.id, market = %symbol_key, "subscriber re-registered");
                channel.handles[pos].1 = handle;
                return Ok(SubscribeOutcome::Replaced);
            }

            if !channel.has_series(resolution) {
                channel.series.push(CandleAggregator::new(resolution, seed_bar));
            }
            channel.handles.push((resolution, handle));
            debug!(
                market = %symbol_key,
                resolution = %resolution,
                handles = channel.handles.len(),
                "subscriber joined open channel"
            );
            return Ok(SubscribeOutcome::Joined);
        }

        info!(market = %symbol_key, resolution = %resolution, seeded = seed_bar.is_some(), "opening channel");
        self.channels.insert(
            symbol_key.to_string(),
            ChannelSubscription {
                series: vec![CandleAggregator::new(resolution, seed_bar)],
                handles: vec![(resolution, handle)],
            },
        );
        if let Err(e) = self.transport.open_channel(symbol_key) {
            warn!(market = %symbol_key, error = %e, "failed to request upstream channel");
        }
        Ok(SubscribeOutcome::ChannelOpened)
    }

    /// Remove the handle with `handle_id` wherever it is registered.
    ///
    /// Returns `false` when no such handle exists. Removing the last handle of
    /// a resolution drops that series; removing the last handle of a channel
    /// discards all of its state.
    pub fn unsubscribe(&mut self, handle_id: &str) -> bool {
        let Some((symbol_key, pos)) = self
            .channels
            .iter()
            .find_map(|(key, ch)| ch.position_of(handle_id).map(|pos| (key.clone(), pos)))
        else {
            debug!(subscriber = %handle_id, "unsubscribe for unknown subscriber");
            return false;
        };

        let Some(channel) = self.channels.get_mut(&symbol_key) else {
            return false;
        };
        let (resolution, _) = channel.handles.remove(pos);
        if !channel.handles.iter().any(|(r, _)| *r == resolution) {
            channel.series.retain(|agg| agg.resolution() != resolution);
        }

        if channel.handles.is_empty() {
            self.channels.remove(&symbol_key);
            info!(market = %symbol_key, "last subscriber left; closing channel");
            if let Err(e) = self.transport.close_channel(&symbol_key) {
                warn!(market = %symbol_key, error = %e, "failed to close upstream channel");
            }
        } else {
            debug!(subscriber = %handle_id, market = %symbol_key, "subscriber removed");
        }
        true
    }

    // -------------------------------------------------------------------------
    // Tick routing
    // -------------------------------------------------------------------------

    /// Route one tick: aggregate it once per resolution of its market, then
    /// hand each handle the bar of its resolution in insertion order.
    ///
    /// Ticks for markets nobody watches are dropped. Returns how many
    /// callbacks were invoked.
    pub fn on_transport_message(&mut self, tick: &TradeTick) -> usize {
        let Some(channel) = self.channels.get_mut(&tick.market) else {
            return 0;
        };

        let bars: Vec<(Resolution, Bar)> = channel
            .series
            .iter_mut()
            .map(|agg| (agg.resolution(), agg.on_tick(tick)))
            .collect();

        let mut delivered = 0;
        for (resolution, handle) in channel.handles.iter_mut() {
            let resolution = *resolution;
            let Some(bar) = bars.iter().find(|(r, _)| *r == resolution).map(|(_, bar)| *bar) else {
                continue;
            };
            let callback = &mut handle.callback;
            if catch_unwind(AssertUnwindSafe(|| callback(&bar))).is_err() {
                warn!(subscriber = %handle.id, market = %tick.market, "bar callback panicked");
            }
            delivered += 1;
        }
        delivered
    }

    // -------------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------------

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    #[cfg(test)]
    fn transport(&self) -> &T {
        &self.transport
    }

    #[cfg(test)]
    fn handle_count(&self, symbol_key: &str) -> usize {
        self.channels.get(symbol_key).map_or(0, |ch| ch.handles.len())
    }

    #[cfg(test)]
    fn last_bar(&self, symbol_key: &str, resolution: Resolution) -> Option<Bar> {
        self.channels
            .get(symbol_key)?
            .series
            .iter()
            .find(|agg| agg.resolution() == resolution)?
            .last_bar()
            .copied()
    }
}

impl<T: ChannelTransport> std::fmt::Debug for Multiplexer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("channels", &self.channels.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    const T: i64 = 1_700_006_400;

    /// Records every upstream request.
    #[derive(Default)]
    struct RecordingTransport {
        pub opened: Vec<String>,
        pub closed: Vec<String>,
    }

    impl ChannelTransport for RecordingTransport {
        fn open_channel(&mut self, market: &str) -> anyhow::Result<()> {
            self.opened.push(market.to_string());
            Ok(())
        }

        fn close_channel(&mut self, market: &str) -> anyhow::Result<()> {
            self.closed.push(market.to_string());
            Ok(())
        }
    }

    type Log = Arc<Mutex<Vec<(String, Bar)>>>;

    fn recorder(id: &str, log: &Log) -> SubscriptionHandle {
        let log = log.clone();
        let name = id.to_string();
        SubscriptionHandle::new(id, move |bar: &Bar| log.lock().push((name.clone(), *bar)))
    }

    fn tick(market: &str, price: Decimal, timestamp: i64) -> TradeTick {
        TradeTick {
            market: market.into(),
            price,
            timestamp,
        }
    }

    fn mux() -> Multiplexer<RecordingTransport> {
        Multiplexer::new(RecordingTransport::default())
    }

    #[test]
    fn ticks_without_channel_reach_nobody() {
        let log: Log = Default::default();
        let mut m = mux();
        m.subscribe("btcusd", Resolution::Day1, recorder("a", &log), Some(Bar::flat(T, dec!(1))))
            .unwrap();

        assert_eq!(m.on_transport_message(&tick("ethusdt", dec!(5), T)), 0);
        assert!(log.lock().is_empty());
        assert_eq!(m.channel_count(), 1);
    }

    #[test]
    fn shared_channel_opens_once_and_fans_out() {
        let log: Log = Default::default();
        let mut m = mux();
        let seed = Some(Bar::flat(T, dec!(100)));

        assert_eq!(
            m.subscribe("btcusd", Resolution::Day1, recorder("a", &log), seed),
            Ok(SubscribeOutcome::ChannelOpened)
        );
        assert_eq!(
            m.subscribe("btcusd", Resolution::Day1, recorder("b", &log), seed),
            Ok(SubscribeOutcome::Joined)
        );
        assert_eq!(m.transport().opened, vec!["btcusd"]);

        m.on_transport_message(&tick("btcusd", dec!(105), T));
        m.on_transport_message(&tick("btcusd", dec!(95), T + 10));

        let log = log.lock();
        let ids: Vec<&str> = log.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "a", "b"]);
        assert_eq!(log[3].1.low, dec!(95));
        assert_eq!(log[3].1.high, dec!(105));
    }

    #[test]
    fn late_seed_does_not_regress_live_bar() {
        let log: Log = Default::default();
        let mut m = mux();
        m.subscribe("btcusd", Resolution::Day1, recorder("a", &log), Some(Bar::flat(T, dec!(100))))
            .unwrap();
        m.on_transport_message(&tick("btcusd", dec!(120), T + 5));

        m.subscribe("btcusd", Resolution::Day1, recorder("b", &log), Some(Bar::flat(T - 86_400, dec!(1))))
            .unwrap();
        let bar = m.last_bar("btcusd", Resolution::Day1).unwrap();
        assert_eq!(bar.time, T);
        assert_eq!(bar.close, dec!(120));
    }

    #[test]
    fn duplicate_handle_id_is_delivered_once() {
        let log: Log = Default::default();
        let mut m = mux();
        m.subscribe("btcusd", Resolution::Day1, recorder("a", &log), None).unwrap();
        assert_eq!(
            m.subscribe("btcusd", Resolution::Day1, recorder("a", &log), None),
            Ok(SubscribeOutcome::Replaced)
        );
        assert_eq!(m.handle_count("btcusd"), 1);

        assert_eq!(m.on_transport_message(&tick("btcusd", dec!(1), T)), 1);
        assert_eq!(log.lock().len(), 1);
    }

    #[test]
    fn handle_id_cannot_span_symbols() {
        let log: Log = Default::default();
        let mut m = mux();
        m.subscribe("btcusd", Resolution::Day1, recorder("a", &log), None).unwrap();
        let err = m
            .subscribe("ethusdt", Resolution::Day1, recorder("a", &log), None)
            .unwrap_err();
        assert_eq!(err, FeedError::SubscriberConflict("a".into()));
        assert_eq!(m.channel_count(), 1);
        assert!(m.transport().opened == vec!["btcusd"]);
    }

    #[test]
    fn last_unsubscribe_discards_state_and_resubscribe_reseeds() {
        let log: Log = Default::default();
        let mut m = mux();
        m.subscribe("btcusd", Resolution::Day1, recorder("a", &log), Some(Bar::flat(T, dec!(100))))
            .unwrap();
        m.on_transport_message(&tick("btcusd", dec!(150), T + 1));

        assert!(m.unsubscribe("a"));
        assert_eq!(m.channel_count(), 0);
        assert_eq!(m.transport().closed, vec!["btcusd"]);
        assert!(m.last_bar("btcusd", Resolution::Day1).is_none());

        m.subscribe("btcusd", Resolution::Day1, recorder("b", &log), Some(Bar::flat(T, dec!(7))))
            .unwrap();
        assert_eq!(m.last_bar("btcusd", Resolution::Day1), Some(Bar::flat(T, dec!(7))));
        assert_eq!(m.transport().opened, vec!["btcusd", "btcusd"]);
    }

    #[test]
    fn unsubscribed_handle_receives_nothing_more() {
        let log: Log = Default::default();
        let mut m = mux();
        m.subscribe("btcusd", Resolution::Day1, recorder("a", &log), None).unwrap();
        m.subscribe("btcusd", Resolution::Day1, recorder("b", &log), None).unwrap();

        assert!(m.unsubscribe("a"));
        assert!(!m.unsubscribe("a"));
        assert!(m.transport().closed.is_empty());

        m.on_transport_message(&tick("btcusd", dec!(1), T));
        let log = log.lock();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].0, "b");
    }

    #[test]
    fn panicking_callback_does_not_block_others() {
        let log: Log = Default::default();
        let mut m = mux();
        m.subscribe(
            "btcusd",
            Resolution::Day1,
            SubscriptionHandle::new("boom", |_: &Bar| panic!("chart exploded")),
            None,
        )
        .unwrap();
        m.subscribe("btcusd", Resolution::Day1, recorder("b", &log), None).unwrap();

        assert_eq!(m.on_transport_message(&tick("btcusd", dec!(3), T)), 2);
        assert_eq!(m.on_transport_message(&tick("btcusd", dec!(4), T + 1)), 2);
        assert_eq!(log.lock().len(), 2);
    }

    #[test]
    fn resolutions_share_one_channel_with_separate_bars() {
        let log: Log = Default::default();
        let mut m = mux();
        m.subscribe("btcusd", Resolution::Day1, recorder("day", &log), Some(Bar::flat(T, dec!(10))))
            .unwrap();
        m.subscribe("btcusd", Resolution::Hour1, recorder("hour", &log), Some(Bar::flat(T + 3_600, dec!(11))))
            .unwrap();
        assert_eq!(m.transport().opened.len(), 1);

        m.on_transport_message(&tick("btcusd", dec!(12), T + 7_300));

        assert_eq!(m.last_bar("btcusd", Resolution::Day1).unwrap().time, T);
        assert_eq!(m.last_bar("btcusd", Resolution::Hour1).unwrap().time, T + 7_200);

        assert!(m.unsubscribe("day"));
        assert_eq!(m.channel_count(), 1);
        assert!(m.last_bar("btcusd", Resolution::Day1).is_none());
        assert!(m.unsubscribe("hour"));
        assert_eq!(m.channel_count(), 0);
    }

    #[test]
    fn mixed_resolutions_are_delivered_in_insertion_order() {
        let log: Log = Default::default();
        let mut m = mux();
        m.subscribe("btcusd", Resolution::Day1, recorder("a", &log), Some(Bar::flat(T, dec!(10))))
            .unwrap();
        m.subscribe("btcusd", Resolution::Hour1, recorder("b", &log), None).unwrap();
        m.subscribe("btcusd", Resolution::Day1, recorder("c", &log), None).unwrap();

        assert_eq!(m.on_transport_message(&tick("btcusd", dec!(12), T + 60)), 3);

        let log = log.lock();
        let ids: Vec<&str> = log.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(log[0].1, log[2].1);
        assert_eq!(log[1].1, Bar::flat(T, dec!(12)));
        assert_eq!(log[0].1.open, dec!(10));
    }

    #[test]
    fn resolution_change_for_same_id_is_rejected() {
        let log: Log = Default::default();
        let mut m = mux();
        m.subscribe("btcusd", Resolution::Day1, recorder("a", &log), None).unwrap();
        assert_eq!(
            m.subscribe("btcusd", Resolution::Hour1, recorder("a", &log), None),
            Err(FeedError::SubscriberConflict("a".into()))
        );
        assert!(m.last_bar("btcusd", Resolution::Hour1).is_none());
        assert_eq!(m.handle_count("btcusd"), 1);
    }
}
