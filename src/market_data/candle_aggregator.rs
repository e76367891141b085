// =============================================================================
// Candle Aggregator: folds live trade ticks into the in-progress bar
// =============================================================================
//
// One aggregator exists per (symbol, resolution) series. It starts either with
// the last historical bar as a seed or with no bar at all, in which case the
// first live tick opens a bar aligned to its bucket.
//
// Bucket continuity wins over wall-clock accuracy: a tick past the current
// bucket always opens the *next* bucket, however many buckets were skipped.
// =============================================================================

use tracing::trace;

use crate::types::{Bar, Resolution, TradeTick};

#[derive(Debug, Clone)]
pub struct CandleAggregator {
    resolution: Resolution,
    last_bar: Option<Bar>,
}

impl CandleAggregator {
    pub fn new(resolution: Resolution, seed: Option<Bar>) -> Self {
        Self {
            resolution,
            last_bar: seed,
        }
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    #[cfg(test)]
    pub fn last_bar(&self) -> Option<&Bar> {
        self.last_bar.as_ref()
    }

    /// Fold `tick` into the current bar and return the bar as it now stands.
    pub fn on_tick(&mut self, tick: &TradeTick) -> Bar {
        let bar = match self.last_bar {
            None => {
                // No historical seed: open the bucket the tick falls in.
                Bar::flat(self.resolution.align(tick.timestamp), tick.price)
            }
            Some(last) => {
                let next_bucket_time = last.time + self.resolution.bucket_secs();
                if tick.timestamp >= next_bucket_time {
                    Bar::flat(next_bucket_time, tick.price)
                } else {
                    Bar {
                        high: last.high.max(tick.price),
                        low: last.low.min(tick.price),
                        close: tick.price,
                        ..last
                    }
                }
            }
        };

        trace!(
            market = %tick.market,
            resolution = %self.resolution,
            time = bar.time,
            close = %bar.close,
            "bar updated"
        );

        self.last_bar = Some(bar);
        bar
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
