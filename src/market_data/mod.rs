pub mod candle_aggregator;
pub mod multiplexer;
pub mod symbol;
pub mod transport;

pub use candle_aggregator::CandleAggregator;
pub use multiplexer::{Multiplexer, SubscribeOutcome, SubscriptionHandle};
pub use symbol::{SymbolName, SymbolParts};
pub use transport::{ChannelCommand, ChannelTransport, WsChannelTransport};
