//! Real-time Polymarket market-channel fan-out.
//!
//! One [`FeedConnection`] holds the upstream WebSocket. A [`FanoutService`]
//! on top of it reference-counts subscriptions, keeps the latest price and
//! book per instrument in a [`MarketCache`] and derives the yes/no pair
//! signal for market subscriptions.

pub mod cache;
pub mod config;
pub mod fanout;
pub mod market;
pub mod orderbook;
pub mod ws;

pub use cache::MarketCache;
pub use config::Config;
pub use fanout::{Callbacks, FanoutService, PairUpdate, SubscribeError, Subscription};
pub use orderbook::{BookSnapshot, PriceSnapshot, TradeEvent};
pub use ws::connection::{ConnectionState, FeedConnection};
pub use ws::protocol::FeedMessage;
pub use ws::WsError;
