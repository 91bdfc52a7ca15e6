//! Domain types: granularity, time ranges, candle records and feed variants.

pub mod candle;
pub mod granularity;
pub mod range;

pub use candle::{CandleRow, FeedVariant, Field, Ohlc, UnknownFeedVariant};
pub use granularity::{Granularity, UnknownGranularity};
pub use range::TimeRange;

/// Broker instrument name, e.g. `EUR_USD`.
pub type Symbol = String;
