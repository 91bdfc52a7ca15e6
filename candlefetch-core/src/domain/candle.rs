//! Candle: one decoded OHLC(+volume) record and the feed variants that carry it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A single numeric field of a candle record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Field {
    Time,
    BidOpen,
    BidHigh,
    BidLow,
    BidClose,
    AskOpen,
    AskHigh,
    AskLow,
    AskClose,
    Volume,
}

/// Which candle payload the broker feed delivers.
///
/// The variant fixes two orders: the order fields *arrive* in the textual
/// feed, and the canonical order they are *stored* in the binary output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FeedVariant {
    /// Bid (or midpoint) OHLC plus volume: 6 fields.
    Bid,
    /// Bid and ask OHLC plus volume: 10 fields.
    #[default]
    BidAsk,
}

const BID_FIELDS: [Field; 6] = [
    Field::Time,
    Field::BidOpen,
    Field::BidHigh,
    Field::BidLow,
    Field::BidClose,
    Field::Volume,
];

const BID_ASK_STORAGE: [Field; 10] = [
    Field::Time,
    Field::BidOpen,
    Field::BidHigh,
    Field::BidLow,
    Field::BidClose,
    Field::AskOpen,
    Field::AskHigh,
    Field::AskLow,
    Field::AskClose,
    Field::Volume,
];

// The bid/ask feed interleaves both sides per price point.
const BID_ASK_ARRIVAL: [Field; 10] = [
    Field::Time,
    Field::BidOpen,
    Field::AskOpen,
    Field::BidHigh,
    Field::AskHigh,
    Field::BidLow,
    Field::AskLow,
    Field::BidClose,
    Field::AskClose,
    Field::Volume,
];

impl FeedVariant {
    pub fn field_count(self) -> usize {
        self.storage_order().len()
    }

    /// Canonical field order of a stored row.
    pub fn storage_order(self) -> &'static [Field] {
        match self {
            FeedVariant::Bid => &BID_FIELDS,
            FeedVariant::BidAsk => &BID_ASK_STORAGE,
        }
    }

    /// Order in which a row's values appear in the feed text.
    pub fn arrival_order(self) -> &'static [Field] {
        match self {
            FeedVariant::Bid => &BID_FIELDS,
            FeedVariant::BidAsk => &BID_ASK_ARRIVAL,
        }
    }

    /// Candle format parameter sent to the broker.
    pub fn candle_format(self) -> &'static str {
        match self {
            FeedVariant::Bid => "midpoint",
            FeedVariant::BidAsk => "bidask",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown feed variant '{0}' (expected 'bid' or 'bid_ask')")]
pub struct UnknownFeedVariant(pub String);

impl FromStr for FeedVariant {
    type Err = UnknownFeedVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bid" | "mid" | "midpoint" => Ok(FeedVariant::Bid),
            "bid_ask" | "bidask" => Ok(FeedVariant::BidAsk),
            _ => Err(UnknownFeedVariant(s.to_string())),
        }
    }
}

impl fmt::Display for FeedVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedVariant::Bid => f.write_str("bid"),
            FeedVariant::BidAsk => f.write_str("bid_ask"),
        }
    }
}

/// Open/high/low/close for one side of the book.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ohlc {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

/// One decoded candle. `time` is in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CandleRow {
    pub time: f64,
    pub bid: Ohlc,
    pub ask: Option<Ohlc>,
    pub volume: f64,
}

impl CandleRow {
    /// Value of a field, or `None` for ask fields on a bid-only row.
    pub fn get(&self, field: Field) -> Option<f64> {
        let ask = self.ask.as_ref();
        match field {
            Field::Time => Some(self.time),
            Field::BidOpen => Some(self.bid.open),
            Field::BidHigh => Some(self.bid.high),
            Field::BidLow => Some(self.bid.low),
            Field::BidClose => Some(self.bid.close),
            Field::AskOpen => ask.map(|a| a.open),
            Field::AskHigh => ask.map(|a| a.high),
            Field::AskLow => ask.map(|a| a.low),
            Field::AskClose => ask.map(|a| a.close),
            Field::Volume => Some(self.volume),
        }
    }
}
