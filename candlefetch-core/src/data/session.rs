//! Broker session boundary and structured error types.
//!
//! `BrokerSession` abstracts over the broker transport so the fetch pipeline
//! never sees HTTP, tokens or environments. The pipeline only asks for a
//! byte stream per chunk; the remaining capabilities (accounts, symbols,
//! prices, ticks) are passed through for the outer layers.

use super::encoder::MILLIS_PER_SECOND;
use super::planner::ChunkRequest;
use crate::domain::FeedVariant;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::time::Duration;
use thiserror::Error;

/// Symbols preselected in the UI and used as CLI defaults.
pub const FAVORITE_SYMBOLS: [&str; 3] = ["EUR_USD", "BCO_USD", "NZD_AUD"];

/// Raw candle response body for one chunk. End of stream is `Ok(0)`.
pub type CandleStream = Box<dyn Read + Send>;

/// Errors raised by a broker session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("broker returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("authentication required: {0}")]
    AuthenticationRequired(String),

    #[error("response format changed: {0}")]
    ResponseFormatChanged(String),

    #[error("symbol not found: {symbol}")]
    SymbolNotFound { symbol: String },

    #[error("session is closed")]
    Closed,

    #[error("session error: {0}")]
    Other(String),
}

/// A trading account visible to the token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    #[serde(rename = "accountId")]
    pub account_id: u64,
    #[serde(rename = "accountName")]
    pub name: String,
    #[serde(rename = "accountCurrency")]
    pub currency: String,
    #[serde(rename = "marginRate")]
    pub margin_rate: f64,
}

/// A tradeable instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolInfo {
    #[serde(alias = "instrument")]
    pub name: String,
    #[serde(rename = "displayName")]
    pub display_name: String,
    pub pip: String,
    #[serde(rename = "maxTradeUnits")]
    pub max_trade_units: f64,
}

/// Current quote for an instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Price {
    pub instrument: String,
    pub time: String,
    pub bid: f64,
    pub ask: f64,
}

/// A single live price update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub instrument: String,
    pub time: String,
    pub bid: f64,
    pub ask: f64,
}

/// Receiving end of one tick subscription.
///
/// The subscription ends (receives return disconnected) once the session
/// unsubscribes the symbols, is closed, or the upstream stream drops.
#[derive(Debug)]
pub struct TickSubscription {
    symbols: Vec<String>,
    receiver: Receiver<Tick>,
}

impl TickSubscription {
    pub fn new(symbols: Vec<String>, receiver: Receiver<Tick>) -> Self {
        Self { symbols, receiver }
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    /// Block until the next tick; `None` once the subscription has ended.
    pub fn recv(&self) -> Option<Tick> {
        self.receiver.recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<Tick, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    pub fn try_recv(&self) -> Result<Tick, TryRecvError> {
        self.receiver.try_recv()
    }

    pub fn iter(&self) -> impl Iterator<Item = Tick> + '_ {
        self.receiver.iter()
    }
}

/// Broker capabilities consumed by the fetch pipeline and the CLI.
///
/// Implementations own transport concerns (auth, timeouts, retries). The
/// pipeline never retries a failed call.
pub trait BrokerSession: Send + Sync {
    /// Human-readable name of this session's broker.
    fn name(&self) -> &str;

    /// Open the raw candle response for one chunk.
    fn open_candle_stream(
        &self,
        chunk: &ChunkRequest,
        feed: FeedVariant,
    ) -> Result<CandleStream, SessionError>;

    /// Units per second of the numeric time field in this session's candle
    /// streams. Millisecond feeds keep the default.
    fn candle_time_divisor(&self) -> u32 {
        MILLIS_PER_SECOND
    }

    fn accounts(&self) -> Result<Vec<Account>, SessionError>;

    fn symbols(&self) -> Result<Vec<SymbolInfo>, SessionError>;

    fn current_prices(&self, symbols: &[String]) -> Result<Vec<Price>, SessionError>;

    /// Start streaming ticks for `symbols` into a fresh channel.
    fn subscribe_ticks(&self, symbols: &[String]) -> Result<TickSubscription, SessionError>;

    /// Stop every subscription that covers any of `symbols`.
    fn unsubscribe_ticks(&self, symbols: &[String]) -> Result<(), SessionError>;

    /// Stop all subscriptions and refuse further calls.
    fn close(&self);

    /// True if the broker answers an accounts request.
    fn test_connection(&self) -> bool {
        self.accounts().is_ok()
    }
}
