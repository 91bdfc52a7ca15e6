//! Candle retrieval pipeline: plan, stream, parse, encode, deliver.

pub mod encoder;
pub mod oanda;
pub mod orchestrator;
pub mod parser;
pub mod planner;
pub mod session;
pub mod sink;

pub use encoder::{DecodeError, RowBuffer, RowLayout, FIELD_WIDTH, MILLIS_PER_SECOND};
pub use oanda::OandaSession;
pub use orchestrator::{
    CancelToken, CandleFetcher, CandleQuery, CompletionTally, FetchError, FetchHandle,
    FetchOutcome, StartError,
};
pub use parser::{ParserState, ParserStats, RecordStreamParser};
pub use planner::{plan, ChunkPlan, ChunkRequest, PlanError, DEFAULT_PER_REQUEST_LIMIT};
pub use session::{
    Account, BrokerSession, CandleStream, Price, SessionError, SymbolInfo, Tick,
    TickSubscription, FAVORITE_SYMBOLS,
};
pub use sink::{CandleSink, CollectingSink, DoneSignal};
