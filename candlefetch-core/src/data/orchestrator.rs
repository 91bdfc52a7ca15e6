//! Chunk orchestrator: concurrent chunk pipelines with one aggregate completion.
//!
//! A retrieval is planned into chunks, and every chunk gets its own
//! pipeline: open the chunk's byte stream through the session, feed each
//! fragment to a `RecordStreamParser`, forward every emitted buffer to the
//! sink. Pipelines run on a private rayon pool owned by a coordinator
//! thread, so `fetch_candles` returns immediately with a `FetchHandle`.
//!
//! Failure isolation: a chunk error never touches its siblings. The first
//! error observed becomes the retrieval's error; everything else that
//! succeeded has already been delivered to the sink.

use super::encoder::RowLayout;
use super::parser::{ParserStats, RecordStreamParser};
use super::planner::{self, ChunkPlan, ChunkRequest, PlanError};
use super::session::{BrokerSession, SessionError};
use super::sink::CandleSink;
use crate::config::FetchConfig;
use crate::domain::{Granularity, Symbol, TimeRange};
use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Default open streams per available core when no cap is configured.
pub const DEFAULT_STREAMS_PER_CORE: usize = 4;

/// Pool size for a plan of `chunks` chunks. An explicit cap wins; otherwise
/// the pool scales with the machine instead of the plan.
fn worker_count(cap: Option<usize>, chunks: usize) -> usize {
    let cap = cap.unwrap_or_else(|| {
        thread::available_parallelism().map_or(1, |n| n.get()) * DEFAULT_STREAMS_PER_CORE
    });
    cap.clamp(1, chunks.max(1))
}

/// Per-chunk terminal errors.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("chunk {chunk}: transport error: {source}")]
    Transport {
        chunk: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("chunk {chunk}: failed to open candle stream: {source}")]
    Open {
        chunk: usize,
        #[source]
        source: SessionError,
    },

    #[error("chunk {chunk}: cancelled")]
    Cancelled { chunk: usize },

    #[error("fetch workers aborted: {0}")]
    Aborted(String),
}

impl FetchError {
    /// Chunk the error belongs to, if any.
    pub fn chunk(&self) -> Option<usize> {
        match self {
            FetchError::Transport { chunk, .. }
            | FetchError::Open { chunk, .. }
            | FetchError::Cancelled { chunk } => Some(*chunk),
            FetchError::Aborted(_) => None,
        }
    }
}

/// Errors that prevent a retrieval from starting at all.
#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("failed to start fetch workers: {0}")]
    Workers(String),
}

/// One candle retrieval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandleQuery {
    pub symbol: Symbol,
    pub granularity: Granularity,
    pub range: TimeRange,
    /// Upper bound on rows; `None` means "everything in the range".
    pub desired_count: Option<u32>,
}

/// Shared cancellation flag, checked before every fragment.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What a retrieval ended with.
#[derive(Debug, Default)]
pub struct FetchOutcome {
    pub error: Option<FetchError>,
    pub buffers_emitted: usize,
    pub chunks: usize,
}

impl FetchOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Chunk completion bookkeeping shared by all pipelines of a retrieval.
#[derive(Debug)]
pub struct CompletionTally {
    expected: usize,
    finished: AtomicUsize,
    buffers_emitted: AtomicUsize,
    first_error: Mutex<Option<FetchError>>,
}

impl CompletionTally {
    pub fn new(expected: usize) -> Self {
        Self {
            expected,
            finished: AtomicUsize::new(0),
            buffers_emitted: AtomicUsize::new(0),
            first_error: Mutex::new(None),
        }
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn buffers_emitted(&self) -> usize {
        self.buffers_emitted.load(Ordering::SeqCst)
    }

    pub fn record_buffer(&self) {
        self.buffers_emitted.fetch_add(1, Ordering::SeqCst);
    }

    /// Record one chunk's terminal state. Returns `true` for exactly one
    /// call: the one that completes the tally.
    pub fn finish_chunk(&self, error: Option<FetchError>) -> bool {
        if let Some(error) = error {
            let mut slot = self
                .first_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if slot.is_none() {
                *slot = Some(error);
            }
        }
        self.finished.fetch_add(1, Ordering::SeqCst) + 1 == self.expected
    }

    /// Move the aggregate result out. Only meaningful once complete.
    pub fn take_outcome(&self) -> FetchOutcome {
        FetchOutcome {
            error: self
                .first_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
            buffers_emitted: self.buffers_emitted(),
            chunks: self.expected,
        }
    }
}

/// A running retrieval.
#[derive(Debug)]
pub struct FetchHandle {
    plan: ChunkPlan,
    cancel: CancelToken,
    done: Receiver<FetchOutcome>,
    coordinator: Option<JoinHandle<()>>,
}

impl FetchHandle {
    pub fn plan(&self) -> &ChunkPlan {
        &self.plan
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Ask every chunk to stop before its next fragment.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Block until the retrieval has finished.
    pub fn wait(mut self) -> FetchOutcome {
        let outcome = self.done.recv();
        if let Some(coordinator) = self.coordinator.take() {
            if coordinator.join().is_err() {
                warn!("fetch_coordinator_panicked");
            }
        }
        outcome.unwrap_or_else(|_| FetchOutcome {
            error: Some(FetchError::Aborted(
                "a pipeline stopped without reporting completion".into(),
            )),
            buffers_emitted: 0,
            chunks: self.plan.len(),
        })
    }
}

/// Plans retrievals and runs their chunk pipelines against a broker session.
pub struct CandleFetcher {
    session: Arc<dyn BrokerSession>,
    config: FetchConfig,
}

impl CandleFetcher {
    pub fn new(session: Arc<dyn BrokerSession>, config: FetchConfig) -> Self {
        Self { session, config }
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    pub fn plan(&self, query: &CandleQuery) -> Result<ChunkPlan, PlanError> {
        planner::plan(
            &query.symbol,
            query.granularity,
            query.range,
            query.desired_count,
            self.config.per_request_limit,
        )
    }

    /// Start a retrieval.
    ///
    /// Planning errors are returned before any stream is opened. An empty
    /// plan calls `sink.on_done(None, 0)` before this returns. Otherwise
    /// `on_done` fires from a worker thread once every chunk terminated.
    pub fn fetch_candles(
        &self,
        query: &CandleQuery,
        sink: Arc<dyn CandleSink>,
    ) -> Result<FetchHandle, StartError> {
        let plan = self.plan(query)?;
        let cancel = CancelToken::new();
        let (done_tx, done_rx) = mpsc::channel();

        if plan.is_empty() {
            debug!(symbol = %query.symbol, "empty_plan");
            sink.on_done(None, 0);
            let _ = done_tx.send(FetchOutcome::default());
            return Ok(FetchHandle {
                plan,
                cancel,
                done: done_rx,
                coordinator: None,
            });
        }

        let workers = worker_count(self.config.max_concurrent_streams, plan.len());
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("candlefetch-chunk-{i}"))
            .build()
            .map_err(|e| StartError::Workers(e.to_string()))?;

        info!(
            symbol = %query.symbol,
            granularity = %query.granularity,
            chunks = plan.len(),
            rows = plan.total_rows(),
            workers,
            "fetch_started"
        );

        let job = Job {
            session: Arc::clone(&self.session),
            sink,
            layout: RowLayout::new(self.config.feed)
                .with_time_divisor(self.session.candle_time_divisor()),
            read_buffer_size: self.config.read_buffer_size.max(1),
            cancel: cancel.clone(),
            tally: CompletionTally::new(plan.len()),
            done: done_tx,
            started: Instant::now(),
        };
        let chunks = plan.clone();

        let coordinator = thread::Builder::new()
            .name("candlefetch-coordinator".into())
            .spawn(move || {
                pool.scope(|scope| {
                    for chunk in chunks.iter() {
                        let job = &job;
                        scope.spawn(move |_| job.run(chunk));
                    }
                });
            })
            .map_err(|e| StartError::Workers(e.to_string()))?;

        Ok(FetchHandle {
            plan,
            cancel,
            done: done_rx,
            coordinator: Some(coordinator),
        })
    }
}

/// Everything a chunk pipeline needs, shared by reference inside the pool scope.
struct Job {
    session: Arc<dyn BrokerSession>,
    sink: Arc<dyn CandleSink>,
    layout: RowLayout,
    read_buffer_size: usize,
    cancel: CancelToken,
    tally: CompletionTally,
    done: Sender<FetchOutcome>,
    started: Instant,
}

impl Job {
    fn run(&self, chunk: &ChunkRequest) {
        let result = self.pipeline(chunk);

        match &result {
            Ok(stats) => {
                debug!(
                    symbol = %chunk.symbol,
                    chunk = chunk.index,
                    rows = stats.rows_emitted,
                    buffers = stats.buffers_emitted,
                    bytes = stats.bytes_seen,
                    anomalies = stats.anomalies,
                    discarded = stats.discarded_values,
                    "chunk_finished"
                );
                if stats.anomalies > 0 {
                    warn!(
                        symbol = %chunk.symbol,
                        chunk = chunk.index,
                        anomalies = stats.anomalies,
                        "chunk_parse_anomalies"
                    );
                }
            }
            Err(e) => warn!(symbol = %chunk.symbol, chunk = chunk.index, error = %e, "chunk_failed"),
        }
        self.sink.on_chunk_complete(chunk, result.as_ref());

        if self.tally.finish_chunk(result.err()) {
            let outcome = self.tally.take_outcome();
            info!(
                chunks = outcome.chunks,
                buffers = outcome.buffers_emitted,
                failed = outcome.error.is_some(),
                elapsed_ms = self.started.elapsed().as_millis() as u64,
                "fetch_done"
            );
            self.sink
                .on_done(outcome.error.as_ref(), outcome.buffers_emitted);
            let _ = self.done.send(outcome);
        }
    }

    fn pipeline(&self, chunk: &ChunkRequest) -> Result<ParserStats, FetchError> {
        let cancelled = || FetchError::Cancelled { chunk: chunk.index };
        if self.cancel.is_cancelled() {
            return Err(cancelled());
        }

        let opened = Instant::now();
        let mut stream = self
            .session
            .open_candle_stream(chunk, self.layout.variant())
            .map_err(|source| FetchError::Open {
                chunk: chunk.index,
                source,
            })?;

        let mut parser = RecordStreamParser::new(self.layout);
        let mut fragment = vec![0u8; self.read_buffer_size];
        let mut first_byte = true;

        loop {
            let n = match stream.read(&mut fragment) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(source) => {
                    parser.abandon();
                    return Err(FetchError::Transport {
                        chunk: chunk.index,
                        source,
                    });
                }
            };

            if first_byte {
                first_byte = false;
                info!(
                    symbol = %chunk.symbol,
                    chunk = chunk.index,
                    elapsed_ms = opened.elapsed().as_millis() as u64,
                    "chunk_first_byte"
                );
            }

            if self.cancel.is_cancelled() {
                parser.abandon();
                return Err(cancelled());
            }

            if let Some(buffer) = parser.push(&fragment[..n]) {
                self.tally.record_buffer();
                self.sink.on_data(chunk, buffer);
            }
        }

        if let Some(buffer) = parser.finish() {
            self.tally.record_buffer();
            self.sink.on_data(chunk, buffer);
        }
        Ok(parser.stats())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tally_completes_exactly_once() {
        let tally = CompletionTally::new(3);
        assert!(!tally.finish_chunk(None));
        assert!(!tally.finish_chunk(Some(FetchError::Cancelled { chunk: 1 })));
        assert!(tally.finish_chunk(Some(FetchError::Cancelled { chunk: 2 })));
        assert_eq!(tally.finished(), tally.expected());

        let outcome = tally.take_outcome();
        assert_eq!(outcome.error.and_then(|e| e.chunk()), Some(1));
    }

    #[test]
    fn worker_count_honours_explicit_cap() {
        assert_eq!(worker_count(Some(2), 10), 2);
        assert_eq!(worker_count(Some(50), 3), 3);
        assert_eq!(worker_count(Some(0), 3), 1);
    }

    #[test]
    fn default_worker_count_is_bounded_by_cores() {
        let cores = thread::available_parallelism().map_or(1, |n| n.get());
        let bound = cores * DEFAULT_STREAMS_PER_CORE;
        assert_eq!(worker_count(None, 3), bound.min(3));
        assert_eq!(worker_count(None, 100_000), bound);
    }

    #[test]
    fn tally_counts_buffers() {
        let tally = CompletionTally::new(1);
        tally.record_buffer();
        tally.record_buffer();
        assert!(tally.finish_chunk(None));
        let outcome = tally.take_outcome();
        assert!(outcome.is_success());
        assert_eq!(outcome.buffers_emitted, 2);
        assert_eq!(outcome.chunks, 1);
    }

    #[test]
    fn tally_is_safe_across_threads() {
        let tally = Arc::new(CompletionTally::new(64));
        let completions = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..64)
            .map(|_| {
                let tally = Arc::clone(&tally);
                let completions = Arc::clone(&completions);
                thread::spawn(move || {
                    if tally.finish_chunk(None) {
                        completions.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(completions.load(Ordering::SeqCst), 1);
        assert_eq!(tally.finished(), 64);
    }

    #[test]
    fn cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
