//! Candle sinks: where a retrieval delivers its row buffers.

use super::encoder::RowBuffer;
use super::orchestrator::FetchError;
use super::parser::ParserStats;
use super::planner::ChunkRequest;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Receiver of a retrieval's output.
///
/// Called from worker threads, concurrently for different chunks. Within a
/// chunk, `on_data` calls arrive in stream order; across chunks there is no
/// ordering. `on_done` is called exactly once, after every chunk terminated.
pub trait CandleSink: Send + Sync {
    /// A batch of complete rows from `chunk`.
    fn on_data(&self, chunk: &ChunkRequest, buffer: RowBuffer);

    /// A chunk reached its terminal state.
    fn on_chunk_complete(&self, _chunk: &ChunkRequest, _result: Result<&ParserStats, &FetchError>) {
    }

    /// The whole retrieval finished. `error` is the first chunk error observed.
    fn on_done(&self, error: Option<&FetchError>, buffers_emitted: usize);
}

/// Final summary as seen by `on_done`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DoneSignal {
    pub error: Option<String>,
    pub buffers_emitted: usize,
}

/// Sink that keeps every buffer in memory, tagged with its chunk index.
#[derive(Debug, Default)]
pub struct CollectingSink {
    buffers: Mutex<Vec<(usize, RowBuffer)>>,
    completed_chunks: Mutex<Vec<usize>>,
    done: Mutex<Vec<DoneSignal>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers in arrival order.
    pub fn buffers(&self) -> Vec<(usize, RowBuffer)> {
        lock(&self.buffers).clone()
    }

    pub fn take_buffers(&self) -> Vec<(usize, RowBuffer)> {
        std::mem::take(&mut *lock(&self.buffers))
    }

    /// Buffers re-sorted by the time of their first row.
    pub fn sorted_by_time(&self) -> Vec<RowBuffer> {
        let mut buffers: Vec<RowBuffer> =
            lock(&self.buffers).iter().map(|(_, b)| b.clone()).collect();
        buffers.sort_by(|a, b| {
            let (ta, tb) = (a.first_time().unwrap_or(f64::MIN), b.first_time().unwrap_or(f64::MIN));
            ta.total_cmp(&tb)
        });
        buffers
    }

    pub fn row_count(&self) -> usize {
        lock(&self.buffers).iter().map(|(_, b)| b.row_count()).sum()
    }

    /// Chunk indices in the order they terminated.
    pub fn completed_chunks(&self) -> Vec<usize> {
        lock(&self.completed_chunks).clone()
    }

    /// Every `on_done` call received; a correct retrieval produces exactly one.
    pub fn done_signals(&self) -> Vec<DoneSignal> {
        lock(&self.done).clone()
    }
}

impl CandleSink for CollectingSink {
    fn on_data(&self, chunk: &ChunkRequest, buffer: RowBuffer) {
        lock(&self.buffers).push((chunk.index, buffer));
    }

    fn on_chunk_complete(&self, chunk: &ChunkRequest, _result: Result<&ParserStats, &FetchError>) {
        lock(&self.completed_chunks).push(chunk.index);
    }

    fn on_done(&self, error: Option<&FetchError>, buffers_emitted: usize) {
        lock(&self.done).push(DoneSignal {
            error: error.map(|e| e.to_string()),
            buffers_emitted,
        });
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::encoder::RowLayout;
    use crate::domain::{FeedVariant, Granularity};
    use chrono::{TimeZone, Utc};

    fn chunk(index: usize) -> ChunkRequest {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        ChunkRequest {
            index,
            symbol: "EUR_USD".into(),
            granularity: Granularity::M1,
            from: t,
            until: t,
            row_count_estimate: 1,
        }
    }

    #[test]
    fn sorted_by_time_orders_buffers_across_chunks() {
        let layout = RowLayout::new(FeedVariant::Bid);
        let sink = CollectingSink::new();
        sink.on_data(&chunk(1), layout.encode(&[9000.0, 1.0, 1.0, 1.0, 1.0, 1.0]));
        sink.on_data(&chunk(0), layout.encode(&[3000.0, 1.0, 1.0, 1.0, 1.0, 1.0]));

        let times: Vec<f64> = sink
            .sorted_by_time()
            .iter()
            .filter_map(|b| b.first_time())
            .collect();
        assert_eq!(times, vec![3.0, 9.0]);
        assert_eq!(sink.row_count(), 2);
    }

    #[test]
    fn done_signals_are_recorded() {
        let sink = CollectingSink::new();
        sink.on_done(None, 4);
        assert_eq!(
            sink.done_signals(),
            vec![DoneSignal { error: None, buffers_emitted: 4 }]
        );
    }
}
