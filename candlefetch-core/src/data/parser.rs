//! Record stream parser: incremental candle decoding over raw response bytes.
//!
//! The broker's candle response is consumed as it arrives, fragment by
//! fragment, with no guarantee about where fragment boundaries fall. The
//! framing assumptions are minimal:
//!
//! 1. Everything before the opening array marker (`[`) is header noise.
//! 2. After it, numeric tokens are separated by `:`. A token is whatever
//!    remains of a segment once every byte other than `0-9` and `.` is
//!    stripped; segments that strip to nothing carry no value.
//!
//! Decoded values accumulate until at least one full row is available,
//! then whole rows are flushed through the encoder. Partial rows never
//! leave the parser.
//!
//! The parser is lenient: unparseable tokens are counted and
//! skipped, a missing marker just means "nothing yet", and at end of stream
//! both the unterminated tail token and any values short of a full row are
//! dropped.

use super::encoder::{RowBuffer, RowLayout};

/// Byte that opens the candle array.
pub const OPENING_MARKER: u8 = b'[';

/// Byte separating tokens in the feed text.
pub const FIELD_SEPARATOR: u8 = b':';

/// Per-chunk parse state. Owned by exactly one pipeline.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ParserState {
    /// Trailing bytes after the last separator; may be an incomplete token.
    pub pending_tail: Vec<u8>,
    /// Decoded values not yet flushed into a row buffer (arrival order).
    pub accumulated_values: Vec<f64>,
    pub saw_opening_marker: bool,
    pub is_final_fragment: bool,
}

/// Counters reported when a chunk terminates.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ParserStats {
    pub fragments: u64,
    pub bytes_seen: u64,
    pub values_decoded: u64,
    pub rows_emitted: u64,
    pub buffers_emitted: u64,
    /// Tokens that stripped to non-empty text but did not parse as a number.
    pub anomalies: u64,
    /// Values left over at end of stream that did not fill a row.
    pub discarded_values: u64,
    /// Bytes of the unterminated token pending at end of stream.
    pub discarded_tail_bytes: u64,
}

/// Stateful fragment-to-row transform for one chunk.
#[derive(Debug)]
pub struct RecordStreamParser {
    layout: RowLayout,
    state: ParserState,
    stats: ParserStats,
    scratch: String,
}

impl RecordStreamParser {
    pub fn new(layout: RowLayout) -> Self {
        Self {
            layout,
            state: ParserState::default(),
            stats: ParserStats::default(),
            scratch: String::with_capacity(32),
        }
    }

    pub fn layout(&self) -> RowLayout {
        self.layout
    }

    pub fn state(&self) -> &ParserState {
        &self.state
    }

    pub fn stats(&self) -> ParserStats {
        self.stats
    }

    /// Consume one fragment; returns a buffer if at least one full row is ready.
    pub fn push(&mut self, fragment: &[u8]) -> Option<RowBuffer> {
        debug_assert!(!self.state.is_final_fragment, "push after finish");
        self.stats.fragments += 1;
        self.stats.bytes_seen += fragment.len() as u64;

        let data = if self.state.saw_opening_marker {
            fragment
        } else {
            match fragment.iter().position(|&b| b == OPENING_MARKER) {
                Some(at) => {
                    self.state.saw_opening_marker = true;
                    &fragment[at..]
                }
                None => return None,
            }
        };

        let mut buffered = std::mem::take(&mut self.state.pending_tail);
        buffered.extend_from_slice(data);

        match buffered.iter().rposition(|&b| b == FIELD_SEPARATOR) {
            Some(last_sep) => {
                for segment in buffered[..last_sep].split(|&b| b == FIELD_SEPARATOR) {
                    self.decode_segment(segment);
                }
                buffered.drain(..=last_sep);
                self.state.pending_tail = buffered;
            }
            None => self.state.pending_tail = buffered,
        }

        self.flush()
    }

    /// End of stream: flushes every complete row already decoded. The pending
    /// tail was never terminated by a separator and is dropped undecoded, as
    /// is any remainder short of a row.
    pub fn finish(&mut self) -> Option<RowBuffer> {
        self.state.is_final_fragment = true;
        let tail = self.state.pending_tail.len();
        if tail > 0 {
            self.stats.discarded_tail_bytes += tail as u64;
            self.state.pending_tail.clear();
        }

        let out = self.flush();
        let leftover = self.state.accumulated_values.len();
        if leftover > 0 {
            self.stats.discarded_values += leftover as u64;
            tracing::debug!(leftover, "trailing_remainder_discarded");
            self.state.accumulated_values.clear();
        }
        out
    }

    /// Drop everything buffered; used when the stream fails.
    pub fn abandon(&mut self) {
        self.state.pending_tail.clear();
        self.state.accumulated_values.clear();
    }

    fn decode_segment(&mut self, segment: &[u8]) {
        self.scratch.clear();
        self.scratch.extend(
            segment
                .iter()
                .filter(|b| b.is_ascii_digit() || **b == b'.')
                .map(|&b| b as char),
        );
        if self.scratch.is_empty() {
            return;
        }

        match self.scratch.parse::<f64>() {
            Ok(value) => {
                self.state.accumulated_values.push(value);
                self.stats.values_decoded += 1;
            }
            Err(_) => {
                self.stats.anomalies += 1;
                tracing::debug!(token = %self.scratch, "parse_anomaly");
            }
        }
    }

    fn flush(&mut self) -> Option<RowBuffer> {
        let n = self.layout.field_count();
        let ready = self.state.accumulated_values.len() / n * n;
        if ready == 0 {
            return None;
        }

        let buf = self.layout.encode(&self.state.accumulated_values[..ready]);
        self.state.accumulated_values.drain(..ready);
        self.stats.rows_emitted += (ready / n) as u64;
        self.stats.buffers_emitted += 1;
        Some(buf)
    }
}
