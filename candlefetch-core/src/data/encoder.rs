//! Binary row encoder.
//!
//! Layout of an encoded buffer:
//! - row-major, one fixed-width record per candle
//! - each field is an IEEE-754 `f64`, little-endian, 8 bytes
//! - fields in canonical storage order (`FeedVariant::storage_order`)
//! - the time field is stored in seconds: the feed's numeric time divided by
//!   the layout's time divisor (1000 for a millisecond feed)
//!
//! Values enter in feed *arrival* order and are permuted into storage order
//! here, so the parser never needs to know the schema.

use crate::domain::{CandleRow, FeedVariant, Field, Ohlc};
use thiserror::Error;

/// Bytes per stored field.
pub const FIELD_WIDTH: usize = std::mem::size_of::<f64>();

const MAX_FIELDS: usize = 10;

/// Feed time units per stored second for a millisecond feed.
pub const MILLIS_PER_SECOND: u32 = 1000;

/// Fixed-width record schema for one feed variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowLayout {
    variant: FeedVariant,
    /// Storage slot for each arrival position.
    slots: [usize; MAX_FIELDS],
    time_slot: usize,
    time_divisor: u32,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("buffer of {len} bytes is not a whole number of {record_size}-byte records")]
    PartialRecord { len: usize, record_size: usize },
}

impl RowLayout {
    pub fn new(variant: FeedVariant) -> Self {
        let storage = variant.storage_order();
        let mut slots = [0usize; MAX_FIELDS];
        for (arrival_idx, field) in variant.arrival_order().iter().enumerate() {
            slots[arrival_idx] = slot_of(storage, *field);
        }
        Self {
            variant,
            slots,
            time_slot: slot_of(storage, Field::Time),
            time_divisor: MILLIS_PER_SECOND,
        }
    }

    /// Same layout for a feed whose time field counts `divisor` units per second.
    /// Zero is treated as one.
    pub fn with_time_divisor(mut self, divisor: u32) -> Self {
        self.time_divisor = divisor.max(1);
        self
    }

    pub fn time_divisor(&self) -> u32 {
        self.time_divisor
    }

    pub fn variant(&self) -> FeedVariant {
        self.variant
    }

    pub fn field_count(&self) -> usize {
        self.variant.field_count()
    }

    /// Bytes per encoded candle.
    pub fn record_size(&self) -> usize {
        self.field_count() * FIELD_WIDTH
    }

    /// Encode values (feed arrival order) into a row buffer.
    ///
    /// # Panics
    ///
    /// If `values.len()` is not a multiple of the field count. Callers only
    /// ever flush whole rows.
    pub fn encode(&self, values: &[f64]) -> RowBuffer {
        let n = self.field_count();
        assert!(
            values.len() % n == 0,
            "encode called with {} values, not a multiple of {n}",
            values.len()
        );

        let record_size = self.record_size();
        let divisor = f64::from(self.time_divisor);
        let mut bytes = vec![0u8; values.len() * FIELD_WIDTH];

        for (row_idx, row) in values.chunks_exact(n).enumerate() {
            let base = row_idx * record_size;
            for (arrival_idx, &value) in row.iter().enumerate() {
                let slot = self.slots[arrival_idx];
                let stored = if slot == self.time_slot {
                    value / divisor
                } else {
                    value
                };
                let at = base + slot * FIELD_WIDTH;
                bytes[at..at + FIELD_WIDTH].copy_from_slice(&stored.to_le_bytes());
            }
        }

        RowBuffer {
            layout: *self,
            bytes,
        }
    }
}

fn slot_of(order: &[Field], field: Field) -> usize {
    order
        .iter()
        .position(|f| *f == field)
        .unwrap_or_else(|| unreachable!("{field:?} missing from storage order"))
}

/// An integral number of encoded candle records.
#[derive(Debug, Clone, PartialEq)]
pub struct RowBuffer {
    layout: RowLayout,
    bytes: Vec<u8>,
}

impl RowBuffer {
    /// Wrap bytes produced elsewhere (e.g. read back from a consumer).
    pub fn from_bytes(layout: RowLayout, bytes: Vec<u8>) -> Result<Self, DecodeError> {
        if bytes.len() % layout.record_size() != 0 {
            return Err(DecodeError::PartialRecord {
                len: bytes.len(),
                record_size: layout.record_size(),
            });
        }
        Ok(Self { layout, bytes })
    }

    pub fn layout(&self) -> RowLayout {
        self.layout
    }

    pub fn row_count(&self) -> usize {
        self.bytes.len() / self.layout.record_size()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Stored values, storage order, row after row.
    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.bytes.chunks_exact(FIELD_WIDTH).map(read_f64)
    }

    /// Time (seconds) of the first row; consumers sort buffers by this.
    pub fn first_time(&self) -> Option<f64> {
        self.bytes.get(..FIELD_WIDTH).map(read_f64)
    }

    pub fn rows(&self) -> impl Iterator<Item = CandleRow> + '_ {
        let order = self.layout.variant.storage_order();
        self.bytes
            .chunks_exact(self.layout.record_size())
            .map(move |record| decode_row(order, record))
    }
}

fn read_f64(bytes: &[u8]) -> f64 {
    let mut raw = [0u8; FIELD_WIDTH];
    raw.copy_from_slice(bytes);
    f64::from_le_bytes(raw)
}

fn decode_row(order: &[Field], record: &[u8]) -> CandleRow {
    let mut row = CandleRow {
        time: 0.0,
        bid: Ohlc { open: 0.0, high: 0.0, low: 0.0, close: 0.0 },
        ask: None,
        volume: 0.0,
    };
    let mut ask = Ohlc { open: 0.0, high: 0.0, low: 0.0, close: 0.0 };
    let mut has_ask = false;

    for (field, raw) in order.iter().zip(record.chunks_exact(FIELD_WIDTH)) {
        let value = read_f64(raw);
        match field {
            Field::Time => row.time = value,
            Field::BidOpen => row.bid.open = value,
            Field::BidHigh => row.bid.high = value,
            Field::BidLow => row.bid.low = value,
            Field::BidClose => row.bid.close = value,
            Field::AskOpen => {
                ask.open = value;
                has_ask = true;
            }
            Field::AskHigh => ask.high = value,
            Field::AskLow => ask.low = value,
            Field::AskClose => ask.close = value,
            Field::Volume => row.volume = value,
        }
    }

    if has_ask {
        row.ask = Some(ask);
    }
    row
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bid_row_is_stored_verbatim_except_time() {
        let layout = RowLayout::new(FeedVariant::Bid);
        let buf = layout.encode(&[1_700_000_000_000.0, 1.1, 1.3, 1.0, 1.2, 42.0]);

        assert_eq!(buf.row_count(), 1);
        assert_eq!(buf.as_bytes().len(), 48);
        assert_eq!(&buf.as_bytes()[..8], &1_700_000_000.0f64.to_le_bytes());
        assert_eq!(&buf.as_bytes()[40..48], &42.0f64.to_le_bytes());
    }

    #[test]
    fn microsecond_feed_time_is_stored_in_seconds() {
        let layout = RowLayout::new(FeedVariant::Bid).with_time_divisor(1_000_000);
        let buf = layout.encode(&[1_704_067_200_000_000.0, 1.1, 1.3, 1.0, 1.2, 42.0]);
        assert_eq!(buf.first_time(), Some(1_704_067_200.0));
        assert_eq!(layout.time_divisor(), 1_000_000);
        assert_eq!(RowLayout::new(FeedVariant::Bid).time_divisor(), MILLIS_PER_SECOND);
    }

    #[test]
    fn bid_ask_arrival_is_permuted_to_storage_order() {
        let layout = RowLayout::new(FeedVariant::BidAsk);
        // time, openBid, openAsk, highBid, highAsk, lowBid, lowAsk, closeBid, closeAsk, volume
        let buf = layout.encode(&[5000.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0]);
        let stored: Vec<f64> = buf.values().collect();
        assert_eq!(stored, vec![5.0, 1.0, 3.0, 5.0, 7.0, 2.0, 4.0, 6.0, 8.0, 9.0]);
    }

    #[test]
    fn rows_decode_back_to_candles() {
        let layout = RowLayout::new(FeedVariant::BidAsk);
        let buf = layout.encode(&[
            60_000.0, 1.0, 1.5, 2.0, 2.5, 0.5, 1.0, 1.5, 2.0, 100.0, //
            120_000.0, 1.5, 2.0, 2.5, 3.0, 1.0, 1.5, 2.0, 2.5, 200.0,
        ]);

        let rows: Vec<CandleRow> = buf.rows().collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].time, 60.0);
        assert_eq!(rows[0].bid, Ohlc { open: 1.0, high: 2.0, low: 0.5, close: 1.5 });
        assert_eq!(rows[0].ask, Some(Ohlc { open: 1.5, high: 2.5, low: 1.0, close: 2.0 }));
        assert_eq!(rows[1].volume, 200.0);
        assert_eq!(buf.first_time(), Some(60.0));
    }

    #[test]
    fn empty_input_encodes_empty_buffer() {
        let buf = RowLayout::new(FeedVariant::Bid).encode(&[]);
        assert!(buf.is_empty());
        assert_eq!(buf.first_time(), None);
        assert_eq!(buf.rows().count(), 0);
    }

    #[test]
    #[should_panic(expected = "not a multiple")]
    fn partial_row_is_a_contract_violation() {
        RowLayout::new(FeedVariant::Bid).encode(&[1.0, 2.0, 3.0]);
    }

    #[test]
    fn from_bytes_rejects_partial_records() {
        let layout = RowLayout::new(FeedVariant::Bid);
        let err = RowBuffer::from_bytes(layout, vec![0u8; 50]).unwrap_err();
        assert_eq!(err, DecodeError::PartialRecord { len: 50, record_size: 48 });
    }

    #[test]
    fn from_bytes_round_trips_encoded_output() {
        let layout = RowLayout::new(FeedVariant::Bid);
        let buf = layout.encode(&[2000.0, 1.0, 2.0, 0.5, 1.5, 7.0]);
        let copy = RowBuffer::from_bytes(layout, buf.as_bytes().to_vec()).unwrap();
        assert_eq!(copy, buf);
    }
}
