//! Chunk planner: splits a requested time range into upstream-sized requests.
//!
//! The broker paginates candle requests with a hard per-request row ceiling
//! (5000 by default). A retrieval covering more rows than that is split into
//! consecutive chunks, each within the ceiling, which are then fetched
//! concurrently by the orchestrator.

use crate::domain::{Granularity, Symbol, TimeRange};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upstream pagination limit: rows per candle request.
pub const DEFAULT_PER_REQUEST_LIMIT: u32 = 5000;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("invalid range: {0}")]
    InvalidRange(String),
}

/// One upstream candle request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRequest {
    /// Position of this chunk within its plan (chronological).
    pub index: usize,
    pub symbol: Symbol,
    pub granularity: Granularity,
    pub from: DateTime<Utc>,
    pub until: DateTime<Utc>,
    pub row_count_estimate: u32,
}

impl ChunkRequest {
    pub fn range(&self) -> TimeRange {
        TimeRange::new(self.from, self.until)
    }
}

/// Ordered, gap-free partition of a retrieval into chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPlan {
    chunks: Vec<ChunkRequest>,
    covered: TimeRange,
    per_request_limit: u32,
}

impl ChunkPlan {
    pub fn chunks(&self) -> &[ChunkRequest] {
        &self.chunks
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// The range actually covered. Shorter than the request when a row count bounds it.
    pub fn covered(&self) -> TimeRange {
        self.covered
    }

    pub fn per_request_limit(&self) -> u32 {
        self.per_request_limit
    }

    pub fn total_rows(&self) -> u64 {
        self.chunks.iter().map(|c| c.row_count_estimate as u64).sum()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ChunkRequest> {
        self.chunks.iter()
    }
}

impl IntoIterator for ChunkPlan {
    type Item = ChunkRequest;
    type IntoIter = std::vec::IntoIter<ChunkRequest>;

    fn into_iter(self) -> Self::IntoIter {
        self.chunks.into_iter()
    }
}

/// Build the chunk plan for a retrieval.
///
/// The number of rows is implied by the range and granularity, capped by
/// `desired_count` when given. When the cap is below what the range holds,
/// the plan covers only the first `desired_count` buckets from `range.from`.
///
/// A zero-length range, or a desired count of zero, produces an empty plan.
/// A range shorter than one bucket produces exactly one chunk of one row.
pub fn plan(
    symbol: &str,
    granularity: Granularity,
    range: TimeRange,
    desired_count: Option<u32>,
    per_request_limit: u32,
) -> Result<ChunkPlan, PlanError> {
    if per_request_limit == 0 {
        return Err(PlanError::InvalidRange(
            "per-request row limit must be positive".into(),
        ));
    }
    if !range.is_ordered() {
        return Err(PlanError::InvalidRange(format!(
            "from ({}) is after until ({})",
            range.from, range.until
        )));
    }

    let empty = |covered| ChunkPlan {
        chunks: Vec::new(),
        covered,
        per_request_limit,
    };

    if range.is_empty() {
        return Ok(empty(range));
    }

    // Sub-millisecond remainders round up so a non-empty range never plans zero rows.
    let span = range.span();
    let mut span_ms = span.num_milliseconds();
    if span > Duration::milliseconds(span_ms) {
        span_ms += 1;
    }

    let bucket_ms = granularity.seconds() * 1000;
    let range_rows = div_ceil(span_ms, bucket_ms) as u64;
    let total_rows = match desired_count {
        Some(count) => range_rows.min(count as u64),
        None => range_rows,
    };
    if total_rows == 0 {
        return Ok(empty(TimeRange::new(range.from, range.from)));
    }

    let effective_until = if total_rows < range_rows {
        range.from + Duration::milliseconds(total_rows as i64 * bucket_ms)
    } else {
        range.until
    };

    let limit = per_request_limit as u64;
    let chunk_count = total_rows.div_ceil(limit);
    let mut chunks = Vec::with_capacity(chunk_count as usize);

    for index in 0..chunk_count {
        let rows_before = index * limit;
        let rows = limit.min(total_rows - rows_before);
        let from = range.from + Duration::milliseconds(rows_before as i64 * bucket_ms);
        let until = (range.from
            + Duration::milliseconds((rows_before + rows) as i64 * bucket_ms))
        .min(effective_until);

        chunks.push(ChunkRequest {
            index: index as usize,
            symbol: symbol.to_string(),
            granularity,
            from,
            until,
            row_count_estimate: rows as u32,
        });
    }

    tracing::debug!(
        symbol,
        granularity = %granularity,
        chunks = chunks.len(),
        total_rows,
        "chunk_plan_built"
    );

    Ok(ChunkPlan {
        chunks,
        covered: TimeRange::new(range.from, effective_until),
        per_request_limit,
    })
}

fn div_ceil(numerator: i64, denominator: i64) -> i64 {
    (numerator + denominator - 1) / denominator
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn minutes(n: i64) -> TimeRange {
        TimeRange::new(t0(), t0() + Duration::minutes(n))
    }

    #[test]
    fn twelve_thousand_rows_split_into_three_chunks() {
        let plan = plan("EUR_USD", Granularity::M1, minutes(12_000), None, 5000).unwrap();
        let sizes: Vec<u32> = plan.iter().map(|c| c.row_count_estimate).collect();
        assert_eq!(sizes, vec![5000, 5000, 2000]);

        assert_eq!(plan.chunks()[0].from, t0());
        assert_eq!(plan.chunks()[0].until, t0() + Duration::minutes(5000));
        assert_eq!(plan.chunks()[1].from, t0() + Duration::minutes(5000));
        assert_eq!(plan.chunks()[2].until, t0() + Duration::minutes(12_000));
        assert_eq!(plan.total_rows(), 12_000);
    }

    #[test]
    fn chunks_are_contiguous_and_indexed() {
        let plan = plan("EUR_USD", Granularity::M5, minutes(5 * 7_777), None, 1000).unwrap();
        for (i, pair) in plan.chunks().windows(2).enumerate() {
            assert_eq!(pair[0].until, pair[1].from);
            assert_eq!(pair[0].index, i);
        }
        assert_eq!(plan.chunks().first().unwrap().from, t0());
        assert_eq!(plan.chunks().last().unwrap().until, minutes(5 * 7_777).until);
    }

    #[test]
    fn desired_count_truncates_the_range() {
        let plan = plan("EUR_USD", Granularity::M1, minutes(10_000), Some(7_500), 5000).unwrap();
        let sizes: Vec<u32> = plan.iter().map(|c| c.row_count_estimate).collect();
        assert_eq!(sizes, vec![5000, 2500]);
        assert_eq!(plan.covered().until, t0() + Duration::minutes(7_500));
    }

    #[test]
    fn desired_count_above_range_is_ignored() {
        let plan = plan("EUR_USD", Granularity::H1, minutes(120), Some(1_000), 5000).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.chunks()[0].row_count_estimate, 2);
    }

    #[test]
    fn zero_length_range_yields_empty_plan() {
        let plan = plan("EUR_USD", Granularity::M1, minutes(0), None, 5000).unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.total_rows(), 0);
    }

    #[test]
    fn zero_desired_count_yields_empty_plan() {
        let plan = plan("EUR_USD", Granularity::M1, minutes(60), Some(0), 5000).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn sub_bucket_range_yields_one_minimal_chunk() {
        let range = TimeRange::new(t0(), t0() + Duration::seconds(10));
        let plan = plan("EUR_USD", Granularity::H1, range, None, 5000).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.chunks()[0].row_count_estimate, 1);
        assert_eq!(plan.chunks()[0].until, range.until);
    }

    #[test]
    fn sub_millisecond_range_yields_one_chunk() {
        let range = TimeRange::new(t0(), t0() + Duration::microseconds(500));
        let plan = plan("EUR_USD", Granularity::M1, range, None, 5000).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.total_rows(), 1);
        assert_eq!(plan.chunks()[0].from, range.from);
        assert_eq!(plan.chunks()[0].until, range.until);
    }

    #[test]
    fn partial_trailing_bucket_is_covered() {
        let range = TimeRange::new(t0(), t0() + Duration::seconds(90));
        let plan = plan("EUR_USD", Granularity::M1, range, None, 1).unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.chunks()[1].from, t0() + Duration::minutes(1));
        assert_eq!(plan.chunks()[1].until, range.until);
    }

    #[test]
    fn reversed_range_is_rejected() {
        let range = TimeRange::new(t0() + Duration::hours(1), t0());
        let err = plan("EUR_USD", Granularity::M1, range, None, 5000).unwrap_err();
        assert!(matches!(err, PlanError::InvalidRange(_)));
    }

    #[test]
    fn zero_limit_is_rejected() {
        let err = plan("EUR_USD", Granularity::M1, minutes(10), None, 0).unwrap_err();
        assert!(matches!(err, PlanError::InvalidRange(_)));
    }
}
