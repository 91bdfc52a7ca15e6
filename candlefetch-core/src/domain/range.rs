//! TimeRange: a closed interval of UTC instants.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: DateTime<Utc>,
    pub until: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(from: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        Self { from, until }
    }

    /// `from <= until`.
    pub fn is_ordered(&self) -> bool {
        self.from <= self.until
    }

    pub fn is_empty(&self) -> bool {
        self.from == self.until
    }

    pub fn span(&self) -> Duration {
        self.until - self.from
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn span_and_ordering() {
        let from = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let until = Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap();
        let range = TimeRange::new(from, until);
        assert!(range.is_ordered());
        assert!(!range.is_empty());
        assert_eq!(range.span(), Duration::hours(1));
        assert!(!TimeRange::new(until, from).is_ordered());
    }
}
