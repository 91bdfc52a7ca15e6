//! Granularity: the candle bucket size.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Candle bucket size, named by the broker's granularity codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Granularity {
    S5,
    S10,
    S15,
    S30,
    M1,
    M2,
    M4,
    M5,
    M10,
    M15,
    M30,
    H1,
    H2,
    H3,
    H4,
    H6,
    H8,
    H12,
    D,
    W,
    /// Calendar month. Planned as a 28-day bucket so row estimates never undercount.
    #[serde(rename = "M")]
    Month,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown granularity '{0}'")]
pub struct UnknownGranularity(pub String);

impl Granularity {
    pub const ALL: [Granularity; 21] = [
        Granularity::S5,
        Granularity::S10,
        Granularity::S15,
        Granularity::S30,
        Granularity::M1,
        Granularity::M2,
        Granularity::M4,
        Granularity::M5,
        Granularity::M10,
        Granularity::M15,
        Granularity::M30,
        Granularity::H1,
        Granularity::H2,
        Granularity::H3,
        Granularity::H4,
        Granularity::H6,
        Granularity::H8,
        Granularity::H12,
        Granularity::D,
        Granularity::W,
        Granularity::Month,
    ];

    /// Length of one bucket in seconds.
    pub fn seconds(self) -> i64 {
        match self {
            Granularity::S5 => 5,
            Granularity::S10 => 10,
            Granularity::S15 => 15,
            Granularity::S30 => 30,
            Granularity::M1 => 60,
            Granularity::M2 => 2 * 60,
            Granularity::M4 => 4 * 60,
            Granularity::M5 => 5 * 60,
            Granularity::M10 => 10 * 60,
            Granularity::M15 => 15 * 60,
            Granularity::M30 => 30 * 60,
            Granularity::H1 => 3_600,
            Granularity::H2 => 2 * 3_600,
            Granularity::H3 => 3 * 3_600,
            Granularity::H4 => 4 * 3_600,
            Granularity::H6 => 6 * 3_600,
            Granularity::H8 => 8 * 3_600,
            Granularity::H12 => 12 * 3_600,
            Granularity::D => 86_400,
            Granularity::W => 7 * 86_400,
            Granularity::Month => 28 * 86_400,
        }
    }

    pub fn duration(self) -> Duration {
        Duration::seconds(self.seconds())
    }

    /// Broker code used on the wire (`M1`, `H4`, `D`, `M` for month, ...).
    pub fn code(self) -> &'static str {
        match self {
            Granularity::S5 => "S5",
            Granularity::S10 => "S10",
            Granularity::S15 => "S15",
            Granularity::S30 => "S30",
            Granularity::M1 => "M1",
            Granularity::M2 => "M2",
            Granularity::M4 => "M4",
            Granularity::M5 => "M5",
            Granularity::M10 => "M10",
            Granularity::M15 => "M15",
            Granularity::M30 => "M30",
            Granularity::H1 => "H1",
            Granularity::H2 => "H2",
            Granularity::H3 => "H3",
            Granularity::H4 => "H4",
            Granularity::H6 => "H6",
            Granularity::H8 => "H8",
            Granularity::H12 => "H12",
            Granularity::D => "D",
            Granularity::W => "W",
            Granularity::Month => "M",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Granularity {
    type Err = UnknownGranularity;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Granularity::ALL
            .iter()
            .copied()
            .find(|g| g.code().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownGranularity(s.to_string()))
    }
}
