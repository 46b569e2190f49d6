//! Query horizons supported by the rollup store.

use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::WindowError;

/// A lookback window ending at "now".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Horizon {
    #[serde(rename = "6h")]
    SixHours,
    #[serde(rename = "12h")]
    TwelveHours,
    #[serde(rename = "24h")]
    Day,
    #[serde(rename = "7d")]
    Week,
    #[serde(rename = "15d")]
    FifteenDays,
    #[serde(rename = "30d")]
    Month,
}

impl Horizon {
    pub const ALL: [Horizon; 6] = [
        Horizon::SixHours,
        Horizon::TwelveHours,
        Horizon::Day,
        Horizon::Week,
        Horizon::FifteenDays,
        Horizon::Month,
    ];

    pub fn seconds(self) -> i64 {
        match self {
            Horizon::SixHours => 6 * 3600,
            Horizon::TwelveHours => 12 * 3600,
            Horizon::Day => 24 * 3600,
            Horizon::Week => 7 * 86400,
            Horizon::FifteenDays => 15 * 86400,
            Horizon::Month => 30 * 86400,
        }
    }

    pub fn duration(self) -> ChronoDuration {
        ChronoDuration::seconds(self.seconds())
    }

    pub fn label(self) -> &'static str {
        match self {
            Horizon::SixHours => "6h",
            Horizon::TwelveHours => "12h",
            Horizon::Day => "24h",
            Horizon::Week => "7d",
            Horizon::FifteenDays => "15d",
            Horizon::Month => "30d",
        }
    }

    /// The largest supported horizon; bounds in-memory retention.
    pub fn largest() -> Horizon {
        Horizon::Month
    }
}

impl Default for Horizon {
    fn default() -> Self {
        Horizon::Day
    }
}

impl fmt::Display for Horizon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Horizon {
    type Err = WindowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Horizon::ALL
            .into_iter()
            .find(|h| h.label() == wanted)
            .ok_or_else(|| WindowError::Unknown(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_labels() {
        for h in Horizon::ALL {
            assert_eq!(h.label().parse::<Horizon>().unwrap(), h);
        }
        assert_eq!(" 7D ".parse::<Horizon>().unwrap(), Horizon::Week);
        assert!(matches!("2h".parse::<Horizon>(), Err(WindowError::Unknown(_))));
    }

    #[test]
    fn test_ordering_and_largest() {
        assert!(Horizon::SixHours < Horizon::Month);
        assert_eq!(Horizon::largest().seconds(), 30 * 86400);
        assert_eq!(
            serde_json::to_string(&Horizon::FifteenDays).unwrap(),
            "\"15d\""
        );
    }
}
