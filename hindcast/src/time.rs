//! Time coordinates. Instants are stored as seconds since the Unix epoch, UTC.
//!
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

const MINUTE: i64 = 60;
const HOUR: i64 = 60 * MINUTE;
const DAY: i64 = 24 * HOUR;

/// Step between the first two instants, if there are at least two.
///
pub fn infer_step(times: &[i64]) -> Option<i64> {
    match times {
        [first, second, ..] if second > first => Some(second - first),
        _ => None,
    }
}

/// A fixed frequency such as `1D`, `6H` or `30min`.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Frequency {
    seconds: i64,
}

impl Frequency {
    pub const DAILY: Frequency = Frequency { seconds: DAY };

    pub fn from_seconds(seconds: i64) -> Result<Self> {
        if seconds <= 0 {
            return Err(Error::configuration(format!(
                "frequency must be positive, got {seconds} seconds"
            )));
        }

        Ok(Self { seconds })
    }

    pub fn seconds(&self) -> i64 {
        self.seconds
    }

    /// The instant `steps` periods after `start`
    pub fn advance(&self, start: i64, steps: usize) -> i64 {
        start + steps as i64 * self.seconds
    }

    /// Instants from `start` to `end` inclusive, one per period. An `end` that falls between two
    /// periods is left out.
    pub fn instants(&self, start: i64, end: i64) -> Result<Vec<i64>> {
        if end < start {
            return Err(Error::configuration(format!(
                "time span ends ({}) before it starts ({})",
                format_instant(end),
                format_instant(start)
            )));
        }

        let steps = ((end - start) / self.seconds) as usize + 1;

        Ok((0..steps).map(|step| self.advance(start, step)).collect())
    }
}

impl FromStr for Frequency {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
        let (count, unit) = s.split_at(split);
        let count = match count {
            "" => 1,
            count => count
                .parse::<i64>()
                .map_err(|_| Error::configuration(format!("bad frequency {s}")))?,
        };
        let unit = match unit {
            "W" => 7 * DAY,
            "D" | "d" => DAY,
            "H" | "h" => HOUR,
            "T" | "min" => MINUTE,
            "S" | "s" => 1,
            _ => {
                return Err(Error::configuration(format!(
                    "bad frequency {s}, expected e.g. 1D, 6H, 30min"
                )))
            }
        };

        Self::from_seconds(count * unit)
    }
}

impl TryFrom<String> for Frequency {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Frequency> for String {
    fn from(freq: Frequency) -> Self {
        freq.to_string()
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let seconds = self.seconds;
        if seconds % DAY == 0 {
            write!(f, "{}D", seconds / DAY)
        } else if seconds % HOUR == 0 {
            write!(f, "{}H", seconds / HOUR)
        } else if seconds % MINUTE == 0 {
            write!(f, "{}min", seconds / MINUTE)
        } else {
            write!(f, "{seconds}S")
        }
    }
}

/// An instant given in configuration, parsed once at load time.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Timestamp(pub i64);

impl FromStr for Timestamp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_instant(s).map(Timestamp)
    }
}

impl TryFrom<String> for Timestamp {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Timestamp> for String {
    fn from(timestamp: Timestamp) -> Self {
        format_instant(timestamp.0)
    }
}

/// Parse `2020-01-01`, `2020-01-01T06:00:00` (UTC assumed) or an RFC 3339 timestamp.
///
pub fn parse_instant(s: &str) -> Result<i64> {
    let s = s.trim();
    if let Ok(datetime) = DateTime::parse_from_rfc3339(s) {
        return Ok(datetime.timestamp());
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M"] {
        if let Ok(datetime) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(datetime.and_utc().timestamp());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        if let Some(datetime) = date.and_hms_opt(0, 0, 0) {
            return Ok(datetime.and_utc().timestamp());
        }
    }

    Err(Error::configuration(format!("cannot parse {s} as a timestamp")))
}

/// Format an instant for logs and documents
pub fn format_instant(instant: i64) -> String {
    match DateTime::from_timestamp(instant, 0) {
        Some(datetime) => datetime.format("%Y-%m-%dT%H:%M:%S").to_string(),
        None => format!("{instant}s"),
    }
}
