//! Reconciliation time window.

use chrono::{DateTime, Days, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WindowError {
    #[error("Invalid date format: {0}. Expected YYYY-MM-DD")]
    InvalidDate(String),

    #[error("Window start {start} is not before end {end}")]
    Inverted {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

/// Half-open wall-clock window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, WindowError> {
        if start >= end {
            return Err(WindowError::Inverted { start, end });
        }
        Ok(Self { start, end })
    }

    /// Window covering whole UTC days from `start` through `end_inclusive`.
    pub fn from_dates(start: NaiveDate, end_inclusive: NaiveDate) -> Result<Self, WindowError> {
        let end_exclusive = end_inclusive
            .checked_add_days(Days::new(1))
            .ok_or_else(|| WindowError::InvalidDate(end_inclusive.to_string()))?;
        Self::new(midnight(start), midnight(end_exclusive))
    }

    /// Parse `YYYY-MM-DD` bounds; the end date is inclusive.
    pub fn parse(start: &str, end_inclusive: &str) -> Result<Self, WindowError> {
        Self::from_dates(parse_date(start)?, parse_date(end_inclusive)?)
    }

    pub fn start_ts(&self) -> i64 {
        self.start.timestamp()
    }

    pub fn end_ts(&self) -> i64 {
        self.end.timestamp()
    }

    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.start_ts() && timestamp < self.end_ts()
    }
}

impl std::fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}, {})",
            self.start.format("%Y-%m-%d %H:%M:%S"),
            self.end.format("%Y-%m-%d %H:%M:%S")
        )
    }
}

/// Parse a date string in YYYY-MM-DD format.
pub fn parse_date(date_str: &str) -> Result<NaiveDate, WindowError> {
    NaiveDate::parse_from_str(date_str.trim(), "%Y-%m-%d")
        .map_err(|_| WindowError::InvalidDate(date_str.to_string()))
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN))
}
