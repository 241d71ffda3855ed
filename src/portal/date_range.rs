use std::sync::LazyLock;

use chrono::{Datelike, NaiveDate};
use regex::Regex;
use thiserror::Error;

/// Textual format the portal expects for both range bounds, e.g. `2017-01-01`.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

static DATE_SHAPE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").expect("static date regex"));

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DateRangeError {
    #[error("start date {0:?} is not a YYYY-MM-DD calendar date")]
    InvalidStart(String),
    #[error("end date {0:?} is not a YYYY-MM-DD calendar date")]
    InvalidEnd(String),
    #[error("start date {start} and end date {end} are not in the same year")]
    DifferentYears { start: String, end: String },
    #[error("start date {start} is after end date {end}")]
    Reversed { start: String, end: String },
}

/// Parses `value` as a strict `YYYY-MM-DD` calendar date.
///
/// chrono alone accepts unpadded fields (`2017-1-1`), so the fixed-width shape is
/// checked first.
pub fn parse_date(value: &str) -> Option<NaiveDate> {
    if !DATE_SHAPE_RE.is_match(value) {
        return None;
    }
    NaiveDate::parse_from_str(value, DATE_FORMAT).ok()
}

pub fn is_valid_date_format(value: &str) -> bool {
    parse_date(value).is_some()
}

/// Compares the first four characters (the year) of both strings.
pub fn same_year(start: &str, end: &str) -> bool {
    start.chars().take(4).eq(end.chars().take(4))
}

/// Start and end bounds of an invoice query, kept exactly as the caller supplied
/// them. Nothing is checked until [`DateRange::validate`] runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateRange {
    start: String,
    end: String,
}

impl DateRange {
    pub fn new(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }

    pub fn start(&self) -> &str {
        &self.start
    }

    pub fn end(&self) -> &str {
        &self.end
    }

    /// Start must parse, end must parse, and both must share a year.
    pub fn validate(&self) -> Result<(), DateRangeError> {
        if !is_valid_date_format(&self.start) {
            return Err(DateRangeError::InvalidStart(self.start.clone()));
        }
        if !is_valid_date_format(&self.end) {
            return Err(DateRangeError::InvalidEnd(self.end.clone()));
        }
        if !same_year(&self.start, &self.end) {
            return Err(DateRangeError::DifferentYears {
                start: self.start.clone(),
                end: self.end.clone(),
            });
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Breaks a range into one sub-range per calendar year it touches, so each
    /// piece satisfies the portal's same-year restriction.
    ///
    /// Both bounds must be well-formed and in order.
    pub fn split_by_year(&self) -> Result<Vec<DateRange>, DateRangeError> {
        let start = parse_date(&self.start)
            .ok_or_else(|| DateRangeError::InvalidStart(self.start.clone()))?;
        let end =
            parse_date(&self.end).ok_or_else(|| DateRangeError::InvalidEnd(self.end.clone()))?;
        if start > end {
            return Err(DateRangeError::Reversed {
                start: self.start.clone(),
                end: self.end.clone(),
            });
        }

        let mut ranges = Vec::new();
        for year in start.year()..=end.year() {
            let from = if year == start.year() {
                start
            } else {
                NaiveDate::from_ymd_opt(year, 1, 1)
                    .ok_or_else(|| DateRangeError::InvalidStart(format!("{year}-01-01")))?
            };
            let to = if year == end.year() {
                end
            } else {
                NaiveDate::from_ymd_opt(year, 12, 31)
                    .ok_or_else(|| DateRangeError::InvalidEnd(format!("{year}-12-31")))?
            };
            ranges.push(DateRange::new(
                from.format(DATE_FORMAT).to_string(),
                to.format(DATE_FORMAT).to_string(),
            ));
        }
        Ok(ranges)
    }
}
