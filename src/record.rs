//! Telemetry record parsing.
//!
//! A device record is a CSV line with a variable metadata prefix followed by
//! channel readings:
//!
//! ```text
//! <elapsed ms>,<hh:mm:ss>,<label>,<ch0>,<ch1>,...
//! ```
//!
//! The parser does not know how long the prefix is. It keeps every field
//! that looks like an unsigned decimal number, in order, and drops the rest.
//! Numeric-looking metadata (the elapsed counter, a label like `42`) is kept
//! as a value too. A digit run too long for `f64` overflows to infinity and
//! is dropped, since JSON has no way to carry it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

/// Why a record produced no sample.
///
/// Rejections are routine on a noisy link; callers count and drop them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// The record had fewer than two comma-separated fields.
    #[error("record has {0} field(s), need at least 2")]
    TooFewFields(usize),
    /// No field looked numeric.
    #[error("record has no numeric fields")]
    NoNumericFields,
}

/// One parsed telemetry reading.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Reception instant, not a value carried in the record.
    pub captured_at: DateTime<Utc>,
    /// Channel values in record order.
    pub values: Vec<f64>,
}

/// Wire form of a [`Sample`]: `{"t": <epoch seconds>, "raw": [...]}`.
#[derive(Debug, Serialize)]
pub struct WireSample<'a> {
    /// Capture time as fractional Unix seconds.
    pub t: f64,
    /// Channel values.
    pub raw: &'a [f64],
}

impl Sample {
    /// Capture time as fractional seconds since the Unix epoch.
    pub fn epoch_seconds(&self) -> f64 {
        self.captured_at.timestamp_micros() as f64 / 1_000_000.0
    }

    /// Borrowed wire representation for serialization.
    pub fn wire(&self) -> WireSample<'_> {
        WireSample {
            t: self.epoch_seconds(),
            raw: &self.values,
        }
    }
}

/// Parse a record, stamping it with the current time.
pub fn parse(record: &str) -> Result<Sample, Rejection> {
    parse_at(record, Utc::now())
}

/// Parse a record with an explicit capture instant.
pub fn parse_at(record: &str, captured_at: DateTime<Utc>) -> Result<Sample, Rejection> {
    let fields: Vec<&str> = record.trim().split(',').collect();
    if fields.len() < 2 {
        return Err(Rejection::TooFewFields(fields.len()));
    }

    let values: Vec<f64> = fields
        .iter()
        .filter(|field| looks_numeric(field))
        .filter_map(|field| field.parse::<f64>().ok())
        .filter(|value| value.is_finite())
        .collect();

    if values.is_empty() {
        return Err(Rejection::NoNumericFields);
    }

    Ok(Sample {
        captured_at,
        values,
    })
}

/// True for a non-empty run of ASCII digits with at most one decimal point.
///
/// Signs, exponents and surrounding whitespace are not accepted.
fn looks_numeric(field: &str) -> bool {
    let mut digits = 0usize;
    let mut dots = 0usize;
    for c in field.chars() {
        match c {
            '.' => dots += 1,
            c if c.is_ascii_digit() => digits += 1,
            _ => return false,
        }
    }
    digits > 0 && dots <= 1
}
