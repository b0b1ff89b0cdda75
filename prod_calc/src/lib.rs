//! Net production from irregular cumulative meter readings.
//!
//! Readings are grouped into time buckets. Inside each bucket, adjacent
//! readings form segments judged by their slope; runs of implausible segments
//! are judged again end to end, and only plausible growth is summed. The last
//! trustworthy reading of each bucket is carried into the next one so nothing
//! is counted twice or dropped at a boundary.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod bucket;
pub mod buffer;
pub mod config;
pub mod production;
pub mod segment;

pub use bucket::{bucketize, Bucket, RejectedPoint};
pub use buffer::{FinalizeDiagnostics, Finalized, RawBuffer};
pub use config::{
    format_timestamp, parse_timestamp, ConfigParams, Granularity, ProdConfig, TIMESTAMP_LAYOUT,
};
pub use production::{carry_forward, evaluate_bucket, BucketSummary, RunTally};
pub use segment::{build_runs, judge_runs, JudgedRun, Run, RunVerdict, Segment, SegmentClass};

#[derive(Error, Debug)]
pub enum ProdError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("unparseable timestamp {0}")]
    Parse(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("partial state (de)serialization failed: {0}")]
    Serialization(String),
}

/// One cumulative reading.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Point {
    pub timestamp: NaiveDateTime,
    pub value: f64,
}

impl Point {
    pub fn new(timestamp: NaiveDateTime, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// Production of one bucket and the last valid reading known at its end.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BucketResult {
    #[serde(rename = "timeGroup")]
    pub bucket_key: String,
    pub production: f64,
    #[serde(rename = "lastValidTime")]
    pub last_valid_timestamp: Option<String>,
    #[serde(rename = "lastValidValue")]
    pub last_valid_value: Option<f64>,
}

impl BucketResult {
    pub fn new(bucket_key: String, production: f64, last_valid: Option<Point>) -> Self {
        Self {
            bucket_key,
            production,
            last_valid_timestamp: last_valid.map(|p| format_timestamp(&p.timestamp)),
            last_valid_value: last_valid.map(|p| p.value),
        }
    }
}

/// Single-partition shortcut: add every reading to one buffer and finalize it.
pub fn compute_production<'a, I>(readings: I, config: ProdConfig) -> Result<Finalized, ProdError>
where
    I: IntoIterator<Item = (&'a str, f64)>,
{
    let mut buffer = RawBuffer::with_config(config);
    for (timestamp, value) in readings {
        buffer.add_reading(timestamp, value)?;
    }
    buffer.finalize()
}
