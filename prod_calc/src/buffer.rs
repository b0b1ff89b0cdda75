//! Combinable aggregation state.
//!
//! A `RawBuffer` is owned by exactly one worker while readings are added to
//! it. Buffers from different workers are combined with `merge` and the fully
//! combined buffer is consumed once by `finalize`. Finalizing a buffer that has
//! not yet absorbed every partition still produces results, but the carried
//! points will not line up with the complete series.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bucket::{bucketize, RejectedPoint};
use crate::config::{format_timestamp, parse_timestamp, ConfigParams, ProdConfig};
use crate::production::{carry_forward, RunTally};
use crate::{BucketResult, ProdError};

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct RawBuffer {
    points: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    config: Option<ProdConfig>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct FinalizeDiagnostics {
    pub points_total: usize,
    pub points_rejected: usize,
    pub buckets: usize,
    #[serde(flatten)]
    pub runs: RunTally,
    pub rejected: Vec<RejectedPoint>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Finalized {
    pub buckets: Vec<BucketResult>,
    pub diagnostics: FinalizeDiagnostics,
}

impl RawBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: ProdConfig) -> Self {
        Self {
            points: BTreeMap::new(),
            config: Some(config),
        }
    }

    /// Record one raw reading as the host hands it over. A reading at an
    /// already-seen timestamp replaces the earlier one.
    pub fn add(&mut self, timestamp: Option<&str>, value: Option<&str>) -> Result<(), ProdError> {
        let (timestamp, value) = match (timestamp, value) {
            (Some(t), Some(v)) if !t.trim().is_empty() && !v.trim().is_empty() => (t, v),
            _ => {
                return Err(ProdError::InvalidInput(format!(
                    "timestamp or value is absent: timestamp = {:?}, value = {:?}",
                    timestamp, value
                )))
            }
        };
        let parsed: f64 = value.trim().parse().map_err(|_| {
            ProdError::InvalidInput(format!("value '{}' at {} is not a number", value, timestamp))
        })?;
        self.add_reading(timestamp, parsed)
    }

    pub fn add_reading(&mut self, timestamp: &str, value: f64) -> Result<(), ProdError> {
        if !value.is_finite() {
            return Err(ProdError::InvalidInput(format!(
                "value at {} must be finite, got {}",
                timestamp, value
            )));
        }
        // Key by the canonical rendering so spellings of one instant collide.
        // Unparseable keys are kept raw and rejected at finalize.
        let key = match parse_timestamp(timestamp) {
            Ok(ts) => format_timestamp(&ts),
            Err(_) => timestamp.trim().to_string(),
        };
        self.points.insert(key, value);
        Ok(())
    }

    /// Validate and attach configuration. `seed` is the last valid point of
    /// a previously computed window.
    pub fn set_config(
        &mut self,
        slope: Option<f64>,
        date_format: Option<&str>,
        seed: Option<(&str, f64)>,
    ) -> Result<(), ProdError> {
        let params = ConfigParams {
            slope,
            date_format: date_format.map(str::to_string),
            last_valid_time: seed.map(|(ts, _)| ts.to_string()),
            last_valid_value: seed.map(|(_, v)| v),
        };
        self.config = Some(ProdConfig::try_from(params)?);
        Ok(())
    }

    pub fn config(&self) -> Option<&ProdConfig> {
        self.config.as_ref()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Absorb `other`. Its readings win on timestamp collisions. Configuration
    /// stays as is when present, otherwise it is taken from `other`.
    pub fn merge(&mut self, other: RawBuffer) {
        self.points.extend(other.points);
        if self.config.is_none() {
            self.config = other.config;
        }
    }

    pub fn to_partial_json(&self) -> Result<String, ProdError> {
        serde_json::to_string(self).map_err(|e| ProdError::Serialization(e.to_string()))
    }

    pub fn from_partial_json(text: &str) -> Result<Self, ProdError> {
        serde_json::from_str(text).map_err(|e| ProdError::Serialization(e.to_string()))
    }

    /// Bucket, classify and sum every reading, carrying the last valid point
    /// from bucket to bucket in ascending order.
    pub fn finalize(self) -> Result<Finalized, ProdError> {
        let config = self.config.ok_or_else(|| {
            ProdError::Configuration("no slope threshold or date format was supplied".into())
        })?;

        let points_total = self.points.len();
        let (buckets, rejected) = bucketize(
            self.points.iter().map(|(ts, value)| (ts.as_str(), *value)),
            config.granularity(),
        );
        let (results, runs) = carry_forward(&buckets, config.seed(), config.slope_threshold());

        debug!(
            "Finalized {} readings into {} {} buckets ({} rejected)",
            points_total,
            results.len(),
            config.granularity(),
            rejected.len()
        );

        Ok(Finalized {
            diagnostics: FinalizeDiagnostics {
                points_total,
                points_rejected: rejected.len(),
                buckets: results.len(),
                runs,
                rejected,
            },
            buckets: results,
        })
    }
}
