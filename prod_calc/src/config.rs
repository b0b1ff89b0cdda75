use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};

use crate::{Point, ProdError};

/// Layout every reading timestamp is parsed with.
pub const TIMESTAMP_LAYOUT: &str = "%Y-%m-%d %H:%M:%S";

/// Same layout with an optional fractional-seconds suffix.
const TIMESTAMP_LAYOUT_FRACTIONAL: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Parse a reading timestamp. Fractional seconds are accepted and dropped, so
/// readings within the same second share one instant.
pub fn parse_timestamp(raw: &str) -> Result<NaiveDateTime, ProdError> {
    let trimmed = raw.trim();
    let ts = NaiveDateTime::parse_from_str(trimmed, TIMESTAMP_LAYOUT)
        .or_else(|_| NaiveDateTime::parse_from_str(trimmed, TIMESTAMP_LAYOUT_FRACTIONAL))
        .map_err(|e| ProdError::Parse(format!("'{}': {}", raw, e)))?;
    Ok(ts.with_nanosecond(0).unwrap_or(ts))
}

pub fn format_timestamp(ts: &NaiveDateTime) -> String {
    ts.format(TIMESTAMP_LAYOUT).to_string()
}

/// Truncation applied to a reading's timestamp to find its bucket.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Second,
    Minute,
    Hour,
    Day,
    Month,
    Year,
}

impl Granularity {
    pub fn name(&self) -> &'static str {
        match self {
            Granularity::Second => "second",
            Granularity::Minute => "minute",
            Granularity::Hour => "hour",
            Granularity::Day => "day",
            Granularity::Month => "month",
            Granularity::Year => "year",
        }
    }

    /// Date pattern in the host engine's notation.
    pub fn pattern(&self) -> &'static str {
        match self {
            Granularity::Second => "yyyy-MM-dd HH:mm:ss",
            Granularity::Minute => "yyyy-MM-dd HH:mm",
            Granularity::Hour => "yyyy-MM-dd HH",
            Granularity::Day => "yyyy-MM-dd",
            Granularity::Month => "yyyy-MM",
            Granularity::Year => "yyyy",
        }
    }

    fn chrono_format(&self) -> &'static str {
        match self {
            Granularity::Second => "%Y-%m-%d %H:%M:%S",
            Granularity::Minute => "%Y-%m-%d %H:%M",
            Granularity::Hour => "%Y-%m-%d %H",
            Granularity::Day => "%Y-%m-%d",
            Granularity::Month => "%Y-%m",
            Granularity::Year => "%Y",
        }
    }

    /// Bucket key for `ts`. Keys of one granularity sort lexicographically
    /// in chronological order.
    pub fn bucket_key(&self, ts: &NaiveDateTime) -> String {
        ts.format(self.chrono_format()).to_string()
    }

    pub fn all() -> [Granularity; 6] {
        [
            Granularity::Second,
            Granularity::Minute,
            Granularity::Hour,
            Granularity::Day,
            Granularity::Month,
            Granularity::Year,
        ]
    }
}

impl FromStr for Granularity {
    type Err = ProdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim();
        Granularity::all()
            .into_iter()
            .find(|g| {
                g.name().eq_ignore_ascii_case(normalized) || g.pattern() == normalized
            })
            .ok_or_else(|| {
                ProdError::Configuration(format!("unrecognized date format '{}'", s))
            })
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Loosely typed parameters as a host hands them over. Every field is
/// optional here; `ProdConfig::try_from` decides what is acceptable.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ConfigParams {
    pub slope: Option<f64>,
    pub date_format: Option<String>,
    pub last_valid_time: Option<String>,
    pub last_valid_value: Option<f64>,
}

impl ConfigParams {
    /// Fill unset fields from `fallback`.
    pub fn or(self, fallback: ConfigParams) -> ConfigParams {
        ConfigParams {
            slope: self.slope.or(fallback.slope),
            date_format: self.date_format.or(fallback.date_format),
            last_valid_time: self.last_valid_time.or(fallback.last_valid_time),
            last_valid_value: self.last_valid_value.or(fallback.last_valid_value),
        }
    }
}

/// Validated aggregation configuration.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(try_from = "ConfigParams", into = "ConfigParams")]
pub struct ProdConfig {
    slope_threshold: f64,
    granularity: Granularity,
    seed: Option<Point>,
}

impl ProdConfig {
    pub fn new(slope_threshold: f64, granularity: Granularity) -> Result<Self, ProdError> {
        if !slope_threshold.is_finite() {
            return Err(ProdError::Configuration(format!(
                "slope threshold must be numeric, got {}",
                slope_threshold
            )));
        }
        if slope_threshold <= 0.0 {
            return Err(ProdError::Configuration(format!(
                "slope threshold must be > 0, got {}",
                slope_threshold
            )));
        }
        Ok(Self {
            slope_threshold,
            granularity,
            seed: None,
        })
    }

    /// Attach the carried-forward point of a previously computed window.
    pub fn with_seed(mut self, timestamp: &str, value: f64) -> Result<Self, ProdError> {
        let ts = parse_timestamp(timestamp)
            .map_err(|e| ProdError::Configuration(format!("seed timestamp {}", e)))?;
        if !value.is_finite() {
            return Err(ProdError::Configuration(format!(
                "seed value must be finite, got {}",
                value
            )));
        }
        self.seed = Some(Point::new(ts, value));
        Ok(self)
    }

    pub fn slope_threshold(&self) -> f64 {
        self.slope_threshold
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    pub fn seed(&self) -> Option<Point> {
        self.seed
    }
}

impl TryFrom<ConfigParams> for ProdConfig {
    type Error = ProdError;

    fn try_from(params: ConfigParams) -> Result<Self, Self::Error> {
        let slope = params
            .slope
            .ok_or_else(|| ProdError::Configuration("slope threshold is missing".into()))?;
        let granularity: Granularity = params
            .date_format
            .as_deref()
            .ok_or_else(|| ProdError::Configuration("date format is missing".into()))?
            .parse()?;
        let config = ProdConfig::new(slope, granularity)?;
        // A seed needs both halves; one alone is ignored.
        match (params.last_valid_time.as_deref(), params.last_valid_value) {
            (Some(ts), Some(value)) => config.with_seed(ts, value),
            _ => Ok(config),
        }
    }
}

impl From<ProdConfig> for ConfigParams {
    fn from(config: ProdConfig) -> Self {
        ConfigParams {
            slope: Some(config.slope_threshold),
            date_format: Some(config.granularity.pattern().to_string()),
            last_valid_time: config.seed.map(|p| format_timestamp(&p.timestamp)),
            last_valid_value: config.seed.map(|p| p.value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn granularity_accepts_names_and_patterns() {
        assert_eq!("day".parse::<Granularity>().unwrap(), Granularity::Day);
        assert_eq!("Month".parse::<Granularity>().unwrap(), Granularity::Month);
        assert_eq!("yyyy".parse::<Granularity>().unwrap(), Granularity::Year);
        assert_eq!(
            "yyyy-MM-dd HH:mm:ss".parse::<Granularity>().unwrap(),
            Granularity::Second
        );
        assert!(matches!(
            "fortnight".parse::<Granularity>(),
            Err(ProdError::Configuration(_))
        ));
    }

    #[test]
    fn fractional_seconds_are_truncated() {
        let whole = parse_timestamp("2021-01-01 00:00:00").unwrap();
        assert_eq!(parse_timestamp("2021-01-01 00:00:00.0").unwrap(), whole);
        assert_eq!(parse_timestamp("2021-01-01 00:00:00.5").unwrap(), whole);
        assert_eq!(
            format_timestamp(&parse_timestamp(" 2021-01-01 00:00:00.999 ").unwrap()),
            "2021-01-01 00:00:00"
        );
        assert!(matches!(
            parse_timestamp("2021-01-01 00:00:00.x"),
            Err(ProdError::Parse(_))
        ));
    }

    #[test]
    fn bucket_keys_truncate() {
        let ts = parse_timestamp("2021-03-04 05:06:07").unwrap();
        assert_eq!(Granularity::Year.bucket_key(&ts), "2021");
        assert_eq!(Granularity::Month.bucket_key(&ts), "2021-03");
        assert_eq!(Granularity::Day.bucket_key(&ts), "2021-03-04");
        assert_eq!(Granularity::Hour.bucket_key(&ts), "2021-03-04 05");
        assert_eq!(Granularity::Minute.bucket_key(&ts), "2021-03-04 05:06");
        assert_eq!(Granularity::Second.bucket_key(&ts), "2021-03-04 05:06:07");
    }

    #[test]
    fn rejects_bad_thresholds() {
        for bad in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            assert!(matches!(
                ProdConfig::new(bad, Granularity::Day),
                Err(ProdError::Configuration(_))
            ));
        }
    }

    #[test]
    fn params_require_slope_and_format() {
        let missing_slope = ConfigParams {
            date_format: Some("yyyy-MM-dd".into()),
            ..ConfigParams::default()
        };
        assert!(ProdConfig::try_from(missing_slope).is_err());

        let missing_format = ConfigParams {
            slope: Some(10.0),
            ..ConfigParams::default()
        };
        assert!(ProdConfig::try_from(missing_format).is_err());
    }

    #[test]
    fn params_seed_needs_both_halves() {
        let half = ConfigParams {
            slope: Some(10.0),
            date_format: Some("day".into()),
            last_valid_time: Some("2021-01-01 00:00:00".into()),
            last_valid_value: None,
        };
        assert_eq!(ProdConfig::try_from(half).unwrap().seed(), None);

        let bad_seed = ConfigParams {
            slope: Some(10.0),
            date_format: Some("day".into()),
            last_valid_time: Some("yesterday".into()),
            last_valid_value: Some(3.0),
        };
        assert!(matches!(
            ProdConfig::try_from(bad_seed),
            Err(ProdError::Configuration(_))
        ));
    }

    #[test]
    fn config_json_uses_host_field_names() {
        let json = r#"{"slope": 12.5, "dateFormat": "yyyy-MM", "lastValidTime": "2020-12-31 23:00:00", "lastValidValue": 40.0}"#;
        let config: ProdConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.granularity(), Granularity::Month);
        assert_eq!(config.slope_threshold(), 12.5);
        let seed = config.seed().unwrap();
        assert_eq!(format_timestamp(&seed.timestamp), "2020-12-31 23:00:00");

        let back = serde_json::to_string(&config).unwrap();
        let again: ProdConfig = serde_json::from_str(&back).unwrap();
        assert_eq!(again, config);
    }

    #[test]
    fn params_or_prefers_self() {
        let flags = ConfigParams {
            slope: Some(5.0),
            ..ConfigParams::default()
        };
        let file = ConfigParams {
            slope: Some(9.0),
            date_format: Some("year".into()),
            ..ConfigParams::default()
        };
        let merged = flags.or(file);
        assert_eq!(merged.slope, Some(5.0));
        assert_eq!(merged.date_format.as_deref(), Some("year"));
    }
}
