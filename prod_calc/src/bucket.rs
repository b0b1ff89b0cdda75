use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::{parse_timestamp, Granularity};
use crate::Point;

/// Readings sharing one truncated timestamp.
#[derive(Clone, Debug, PartialEq)]
pub struct Bucket {
    pub key: String,
    pub points: Vec<Point>,
}

/// A reading left out of every bucket because its timestamp did not parse.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RejectedPoint {
    pub timestamp: String,
    pub reason: String,
}

/// Group readings by `granularity`, returning buckets in ascending key order.
/// Unparseable timestamps are excluded and reported back.
pub fn bucketize<'a, I>(readings: I, granularity: Granularity) -> (Vec<Bucket>, Vec<RejectedPoint>)
where
    I: IntoIterator<Item = (&'a str, f64)>,
{
    let mut groups: BTreeMap<String, Vec<Point>> = BTreeMap::new();
    let mut rejected = Vec::new();

    for (raw_ts, value) in readings {
        match parse_timestamp(raw_ts) {
            Ok(ts) => groups
                .entry(granularity.bucket_key(&ts))
                .or_default()
                .push(Point::new(ts, value)),
            Err(err) => {
                warn!("Excluding reading at '{}': {}", raw_ts, err);
                rejected.push(RejectedPoint {
                    timestamp: raw_ts.to_string(),
                    reason: err.to_string(),
                });
            }
        }
    }

    let buckets = groups
        .into_iter()
        .map(|(key, points)| Bucket { key, points })
        .collect();
    (buckets, rejected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buckets_come_out_ascending() {
        let readings = vec![
            ("2021-02-01 00:00:00", 3.0),
            ("2020-12-31 23:59:59", 1.0),
            ("2021-01-15 12:00:00", 2.0),
        ];
        let (buckets, rejected) = bucketize(readings, Granularity::Month);
        assert!(rejected.is_empty());
        let keys: Vec<&str> = buckets.iter().map(|b| b.key.as_str()).collect();
        assert_eq!(keys, vec!["2020-12", "2021-01", "2021-02"]);
    }

    #[test]
    fn same_day_readings_share_a_bucket() {
        let readings = vec![
            ("2021-01-01 00:00:00", 1.0),
            ("2021-01-01 23:00:00", 2.0),
            ("2021-01-02 00:00:00", 3.0),
        ];
        let (buckets, _) = bucketize(readings, Granularity::Day);
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].points.len(), 2);
        assert_eq!(buckets[1].points[0].value, 3.0);
    }

    #[test]
    fn fractional_seconds_land_in_their_bucket() {
        let readings = vec![
            ("2021-01-01 00:00:00.0", 100.0),
            ("2021-01-01 23:59:59.5", 105.0),
        ];
        let (buckets, rejected) = bucketize(readings, Granularity::Day);
        assert!(rejected.is_empty());
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].key, "2021-01-01");
        assert_eq!(
            crate::config::format_timestamp(&buckets[0].points[1].timestamp),
            "2021-01-01 23:59:59"
        );
    }

    #[test]
    fn unparseable_timestamps_are_excluded() {
        let readings = vec![
            ("2021-01-01 00:00:00", 1.0),
            ("01/02/2021 10:00", 2.0),
            ("2021-13-01 00:00:00", 3.0),
        ];
        let (buckets, rejected) = bucketize(readings, Granularity::Day);
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].points.len(), 1);
        let bad: Vec<&str> = rejected.iter().map(|r| r.timestamp.as_str()).collect();
        assert_eq!(bad, vec!["01/02/2021 10:00", "2021-13-01 00:00:00"]);
    }
}
