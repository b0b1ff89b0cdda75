//! Slope classification of adjacent readings and re-evaluation of invalid runs.
//!
//! A segment joins two chronologically adjacent readings. It is valid when its
//! slope (value per hour) lies strictly between zero and the configured
//! threshold. Consecutive segments with the same classification form a run;
//! an invalid run is then judged as a whole from its first to its last point,
//! which lets a burst of noisy readings with a plausible net effect count as
//! production again.

use serde::{Deserialize, Serialize};

use crate::Point;

const MILLIS_PER_HOUR: f64 = 3_600_000.0;

/// Slope in value per hour from `start` to `end`. `None` when both share a
/// timestamp.
pub fn slope_between(start: &Point, end: &Point) -> Option<f64> {
    let millis = (end.timestamp - start.timestamp).num_milliseconds();
    if millis == 0 {
        return None;
    }
    let hours = millis as f64 / MILLIS_PER_HOUR;
    Some((end.value - start.value) / hours)
}

fn is_plausible(slope: Option<f64>, threshold: f64) -> bool {
    matches!(slope, Some(s) if s > 0.0 && s < threshold)
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum SegmentClass {
    Valid,
    Invalid,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Segment {
    pub start: Point,
    pub end: Point,
}

impl Segment {
    pub fn new(start: Point, end: Point) -> Self {
        Self { start, end }
    }

    pub fn slope(&self) -> Option<f64> {
        slope_between(&self.start, &self.end)
    }

    pub fn delta(&self) -> f64 {
        self.end.value - self.start.value
    }

    pub fn classify(&self, threshold: f64) -> SegmentClass {
        if is_plausible(self.slope(), threshold) {
            SegmentClass::Valid
        } else {
            SegmentClass::Invalid
        }
    }
}

/// Maximal sequence of consecutive segments sharing one classification.
#[derive(Clone, Debug, PartialEq)]
pub struct Run {
    pub class: SegmentClass,
    pub segments: Vec<Segment>,
}

impl Run {
    fn open(class: SegmentClass, first: Segment) -> Self {
        Self {
            class,
            segments: vec![first],
        }
    }

    pub fn first_point(&self) -> Option<Point> {
        self.segments.first().map(|s| s.start)
    }

    pub fn last_point(&self) -> Option<Point> {
        self.segments.last().map(|s| s.end)
    }

    /// End-to-end slope, ignoring the interior segments.
    pub fn slope(&self) -> Option<f64> {
        let (first, last) = (self.first_point()?, self.last_point()?);
        slope_between(&first, &last)
    }

    pub fn delta(&self) -> f64 {
        self.segments.iter().map(Segment::delta).sum()
    }
}

/// Final judgement of a run after re-evaluation.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum RunVerdict {
    /// Every segment was valid on its own.
    Valid,
    /// Invalid segments whose end-to-end slope is plausible.
    Solid,
    /// Invalid segments with zero net change: a frozen or re-zeroed meter.
    Dead,
    /// Anything else: resets and spikes.
    Jump,
}

impl RunVerdict {
    pub fn counts(&self) -> bool {
        matches!(self, RunVerdict::Valid | RunVerdict::Solid)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct JudgedRun {
    pub run: Run,
    pub verdict: RunVerdict,
}

/// Build segments over `points` (already in chronological order) and coalesce
/// them into runs. Fewer than two points yield no runs.
pub fn build_runs(points: &[Point], threshold: f64) -> Vec<Run> {
    let mut runs: Vec<Run> = Vec::new();
    for pair in points.windows(2) {
        let segment = Segment::new(pair[0], pair[1]);
        let class = segment.classify(threshold);
        if let Some(current) = runs.last_mut().filter(|r| r.class == class) {
            current.segments.push(segment);
            continue;
        }
        runs.push(Run::open(class, segment));
    }
    runs
}

/// Re-evaluate every invalid run by its end-to-end slope. Valid runs pass
/// through untouched.
pub fn judge_runs(runs: Vec<Run>, threshold: f64) -> Vec<JudgedRun> {
    runs.into_iter()
        .map(|run| {
            let verdict = match run.class {
                SegmentClass::Valid => RunVerdict::Valid,
                SegmentClass::Invalid => {
                    let slope = run.slope();
                    if is_plausible(slope, threshold) {
                        RunVerdict::Solid
                    } else if slope == Some(0.0) {
                        RunVerdict::Dead
                    } else {
                        RunVerdict::Jump
                    }
                }
            };
            JudgedRun { run, verdict }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_timestamp;

    fn pt(ts: &str, value: f64) -> Point {
        Point::new(parse_timestamp(ts).unwrap(), value)
    }

    #[test]
    fn slope_is_value_per_hour() {
        let a = pt("2021-01-01 00:00:00", 100.0);
        let b = pt("2021-01-01 00:30:00", 103.0);
        assert!((slope_between(&a, &b).unwrap() - 6.0).abs() < 1e-9);
        assert_eq!(slope_between(&a, &a), None);
    }

    #[test]
    fn equal_timestamps_are_invalid() {
        let a = pt("2021-01-01 00:00:00", 100.0);
        let b = pt("2021-01-01 00:00:00", 101.0);
        assert_eq!(Segment::new(a, b).classify(10.0), SegmentClass::Invalid);
    }

    #[test]
    fn threshold_bounds_are_exclusive() {
        let a = pt("2021-01-01 00:00:00", 0.0);
        let at_limit = pt("2021-01-01 01:00:00", 10.0);
        let flat = pt("2021-01-01 01:00:00", 0.0);
        assert_eq!(Segment::new(a, at_limit).classify(10.0), SegmentClass::Invalid);
        assert_eq!(Segment::new(a, flat).classify(10.0), SegmentClass::Invalid);
    }

    #[test]
    fn runs_split_on_class_flips() {
        let points = vec![
            pt("2021-01-01 00:00:00", 0.0),
            pt("2021-01-01 01:00:00", 1.0),
            pt("2021-01-01 02:00:00", 2.0),
            pt("2021-01-01 03:00:00", 500.0),
            pt("2021-01-01 04:00:00", 3.0),
            pt("2021-01-01 05:00:00", 4.0),
        ];
        let runs = build_runs(&points, 10.0);
        let shape: Vec<(SegmentClass, usize)> =
            runs.iter().map(|r| (r.class, r.segments.len())).collect();
        assert_eq!(
            shape,
            vec![
                (SegmentClass::Valid, 2),
                (SegmentClass::Invalid, 2),
                (SegmentClass::Valid, 1),
            ]
        );
        let total: usize = runs.iter().map(|r| r.segments.len()).sum();
        assert_eq!(total, points.len() - 1);
    }

    #[test]
    fn noisy_run_with_plausible_net_is_solid() {
        // 100 -> 400 -> 104 over two hours: each hop is absurd, net slope is 2/h.
        let points = vec![
            pt("2021-01-01 00:00:00", 100.0),
            pt("2021-01-01 01:00:00", 400.0),
            pt("2021-01-01 02:00:00", 104.0),
        ];
        let judged = judge_runs(build_runs(&points, 10.0), 10.0);
        assert_eq!(judged.len(), 1);
        assert_eq!(judged[0].verdict, RunVerdict::Solid);
        assert!((judged[0].run.delta() - 4.0).abs() < 1e-9);
    }

    #[test]
    fn flat_invalid_run_is_dead() {
        let points = vec![
            pt("2021-01-01 00:00:00", 7.0),
            pt("2021-01-01 01:00:00", 0.0),
            pt("2021-01-01 01:10:00", 7.0),
        ];
        let judged = judge_runs(build_runs(&points, 10.0), 10.0);
        assert_eq!(judged.len(), 1);
        assert_eq!(judged[0].verdict, RunVerdict::Dead);
        assert!(!judged[0].verdict.counts());
    }

    #[test]
    fn reset_is_jump() {
        let points = vec![
            pt("2021-01-01 00:00:00", 900.0),
            pt("2021-01-01 01:00:00", 0.0),
        ];
        let judged = judge_runs(build_runs(&points, 10.0), 10.0);
        assert_eq!(judged[0].verdict, RunVerdict::Jump);
    }

    #[test]
    fn duplicate_timestamp_run_is_jump() {
        let points = vec![
            pt("2021-01-01 00:00:00", 1.0),
            pt("2021-01-01 00:00:00", 1.0),
        ];
        let judged = judge_runs(build_runs(&points, 10.0), 10.0);
        assert_eq!(judged[0].verdict, RunVerdict::Jump);
    }

    #[test]
    fn single_point_has_no_runs() {
        assert!(build_runs(&[pt("2021-01-01 00:00:00", 1.0)], 10.0).is_empty());
    }
}
