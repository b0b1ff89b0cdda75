//! Per-bucket production and the carry-forward fold across buckets.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bucket::Bucket;
use crate::segment::{build_runs, judge_runs, JudgedRun, RunVerdict};
use crate::{BucketResult, Point};

/// Counts of how segments and runs were judged.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunTally {
    pub segments_valid: usize,
    pub runs_solid: usize,
    pub runs_dead: usize,
    pub runs_jump: usize,
}

impl RunTally {
    fn record(&mut self, judged: &JudgedRun) {
        match judged.verdict {
            RunVerdict::Valid => self.segments_valid += judged.run.segments.len(),
            RunVerdict::Solid => {
                self.segments_valid += judged.run.segments.len();
                self.runs_solid += 1;
            }
            RunVerdict::Dead => self.runs_dead += 1,
            RunVerdict::Jump => self.runs_jump += 1,
        }
    }

    fn absorb(&mut self, other: &RunTally) {
        self.segments_valid += other.segments_valid;
        self.runs_solid += other.runs_solid;
        self.runs_dead += other.runs_dead;
        self.runs_jump += other.runs_jump;
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct BucketSummary {
    pub production: f64,
    pub last_valid: Option<Point>,
    pub tally: RunTally,
}

/// Sum the deltas of every counted run. The last valid point is the end of
/// the latest counted run, or `carry_in` when nothing counted.
pub fn summarize(judged: &[JudgedRun], carry_in: Option<Point>) -> BucketSummary {
    let mut tally = RunTally::default();
    let mut production = 0.0;
    let mut last_valid: Option<Point> = None;

    for run in judged {
        tally.record(run);
        if !run.verdict.counts() {
            continue;
        }
        production += run.run.delta();
        if let Some(end) = run.run.last_point() {
            if last_valid.map_or(true, |p| end.timestamp >= p.timestamp) {
                last_valid = Some(end);
            }
        }
    }

    BucketSummary {
        production,
        last_valid: last_valid.or(carry_in),
        tally,
    }
}

/// Classify, re-judge and sum one bucket with `carry_in` as its logical
/// first point.
pub fn evaluate_bucket(bucket: &Bucket, carry_in: Option<Point>, threshold: f64) -> BucketSummary {
    let mut points = Vec::with_capacity(bucket.points.len() + 1);
    points.extend(carry_in);
    points.extend(bucket.points.iter().copied());
    // Stable: a carried point sharing a timestamp stays ahead of the reading.
    points.sort_by_key(|p| p.timestamp);

    let judged = judge_runs(build_runs(&points, threshold), threshold);
    summarize(&judged, carry_in)
}

/// Evaluate `buckets` in order, threading each bucket's last valid point into
/// the next. `buckets` must already be sorted by key.
pub fn carry_forward(
    buckets: &[Bucket],
    seed: Option<Point>,
    threshold: f64,
) -> (Vec<BucketResult>, RunTally) {
    let init = (Vec::with_capacity(buckets.len()), seed, RunTally::default());
    let (results, _, tally) =
        buckets
            .iter()
            .fold(init, |(mut results, carry, mut tally), bucket| {
                let summary = evaluate_bucket(bucket, carry, threshold);
                debug!(
                    "Bucket {}: {} points, production {:.3}, solid {} dead {} jump {}",
                    bucket.key,
                    bucket.points.len(),
                    summary.production,
                    summary.tally.runs_solid,
                    summary.tally.runs_dead,
                    summary.tally.runs_jump
                );
                tally.absorb(&summary.tally);
                results.push(BucketResult::new(
                    bucket.key.clone(),
                    summary.production,
                    summary.last_valid,
                ));
                (results, summary.last_valid, tally)
            });
    (results, tally)
}
