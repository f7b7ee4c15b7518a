//! Per-worker spam heuristic over a parser's held classifications.
//!
//! A worker is flagged when they hold more than 15% of the classifications
//! and their mean raw tap count exceeds 3. Flags are reported, never enforced.

use std::collections::BTreeMap;

use crate::constants::parser::{SPAM_CLASSIFICATION_SHARE, SPAM_MEAN_TAPS};
use crate::types::WorkerId;

/// Tap counts of one held classification.
#[derive(Clone, Copy, Debug)]
pub struct TapCounts {
    pub worker_id: WorkerId,
    /// Taps before duplicate filtering.
    pub raw: usize,
    /// Taps kept after duplicate filtering.
    pub filtered: usize,
}

/// Heuristic summary for one worker.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkerActivity {
    pub worker_id: WorkerId,
    pub classifications: usize,
    pub mean_raw_taps: f64,
    pub mean_filtered_taps: f64,
    pub median_raw_taps: f64,
    /// More than the allowed share of held classifications.
    pub dominant: bool,
    /// Mean raw tap count above the allowed mean.
    pub heavy_tapper: bool,
}

impl WorkerActivity {
    /// Both conditions hold.
    pub fn is_suspect(&self) -> bool {
        self.dominant && self.heavy_tapper
    }
}

/// Worker summaries ordered by worker id.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SpamReport {
    /// Held classifications the report was built from.
    pub total_classifications: usize,
    pub workers: Vec<WorkerActivity>,
}

impl SpamReport {
    /// Build the report from per-classification tap counts.
    pub fn from_counts<I>(counts: I) -> Self
    where
        I: IntoIterator<Item = TapCounts>,
    {
        let mut by_worker: BTreeMap<WorkerId, (Vec<usize>, usize)> = BTreeMap::new();
        let mut total = 0usize;
        for count in counts {
            total += 1;
            let entry = by_worker.entry(count.worker_id).or_default();
            entry.0.push(count.raw);
            entry.1 += count.filtered;
        }
        let share_limit = SPAM_CLASSIFICATION_SHARE * total as f64;
        let workers = by_worker
            .into_iter()
            .map(|(worker_id, (mut raw, filtered_sum))| {
                let classifications = raw.len();
                let mean_raw_taps = raw.iter().sum::<usize>() as f64 / classifications as f64;
                let mean_filtered_taps = filtered_sum as f64 / classifications as f64;
                raw.sort_unstable();
                WorkerActivity {
                    worker_id,
                    classifications,
                    mean_raw_taps,
                    mean_filtered_taps,
                    median_raw_taps: median(&raw),
                    dominant: classifications as f64 > share_limit,
                    heavy_tapper: mean_raw_taps > SPAM_MEAN_TAPS,
                }
            })
            .collect();
        Self {
            total_classifications: total,
            workers,
        }
    }

    /// Workers meeting both conditions.
    pub fn suspects(&self) -> impl Iterator<Item = &WorkerActivity> {
        self.workers.iter().filter(|worker| worker.is_suspect())
    }
}

fn median(sorted: &[usize]) -> f64 {
    match sorted.len() {
        0 => 0.0,
        len if len % 2 == 1 => sorted[len / 2] as f64,
        len => (sorted[len / 2 - 1] + sorted[len / 2]) as f64 / 2.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(worker_id: WorkerId, raw: usize, filtered: usize) -> TapCounts {
        TapCounts {
            worker_id,
            raw,
            filtered,
        }
    }

    #[test]
    fn dominant_heavy_tapper_is_flagged() {
        let mut held = vec![counts(7, 12, 4), counts(7, 8, 3), counts(7, 1, 1)];
        held.extend((0..7).map(|worker| counts(100 + worker, 2, 2)));
        let report = SpamReport::from_counts(held);

        assert_eq!(report.total_classifications, 10);
        let suspects: Vec<WorkerId> = report.suspects().map(|w| w.worker_id).collect();
        assert_eq!(suspects, vec![7]);

        let worker = report.workers.iter().find(|w| w.worker_id == 7).unwrap();
        assert_eq!(worker.classifications, 3);
        assert_eq!(worker.mean_raw_taps, 7.0);
        assert!((worker.mean_filtered_taps - 8.0 / 3.0).abs() < 1e-12);
        assert_eq!(worker.median_raw_taps, 8.0);
    }

    #[test]
    fn share_alone_does_not_flag() {
        let report = SpamReport::from_counts(vec![counts(1, 2, 2), counts(1, 3, 3), counts(2, 1, 1)]);
        assert_eq!(report.suspects().count(), 0);
        let worker = &report.workers[0];
        assert!(worker.dominant);
        assert!(!worker.heavy_tapper);
        assert_eq!(worker.median_raw_taps, 2.5);
    }

    #[test]
    fn empty_input_yields_empty_report() {
        assert_eq!(SpamReport::from_counts(Vec::new()), SpamReport::default());
    }
}
