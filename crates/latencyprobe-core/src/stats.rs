//! Trial statistics and run summaries.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::controller::TrialResult;
use crate::error::MeasurementError;

/// Floor on valid trials for a summary, lowered to the requested trial
/// count for short runs.
pub const MIN_VALID_TRIALS: usize = 3;

/// Reduced view of a measurement run.
#[derive(Debug, Clone, Serialize)]
pub struct LatencySummary {
    pub trials_requested: usize,
    pub trials_completed: usize,
    /// Successful trials surviving outlier rejection.
    pub valid_trials: usize,
    pub rejected_outliers: usize,
    pub median_ms: f64,
    pub p10_ms: f64,
    pub p90_ms: f64,
    pub mean_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    /// True when the run was cut short by an interruption or abort.
    pub interrupted: bool,
    /// Effective sample rate the run used.
    pub sample_rate: u32,
    pub measured_at: DateTime<Utc>,
}

/// Accumulates trial results and reduces them into a summary.
pub struct LatencyStatistics {
    outlier_iqr_multiple: f64,
    results: Vec<TrialResult>,
}

impl LatencyStatistics {
    pub fn new(outlier_iqr_multiple: f64) -> Self {
        Self {
            outlier_iqr_multiple,
            results: Vec::new(),
        }
    }

    pub fn record(&mut self, result: TrialResult) {
        self.results.push(result);
    }

    pub fn completed(&self) -> usize {
        self.results.len()
    }

    pub fn valid_count(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }

    pub fn clear(&mut self) {
        self.results.clear();
    }

    /// Reduce the recorded trials. Values outside the quartile fences
    /// `[Q1 - k*IQR, Q3 + k*IQR]` are rejected as outliers before the
    /// summary statistics are computed; rejection needs at least 3
    /// valid values to be meaningful.
    pub fn summarize(
        &self,
        trials_requested: usize,
        interrupted: bool,
        sample_rate: u32,
    ) -> Result<LatencySummary, MeasurementError> {
        let required = trials_requested.min(MIN_VALID_TRIALS).max(1);

        let mut valid: Vec<f64> = self
            .results
            .iter()
            .filter(|r| r.success)
            .filter_map(|r| r.latency_ms)
            .collect();
        if valid.len() < required {
            return Err(MeasurementError::InsufficientSamples {
                valid: valid.len(),
                required,
            });
        }
        valid.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let (kept, rejected) = if valid.len() >= 3 {
            let q1 = percentile(&valid, 25.0);
            let q3 = percentile(&valid, 75.0);
            let fence = self.outlier_iqr_multiple * (q3 - q1);
            let (low, high) = (q1 - fence, q3 + fence);
            let kept: Vec<f64> = valid
                .iter()
                .copied()
                .filter(|v| (low..=high).contains(v))
                .collect();
            let rejected = valid.len() - kept.len();
            (kept, rejected)
        } else {
            (valid, 0)
        };
        if kept.len() < required {
            return Err(MeasurementError::InsufficientSamples {
                valid: kept.len(),
                required,
            });
        }

        let mean_ms = kept.iter().sum::<f64>() / kept.len() as f64;
        Ok(LatencySummary {
            trials_requested,
            trials_completed: self.results.len(),
            valid_trials: kept.len(),
            rejected_outliers: rejected,
            median_ms: midpoint_median(&kept),
            p10_ms: percentile(&kept, 10.0),
            p90_ms: percentile(&kept, 90.0),
            mean_ms,
            min_ms: kept[0],
            max_ms: kept[kept.len() - 1],
            interrupted,
            sample_rate,
            measured_at: Utc::now(),
        })
    }
}

/// Midpoint median of a sorted, non-empty slice.
fn midpoint_median(sorted: &[f64]) -> f64 {
    debug_assert!(!sorted.is_empty());
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

/// Nearest-rank percentile of a sorted, non-empty slice.
fn percentile(sorted: &[f64], pct: f64) -> f64 {
    debug_assert!(!sorted.is_empty());
    let idx = ((pct / 100.0) * (sorted.len() - 1) as f64).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn success(trial: usize, ms: f64) -> TrialResult {
        TrialResult::success(trial, (ms * 48.0) as u64, ms, 0.95)
    }

    fn failure(trial: usize) -> TrialResult {
        TrialResult::failure(
            trial,
            0.1,
            MeasurementError::TrialTimeout {
                trial,
                timeout_ms: 1000,
            },
        )
    }

    fn stats_with(values: &[f64]) -> LatencyStatistics {
        let mut stats = LatencyStatistics::new(1.5);
        for (i, &ms) in values.iter().enumerate() {
            stats.record(success(i, ms));
        }
        stats
    }

    #[test]
    fn test_outlier_is_rejected_and_median_holds() {
        let stats = stats_with(&[10.0, 11.0, 9.0, 10.0, 500.0]);
        let summary = stats.summarize(5, false, 48000).expect("summary");

        assert_eq!(summary.rejected_outliers, 1);
        assert_eq!(summary.valid_trials, 4);
        assert_relative_eq!(summary.median_ms, 10.0);
        assert_relative_eq!(summary.min_ms, 9.0);
        assert_relative_eq!(summary.max_ms, 11.0);
        assert!(!summary.interrupted);
    }

    #[test]
    fn test_all_failures_yield_insufficient_samples() {
        let mut stats = LatencyStatistics::new(1.5);
        for trial in 0..10 {
            stats.record(failure(trial));
        }
        match stats.summarize(10, false, 48000) {
            Err(MeasurementError::InsufficientSamples { valid, required }) => {
                assert_eq!(valid, 0);
                assert_eq!(required, 3);
            }
            other => panic!("expected InsufficientSamples, got {:?}", other.map(|s| s.median_ms)),
        }
    }

    #[test]
    fn test_short_runs_lower_the_floor() {
        let stats = stats_with(&[12.5]);
        let summary = stats.summarize(1, false, 48000).expect("single trial run");
        assert_eq!(summary.valid_trials, 1);
        assert_relative_eq!(summary.median_ms, 12.5);
        assert_relative_eq!(summary.p10_ms, 12.5);
        assert_relative_eq!(summary.p90_ms, 12.5);
    }

    #[test]
    fn test_rejection_needs_three_values() {
        let stats = stats_with(&[5.0, 400.0]);
        let summary = stats.summarize(2, false, 48000).expect("two valid trials");
        assert_eq!(summary.rejected_outliers, 0);
        assert_relative_eq!(summary.median_ms, 202.5);
    }

    #[test]
    fn test_rejection_can_starve_the_summary() {
        // Both quartiles land on the duplicated middle value, so the
        // fences collapse and reject both extremes, leaving two values
        // for a three-trial floor.
        let stats = stats_with(&[5.0, 10.0, 10.0, 900.0]);
        match stats.summarize(4, false, 48000) {
            Err(MeasurementError::InsufficientSamples { valid, required }) => {
                assert_eq!(valid, 2);
                assert_eq!(required, 3);
            }
            other => panic!("expected InsufficientSamples, got {:?}", other.map(|s| s.median_ms)),
        }
    }

    #[test]
    fn test_tight_cluster_rejects_a_nearby_straggler() {
        // Zero inter-quartile range makes the fences exact; a value
        // only 35ms off the cluster still falls outside them.
        let stats = stats_with(&[10.0, 10.0, 10.0, 10.0, 45.0]);
        let summary = stats.summarize(5, false, 48000).expect("summary");

        assert_eq!(summary.rejected_outliers, 1);
        assert_eq!(summary.valid_trials, 4);
        assert_relative_eq!(summary.median_ms, 10.0);
        assert_relative_eq!(summary.max_ms, 10.0);
    }

    #[test]
    fn test_wide_spread_is_kept_when_consistent() {
        // Fences scale with the spread, so a jittery run without a
        // detached tail keeps every value.
        let stats = stats_with(&[20.0, 40.0, 60.0, 80.0, 100.0]);
        let summary = stats.summarize(5, false, 48000).expect("summary");

        assert_eq!(summary.rejected_outliers, 0);
        assert_eq!(summary.valid_trials, 5);
        assert_relative_eq!(summary.median_ms, 60.0);
        assert_relative_eq!(summary.min_ms, 20.0);
        assert_relative_eq!(summary.max_ms, 100.0);
    }

    #[test]
    fn test_percentiles_use_nearest_rank() {
        let values: Vec<f64> = (0..=10).map(|v| (v * 10) as f64).collect();
        let stats = stats_with(&values);
        let summary = stats.summarize(11, false, 48000).expect("summary");
        assert_relative_eq!(summary.p10_ms, 10.0);
        assert_relative_eq!(summary.p90_ms, 90.0);
        assert_relative_eq!(summary.median_ms, 50.0);
    }

    #[test]
    fn test_failures_count_toward_completed_only() {
        let mut stats = stats_with(&[10.0, 10.5, 9.5]);
        stats.record(failure(3));
        let summary = stats.summarize(4, true, 48000).expect("summary");
        assert_eq!(summary.trials_completed, 4);
        assert_eq!(summary.valid_trials, 3);
        assert!(summary.interrupted);
        assert_relative_eq!(summary.mean_ms, 10.0);
    }

    #[test]
    fn test_clear_resets_the_accumulator() {
        let mut stats = stats_with(&[10.0, 11.0, 12.0]);
        assert_eq!(stats.completed(), 3);
        stats.clear();
        assert_eq!(stats.completed(), 0);
        assert_eq!(stats.valid_count(), 0);
        assert!(stats.summarize(3, false, 48000).is_err());
    }
}
