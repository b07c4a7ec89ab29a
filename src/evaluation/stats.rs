//! Violation statistics per checker and metric, plus an aggregate over all
//! checkers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use super::driver::EvaluationRecord;
use crate::checkers::Metric;
use crate::error::Result;

pub const AGGREGATED_KEY: &str = "aggregated";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricStats {
    pub num_samples: usize,
    pub num_violations: usize,
    pub fraction_violations: Option<f64>,
    /// `None` when there are no samples.
    pub avg_abs_violation: Option<f64>,
    pub median_abs_violation: Option<f64>,
}

/// checker name (or `aggregated`) -> metric -> stats.
pub type StatsSummary = BTreeMap<String, BTreeMap<Metric, MetricStats>>;

fn median(sorted: &[f64]) -> Option<f64> {
    let n = sorted.len();
    match n {
        0 => None,
        _ if n % 2 == 1 => Some(sorted[n / 2]),
        _ => Some((sorted[n / 2 - 1] + sorted[n / 2]) / 2.0),
    }
}

/// Stats over `(violation, is_violation)` samples.
pub fn summarize(samples: &[(f64, bool)]) -> MetricStats {
    let mut magnitudes: Vec<f64> = samples.iter().map(|(v, _)| v.abs()).collect();
    magnitudes.sort_by(f64::total_cmp);
    let num_samples = samples.len();
    let num_violations = samples.iter().filter(|(_, flagged)| *flagged).count();
    let avg = (num_samples > 0).then(|| magnitudes.iter().sum::<f64>() / num_samples as f64);

    MetricStats {
        num_samples,
        num_violations,
        fraction_violations: (num_samples > 0).then(|| num_violations as f64 / num_samples as f64),
        avg_abs_violation: avg,
        median_abs_violation: median(&magnitudes),
    }
}

/// Per-checker samples for every metric seen. Records without violation
/// data (skipped tuples) contribute nothing.
fn collect(records: &[EvaluationRecord]) -> BTreeMap<Metric, Vec<(f64, bool)>> {
    let mut samples: BTreeMap<Metric, Vec<(f64, bool)>> = BTreeMap::new();
    for record in records {
        let Some(data) = &record.violation_data else {
            continue;
        };
        for (metric, result) in data {
            samples
                .entry(*metric)
                .or_default()
                .push((result.violation, result.is_violation));
        }
    }
    samples
}

pub fn compute(records_by_checker: &BTreeMap<String, Vec<EvaluationRecord>>) -> StatsSummary {
    let mut summary = StatsSummary::new();
    let mut pooled: BTreeMap<Metric, Vec<(f64, bool)>> = BTreeMap::new();

    for (checker, records) in records_by_checker {
        let per_metric = collect(records);
        let stats = per_metric
            .iter()
            .map(|(metric, samples)| (*metric, summarize(samples)))
            .collect();
        summary.insert(checker.clone(), stats);
        for (metric, samples) in per_metric {
            pooled.entry(metric).or_default().extend(samples);
        }
    }

    summary.insert(
        AGGREGATED_KEY.to_string(),
        pooled.iter().map(|(metric, samples)| (*metric, summarize(samples))).collect(),
    );
    summary
}

pub fn write_summary(path: &Path, summary: &StatsSummary) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(summary)?)?;
    Ok(())
}
