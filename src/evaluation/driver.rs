//! Evaluation driver: elicit a forecaster on stored tuples, score every
//! tuple under each requested metric, and append one record per tuple.
//!
//! Records are written in tuple order, one flushed line at a time, so a
//! resumed run continues exactly where the previous one stopped.

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::stats::{self, StatsSummary};
use crate::checkers::{self, CheckResult, CheckSettings, Checker, CheckerKind, Metric};
use crate::config::Config;
use crate::data::tuples::{count_complete_lines, read_jsonl, tuple_path, JsonlWriter};
use crate::data::types::{Forecast, ForecastTuple, Question};
use crate::error::{ConsistencyError, Result};
use crate::forecasters::Forecaster;
use crate::llm::DecodingParams;
use crate::monitoring::logger::ViolationLog;
use crate::monitoring::metrics;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotRecord {
    pub question: Question,
    /// `None` when elicitation failed for the tuple.
    pub forecast: Option<Forecast>,
}

/// One line of an evaluation output file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub line: BTreeMap<String, SlotRecord>,
    pub violation_data: Option<BTreeMap<Metric, CheckResult>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EvaluationRecord {
    fn unanswered(tuple: &ForecastTuple, error: &ConsistencyError) -> Self {
        Self {
            line: tuple
                .slots
                .iter()
                .map(|(slot, question)| {
                    (
                        slot.clone(),
                        SlotRecord {
                            question: question.clone(),
                            forecast: None,
                        },
                    )
                })
                .collect(),
            violation_data: None,
            error: Some(error.to_string()),
        }
    }
}

/// checker -> skip reason -> count.
pub type SkipTally = BTreeMap<String, BTreeMap<String, usize>>;

#[derive(Debug, Clone)]
pub struct DriverOptions {
    pub tuple_dir: PathBuf,
    pub output_dir: PathBuf,
    pub checkers: Vec<CheckerKind>,
    pub metrics: Vec<Metric>,
    pub concurrency: usize,
    pub resume: bool,
    pub num_lines: Option<usize>,
    pub settings: CheckSettings,
    pub params: DecodingParams,
    pub csv_log: Option<PathBuf>,
}

impl DriverOptions {
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut params = DecodingParams::default().with_temperature(config.llm.temperature);
        params.max_tokens = config.llm.max_tokens;
        Ok(Self {
            tuple_dir: PathBuf::from(&config.system.tuple_dir),
            output_dir: PathBuf::from(&config.system.output_dir),
            checkers: CheckerKind::parse_list(&config.checks.checkers)?,
            metrics: config.checks.metrics.clone(),
            concurrency: config.evaluation.concurrency,
            resume: config.evaluation.resume,
            num_lines: config.evaluation.num_lines,
            settings: CheckSettings::from_config(&config.checks, &config.solver),
            params,
            csv_log: config
                .monitoring
                .csv_logging
                .then(|| PathBuf::from(&config.monitoring.csv_log_path)),
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct EvaluationReport {
    pub summary: StatsSummary,
    pub skipped: SkipTally,
    /// Records appended in this run, per checker.
    pub written: BTreeMap<String, usize>,
}

pub struct Driver {
    forecaster: Arc<dyn Forecaster>,
    options: DriverOptions,
    log: Option<ViolationLog>,
}

impl Driver {
    pub fn new(forecaster: Arc<dyn Forecaster>, options: DriverOptions) -> Result<Self> {
        let log = match &options.csv_log {
            Some(path) => Some(ViolationLog::new(path)?),
            None => None,
        };
        Ok(Self {
            forecaster,
            options,
            log,
        })
    }

    pub fn output_path(&self, checker: &dyn Checker) -> PathBuf {
        tuple_path(&self.options.output_dir, checker.name())
    }

    pub async fn run(&self) -> Result<EvaluationReport> {
        info!(
            "Evaluating {} with {} checkers, metrics {:?}",
            self.forecaster.name(),
            self.options.checkers.len(),
            self.options.metrics
        );

        let mut report = EvaluationReport::default();
        let mut records_by_checker = BTreeMap::new();

        for kind in &self.options.checkers {
            let checker = kind.checker();
            let (written, skipped) = self.run_checker(checker).await?;
            report.written.insert(checker.name().to_string(), written);
            if !skipped.is_empty() {
                report.skipped.insert(checker.name().to_string(), skipped);
            }

            let output = self.output_path(checker);
            if output.exists() {
                records_by_checker.insert(checker.name().to_string(), read_jsonl(&output)?);
            }
        }

        report.summary = stats::compute(&records_by_checker);
        Ok(report)
    }

    async fn run_checker(&self, checker: &'static dyn Checker) -> Result<(usize, BTreeMap<String, usize>)> {
        let input = tuple_path(&self.options.tuple_dir, checker.name());
        if !input.exists() {
            warn!("No tuple file for {} at {}", checker.name(), input.display());
            return Ok((0, BTreeMap::new()));
        }
        let tuples: Vec<ForecastTuple> = read_jsonl(&input)?;
        let limit = self.options.num_lines.map_or(tuples.len(), |n| n.min(tuples.len()));

        let output = self.output_path(checker);
        let (mut writer, done) = if self.options.resume {
            let done = count_complete_lines(&output)?;
            (JsonlWriter::append_to(&output)?, done)
        } else {
            (JsonlWriter::create(&output)?, 0)
        };
        if done >= limit {
            info!("{}: {} records already present, nothing to do", checker.name(), done);
            return Ok((0, BTreeMap::new()));
        }
        info!(
            "{}: evaluating tuples {}..{} of {}",
            checker.name(),
            done,
            limit,
            tuples.len()
        );

        let mut skipped: BTreeMap<String, usize> = BTreeMap::new();
        let mut written = 0;
        let mut results = stream::iter(tuples[done..limit].iter().enumerate())
            .map(|(i, tuple)| async move { (done + i, self.evaluate_tuple(checker, tuple).await) })
            .buffered(self.options.concurrency.max(1));

        while let Some((index, outcome)) = results.next().await {
            let (record, skip) = outcome?;
            writer.append(&record)?;
            written += 1;

            if let Some(reason) = skip {
                *skipped.entry(reason.to_string()).or_default() += 1;
                if let Some(log) = &self.log {
                    log.log_event(checker.name(), index, record.error.as_deref().unwrap_or(reason))?;
                }
            }
            if let (Some(log), Some(data)) = (&self.log, &record.violation_data) {
                for (metric, result) in data {
                    log.log_check(checker.name(), index, *metric, result)?;
                }
            }
        }

        info!("{}: wrote {} records to {}", checker.name(), written, writer.path().display());
        Ok((written, skipped))
    }

    /// Elicit, retrying once, then score under every metric. Local failures
    /// produce a record with the reason and no violation data; anything
    /// else aborts the run.
    pub async fn evaluate_tuple(
        &self,
        checker: &dyn Checker,
        tuple: &ForecastTuple,
    ) -> Result<(EvaluationRecord, Option<&'static str>)> {
        let forecaster = self.forecaster.as_ref();
        let params = &self.options.params;

        let forecasts = match checkers::elicit(checker, forecaster, tuple, params).await {
            Ok(forecasts) => Ok(forecasts),
            Err(e) if e.is_local() => {
                debug!("{}: retrying elicitation after: {}", checker.name(), e);
                checkers::elicit(checker, forecaster, tuple, params).await
            }
            Err(e) => return Err(e),
        };
        let forecasts = match forecasts {
            Ok(forecasts) => forecasts,
            Err(e) if e.is_local() => {
                warn!("{}: skipping tuple: {}", checker.name(), e);
                return Ok((EvaluationRecord::unanswered(tuple, &e), Some(e.kind_label())));
            }
            Err(e) => return Err(e),
        };

        let probs = checkers::pipeline::to_probabilities(&forecasts);
        let mut violation_data = BTreeMap::new();
        let mut failure = None;
        for metric in &self.options.metrics {
            match checker.check(&probs, *metric, &self.options.settings) {
                Ok(result) => {
                    if result.is_violation {
                        metrics::record_violation(checker.name(), metric.as_str());
                    }
                    violation_data.insert(*metric, result);
                }
                Err(e) if e.is_local() => {
                    warn!("{}: {} metric failed: {}", checker.name(), metric, e);
                    failure = Some(e);
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        let mut forecasts = forecasts;
        let line = tuple
            .slots
            .iter()
            .map(|(slot, question)| {
                (
                    slot.clone(),
                    SlotRecord {
                        question: question.clone(),
                        forecast: forecasts.remove(slot),
                    },
                )
            })
            .collect();

        Ok(match failure {
            None => (
                EvaluationRecord {
                    line,
                    violation_data: Some(violation_data),
                    error: None,
                },
                None,
            ),
            Some(e) => (
                EvaluationRecord {
                    line,
                    violation_data: None,
                    error: Some(e.to_string()),
                },
                Some(e.kind_label()),
            ),
        })
    }
}

/// Print the skipped-tuple tally the way the run log reads it.
pub fn log_skip_tally(skipped: &SkipTally) {
    if skipped.is_empty() {
        info!("No tuples skipped");
        return;
    }
    for (checker, reasons) in skipped {
        let total: usize = reasons.values().sum();
        let detail: Vec<String> = reasons.iter().map(|(r, n)| format!("{}={}", r, n)).collect();
        warn!("{}: skipped {} tuples ({})", checker, total, detail.join(", "));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::types::TupleMetadata;
    use crate::forecasters::TableForecaster;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn question(title: &str) -> Question {
        Question::binary(title, "Resolves as stated.", Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap())
    }

    fn neg_tuple(p: &str) -> ForecastTuple {
        let mut slots = BTreeMap::new();
        slots.insert("P".to_string(), question(p));
        slots.insert("not_P".to_string(), question(&format!("not {}", p)));
        ForecastTuple::new(
            slots,
            TupleMetadata {
                checker: "NegChecker".to_string(),
                ..Default::default()
            },
        )
    }

    fn options(dir: &Path) -> DriverOptions {
        DriverOptions {
            tuple_dir: dir.join("tuples"),
            output_dir: dir.join("out"),
            checkers: vec![CheckerKind::Neg],
            metrics: vec![Metric::Default, Metric::Frequentist],
            concurrency: 4,
            resume: false,
            num_lines: None,
            settings: CheckSettings::default(),
            params: DecodingParams::default(),
            csv_log: None,
        }
    }

    fn write_tuples(dir: &Path, tuples: &[ForecastTuple]) {
        let mut writer = JsonlWriter::create(&tuple_path(&dir.join("tuples"), "NegChecker")).unwrap();
        for tuple in tuples {
            writer.append(tuple).unwrap();
        }
    }

    /// Fails the first `failures` calls on any question, then answers 0.5.
    struct Flaky {
        failures: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Forecaster for Flaky {
        fn name(&self) -> String {
            "flaky".to_string()
        }

        async fn call(&self, question: &Question, _params: &DecodingParams) -> Result<Forecast> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(ConsistencyError::ElicitationFailed {
                    question: question.id.clone(),
                    reason: "timeout".to_string(),
                });
            }
            Ok(Forecast::new(0.5))
        }
    }

    #[tokio::test]
    async fn test_run_writes_records_and_stats() {
        let dir = tempfile::tempdir().unwrap();
        write_tuples(dir.path(), &[neg_tuple("a"), neg_tuple("b")]);
        let forecaster = TableForecaster::new()
            .with("a", 0.5)
            .with("not a", 0.3)
            .with("b", 0.4)
            .with("not b", 0.6);

        let driver = Driver::new(Arc::new(forecaster), options(dir.path())).unwrap();
        let report = driver.run().await.unwrap();
        assert_eq!(report.written["NegChecker"], 2);
        assert!(report.skipped.is_empty());

        let records: Vec<EvaluationRecord> = read_jsonl(&dir.path().join("out/NegChecker.jsonl")).unwrap();
        assert_eq!(records.len(), 2);
        let data = records[0].violation_data.as_ref().unwrap();
        assert!((data[&Metric::Default].violation - 0.2).abs() < 1e-12);
        assert!(data[&Metric::Default].is_violation);
        assert_eq!(records[0].line["P"].forecast.as_ref().unwrap().prob, 0.5);

        let stats = &report.summary["NegChecker"][&Metric::Default];
        assert_eq!(stats.num_samples, 2);
        assert_eq!(stats.num_violations, 1);
    }

    #[tokio::test]
    async fn test_retry_once_then_null_record() {
        let dir = tempfile::tempdir().unwrap();
        let driver = Driver::new(
            Arc::new(Flaky {
                failures: 2,
                calls: AtomicUsize::new(0),
            }),
            options(dir.path()),
        )
        .unwrap();
        // First attempt loses both slots, the retry succeeds
        let (record, skip) = driver.evaluate_tuple(CheckerKind::Neg.checker(), &neg_tuple("a")).await.unwrap();
        assert!(skip.is_none());
        assert!(record.violation_data.is_some());

        let driver = Driver::new(
            Arc::new(Flaky {
                failures: usize::MAX,
                calls: AtomicUsize::new(0),
            }),
            options(dir.path()),
        )
        .unwrap();
        let (record, skip) = driver.evaluate_tuple(CheckerKind::Neg.checker(), &neg_tuple("a")).await.unwrap();
        assert_eq!(skip, Some("elicitation_failed"));
        assert!(record.violation_data.is_none());
        assert!(record.line.values().all(|slot| slot.forecast.is_none()));

        let json = serde_json::to_value(&record).unwrap();
        assert!(json["violation_data"].is_null());
        assert!(json["line"]["P"]["forecast"].is_null());
    }

    #[tokio::test]
    async fn test_skips_are_tallied() {
        let dir = tempfile::tempdir().unwrap();
        write_tuples(dir.path(), &[neg_tuple("a"), neg_tuple("b")]);
        // "b" has no recorded answers
        let forecaster = TableForecaster::new().with("a", 0.5).with("not a", 0.5);
        let driver = Driver::new(Arc::new(forecaster), options(dir.path())).unwrap();
        let report = driver.run().await.unwrap();
        assert_eq!(report.skipped["NegChecker"]["elicitation_failed"], 1);
        assert_eq!(report.summary["NegChecker"][&Metric::Default].num_samples, 1);
    }

    #[tokio::test]
    async fn test_non_local_error_aborts() {
        struct ReadOnly;

        #[async_trait]
        impl Forecaster for ReadOnly {
            fn name(&self) -> String {
                "read-only".to_string()
            }

            async fn call(&self, _question: &Question, _params: &DecodingParams) -> Result<Forecast> {
                Err(ConsistencyError::CacheMiss("key".to_string()))
            }
        }

        let dir = tempfile::tempdir().unwrap();
        write_tuples(dir.path(), &[neg_tuple("a")]);
        let driver = Driver::new(Arc::new(ReadOnly), options(dir.path())).unwrap();
        assert!(matches!(driver.run().await, Err(ConsistencyError::CacheMiss(_))));
    }

    #[tokio::test]
    async fn test_csv_log_rows() {
        let dir = tempfile::tempdir().unwrap();
        write_tuples(dir.path(), &[neg_tuple("a")]);
        let mut opts = options(dir.path());
        opts.csv_log = Some(dir.path().join("violations.csv"));
        let forecaster = TableForecaster::new().with("a", 0.5).with("not a", 0.3);
        Driver::new(Arc::new(forecaster), opts).unwrap().run().await.unwrap();

        let csv = std::fs::read_to_string(dir.path().join("violations.csv")).unwrap();
        // Header plus one row per metric
        assert_eq!(csv.lines().count(), 3);
    }
}
