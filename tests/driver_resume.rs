//! Resuming an interrupted evaluation must reproduce the single-shot file.

use chrono::{TimeZone, Utc};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use forecast_consistency::checkers::{CheckSettings, CheckerKind, Metric};
use forecast_consistency::data::tuples::{tuple_path, JsonlWriter};
use forecast_consistency::data::types::{ForecastTuple, Question, TupleMetadata};
use forecast_consistency::evaluation::{Driver, DriverOptions};
use forecast_consistency::forecasters::TableForecaster;
use forecast_consistency::llm::DecodingParams;

const TUPLES: usize = 10;

fn neg_tuple(i: usize) -> ForecastTuple {
    let date = Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap();
    let mut slots = BTreeMap::new();
    slots.insert("P".to_string(), Question::binary(format!("event {}", i), "Resolves as stated.", date));
    slots.insert(
        "not_P".to_string(),
        Question::binary(format!("not event {}", i), "Resolves if it does not.", date),
    );
    ForecastTuple::new(
        slots,
        TupleMetadata {
            checker: "NegChecker".to_string(),
            ..Default::default()
        },
    )
}

fn forecaster() -> TableForecaster {
    let table = (0..TUPLES).fold(TableForecaster::new(), |table, i| {
        table
            .with(format!("event {}", i), 0.1 * i as f64 / 2.0 + 0.2)
            .with(format!("not event {}", i), 0.5)
    });
    // Tuple 3 gets a non-probability for its negation and lands as a null record
    table.with("not event 3", f64::NAN)
}

fn setup(dir: &Path) {
    let mut writer = JsonlWriter::create(&tuple_path(&dir.join("tuples"), "NegChecker")).unwrap();
    for i in 0..TUPLES {
        writer.append(&neg_tuple(i)).unwrap();
    }
}

fn options(dir: &Path, num_lines: usize, resume: bool) -> DriverOptions {
    DriverOptions {
        tuple_dir: dir.join("tuples"),
        output_dir: dir.join("out"),
        checkers: vec![CheckerKind::Neg],
        metrics: vec![Metric::Default, Metric::Frequentist],
        concurrency: 3,
        resume,
        num_lines: Some(num_lines),
        settings: CheckSettings::default(),
        params: DecodingParams::default(),
        csv_log: None,
    }
}

async fn run(dir: &Path, num_lines: usize, resume: bool) {
    let driver = Driver::new(Arc::new(forecaster()), options(dir, num_lines, resume)).unwrap();
    driver.run().await.unwrap();
}

fn output(dir: &Path) -> String {
    std::fs::read_to_string(dir.join("out/NegChecker.jsonl")).unwrap()
}

#[tokio::test]
async fn test_resume_matches_single_shot() {
    for (first, second) in [(0, 4), (3, 7), (4, 4), (6, TUPLES)] {
        let staged = tempfile::tempdir().unwrap();
        setup(staged.path());
        run(staged.path(), first, false).await;
        run(staged.path(), second, true).await;

        let single = tempfile::tempdir().unwrap();
        setup(single.path());
        run(single.path(), second, false).await;

        let staged_out = output(staged.path());
        let single_out = output(single.path());
        assert_eq!(staged_out.lines().count(), second, "first {} second {}", first, second);
        assert_eq!(staged_out, single_out, "first {} second {}", first, second);
    }
}

#[tokio::test]
async fn test_resume_recovers_from_a_torn_line() {
    let dir = tempfile::tempdir().unwrap();
    setup(dir.path());
    run(dir.path(), 5, false).await;

    // Simulate a crash halfway through writing record 6
    let path = dir.path().join("out/NegChecker.jsonl");
    let mut contents = std::fs::read_to_string(&path).unwrap();
    contents.push_str("{\"line\":{\"P\":");
    std::fs::write(&path, contents).unwrap();

    run(dir.path(), TUPLES, true).await;

    let single = tempfile::tempdir().unwrap();
    setup(single.path());
    run(single.path(), TUPLES, false).await;
    assert_eq!(output(dir.path()), output(single.path()));
}
