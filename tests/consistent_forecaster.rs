//! End-to-end runs of the consistent forecaster against a scripted
//! generator and a table-backed hypocrite.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use serde_json::{json, Value};
use std::sync::Arc;

use forecast_consistency::checkers::{CheckSettings, Checker, CheckerKind, Metric};
use forecast_consistency::config::InstantiationConfig;
use forecast_consistency::data::types::Question;
use forecast_consistency::forecasters::{ConsistentForecaster, Forecaster, TableForecaster};
use forecast_consistency::instantiators::Instantiator;
use forecast_consistency::llm::{DecodingParams, GenerationRequest, TextGenerator};
use forecast_consistency::Result;

/// Verifies everything and titles derived questions after the first input
/// question in the prompt.
struct ScriptedGenerator;

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    fn model(&self) -> &str {
        "scripted"
    }

    async fn answer(&self, request: &GenerationRequest) -> Result<Value> {
        if request.schema.name == "VerificationResult" {
            return Ok(json!({"valid": true, "score": 1.0}));
        }
        let source = request
            .prompt
            .lines()
            .find_map(|l| l.strip_prefix("Title: "))
            .unwrap_or("?");
        let relation = if request.prompt.contains("negation") {
            "not"
        } else if request.prompt.contains("Rephrase") {
            "para"
        } else if request.prompt.contains("related") {
            "related"
        } else {
            "derived"
        };
        Ok(json!({"title": format!("{} {}", relation, source), "body": "Derived criteria."}))
    }
}

fn instantiator() -> Arc<Instantiator> {
    Arc::new(Instantiator::new(Arc::new(ScriptedGenerator), InstantiationConfig::default()))
}

fn focal() -> Question {
    Question::binary(
        "Will the reservoir be full?",
        "Resolves yes if the gauge reads 100%.",
        Utc.with_ymd_and_hms(2027, 6, 1, 0, 0, 0).unwrap(),
    )
}

fn check_sets() -> impl Strategy<Value = Vec<CheckerKind>> {
    prop::sample::subsequence(
        vec![
            CheckerKind::Neg,
            CheckerKind::Paraphrase,
            CheckerKind::Consequence,
            CheckerKind::Cond,
        ],
        1..=2,
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn emitted_quotes_are_consistent(
        depth in 1usize..=2,
        checks in check_sets(),
        focal_prob in 0.05f64..=0.95,
        fallback in 0.05f64..=0.95,
    ) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let hypocrite: Arc<dyn Forecaster> = Arc::new(
            TableForecaster::new()
                .with(focal().title, focal_prob)
                .with_fallback(fallback),
        );
        let settings = CheckSettings::default();
        let forecaster = ConsistentForecaster::recursive(
            depth,
            &checks,
            hypocrite,
            instantiator(),
            settings.clone(),
        )
        .unwrap();

        let forecast = runtime
            .block_on(forecaster.call(&focal(), &DecodingParams::default()))
            .unwrap();
        prop_assert!((0.0..=1.0).contains(&forecast.prob));

        // The outermost wrapper contributes the last `checks.len()` steps
        let outer = &forecast.trail[forecast.trail.len() - checks.len()..];
        prop_assert!(outer.iter().all(|step| step.depth == depth));
        prop_assert_eq!(outer[outer.len() - 1].posterior_prob, forecast.prob);

        for (kind, step) in checks.iter().zip(outer) {
            prop_assert_eq!(step.checker.as_str(), kind.name());
            if step.warning.is_some() {
                // Solver trouble must leave the running estimate untouched
                prop_assert_eq!(step.posterior_prob, step.prior_prob);
                continue;
            }
            let check = kind
                .checker()
                .check(&step.consistent_probs, Metric::Default, &settings)
                .unwrap();
            prop_assert!(
                check.violation <= settings.arbitrage.feasibility_tolerance,
                "{} left violation {}",
                kind.name(),
                check.violation
            );
            prop_assert_eq!(step.consistent_probs["P"], step.posterior_prob);
        }
    }
}

#[tokio::test]
async fn test_consistent_hypocrite_is_left_alone() {
    let hypocrite: Arc<dyn Forecaster> = Arc::new(
        TableForecaster::new()
            .with(focal().title, 0.3)
            .with(format!("not {}", focal().title), 0.7)
            .with(format!("para {}", focal().title), 0.3),
    );
    let forecaster = ConsistentForecaster::new(
        hypocrite,
        vec![CheckerKind::Neg, CheckerKind::Paraphrase],
        instantiator(),
        CheckSettings::default(),
    )
    .unwrap();

    let forecast = forecaster.call(&focal(), &DecodingParams::default()).await.unwrap();
    assert!((forecast.prob - 0.3).abs() < 1e-9);
    assert!(forecast.trail.iter().all(|step| step.regret.abs() < 1e-9));
    assert_eq!(forecast.metadata["hypocrite_prob"], 0.3);
}

#[tokio::test]
async fn test_multi_slot_checkers_converge() {
    let settings = CheckSettings::default();
    for kind in [CheckerKind::And, CheckerKind::CondCond] {
        let hypocrite: Arc<dyn Forecaster> = Arc::new(
            TableForecaster::new()
                .with(focal().title, 0.6)
                .with_fallback(0.7),
        );
        let forecaster =
            ConsistentForecaster::new(hypocrite, vec![kind], instantiator(), settings.clone()).unwrap();

        let forecast = forecaster.call(&focal(), &DecodingParams::default()).await.unwrap();
        let step = &forecast.trail[0];
        let checker = kind.checker();
        assert!(checker.slots().len() >= 3);
        assert!(step.warning.is_none(), "{}: {:?}", kind.name(), step.warning);
        assert_eq!(step.consistent_probs.len(), checker.slots().len());

        // The hypocrite's answers were inconsistent, the arbitraged ones are not
        let mut answers = step.other_answers.clone();
        answers.insert("P".to_string(), step.prior_prob);
        let before = checker.check(&answers, Metric::Default, &settings).unwrap();
        assert!(before.violation > settings.arbitrage.feasibility_tolerance, "{}", kind.name());

        let after = checker.check(&step.consistent_probs, Metric::Default, &settings).unwrap();
        assert!(
            after.violation <= settings.arbitrage.feasibility_tolerance,
            "{} left violation {}",
            kind.name(),
            after.violation
        );
        assert_eq!(step.consistent_probs["P"], forecast.prob);
        assert!(step.regret > 0.0);
    }
}
