//! Consistency-restoring wrapper around a "hypocrite" forecaster.
//!
//! For each checker in turn the wrapper builds a tuple around the focal
//! question, asks the hypocrite about the other slots, and moves its
//! current estimate to the arbitrage-consistent one. The focal weight grows
//! with every successful pass so earlier corrections are not undone by
//! later ones.

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::Forecaster;
use crate::checkers::{self, CheckSettings, Checker, CheckerKind};
use crate::data::types::{Forecast, Probabilities, Question, TrailStep};
use crate::error::{ConsistencyError, Result};
use crate::instantiators::{Instantiator, InstantiatorKind};
use crate::llm::DecodingParams;

/// Slot that carries the question being forecast.
pub const FOCAL_SLOT: &str = "P";

pub struct ConsistentForecaster {
    hypocrite: Arc<dyn Forecaster>,
    checks: Vec<CheckerKind>,
    instantiator: Arc<Instantiator>,
    settings: CheckSettings,
    depth: usize,
}

impl ConsistentForecaster {
    /// Fails if a checker has no focal `P` slot to update.
    pub fn new(
        hypocrite: Arc<dyn Forecaster>,
        checks: Vec<CheckerKind>,
        instantiator: Arc<Instantiator>,
        settings: CheckSettings,
    ) -> Result<Self> {
        Self::at_depth(hypocrite, checks, instantiator, settings, 1)
    }

    fn at_depth(
        hypocrite: Arc<dyn Forecaster>,
        checks: Vec<CheckerKind>,
        instantiator: Arc<Instantiator>,
        settings: CheckSettings,
        depth: usize,
    ) -> Result<Self> {
        if let Some(kind) = checks.iter().find(|k| k.checker().slot_index(FOCAL_SLOT).is_none()) {
            return Err(ConsistencyError::Config(format!(
                "{} has no {} slot and cannot drive a consistent forecaster",
                kind.name(),
                FOCAL_SLOT
            )));
        }
        Ok(Self {
            hypocrite,
            checks,
            instantiator,
            settings,
            depth,
        })
    }

    /// Nest `depth` wrappers around `hypocrite`, each using `checks`.
    /// Depth 0 returns the hypocrite itself.
    pub fn recursive(
        depth: usize,
        checks: &[CheckerKind],
        hypocrite: Arc<dyn Forecaster>,
        instantiator: Arc<Instantiator>,
        settings: CheckSettings,
    ) -> Result<Arc<dyn Forecaster>> {
        let mut forecaster = hypocrite;
        for level in 1..=depth {
            forecaster = Arc::new(Self::at_depth(
                forecaster,
                checks.to_vec(),
                instantiator.clone(),
                settings.clone(),
                level,
            )?);
        }
        Ok(forecaster)
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Seed questions for `checker` around `focal`. Extra seeds (Q, R) are
    /// generated as related questions, each from the previous one.
    async fn seed_bases(&self, checker: &dyn Checker, focal: &Question) -> Result<BTreeMap<String, Question>> {
        let mut base = BTreeMap::new();
        let mut previous = focal.clone();
        for (i, name) in checker.seed_slots().iter().enumerate() {
            if i == 0 {
                base.insert(name.to_string(), focal.clone());
                continue;
            }
            let related = self.instantiator.derive(InstantiatorKind::Related, &[&previous]).await?;
            previous = related.question.clone();
            base.insert(name.to_string(), related.question);
        }
        Ok(base)
    }

    /// Hypocrite answers on every slot except the focal one.
    async fn elicit_others(
        &self,
        checker: &dyn Checker,
        tuple: &crate::data::types::ForecastTuple,
        params: &DecodingParams,
    ) -> Result<Probabilities> {
        let calls = checker
            .slots()
            .iter()
            .filter(|slot| slot.name != FOCAL_SLOT)
            .map(|slot| async move {
                let question = tuple.get(slot.name).ok_or_else(|| ConsistencyError::MissingSlot {
                    checker: checker.name().to_string(),
                    slot: slot.name.to_string(),
                })?;
                let forecast = self.hypocrite.call(question, params).await?;
                if !forecast.prob.is_finite() || !(0.0..=1.0).contains(&forecast.prob) {
                    return Err(ConsistencyError::ElicitationFailed {
                        question: question.id.clone(),
                        reason: format!("{} is not a probability", forecast.prob),
                    });
                }
                Ok((slot.name.to_string(), forecast.prob))
            });
        join_all(calls).await.into_iter().collect()
    }

    /// One checker pass. Solver trouble keeps the prior estimate and
    /// records why; every other failure propagates.
    fn arbitrage_step(
        &self,
        checker: &dyn Checker,
        prior: f64,
        weight: f64,
        other_answers: Probabilities,
    ) -> Result<TrailStep> {
        let mut answers = other_answers.clone();
        answers.insert(FOCAL_SLOT.to_string(), prior);
        let mut weights = Probabilities::new();
        weights.insert(FOCAL_SLOT.to_string(), weight);

        let mut step = TrailStep {
            checker: checker.name().to_string(),
            depth: self.depth,
            prior_prob: prior,
            focal_weight: weight,
            other_answers,
            consistent_probs: Probabilities::new(),
            regret: 0.0,
            posterior_prob: prior,
            warning: None,
        };

        match checker.max_min_arbitrage(&answers, &weights, &self.settings) {
            Ok(result) if result.converged => {
                step.posterior_prob = result.consistent_probs.get(FOCAL_SLOT).copied().unwrap_or(prior);
                step.regret = result.regret;
                step.consistent_probs = result.consistent_probs;
            }
            Ok(result) => {
                let err = ConsistencyError::ArbitrageDidNotConverge {
                    iterations: result.iterations,
                    regret: result.regret,
                };
                warn!("{}: {}; keeping prior estimate {:.4}", checker.name(), err, prior);
                step.regret = result.regret;
                step.consistent_probs = result.consistent_probs;
                step.warning = Some(err.to_string());
            }
            Err(e @ (ConsistencyError::ArbitrageInfeasible(_) | ConsistencyError::ArbitrageDidNotConverge { .. })) => {
                warn!("{}: {}; keeping prior estimate {:.4}", checker.name(), e, prior);
                step.warning = Some(e.to_string());
            }
            Err(e) => return Err(e),
        }
        Ok(step)
    }
}

#[async_trait]
impl Forecaster for ConsistentForecaster {
    fn name(&self) -> String {
        let checks: Vec<&str> = self.checks.iter().map(|k| k.name()).collect();
        format!("ConsistentForecaster[{}]({})", checks.join(","), self.hypocrite.name())
    }

    async fn call(&self, question: &Question, params: &DecodingParams) -> Result<Forecast> {
        let initial = self.hypocrite.call(question, params).await?;
        if !initial.prob.is_finite() || !(0.0..=1.0).contains(&initial.prob) {
            return Err(ConsistencyError::ElicitationFailed {
                question: question.id.clone(),
                reason: format!("{} is not a probability", initial.prob),
            });
        }

        let mut prob = initial.prob;
        let mut weight = 1.0;
        let mut trail = initial.trail.clone();

        for kind in &self.checks {
            let checker = kind.checker();
            let base = self.seed_bases(checker, question).await?;
            let tuple = checkers::instantiate(checker, &base, &self.instantiator).await?;
            let other_answers = self.elicit_others(checker, &tuple, params).await?;
            let others = other_answers.len();

            // CPU-bound; no generator permit is held here
            let step = self.arbitrage_step(checker, prob, weight, other_answers)?;
            debug!(
                "{} depth {}: {:.4} -> {:.4} (weight {}, regret {:.6})",
                step.checker, self.depth, step.prior_prob, step.posterior_prob, weight, step.regret
            );
            prob = step.posterior_prob;
            // A pass that kept the prior added no information to the focal quote
            if step.warning.is_none() {
                weight += others as f64;
            }
            trail.push(step);
        }

        let mut forecast = Forecast::new(prob).with_metadata(json!({
            "forecaster": "consistent",
            "depth": self.depth,
            "checks": self.checks.iter().map(|k| k.name()).collect::<Vec<_>>(),
            "hypocrite_prob": initial.prob,
            "hypocrite": initial.metadata,
        }));
        forecast.trail = trail;
        Ok(forecast)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkers::Metric;
    use crate::config::InstantiationConfig;
    use crate::forecasters::TableForecaster;
    use crate::llm::generator::testing::FnGenerator;
    use crate::llm::GenerationRequest;
    use chrono::{TimeZone, Utc};

    /// Derived questions are titled after their relation to the input, so a
    /// table forecaster can answer them: "not <P>", "para <P>", ...
    fn titled_instantiator() -> Arc<Instantiator> {
        let generator = FnGenerator::new(|request: &GenerationRequest| {
            if request.schema.name == "VerificationResult" {
                return Ok(json!({"valid": true, "score": 1.0}));
            }
            let p_title = request
                .prompt
                .lines()
                .find_map(|l| l.strip_prefix("Title: "))
                .unwrap_or("?")
                .to_string();
            let title = if request.prompt.contains("negation") {
                format!("not {}", p_title)
            } else if request.prompt.contains("Rephrase") {
                format!("para {}", p_title)
            } else if request.prompt.contains("related") {
                format!("related {}", p_title)
            } else if request.prompt.contains("conjunction") {
                format!("and {}", p_title)
            } else {
                format!("other {}", p_title)
            };
            Ok(json!({"title": title, "body": "Derived criteria."}))
        });
        Arc::new(Instantiator::new(Arc::new(generator), InstantiationConfig::default()))
    }

    fn focal() -> Question {
        Question::binary("rain", "Resolves yes if it rains.", Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap())
    }

    #[tokio::test]
    async fn test_neg_pass_moves_towards_consistency() {
        let hypocrite: Arc<dyn Forecaster> = Arc::new(TableForecaster::new().with("rain", 0.5).with("not rain", 0.3));
        let cf = ConsistentForecaster::new(
            hypocrite,
            vec![CheckerKind::Neg],
            titled_instantiator(),
            CheckSettings::default(),
        )
        .unwrap();

        let forecast = cf.call(&focal(), &DecodingParams::default()).await.unwrap();
        assert!((forecast.prob - 0.6).abs() < 0.01, "prob {}", forecast.prob);
        assert_eq!(forecast.trail.len(), 1);
        let step = &forecast.trail[0];
        assert_eq!(step.prior_prob, 0.5);
        assert_eq!(step.focal_weight, 1.0);
        assert_eq!(step.other_answers["not_P"], 0.3);
        assert!(step.warning.is_none());

        let check = CheckerKind::Neg
            .checker()
            .check(&step.consistent_probs, Metric::Default, &CheckSettings::default())
            .unwrap();
        assert!(check.violation <= 1e-4);
    }

    #[tokio::test]
    async fn test_focal_weight_accumulates() {
        let hypocrite: Arc<dyn Forecaster> = Arc::new(
            TableForecaster::new()
                .with("rain", 0.5)
                .with("not rain", 0.3)
                .with("para rain", 0.7),
        );
        let cf = ConsistentForecaster::new(
            hypocrite,
            vec![CheckerKind::Neg, CheckerKind::Paraphrase],
            titled_instantiator(),
            CheckSettings::default(),
        )
        .unwrap();

        let forecast = cf.call(&focal(), &DecodingParams::default()).await.unwrap();
        assert_eq!(forecast.trail.len(), 2);
        assert_eq!(forecast.trail[0].focal_weight, 1.0);
        assert_eq!(forecast.trail[1].focal_weight, 2.0);
        assert_eq!(forecast.trail[1].prior_prob, forecast.trail[0].posterior_prob);
        // A weight-2 focal quote moves less than the weight-1 paraphrase
        let step = &forecast.trail[1];
        assert!((step.posterior_prob - step.prior_prob).abs() < (0.7 - step.posterior_prob).abs());
    }

    #[tokio::test]
    async fn test_unconverged_pass_holds_weight() {
        let hypocrite: Arc<dyn Forecaster> = Arc::new(
            TableForecaster::new()
                .with("rain", 0.5)
                .with("not rain", 0.3)
                .with("para rain", 0.7),
        );
        let mut settings = CheckSettings::default();
        settings.arbitrage.solver.max_iterations = 1;
        settings.arbitrage.solver.tolerance = 0.0;
        let cf = ConsistentForecaster::new(
            hypocrite,
            vec![CheckerKind::Neg, CheckerKind::Paraphrase],
            titled_instantiator(),
            settings,
        )
        .unwrap();

        let forecast = cf.call(&focal(), &DecodingParams::default()).await.unwrap();
        assert_eq!(forecast.trail.len(), 2);
        for step in &forecast.trail {
            assert!(step.warning.is_some(), "{} converged", step.checker);
            assert_eq!(step.posterior_prob, step.prior_prob);
            assert_eq!(step.focal_weight, 1.0);
        }
        assert_eq!(forecast.prob, 0.5);
    }

    #[tokio::test]
    async fn test_related_seed_fills_second_base() {
        let hypocrite: Arc<dyn Forecaster> = Arc::new(TableForecaster::new().with_fallback(0.4).with("rain", 0.6));
        let cf = ConsistentForecaster::new(
            hypocrite,
            vec![CheckerKind::And],
            titled_instantiator(),
            CheckSettings::default(),
        )
        .unwrap();
        let forecast = cf.call(&focal(), &DecodingParams::default()).await.unwrap();
        let step = &forecast.trail[0];
        assert!(step.other_answers.contains_key("Q"));
        assert!(step.other_answers.contains_key("P_and_Q"));
        assert!(!step.other_answers.contains_key("P"));
    }

    #[tokio::test]
    async fn test_elicitation_failure_propagates() {
        let hypocrite: Arc<dyn Forecaster> = Arc::new(TableForecaster::new().with("rain", 0.5));
        let cf = ConsistentForecaster::new(
            hypocrite,
            vec![CheckerKind::Neg],
            titled_instantiator(),
            CheckSettings::default(),
        )
        .unwrap();
        let err = cf.call(&focal(), &DecodingParams::default()).await.unwrap_err();
        assert!(matches!(err, ConsistencyError::ElicitationFailed { .. }));
    }

    #[tokio::test]
    async fn test_recursive_trail_covers_every_depth() {
        let hypocrite: Arc<dyn Forecaster> = Arc::new(
            TableForecaster::new()
                .with("rain", 0.5)
                .with("not rain", 0.3)
                .with_fallback(0.5),
        );
        let cf = ConsistentForecaster::recursive(
            2,
            &[CheckerKind::Neg],
            hypocrite,
            titled_instantiator(),
            CheckSettings::default(),
        )
        .unwrap();

        let forecast = cf.call(&focal(), &DecodingParams::default()).await.unwrap();
        let depths: Vec<usize> = forecast.trail.iter().map(|s| s.depth).collect();
        // The inner wrapper runs once for the focal question and once more
        // for not_P, whose trail is not carried
        assert_eq!(depths, vec![1, 2]);
        assert!(forecast.prob.is_finite());
    }

    #[test]
    fn test_symmetry_checkers_rejected() {
        let hypocrite: Arc<dyn Forecaster> = Arc::new(TableForecaster::new());
        let result = ConsistentForecaster::new(
            hypocrite,
            vec![CheckerKind::SymmetryAnd],
            titled_instantiator(),
            CheckSettings::default(),
        );
        assert!(matches!(result, Err(ConsistencyError::Config(_))));
    }
}
