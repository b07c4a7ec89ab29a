//! Building tuples from base questions and eliciting forecasts on them.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use super::Checker;
use crate::data::types::{Forecast, ForecastTuple, Probabilities, Question, QuestionType, TupleMetadata};
use crate::error::{ConsistencyError, Result};
use crate::forecasters::Forecaster;
use crate::instantiators::Instantiator;
use crate::llm::DecodingParams;

fn missing(checker: &dyn Checker, slot: &str) -> ConsistencyError {
    ConsistencyError::MissingSlot {
        checker: checker.name().to_string(),
        slot: slot.to_string(),
    }
}

/// Run the checker's plan over `base` (keyed by seed slot name).
///
/// Questions the plan builds that are not slots are kept in
/// `metadata.intermediates`.
pub async fn instantiate(
    checker: &dyn Checker,
    base: &BTreeMap<String, Question>,
    instantiator: &Instantiator,
) -> Result<ForecastTuple> {
    let mut built: BTreeMap<String, Question> = BTreeMap::new();
    for name in checker.seed_slots() {
        let question = base.get(*name).ok_or_else(|| missing(checker, name))?;
        question.validate()?;
        built.insert(name.to_string(), question.clone());
    }
    let mut dates = built.values().map(|q| q.resolution_date);
    if let Some(first) = dates.next() {
        if let Some(other) = dates.find(|d| *d != first) {
            return Err(ConsistencyError::InvalidQuestion(format!(
                "{} seeds resolve on different dates ({} and {})",
                checker.name(),
                first.format("%Y-%m-%d"),
                other.format("%Y-%m-%d")
            )));
        }
    }
    let base_sentences = built.clone();

    let mut diagnostics = Vec::with_capacity(checker.plan().len());
    for step in checker.plan() {
        let inputs = step
            .inputs
            .iter()
            .map(|name| built.get(*name).ok_or_else(|| missing(checker, name)))
            .collect::<Result<Vec<&Question>>>()?;
        let derived = instantiator.derive(step.kind, &inputs).await?;

        let mut diagnostic = derived.diagnostic;
        diagnostic.output = step.output.to_string();
        diagnostics.push(diagnostic);
        built.insert(step.output.to_string(), derived.question);
    }

    let slot_names: BTreeSet<&str> = checker.slots().iter().map(|s| s.name).collect();
    let mut slots = BTreeMap::new();
    let mut intermediates = BTreeMap::new();
    for (name, question) in built {
        if slot_names.contains(name.as_str()) {
            slots.insert(name, question);
        } else if !base_sentences.contains_key(&name) {
            intermediates.insert(name, question);
        }
    }

    for slot in checker.slots() {
        let question = slots.get(slot.name).ok_or_else(|| missing(checker, slot.name))?;
        if question.question_type != slot.question_type {
            return Err(ConsistencyError::InvalidQuestion(format!(
                "{} slot {} expects {} but got {}",
                checker.name(),
                slot.name,
                slot.question_type.as_str(),
                question.question_type.as_str()
            )));
        }
    }

    debug!("Instantiated {} tuple with {} slots", checker.name(), slots.len());
    Ok(ForecastTuple::new(
        slots,
        TupleMetadata {
            checker: checker.name().to_string(),
            base_sentences,
            intermediates,
            diagnostics,
        },
    ))
}

/// `instantiate` over many seed bundles with the instantiator's batch
/// concurrency. Results keep the order of `bases`.
pub async fn instantiate_batch(
    checker: &dyn Checker,
    bases: &[BTreeMap<String, Question>],
    instantiator: &Instantiator,
) -> Vec<Result<ForecastTuple>> {
    stream::iter(bases)
        .map(|base| instantiate(checker, base, instantiator))
        .buffered(instantiator.config().batch_concurrency.max(1))
        .collect()
        .await
}

/// Ask `forecaster` about every slot of `tuple`, all slots concurrently.
pub async fn elicit(
    checker: &dyn Checker,
    forecaster: &dyn Forecaster,
    tuple: &ForecastTuple,
    params: &DecodingParams,
) -> Result<BTreeMap<String, Forecast>> {
    let calls = checker.slots().iter().map(|slot| async move {
        let question = tuple.get(slot.name).ok_or_else(|| missing(checker, slot.name))?;
        let forecast = forecaster.call(question, params).await?;
        if !forecast.prob.is_finite() || !(0.0..=1.0).contains(&forecast.prob) {
            return Err(ConsistencyError::ElicitationFailed {
                question: question.id.clone(),
                reason: format!("{} is not a probability", forecast.prob),
            });
        }
        Ok((slot.name.to_string(), forecast))
    });
    join_all(calls).await.into_iter().collect()
}

pub fn to_probabilities(forecasts: &BTreeMap<String, Forecast>) -> Probabilities {
    forecasts.iter().map(|(slot, f)| (slot.clone(), f.prob)).collect()
}

/// Seed bundles for `checker` from a flat list of base questions. Binary
/// questions are grouped by resolution date, then each run of
/// `seed_slots().len()` consecutive questions within a group becomes one
/// bundle. Groups come out in date order; trailing partial runs are dropped.
pub fn seed_bundles(checker: &dyn Checker, questions: &[Question]) -> Vec<BTreeMap<String, Question>> {
    let seeds = checker.seed_slots();
    let mut by_date: BTreeMap<DateTime<Utc>, Vec<&Question>> = BTreeMap::new();
    for q in questions.iter().filter(|q| q.question_type == QuestionType::Binary) {
        by_date.entry(q.resolution_date).or_default().push(q);
    }
    by_date
        .values()
        .flat_map(|group| group.chunks_exact(seeds.len()))
        .map(|chunk| {
            seeds
                .iter()
                .zip(chunk.iter())
                .map(|(name, q)| (name.to_string(), (*q).clone()))
                .collect()
        })
        .collect()
}
