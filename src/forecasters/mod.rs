//! Forecasters: anything that maps a question to a probability.

pub mod consistent;

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::data::types::{Forecast, Question, QuestionType};
use crate::error::{ConsistencyError, Result};
use crate::llm::{DecodingParams, Example, GenerationRequest, ResponseSchema, TextGenerator};
use crate::monitoring::metrics;

pub use consistent::ConsistentForecaster;

#[async_trait]
pub trait Forecaster: Send + Sync {
    fn name(&self) -> String;

    async fn call(&self, question: &Question, params: &DecodingParams) -> Result<Forecast>;

    /// Blocking form of `call`. Must not be used from inside an async task.
    fn call_blocking(&self, question: &Question, params: &DecodingParams) -> Result<Forecast> {
        futures::executor::block_on(self.call(question, params))
    }
}

#[async_trait]
impl<F: Forecaster + ?Sized> Forecaster for Arc<F> {
    fn name(&self) -> String {
        (**self).name()
    }

    async fn call(&self, question: &Question, params: &DecodingParams) -> Result<Forecast> {
        (**self).call(question, params).await
    }
}

const FORECAST_PREFACE: &str = "You are an expert superforecaster. Read the question and its \
resolution criteria, reason about base rates and current evidence, then give the probability \
that the question resolves yes.";

fn forecast_prompt(question: &Question) -> String {
    let mut prompt = format!(
        "Question: {}\n\nResolution criteria: {}\n\nResolution date: {}",
        question.title,
        question.body,
        question.resolution_date.format("%Y-%m-%d")
    );
    if question.question_type == QuestionType::ConditionalBinary {
        prompt.push_str(
            "\n\nThis is a conditional question. Give the probability that it resolves yes \
             assuming its condition holds.",
        );
    }
    prompt
}

/// Asks a text generator for a probability directly.
pub struct LlmForecaster {
    generator: Arc<dyn TextGenerator>,
    preface: String,
    examples: Vec<Example>,
}

impl LlmForecaster {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self {
            generator,
            preface: FORECAST_PREFACE.to_string(),
            examples: Vec::new(),
        }
    }

    pub fn with_preface(mut self, preface: impl Into<String>) -> Self {
        self.preface = preface.into();
        self
    }

    pub fn with_examples(mut self, examples: Vec<Example>) -> Self {
        self.examples = examples;
        self
    }
}

#[async_trait]
impl Forecaster for LlmForecaster {
    fn name(&self) -> String {
        format!("LlmForecaster({})", self.generator.model())
    }

    async fn call(&self, question: &Question, params: &DecodingParams) -> Result<Forecast> {
        let request = GenerationRequest::new(forecast_prompt(question), ResponseSchema::probability())
            .with_preface(self.preface.clone())
            .with_examples(self.examples.clone())
            .with_params(params.clone());

        let answer = match self.generator.answer(&request).await {
            Ok(value) => request.schema.validate(&value).map(|_| value),
            Err(e) => Err(e),
        };
        let value = match answer {
            Ok(value) => value,
            Err(e @ (ConsistencyError::Schema(_) | ConsistencyError::Generator(_))) => {
                metrics::record_elicitation(false);
                return Err(ConsistencyError::ElicitationFailed {
                    question: question.id.clone(),
                    reason: e.to_string(),
                });
            }
            Err(e) => return Err(e),
        };

        let prob = value.get("prob").and_then(Value::as_f64).unwrap_or(f64::NAN);
        metrics::record_elicitation(true);
        Ok(Forecast::new(prob).with_metadata(json!({
            "model": self.generator.model(),
            "reasoning": value.get("reasoning").cloned().unwrap_or(Value::Null),
        })))
    }
}

/// Answers from a fixed table keyed by question title. Replays recorded
/// forecasts and stands in for a model where none should be called.
#[derive(Debug, Clone, Default)]
pub struct TableForecaster {
    table: HashMap<String, f64>,
    fallback: Option<f64>,
}

impl TableForecaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, title: impl Into<String>, prob: f64) -> Self {
        self.table.insert(title.into(), prob);
        self
    }

    /// Probability for titles not in the table.
    pub fn with_fallback(mut self, prob: f64) -> Self {
        self.fallback = Some(prob);
        self
    }
}

#[async_trait]
impl Forecaster for TableForecaster {
    fn name(&self) -> String {
        "TableForecaster".to_string()
    }

    async fn call(&self, question: &Question, _params: &DecodingParams) -> Result<Forecast> {
        self.table
            .get(&question.title)
            .copied()
            .or(self.fallback)
            .map(Forecast::new)
            .ok_or_else(|| ConsistencyError::ElicitationFailed {
                question: question.id.clone(),
                reason: format!("no recorded forecast for '{}'", question.title),
            })
    }
}
