//! Mini-instantiators: derive one question from one or two others through a
//! logical operation, then have the generator confirm the relation holds.

pub mod driver;
pub mod prompts;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::InstantiationConfig;
use crate::data::types::{InstantiationDiagnostic, Question, QuestionType};
use crate::error::{ConsistencyError, Result};
use crate::llm::{DecodingParams, GenerationRequest, ResponseSchema, TextGenerator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstantiatorKind {
    /// Identity; used when a slot is a base question itself.
    Trivial,
    Neg,
    And,
    Or,
    Conditional,
    Paraphrase,
    Consequence,
    /// A different question on a related event. Seeds checkers whose
    /// tuples need a second base question.
    Related,
}

impl InstantiatorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstantiatorKind::Trivial => "trivial",
            InstantiatorKind::Neg => "neg",
            InstantiatorKind::And => "and",
            InstantiatorKind::Or => "or",
            InstantiatorKind::Conditional => "conditional",
            InstantiatorKind::Paraphrase => "paraphrase",
            InstantiatorKind::Consequence => "consequence",
            InstantiatorKind::Related => "related",
        }
    }

    pub fn arity(&self) -> usize {
        match self {
            InstantiatorKind::And | InstantiatorKind::Or | InstantiatorKind::Conditional => 2,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsequenceFlavour {
    Quantity,
    Time,
    Misc,
}

impl ConsequenceFlavour {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsequenceFlavour::Quantity => "quantity",
            ConsequenceFlavour::Time => "time",
            ConsequenceFlavour::Misc => "misc",
        }
    }
}

/// A derived question and how it was obtained.
#[derive(Debug, Clone, PartialEq)]
pub struct Derived {
    pub question: Question,
    pub diagnostic: InstantiationDiagnostic,
}

#[derive(Debug, Clone)]
struct Verdict {
    valid: bool,
    score: f64,
    reasoning: String,
}

/// Resolution date of a derived question. Combinations take the latest
/// input date; a time-flavoured consequence may move later than P, never
/// earlier.
pub fn derived_resolution_date(
    kind: InstantiatorKind,
    inputs: &[&Question],
    proposed: Option<DateTime<Utc>>,
) -> DateTime<Utc> {
    let latest = inputs
        .iter()
        .map(|q| q.resolution_date)
        .max()
        .unwrap_or_else(Utc::now);
    match (kind, proposed) {
        (InstantiatorKind::Consequence, Some(date)) => date.max(latest),
        _ => latest,
    }
}

/// Resolution of a derived question when its inputs are already resolved.
pub fn derived_resolution(kind: InstantiatorKind, inputs: &[&Question]) -> Option<bool> {
    let p = inputs.first().and_then(|q| q.resolution);
    let q = inputs.get(1).and_then(|q| q.resolution);
    match kind {
        InstantiatorKind::Trivial | InstantiatorKind::Paraphrase => p,
        InstantiatorKind::Neg => p.map(|r| !r),
        InstantiatorKind::And => match (p, q) {
            (Some(false), _) | (_, Some(false)) => Some(false),
            (Some(true), Some(true)) => Some(true),
            _ => None,
        },
        InstantiatorKind::Or => match (p, q) {
            (Some(true), _) | (_, Some(true)) => Some(true),
            (Some(false), Some(false)) => Some(false),
            _ => None,
        },
        // Void when the condition fails
        InstantiatorKind::Conditional => match p {
            Some(true) => q,
            _ => None,
        },
        InstantiatorKind::Consequence => (p == Some(true)).then_some(true),
        InstantiatorKind::Related => None,
    }
}

fn retryable(error: &ConsistencyError) -> bool {
    matches!(
        error,
        ConsistencyError::Schema(_) | ConsistencyError::InvalidQuestion(_)
    )
}

pub struct Instantiator {
    generator: Arc<dyn TextGenerator>,
    config: InstantiationConfig,
    params: DecodingParams,
}

impl Instantiator {
    pub fn new(generator: Arc<dyn TextGenerator>, config: InstantiationConfig) -> Self {
        Self {
            generator,
            config,
            params: DecodingParams::default(),
        }
    }

    pub fn with_params(mut self, params: DecodingParams) -> Self {
        self.params = params;
        self
    }

    pub fn config(&self) -> &InstantiationConfig {
        &self.config
    }

    fn flavour_for(&self, attempt: u32) -> ConsequenceFlavour {
        let flavours = &self.config.consequence_flavours;
        if flavours.is_empty() {
            ConsequenceFlavour::Misc
        } else {
            flavours[(attempt as usize - 1) % flavours.len()]
        }
    }

    fn params_for(&self, attempt: u32) -> DecodingParams {
        // Later attempts must not be served the rejected cached answer
        if attempt > 1 {
            let base = self.params.seed.unwrap_or(0);
            self.params.clone().with_seed(base + u64::from(attempt) - 1)
        } else {
            self.params.clone()
        }
    }

    /// Derive one question of `kind` from `inputs`. Retries up to
    /// `max_attempts` times, feeding the last rejection back into the prompt.
    pub async fn derive(&self, kind: InstantiatorKind, inputs: &[&Question]) -> Result<Derived> {
        if inputs.len() != kind.arity() {
            return Err(ConsistencyError::InstantiationFailed {
                kind,
                reason: format!("expected {} inputs, got {}", kind.arity(), inputs.len()),
            });
        }

        if kind == InstantiatorKind::Trivial {
            return Ok(Derived {
                question: inputs[0].clone(),
                diagnostic: InstantiationDiagnostic {
                    output: inputs[0].id.clone(),
                    instantiator: kind.as_str().to_string(),
                    attempts: 0,
                    verification_score: 1.0,
                    reasoning: String::new(),
                },
            });
        }

        let mut feedback: Option<String> = None;
        for attempt in 1..=self.config.max_attempts.max(1) {
            let flavour = (kind == InstantiatorKind::Consequence).then(|| self.flavour_for(attempt));

            let candidate = match self.generate(kind, inputs, flavour, feedback.as_deref(), attempt).await {
                Ok(question) => question,
                Err(e) if retryable(&e) => {
                    warn!("{} attempt {} produced an unusable question: {}", kind.as_str(), attempt, e);
                    feedback = Some(e.to_string());
                    continue;
                }
                Err(e) => return Err(e),
            };

            let verdict = match self.verify(kind, inputs, &candidate, attempt).await {
                Ok(verdict) => verdict,
                Err(e) if retryable(&e) => {
                    warn!("{} attempt {} verification unreadable: {}", kind.as_str(), attempt, e);
                    feedback = Some(e.to_string());
                    continue;
                }
                Err(e) => return Err(e),
            };

            if verdict.valid && verdict.score >= self.config.verification_threshold {
                debug!(
                    "{} accepted '{}' on attempt {} (score {:.2})",
                    kind.as_str(),
                    candidate.title,
                    attempt,
                    verdict.score
                );
                return Ok(Derived {
                    diagnostic: InstantiationDiagnostic {
                        output: candidate.id.clone(),
                        instantiator: kind.as_str().to_string(),
                        attempts: attempt,
                        verification_score: verdict.score,
                        reasoning: verdict.reasoning,
                    },
                    question: candidate,
                });
            }

            debug!(
                "{} rejected '{}' on attempt {} (valid {}, score {:.2})",
                kind.as_str(),
                candidate.title,
                attempt,
                verdict.valid,
                verdict.score
            );
            feedback = Some(if verdict.reasoning.is_empty() {
                format!("verification score {:.2} below {:.2}", verdict.score, self.config.verification_threshold)
            } else {
                verdict.reasoning
            });
        }

        Err(ConsistencyError::InstantiationFailed {
            kind,
            reason: format!(
                "no candidate passed verification in {} attempts (last: {})",
                self.config.max_attempts.max(1),
                feedback.unwrap_or_default()
            ),
        })
    }

    /// `derive` over many input bundles, at most `batch_concurrency` in
    /// flight. Results come back in input order.
    pub async fn derive_batch(&self, kind: InstantiatorKind, bundles: &[Vec<Question>]) -> Vec<Result<Derived>> {
        stream::iter(bundles)
            .map(|bundle| async move {
                let inputs: Vec<&Question> = bundle.iter().collect();
                self.derive(kind, &inputs).await
            })
            .buffered(self.config.batch_concurrency.max(1))
            .collect()
            .await
    }

    async fn generate(
        &self,
        kind: InstantiatorKind,
        inputs: &[&Question],
        flavour: Option<ConsequenceFlavour>,
        feedback: Option<&str>,
        attempt: u32,
    ) -> Result<Question> {
        let schema = if kind == InstantiatorKind::Consequence {
            ResponseSchema::dated_question()
        } else {
            ResponseSchema::question()
        };
        let request = GenerationRequest::new(prompts::generation_prompt(kind, inputs, flavour, feedback), schema)
            .with_preface(prompts::GENERATION_PREFACE)
            .with_params(self.params_for(attempt));

        let value = self.generator.answer(&request).await?;
        request.schema.validate(&value)?;

        let title = text_field(&value, "title")?;
        let body = text_field(&value, "body")?;
        let proposed = match value.get("resolution_date").and_then(Value::as_str) {
            Some(raw) => Some(
                DateTime::parse_from_rfc3339(raw)
                    .map_err(|e| ConsistencyError::Schema(format!("resolution_date '{}': {}", raw, e)))?
                    .with_timezone(&Utc),
            ),
            None => None,
        };

        let question_type = if kind == InstantiatorKind::Conditional {
            QuestionType::ConditionalBinary
        } else {
            QuestionType::Binary
        };
        let mut question = Question::new(
            title,
            body,
            question_type,
            derived_resolution_date(kind, inputs, proposed),
        );
        question.created_date = inputs.iter().filter_map(|q| q.created_date).max();
        question.resolution = derived_resolution(kind, inputs);
        question.metadata.insert("instantiator".to_string(), json!(kind.as_str()));
        question.metadata.insert(
            "parents".to_string(),
            json!(inputs.iter().map(|q| q.id.as_str()).collect::<Vec<_>>()),
        );
        if let Some(flavour) = flavour {
            question
                .metadata
                .insert("consequence_flavour".to_string(), json!(flavour.as_str()));
        }
        question.validate()?;
        Ok(question)
    }

    async fn verify(&self, kind: InstantiatorKind, inputs: &[&Question], derived: &Question, attempt: u32) -> Result<Verdict> {
        let request = GenerationRequest::new(
            prompts::verification_prompt(kind, inputs, derived),
            ResponseSchema::verification(),
        )
        .with_preface(prompts::VERIFICATION_PREFACE)
        .with_params(self.params_for(attempt));

        let value = self.generator.answer(&request).await?;
        request.schema.validate(&value)?;
        Ok(Verdict {
            valid: value.get("valid").and_then(Value::as_bool).unwrap_or(false),
            score: value.get("score").and_then(Value::as_f64).unwrap_or(0.0),
            reasoning: value
                .get("reasoning")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        })
    }
}

fn text_field(value: &Value, name: &str) -> Result<String> {
    value
        .get(name)
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .ok_or_else(|| ConsistencyError::Schema(format!("missing string field '{}'", name)))
}
