use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{ConsistencyError, Result};

/// Slot name -> probability. Sorted keys keep serialisation stable across runs.
pub type Probabilities = BTreeMap<String, f64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
    Binary,
    ConditionalBinary,
}

impl QuestionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuestionType::Binary => "binary",
            QuestionType::ConditionalBinary => "conditional_binary",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    pub title: String,
    pub body: String,
    pub question_type: QuestionType,
    pub resolution_date: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_date: Option<DateTime<Utc>>,
    /// `None` while unresolved or unknown.
    #[serde(default)]
    pub resolution: Option<bool>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Question {
    pub fn new(
        title: impl Into<String>,
        body: impl Into<String>,
        question_type: QuestionType,
        resolution_date: DateTime<Utc>,
    ) -> Self {
        let title = title.into();
        let body = body.into();
        let id = Self::compute_id(&title, &body, question_type, &resolution_date);
        Self {
            id,
            title,
            body,
            question_type,
            resolution_date,
            created_date: None,
            resolution: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn binary(title: impl Into<String>, body: impl Into<String>, resolution_date: DateTime<Utc>) -> Self {
        Self::new(title, body, QuestionType::Binary, resolution_date)
    }

    pub fn with_created_date(mut self, created: DateTime<Utc>) -> Self {
        self.created_date = Some(created);
        self
    }

    /// Content hash over the fields that define the question.
    pub fn compute_id(
        title: &str,
        body: &str,
        question_type: QuestionType,
        resolution_date: &DateTime<Utc>,
    ) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(title.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(body.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(question_type.as_str().as_bytes());
        hasher.update(b"\x1f");
        hasher.update(resolution_date.to_rfc3339().as_bytes());
        hasher.finalize().to_hex()[..32].to_string()
    }

    /// Check the structural invariants of a question.
    pub fn validate(&self) -> Result<()> {
        if self.title.trim().is_empty() {
            return Err(ConsistencyError::InvalidQuestion("empty title".to_string()));
        }
        if self.body.trim().is_empty() {
            return Err(ConsistencyError::InvalidQuestion(format!(
                "empty body for '{}'",
                self.title
            )));
        }
        if let Some(created) = self.created_date {
            if self.resolution_date < created {
                return Err(ConsistencyError::InvalidQuestion(format!(
                    "resolution date {} precedes created date {} for '{}'",
                    self.resolution_date, created, self.title
                )));
            }
        }
        let expected = Self::compute_id(&self.title, &self.body, self.question_type, &self.resolution_date);
        if self.id != expected {
            return Err(ConsistencyError::InvalidQuestion(format!(
                "id {} does not match content of '{}'",
                self.id, self.title
            )));
        }
        Ok(())
    }
}

/// A forecaster's answer on one question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forecast {
    pub prob: f64,
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Intermediate estimates left by wrapping forecasters, outermost pass last.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trail: Vec<TrailStep>,
}

impl Forecast {
    pub fn new(prob: f64) -> Self {
        Self {
            prob,
            metadata: serde_json::Value::Null,
            trail: Vec::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// One checker pass of a consistent forecaster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrailStep {
    pub checker: String,
    pub depth: usize,
    pub prior_prob: f64,
    pub focal_weight: f64,
    pub other_answers: Probabilities,
    pub consistent_probs: Probabilities,
    pub regret: f64,
    pub posterior_prob: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstantiationDiagnostic {
    pub output: String,
    pub instantiator: String,
    pub attempts: u32,
    pub verification_score: f64,
    #[serde(default)]
    pub reasoning: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TupleMetadata {
    #[serde(default)]
    pub checker: String,
    #[serde(default)]
    pub base_sentences: BTreeMap<String, Question>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub intermediates: BTreeMap<String, Question>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<InstantiationDiagnostic>,
}

/// Slot name -> question, plus provenance. One line of a tuple file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastTuple {
    #[serde(flatten)]
    pub slots: BTreeMap<String, Question>,
    pub metadata: TupleMetadata,
}

impl ForecastTuple {
    pub fn new(slots: BTreeMap<String, Question>, metadata: TupleMetadata) -> Self {
        Self { slots, metadata }
    }

    pub fn get(&self, slot: &str) -> Option<&Question> {
        self.slots.get(slot)
    }
}
