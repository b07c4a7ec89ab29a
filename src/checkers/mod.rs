//! Logical consistency checkers.
//!
//! Each checker names a slot schema, the instantiator plan that builds a
//! tuple for it, the event algebra behind its slots, an invariant over the
//! slot probabilities, and an exact parameterisation of the set of
//! consistent probability vectors. Arbitrage and the frequentist metric are
//! derived from those pieces.

pub mod boolean;
pub mod conditional;
pub mod frequentist;
pub mod pipeline;
pub mod unary;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::arbitrage::scoring::WorldTable;
use crate::arbitrage::{self, ArbitrageSettings, ConsistencySet};
use crate::config::{ChecksConfig, SolverConfig};
use crate::data::types::{Probabilities, QuestionType};
use crate::error::{ConsistencyError, Result};
use crate::instantiators::InstantiatorKind;

pub use pipeline::{elicit, instantiate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub name: &'static str,
    pub question_type: QuestionType,
}

impl Slot {
    pub const fn binary(name: &'static str) -> Self {
        Self {
            name,
            question_type: QuestionType::Binary,
        }
    }

    pub const fn conditional(name: &'static str) -> Self {
        Self {
            name,
            question_type: QuestionType::ConditionalBinary,
        }
    }
}

/// One instantiator application inside a tuple plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanStep {
    pub kind: InstantiatorKind,
    pub inputs: &'static [&'static str],
    pub output: &'static str,
}

impl PlanStep {
    pub const fn new(kind: InstantiatorKind, inputs: &'static [&'static str], output: &'static str) -> Self {
        Self { kind, inputs, output }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Invariant residual (unsigned).
    Default,
    /// L-infinity distance to the probability vectors some joint
    /// distribution realises.
    Frequentist,
    /// Guaranteed log-score profit of the max-min arbitrage, unit weights.
    Arbitrage,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Default => "default",
            Metric::Frequentist => "frequentist",
            Metric::Arbitrage => "arbitrage",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckSettings {
    pub violation_threshold: f64,
    pub arbitrage: ArbitrageSettings,
}

impl CheckSettings {
    pub fn from_config(checks: &ChecksConfig, solver: &SolverConfig) -> Self {
        Self {
            violation_threshold: checks.violation_threshold,
            arbitrage: ArbitrageSettings {
                clip_epsilon: checks.clip_epsilon,
                feasibility_tolerance: checks.feasibility_tolerance,
                solver: solver.clone(),
            },
        }
    }
}

impl Default for CheckSettings {
    fn default() -> Self {
        Self {
            violation_threshold: 1e-3,
            arbitrage: ArbitrageSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Signed invariant residual; the default metric is its magnitude.
    pub residual: f64,
    /// Closest consistent vector found, for the metrics that search for one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nearest: Option<Probabilities>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub violation: f64,
    #[serde(rename = "check")]
    pub is_violation: bool,
    pub diagnostic: Diagnostic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArbitrageResult {
    pub consistent_probs: Probabilities,
    pub regret: f64,
    pub iterations: usize,
    pub converged: bool,
}

pub trait Checker: Send + Sync {
    fn name(&self) -> &'static str;

    fn slots(&self) -> &'static [Slot];

    /// Base questions the tuple is built from, e.g. `["P", "Q"]`.
    fn seed_slots(&self) -> &'static [&'static str];

    /// Instantiator steps, in dependency order.
    fn plan(&self) -> &'static [PlanStep];

    /// Number of atomic events behind the slots.
    fn atoms(&self) -> usize;

    /// Whether an assignment of the atoms can happen at all.
    fn is_possible(&self, _world: &[bool]) -> bool {
        true
    }

    /// Truth value of slot `slot` in `world`; `None` when the slot is a
    /// conditional whose condition failed.
    fn outcome(&self, slot: usize, world: &[bool]) -> Option<bool>;

    /// Signed invariant residual.
    fn residual(&self, x: &[f64]) -> f64;

    fn default_violation(&self, x: &[f64]) -> f64 {
        self.residual(x).abs()
    }

    /// Free coordinates of the consistent set.
    fn dims(&self) -> usize;

    /// Consistent slot vector for `theta` in the unit box.
    fn realize(&self, theta: &[f64]) -> Vec<f64>;

    /// Parameter guesses near `x`; exact when `x` is consistent.
    fn guesses(&self, x: &[f64]) -> Vec<Vec<f64>>;

    fn frequentist_violation(&self, x: &[f64], settings: &CheckSettings) -> (f64, Vec<f64>) {
        frequentist::linf_distance(self, x, &settings.arbitrage.solver)
    }

    fn slot_index(&self, name: &str) -> Option<usize> {
        self.slots().iter().position(|s| s.name == name)
    }

    /// Slot-ordered values from a probability map.
    fn values(&self, probs: &Probabilities) -> Result<Vec<f64>> {
        self.slots()
            .iter()
            .map(|slot| {
                let p = *probs.get(slot.name).ok_or_else(|| ConsistencyError::MissingSlot {
                    checker: self.name().to_string(),
                    slot: slot.name.to_string(),
                })?;
                if !p.is_finite() || !(0.0..=1.0).contains(&p) {
                    return Err(ConsistencyError::ElicitationFailed {
                        question: slot.name.to_string(),
                        reason: format!("{} is not a probability", p),
                    });
                }
                Ok(p)
            })
            .collect()
    }

    fn to_probabilities(&self, x: &[f64]) -> Probabilities {
        self.slots()
            .iter()
            .zip(x)
            .map(|(slot, p)| (slot.name.to_string(), *p))
            .collect()
    }

    /// Evaluate `probs` under `metric`.
    fn check(&self, probs: &Probabilities, metric: Metric, settings: &CheckSettings) -> Result<CheckResult> {
        let x = self.values(probs)?;
        let residual = self.residual(&x);
        let (violation, nearest) = match metric {
            Metric::Default => (self.default_violation(&x), None),
            Metric::Frequentist => {
                let (distance, nearest) = self.frequentist_violation(&x, settings);
                (distance, Some(self.to_probabilities(&nearest)))
            }
            Metric::Arbitrage => {
                let weights = vec![1.0; x.len()];
                let solution = arbitrage::solve(self, &x, &weights, &settings.arbitrage)?;
                (solution.regret.max(0.0), Some(self.to_probabilities(&solution.probs)))
            }
        };
        Ok(CheckResult {
            violation,
            is_violation: violation > settings.violation_threshold,
            diagnostic: Diagnostic { residual, nearest },
        })
    }

    /// Consistent probabilities nearest to `answers` in worst-case
    /// log-score regret. Slots missing from `weights` weigh 1.
    fn max_min_arbitrage(
        &self,
        answers: &Probabilities,
        weights: &Probabilities,
        settings: &CheckSettings,
    ) -> Result<ArbitrageResult> {
        let a = self.values(answers).map_err(|e| match e {
            ConsistencyError::ElicitationFailed { reason, .. } => ConsistencyError::ArbitrageInfeasible(reason),
            other => other,
        })?;
        let w: Vec<f64> = self
            .slots()
            .iter()
            .map(|slot| weights.get(slot.name).copied().unwrap_or(1.0))
            .collect();
        let solution = arbitrage::solve(self, &a, &w, &settings.arbitrage).map_err(|e| match e {
            ConsistencyError::InvariantViolated { residual, .. } => ConsistencyError::InvariantViolated {
                checker: self.name().to_string(),
                residual,
            },
            other => other,
        })?;
        Ok(ArbitrageResult {
            consistent_probs: self.to_probabilities(&solution.probs),
            regret: solution.regret,
            iterations: solution.iterations,
            converged: solution.converged,
        })
    }
}

impl<T: Checker + ?Sized> ConsistencySet for T {
    fn slot_count(&self) -> usize {
        self.slots().len()
    }

    fn free_dims(&self) -> usize {
        self.dims()
    }

    fn embed(&self, theta: &[f64]) -> Vec<f64> {
        self.realize(theta)
    }

    fn seeds_for(&self, x: &[f64]) -> Vec<Vec<f64>> {
        self.guesses(x)
    }

    fn world_table(&self) -> WorldTable {
        let atoms = self.atoms();
        let rows = (0..(1u32 << atoms))
            .map(|mask| (0..atoms).map(|i| mask & (1 << i) != 0).collect::<Vec<bool>>())
            .filter(|world| self.is_possible(world))
            .map(|world| {
                (0..self.slots().len())
                    .map(|slot| self.outcome(slot, &world))
                    .collect()
            })
            .collect();
        WorldTable::new(rows)
    }

    fn invariant_gap(&self, x: &[f64]) -> f64 {
        self.default_violation(x)
    }
}

/// `(x - lo) / (hi - lo)` clamped to the unit interval; midpoint when the
/// interval is degenerate.
pub(crate) fn unit_position(x: f64, lo: f64, hi: f64) -> f64 {
    if hi - lo <= f64::EPSILON {
        0.5
    } else {
        ((x - lo) / (hi - lo)).clamp(0.0, 1.0)
    }
}

/// Signed distance of `x` from `[lo, hi]`: positive above, negative below.
pub(crate) fn interval_residual(x: f64, lo: f64, hi: f64) -> f64 {
    if x > hi {
        x - hi
    } else if x < lo {
        x - lo
    } else {
        0.0
    }
}

pub(crate) fn clamp01(x: f64) -> f64 {
    x.clamp(0.0, 1.0)
}

/// The closed list of checkers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CheckerKind {
    Neg,
    And,
    Or,
    AndOr,
    But,
    Cond,
    CondCond,
    Consequence,
    Paraphrase,
    ExpectedEvidence,
    SymmetryAnd,
    SymmetryOr,
}

impl CheckerKind {
    pub fn all() -> &'static [CheckerKind] {
        &[
            CheckerKind::Neg,
            CheckerKind::And,
            CheckerKind::Or,
            CheckerKind::AndOr,
            CheckerKind::But,
            CheckerKind::Cond,
            CheckerKind::CondCond,
            CheckerKind::Consequence,
            CheckerKind::Paraphrase,
            CheckerKind::ExpectedEvidence,
            CheckerKind::SymmetryAnd,
            CheckerKind::SymmetryOr,
        ]
    }

    pub fn checker(&self) -> &'static dyn Checker {
        match self {
            CheckerKind::Neg => &unary::NegChecker,
            CheckerKind::And => &boolean::AndChecker,
            CheckerKind::Or => &boolean::OrChecker,
            CheckerKind::AndOr => &boolean::AndOrChecker,
            CheckerKind::But => &boolean::ButChecker,
            CheckerKind::Cond => &conditional::CondChecker,
            CheckerKind::CondCond => &conditional::CondCondChecker,
            CheckerKind::Consequence => &unary::ConsequenceChecker,
            CheckerKind::Paraphrase => &unary::ParaphraseChecker,
            CheckerKind::ExpectedEvidence => &conditional::ExpectedEvidenceChecker,
            CheckerKind::SymmetryAnd => &boolean::SymmetryAndChecker,
            CheckerKind::SymmetryOr => &boolean::SymmetryOrChecker,
        }
    }

    pub fn name(&self) -> &'static str {
        self.checker().name()
    }

    /// Accepts `NegChecker`, `Neg` or `neg`.
    pub fn from_name(name: &str) -> Result<Self> {
        let wanted = name.trim().to_lowercase();
        let wanted = wanted.strip_suffix("checker").unwrap_or(&wanted);
        Self::all()
            .iter()
            .copied()
            .find(|kind| {
                let own = kind.name().to_lowercase();
                own.strip_suffix("checker").unwrap_or(&own) == wanted
            })
            .ok_or_else(|| ConsistencyError::UnknownChecker(name.to_string()))
    }

    pub fn parse_list(names: &[String]) -> Result<Vec<Self>> {
        names.iter().map(|n| Self::from_name(n)).collect()
    }
}

/// Helper for tests and callers that build probability maps inline.
pub fn probs(entries: &[(&str, f64)]) -> Probabilities {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), *v))
        .collect::<BTreeMap<_, _>>()
}
