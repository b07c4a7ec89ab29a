//! Max-min arbitrage: the consistent quote that minimises the worst-case
//! log-score regret against a forecaster's answers.

pub mod scoring;
pub mod solver;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::SolverConfig;
use crate::error::{ConsistencyError, Result};
use scoring::{worst_case_regret, WorldTable};

/// Weight of the L2 pull towards the answers. Only breaks ties between
/// quotes with equal worst-case regret.
const TIE_BREAK_WEIGHT: f64 = 1e-8;

/// Tolerance for recognising answers that are already consistent.
const MEMBERSHIP_TOLERANCE: f64 = 1e-9;

/// A feasibility set S over slot vectors, given by an exact map from the
/// unit box onto S plus the world table of the underlying atomic events.
pub trait ConsistencySet {
    fn slot_count(&self) -> usize;

    /// Number of free coordinates of the parameterisation.
    fn free_dims(&self) -> usize;

    /// Map `theta` in `[0, 1]^free_dims` to a slot vector in S.
    fn embed(&self, theta: &[f64]) -> Vec<f64>;

    /// Parameter guesses whose images lie close to `x`. If `x` is in S at
    /// least one guess maps back onto it exactly.
    fn seeds_for(&self, x: &[f64]) -> Vec<Vec<f64>>;

    /// Slot outcomes in every possible world.
    fn world_table(&self) -> WorldTable;

    /// Distance of `x` from satisfying the invariant; 0 inside S.
    fn invariant_gap(&self, x: &[f64]) -> f64;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbitrageSettings {
    pub clip_epsilon: f64,
    pub feasibility_tolerance: f64,
    pub solver: SolverConfig,
}

impl Default for ArbitrageSettings {
    fn default() -> Self {
        Self {
            clip_epsilon: 1e-6,
            feasibility_tolerance: 1e-4,
            solver: SolverConfig::default(),
        }
    }
}

/// Solution in slot order.
#[derive(Debug, Clone, PartialEq)]
pub struct Solution {
    pub probs: Vec<f64>,
    /// Profit guaranteed in every world by trading from the answers to
    /// `probs`; equivalently the answers' regret against `probs`.
    pub regret: f64,
    pub iterations: usize,
    pub converged: bool,
}

/// Closest point of S to `x` among the seeds, if any seed reproduces `x`.
pub fn membership<S: ConsistencySet + ?Sized>(set: &S, x: &[f64], tolerance: f64) -> Option<Vec<f64>> {
    set.seeds_for(x).into_iter().find(|theta| {
        set.embed(theta)
            .iter()
            .zip(x)
            .all(|(a, b)| (a - b).abs() <= tolerance)
    })
}

pub fn validate_inputs(answers: &[f64], weights: &[f64]) -> Result<()> {
    if answers.len() != weights.len() {
        return Err(ConsistencyError::ArbitrageInfeasible(format!(
            "{} answers but {} weights",
            answers.len(),
            weights.len()
        )));
    }
    if let Some(bad) = answers.iter().find(|a| !a.is_finite() || !(0.0..=1.0).contains(*a)) {
        return Err(ConsistencyError::ArbitrageInfeasible(format!(
            "answer {} outside [0, 1]",
            bad
        )));
    }
    if let Some(bad) = weights.iter().find(|w| !w.is_finite() || **w < 0.0) {
        return Err(ConsistencyError::ArbitrageInfeasible(format!("invalid weight {}", bad)));
    }
    Ok(())
}

/// Solve `argmin_{x in S} max_w sum_i w_i r_i(x_i, a_i; w)`.
pub fn solve<S: ConsistencySet + ?Sized>(
    set: &S,
    answers: &[f64],
    weights: &[f64],
    settings: &ArbitrageSettings,
) -> Result<Solution> {
    if answers.len() != set.slot_count() {
        return Err(ConsistencyError::ArbitrageInfeasible(format!(
            "expected {} answers, got {}",
            set.slot_count(),
            answers.len()
        )));
    }
    validate_inputs(answers, weights)?;

    if membership(set, answers, MEMBERSHIP_TOLERANCE).is_some() {
        debug!("Answers already consistent, arbitrage is the identity");
        return Ok(Solution {
            probs: answers.to_vec(),
            regret: 0.0,
            iterations: 0,
            converged: true,
        });
    }

    let eps = settings.clip_epsilon;
    let table = set.world_table();
    let objective = |theta: &[f64]| {
        let x = set.embed(theta);
        let pull: f64 = x.iter().zip(answers).map(|(xi, ai)| (xi - ai).powi(2)).sum();
        worst_case_regret(&table, &x, answers, weights, eps) + TIE_BREAK_WEIGHT * pull
    };

    let mut seeds = set.seeds_for(answers);
    seeds.push(vec![0.5; set.free_dims()]);
    let optimum = solver::minimize(objective, set.free_dims(), &seeds, &settings.solver);

    let probs = set.embed(&optimum.x);
    let gap = set.invariant_gap(&probs);
    let out_of_box = probs.iter().any(|p| !(0.0..=1.0).contains(p));
    if gap > settings.feasibility_tolerance || out_of_box {
        return Err(ConsistencyError::InvariantViolated {
            checker: "arbitrage".to_string(),
            residual: gap,
        });
    }

    let regret = -worst_case_regret(&table, &probs, answers, weights, eps);
    if !optimum.converged {
        warn!(
            "Arbitrage solver stopped after {} iterations without converging (regret {:.6})",
            optimum.iterations, regret
        );
    }

    Ok(Solution {
        probs,
        regret,
        iterations: optimum.iterations,
        converged: optimum.converged,
    })
}
