//! Checkers with conditional slots. A conditional slot is void (its bets
//! are refunded) in worlds where its condition fails.

use super::{clamp01, Checker, PlanStep, Slot};
use crate::arbitrage::scoring::stable_product;
use crate::instantiators::InstantiatorKind;

fn ratio(num: f64, den: f64) -> f64 {
    if den > 0.0 {
        clamp01(num / den)
    } else {
        0.5
    }
}

/// `P(P) * P(Q | P) = P(P and Q)`.
pub struct CondChecker;

impl Checker for CondChecker {
    fn name(&self) -> &'static str {
        "CondChecker"
    }

    fn slots(&self) -> &'static [Slot] {
        const SLOTS: &[Slot] = &[
            Slot::binary("P"),
            Slot::conditional("Q_given_P"),
            Slot::binary("P_and_Q"),
        ];
        SLOTS
    }

    fn seed_slots(&self) -> &'static [&'static str] {
        &["P", "Q"]
    }

    fn plan(&self) -> &'static [PlanStep] {
        const PLAN: &[PlanStep] = &[
            PlanStep::new(InstantiatorKind::Conditional, &["P", "Q"], "Q_given_P"),
            PlanStep::new(InstantiatorKind::And, &["P", "Q"], "P_and_Q"),
        ];
        PLAN
    }

    fn atoms(&self) -> usize {
        2
    }

    fn outcome(&self, slot: usize, w: &[bool]) -> Option<bool> {
        match slot {
            0 => Some(w[0]),
            1 => w[0].then_some(w[1]),
            _ => Some(w[0] && w[1]),
        }
    }

    fn residual(&self, x: &[f64]) -> f64 {
        stable_product(&[x[0], x[1]]) - x[2]
    }

    fn dims(&self) -> usize {
        2
    }

    fn realize(&self, theta: &[f64]) -> Vec<f64> {
        vec![theta[0], theta[1], stable_product(&[theta[0], theta[1]])]
    }

    fn guesses(&self, x: &[f64]) -> Vec<Vec<f64>> {
        let mut guesses = vec![
            vec![x[0], x[1]],
            vec![x[0], ratio(x[2], x[0])],
            vec![ratio(x[2], x[1]), x[1]],
        ];
        // Split the residual in log space between the two factors
        if x[0] > 0.0 && x[1] > 0.0 && x[2] > 0.0 {
            let scale = (x[2] / (x[0] * x[1])).sqrt();
            guesses.push(vec![clamp01(x[0] * scale), clamp01(x[1] * scale)]);
        }
        guesses
    }
}

/// `P(P) * P(Q | P) * P(R | P and Q) = P(P and Q and R)`.
pub struct CondCondChecker;

impl Checker for CondCondChecker {
    fn name(&self) -> &'static str {
        "CondCondChecker"
    }

    fn slots(&self) -> &'static [Slot] {
        const SLOTS: &[Slot] = &[
            Slot::binary("P"),
            Slot::conditional("Q_given_P"),
            Slot::conditional("R_given_P_and_Q"),
            Slot::binary("P_and_Q_and_R"),
        ];
        SLOTS
    }

    fn seed_slots(&self) -> &'static [&'static str] {
        &["P", "Q", "R"]
    }

    fn plan(&self) -> &'static [PlanStep] {
        const PLAN: &[PlanStep] = &[
            PlanStep::new(InstantiatorKind::Conditional, &["P", "Q"], "Q_given_P"),
            PlanStep::new(InstantiatorKind::And, &["P", "Q"], "P_and_Q"),
            PlanStep::new(InstantiatorKind::Conditional, &["P_and_Q", "R"], "R_given_P_and_Q"),
            PlanStep::new(InstantiatorKind::And, &["P_and_Q", "R"], "P_and_Q_and_R"),
        ];
        PLAN
    }

    fn atoms(&self) -> usize {
        3
    }

    fn outcome(&self, slot: usize, w: &[bool]) -> Option<bool> {
        match slot {
            0 => Some(w[0]),
            1 => w[0].then_some(w[1]),
            2 => (w[0] && w[1]).then_some(w[2]),
            _ => Some(w[0] && w[1] && w[2]),
        }
    }

    fn residual(&self, x: &[f64]) -> f64 {
        stable_product(&[x[0], x[1], x[2]]) - x[3]
    }

    fn dims(&self) -> usize {
        3
    }

    fn realize(&self, theta: &[f64]) -> Vec<f64> {
        vec![
            theta[0],
            theta[1],
            theta[2],
            stable_product(&[theta[0], theta[1], theta[2]]),
        ]
    }

    fn guesses(&self, x: &[f64]) -> Vec<Vec<f64>> {
        let mut guesses = vec![
            vec![x[0], x[1], x[2]],
            vec![ratio(x[3], x[1] * x[2]), x[1], x[2]],
            vec![x[0], ratio(x[3], x[0] * x[2]), x[2]],
            vec![x[0], x[1], ratio(x[3], x[0] * x[1])],
        ];
        if x.iter().all(|v| *v > 0.0) {
            let scale = (x[3] / (x[0] * x[1] * x[2])).cbrt();
            guesses.push(vec![
                clamp01(x[0] * scale),
                clamp01(x[1] * scale),
                clamp01(x[2] * scale),
            ]);
        }
        guesses
    }
}

/// Law of total probability:
/// `P(Q) P(P | Q) + (1 - P(Q)) P(P | not Q) = P(P)`.
pub struct ExpectedEvidenceChecker;

impl Checker for ExpectedEvidenceChecker {
    fn name(&self) -> &'static str {
        "ExpectedEvidenceChecker"
    }

    fn slots(&self) -> &'static [Slot] {
        const SLOTS: &[Slot] = &[
            Slot::binary("P"),
            Slot::binary("Q"),
            Slot::conditional("P_given_Q"),
            Slot::conditional("P_given_not_Q"),
        ];
        SLOTS
    }

    fn seed_slots(&self) -> &'static [&'static str] {
        &["P", "Q"]
    }

    fn plan(&self) -> &'static [PlanStep] {
        const PLAN: &[PlanStep] = &[
            PlanStep::new(InstantiatorKind::Conditional, &["Q", "P"], "P_given_Q"),
            PlanStep::new(InstantiatorKind::Neg, &["Q"], "not_Q"),
            PlanStep::new(InstantiatorKind::Conditional, &["not_Q", "P"], "P_given_not_Q"),
        ];
        PLAN
    }

    fn atoms(&self) -> usize {
        2
    }

    fn outcome(&self, slot: usize, w: &[bool]) -> Option<bool> {
        match slot {
            0 => Some(w[0]),
            1 => Some(w[1]),
            2 => w[1].then_some(w[0]),
            _ => (!w[1]).then_some(w[0]),
        }
    }

    fn residual(&self, x: &[f64]) -> f64 {
        x[1] * x[2] + (1.0 - x[1]) * x[3] - x[0]
    }

    fn dims(&self) -> usize {
        3
    }

    /// theta = (P(Q), P(P | Q), P(P | not Q)).
    fn realize(&self, theta: &[f64]) -> Vec<f64> {
        let (q, given, given_not) = (theta[0], theta[1], theta[2]);
        vec![q * given + (1.0 - q) * given_not, q, given, given_not]
    }

    fn guesses(&self, x: &[f64]) -> Vec<Vec<f64>> {
        // Shift both conditionals by the residual so the mixture hits P
        let shift = x[0] - (x[1] * x[2] + (1.0 - x[1]) * x[3]);
        vec![
            vec![x[1], x[2], x[3]],
            vec![x[1], clamp01(x[2] + shift), clamp01(x[3] + shift)],
        ]
    }
}
