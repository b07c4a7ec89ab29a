//! Checkers over a single base question: negation, paraphrase, consequence.

use super::{clamp01, CheckSettings, Checker, PlanStep, Slot};
use crate::instantiators::InstantiatorKind;

/// `P(not P) = 1 - P(P)`.
pub struct NegChecker;

impl Checker for NegChecker {
    fn name(&self) -> &'static str {
        "NegChecker"
    }

    fn slots(&self) -> &'static [Slot] {
        const SLOTS: &[Slot] = &[Slot::binary("P"), Slot::binary("not_P")];
        SLOTS
    }

    fn seed_slots(&self) -> &'static [&'static str] {
        &["P"]
    }

    fn plan(&self) -> &'static [PlanStep] {
        const PLAN: &[PlanStep] = &[PlanStep::new(InstantiatorKind::Neg, &["P"], "not_P")];
        PLAN
    }

    fn atoms(&self) -> usize {
        1
    }

    fn outcome(&self, slot: usize, world: &[bool]) -> Option<bool> {
        match slot {
            0 => Some(world[0]),
            _ => Some(!world[0]),
        }
    }

    fn residual(&self, x: &[f64]) -> f64 {
        x[0] + x[1] - 1.0
    }

    fn dims(&self) -> usize {
        1
    }

    fn realize(&self, theta: &[f64]) -> Vec<f64> {
        vec![theta[0], 1.0 - theta[0]]
    }

    fn guesses(&self, x: &[f64]) -> Vec<Vec<f64>> {
        vec![
            vec![x[0]],
            vec![clamp01(1.0 - x[1])],
            vec![clamp01((x[0] + 1.0 - x[1]) / 2.0)],
        ]
    }

    /// Any perturbation that fixes the sum moves the pair by the full
    /// residual, so the frequentist reading coincides with the default one.
    fn frequentist_violation(&self, x: &[f64], _settings: &CheckSettings) -> (f64, Vec<f64>) {
        let nearest = self.realize(&[clamp01((x[0] + 1.0 - x[1]) / 2.0)]);
        (self.default_violation(x), nearest)
    }
}

/// A paraphrase resolves exactly when the original does.
pub struct ParaphraseChecker;

impl Checker for ParaphraseChecker {
    fn name(&self) -> &'static str {
        "ParaphraseChecker"
    }

    fn slots(&self) -> &'static [Slot] {
        const SLOTS: &[Slot] = &[Slot::binary("P"), Slot::binary("para_P")];
        SLOTS
    }

    fn seed_slots(&self) -> &'static [&'static str] {
        &["P"]
    }

    fn plan(&self) -> &'static [PlanStep] {
        const PLAN: &[PlanStep] = &[PlanStep::new(InstantiatorKind::Paraphrase, &["P"], "para_P")];
        PLAN
    }

    fn atoms(&self) -> usize {
        1
    }

    fn outcome(&self, _slot: usize, world: &[bool]) -> Option<bool> {
        Some(world[0])
    }

    fn residual(&self, x: &[f64]) -> f64 {
        x[0] - x[1]
    }

    fn dims(&self) -> usize {
        1
    }

    fn realize(&self, theta: &[f64]) -> Vec<f64> {
        vec![theta[0], theta[0]]
    }

    fn guesses(&self, x: &[f64]) -> Vec<Vec<f64>> {
        vec![vec![(x[0] + x[1]) / 2.0], vec![x[0]], vec![x[1]]]
    }
}

/// `cons_P` is implied by P, so `P(P) <= P(cons_P)`.
pub struct ConsequenceChecker;

impl Checker for ConsequenceChecker {
    fn name(&self) -> &'static str {
        "ConsequenceChecker"
    }

    fn slots(&self) -> &'static [Slot] {
        const SLOTS: &[Slot] = &[Slot::binary("P"), Slot::binary("cons_P")];
        SLOTS
    }

    fn seed_slots(&self) -> &'static [&'static str] {
        &["P"]
    }

    fn plan(&self) -> &'static [PlanStep] {
        const PLAN: &[PlanStep] = &[PlanStep::new(InstantiatorKind::Consequence, &["P"], "cons_P")];
        PLAN
    }

    /// Atoms: P, cons_P.
    fn atoms(&self) -> usize {
        2
    }

    fn is_possible(&self, world: &[bool]) -> bool {
        !(world[0] && !world[1])
    }

    fn outcome(&self, slot: usize, world: &[bool]) -> Option<bool> {
        Some(world[slot])
    }

    fn residual(&self, x: &[f64]) -> f64 {
        x[0] - x[1]
    }

    fn default_violation(&self, x: &[f64]) -> f64 {
        self.residual(x).max(0.0)
    }

    fn dims(&self) -> usize {
        2
    }

    /// theta = (P(cons_P), P(P) / P(cons_P)).
    fn realize(&self, theta: &[f64]) -> Vec<f64> {
        vec![theta[0] * theta[1], theta[0]]
    }

    fn guesses(&self, x: &[f64]) -> Vec<Vec<f64>> {
        let ratio = |p: f64, c: f64| if c > 0.0 { clamp01(p / c) } else { 0.0 };
        let mid = (x[0] + x[1]) / 2.0;
        vec![
            vec![x[1], ratio(x[0], x[1])],
            vec![x[0], 1.0],
            vec![mid, 1.0],
        ]
    }
}
