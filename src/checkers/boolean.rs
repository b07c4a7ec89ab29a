//! Checkers over two base questions joined by conjunction or disjunction.

use super::{clamp01, interval_residual, unit_position, Checker, PlanStep, Slot};
use crate::instantiators::InstantiatorKind;

/// Frechet bounds on `P(P and Q)`.
fn and_bounds(p: f64, q: f64) -> (f64, f64) {
    ((p + q - 1.0).max(0.0), p.min(q))
}

/// Frechet bounds on `P(P or Q)`.
fn or_bounds(p: f64, q: f64) -> (f64, f64) {
    (p.max(q), (p + q).min(1.0))
}

pub struct AndChecker;

impl Checker for AndChecker {
    fn name(&self) -> &'static str {
        "AndChecker"
    }

    fn slots(&self) -> &'static [Slot] {
        const SLOTS: &[Slot] = &[Slot::binary("P"), Slot::binary("Q"), Slot::binary("P_and_Q")];
        SLOTS
    }

    fn seed_slots(&self) -> &'static [&'static str] {
        &["P", "Q"]
    }

    fn plan(&self) -> &'static [PlanStep] {
        const PLAN: &[PlanStep] = &[PlanStep::new(InstantiatorKind::And, &["P", "Q"], "P_and_Q")];
        PLAN
    }

    fn atoms(&self) -> usize {
        2
    }

    fn outcome(&self, slot: usize, w: &[bool]) -> Option<bool> {
        match slot {
            0 => Some(w[0]),
            1 => Some(w[1]),
            _ => Some(w[0] && w[1]),
        }
    }

    fn residual(&self, x: &[f64]) -> f64 {
        let (lo, hi) = and_bounds(x[0], x[1]);
        interval_residual(x[2], lo, hi)
    }

    fn dims(&self) -> usize {
        3
    }

    fn realize(&self, theta: &[f64]) -> Vec<f64> {
        let (p, q) = (theta[0], theta[1]);
        let (lo, hi) = and_bounds(p, q);
        vec![p, q, lo + theta[2] * (hi - lo)]
    }

    fn guesses(&self, x: &[f64]) -> Vec<Vec<f64>> {
        let (lo, hi) = and_bounds(x[0], x[1]);
        let mut guesses = vec![vec![x[0], x[1], unit_position(x[2], lo, hi)]];
        // Raise both marginals to cover an oversized conjunction
        let (p, q) = (x[0].max(x[2]), x[1].max(x[2]));
        let (lo, hi) = and_bounds(p, q);
        guesses.push(vec![p, q, unit_position(x[2], lo, hi)]);
        guesses
    }
}

pub struct OrChecker;

impl Checker for OrChecker {
    fn name(&self) -> &'static str {
        "OrChecker"
    }

    fn slots(&self) -> &'static [Slot] {
        const SLOTS: &[Slot] = &[Slot::binary("P"), Slot::binary("Q"), Slot::binary("P_or_Q")];
        SLOTS
    }

    fn seed_slots(&self) -> &'static [&'static str] {
        &["P", "Q"]
    }

    fn plan(&self) -> &'static [PlanStep] {
        const PLAN: &[PlanStep] = &[PlanStep::new(InstantiatorKind::Or, &["P", "Q"], "P_or_Q")];
        PLAN
    }

    fn atoms(&self) -> usize {
        2
    }

    fn outcome(&self, slot: usize, w: &[bool]) -> Option<bool> {
        match slot {
            0 => Some(w[0]),
            1 => Some(w[1]),
            _ => Some(w[0] || w[1]),
        }
    }

    fn residual(&self, x: &[f64]) -> f64 {
        let (lo, hi) = or_bounds(x[0], x[1]);
        interval_residual(x[2], lo, hi)
    }

    fn dims(&self) -> usize {
        3
    }

    fn realize(&self, theta: &[f64]) -> Vec<f64> {
        let (p, q) = (theta[0], theta[1]);
        let (lo, hi) = or_bounds(p, q);
        vec![p, q, lo + theta[2] * (hi - lo)]
    }

    fn guesses(&self, x: &[f64]) -> Vec<Vec<f64>> {
        let (lo, hi) = or_bounds(x[0], x[1]);
        let mut guesses = vec![vec![x[0], x[1], unit_position(x[2], lo, hi)]];
        let (p, q) = (x[0].min(x[2]), x[1].min(x[2]));
        let (lo, hi) = or_bounds(p, q);
        guesses.push(vec![p, q, unit_position(x[2], lo, hi)]);
        guesses
    }
}

/// `P(P) + P(Q) = P(P and Q) + P(P or Q)`.
pub struct AndOrChecker;

impl Checker for AndOrChecker {
    fn name(&self) -> &'static str {
        "AndOrChecker"
    }

    fn slots(&self) -> &'static [Slot] {
        const SLOTS: &[Slot] = &[
            Slot::binary("P"),
            Slot::binary("Q"),
            Slot::binary("P_and_Q"),
            Slot::binary("P_or_Q"),
        ];
        SLOTS
    }

    fn seed_slots(&self) -> &'static [&'static str] {
        &["P", "Q"]
    }

    fn plan(&self) -> &'static [PlanStep] {
        const PLAN: &[PlanStep] = &[
            PlanStep::new(InstantiatorKind::And, &["P", "Q"], "P_and_Q"),
            PlanStep::new(InstantiatorKind::Or, &["P", "Q"], "P_or_Q"),
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
            2 => Some(w[0] && w[1]),
            _ => Some(w[0] || w[1]),
        }
    }

    fn residual(&self, x: &[f64]) -> f64 {
        x[0] + x[1] - x[2] - x[3]
    }

    fn dims(&self) -> usize {
        3
    }

    fn realize(&self, theta: &[f64]) -> Vec<f64> {
        let (p, q) = (theta[0], theta[1]);
        let (lo, hi) = and_bounds(p, q);
        let both = lo + theta[2] * (hi - lo);
        vec![p, q, both, p + q - both]
    }

    fn guesses(&self, x: &[f64]) -> Vec<Vec<f64>> {
        let (lo, hi) = and_bounds(x[0], x[1]);
        let implied_and = x[0] + x[1] - x[3];
        let split = (x[2] + implied_and) / 2.0;
        vec![
            vec![x[0], x[1], unit_position(x[2], lo, hi)],
            vec![x[0], x[1], unit_position(implied_and, lo, hi)],
            vec![x[0], x[1], unit_position(split, lo, hi)],
        ]
    }
}

/// `P(P) + P(Q and not P) = P(P or Q)`.
pub struct ButChecker;

impl Checker for ButChecker {
    fn name(&self) -> &'static str {
        "ButChecker"
    }

    fn slots(&self) -> &'static [Slot] {
        const SLOTS: &[Slot] = &[
            Slot::binary("P"),
            Slot::binary("Q_and_not_P"),
            Slot::binary("P_or_Q"),
        ];
        SLOTS
    }

    fn seed_slots(&self) -> &'static [&'static str] {
        &["P", "Q"]
    }

    fn plan(&self) -> &'static [PlanStep] {
        const PLAN: &[PlanStep] = &[
            PlanStep::new(InstantiatorKind::Neg, &["P"], "not_P"),
            PlanStep::new(InstantiatorKind::And, &["Q", "not_P"], "Q_and_not_P"),
            PlanStep::new(InstantiatorKind::Or, &["P", "Q"], "P_or_Q"),
        ];
        PLAN
    }

    fn atoms(&self) -> usize {
        2
    }

    fn outcome(&self, slot: usize, w: &[bool]) -> Option<bool> {
        match slot {
            0 => Some(w[0]),
            1 => Some(w[1] && !w[0]),
            _ => Some(w[0] || w[1]),
        }
    }

    fn residual(&self, x: &[f64]) -> f64 {
        x[0] + x[1] - x[2]
    }

    fn dims(&self) -> usize {
        2
    }

    /// theta = (P(P), P(Q | not P)).
    fn realize(&self, theta: &[f64]) -> Vec<f64> {
        let p = theta[0];
        let q_only = theta[1] * (1.0 - p);
        vec![p, q_only, p + q_only]
    }

    fn guesses(&self, x: &[f64]) -> Vec<Vec<f64>> {
        let share = |q_only: f64, p: f64| unit_position(q_only, 0.0, 1.0 - p);
        let p_from_or = clamp01(x[2] - x[1]);
        let split = (x[0] + p_from_or) / 2.0;
        vec![
            vec![x[0], share(x[1], x[0])],
            vec![x[0], share(x[2] - x[0], x[0])],
            vec![p_from_or, share(x[1], p_from_or)],
            vec![split, share(x[1], split)],
        ]
    }
}

/// `P(P and Q) = P(Q and P)`.
pub struct SymmetryAndChecker;

impl Checker for SymmetryAndChecker {
    fn name(&self) -> &'static str {
        "SymmetryAndChecker"
    }

    fn slots(&self) -> &'static [Slot] {
        const SLOTS: &[Slot] = &[Slot::binary("P_and_Q"), Slot::binary("Q_and_P")];
        SLOTS
    }

    fn seed_slots(&self) -> &'static [&'static str] {
        &["P", "Q"]
    }

    fn plan(&self) -> &'static [PlanStep] {
        const PLAN: &[PlanStep] = &[
            PlanStep::new(InstantiatorKind::And, &["P", "Q"], "P_and_Q"),
            PlanStep::new(InstantiatorKind::And, &["Q", "P"], "Q_and_P"),
        ];
        PLAN
    }

    /// Both slots are the same event.
    fn atoms(&self) -> usize {
        1
    }

    fn outcome(&self, _slot: usize, w: &[bool]) -> Option<bool> {
        Some(w[0])
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
        vec![vec![(x[0] + x[1]) / 2.0], vec![x[0]]]
    }
}

/// `P(P or Q) = P(Q or P)`.
pub struct SymmetryOrChecker;

impl Checker for SymmetryOrChecker {
    fn name(&self) -> &'static str {
        "SymmetryOrChecker"
    }

    fn slots(&self) -> &'static [Slot] {
        const SLOTS: &[Slot] = &[Slot::binary("P_or_Q"), Slot::binary("Q_or_P")];
        SLOTS
    }

    fn seed_slots(&self) -> &'static [&'static str] {
        &["P", "Q"]
    }

    fn plan(&self) -> &'static [PlanStep] {
        const PLAN: &[PlanStep] = &[
            PlanStep::new(InstantiatorKind::Or, &["P", "Q"], "P_or_Q"),
            PlanStep::new(InstantiatorKind::Or, &["Q", "P"], "Q_or_P"),
        ];
        PLAN
    }

    fn atoms(&self) -> usize {
        1
    }

    fn outcome(&self, _slot: usize, w: &[bool]) -> Option<bool> {
        Some(w[0])
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
        vec![vec![(x[0] + x[1]) / 2.0], vec![x[0]]]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkers::{probs, CheckSettings, Metric};

    fn settings() -> CheckSettings {
        CheckSettings::default()
    }

    #[test]
    fn test_and_violation() {
        let answers = probs(&[("P", 0.5), ("Q", 0.3), ("P_and_Q", 0.4)]);
        let result = AndChecker.check(&answers, Metric::Default, &settings()).unwrap();
        assert!((result.violation - 0.1).abs() < 1e-12);
        assert!(result.diagnostic.residual > 0.0);

        let inside = probs(&[("P", 0.5), ("Q", 0.3), ("P_and_Q", 0.2)]);
        assert_eq!(AndChecker.check(&inside, Metric::Default, &settings()).unwrap().violation, 0.0);

        // Below the lower Frechet bound
        let below = probs(&[("P", 0.9), ("Q", 0.8), ("P_and_Q", 0.5)]);
        let result = AndChecker.check(&below, Metric::Default, &settings()).unwrap();
        assert!((result.violation - 0.2).abs() < 1e-12);
        assert!(result.diagnostic.residual < 0.0);
    }

    #[test]
    fn test_and_arbitrage_lands_in_bounds() {
        let answers = probs(&[("P", 0.5), ("Q", 0.3), ("P_and_Q", 0.4)]);
        let arb = AndChecker.max_min_arbitrage(&answers, &probs(&[]), &settings()).unwrap();
        let (p, q, pq) = (
            arb.consistent_probs["P"],
            arb.consistent_probs["Q"],
            arb.consistent_probs["P_and_Q"],
        );
        assert!(pq >= (p + q - 1.0).max(0.0) - 1e-12);
        assert!(pq <= p.min(q) + 1e-12);
        assert!(arb.regret > 0.0);
    }

    #[test]
    fn test_or_violation() {
        let answers = probs(&[("P", 0.5), ("Q", 0.3), ("P_or_Q", 0.4)]);
        let result = OrChecker.check(&answers, Metric::Default, &settings()).unwrap();
        assert!((result.violation - 0.1).abs() < 1e-12);

        let above = probs(&[("P", 0.2), ("Q", 0.3), ("P_or_Q", 0.9)]);
        let result = OrChecker.check(&above, Metric::Default, &settings()).unwrap();
        assert!((result.violation - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_and_or_violation() {
        let answers = probs(&[("P", 0.5), ("Q", 0.3), ("P_and_Q", 0.4), ("P_or_Q", 0.3)]);
        let result = AndOrChecker.check(&answers, Metric::Default, &settings()).unwrap();
        assert!((result.violation - 0.1).abs() < 1e-12);
        assert!((result.diagnostic.residual - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_but_violation_and_arbitrage() {
        let answers = probs(&[("P", 0.4), ("Q_and_not_P", 0.3), ("P_or_Q", 0.9)]);
        let result = ButChecker.check(&answers, Metric::Default, &settings()).unwrap();
        assert!((result.violation - 0.2).abs() < 1e-12);

        let arb = ButChecker.max_min_arbitrage(&answers, &probs(&[]), &settings()).unwrap();
        let x = &arb.consistent_probs;
        assert!((x["P"] + x["Q_and_not_P"] - x["P_or_Q"]).abs() < 1e-4);
    }

    #[test]
    fn test_symmetry() {
        let answers = probs(&[("P_and_Q", 0.25), ("Q_and_P", 0.35)]);
        let result = SymmetryAndChecker.check(&answers, Metric::Default, &settings()).unwrap();
        assert!((result.violation - 0.1).abs() < 1e-12);

        let arb = SymmetryOrChecker
            .max_min_arbitrage(
                &probs(&[("P_or_Q", 0.6), ("Q_or_P", 0.8)]),
                &probs(&[]),
                &settings(),
            )
            .unwrap();
        assert!((arb.consistent_probs["P_or_Q"] - arb.consistent_probs["Q_or_P"]).abs() < 1e-12);
    }

    #[test]
    fn test_frequentist_not_above_default() {
        let answers = probs(&[("P", 0.5), ("Q", 0.3), ("P_and_Q", 0.4)]);
        let default = AndChecker.check(&answers, Metric::Default, &settings()).unwrap();
        let frequentist = AndChecker.check(&answers, Metric::Frequentist, &settings()).unwrap();
        assert!(frequentist.violation <= default.violation + 1e-9);
        assert!(frequentist.violation > 0.0);
        assert!(frequentist.diagnostic.nearest.is_some());
    }
}
