//! Log scoring rule and the worst-case regret over enumerated worlds.

/// Probabilities never reach a logarithm unclipped.
pub fn clip(p: f64, eps: f64) -> f64 {
    p.clamp(eps, 1.0 - eps)
}

/// Log score of quoting `p` when the slot resolves `outcome`.
pub fn log_score(p: f64, outcome: bool, eps: f64) -> f64 {
    let p = clip(p, eps);
    if outcome {
        p.ln()
    } else {
        (1.0 - p).ln()
    }
}

/// Product of probabilities. Falls back to a sum of logs when any factor is
/// small enough for the direct product to lose precision.
pub fn stable_product(factors: &[f64]) -> f64 {
    if factors.iter().any(|f| *f <= 0.0) {
        return 0.0;
    }
    if factors.iter().any(|f| *f < 1e-3) {
        factors.iter().map(|f| f.ln()).sum::<f64>().exp()
    } else {
        factors.iter().product()
    }
}

/// Slot outcomes per possible world. `None` marks a conditional slot whose
/// condition failed, so bets on it are refunded.
#[derive(Debug, Clone)]
pub struct WorldTable {
    rows: Vec<Vec<Option<bool>>>,
}

impl WorldTable {
    pub fn new(rows: Vec<Vec<Option<bool>>>) -> Self {
        Self { rows }
    }

    pub fn rows(&self) -> &[Vec<Option<bool>>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Regret the quote `x` suffers against the answers `a` across all slots,
/// maximised over worlds:
///
/// `max_w sum_i w_i (s(a_i, w) - s(x_i, w))`
///
/// Negative values mean `x` beats `a` in every world.
pub fn worst_case_regret(
    table: &WorldTable,
    x: &[f64],
    answers: &[f64],
    weights: &[f64],
    eps: f64,
) -> f64 {
    table
        .rows()
        .iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .filter_map(|(i, outcome)| {
                    outcome.map(|o| weights[i] * (log_score(answers[i], o, eps) - log_score(x[i], o, eps)))
                })
                .sum::<f64>()
        })
        .fold(f64::NEG_INFINITY, f64::max)
}
