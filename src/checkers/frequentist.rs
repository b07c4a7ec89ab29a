//! Frequentist violation: how far the answers are, in L-infinity, from any
//! vector of slot probabilities an actual joint distribution produces.

use crate::arbitrage::solver::minimize;
use crate::arbitrage::ConsistencySet;
use crate::config::SolverConfig;

fn linf(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y).abs()).fold(0.0, f64::max)
}

/// Returns the distance and the closest realisable vector found. The
/// distance is never worse than the best seed guess.
pub fn linf_distance<S: ConsistencySet + ?Sized>(set: &S, x: &[f64], solver: &SolverConfig) -> (f64, Vec<f64>) {
    let seeds = set.seeds_for(x);
    let (mut best_distance, mut best_point) = seeds
        .iter()
        .map(|theta| {
            let point = set.embed(theta);
            (linf(x, &point), point)
        })
        .fold((f64::INFINITY, Vec::new()), |best, cand| if cand.0 < best.0 { cand } else { best });

    if best_distance == 0.0 {
        return (0.0, best_point);
    }

    // The distance landscape is flat in many directions; a short run suffices
    let config = SolverConfig {
        max_iterations: (solver.max_iterations / 4).max(50),
        ..solver.clone()
    };
    let optimum = minimize(|theta| linf(x, &set.embed(theta)), set.free_dims(), &seeds, &config);
    if optimum.value < best_distance {
        best_distance = optimum.value;
        best_point = set.embed(&optimum.x);
    }
    (best_distance, best_point)
}
