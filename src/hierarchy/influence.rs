//! Random-walk centrality on a fuzzy graph.
//!
//! A walker on the fuzzy graph moves from `i` to `j` with probability
//! `w_ij / deg(i)`, and with probability `1 − damping` teleports to a
//! uniformly random point. The stationary distribution of this damped walk
//! (PageRank) concentrates on points that many strong edges lead to; those
//! are the natural representatives of their neighborhood.
//!
//! ```text
//! p' = (1 − d)/N · 1  +  d · (Pᵀ p  +  dangling(p)/N · 1)
//! ```
//!
//! The graph is symmetric, so the neighbors that feed `j` are exactly row `j`.

use crate::error::{Error, Result, Stage};
use crate::fuzzy::FuzzyGraph;
use log::trace;
use rayon::prelude::*;

/// Maximum power iterations.
pub const MAX_ITERATIONS: usize = 100;

/// L1 change at which iteration stops.
pub const TOLERANCE: f64 = 1e-10;

/// Stationary mass of each point under the damped random walk.
///
/// The result is non-negative and sums to 1.
pub fn centrality(graph: &FuzzyGraph, damping: f64) -> Result<Vec<f64>> {
    let n = graph.len();
    if n == 0 {
        return Ok(Vec::new());
    }
    let uniform = 1.0 / n as f64;
    let degrees: Vec<f64> = (0..n).map(|i| graph.degree(i) as f64).collect();
    let mut p = vec![uniform; n];

    for iteration in 0..MAX_ITERATIONS {
        let dangling: f64 = p
            .iter()
            .zip(&degrees)
            .filter(|(_, d)| **d <= 0.0)
            .map(|(m, _)| m)
            .sum();
        let base = (1.0 - damping) * uniform + damping * dangling * uniform;

        let next: Vec<f64> = (0..n)
            .into_par_iter()
            .map(|j| {
                let (cols, ws) = graph.row(j);
                let inflow: f64 = cols
                    .iter()
                    .zip(ws)
                    .map(|(&i, &w)| p[i] * w as f64 / degrees[i])
                    .sum();
                base + damping * inflow
            })
            .collect();

        let delta: f64 = next.iter().zip(&p).map(|(a, b)| (a - b).abs()).sum();
        p = next;
        if delta < TOLERANCE {
            trace!("centrality converged after {} iterations", iteration + 1);
            break;
        }
    }

    let total: f64 = p.iter().sum();
    if !(total.is_finite() && total > 0.0) {
        return Err(Error::numeric(Stage::Coarsen, "random-walk mass is not finite"));
    }
    p.iter_mut().for_each(|m| *m /= total);
    Ok(p)
}
